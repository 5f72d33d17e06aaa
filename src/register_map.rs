//! Shelly Pro 3EM Modbus register layout.
//!
//! Three blocks are readable: device info (30000-30099), EM status
//! (31000-31079) and EMData energy counters (31160-31229). A read must stay
//! inside one block. Registers the device does not define read as 0.
//! 32-bit values are sent high word first.

use crate::device::DeviceIdentity;
use crate::error::{EmulatorError, Result};
use crate::snapshot::{DeviceSnapshot, PhaseLabel, PhaseReading};

/// Largest register count a single Modbus read may ask for.
pub const MAX_READ_COUNT: u16 = 125;

pub const DEVICE_INFO_BASE: u16 = 30000;
pub const MAC_ADDRESS: u16 = 30000;
pub const MODEL: u16 = 30006;
pub const NAME: u16 = 30016;

pub const EM_BASE: u16 = 31000;
pub const EM_TIMESTAMP: u16 = 31000;
pub const NEUTRAL_CURRENT: u16 = 31007;
pub const TOTAL_CURRENT: u16 = 31011;
pub const TOTAL_ACTIVE_POWER: u16 = 31013;
pub const TOTAL_APPARENT_POWER: u16 = 31015;
pub const PHASE_BASE: [u16; 3] = [31020, 31040, 31060];

// Offsets inside a phase block
pub const PHASE_VOLTAGE: u16 = 0;
pub const PHASE_CURRENT: u16 = 2;
pub const PHASE_ACTIVE_POWER: u16 = 4;
pub const PHASE_APPARENT_POWER: u16 = 6;
pub const PHASE_POWER_FACTOR: u16 = 8;
pub const PHASE_FREQUENCY: u16 = 13;

pub const EMDATA_BASE: u16 = 31160;
pub const EMDATA_TIMESTAMP: u16 = 31160;
pub const TOTAL_ACTIVE_ENERGY: u16 = 31162;
pub const TOTAL_RETURNED_ENERGY: u16 = 31164;

const MODEL_LEN: usize = 10;
const NAME_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    DeviceInfo,
    Em,
    EmData,
}

impl Block {
    const ALL: [Block; 3] = [Block::DeviceInfo, Block::Em, Block::EmData];

    fn range(self) -> (u16, u16) {
        match self {
            Block::DeviceInfo => (DEVICE_INFO_BASE, 30099),
            Block::Em => (EM_BASE, 31079),
            Block::EmData => (EMDATA_BASE, 31229),
        }
    }

    fn containing(address: u16, count: u16) -> Option<Block> {
        let last = u32::from(address) + u32::from(count) - 1;
        Block::ALL.into_iter().find(|block| {
            let (start, end) = block.range();
            address >= start && last <= u32::from(end)
        })
    }
}

/// Encodes `count` registers starting at `address` from one snapshot.
pub fn read_registers(
    snapshot: &DeviceSnapshot,
    identity: &DeviceIdentity,
    address: u16,
    count: u16,
) -> Result<Vec<u16>> {
    if count == 0 || count > MAX_READ_COUNT {
        return Err(EmulatorError::ProtocolParse(format!(
            "register count {count} outside 1..={MAX_READ_COUNT}"
        )));
    }
    let block = Block::containing(address, count)
        .ok_or(EmulatorError::AddressOutOfRange { address, count })?;

    let (start, end) = block.range();
    let mut image = RegisterImage::new(start, end);
    match block {
        Block::DeviceInfo => image.device_info(identity),
        Block::Em => image.em(snapshot),
        Block::EmData => image.emdata(snapshot),
    }

    let offset = usize::from(address - start);
    Ok(image.registers[offset..offset + usize::from(count)].to_vec())
}

struct RegisterImage {
    base: u16,
    registers: Vec<u16>,
}

impl RegisterImage {
    fn new(start: u16, end: u16) -> Self {
        Self {
            base: start,
            registers: vec![0; usize::from(end - start) + 1],
        }
    }

    fn set(&mut self, address: u16, values: &[u16]) {
        let offset = usize::from(address - self.base);
        self.registers[offset..offset + values.len()].copy_from_slice(values);
    }

    fn set_f32(&mut self, address: u16, value: f64) {
        self.set(address, &f32_to_registers(value as f32));
    }

    fn set_u32(&mut self, address: u16, value: u32) {
        self.set(address, &u32_to_registers(value));
    }

    fn device_info(&mut self, identity: &DeviceIdentity) {
        let mac = identity.mac_bytes();
        let mac_registers: Vec<u16> = mac
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.set(MAC_ADDRESS, &mac_registers);
        self.set(MODEL, &string_to_registers(identity.model(), MODEL_LEN));
        self.set(NAME, &string_to_registers(identity.name(), NAME_LEN));
    }

    fn em(&mut self, snapshot: &DeviceSnapshot) {
        self.set_u32(EM_TIMESTAMP, timestamp(snapshot));
        self.set_f32(NEUTRAL_CURRENT, 0.0);
        self.set_f32(TOTAL_CURRENT, snapshot.total_current());
        self.set_f32(TOTAL_ACTIVE_POWER, snapshot.total_active_power());
        self.set_f32(TOTAL_APPARENT_POWER, snapshot.total_apparent_power());

        for label in PhaseLabel::ALL {
            self.phase(PHASE_BASE[label.index()], &snapshot.phase_or_idle(label));
        }
    }

    fn phase(&mut self, base: u16, reading: &PhaseReading) {
        self.set_f32(base + PHASE_VOLTAGE, reading.voltage);
        self.set_f32(base + PHASE_CURRENT, reading.current);
        self.set_f32(base + PHASE_ACTIVE_POWER, reading.active_power);
        self.set_f32(base + PHASE_APPARENT_POWER, reading.apparent_power);
        self.set_f32(base + PHASE_POWER_FACTOR, reading.power_factor);
        self.set_f32(base + PHASE_FREQUENCY, reading.frequency);
    }

    fn emdata(&mut self, snapshot: &DeviceSnapshot) {
        let energy = snapshot.energy();
        self.set_u32(EMDATA_TIMESTAMP, timestamp(snapshot));
        self.set_f32(TOTAL_ACTIVE_ENERGY, energy.consumption_total);
        self.set_f32(TOTAL_RETURNED_ENERGY, energy.production_total);
    }
}

fn timestamp(snapshot: &DeviceSnapshot) -> u32 {
    u32::try_from(snapshot.captured_at().timestamp()).unwrap_or(0)
}

pub fn f32_to_registers(value: f32) -> [u16; 2] {
    u32_to_registers(value.to_bits())
}

pub fn u32_to_registers(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

pub fn registers_to_f32(registers: [u16; 2]) -> f32 {
    f32::from_bits((u32::from(registers[0]) << 16) | u32::from(registers[1]))
}

/// UTF-8 bytes, truncated or null padded to `len` registers, two bytes each.
fn string_to_registers(value: &str, len: usize) -> Vec<u16> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(len * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EnergyTotals;
    use chrono::{TimeZone, Utc};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("", "Shelly Pro 3EM", "AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn three_phase() -> DeviceSnapshot {
        let phase = |voltage: f64, current: f64, active_power: f64| PhaseReading {
            voltage,
            current,
            active_power,
            power_factor: 0.95,
            apparent_power: voltage * current,
            frequency: 50.1,
        };
        DeviceSnapshot::three_phase(
            [
                phase(230.5, 2.0, 437.0),
                phase(229.0, 1.0, -200.0),
                phase(231.0, 0.5, 100.0),
            ],
            EnergyTotals {
                consumption_total: 150_000.0,
                production_total: 20_000.0,
                ..Default::default()
            },
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    fn read_f32(snapshot: &DeviceSnapshot, address: u16) -> f32 {
        let regs = read_registers(snapshot, &identity(), address, 2).unwrap();
        registers_to_f32([regs[0], regs[1]])
    }

    #[test]
    fn test_phase_blocks_decode_to_snapshot() {
        let snapshot = three_phase();
        for label in PhaseLabel::ALL {
            let base = PHASE_BASE[label.index()];
            let expected = snapshot.phase(label).unwrap();
            assert_eq!(read_f32(&snapshot, base + PHASE_VOLTAGE), expected.voltage as f32);
            assert_eq!(read_f32(&snapshot, base + PHASE_CURRENT), expected.current as f32);
            assert_eq!(
                read_f32(&snapshot, base + PHASE_ACTIVE_POWER),
                expected.active_power as f32
            );
            assert_eq!(
                read_f32(&snapshot, base + PHASE_APPARENT_POWER),
                expected.apparent_power as f32
            );
            assert_eq!(
                read_f32(&snapshot, base + PHASE_POWER_FACTOR),
                expected.power_factor as f32
            );
            assert_eq!(read_f32(&snapshot, base + PHASE_FREQUENCY), expected.frequency as f32);
        }
    }

    #[test]
    fn test_totals_and_energy() {
        let snapshot = three_phase();
        assert_eq!(read_f32(&snapshot, TOTAL_ACTIVE_POWER), 337.0);
        assert_eq!(read_f32(&snapshot, TOTAL_CURRENT), 3.5);
        assert_eq!(read_f32(&snapshot, TOTAL_ACTIVE_ENERGY), 150_000.0);
        assert_eq!(read_f32(&snapshot, TOTAL_RETURNED_ENERGY), 20_000.0);
        assert_eq!(read_f32(&snapshot, NEUTRAL_CURRENT), 0.0);
    }

    #[test]
    fn test_high_word_first() {
        assert_eq!(f32_to_registers(1.0), [0x3F80, 0x0000]);
        assert_eq!(u32_to_registers(1_700_000_000), [0x6553, 0xF100]);

        let regs = read_registers(&three_phase(), &identity(), EM_TIMESTAMP, 2).unwrap();
        assert_eq!(regs, vec![0x6553, 0xF100]);
    }

    #[test]
    fn test_large_read_spans_whole_em_block() {
        let snapshot = three_phase();
        let regs = read_registers(&snapshot, &identity(), EM_BASE, 80).unwrap();
        assert_eq!(regs.len(), 80);
        let offset = usize::from(PHASE_BASE[1] + PHASE_ACTIVE_POWER - EM_BASE);
        assert_eq!(registers_to_f32([regs[offset], regs[offset + 1]]), -200.0);
        // Error flags
        assert_eq!(&regs[2..7], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_device_info_block() {
        let regs = read_registers(&three_phase(), &identity(), DEVICE_INFO_BASE, 32).unwrap();
        assert_eq!(&regs[0..3], &[0xAABB, 0xCCDD, 0xEEFF]);
        // "SP" "EM"
        assert_eq!(regs[6], u16::from_be_bytes(*b"SP"));
        assert_eq!(regs[7], u16::from_be_bytes(*b"EM"));
        assert_eq!(regs[15], 0);
        assert_eq!(regs[16], u16::from_be_bytes(*b"Sh"));
    }

    #[test]
    fn test_unpopulated_phases_read_idle() {
        let snapshot = DeviceSnapshot::single_phase(
            PhaseReading {
                active_power: 500.0,
                apparent_power: 500.0,
                power_factor: 1.0,
                ..PhaseReading::idle()
            },
            EnergyTotals::default(),
            Utc::now(),
        );
        assert_eq!(read_f32(&snapshot, PHASE_BASE[0] + PHASE_ACTIVE_POWER), 500.0);
        assert_eq!(read_f32(&snapshot, PHASE_BASE[2] + PHASE_VOLTAGE), 230.0);
        assert_eq!(read_f32(&snapshot, PHASE_BASE[2] + PHASE_ACTIVE_POWER), 0.0);
        assert_eq!(read_f32(&snapshot, PHASE_BASE[2] + PHASE_FREQUENCY), 50.0);
    }

    #[test]
    fn test_out_of_range_reads() {
        let snapshot = three_phase();
        for (address, count) in [(0, 2), (40000, 2), (31079, 2), (31100, 1), (30099, 2)] {
            let err = read_registers(&snapshot, &identity(), address, count).unwrap_err();
            assert!(matches!(err, EmulatorError::AddressOutOfRange { .. }));
        }
        assert!(read_registers(&snapshot, &identity(), 31000, 0).is_err());
        assert!(read_registers(&snapshot, &identity(), 31000, 126).is_err());
        assert!(read_registers(&snapshot, &identity(), u16::MAX, 2).is_err());
    }
}
