use crate::error::{EmulatorError, Result};
use std::fmt;

pub const DEFAULT_VOLTAGE: f64 = 230.0;
pub const DEFAULT_FREQUENCY: f64 = 50.0;

/// Physical quantity a slot carries; decides the canonical unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityKind {
    Power,
    Energy,
    Voltage,
    Current,
    Frequency,
}

impl fmt::Display for QuantityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuantityKind::Power => "power",
            QuantityKind::Energy => "energy",
            QuantityKind::Voltage => "voltage",
            QuantityKind::Current => "current",
            QuantityKind::Frequency => "frequency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Watt,
    Kilowatt,
    Megawatt,
    VoltAmpere,
    KiloVoltAmpere,
    WattHour,
    KilowattHour,
    MegawattHour,
    Volt,
    Ampere,
    Hertz,
}

impl Unit {
    pub fn parse(symbol: &str) -> Result<Self> {
        let unit = match symbol.trim() {
            "W" => Unit::Watt,
            "kW" => Unit::Kilowatt,
            "MW" => Unit::Megawatt,
            "VA" => Unit::VoltAmpere,
            "kVA" => Unit::KiloVoltAmpere,
            "Wh" => Unit::WattHour,
            "kWh" => Unit::KilowattHour,
            "MWh" => Unit::MegawattHour,
            "V" => Unit::Volt,
            "A" => Unit::Ampere,
            "Hz" => Unit::Hertz,
            other => {
                return Err(EmulatorError::UnsupportedUnit {
                    unit: other.to_string(),
                    kind: "any quantity".to_string(),
                })
            }
        };
        Ok(unit)
    }

    pub fn kind(self) -> QuantityKind {
        match self {
            Unit::Watt
            | Unit::Kilowatt
            | Unit::Megawatt
            | Unit::VoltAmpere
            | Unit::KiloVoltAmpere => QuantityKind::Power,
            Unit::WattHour | Unit::KilowattHour | Unit::MegawattHour => QuantityKind::Energy,
            Unit::Volt => QuantityKind::Voltage,
            Unit::Ampere => QuantityKind::Current,
            Unit::Hertz => QuantityKind::Frequency,
        }
    }

    /// Multiplier into the canonical unit (W, Wh, V, A, Hz).
    pub fn factor(self) -> f64 {
        match self {
            Unit::Kilowatt | Unit::KiloVoltAmpere | Unit::KilowattHour => 1_000.0,
            Unit::Megawatt | Unit::MegawattHour => 1_000_000.0,
            _ => 1.0,
        }
    }
}

/// Converts `value` from `unit` into the canonical unit of the same quantity.
pub fn normalize(value: f64, unit: &str) -> Result<f64> {
    Ok(value * Unit::parse(unit)?.factor())
}

/// Like [`normalize`], but also rejects units that do not measure `kind`.
/// Sources that declare no unit are assumed to already report canonical values.
pub fn normalize_as(value: f64, unit: Option<&str>, kind: QuantityKind) -> Result<f64> {
    let symbol = match unit.map(str::trim) {
        None | Some("") => return Ok(value),
        Some(symbol) => symbol,
    };
    let unit = Unit::parse(symbol).map_err(|_| unsupported(symbol, kind))?;
    if unit.kind() != kind {
        return Err(unsupported(symbol, kind));
    }
    Ok(value * unit.factor())
}

fn unsupported(symbol: &str, kind: QuantityKind) -> EmulatorError {
    EmulatorError::UnsupportedUnit {
        unit: symbol.to_string(),
        kind: kind.to_string(),
    }
}

pub fn voltage_or_default(voltage: Option<f64>) -> f64 {
    voltage.unwrap_or(DEFAULT_VOLTAGE)
}

pub fn frequency_or_default(frequency: Option<f64>) -> f64 {
    frequency.unwrap_or(DEFAULT_FREQUENCY)
}
