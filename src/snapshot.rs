//! Reading set published by the poll loop and served by every protocol.

use crate::normalizer::{DEFAULT_FREQUENCY, DEFAULT_VOLTAGE};
use chrono::{DateTime, Utc};
use std::fmt;

/// Electrical phase of a three-phase installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseLabel {
    A,
    B,
    C,
}

impl PhaseLabel {
    pub const ALL: [PhaseLabel; 3] = [PhaseLabel::A, PhaseLabel::B, PhaseLabel::C];

    pub fn index(self) -> usize {
        match self {
            PhaseLabel::A => 0,
            PhaseLabel::B => 1,
            PhaseLabel::C => 2,
        }
    }

    /// Lower-case prefix used by the JSON field names (`a_voltage`, ...).
    pub fn prefix(self) -> &'static str {
        match self {
            PhaseLabel::A => "a",
            PhaseLabel::B => "b",
            PhaseLabel::C => "c",
        }
    }

    /// DSMR line name (`l1`, `l2`, `l3`).
    pub fn line(self) -> &'static str {
        match self {
            PhaseLabel::A => "l1",
            PhaseLabel::B => "l2",
            PhaseLabel::C => "l3",
        }
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix().to_ascii_uppercase())
    }
}

/// One phase worth of canonical readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseReading {
    /// V
    pub voltage: f64,
    /// A
    pub current: f64,
    /// W, positive = consumption, negative = return to grid
    pub active_power: f64,
    pub power_factor: f64,
    /// VA
    pub apparent_power: f64,
    /// Hz
    pub frequency: f64,
}

impl PhaseReading {
    /// A phase with nothing connected, as reported for unpopulated phases.
    pub fn idle() -> Self {
        Self {
            voltage: DEFAULT_VOLTAGE,
            current: 0.0,
            active_power: 0.0,
            power_factor: 0.0,
            apparent_power: 0.0,
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

impl Default for PhaseReading {
    fn default() -> Self {
        Self::idle()
    }
}

/// Cumulative energy counters in Wh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyTotals {
    pub consumption_tariff_1: f64,
    pub consumption_tariff_2: f64,
    pub production_tariff_1: f64,
    pub production_tariff_2: f64,
    /// Either reported directly by the source or the sum of both tariffs.
    pub consumption_total: f64,
    pub production_total: f64,
}

impl EnergyTotals {
    pub fn net_total(&self) -> f64 {
        self.consumption_total - self.production_total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseLayout {
    SinglePhase,
    ThreePhase,
}

/// One complete, internally consistent reading set.
///
/// Phases are either exactly one (single-phase installation) or exactly three
/// in A/B/C order, and the aggregate power is always the sum of the phases.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    sequence: u64,
    captured_at: DateTime<Utc>,
    phases: Vec<PhaseReading>,
    energy: EnergyTotals,
    total_active_power: f64,
}

impl DeviceSnapshot {
    pub fn single_phase(
        phase: PhaseReading,
        energy: EnergyTotals,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self::from_phases(vec![phase], energy, captured_at)
    }

    pub fn three_phase(
        phases: [PhaseReading; 3],
        energy: EnergyTotals,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self::from_phases(phases.to_vec(), energy, captured_at)
    }

    /// Placeholder visible before the first successful poll.
    pub fn empty() -> Self {
        Self::single_phase(PhaseReading::idle(), EnergyTotals::default(), Utc::now())
    }

    fn from_phases(
        phases: Vec<PhaseReading>,
        energy: EnergyTotals,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let total_active_power = phases.iter().map(|p| p.active_power).sum();
        Self {
            sequence: 0,
            captured_at,
            phases,
            energy,
            total_active_power,
        }
    }

    /// Stamped by the cache at publish time.
    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn energy(&self) -> &EnergyTotals {
        &self.energy
    }

    pub fn phases(&self) -> &[PhaseReading] {
        &self.phases
    }

    pub fn layout(&self) -> PhaseLayout {
        if self.phases.len() == 3 {
            PhaseLayout::ThreePhase
        } else {
            PhaseLayout::SinglePhase
        }
    }

    pub fn phase(&self, label: PhaseLabel) -> Option<&PhaseReading> {
        self.phases.get(label.index())
    }

    /// Protocols always expose three phases; unpopulated ones read as idle.
    pub fn phase_or_idle(&self, label: PhaseLabel) -> PhaseReading {
        self.phase(label).copied().unwrap_or_else(PhaseReading::idle)
    }

    pub fn total_active_power(&self) -> f64 {
        self.total_active_power
    }

    pub fn total_current(&self) -> f64 {
        self.phases.iter().map(|p| p.current).sum()
    }

    pub fn total_apparent_power(&self) -> f64 {
        self.phases.iter().map(|p| p.apparent_power).sum()
    }
}
