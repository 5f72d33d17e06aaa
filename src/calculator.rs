//! Fills in the readings the source does not report from the ones it does.

use crate::normalizer::{frequency_or_default, voltage_or_default};
use crate::snapshot::{EnergyTotals, PhaseReading};

/// Canonical values gathered for one phase in one poll cycle; `None` = absent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawPhase {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    /// Consumption, or net power when the source reports a signed value
    pub power: Option<f64>,
    /// Production reported as a separate positive value
    pub power_returned: Option<f64>,
    pub apparent_power: Option<f64>,
    pub frequency: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawTotals {
    pub consumption_total: Option<f64>,
    pub production_total: Option<f64>,
    pub consumption_tariff_1: Option<f64>,
    pub consumption_tariff_2: Option<f64>,
    pub production_tariff_1: Option<f64>,
    pub production_tariff_2: Option<f64>,
}

pub fn derive_phase(raw: &RawPhase) -> PhaseReading {
    let voltage = voltage_or_default(raw.voltage);
    let current = raw.current.unwrap_or(0.0);
    let active_power = active_power(raw.power, raw.power_returned);

    let apparent_power = match raw.apparent_power {
        Some(apparent) => apparent,
        None => (voltage * current).abs().max(active_power.abs()),
    };

    PhaseReading {
        voltage,
        current,
        active_power,
        power_factor: power_factor(active_power, apparent_power),
        apparent_power,
        frequency: frequency_or_default(raw.frequency),
    }
}

/// A negative consumption reading is already signed and wins over the
/// separate production figure.
fn active_power(power: Option<f64>, power_returned: Option<f64>) -> f64 {
    match (power, power_returned) {
        (Some(power), _) if power < 0.0 => power,
        (power, returned) => power.unwrap_or(0.0) - returned.unwrap_or(0.0),
    }
}

pub fn power_factor(active_power: f64, apparent_power: f64) -> f64 {
    if apparent_power > 0.0 {
        (active_power.abs() / apparent_power).min(1.0)
    } else {
        0.0
    }
}

/// Counters missing from this cycle keep their previous value.
pub fn derive_totals(raw: &RawTotals, previous: &EnergyTotals) -> EnergyTotals {
    let consumption_tariff_1 = raw
        .consumption_tariff_1
        .unwrap_or(previous.consumption_tariff_1);
    let consumption_tariff_2 = raw
        .consumption_tariff_2
        .unwrap_or(previous.consumption_tariff_2);
    let production_tariff_1 = raw
        .production_tariff_1
        .unwrap_or(previous.production_tariff_1);
    let production_tariff_2 = raw
        .production_tariff_2
        .unwrap_or(previous.production_tariff_2);

    let consumption_total = total(
        raw.consumption_total,
        raw.consumption_tariff_1.or(raw.consumption_tariff_2).is_some(),
        consumption_tariff_1 + consumption_tariff_2,
        previous.consumption_total,
    );
    let production_total = total(
        raw.production_total,
        raw.production_tariff_1.or(raw.production_tariff_2).is_some(),
        production_tariff_1 + production_tariff_2,
        previous.production_total,
    );

    EnergyTotals {
        consumption_tariff_1,
        consumption_tariff_2,
        production_tariff_1,
        production_tariff_2,
        consumption_total,
        production_total,
    }
}

fn total(direct: Option<f64>, tariffs_seen: bool, tariff_sum: f64, previous: f64) -> f64 {
    match direct {
        Some(total) => total,
        None if tariffs_seen => tariff_sum,
        None => previous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_with_default_voltage() {
        let reading = derive_phase(&RawPhase {
            power: Some(-1150.0),
            current: Some(5.0),
            ..Default::default()
        });
        assert_eq!(reading.active_power, -1150.0);
        assert_eq!(reading.voltage, 230.0);
        assert_eq!(reading.apparent_power, 1150.0);
        assert_eq!(reading.power_factor, 1.0);
        assert_eq!(reading.frequency, 50.0);
    }

    #[test]
    fn test_reported_apparent_power_is_kept() {
        let reading = derive_phase(&RawPhase {
            power: Some(800.0),
            apparent_power: Some(1000.0),
            current: Some(5.0),
            ..Default::default()
        });
        assert_eq!(reading.apparent_power, 1000.0);
        assert!((reading.power_factor - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_split_consumption_and_production() {
        let reading = derive_phase(&RawPhase {
            power: Some(200.0),
            power_returned: Some(700.0),
            voltage: Some(231.0),
            current: Some(2.5),
            ..Default::default()
        });
        assert_eq!(reading.active_power, -500.0);
        assert_eq!(reading.apparent_power, 577.5);
    }

    #[test]
    fn test_zero_apparent_power_gives_zero_power_factor() {
        let reading = derive_phase(&RawPhase::default());
        assert_eq!(reading.apparent_power, 0.0);
        assert_eq!(reading.power_factor, 0.0);
        assert_eq!(power_factor(100.0, 0.0), 0.0);
    }

    #[test]
    fn test_negative_current_and_voltage_pass_through() {
        let reading = derive_phase(&RawPhase {
            voltage: Some(-229.0),
            current: Some(-1.0),
            power: Some(100.0),
            ..Default::default()
        });
        assert_eq!(reading.voltage, -229.0);
        assert_eq!(reading.current, -1.0);
        assert!(reading.apparent_power >= reading.active_power.abs());
    }

    #[test]
    fn test_derived_power_factor_stays_in_unit_range() {
        for (power, current) in [(3000.0, 1.0), (-3000.0, 1.0), (10.0, 20.0), (0.0, 0.0)] {
            let reading = derive_phase(&RawPhase {
                power: Some(power),
                current: Some(current),
                ..Default::default()
            });
            assert!((0.0..=1.0).contains(&reading.power_factor));
            assert!(reading.apparent_power >= reading.active_power.abs());
        }
    }

    #[test]
    fn test_tariffs_sum_when_no_total() {
        let totals = derive_totals(
            &RawTotals {
                consumption_tariff_1: Some(100_000.0),
                consumption_tariff_2: Some(50_000.0),
                production_tariff_1: Some(20_000.0),
                ..Default::default()
            },
            &EnergyTotals::default(),
        );
        assert_eq!(totals.consumption_total, 150_000.0);
        assert_eq!(totals.production_total, 20_000.0);
        assert_eq!(totals.net_total(), 130_000.0);
    }

    #[test]
    fn test_direct_total_wins_over_tariffs() {
        let totals = derive_totals(
            &RawTotals {
                consumption_total: Some(999.0),
                consumption_tariff_1: Some(100.0),
                consumption_tariff_2: Some(50.0),
                ..Default::default()
            },
            &EnergyTotals::default(),
        );
        assert_eq!(totals.consumption_total, 999.0);
    }

    #[test]
    fn test_missing_counters_carry_forward() {
        let previous = EnergyTotals {
            consumption_tariff_1: 100.0,
            consumption_tariff_2: 50.0,
            consumption_total: 150.0,
            production_total: 30.0,
            ..Default::default()
        };
        let totals = derive_totals(
            &RawTotals {
                consumption_tariff_1: Some(110.0),
                ..Default::default()
            },
            &previous,
        );
        assert_eq!(totals.consumption_tariff_2, 50.0);
        assert_eq!(totals.consumption_total, 160.0);
        assert_eq!(totals.production_total, 30.0);
    }
}
