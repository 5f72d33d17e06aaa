//! Maps Home Assistant sensor ids onto the quantities the meter reports.

use crate::error::{EmulatorError, Result};
use crate::normalizer::QuantityKind;
use crate::snapshot::PhaseLabel;
use regex::{Regex, RegexBuilder};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn, Level};

/// Canonical electrical quantity the emulated meter needs a value for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    PowerConsumption,
    PowerProduction,
    PhasePowerConsumption(PhaseLabel),
    PhasePowerProduction(PhaseLabel),
    Voltage(PhaseLabel),
    Current(PhaseLabel),
    ApparentPower(PhaseLabel),
    Frequency,
    EnergyConsumptionTotal,
    EnergyProductionTotal,
    EnergyConsumptionTariff1,
    EnergyConsumptionTariff2,
    EnergyProductionTariff1,
    EnergyProductionTariff2,
}

impl Slot {
    pub fn all() -> Vec<Slot> {
        let mut slots = vec![Slot::PowerConsumption, Slot::PowerProduction];
        for build in [
            Slot::PhasePowerConsumption as fn(PhaseLabel) -> Slot,
            Slot::PhasePowerProduction,
            Slot::Voltage,
            Slot::Current,
            Slot::ApparentPower,
        ] {
            slots.extend(PhaseLabel::ALL.into_iter().map(build));
        }
        slots.extend([
            Slot::Frequency,
            Slot::EnergyConsumptionTotal,
            Slot::EnergyProductionTotal,
            Slot::EnergyConsumptionTariff1,
            Slot::EnergyConsumptionTariff2,
            Slot::EnergyProductionTariff1,
            Slot::EnergyProductionTariff2,
        ]);
        slots
    }

    pub fn kind(self) -> QuantityKind {
        match self {
            Slot::PowerConsumption
            | Slot::PowerProduction
            | Slot::PhasePowerConsumption(_)
            | Slot::PhasePowerProduction(_)
            | Slot::ApparentPower(_) => QuantityKind::Power,
            Slot::Voltage(_) => QuantityKind::Voltage,
            Slot::Current(_) => QuantityKind::Current,
            Slot::Frequency => QuantityKind::Frequency,
            Slot::EnergyConsumptionTotal
            | Slot::EnergyProductionTotal
            | Slot::EnergyConsumptionTariff1
            | Slot::EnergyConsumptionTariff2
            | Slot::EnergyProductionTariff1
            | Slot::EnergyProductionTariff2 => QuantityKind::Energy,
        }
    }

    fn is_phase_power(self) -> bool {
        matches!(
            self,
            Slot::PhasePowerConsumption(_) | Slot::PhasePowerProduction(_)
        )
    }

    fn is_power(self) -> bool {
        self.is_phase_power() || matches!(self, Slot::PowerConsumption | Slot::PowerProduction)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::PowerConsumption => f.write_str("power_consumption"),
            Slot::PowerProduction => f.write_str("power_production"),
            Slot::PhasePowerConsumption(p) => write!(f, "power_consumption_{}", p.line()),
            Slot::PhasePowerProduction(p) => write!(f, "power_production_{}", p.line()),
            Slot::Voltage(p) => write!(f, "voltage_{}", p.line()),
            Slot::Current(p) => write!(f, "current_{}", p.line()),
            Slot::ApparentPower(p) => write!(f, "apparent_power_{}", p.line()),
            Slot::Frequency => f.write_str("frequency"),
            Slot::EnergyConsumptionTotal => f.write_str("energy_consumption_total"),
            Slot::EnergyProductionTotal => f.write_str("energy_production_total"),
            Slot::EnergyConsumptionTariff1 => f.write_str("energy_consumption_tariff_1"),
            Slot::EnergyConsumptionTariff2 => f.write_str("energy_consumption_tariff_2"),
            Slot::EnergyProductionTariff1 => f.write_str("energy_production_tariff_1"),
            Slot::EnergyProductionTariff2 => f.write_str("energy_production_tariff_2"),
        }
    }
}

impl FromStr for Slot {
    type Err = EmulatorError;

    fn from_str(key: &str) -> Result<Self> {
        let key = key.trim().to_ascii_lowercase();
        Slot::all()
            .into_iter()
            .find(|slot| slot.to_string() == key)
            .ok_or_else(|| EmulatorError::Config(format!("unknown slot '{key}'")))
    }
}

/// Sensor as listed by the source during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub entity_id: String,
    pub unit: Option<String>,
}

impl EntityDescriptor {
    pub fn new(entity_id: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            entity_id: entity_id.into(),
            unit: unit.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingSource {
    Override,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedEntity {
    pub entity_id: String,
    pub unit: Option<String>,
    pub source: MappingSource,
}

/// Slot → sensor assignment. Slots that are not present are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityMapping {
    slots: BTreeMap<Slot, MappedEntity>,
}

impl EntityMapping {
    pub fn get(&self, slot: Slot) -> Option<&MappedEntity> {
        self.slots.get(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &MappedEntity)> {
        self.slots.iter().map(|(slot, entity)| (*slot, entity))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Distinct sensor ids to fetch each cycle.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .values()
            .map(|entity| entity.entity_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_three_phase(&self) -> bool {
        self.slots.keys().any(|slot| slot.is_phase_power())
    }

    pub fn has_power_data(&self) -> bool {
        self.slots.keys().any(|slot| slot.is_power())
    }
}

struct PatternRule {
    slot: Slot,
    regex: Regex,
    /// Position within the slot's pattern list; lower wins.
    priority: usize,
    specificity: usize,
}

/// Builds [`EntityMapping`]s from a fixed rule table and manual overrides.
pub struct EntityResolver {
    rules: Vec<PatternRule>,
    overrides: BTreeMap<Slot, String>,
    discovery_enabled: bool,
}

impl EntityResolver {
    pub fn new(overrides: BTreeMap<Slot, String>, discovery_enabled: bool) -> Result<Self> {
        let mut rules = Vec::new();
        for slot in Slot::all() {
            for (priority, pattern) in dsmr_patterns(slot).into_iter().enumerate() {
                let regex = RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| EmulatorError::Config(format!("pattern {pattern}: {e}")))?;
                rules.push(PatternRule {
                    slot,
                    regex,
                    priority,
                    specificity: literal_len(&pattern),
                });
            }
        }
        Ok(Self {
            rules,
            overrides,
            discovery_enabled,
        })
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery_enabled
    }

    /// Assigns at most one sensor to every slot.
    ///
    /// Among the sensors matching a slot, the one hit by the pattern with the
    /// most literal characters wins, then the earlier pattern, then the
    /// lexically smallest id. Overrides always win.
    pub fn resolve(&self, entities: &[EntityDescriptor]) -> EntityMapping {
        let unit_of = |entity_id: &str| {
            entities
                .iter()
                .find(|e| e.entity_id == entity_id)
                .and_then(|e| e.unit.clone())
        };

        let mut slots = BTreeMap::new();

        if self.discovery_enabled {
            let mut best: BTreeMap<Slot, (Reverse<usize>, usize, &str)> = BTreeMap::new();
            for rule in &self.rules {
                for entity in entities {
                    if !rule.regex.is_match(&entity.entity_id) {
                        continue;
                    }
                    let candidate = (
                        Reverse(rule.specificity),
                        rule.priority,
                        entity.entity_id.as_str(),
                    );
                    best.entry(rule.slot)
                        .and_modify(|current| {
                            if candidate < *current {
                                *current = candidate;
                            }
                        })
                        .or_insert(candidate);
                }
            }
            for (slot, (_, _, entity_id)) in best {
                slots.insert(
                    slot,
                    MappedEntity {
                        entity_id: entity_id.to_string(),
                        unit: unit_of(entity_id),
                        source: MappingSource::Pattern,
                    },
                );
            }
        }

        for (slot, entity_id) in &self.overrides {
            slots.insert(
                *slot,
                MappedEntity {
                    entity_id: entity_id.clone(),
                    unit: unit_of(entity_id),
                    source: MappingSource::Override,
                },
            );
        }

        let mapping = EntityMapping { slots };
        log_resolution(&mapping, entities);
        mapping
    }
}

fn log_resolution(mapping: &EntityMapping, entities: &[EntityDescriptor]) {
    for slot in Slot::all() {
        match mapping.get(slot) {
            Some(entity) => debug!(%slot, entity_id = %entity.entity_id, source = ?entity.source, "Slot mapped"),
            None => {
                let error = EmulatorError::DiscoveryMiss(slot.to_string());
                if miss_level(slot) == Level::WARN {
                    warn!(error = %error, "Slot absent");
                } else {
                    debug!(error = %error, "Slot absent");
                }
            }
        }
    }

    if mapping.has_power_data() {
        info!(
            count = mapping.len(),
            is_three_phase = mapping.is_three_phase(),
            "Entities resolved"
        );
        return;
    }

    warn!(
        sensors = entities.len(),
        "No power entities resolved, check the DSMR integration or configure overrides"
    );
    for entity in entities {
        debug!(entity_id = %entity.entity_id, "Unmatched sensor");
    }
}

/// Aggregate power and energy totals are expected on every meter. Per-phase,
/// tariff and auxiliary slots are routinely absent.
fn miss_level(slot: Slot) -> Level {
    match slot {
        Slot::PowerConsumption
        | Slot::PowerProduction
        | Slot::EnergyConsumptionTotal
        | Slot::EnergyProductionTotal => Level::WARN,
        _ => Level::DEBUG,
    }
}

/// Number of characters a pattern requires literally.
fn literal_len(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if chars.next().is_some() {
                    count += 1;
                }
            }
            '.' | '*' | '+' | '?' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' => {}
            _ => count += 1,
        }
    }
    count
}

/// DSMR / P1 naming conventions, including the Home Assistant integration,
/// DSMR Reader, and Dutch, Belgian and Luxembourg localisations.
fn dsmr_patterns(slot: Slot) -> Vec<String> {
    let owned = |patterns: &[&str]| patterns.iter().map(|p| p.to_string()).collect();
    match slot {
        Slot::PowerConsumption => owned(&[
            r"^sensor\..*power_consumption$",
            r"^sensor\..*electricity.*power_consumption$",
            r"^sensor\..*current_electricity_usage$",
            r"^sensor\..*power_delivered$",
            r"^sensor\.dsmr.*power$",
            r"^sensor\..*elektriciteit.*vermogen$",
            r"^sensor\..*fluvius.*consumption$",
            r"^sensor\..*electricite.*puissance$",
        ]),
        Slot::PowerProduction => owned(&[
            r"^sensor\..*power_production$",
            r"^sensor\..*electricity.*power_production$",
            r"^sensor\..*current_electricity_delivery$",
            r"^sensor\..*power_returned$",
            r"^sensor\..*teruglevering$",
            r"^sensor\..*fluvius.*production$",
            r"^sensor\..*electricite.*injection$",
        ]),
        Slot::PhasePowerConsumption(phase) => {
            let l = phase.line();
            vec![
                format!(r"^sensor\..*power.*{l}_positive$"),
                format!(r"^sensor\..*instantaneous_active_power_{l}_positive$"),
                format!(r"^sensor\..*power_delivered_{l}$"),
                format!(r"^sensor\..*power_consumption.*{l}$"),
                format!(r"^sensor\..*power_consumption.*phase.*{l}$"),
                format!(r"^sensor\..*active_power_{l}$"),
                format!(r"^sensor\..*vermogen.*{l}$"),
            ]
        }
        Slot::PhasePowerProduction(phase) => {
            let l = phase.line();
            vec![
                format!(r"^sensor\..*power.*{l}_negative$"),
                format!(r"^sensor\..*instantaneous_active_power_{l}_negative$"),
                format!(r"^sensor\..*power_returned_{l}$"),
                format!(r"^sensor\..*power_production.*{l}$"),
                format!(r"^sensor\..*power_returned.*{l}$"),
                format!(r"^sensor\..*teruglevering.*{l}$"),
            ]
        }
        Slot::Voltage(phase) => {
            let l = phase.line();
            vec![
                format!(r"^sensor\..*voltage.*{l}$"),
                format!(r"^sensor\..*instantaneous_voltage_{l}$"),
                format!(r"^sensor\..*voltage.*phase.*{l}$"),
                format!(r"^sensor\..*voltage_phase_{l}$"),
                format!(r"^sensor\..*spanning.*{l}$"),
            ]
        }
        Slot::Current(phase) => {
            let l = phase.line();
            vec![
                format!(r"^sensor\..*current.*{l}$"),
                format!(r"^sensor\..*instantaneous_current_{l}$"),
                format!(r"^sensor\..*current.*phase.*{l}$"),
                format!(r"^sensor\..*current_phase_{l}$"),
                format!(r"^sensor\..*stroom.*{l}$"),
                format!(r"^sensor\..*courant.*{l}$"),
            ]
        }
        Slot::ApparentPower(phase) => {
            let l = phase.line();
            vec![
                format!(r"^sensor\..*apparent_power.*{l}$"),
                format!(r"^sensor\..*power_apparent.*{l}$"),
            ]
        }
        Slot::Frequency => owned(&[
            r"^sensor\..*grid_frequency$",
            r"^sensor\..*frequency$",
            r"^sensor\..*frequentie$",
        ]),
        Slot::EnergyConsumptionTotal => owned(&[
            r"^sensor\..*energy_consumption.*total$",
            r"^sensor\..*total.*energy.*consumption$",
            r"^sensor\..*total_energy_import$",
            r"^sensor\..*energie.*verbruik.*totaal$",
        ]),
        Slot::EnergyProductionTotal => owned(&[
            r"^sensor\..*energy_production.*total$",
            r"^sensor\..*energy_returned.*total$",
            r"^sensor\..*total.*energy.*returned$",
            r"^sensor\..*total_energy_export$",
            r"^sensor\..*energie.*teruglevering.*totaal$",
        ]),
        Slot::EnergyConsumptionTariff1 => owned(&[
            r"^sensor\..*energy_consumption.*tarif.*1$",
            r"^sensor\..*electricity_used_tariff_1$",
            r"^sensor\..*electricity.*tariff_1$",
            r"^sensor\..*energy_delivered.*tarif.*1$",
            r"^sensor\..*energie.*dal$",
            r"^sensor\..*energie.*tarief.*1$",
        ]),
        Slot::EnergyConsumptionTariff2 => owned(&[
            r"^sensor\..*energy_consumption.*tarif.*2$",
            r"^sensor\..*electricity_used_tariff_2$",
            r"^sensor\..*electricity.*tariff_2$",
            r"^sensor\..*energy_delivered.*tarif.*2$",
            r"^sensor\..*energie.*piek$",
            r"^sensor\..*energie.*tarief.*2$",
        ]),
        Slot::EnergyProductionTariff1 => owned(&[
            r"^sensor\..*energy_production.*tarif.*1$",
            r"^sensor\..*electricity_delivered_tariff_1$",
            r"^sensor\..*energy_returned.*tarif.*1$",
            r"^sensor\..*teruglevering.*dal$",
            r"^sensor\..*teruglevering.*tarief.*1$",
        ]),
        Slot::EnergyProductionTariff2 => owned(&[
            r"^sensor\..*energy_production.*tarif.*2$",
            r"^sensor\..*electricity_delivered_tariff_2$",
            r"^sensor\..*energy_returned.*tarif.*2$",
            r"^sensor\..*teruglevering.*piek$",
            r"^sensor\..*teruglevering.*tarief.*2$",
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensors(ids: &[(&str, &str)]) -> Vec<EntityDescriptor> {
        ids.iter()
            .map(|(id, unit)| EntityDescriptor::new(*id, Some(unit)))
            .collect()
    }

    fn resolver() -> EntityResolver {
        EntityResolver::new(BTreeMap::new(), true).unwrap()
    }

    #[test]
    fn test_home_assistant_dsmr_names() {
        let entities = sensors(&[
            ("sensor.electricity_meter_power_consumption", "kW"),
            ("sensor.electricity_meter_power_production", "kW"),
            ("sensor.electricity_meter_power_consumption_phase_l1", "kW"),
            ("sensor.electricity_meter_power_production_phase_l1", "kW"),
            ("sensor.electricity_meter_voltage_phase_l1", "V"),
            ("sensor.electricity_meter_current_phase_l1", "A"),
            ("sensor.electricity_meter_energy_consumption_tarif_1", "kWh"),
            ("sensor.electricity_meter_energy_consumption_tarif_2", "kWh"),
            ("sensor.electricity_meter_energy_production_tarif_1", "kWh"),
            ("sensor.living_room_temperature", "°C"),
        ]);
        let mapping = resolver().resolve(&entities);

        let id = |slot| mapping.get(slot).map(|e| e.entity_id.as_str());
        assert_eq!(
            id(Slot::PowerConsumption),
            Some("sensor.electricity_meter_power_consumption")
        );
        assert_eq!(
            id(Slot::PhasePowerProduction(PhaseLabel::A)),
            Some("sensor.electricity_meter_power_production_phase_l1")
        );
        assert_eq!(
            id(Slot::Voltage(PhaseLabel::A)),
            Some("sensor.electricity_meter_voltage_phase_l1")
        );
        assert_eq!(
            id(Slot::Current(PhaseLabel::A)),
            Some("sensor.electricity_meter_current_phase_l1")
        );
        assert_eq!(
            id(Slot::EnergyConsumptionTariff2),
            Some("sensor.electricity_meter_energy_consumption_tarif_2")
        );
        assert_eq!(id(Slot::Voltage(PhaseLabel::B)), None);
        assert_eq!(id(Slot::EnergyProductionTariff2), None);
        assert_eq!(
            mapping.get(Slot::PowerConsumption).unwrap().unit.as_deref(),
            Some("kW")
        );
        assert!(mapping.is_three_phase());
        assert!(mapping.has_power_data());
    }

    #[test]
    fn test_more_specific_pattern_wins() {
        let entities = sensors(&[
            ("sensor.dsmr_power", "W"),
            ("sensor.meter_power_delivered", "W"),
        ]);
        let mapping = resolver().resolve(&entities);
        assert_eq!(
            mapping.get(Slot::PowerConsumption).unwrap().entity_id,
            "sensor.meter_power_delivered"
        );
    }

    #[test]
    fn test_earlier_rule_wins_at_equal_specificity() {
        // Both rules require 26 literal characters
        let entities = sensors(&[
            ("sensor.aaa_total_energy_export", "kWh"),
            ("sensor.total_energy_returned", "kWh"),
        ]);
        let mapping = resolver().resolve(&entities);
        assert_eq!(
            mapping.get(Slot::EnergyProductionTotal).unwrap().entity_id,
            "sensor.total_energy_returned"
        );

        let entities = sensors(&[
            ("sensor.a_power_apparent_l2", "VA"),
            ("sensor.meter_apparent_power_l2", "VA"),
        ]);
        let mapping = resolver().resolve(&entities);
        assert_eq!(
            mapping.get(Slot::ApparentPower(PhaseLabel::B)).unwrap().entity_id,
            "sensor.meter_apparent_power_l2"
        );
    }

    #[test]
    fn test_lexical_tie_break() {
        let entities = sensors(&[
            ("sensor.b_power_consumption", "W"),
            ("sensor.a_power_consumption", "W"),
        ]);
        for _ in 0..3 {
            let mapping = resolver().resolve(&entities);
            assert_eq!(
                mapping.get(Slot::PowerConsumption).unwrap().entity_id,
                "sensor.a_power_consumption"
            );
        }
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let entities = sensors(&[("sensor.DSMR_Power_Consumption", "W")]);
        let mapping = resolver().resolve(&entities);
        assert!(mapping.get(Slot::PowerConsumption).is_some());
        assert!(!mapping.is_three_phase());
    }

    #[test]
    fn test_override_wins_over_pattern() {
        let mut overrides = BTreeMap::new();
        overrides.insert(Slot::PowerConsumption, "sensor.grid_net".to_string());
        let resolver = EntityResolver::new(overrides, true).unwrap();

        let entities = sensors(&[
            ("sensor.meter_power_consumption", "W"),
            ("sensor.grid_net", "kW"),
        ]);
        let mapping = resolver.resolve(&entities);
        let entity = mapping.get(Slot::PowerConsumption).unwrap();
        assert_eq!(entity.entity_id, "sensor.grid_net");
        assert_eq!(entity.unit.as_deref(), Some("kW"));
        assert_eq!(entity.source, MappingSource::Override);
    }

    #[test]
    fn test_discovery_disabled_uses_overrides_only() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            Slot::PhasePowerConsumption(PhaseLabel::B),
            "sensor.custom_l2".to_string(),
        );
        let resolver = EntityResolver::new(overrides, false).unwrap();
        let mapping = resolver.resolve(&sensors(&[("sensor.meter_power_consumption", "W")]));
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.identifiers(), vec!["sensor.custom_l2".to_string()]);
        assert!(mapping.is_three_phase());
    }

    #[test]
    fn test_no_match_is_absence() {
        let mapping = resolver().resolve(&sensors(&[("sensor.outdoor_humidity", "%")]));
        assert!(mapping.is_empty());
        assert!(!mapping.has_power_data());
    }

    #[test]
    fn test_slot_keys_round_trip() {
        for slot in Slot::all() {
            assert_eq!(slot.to_string().parse::<Slot>().unwrap(), slot);
        }
        assert!("power_l4".parse::<Slot>().is_err());
    }

    #[test]
    fn test_headline_slot_misses_warn() {
        assert_eq!(miss_level(Slot::PowerConsumption), Level::WARN);
        assert_eq!(miss_level(Slot::EnergyProductionTotal), Level::WARN);
        assert_eq!(miss_level(Slot::Voltage(PhaseLabel::C)), Level::DEBUG);
        assert_eq!(miss_level(Slot::EnergyConsumptionTariff2), Level::DEBUG);
        assert_eq!(miss_level(Slot::Frequency), Level::DEBUG);
    }

    #[test]
    fn test_literal_len() {
        assert_eq!(literal_len(r"^sensor\..*power_consumption$"), 24);
        assert_eq!(literal_len(r"^sensor\.dsmr.*power$"), 16);
    }
}
