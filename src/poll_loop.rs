use crate::calculator::{derive_phase, derive_totals, RawPhase, RawTotals};
use crate::entity_resolver::{EntityMapping, EntityResolver, Slot};
use crate::error::{EmulatorError, Result};
use crate::normalizer::normalize_as;
use crate::sensor_source::{EntityState, SensorSource};
use crate::snapshot::{DeviceSnapshot, PhaseLabel};
use crate::snapshot_cache::SnapshotPublisher;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Fetching,
    Normalizing,
    Publishing,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Must stay below `interval` so cycles never overlap.
    pub fetch_timeout: Duration,
    pub discovery_retry: Duration,
}

/// The only writer of the snapshot cache.
pub struct PollLoop {
    source: Arc<dyn SensorSource>,
    resolver: EntityResolver,
    mapping: EntityMapping,
    publisher: SnapshotPublisher,
    settings: PollSettings,
    last_discovery: Option<Instant>,
    /// Set once a listing has been resolved; overrides alone do not count.
    discovered: bool,
    state: PollState,
}

impl PollLoop {
    pub fn new(
        source: Arc<dyn SensorSource>,
        resolver: EntityResolver,
        publisher: SnapshotPublisher,
        settings: PollSettings,
    ) -> Self {
        // Overrides apply even before discovery has run
        let mapping = resolver.resolve(&[]);
        Self {
            source,
            resolver,
            mapping,
            publisher,
            settings,
            last_discovery: None,
            discovered: false,
            state: PollState::Idle,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn mapping(&self) -> &EntityMapping {
        &self.mapping
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.settings.interval,
            timeout = ?self.settings.fetch_timeout,
            "Starting poll loop"
        );
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Poll cycle failed, serving stale snapshot");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Poll loop stopped");
                    return;
                }
            }
        }
    }

    /// Runs one `Fetching → Normalizing → Publishing` cycle. On error the
    /// previous snapshot stays visible and is flagged stale.
    pub async fn poll_once(&mut self) -> Result<Arc<DeviceSnapshot>> {
        if self.needs_discovery() {
            self.discover().await;
        }

        let result = self.cycle().await;
        if result.is_err() {
            self.publisher.mark_stale();
        }
        self.state = PollState::Idle;
        result
    }

    /// The first successful listing always runs; afterwards discovery only
    /// retries while no power slot is mapped.
    fn needs_discovery(&self) -> bool {
        if !self.resolver.discovery_enabled() {
            return false;
        }
        if self.discovered && self.mapping.has_power_data() {
            return false;
        }
        match self.last_discovery {
            None => true,
            Some(at) => at.elapsed() >= self.settings.discovery_retry,
        }
    }

    async fn discover(&mut self) {
        self.last_discovery = Some(Instant::now());
        match timeout(self.settings.fetch_timeout, self.source.list_entities()).await {
            Ok(Ok(entities)) => {
                info!(sensors = entities.len(), "Running entity discovery");
                self.mapping = self.resolver.resolve(&entities);
                self.discovered = true;
            }
            Ok(Err(e)) => warn!(error = %e, "Entity discovery failed"),
            Err(_) => warn!(
                error = %EmulatorError::FetchTimeout(self.settings.fetch_timeout),
                "Entity discovery failed"
            ),
        }
    }

    async fn cycle(&mut self) -> Result<Arc<DeviceSnapshot>> {
        self.state = PollState::Fetching;
        let ids = self.mapping.identifiers();
        if ids.is_empty() {
            return Err(EmulatorError::DiscoveryMiss("power".to_string()));
        }
        let states = timeout(self.settings.fetch_timeout, self.source.fetch(&ids))
            .await
            .map_err(|_| EmulatorError::FetchTimeout(self.settings.fetch_timeout))??;

        self.state = PollState::Normalizing;
        let raw = RawCycle::collect(&self.mapping, &states);
        if raw.values == 0 {
            return Err(EmulatorError::FetchUnreachable(
                "no entity returned a usable value".to_string(),
            ));
        }
        let snapshot = raw.into_snapshot(&self.mapping, &self.publisher.last_published());

        self.state = PollState::Publishing;
        let published = self.publisher.publish(snapshot);
        debug!(
            sequence = published.sequence(),
            power = published.total_active_power(),
            "Published snapshot"
        );
        Ok(published)
    }
}

/// Normalized values of one cycle, grouped the way the calculator wants them.
#[derive(Default)]
struct RawCycle {
    phases: [RawPhase; 3],
    total: RawPhase,
    totals: RawTotals,
    frequency: Option<f64>,
    values: usize,
}

impl RawCycle {
    fn collect(mapping: &EntityMapping, states: &HashMap<String, EntityState>) -> Self {
        let mut raw = Self::default();
        for (slot, entity) in mapping.iter() {
            let reading = match states.get(&entity.entity_id) {
                Some(EntityState::Value(reading)) => reading,
                _ => continue,
            };
            let unit = reading.unit.as_deref().or(entity.unit.as_deref());
            match normalize_as(reading.value, unit, slot.kind()) {
                Ok(value) => {
                    raw.set(slot, value);
                    raw.values += 1;
                }
                Err(e) => warn!(%slot, entity_id = %entity.entity_id, error = %e, "Ignoring reading"),
            }
        }
        raw
    }

    fn set(&mut self, slot: Slot, value: f64) {
        let value = Some(value);
        match slot {
            Slot::PowerConsumption => self.total.power = value,
            Slot::PowerProduction => self.total.power_returned = value,
            Slot::PhasePowerConsumption(p) => self.phases[p.index()].power = value,
            Slot::PhasePowerProduction(p) => self.phases[p.index()].power_returned = value,
            Slot::Voltage(p) => self.phases[p.index()].voltage = value,
            Slot::Current(p) => self.phases[p.index()].current = value,
            Slot::ApparentPower(p) => self.phases[p.index()].apparent_power = value,
            Slot::Frequency => self.frequency = value,
            Slot::EnergyConsumptionTotal => self.totals.consumption_total = value,
            Slot::EnergyProductionTotal => self.totals.production_total = value,
            Slot::EnergyConsumptionTariff1 => self.totals.consumption_tariff_1 = value,
            Slot::EnergyConsumptionTariff2 => self.totals.consumption_tariff_2 = value,
            Slot::EnergyProductionTariff1 => self.totals.production_tariff_1 = value,
            Slot::EnergyProductionTariff2 => self.totals.production_tariff_2 = value,
        }
    }

    fn into_snapshot(mut self, mapping: &EntityMapping, previous: &DeviceSnapshot) -> DeviceSnapshot {
        let energy = derive_totals(&self.totals, previous.energy());
        let captured_at = Utc::now();
        for phase in self.phases.iter_mut() {
            phase.frequency = self.frequency;
        }

        if mapping.is_three_phase() {
            let phases = PhaseLabel::ALL.map(|label| derive_phase(&self.phases[label.index()]));
            return DeviceSnapshot::three_phase(phases, energy, captured_at);
        }

        // Single-phase meters report their power as totals and the rest on L1
        let line = self.phases[PhaseLabel::A.index()];
        let phase = derive_phase(&RawPhase {
            power: self.total.power,
            power_returned: self.total.power_returned,
            ..line
        });
        DeviceSnapshot::single_phase(phase, energy, captured_at)
    }
}
