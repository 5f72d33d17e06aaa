use crate::entity_resolver::EntityDescriptor;
use crate::error::{EmulatorError, Result};
use crate::sensor_source::{EntityState, SensorSource, SourceReading};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Home Assistant REST API client.
pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(endpoint_url: &str, auth_token: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn ensure_connection(&self) -> Result<()> {
        if self.endpoint_url.is_empty() {
            return Err(EmulatorError::FetchUnreachable("No HA connection".to_string()));
        }
        Ok(())
    }

    pub async fn read_all_sensors(&self) -> Result<Vec<HASensor>> {
        self.ensure_connection()?;
        let sensors = self
            .client
            .get(format!("{}/api/states", self.endpoint_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(sensors)
    }

    /// `Ok(None)` when Home Assistant does not know the entity.
    pub async fn read_sensor_value(&self, entity_id: &str) -> Result<Option<HASensor>> {
        self.ensure_connection()?;
        let response = self
            .client
            .get(format!("{}/api/states/{}", self.endpoint_url, entity_id))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}

#[async_trait]
impl SensorSource for HomeAssistantAPI {
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>> {
        let sensors = self
            .read_all_sensors()
            .await
            .map_err(|e| EmulatorError::FetchUnreachable(e.to_string()))?;
        Ok(sensors
            .into_iter()
            .filter(|sensor| sensor.entity_id.starts_with("sensor."))
            .map(|sensor| EntityDescriptor {
                entity_id: sensor.entity_id,
                unit: sensor.attributes.unit_of_measurement,
            })
            .collect())
    }

    async fn fetch(&self, entity_ids: &[String]) -> Result<HashMap<String, EntityState>> {
        self.ensure_connection()?;
        let responses = join_all(entity_ids.iter().map(|id| self.read_sensor_value(id))).await;

        let mut states = HashMap::new();
        let mut last_error = None;
        for (entity_id, response) in entity_ids.iter().zip(responses) {
            match response {
                Ok(Some(sensor)) => {
                    states.insert(entity_id.clone(), sensor.to_state());
                }
                Ok(None) => {
                    debug!(%entity_id, "Entity not found");
                    states.insert(entity_id.clone(), EntityState::NotFound);
                }
                Err(e) => {
                    warn!(%entity_id, error = %e, "Failed to read entity");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if states.is_empty() => Err(EmulatorError::FetchUnreachable(e.to_string())),
            _ => Ok(states),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: HAAttributes,
    #[serde(default)]
    pub last_updated: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HAAttributes {
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
}

impl HASensor {
    pub fn to_state(&self) -> EntityState {
        match self.state.as_str() {
            "unavailable" | "unknown" | "" => EntityState::Unavailable,
            state => match state.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => EntityState::Value(SourceReading {
                    value,
                    unit: self.attributes.unit_of_measurement.clone(),
                }),
                _ => {
                    debug!(entity_id = %self.entity_id, state, "Non-numeric state");
                    EntityState::Unavailable
                }
            },
        }
    }
}
