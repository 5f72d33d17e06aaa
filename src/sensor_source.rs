use crate::entity_resolver::EntityDescriptor;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// A raw numeric reading with the unit the source declared for it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceReading {
    pub value: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    Value(SourceReading),
    /// The source does not know the identifier.
    NotFound,
    /// Known, but currently without a usable numeric value.
    Unavailable,
}

/// Upstream pull interface the poll loop reads from.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Every sensor the source can offer, for discovery.
    async fn list_entities(&self) -> Result<Vec<EntityDescriptor>>;

    /// Current state of each identifier. Identifiers that could not be
    /// read are left out of the map; an error means nothing could be read.
    async fn fetch(&self, entity_ids: &[String]) -> Result<HashMap<String, EntityState>>;
}
