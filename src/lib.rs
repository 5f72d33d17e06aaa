//! Shelly Pro 3EM Meter Emulation Library
//!
//! Polls Home Assistant for grid meter sensors and presents the readings as a
//! Shelly Pro 3EM over Modbus TCP, UDP JSON-RPC and WebSocket, so battery
//! systems that expect a real meter can use the house meter instead.

pub mod calculator;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod entity_resolver;
pub mod error;
pub mod home_assistant;
pub mod modbus_server;
pub mod normalizer;
pub mod poll_loop;
pub mod push_notifier;
pub mod register_map;
pub mod rpc;
pub mod sensor_source;
pub mod snapshot;
pub mod snapshot_cache;
pub mod udp_server;

// Re-export commonly used types for easier access
pub use config::Settings;
pub use coordinator::Coordinator;
pub use device::DeviceIdentity;
pub use entity_resolver::{EntityResolver, Slot};
pub use error::{EmulatorError, Result};
pub use home_assistant::HomeAssistantAPI;
pub use snapshot::DeviceSnapshot;
pub use snapshot_cache::{SnapshotCache, SnapshotPublisher};
