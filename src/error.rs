use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("No entity matched slot {0}")]
    DiscoveryMiss(String),

    #[error("Unsupported unit '{unit}' for {kind}")]
    UnsupportedUnit { unit: String, kind: String },

    #[error("Sensor source unreachable: {0}")]
    FetchUnreachable(String),

    #[error("Sensor fetch timed out after {0:?}")]
    FetchTimeout(std::time::Duration),

    #[error("Malformed request: {0}")]
    ProtocolParse(String),

    #[error("Register range {address}/{count} is outside the address space")]
    AddressOutOfRange { address: u16, count: u16 },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
