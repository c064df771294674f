pub mod settings;

pub use settings::{
    DacSettings, Eom, Parity, PlcEndpoint, PlcSettings, SerialSettings, StationConfig, SwitchMode,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
