pub mod manager;
pub mod models;

pub use manager::DeviceManager;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Invalid device configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
