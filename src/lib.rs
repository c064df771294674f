pub mod commands;
pub mod config;
pub mod device;
pub mod plc;
pub mod serial;

pub use commands::{Station, StationStatus};
pub use config::StationConfig;

/// Installs `env_logger` at `level`; `RUST_LOG` overrides it when set.
/// Calling it again is harmless.
pub fn init_logging(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}
