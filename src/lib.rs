// Public modules
pub mod bus;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hal;
pub mod messages;
pub mod pipeline;
pub mod registry;
pub mod sensors;
pub mod treatment;

// Re-export commonly used types
pub use calibration::{CalibrationRecord, CalibrationSource};
pub use config::{load_engine_config, EngineConfig};
pub use engine::SkinEngine;
pub use errors::{CalibrationError, EngineError, EngineResult};
pub use messages::{DeviceHealth, Measurement};
pub use registry::init_engine;
pub use treatment::{TreatmentMode, TreatmentRecord};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing with default configuration
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Load `engine.toml` from `config_path` and apply the environment overrides.
pub fn load_config(config_path: &str) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let engine_config_path = format!("{}/engine.toml", config_path);
    let mut config = load_engine_config(&engine_config_path)?;
    config.apply_overrides(std::env::var("SKIN_DEVICE_ID").ok(), std::env::var("SKIN_BACKEND").ok())?;
    config.validate()?;
    info!(
        "[config] device {} on {} backend",
        config.device.id,
        config.device.backend.as_str()
    );
    Ok(config)
}

/// Bring the engine up, report its health, take one measurement and shut down.
pub async fn run_skin_hub(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("[SkinSensorHub] starting up...");

    let config = load_config(config_path)?;
    let mut engine = init_engine(config).await?;
    info!("[registry] engine initialized");

    let health = engine.self_test().await;
    info!("[main] self-test mask {:#04x}: {}", health.bits(), health);
    info!("[main] serial number {}", engine.serial_number());
    match engine.calibration_source() {
        CalibrationSource::Stored => {}
        CalibrationSource::Defaults { reason } => warn!("[main] running on default calibration: {}", reason),
        CalibrationSource::Unsaved { reason } => warn!("[main] calibration not persisted: {}", reason),
    }

    let measurement = engine.acquire().await;
    match measurement.to_json(engine.device_id()) {
        Ok(json) => info!("[main] measurement {}", json),
        Err(e) => warn!("[main] measurement could not be serialized: {}", e),
    }

    engine.shutdown().await;
    info!("[main] shutdown complete");
    Ok(())
}
