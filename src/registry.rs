use std::sync::Arc;
use tracing::info;

use crate::bus::simulated::{SimulatedBus, SimulatedGpio};
use crate::bus::{BackendKind, DigitalIo, RegisterBus};
use crate::config::EngineConfig;
use crate::engine::SkinEngine;
use crate::errors::EngineResult;
use crate::hal::{Clock, SystemClock};

/// Build the bus pair for the configured backend.
pub fn create_backends(config: &EngineConfig) -> EngineResult<(Box<dyn RegisterBus>, Box<dyn DigitalIo>)> {
    match config.device.backend {
        BackendKind::Simulated => {
            info!(
                "[registry] simulated backend (seed: {})",
                config.device.seed.map_or_else(|| "random".to_string(), |s| s.to_string())
            );
            let bus = SimulatedBus::new(config.device.seed, config.addresses);
            Ok((Box::new(bus), Box::new(SimulatedGpio::new())))
        }
        BackendKind::Hardware => hardware_backends(config),
    }
}

#[cfg(target_os = "linux")]
fn hardware_backends(config: &EngineConfig) -> EngineResult<(Box<dyn RegisterBus>, Box<dyn DigitalIo>)> {
    use crate::bus::gpio::SysfsGpio;
    use crate::bus::i2c::LinuxI2cBus;

    info!("[registry] hardware backend on /dev/i2c-{}", config.device.i2c_bus);
    Ok((Box::new(LinuxI2cBus::new()), Box::new(SysfsGpio::new())))
}

#[cfg(not(target_os = "linux"))]
fn hardware_backends(config: &EngineConfig) -> EngineResult<(Box<dyn RegisterBus>, Box<dyn DigitalIo>)> {
    Err(crate::errors::EngineError::BackendUnavailable {
        backend: config.device.backend.as_str().to_string(),
    })
}

/// Create the configured backends and bring the engine up on the system clock.
pub async fn init_engine(config: EngineConfig) -> EngineResult<SkinEngine> {
    let (bus, gpio) = create_backends(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    SkinEngine::initialize(config, bus, gpio, clock).await
}
