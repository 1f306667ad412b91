use async_trait::async_trait;

use crate::bus::RegisterBus;
use crate::errors::SensorResult;
use crate::hal::Clock;

pub mod ads1115;
pub mod sht31;
pub mod vl6180x;

pub use ads1115::{Ads1115, AdcChannel, AdcReading};
pub use sht31::{ClimateReading, Sht31};
pub use vl6180x::{ElasticityReading, Vl6180x};

/// Common surface of the protocol drivers.
///
/// Drivers own only their wire sequence and unit conversion; they never
/// apply calibration, so one driver instance serves any calibration state.
#[async_trait]
pub trait SensorDriver: Send + Sync {
    /// Verify identity and bring the part into its measurement configuration.
    async fn init(&mut self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> SensorResult<()>;
    fn id(&self) -> &str;
    fn address(&self) -> u8;

    async fn is_present(&self, bus: &mut dyn RegisterBus) -> bool {
        bus.is_present(self.address()).await
    }
}
