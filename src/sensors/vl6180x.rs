use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace};

use super::SensorDriver;
use crate::bus::RegisterBus;
use crate::errors::{BusError, SensorError, SensorResult};
use crate::hal::{tof::*, Clock};

/// Probe-to-skin distance span over which elasticity is graded (mm)
pub const MIN_DISTANCE_MM: f32 = 5.0;
pub const MAX_DISTANCE_MM: f32 = 55.0;

/// Map a ranged distance to a 0..=100 elasticity score. Skin that springs
/// back pushes the target closer, so shorter distances score higher.
pub fn elasticity_from_distance(distance_mm: f32) -> f32 {
    let span = MAX_DISTANCE_MM - MIN_DISTANCE_MM;
    let d = distance_mm.clamp(MIN_DISTANCE_MM, MAX_DISTANCE_MM);
    100.0 * (MAX_DISTANCE_MM - d) / span
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ElasticityReading {
    pub range_mm: u8,
    pub elasticity: f32,
}

/// VL6180X time-of-flight ranging sensor
pub struct Vl6180x {
    id: String,
    address: u8,
    poll_interval: Duration,
    max_polls: u32,
}

impl Vl6180x {
    pub fn new(id: String, address: u8, poll_interval: Duration, max_polls: u32) -> Self {
        Self { id, address, poll_interval, max_polls }
    }

    async fn write_reg(&self, bus: &mut dyn RegisterBus, index: u16, value: u8) -> Result<(), BusError> {
        let [hi, lo] = index.to_be_bytes();
        bus.write_bytes(self.address, &[hi, lo, value]).await
    }

    async fn read_reg(&self, bus: &mut dyn RegisterBus, index: u16) -> Result<u8, BusError> {
        bus.write_bytes(self.address, &index.to_be_bytes()).await?;
        let mut buf = [0u8; 1];
        let n = bus.read_bytes(self.address, &mut buf).await?;
        if n < 1 {
            return Err(BusError::Nack {
                address: self.address,
                reason: format!("no data for register {:#06x}", index),
            });
        }
        Ok(buf[0])
    }

    fn read_error(&self, what: &str, e: BusError) -> SensorError {
        SensorError::ReadError {
            sensor: self.id.clone(),
            reason: format!("{}: {}", what, e),
        }
    }

    /// Single-shot range measurement in millimetres
    pub async fn read_range_mm(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> SensorResult<u8> {
        self.write_reg(bus, REG_SYSRANGE_START, 0x01)
            .await
            .map_err(|e| self.read_error("range start failed", e))?;

        let mut ready = false;
        for _ in 0..self.max_polls {
            let status = self
                .read_reg(bus, REG_RESULT_INTERRUPT_STATUS)
                .await
                .map_err(|e| self.read_error("status read failed", e))?;
            if status & 0x07 == STATUS_RANGE_READY {
                ready = true;
                break;
            }
            clock.wait_ready(self.poll_interval).await;
        }
        if !ready {
            return Err(SensorError::NotReady {
                sensor: self.id.clone(),
                polls: self.max_polls,
            });
        }

        let range = self
            .read_reg(bus, REG_RESULT_RANGE_VAL)
            .await
            .map_err(|e| self.read_error("range read failed", e))?;
        self.write_reg(bus, REG_SYSTEM_INTERRUPT_CLEAR, 0x07)
            .await
            .map_err(|e| self.read_error("interrupt clear failed", e))?;
        Ok(range)
    }

    pub async fn read_elasticity(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> SensorResult<ElasticityReading> {
        let range_mm = self.read_range_mm(bus, clock).await?;
        let elasticity = elasticity_from_distance(range_mm as f32);
        trace!("[{}] range={}mm elasticity={:.2}", self.id, range_mm, elasticity);
        Ok(ElasticityReading { range_mm, elasticity })
    }
}

#[async_trait]
impl SensorDriver for Vl6180x {
    async fn init(&mut self, bus: &mut dyn RegisterBus, _clock: &dyn Clock) -> SensorResult<()> {
        let model = self.read_reg(bus, REG_MODEL_ID).await.map_err(|e| SensorError::InitError {
            sensor: self.id.clone(),
            reason: format!("model id read failed: {}", e),
        })?;
        if model != MODEL_ID {
            return Err(SensorError::WrongChipId {
                sensor: self.id.clone(),
                expected: MODEL_ID,
                actual: model,
            });
        }

        let fresh = self.read_reg(bus, REG_FRESH_OUT_OF_RESET).await?;
        if fresh == 0x01 {
            self.write_reg(bus, REG_FRESH_OUT_OF_RESET, 0x00).await?;
            debug!("[{}] cleared fresh-out-of-reset", self.id);
        }
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> u8 {
        self.address
    }
}
