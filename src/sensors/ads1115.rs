use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

use super::SensorDriver;
use crate::bus::RegisterBus;
use crate::errors::{SensorError, SensorResult};
use crate::hal::{adc::*, Clock};

/// Linear mapping from input volts to sensor units
const UNITS_PER_VOLT: f32 = 30.0;
const UNITS_OFFSET: f32 = 100.0;

/// Wired ADC inputs. AIN3 is not connected on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcChannel {
    Pd1 = 0,
    Pd2 = 1,
    Thickness = 2,
}

impl AdcChannel {
    fn mux_bits(&self) -> u16 {
        match self {
            AdcChannel::Pd1 => CFG_MUX_AIN0,
            AdcChannel::Pd2 => CFG_MUX_AIN1,
            AdcChannel::Thickness => CFG_MUX_AIN2,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for AdcChannel {
    type Error = SensorError;

    fn try_from(channel: u8) -> Result<Self, Self::Error> {
        match channel {
            0 => Ok(AdcChannel::Pd1),
            1 => Ok(AdcChannel::Pd2),
            2 => Ok(AdcChannel::Thickness),
            other => Err(SensorError::InvalidChannel(other)),
        }
    }
}

/// One single-shot conversion. The all-zero value doubles as the degraded
/// reading when a conversion fails.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdcReading {
    pub code: i16,
    pub voltage: f32,
    pub units: f32,
}

impl AdcReading {
    pub fn from_code(code: i16) -> Self {
        let voltage = code_to_voltage(code);
        Self {
            code,
            voltage,
            units: voltage_to_units(voltage),
        }
    }
}

pub fn code_to_voltage(code: i16) -> f32 {
    code as f32 * VREF / FULL_SCALE
}

pub fn voltage_to_units(voltage: f32) -> f32 {
    voltage * UNITS_PER_VOLT + UNITS_OFFSET
}

/// Single-shot, +/-4.096 V, 128 SPS config word for `channel`
pub fn config_word(channel: AdcChannel) -> u16 {
    CFG_OS_SINGLE | channel.mux_bits() | CFG_PGA_4V | CFG_MODE_SINGLE | CFG_DR_128SPS
}

/// ADS1115 16-bit ADC behind the photodiodes and the thickness probe
pub struct Ads1115 {
    id: String,
    address: u8,
    settle: Duration,
}

impl Ads1115 {
    pub fn new(id: String, address: u8, settle: Duration) -> Self {
        Self { id, address, settle }
    }

    /// Run one conversion on `channel`. No averaging happens here.
    pub async fn read_channel(
        &self,
        bus: &mut dyn RegisterBus,
        clock: &dyn Clock,
        channel: AdcChannel,
    ) -> SensorResult<AdcReading> {
        bus.write_register16(self.address, REG_CONFIG, config_word(channel))
            .await
            .map_err(|e| SensorError::ReadError {
                sensor: self.id.clone(),
                reason: format!("failed to start conversion on channel {}: {}", channel.index(), e),
            })?;

        clock.wait_ready(self.settle).await;

        let raw = bus
            .read_register16(self.address, REG_CONVERSION)
            .await
            .map_err(|e| SensorError::ReadError {
                sensor: self.id.clone(),
                reason: format!("failed to read conversion register: {}", e),
            })?;

        let reading = AdcReading::from_code(raw as i16);
        trace!(
            "[{}] ch{} code={} voltage={:.4}V units={:.2}",
            self.id,
            channel.index(),
            reading.code,
            reading.voltage,
            reading.units
        );
        Ok(reading)
    }

    /// Same as `read_channel` for an untyped channel number; anything
    /// outside 0..=2 is rejected rather than aliased.
    pub async fn read_raw_channel(
        &self,
        bus: &mut dyn RegisterBus,
        clock: &dyn Clock,
        channel: u8,
    ) -> SensorResult<AdcReading> {
        let channel = AdcChannel::try_from(channel)?;
        self.read_channel(bus, clock, channel).await
    }
}

#[async_trait]
impl SensorDriver for Ads1115 {
    async fn init(&mut self, bus: &mut dyn RegisterBus, _clock: &dyn Clock) -> SensorResult<()> {
        // the ADS1115 has no ID register; a readable config register is the best identity check
        bus.read_register16(self.address, REG_CONFIG)
            .await
            .map_err(|e| SensorError::InitError {
                sensor: self.id.clone(),
                reason: format!("config register unreadable: {}", e),
            })?;
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> u8 {
        self.address
    }
}
