use async_trait::async_trait;
use crc::{Crc, CRC_8_NRSC_5};
use std::time::Duration;
use tracing::{debug, trace};

use super::SensorDriver;
use crate::bus::RegisterBus;
use crate::errors::{SensorError, SensorResult};
use crate::hal::{moisture::*, Clock};

const SOFT_RESET_DELAY: Duration = Duration::from_millis(2);

/// Sensirion CRC-8: polynomial 0x31, init 0xFF, no reflection, no final XOR
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

pub fn temperature_from_code(code: u16) -> f32 {
    -45.0 + 175.0 * (code as f32 / 65535.0)
}

pub fn humidity_from_code(code: u16) -> f32 {
    100.0 * (code as f32 / 65535.0)
}

/// Decoded temperature/humidity pair
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClimateReading {
    pub temperature_code: u16,
    pub humidity_code: u16,
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

impl ClimateReading {
    pub fn from_codes(temperature_code: u16, humidity_code: u16) -> Self {
        Self {
            temperature_code,
            humidity_code,
            temperature_c: temperature_from_code(temperature_code),
            humidity_pct: humidity_from_code(humidity_code),
        }
    }

    /// Relative humidity mapped onto the skin-moisture scale
    pub fn moisture_raw(&self) -> f32 {
        self.humidity_pct * 0.8 + 10.0
    }
}

/// SHT31 humidity/temperature sensor.
///
/// Response layout: `[T msb, T lsb, T crc, RH msb, RH lsb, RH crc]`. The CRC
/// bytes are only checked when `verify_crc` is set.
pub struct Sht31 {
    id: String,
    address: u8,
    measure_delay: Duration,
    verify_crc: bool,
}

impl Sht31 {
    pub fn new(id: String, address: u8, measure_delay: Duration, verify_crc: bool) -> Self {
        Self { id, address, measure_delay, verify_crc }
    }

    async fn send_command(&self, bus: &mut dyn RegisterBus, command: u16) -> SensorResult<()> {
        let [msb, lsb] = command.to_be_bytes();
        bus.write_register(self.address, msb, lsb).await.map_err(|e| SensorError::ReadError {
            sensor: self.id.clone(),
            reason: format!("command {:#06x} failed: {}", command, e),
        })
    }

    fn check_crc(&self, word: &[u8], crc: u8) -> SensorResult<()> {
        let expected = crc8(word);
        if self.verify_crc && expected != crc {
            return Err(SensorError::CrcMismatch {
                sensor: self.id.clone(),
                expected,
                actual: crc,
            });
        }
        Ok(())
    }

    /// Trigger one high-repeatability measurement and decode it.
    pub async fn read(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> SensorResult<ClimateReading> {
        self.send_command(bus, CMD_MEASURE_HIGH_REP).await?;
        clock.wait_ready(self.measure_delay).await;

        let mut buf = [0u8; RESPONSE_LEN];
        let n = bus.read_bytes(self.address, &mut buf).await.map_err(|e| SensorError::ReadError {
            sensor: self.id.clone(),
            reason: format!("response read failed: {}", e),
        })?;
        if n < RESPONSE_LEN {
            return Err(SensorError::ReadError {
                sensor: self.id.clone(),
                reason: format!("short response: {} of {} bytes", n, RESPONSE_LEN),
            });
        }

        self.check_crc(&buf[0..2], buf[2])?;
        self.check_crc(&buf[3..5], buf[5])?;

        let reading = ClimateReading::from_codes(
            u16::from_be_bytes([buf[0], buf[1]]),
            u16::from_be_bytes([buf[3], buf[4]]),
        );
        trace!(
            "[{}] T={:.2}C RH={:.2}% moisture_raw={:.2}",
            self.id,
            reading.temperature_c,
            reading.humidity_pct,
            reading.moisture_raw()
        );
        Ok(reading)
    }
}

#[async_trait]
impl SensorDriver for Sht31 {
    async fn init(&mut self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> SensorResult<()> {
        self.send_command(bus, CMD_SOFT_RESET).await.map_err(|e| SensorError::InitError {
            sensor: self.id.clone(),
            reason: e.to_string(),
        })?;
        clock.wait_ready(SOFT_RESET_DELAY).await;
        debug!("[{}] soft reset done", self.id);
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> u8 {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::simulated::SimulatedBus;
    use crate::config::DeviceAddresses;
    use crate::hal::VirtualClock;

    #[test]
    fn test_crc8_datasheet_vector() {
        // Sensirion datasheet example: 0xBEEF -> 0x92
        assert_eq!(crc8(&[0xBE, 0xEF]), 0x92);
        assert_eq!(crc8(b"123456789"), 0xF7);
    }

    #[test]
    fn test_code_conversions_at_extremes() {
        assert_eq!(temperature_from_code(0), -45.0);
        assert_eq!(temperature_from_code(65535), 130.0);
        assert_eq!(humidity_from_code(0), 0.0);
        assert_eq!(humidity_from_code(65535), 100.0);
    }

    #[test]
    fn test_moisture_mapping() {
        let reading = ClimateReading {
            humidity_pct: 50.0,
            ..Default::default()
        };
        assert_eq!(reading.moisture_raw(), 50.0);
    }

    async fn setup(verify_crc: bool) -> (SimulatedBus, VirtualClock, Sht31) {
        let mut bus = SimulatedBus::new(Some(9), DeviceAddresses::default());
        bus.initialize(1).await.unwrap();
        let sensor = Sht31::new("sht31".to_string(), 0x44, Duration::from_millis(15), verify_crc);
        (bus, VirtualClock::new(0), sensor)
    }

    #[tokio::test]
    async fn test_read_decodes_simulated_climate() {
        let (mut bus, clock, sensor) = setup(true).await;
        bus.handle().set_climate(35.0, 50.0);

        let reading = sensor.read(&mut bus, &clock).await.unwrap();

        assert!((reading.temperature_c - 35.0).abs() < 0.01);
        assert!((reading.humidity_pct - 50.0).abs() < 0.01);
        assert_eq!(clock.monotonic_ms(), 15);
    }

    #[tokio::test]
    async fn test_crc_mismatch_only_fails_when_verifying() {
        let (mut bus, clock, strict) = setup(true).await;
        bus.handle().corrupt_moisture_crc(true);
        assert!(matches!(
            strict.read(&mut bus, &clock).await,
            Err(SensorError::CrcMismatch { .. })
        ));

        let lenient = Sht31::new("sht31".to_string(), 0x44, Duration::from_millis(15), false);
        assert!(lenient.read(&mut bus, &clock).await.is_ok());
    }
}
