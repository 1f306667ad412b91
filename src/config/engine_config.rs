use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::bus::BackendKind;
use crate::errors::{ConfigError, ConfigResult};
use crate::hal;

/// Root of `engine.toml`. Every section is optional; missing values fall
/// back to the factory defaults of the board.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub addresses: DeviceAddresses,
    pub pins: PinMap,
    pub calibration: CalibrationDefaults,
    pub compensation: CompensationConfig,
    pub moisture: MoistureConfig,
    pub timing: TimingConfig,
    /// Reported as the measurement frequency of every cycle
    pub measurement_hz: f32,
    /// Validate the per-word CRC-8 of humidity sensor responses
    pub verify_sensor_crc: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            addresses: DeviceAddresses::default(),
            pins: PinMap::default(),
            calibration: CalibrationDefaults::default(),
            compensation: CompensationConfig::default(),
            moisture: MoistureConfig::default(),
            timing: TimingConfig::default(),
            measurement_hz: 50.0,
            verify_sensor_crc: false,
        }
    }
}

/// Monitored peripherals, in self-test bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Peripheral {
    Adc,
    Moisture,
    Elasticity,
    Eeprom,
}

impl Peripheral {
    pub const ALL: [Peripheral; 4] = [
        Peripheral::Adc,
        Peripheral::Moisture,
        Peripheral::Elasticity,
        Peripheral::Eeprom,
    ];

    /// Bit set in the health mask when this peripheral is missing
    pub fn bit(&self) -> u8 {
        match self {
            Peripheral::Adc => 0x01,
            Peripheral::Moisture => 0x02,
            Peripheral::Elasticity => 0x04,
            Peripheral::Eeprom => 0x08,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Peripheral::Adc => "ADC (ADS1115)",
            Peripheral::Moisture => "moisture sensor (SHT31)",
            Peripheral::Elasticity => "ToF sensor (VL6180X)",
            Peripheral::Eeprom => "EEPROM (AT24C256)",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub backend: BackendKind,
    pub i2c_bus: u8,
    /// Seed for the simulated backend; random when absent
    pub seed: Option<u64>,
    /// Peripherals whose absence aborts initialization
    pub mandatory: Vec<Peripheral>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "THE3-SKIN-DEVICE-001".to_string(),
            backend: BackendKind::Simulated,
            i2c_bus: hal::i2c::BUS_NUMBER,
            seed: None,
            mandatory: vec![Peripheral::Adc, Peripheral::Moisture, Peripheral::Elasticity],
        }
    }
}

/// 7-bit I2C addresses of the fitted parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceAddresses {
    pub adc: u8,
    pub moisture: u8,
    pub elasticity: u8,
    pub eeprom: u8,
}

impl Default for DeviceAddresses {
    fn default() -> Self {
        Self {
            adc: hal::i2c::ADDR_PHOTODIODE_ADC,
            moisture: hal::i2c::ADDR_MOISTURE_SENSOR,
            elasticity: hal::i2c::ADDR_ELASTICITY_SENSOR,
            eeprom: hal::i2c::ADDR_EEPROM,
        }
    }
}

impl DeviceAddresses {
    pub fn of(&self, peripheral: Peripheral) -> u8 {
        match peripheral {
            Peripheral::Adc => self.adc,
            Peripheral::Moisture => self.moisture,
            Peripheral::Elasticity => self.elasticity,
            Peripheral::Eeprom => self.eeprom,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PinMap {
    pub power_led: u8,
    pub sensor_power: u8,
    pub adc_drdy: u8,
    pub status_led: u8,
    pub error_led: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            power_led: hal::gpio::PIN_LED_POWER,
            sensor_power: hal::gpio::PIN_SENSOR_POWER,
            adc_drdy: hal::gpio::PIN_ADC_DRDY,
            status_led: hal::gpio::PIN_LED_STATUS,
            error_led: hal::gpio::PIN_LED_ERROR,
        }
    }
}

/// Compiled-in calibration used until a valid record is loaded, plus the
/// parameters of the calibration routine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationDefaults {
    pub version: u16,
    pub pd_offset1: f32,
    pub pd_offset2: f32,
    pub moisture_scale: f32,
    pub moisture_offset: f32,
    pub elasticity_scale: f32,
    pub elasticity_offset: f32,
    pub thickness_scale: f32,
    pub thickness_offset: f32,
    pub serial_number: String,
    pub reference_value: f32,
    pub samples: u32,
    pub sample_interval_ms: u64,
    /// Byte offset of the record inside the EEPROM
    pub eeprom_offset: u16,
}

impl Default for CalibrationDefaults {
    fn default() -> Self {
        Self {
            version: 1,
            pd_offset1: 0.0,
            pd_offset2: 0.0,
            moisture_scale: 1.0,
            moisture_offset: 0.0,
            elasticity_scale: 1.0,
            elasticity_offset: 0.0,
            thickness_scale: 1.0,
            thickness_offset: 0.0,
            serial_number: "UNPROGRAMMED".to_string(),
            reference_value: 100.0,
            samples: 10,
            sample_interval_ms: 100,
            eeprom_offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    pub reference_temp_c: f32,
    /// Fractional change per degree away from the reference
    pub temp_coefficient: f32,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            reference_temp_c: 25.0,
            temp_coefficient: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MoistureConfig {
    pub min: f32,
    pub max: f32,
    pub level_gain: f32,
}

impl Default for MoistureConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
            level_gain: 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub adc_settle_ms: u64,
    pub moisture_measure_ms: u64,
    pub tof_poll_ms: u64,
    pub tof_max_polls: u32,
    pub eeprom_write_cycle_ms: u64,
    pub power_up_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            // one 128 SPS conversion takes 7.8 ms
            adc_settle_ms: 9,
            moisture_measure_ms: 15,
            tof_poll_ms: 1,
            tof_max_polls: 50,
            eeprom_write_cycle_ms: 5,
            power_up_ms: 20,
        }
    }
}

impl TimingConfig {
    pub fn adc_settle(&self) -> Duration {
        Duration::from_millis(self.adc_settle_ms)
    }

    pub fn moisture_measure(&self) -> Duration {
        Duration::from_millis(self.moisture_measure_ms)
    }

    pub fn tof_poll(&self) -> Duration {
        Duration::from_millis(self.tof_poll_ms)
    }

    pub fn eeprom_write_cycle(&self) -> Duration {
        Duration::from_millis(self.eeprom_write_cycle_ms)
    }

    pub fn power_up(&self) -> Duration {
        Duration::from_millis(self.power_up_ms)
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let parsed: EngineConfig = toml::from_str(content)?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Apply process-level overrides (`SKIN_DEVICE_ID`, `SKIN_BACKEND`).
    pub fn apply_overrides(&mut self, device_id: Option<String>, backend: Option<String>) -> ConfigResult<()> {
        if let Some(id) = device_id.filter(|id| !id.trim().is_empty()) {
            self.device.id = id;
        }
        if let Some(name) = backend {
            self.device.backend = BackendKind::from_str(&name).ok_or_else(|| ConfigError::InvalidValue {
                field: "device.backend".to_string(),
                reason: format!("unknown backend '{}'", name),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if !(self.moisture.min.is_finite() && self.moisture.max.is_finite()) || self.moisture.min >= self.moisture.max {
            return Err(invalid("moisture", "min must be finite and below max"));
        }
        if !self.compensation.reference_temp_c.is_finite() || !self.compensation.temp_coefficient.is_finite() {
            return Err(invalid("compensation", "values must be finite"));
        }
        if self.calibration.samples == 0 {
            return Err(invalid("calibration.samples", "at least one sample is required"));
        }
        if self.calibration.serial_number.len() > 16 {
            return Err(invalid("calibration.serial_number", "at most 16 bytes"));
        }
        let record_end = self.calibration.eeprom_offset as usize + crate::calibration::RECORD_SIZE;
        if record_end > hal::eeprom::SIZE {
            return Err(invalid("calibration.eeprom_offset", "record does not fit in the EEPROM"));
        }
        let addrs = Peripheral::ALL.map(|p| self.addresses.of(p));
        for (i, a) in addrs.iter().enumerate() {
            if *a > 0x7F {
                return Err(invalid("addresses", "7-bit addresses only"));
            }
            if addrs[i + 1..].contains(a) {
                return Err(invalid("addresses", "two peripherals share an address"));
            }
        }
        Ok(())
    }
}

/// Loads config from TOML file
pub fn load_engine_config(path: &str) -> ConfigResult<EngineConfig> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::LoadError {
        path: path.to_string(),
        source,
    })?;
    EngineConfig::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_factory_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.device.backend, BackendKind::Simulated);
        assert_eq!(config.addresses, DeviceAddresses::default());
        assert_eq!(config.compensation.reference_temp_c, 25.0);
        assert_eq!(config.calibration.samples, 10);
        assert_eq!(config.moisture.max, 100.0);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            measurement_hz = 60.0

            [device]
            backend = "hardware"
            seed = 7
            mandatory = ["adc"]

            [addresses]
            eeprom = 0x51
            "#,
        )
        .unwrap();

        assert_eq!(config.device.backend, BackendKind::Hardware);
        assert_eq!(config.device.seed, Some(7));
        assert_eq!(config.device.mandatory, vec![Peripheral::Adc]);
        assert_eq!(config.addresses.eeprom, 0x51);
        assert_eq!(config.addresses.adc, 0x48);
        assert_eq!(config.measurement_hz, 60.0);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("[moisture]\nmin = 100.0\nmax = 0.0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(EngineConfig::from_toml_str("[addresses]\nadc = 0x44").is_err());
        assert!(EngineConfig::from_toml_str("[calibration]\nsamples = 0").is_err());
        assert!(matches!(
            EngineConfig::from_toml_str("measurement_hz = \"fast\""),
            Err(ConfigError::FormatError(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(Some("THE3-LAB-7".to_string()), Some("hardware".to_string()))
            .unwrap();
        assert_eq!(config.device.id, "THE3-LAB-7");
        assert_eq!(config.device.backend, BackendKind::Hardware);
        assert!(config.apply_overrides(None, Some("spi".to_string())).is_err());
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/engine.toml");
        let config = load_engine_config(path).unwrap();
        assert_eq!(config.addresses, DeviceAddresses::default());
        assert_eq!(config.pins.power_led, hal::gpio::PIN_LED_POWER);
        assert_eq!(config.device.mandatory.len(), 3);
        assert_eq!(config.timing.adc_settle(), Duration::from_millis(9));
    }

    #[test]
    fn test_missing_file_reports_path() {
        match load_engine_config("/nonexistent/engine.toml") {
            Err(ConfigError::LoadError { path, .. }) => assert_eq!(path, "/nonexistent/engine.toml"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
