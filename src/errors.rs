use thiserror::Error;
use crate::bus::i2c::I2CError;

/// Register bus and digital I/O errors
#[derive(Error, Debug)]
pub enum BusError {
    #[error("I2C communication failed: {0}")]
    I2c(#[from] I2CError),

    #[error("GPIO access failed on pin {pin}: {source}")]
    Gpio {
        pin: u8,
        #[source]
        source: std::io::Error,
    },

    #[error("Bus '{bus}' is not initialized")]
    NotInitialized { bus: String },

    #[error("No device acknowledged at address {address:#04x}")]
    NoDevice { address: u8 },

    #[error("Device {address:#04x} rejected the transfer: {reason}")]
    Nack { address: u8, reason: String },

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(String),
}

/// Errors raised by the protocol drivers
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("ADC channel {0} is not wired (valid channels are 0, 1 and 2)")]
    InvalidChannel(u8),

    #[error("Sensor '{sensor}' initialization failed: {reason}")]
    InitError { sensor: String, reason: String },

    #[error("Sensor '{sensor}' read failed: {reason}")]
    ReadError { sensor: String, reason: String },

    #[error("Sensor '{sensor}' wrong chip ID: expected {expected:#04x}, got {actual:#04x}")]
    WrongChipId { sensor: String, expected: u8, actual: u8 },

    #[error("Sensor '{sensor}' CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch { sensor: String, expected: u8, actual: u8 },

    #[error("Sensor '{sensor}' not ready after {polls} polls")]
    NotReady { sensor: String, polls: u32 },
}

/// Calibration record persistence errors
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Short calibration read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Calibration magic mismatch: expected {expected:#010x}, got {actual:#010x}")]
    MagicMismatch { expected: u32, actual: u32 },

    #[error("Calibration checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("Calibration averaging produced no usable value for channel {channel}")]
    NonFinite { channel: u8 },

    #[error("Calibration record could not be persisted: {reason}")]
    Persist { reason: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration format: {0}")]
    FormatError(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Engine lifecycle errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Mandatory peripheral '{peripheral}' not present at address {address:#04x}")]
    HardwareAbsent { peripheral: String, address: u8 },

    #[error("Bus initialization failed: {0}")]
    BusInit(#[source] BusError),

    #[error("Sensor '{sensor}' setup failed: {source}")]
    SensorSetup {
        sensor: String,
        #[source]
        source: SensorError,
    },

    #[error("Backend '{backend}' is not available on this platform")]
    BackendUnavailable { backend: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type aliases for convenience
pub type BusResult<T> = Result<T, BusError>;
pub type SensorResult<T> = Result<T, SensorError>;
pub type CalibrationResult<T> = Result<T, CalibrationError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type EngineResult<T> = Result<T, EngineError>;
