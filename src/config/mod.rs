pub mod engine_config;

pub use engine_config::{
    load_engine_config, CalibrationDefaults, CompensationConfig, DeviceAddresses, DeviceConfig,
    EngineConfig, MoistureConfig, Peripheral, PinMap, TimingConfig,
};
