#[cfg(target_os = "linux")]
pub mod gpio;
pub mod i2c;
pub mod simulated;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::errors::BusResult;

/// Backend variant selected once at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Hardware,
    Simulated,
}

impl BackendKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hardware" | "hw" => Some(BackendKind::Hardware),
            "simulated" | "sim" | "simulation" => Some(BackendKind::Simulated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Hardware => "hardware",
            BackendKind::Simulated => "simulated",
        }
    }
}

/// Addressed register-level bus (I2C class)
///
/// All transfers block the calling task until the bus transaction is done.
/// A missing device is reported through `is_present`, never by panicking.
#[async_trait]
pub trait RegisterBus: Send {
    async fn initialize(&mut self, bus_id: u8) -> BusResult<()>;
    async fn cleanup(&mut self);

    async fn write_register(&mut self, address: u8, reg: u8, value: u8) -> BusResult<()>;
    /// Writes `value` MSB first after the register byte.
    async fn write_register16(&mut self, address: u8, reg: u8, value: u16) -> BusResult<()>;
    async fn read_register(&mut self, address: u8, reg: u8) -> BusResult<u8>;
    /// Reads two bytes MSB first.
    async fn read_register16(&mut self, address: u8, reg: u8) -> BusResult<u16>;

    /// Raw write of `data` as a single transfer.
    async fn write_bytes(&mut self, address: u8, data: &[u8]) -> BusResult<()>;
    /// Raw read into `buf`; returns the number of bytes actually transferred.
    async fn read_bytes(&mut self, address: u8, buf: &mut [u8]) -> BusResult<usize>;

    async fn is_present(&mut self, address: u8) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    None,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition to `level` matches this edge selection.
    pub fn matches(&self, level: bool) -> bool {
        match self {
            Edge::Rising => level,
            Edge::Falling => !level,
            Edge::Both => true,
        }
    }

    pub fn as_sysfs(&self) -> &'static str {
        match self {
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

/// Level change delivered to edge subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: u8,
    pub level: bool,
    pub t_mono_ms: u64,
}

/// Capacity of each per-pin edge channel
pub const EDGE_CHANNEL_CAPACITY: usize = 64;

/// Digital I/O controller: pin direction, pull, level, PWM and edge events
#[async_trait]
pub trait DigitalIo: Send {
    async fn initialize(&mut self) -> BusResult<()>;
    async fn cleanup(&mut self);

    async fn set_direction(&mut self, pin: u8, direction: Direction) -> BusResult<()>;
    async fn set_pull_mode(&mut self, pin: u8, mode: PullMode) -> BusResult<()>;
    async fn write(&mut self, pin: u8, level: bool) -> BusResult<()>;
    async fn read(&mut self, pin: u8) -> BusResult<bool>;

    async fn start_pwm(&mut self, pin: u8, frequency_hz: u32, duty_percent: u8) -> BusResult<()>;
    async fn stop_pwm(&mut self, pin: u8) -> BusResult<()>;

    /// Register interest in `edge` transitions on an input pin.
    async fn subscribe_edge(&mut self, pin: u8, edge: Edge) -> BusResult<broadcast::Receiver<EdgeEvent>>;
}
