//! Hardware map and timing services for the skin analysis board
//!
//! Register constants follow the datasheets of the parts fitted on the
//! board (ADS1115, SHT31, VL6180X, AT24C256). Addresses and pins here are
//! the factory wiring; `EngineConfig` may override them per device.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub mod i2c {
    pub const BUS_NUMBER: u8 = 1;

    pub const ADDR_MOISTURE_SENSOR: u8 = 0x44;
    pub const ADDR_PHOTODIODE_ADC: u8 = 0x48;
    pub const ADDR_ELASTICITY_SENSOR: u8 = 0x29;
    pub const ADDR_EEPROM: u8 = 0x50;
}

pub mod gpio {
    pub const PIN_LED_POWER: u8 = 17;
    pub const PIN_LED_STATUS: u8 = 27;
    pub const PIN_LED_ERROR: u8 = 22;
    pub const PIN_SENSOR_POWER: u8 = 5;
    pub const PIN_ADC_DRDY: u8 = 6;
}

/// ADS1115 registers and config word fields
pub mod adc {
    pub const REG_CONVERSION: u8 = 0x00;
    pub const REG_CONFIG: u8 = 0x01;

    pub const CFG_OS_SINGLE: u16 = 0x8000;
    pub const CFG_MUX_AIN0: u16 = 0x4000;
    pub const CFG_MUX_AIN1: u16 = 0x5000;
    pub const CFG_MUX_AIN2: u16 = 0x6000;
    pub const CFG_MUX_MASK: u16 = 0x7000;
    pub const CFG_PGA_4V: u16 = 0x0200;
    pub const CFG_MODE_SINGLE: u16 = 0x0100;
    pub const CFG_DR_128SPS: u16 = 0x0080;

    pub const VREF: f32 = 4.096;
    pub const FULL_SCALE: f32 = 32768.0;
}

/// SHT31 commands (MSB first on the wire)
pub mod moisture {
    pub const CMD_MEASURE_HIGH_REP: u16 = 0x2400;
    pub const CMD_SOFT_RESET: u16 = 0x30A2;
    pub const RESPONSE_LEN: usize = 6;
}

/// VL6180X uses 16-bit register indices
pub mod tof {
    pub const REG_MODEL_ID: u16 = 0x0000;
    pub const REG_SYSTEM_INTERRUPT_CLEAR: u16 = 0x0015;
    pub const REG_FRESH_OUT_OF_RESET: u16 = 0x0016;
    pub const REG_SYSRANGE_START: u16 = 0x0018;
    pub const REG_RESULT_INTERRUPT_STATUS: u16 = 0x004F;
    pub const REG_RESULT_RANGE_VAL: u16 = 0x0062;

    pub const MODEL_ID: u8 = 0xB4;
    pub const STATUS_RANGE_READY: u8 = 0x04;
}

/// AT24C256: 32 KiB, 16-bit memory address, 64-byte pages
pub mod eeprom {
    pub const SIZE: usize = 32 * 1024;
    pub const PAGE_SIZE: usize = 64;
}

/// Time source and settling-delay provider for drivers.
///
/// Every protocol-mandated wait goes through `wait_ready`, so tests can run
/// the full acquisition cycle against a virtual clock.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Block until `duration` of settling time has elapsed.
    async fn wait_ready(&self, duration: Duration);
    /// Monotonic milliseconds since the clock was created.
    fn monotonic_ms(&self) -> u64;
    /// Wall-clock seconds since the Unix epoch, saturated to u32.
    fn unix_seconds(&self) -> u32;
}

/// Production clock backed by tokio timers
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    async fn wait_ready(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn unix_seconds(&self) -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        u32::try_from(secs).unwrap_or(u32::MAX)
    }
}

/// Clock that advances instantly by the requested amount on every wait
#[derive(Debug)]
pub struct VirtualClock {
    now_ms: AtomicU64,
    epoch_seconds: u32,
}

impl VirtualClock {
    pub fn new(epoch_seconds: u32) -> Self {
        Self {
            now_ms: AtomicU64::new(0),
            epoch_seconds,
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for VirtualClock {
    async fn wait_ready(&self, duration: Duration) {
        self.advance(duration);
    }

    fn monotonic_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn unix_seconds(&self) -> u32 {
        let elapsed = (self.monotonic_ms() / 1000).min(u32::MAX as u64) as u32;
        self.epoch_seconds.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_virtual_clock_advances_on_wait() {
        let clock = VirtualClock::new(1_700_000_000);
        clock.wait_ready(Duration::from_millis(1500)).await;
        clock.wait_ready(Duration::from_millis(100)).await;

        assert_eq!(clock.monotonic_ms(), 1600);
        assert_eq!(clock.unix_seconds(), 1_700_000_001);
    }

    #[test]
    fn test_config_word_fields_do_not_overlap() {
        let fixed = adc::CFG_OS_SINGLE | adc::CFG_PGA_4V | adc::CFG_MODE_SINGLE | adc::CFG_DR_128SPS;
        for mux in [adc::CFG_MUX_AIN0, adc::CFG_MUX_AIN1, adc::CFG_MUX_AIN2] {
            assert_eq!(fixed & mux, 0);
            assert_eq!(mux & !adc::CFG_MUX_MASK, 0);
        }
    }
}
