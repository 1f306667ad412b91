#[cfg(target_os = "linux")]
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
#[cfg(target_os = "linux")]
use i2cdev::core::I2CDevice;
#[cfg(target_os = "linux")]
use async_trait::async_trait;
#[cfg(target_os = "linux")]
use tracing::{debug, trace};

#[cfg(target_os = "linux")]
use super::RegisterBus;
#[cfg(target_os = "linux")]
use crate::errors::{BusError, BusResult};

/// I2C bus error type - platform specific
#[cfg(target_os = "linux")]
pub type I2CError = LinuxI2CError;

#[cfg(not(target_os = "linux"))]
#[derive(Debug)]
pub struct I2CError(pub String);

#[cfg(not(target_os = "linux"))]
impl std::fmt::Display for I2CError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I2C not supported on this platform: {}", self.0)
    }
}

#[cfg(not(target_os = "linux"))]
impl std::error::Error for I2CError {}

/// `/dev/i2c-N` register bus
#[cfg(target_os = "linux")]
pub struct LinuxI2cBus {
    device: Option<LinuxI2CDevice>,
    path: String,
    current_address: Option<u8>,
}

#[cfg(target_os = "linux")]
impl LinuxI2cBus {
    pub fn new() -> Self {
        Self {
            device: None,
            path: String::new(),
            current_address: None,
        }
    }

    /// Device node path once initialized, e.g. `/dev/i2c-1`
    pub fn path(&self) -> &str {
        &self.path
    }

    fn select(&mut self, address: u8) -> BusResult<&mut LinuxI2CDevice> {
        let device = self.device.as_mut().ok_or_else(|| BusError::NotInitialized {
            bus: self.path.clone(),
        })?;
        if self.current_address != Some(address) {
            device.set_slave_address(address as u16)?;
            self.current_address = Some(address);
        }
        Ok(device)
    }
}

#[cfg(target_os = "linux")]
impl Default for LinuxI2cBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl RegisterBus for LinuxI2cBus {
    async fn initialize(&mut self, bus_id: u8) -> BusResult<()> {
        let path = format!("/dev/i2c-{}", bus_id);
        let device = LinuxI2CDevice::new(&path, 0)?;
        debug!("[i2c] opened {}", path);
        self.device = Some(device);
        self.path = path;
        self.current_address = None;
        Ok(())
    }

    async fn cleanup(&mut self) {
        if self.device.take().is_some() {
            debug!("[i2c] closed {}", self.path);
        }
        self.current_address = None;
    }

    async fn write_register(&mut self, address: u8, reg: u8, value: u8) -> BusResult<()> {
        trace!("[i2c] {:#04x} <- reg {:#04x} = {:#04x}", address, reg, value);
        self.select(address)?.smbus_write_byte_data(reg, value)?;
        Ok(())
    }

    async fn write_register16(&mut self, address: u8, reg: u8, value: u16) -> BusResult<()> {
        trace!("[i2c] {:#04x} <- reg {:#04x} = {:#06x}", address, reg, value);
        let [msb, lsb] = value.to_be_bytes();
        self.select(address)?.write(&[reg, msb, lsb])?;
        Ok(())
    }

    async fn read_register(&mut self, address: u8, reg: u8) -> BusResult<u8> {
        Ok(self.select(address)?.smbus_read_byte_data(reg)?)
    }

    async fn read_register16(&mut self, address: u8, reg: u8) -> BusResult<u16> {
        let device = self.select(address)?;
        device.write(&[reg])?;
        let mut buf = [0u8; 2];
        device.read(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    async fn write_bytes(&mut self, address: u8, data: &[u8]) -> BusResult<()> {
        trace!("[i2c] {:#04x} <- {} byte(s)", address, data.len());
        self.select(address)?.write(data)?;
        Ok(())
    }

    async fn read_bytes(&mut self, address: u8, buf: &mut [u8]) -> BusResult<usize> {
        // i2c-dev either fills the whole buffer or fails the transfer
        self.select(address)?.read(buf)?;
        Ok(buf.len())
    }

    async fn is_present(&mut self, address: u8) -> bool {
        match self.select(address) {
            Ok(device) => device.smbus_read_byte().is_ok(),
            Err(_) => false,
        }
    }
}
