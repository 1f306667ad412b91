//! Persistent, checksum-protected calibration data.

pub mod record;
pub mod store;

pub use record::{crc16_ccitt, CalibrationRecord, RECORD_MAGIC, RECORD_SIZE};
pub use store::{CalibrationSource, CalibrationStore};
