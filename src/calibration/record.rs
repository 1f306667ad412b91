use crc::{Crc, CRC_16_IBM_3740};

use crate::config::CalibrationDefaults;
use crate::errors::{CalibrationError, CalibrationResult};

/// "TH30" packed big-endian
pub const RECORD_MAGIC: u32 = u32::from_be_bytes(*b"TH30");
/// Encoded size: 4 + 2 + 2 + 8 * 4 + 16 + 4 + 4
pub const RECORD_SIZE: usize = 64;

const CHECKSUM_RANGE: std::ops::Range<usize> = 6..8;

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no final XOR)
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16_ccitt(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Device-specific tuning data as stored in the EEPROM.
///
/// The on-EEPROM image is an explicit big-endian encoding in declaration
/// order; it never depends on the host's struct layout.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub magic: u32,
    pub version: u16,
    pub checksum: u16,
    pub pd_offset1: f32,
    pub pd_offset2: f32,
    pub moisture_scale: f32,
    pub moisture_offset: f32,
    pub elasticity_scale: f32,
    pub elasticity_offset: f32,
    pub thickness_scale: f32,
    pub thickness_offset: f32,
    pub serial_number: [u8; 16],
    pub manufacturing_date: u32,
    pub last_calibration_date: u32,
}

impl CalibrationRecord {
    /// Compiled-in defaults, already sealed with a valid checksum.
    pub fn from_defaults(defaults: &CalibrationDefaults) -> Self {
        let mut record = Self {
            magic: RECORD_MAGIC,
            version: defaults.version,
            checksum: 0,
            pd_offset1: defaults.pd_offset1,
            pd_offset2: defaults.pd_offset2,
            moisture_scale: defaults.moisture_scale,
            moisture_offset: defaults.moisture_offset,
            elasticity_scale: defaults.elasticity_scale,
            elasticity_offset: defaults.elasticity_offset,
            thickness_scale: defaults.thickness_scale,
            thickness_offset: defaults.thickness_offset,
            serial_number: [0; 16],
            manufacturing_date: 0,
            last_calibration_date: 0,
        };
        record.set_serial_number(&defaults.serial_number);
        record.seal();
        record
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            out[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };

        put(&self.magic.to_be_bytes());
        put(&self.version.to_be_bytes());
        put(&self.checksum.to_be_bytes());
        for value in [
            self.pd_offset1,
            self.pd_offset2,
            self.moisture_scale,
            self.moisture_offset,
            self.elasticity_scale,
            self.elasticity_offset,
            self.thickness_scale,
            self.thickness_offset,
        ] {
            put(&value.to_be_bytes());
        }
        put(&self.serial_number);
        put(&self.manufacturing_date.to_be_bytes());
        put(&self.last_calibration_date.to_be_bytes());
        out
    }

    /// Decode an image without validating it; see `validate`.
    pub fn decode(image: &[u8; RECORD_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_be_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]);
        let u16_at = |at: usize| u16::from_be_bytes([image[at], image[at + 1]]);
        let f32_at = |at: usize| f32::from_bits(u32_at(at));

        let mut serial_number = [0u8; 16];
        serial_number.copy_from_slice(&image[40..56]);

        Self {
            magic: u32_at(0),
            version: u16_at(4),
            checksum: u16_at(6),
            pd_offset1: f32_at(8),
            pd_offset2: f32_at(12),
            moisture_scale: f32_at(16),
            moisture_offset: f32_at(20),
            elasticity_scale: f32_at(24),
            elasticity_offset: f32_at(28),
            thickness_scale: f32_at(32),
            thickness_offset: f32_at(36),
            serial_number,
            manufacturing_date: u32_at(56),
            last_calibration_date: u32_at(60),
        }
    }

    /// Checksum over the full image with the checksum field zeroed.
    pub fn compute_checksum(&self) -> u16 {
        let mut image = self.encode();
        image[CHECKSUM_RANGE].fill(0);
        crc16_ccitt(&image)
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = self.compute_checksum();
    }

    pub fn validate(&self) -> CalibrationResult<()> {
        if self.magic != RECORD_MAGIC {
            return Err(CalibrationError::MagicMismatch {
                expected: RECORD_MAGIC,
                actual: self.magic,
            });
        }
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(CalibrationError::ChecksumMismatch {
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Serial number as text, up to the first NUL
    pub fn serial_number(&self) -> String {
        let end = self.serial_number.iter().position(|b| *b == 0).unwrap_or(self.serial_number.len());
        String::from_utf8_lossy(&self.serial_number[..end]).into_owned()
    }

    /// Store `serial` NUL-padded, truncated to 16 bytes. Does not reseal.
    pub fn set_serial_number(&mut self, serial: &str) {
        self.serial_number = [0; 16];
        let bytes = serial.as_bytes();
        let len = bytes.len().min(16);
        self.serial_number[..len].copy_from_slice(&bytes[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CalibrationRecord {
        let mut record = CalibrationRecord::from_defaults(&CalibrationDefaults::default());
        record.pd_offset1 = 10.0;
        record.pd_offset2 = -3.25;
        record.moisture_scale = 1.05;
        record.thickness_offset = 0.5;
        record.set_serial_number("THE3-0001234");
        record.manufacturing_date = 1_690_000_000;
        record.last_calibration_date = 1_700_000_000;
        record.seal();
        record
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_magic_constant() {
        assert_eq!(RECORD_MAGIC, 0x5448_3330);
    }

    #[test]
    fn test_layout_offsets() {
        let image = sample().encode();
        assert_eq!(&image[0..4], b"TH30");
        assert_eq!(&image[4..6], &1u16.to_be_bytes());
        assert_eq!(&image[8..12], &10.0f32.to_be_bytes());
        assert_eq!(&image[40..52], b"THE3-0001234");
        assert_eq!(&image[56..60], &1_690_000_000u32.to_be_bytes());
        assert_eq!(&image[60..64], &1_700_000_000u32.to_be_bytes());
    }

    #[test]
    fn test_encode_decode_is_bit_exact() {
        let record = sample();
        let decoded = CalibrationRecord::decode(&record.encode());
        assert_eq!(decoded, record);
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_checksum_ignores_its_own_field() {
        let mut record = sample();
        let first = record.compute_checksum();
        record.checksum = 0xDEAD;
        assert_eq!(record.compute_checksum(), first);
        assert_eq!(record.compute_checksum(), first);
    }

    #[test]
    fn test_every_single_byte_flip_is_detected() {
        let image = sample().encode();
        for i in 0..RECORD_SIZE {
            let mut tampered = image;
            tampered[i] ^= 0x01;
            assert!(
                CalibrationRecord::decode(&tampered).validate().is_err(),
                "flip at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_zeroed_magic_is_rejected_first() {
        let mut record = sample();
        record.magic = 0;
        assert!(matches!(record.validate(), Err(CalibrationError::MagicMismatch { actual: 0, .. })));
    }

    #[test]
    fn test_serial_number_truncates_and_stops_at_nul() {
        let mut record = sample();
        record.set_serial_number("0123456789ABCDEFXYZ");
        assert_eq!(record.serial_number(), "0123456789ABCDEF");
        record.set_serial_number("SN1");
        assert_eq!(record.serial_number(), "SN1");
    }
}
