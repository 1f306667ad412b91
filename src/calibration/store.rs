use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::record::{CalibrationRecord, RECORD_SIZE};
use crate::bus::RegisterBus;
use crate::errors::{BusError, CalibrationError, CalibrationResult};
use crate::hal::{eeprom, Clock};
use crate::sensors::{Ads1115, AdcChannel};

/// Where the calibration in effect came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationSource {
    /// Loaded and validated from the EEPROM
    Stored,
    /// Compiled-in defaults; carries why the stored record was not used
    Defaults { reason: String },
    /// Freshly calibrated offsets that the EEPROM does not hold yet
    Unsaved { reason: String },
}

/// Owns the calibration record and its EEPROM image.
///
/// The in-memory record only changes on a successful `load` or through
/// `calibrate`; an invalid image is never applied.
pub struct CalibrationStore {
    address: u8,
    offset: u16,
    write_cycle: Duration,
    record: CalibrationRecord,
}

impl CalibrationStore {
    pub fn new(address: u8, offset: u16, write_cycle: Duration, record: CalibrationRecord) -> Self {
        Self {
            address,
            offset,
            write_cycle,
            record,
        }
    }

    pub fn record(&self) -> &CalibrationRecord {
        &self.record
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    async fn read_image(&self, bus: &mut dyn RegisterBus) -> CalibrationResult<[u8; RECORD_SIZE]> {
        bus.write_bytes(self.address, &self.offset.to_be_bytes()).await?;
        let mut image = [0u8; RECORD_SIZE];
        let n = bus.read_bytes(self.address, &mut image).await?;
        if n < RECORD_SIZE {
            return Err(CalibrationError::ShortRead {
                expected: RECORD_SIZE,
                actual: n,
            });
        }
        Ok(image)
    }

    /// Write `image` page by page, waiting out the write cycle after each.
    async fn write_image(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock, image: &[u8]) -> Result<(), BusError> {
        let mut written = 0;
        while written < image.len() {
            let mem_addr = self.offset as usize + written;
            let room = eeprom::PAGE_SIZE - mem_addr % eeprom::PAGE_SIZE;
            let chunk = room.min(image.len() - written);

            let mut frame = Vec::with_capacity(2 + chunk);
            frame.extend_from_slice(&(mem_addr as u16).to_be_bytes());
            frame.extend_from_slice(&image[written..written + chunk]);
            let result = bus.write_bytes(self.address, &frame).await;
            clock.wait_ready(self.write_cycle).await;
            result?;

            written += chunk;
        }
        Ok(())
    }

    async fn write_verified(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock, image: &[u8; RECORD_SIZE]) -> Result<(), String> {
        self.write_image(bus, clock, image).await.map_err(|e| e.to_string())?;
        let readback = self.read_image(bus).await.map_err(|e| e.to_string())?;
        if readback != *image {
            return Err("readback does not match written image".to_string());
        }
        Ok(())
    }

    /// Replace the in-memory record with the EEPROM image if it is valid.
    pub async fn load(&mut self, bus: &mut dyn RegisterBus) -> CalibrationResult<()> {
        let image = self.read_image(bus).await?;
        let candidate = CalibrationRecord::decode(&image);
        candidate.validate()?;
        debug!(
            "[calibration] loaded record v{} serial={}",
            candidate.version,
            candidate.serial_number()
        );
        self.record = candidate;
        Ok(())
    }

    /// Reseal the in-memory record and persist it.
    ///
    /// All-or-nothing from the caller's view: the prior image is read first
    /// and written back if the new image cannot be written and verified.
    pub async fn save(&mut self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> CalibrationResult<()> {
        let prior = match self.read_image(bus).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("[calibration] could not snapshot prior image, saving without rollback: {}", e);
                None
            }
        };

        self.record.seal();
        let image = self.record.encode();
        let Err(reason) = self.write_verified(bus, clock, &image).await else {
            info!("[calibration] record saved (checksum {:#06x})", self.record.checksum);
            return Ok(());
        };

        warn!("[calibration] save failed: {}", reason);
        if let Some(prior) = prior {
            match self.write_verified(bus, clock, &prior).await {
                Ok(()) => info!("[calibration] prior image restored"),
                Err(e) => error!("[calibration] rollback failed, stored image may be torn: {}", e),
            }
        }
        Err(CalibrationError::Persist { reason })
    }

    /// Derive photodiode offsets against a reference target and persist them.
    ///
    /// Takes `samples` readings of both photodiode channels, `interval`
    /// apart. On a persistence failure the new offsets stay in memory.
    pub async fn calibrate(
        &mut self,
        bus: &mut dyn RegisterBus,
        clock: &dyn Clock,
        adc: &Ads1115,
        reference_value: f32,
        samples: u32,
        interval: Duration,
    ) -> CalibrationResult<()> {
        let channels = [AdcChannel::Pd1, AdcChannel::Pd2];
        let mut sums = [0.0f64; 2];
        let mut counts = [0u32; 2];

        for i in 0..samples {
            for (slot, channel) in channels.iter().enumerate() {
                match adc.read_channel(bus, clock, *channel).await {
                    Ok(reading) => {
                        sums[slot] += reading.units as f64;
                        counts[slot] += 1;
                    }
                    Err(e) => warn!("[calibration] sample {} on channel {} skipped: {}", i, channel.index(), e),
                }
            }
            if i + 1 < samples {
                clock.wait_ready(interval).await;
            }
        }

        let mut averages = [0.0f32; 2];
        for (slot, channel) in channels.iter().enumerate() {
            let average = (sums[slot] / counts[slot] as f64) as f32;
            if counts[slot] == 0 || !average.is_finite() {
                return Err(CalibrationError::NonFinite { channel: channel.index() });
            }
            averages[slot] = average;
        }

        self.record.pd_offset1 = reference_value - averages[0];
        self.record.pd_offset2 = reference_value - averages[1];
        self.record.last_calibration_date = clock.unix_seconds();
        info!(
            "[calibration] offsets pd1={:.3} pd2={:.3} (reference {:.2})",
            self.record.pd_offset1, self.record.pd_offset2, reference_value
        );

        self.save(bus, clock).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::simulated::{SimulatedBus, SimulatedHandle};
    use crate::config::{CalibrationDefaults, DeviceAddresses};
    use crate::hal::VirtualClock;

    async fn setup() -> (SimulatedBus, SimulatedHandle, VirtualClock, CalibrationStore) {
        let mut bus = SimulatedBus::new(Some(11), DeviceAddresses::default());
        bus.initialize(1).await.unwrap();
        let handle = bus.handle();
        let record = CalibrationRecord::from_defaults(&CalibrationDefaults::default());
        let store = CalibrationStore::new(0x50, 0, Duration::from_millis(5), record);
        (bus, handle, VirtualClock::new(1_700_000_000), store)
    }

    fn adc() -> Ads1115 {
        Ads1115::new("ads1115".to_string(), 0x48, Duration::from_millis(9))
    }

    #[tokio::test]
    async fn test_blank_eeprom_is_rejected_and_defaults_kept() {
        let (mut bus, _, _, mut store) = setup().await;
        let before = store.record().clone();

        assert!(matches!(store.load(&mut bus).await, Err(CalibrationError::MagicMismatch { .. })));
        assert_eq!(store.record(), &before);
    }

    #[tokio::test]
    async fn test_save_then_load_restores_payload() {
        let (mut bus, _, clock, mut store) = setup().await;
        store.record.pd_offset1 = 12.5;
        store.record.set_serial_number("SN-42");
        store.save(&mut bus, &clock).await.unwrap();
        let saved = store.record().clone();

        let defaults = CalibrationRecord::from_defaults(&CalibrationDefaults::default());
        let mut fresh = CalibrationStore::new(0x50, 0, Duration::from_millis(5), defaults);
        fresh.load(&mut bus).await.unwrap();

        assert_eq!(fresh.record(), &saved);
        assert_eq!(fresh.record().serial_number(), "SN-42");
    }

    #[tokio::test]
    async fn test_short_read_is_rejected() {
        let (mut bus, handle, clock, mut store) = setup().await;
        store.save(&mut bus, &clock).await.unwrap();
        handle.set_eeprom_short_read(Some(40));

        assert!(matches!(
            store.load(&mut bus).await,
            Err(CalibrationError::ShortRead { expected: 64, actual: 40 })
        ));
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_prior_image() {
        let (mut bus, handle, clock, mut store) = setup().await;
        store.save(&mut bus, &clock).await.unwrap();
        let persisted = handle.eeprom_bytes(0, RECORD_SIZE);

        store.record.pd_offset1 = 99.0;
        handle.fail_next_eeprom_writes(1);
        assert!(matches!(store.save(&mut bus, &clock).await, Err(CalibrationError::Persist { .. })));

        assert_eq!(handle.eeprom_bytes(0, RECORD_SIZE), persisted);
        assert_eq!(store.record().pd_offset1, 99.0);
    }

    #[tokio::test]
    async fn test_unaligned_offset_splits_page_writes() {
        let (mut bus, handle, clock, _) = setup().await;
        let record = CalibrationRecord::from_defaults(&CalibrationDefaults::default());
        let mut store = CalibrationStore::new(0x50, 0x30, Duration::from_millis(5), record);

        store.save(&mut bus, &clock).await.unwrap();

        // 16 bytes up to the page boundary, then the remaining 48
        assert_eq!(handle.eeprom_page_writes(), 2);
        store.load(&mut bus).await.unwrap();
    }

    #[tokio::test]
    async fn test_calibrate_sets_offsets_from_average() {
        let (mut bus, handle, clock, mut store) = setup().await;
        // codes alternate around 90.0 units on channel 0 and sit at 100.0 on channel 1
        handle.push_adc_codes(0, [-2667, -2666].repeat(5));
        handle.push_adc_codes(1, [0; 10]);

        store
            .calibrate(&mut bus, &clock, &adc(), 100.0, 10, Duration::from_millis(100))
            .await
            .unwrap();

        assert!((store.record().pd_offset1 - 10.0).abs() < 0.01);
        assert!(store.record().pd_offset2.abs() < 1e-4);
        assert!(store.record().last_calibration_date >= 1_700_000_000);
        assert!(store.record().is_valid());
        // 9 intervals, 20 conversions and one page write cycle per save attempt
        assert!(clock.monotonic_ms() >= 900 + 20 * 9);
    }

    #[tokio::test]
    async fn test_calibrate_keeps_offsets_when_persist_fails() {
        let (mut bus, handle, clock, mut store) = setup().await;
        handle.push_adc_codes(0, [-2667, -2666].repeat(5));
        handle.fail_next_eeprom_writes(2);

        let result = store
            .calibrate(&mut bus, &clock, &adc(), 100.0, 10, Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(CalibrationError::Persist { .. })));
        assert!((store.record().pd_offset1 - 10.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_calibrate_without_adc_reports_non_finite() {
        let (mut bus, handle, clock, mut store) = setup().await;
        handle.set_absent(0x48, true);
        let before = store.record().clone();

        let result = store
            .calibrate(&mut bus, &clock, &adc(), 100.0, 3, Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(CalibrationError::NonFinite { channel: 0 })));
        assert_eq!(store.record(), &before);
    }
}
