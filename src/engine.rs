use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bus::{DigitalIo, Direction, Edge, EdgeEvent, RegisterBus};
use crate::calibration::{CalibrationRecord, CalibrationSource, CalibrationStore};
use crate::config::{EngineConfig, Peripheral};
use crate::errors::{BusResult, CalibrationError, CalibrationResult, EngineError, EngineResult};
use crate::hal::Clock;
use crate::messages::{DeviceHealth, Measurement, PatientInfo};
use crate::pipeline::{self, DeriveParams, SensorSet};
use crate::sensors::{Ads1115, SensorDriver, Sht31, Vl6180x};
use crate::treatment::{TreatmentMode, TreatmentRecord};

/// Skin analysis engine.
///
/// Exclusively owns one register bus and one digital I/O controller for
/// its whole life. Every operation runs its bus transfers strictly in
/// sequence; callers that need concurrency serialize access to the engine.
pub struct SkinEngine {
    config: EngineConfig,
    bus: Box<dyn RegisterBus>,
    gpio: Box<dyn DigitalIo>,
    clock: Arc<dyn Clock>,
    sensors: SensorSet,
    store: CalibrationStore,
    calibration_source: CalibrationSource,
    patient: PatientInfo,
    last_temperature: Option<f32>,
    ready: bool,
}

impl SkinEngine {
    /// Bring up the buses, power the sensors, probe the mandatory
    /// peripherals and load the calibration record.
    ///
    /// A missing mandatory peripheral aborts with `HardwareAbsent`. An
    /// invalid or unreadable record falls back to the configured defaults.
    pub async fn initialize(
        config: EngineConfig,
        mut bus: Box<dyn RegisterBus>,
        mut gpio: Box<dyn DigitalIo>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        info!("[engine] initializing device {}", config.device.id);

        bus.initialize(config.device.i2c_bus).await.map_err(EngineError::BusInit)?;
        if let Err(e) = gpio.initialize().await {
            bus.cleanup().await;
            return Err(EngineError::BusInit(e));
        }

        let timing = config.timing;
        let addrs = config.addresses;
        let sensors = SensorSet {
            adc: Ads1115::new("ads1115".to_string(), addrs.adc, timing.adc_settle()),
            climate: Sht31::new(
                "sht31".to_string(),
                addrs.moisture,
                timing.moisture_measure(),
                config.verify_sensor_crc,
            ),
            tof: Vl6180x::new("vl6180x".to_string(), addrs.elasticity, timing.tof_poll(), timing.tof_max_polls),
        };
        let store = CalibrationStore::new(
            addrs.eeprom,
            config.calibration.eeprom_offset,
            timing.eeprom_write_cycle(),
            CalibrationRecord::from_defaults(&config.calibration),
        );

        let mut engine = Self {
            config,
            bus,
            gpio,
            clock,
            sensors,
            store,
            calibration_source: CalibrationSource::Defaults {
                reason: "not loaded yet".to_string(),
            },
            patient: PatientInfo::default(),
            last_temperature: None,
            ready: false,
        };

        if let Err(e) = engine.bring_up().await {
            engine.release().await;
            return Err(e);
        }
        engine.ready = true;
        info!("[engine] ready (calibration: {:?})", engine.calibration_source);
        Ok(engine)
    }

    async fn bring_up(&mut self) -> EngineResult<()> {
        let pins = self.config.pins;
        for pin in [pins.sensor_power, pins.power_led, pins.status_led, pins.error_led] {
            self.gpio
                .set_direction(pin, Direction::Output)
                .await
                .map_err(EngineError::BusInit)?;
        }
        self.gpio.write(pins.status_led, false).await.map_err(EngineError::BusInit)?;
        self.gpio.write(pins.error_led, false).await.map_err(EngineError::BusInit)?;
        self.gpio.write(pins.sensor_power, true).await.map_err(EngineError::BusInit)?;
        self.clock.wait_ready(self.config.timing.power_up()).await;
        debug!("[engine] sensor power asserted on pin {}", pins.sensor_power);

        let clock = self.clock.clone();
        let drivers: [(Peripheral, &mut dyn SensorDriver); 3] = [
            (Peripheral::Adc, &mut self.sensors.adc),
            (Peripheral::Moisture, &mut self.sensors.climate),
            (Peripheral::Elasticity, &mut self.sensors.tof),
        ];
        for (peripheral, driver) in drivers {
            let mandatory = self.config.device.mandatory.contains(&peripheral);
            if !driver.is_present(self.bus.as_mut()).await {
                if mandatory {
                    error!("[engine] mandatory {} missing at {:#04x}", peripheral.name(), driver.address());
                    return Err(EngineError::HardwareAbsent {
                        peripheral: peripheral.name().to_string(),
                        address: driver.address(),
                    });
                }
                warn!("[engine] optional {} missing, its readings will degrade", peripheral.name());
                continue;
            }
            match driver.init(self.bus.as_mut(), clock.as_ref()).await {
                Ok(()) => debug!("[engine] {} initialized", driver.id()),
                Err(source) if mandatory => {
                    return Err(EngineError::SensorSetup {
                        sensor: driver.id().to_string(),
                        source,
                    })
                }
                Err(e) => warn!("[engine] optional {} failed to initialize: {}", driver.id(), e),
            }
        }

        let eeprom = self.store.address();
        if !self.bus.is_present(eeprom).await {
            if self.config.device.mandatory.contains(&Peripheral::Eeprom) {
                error!("[engine] mandatory EEPROM missing at {:#04x}", eeprom);
                return Err(EngineError::HardwareAbsent {
                    peripheral: Peripheral::Eeprom.name().to_string(),
                    address: eeprom,
                });
            }
            warn!("[engine] EEPROM missing, using default calibration");
            self.calibration_source = CalibrationSource::Defaults {
                reason: format!("EEPROM not present at {:#04x}", eeprom),
            };
        } else {
            self.reload_calibration().await;
        }

        self.gpio.write(pins.power_led, true).await.map_err(EngineError::BusInit)?;
        Ok(())
    }

    /// Re-read the stored record; keeps the current one if it is invalid.
    pub async fn reload_calibration(&mut self) -> &CalibrationSource {
        self.calibration_source = match self.store.load(self.bus.as_mut()).await {
            Ok(()) => {
                info!("[engine] calibration loaded, serial {}", self.serial_number());
                CalibrationSource::Stored
            }
            Err(e) => {
                warn!("[engine] stored calibration rejected, using defaults: {}", e);
                CalibrationSource::Defaults { reason: e.to_string() }
            }
        };
        &self.calibration_source
    }

    async fn set_led(&mut self, pin: u8, on: bool) {
        if let Err(e) = self.gpio.write(pin, on).await {
            warn!("[engine] LED on pin {} not updated: {}", pin, e);
        }
    }

    /// Run one acquisition cycle. Always returns a measurement; fields whose
    /// reads failed are degraded to zero.
    pub async fn acquire(&mut self) -> Measurement {
        let status_led = self.config.pins.status_led;
        self.set_led(status_led, true).await;

        let raw = self.sensors.sample(self.bus.as_mut(), self.clock.as_ref()).await;
        if raw.is_degraded() {
            warn!("[engine] measurement contains degraded fields");
        }
        if let Some(climate) = &raw.climate {
            self.last_temperature = Some(climate.temperature_c);
        }

        let params = DeriveParams {
            compensation: self.config.compensation,
            moisture: self.config.moisture,
            measurement_hz: self.config.measurement_hz,
        };
        let measurement = pipeline::derive(
            &raw,
            self.store.record(),
            &params,
            self.patient.clone(),
            self.clock.monotonic_ms(),
        );

        self.set_led(status_led, false).await;
        debug!(
            "[engine] moisture={:.2} ({}) elasticity={:.2} ({}) thickness={:.2} ({})",
            measurement.moisture_level,
            measurement.moisture_level_result,
            measurement.s2,
            measurement.elasticity_result,
            measurement.s3,
            measurement.thickness_result
        );
        measurement
    }

    /// Presence probe of all four monitored peripherals. Drives the error
    /// LED from the result.
    pub async fn self_test(&mut self) -> DeviceHealth {
        let mut health = DeviceHealth::healthy();
        for peripheral in Peripheral::ALL {
            if !self.bus.is_present(self.config.addresses.of(peripheral)).await {
                health.mark_absent(peripheral);
            }
        }

        if health.is_healthy() {
            info!("[engine] self-test: {}", health);
        } else {
            warn!("[engine] self-test: {}", health);
        }
        let error_led = self.config.pins.error_led;
        self.set_led(error_led, !health.is_healthy()).await;
        health
    }

    /// Derive photodiode offsets against `reference_value` and persist them.
    /// On a persist failure the new offsets stay in effect in memory.
    pub async fn calibrate(&mut self, reference_value: f32) -> CalibrationResult<()> {
        let status_led = self.config.pins.status_led;
        let samples = self.config.calibration.samples;
        let interval = std::time::Duration::from_millis(self.config.calibration.sample_interval_ms);

        self.set_led(status_led, true).await;
        let result = self
            .store
            .calibrate(
                self.bus.as_mut(),
                self.clock.as_ref(),
                &self.sensors.adc,
                reference_value,
                samples,
                interval,
            )
            .await;
        self.set_led(status_led, false).await;

        match &result {
            Ok(()) => self.calibration_source = CalibrationSource::Stored,
            Err(e @ CalibrationError::Persist { .. }) => {
                warn!("[engine] new offsets in effect but not persisted: {}", e);
                self.calibration_source = CalibrationSource::Unsaved { reason: e.to_string() };
            }
            Err(e) => warn!("[engine] calibration incomplete: {}", e),
        }
        result
    }

    /// `calibrate` against the configured reference value.
    pub async fn calibrate_default(&mut self) -> CalibrationResult<()> {
        let reference_value = self.config.calibration.reference_value;
        self.calibrate(reference_value).await
    }

    /// Persist the in-memory record as is.
    pub async fn save_calibration(&mut self) -> CalibrationResult<()> {
        self.store.save(self.bus.as_mut(), self.clock.as_ref()).await?;
        self.calibration_source = CalibrationSource::Stored;
        Ok(())
    }

    /// Subscribe to the ADC data-ready line (active low).
    pub async fn watch_data_ready(&mut self) -> BusResult<broadcast::Receiver<EdgeEvent>> {
        self.gpio.subscribe_edge(self.config.pins.adc_drdy, Edge::Falling).await
    }

    pub fn set_patient_info(&mut self, name: &str, birth_date: &str) {
        self.patient = PatientInfo {
            name: name.to_string(),
            birth_date: birth_date.to_string(),
        };
    }

    pub fn patient(&self) -> &PatientInfo {
        &self.patient
    }

    /// A treatment session record with the mode's factory settings
    pub fn create_treatment(&self, mode: TreatmentMode) -> TreatmentRecord {
        TreatmentRecord::new(mode, self.patient.clone(), self.clock.monotonic_ms())
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationRecord {
        self.store.record()
    }

    pub fn calibration_source(&self) -> &CalibrationSource {
        &self.calibration_source
    }

    pub fn serial_number(&self) -> String {
        self.store.record().serial_number()
    }

    /// Temperature of the last cycle whose climate read succeeded
    pub fn last_temperature(&self) -> Option<f32> {
        self.last_temperature
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    async fn release(&mut self) {
        let pins = self.config.pins;
        for pin in [pins.status_led, pins.error_led, pins.power_led] {
            let _ = self.gpio.write(pin, false).await;
        }
        if let Err(e) = self.gpio.write(pins.sensor_power, false).await {
            warn!("[engine] could not deassert sensor power: {}", e);
        }
        self.gpio.cleanup().await;
        self.bus.cleanup().await;
        self.ready = false;
    }

    /// LEDs off, sensor power off, then release the digital I/O and the bus.
    pub async fn shutdown(mut self) {
        info!("[engine] shutting down {}", self.config.device.id);
        self.release().await;
    }
}
