use std::sync::Arc;

use skin_sensorhub::bus::simulated::{SimulatedBus, SimulatedGpio, SimulatedHandle};
use skin_sensorhub::calibration::{CalibrationRecord, CalibrationSource, RECORD_MAGIC, RECORD_SIZE};
use skin_sensorhub::config::{EngineConfig, Peripheral};
use skin_sensorhub::errors::{CalibrationError, EngineError, EngineResult};
use skin_sensorhub::hal::{Clock, VirtualClock};
use skin_sensorhub::messages::{ElasticityResult, MoistureLevelResult, ThicknessResult};
use skin_sensorhub::treatment::TreatmentMode;
use skin_sensorhub::SkinEngine;

struct Rig {
    engine: SkinEngine,
    sim: SimulatedHandle,
    gpio: SimulatedGpio,
    clock: Arc<VirtualClock>,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.device.seed = Some(42);
    config
}

async fn try_rig(config: EngineConfig, prepare: impl FnOnce(&SimulatedHandle)) -> (EngineResult<SkinEngine>, SimulatedHandle, SimulatedGpio, Arc<VirtualClock>) {
    let bus = SimulatedBus::new(config.device.seed, config.addresses);
    let sim = bus.handle();
    prepare(&sim);
    let gpio = SimulatedGpio::new();
    let clock = Arc::new(VirtualClock::new(1_700_000_000));
    let result = SkinEngine::initialize(config, Box::new(bus), Box::new(gpio.clone()), clock.clone()).await;
    (result, sim, gpio, clock)
}

async fn rig_with(config: EngineConfig, prepare: impl FnOnce(&SimulatedHandle)) -> Rig {
    let (result, sim, gpio, clock) = try_rig(config, prepare).await;
    Rig {
        engine: result.unwrap(),
        sim,
        gpio,
        clock,
    }
}

async fn rig() -> Rig {
    rig_with(test_config(), |_| {}).await
}

fn stored_record(sim: &SimulatedHandle) -> CalibrationRecord {
    let image: [u8; RECORD_SIZE] = sim.eeprom_bytes(0, RECORD_SIZE).try_into().unwrap();
    CalibrationRecord::decode(&image)
}

fn programmed_record() -> CalibrationRecord {
    let mut record = CalibrationRecord::from_defaults(&EngineConfig::default().calibration);
    record.pd_offset1 = 5.0;
    record.set_serial_number("THE3-SN-000042");
    record.manufacturing_date = 1_690_000_000;
    record.seal();
    record
}

#[tokio::test]
async fn adc_code_20000_reports_pd1_of_175() {
    let mut rig = rig().await;
    rig.sim.push_adc_codes(0, [20000]);

    let measurement = rig.engine.acquire().await;

    assert!((measurement.pd1 - 175.0).abs() < 1e-3);
    assert_eq!(measurement.raw_codes.pd1, 20000);
    assert_eq!(measurement.to_payload(rig.engine.device_id()).pd1, "175.00");
}

#[tokio::test]
async fn blank_eeprom_falls_back_to_defaults() {
    let rig = rig().await;

    assert!(rig.engine.is_ready());
    assert!(matches!(rig.engine.calibration_source(), CalibrationSource::Defaults { .. }));
    assert_eq!(rig.engine.serial_number(), "UNPROGRAMMED");
}

#[tokio::test]
async fn valid_record_is_loaded_at_startup() {
    let record = programmed_record();
    let rig = rig_with(test_config(), |sim| sim.write_eeprom(0, &record.encode())).await;

    assert_eq!(rig.engine.calibration_source(), &CalibrationSource::Stored);
    assert_eq!(rig.engine.calibration(), &record);
    assert_eq!(rig.engine.serial_number(), "THE3-SN-000042");
}

#[tokio::test]
async fn record_with_zeroed_magic_is_rejected() {
    let mut record = programmed_record();
    record.magic = 0;
    record.seal();
    let rig = rig_with(test_config(), |sim| sim.write_eeprom(0, &record.encode())).await;

    assert!(matches!(rig.engine.calibration_source(), CalibrationSource::Defaults { .. }));
    assert_eq!(rig.engine.calibration().magic, RECORD_MAGIC);
    assert_eq!(rig.engine.calibration().pd_offset1, 0.0);
}

#[tokio::test]
async fn tampered_record_leaves_defaults_in_effect() {
    let image = programmed_record().encode();
    for offset in [0, 5, 9, 30, 45, 63] {
        let rig = rig_with(test_config(), |sim| {
            sim.write_eeprom(0, &image);
            sim.flip_eeprom_byte(offset);
        })
        .await;

        assert!(
            matches!(rig.engine.calibration_source(), CalibrationSource::Defaults { .. }),
            "tamper at byte {} was accepted",
            offset
        );
        assert_eq!(rig.engine.calibration().pd_offset1, 0.0);
    }
}

#[tokio::test]
async fn elasticity_75_is_good_and_thickness_60_is_thick() {
    let mut config = test_config();
    config.calibration.elasticity_offset = 15.0;
    let mut rig = rig_with(config, |sim| {
        // 25 mm ranges to an elasticity of 60
        sim.set_tof_range(25);
        // about 60 units on the thickness channel
        sim.push_adc_codes(2, [-10667]);
    })
    .await;

    let measurement = rig.engine.acquire().await;

    assert_eq!(measurement.s2, 75.0);
    assert_eq!(measurement.elasticity_result, ElasticityResult::Good);
    assert!((measurement.s3 - 60.0).abs() < 0.01);
    assert_eq!(measurement.thickness_result, ThicknessResult::Thick);
}

#[tokio::test]
async fn moisture_is_compensated_ten_degrees_above_reference() {
    let mut rig = rig_with(test_config(), |sim| sim.set_climate(35.0, 50.0)).await;

    let measurement = rig.engine.acquire().await;

    assert!((measurement.ambient_temperature_c - 35.0).abs() < 0.01);
    assert!((measurement.s1 - 40.0).abs() < 0.05);
    assert!((measurement.moisture_level - 48.0).abs() < 0.1);
    assert_eq!(measurement.moisture_level_result, MoistureLevelResult::SlightlyDry);
    assert_eq!(rig.engine.last_temperature().map(|t| (t - 35.0).abs() < 0.01), Some(true));
}

#[tokio::test]
async fn compensation_is_identity_at_reference_temperature() {
    let mut rig = rig_with(test_config(), |sim| sim.set_climate(25.0, 50.0)).await;

    let measurement = rig.engine.acquire().await;

    // code rounding keeps the temperature within a few thousandths of 25
    assert!((measurement.s1 - 50.0).abs() < 0.01);
}

#[tokio::test]
async fn calibrate_derives_offset_and_persists() {
    let mut rig = rig().await;
    rig.sim.push_adc_codes(0, [-2667, -2666].repeat(5));
    rig.sim.push_adc_codes(1, [0; 10]);

    rig.engine.calibrate(100.0).await.unwrap();

    assert!((rig.engine.calibration().pd_offset1 - 10.0).abs() < 0.01);
    assert_eq!(rig.engine.calibration_source(), &CalibrationSource::Stored);

    let persisted = stored_record(&rig.sim);
    assert!(persisted.is_valid());
    assert_eq!(&persisted, rig.engine.calibration());
    assert!(persisted.last_calibration_date >= 1_700_000_000);
}

#[tokio::test]
async fn calibrate_keeps_offsets_when_eeprom_write_fails() {
    let mut rig = rig().await;
    rig.sim.push_adc_codes(0, [-2667, -2666].repeat(5));
    rig.sim.fail_next_eeprom_writes(1);

    let result = rig.engine.calibrate(100.0).await;

    assert!(matches!(result, Err(CalibrationError::Persist { .. })));
    assert!((rig.engine.calibration().pd_offset1 - 10.0).abs() < 0.01);
    assert!(matches!(rig.engine.calibration_source(), CalibrationSource::Unsaved { .. }));
    // the rollback restored the blank image
    assert!(rig.sim.eeprom_bytes(0, RECORD_SIZE).iter().all(|b| *b == 0xFF));
}

#[tokio::test]
async fn calibrate_default_uses_configured_reference() {
    let mut config = test_config();
    config.calibration.reference_value = 50.0;
    let mut rig = rig_with(config, |_| {}).await;
    // -2667/-2666 read as roughly 90 units
    rig.sim.push_adc_codes(0, [-2667, -2666].repeat(5));
    rig.sim.push_adc_codes(1, [0; 10]);

    rig.engine.calibrate_default().await.unwrap();

    assert!((rig.engine.calibration().pd_offset1 + 40.0).abs() < 0.01);
    assert_eq!(rig.engine.calibration_source(), &CalibrationSource::Stored);
}

#[tokio::test]
async fn inverted_moisture_bounds_are_rejected_at_startup() {
    let mut config = test_config();
    config.moisture.min = 100.0;
    config.moisture.max = 0.0;

    let (result, _sim, gpio, _clock) = try_rig(config, |_| {}).await;

    assert!(matches!(result, Err(EngineError::Config(_))));
    assert!(!gpio.pin(EngineConfig::default().pins.sensor_power).level);
}

#[tokio::test]
async fn moisture_level_is_clamped_for_pathological_inputs() {
    let mut high = test_config();
    high.calibration.moisture_scale = 10.0;
    let mut rig = rig_with(high, |_| {}).await;
    let m = rig.engine.acquire().await;
    assert_eq!(m.moisture_level, 100.0);
    assert_eq!(m.moisture_level_result, MoistureLevelResult::Hydrated);

    let mut low = test_config();
    low.calibration.moisture_offset = -1000.0;
    let mut rig = rig_with(low, |_| {}).await;
    let m = rig.engine.acquire().await;
    assert_eq!(m.moisture_level, 0.0);
    assert_eq!(m.moisture_level_result, MoistureLevelResult::Dry);
}

#[tokio::test]
async fn self_test_bits_are_independent() {
    let mut rig = rig().await;
    assert!(rig.engine.self_test().await.is_healthy());
    assert!(!rig.gpio.pin(rig.engine.config().pins.error_led).level);

    for peripheral in Peripheral::ALL {
        let address = rig.engine.config().addresses.of(peripheral);
        rig.sim.set_absent(address, true);

        let health = rig.engine.self_test().await;
        assert_eq!(health.bits(), peripheral.bit(), "{}", peripheral.name());
        assert!(rig.gpio.pin(rig.engine.config().pins.error_led).level);

        rig.sim.set_absent(address, false);
    }

    for peripheral in Peripheral::ALL {
        rig.sim.set_absent(rig.engine.config().addresses.of(peripheral), true);
    }
    assert_eq!(rig.engine.self_test().await.bits(), 0x0F);
}

#[tokio::test]
async fn missing_mandatory_adc_aborts_initialization() {
    let (result, _, gpio, _) = try_rig(test_config(), |sim| sim.set_absent(0x48, true)).await;

    assert!(matches!(result, Err(EngineError::HardwareAbsent { address: 0x48, .. })));
    assert!(!gpio.pin(EngineConfig::default().pins.sensor_power).level);
    assert!(gpio.is_cleaned_up());
}

#[tokio::test]
async fn missing_eeprom_is_not_fatal_by_default() {
    let mut rig = rig_with(test_config(), |sim| sim.set_absent(0x50, true)).await;

    assert!(matches!(rig.engine.calibration_source(), CalibrationSource::Defaults { .. }));
    assert_eq!(rig.engine.self_test().await.bits(), Peripheral::Eeprom.bit());
}

#[tokio::test]
async fn optional_tof_missing_degrades_elasticity() {
    let mut config = test_config();
    config.device.mandatory = vec![Peripheral::Adc, Peripheral::Moisture];
    let mut rig = rig_with(config, |sim| sim.set_absent(0x29, true)).await;

    let measurement = rig.engine.acquire().await;

    assert_eq!(measurement.s2, 0.0);
    assert_eq!(measurement.elasticity_result, ElasticityResult::Poor);
    assert!(measurement.pd1 >= 100.0 && measurement.pd1 <= 150.0);
}

#[tokio::test]
async fn failed_climate_read_degrades_but_keeps_last_temperature() {
    let mut rig = rig_with(test_config(), |sim| sim.set_climate(28.0, 60.0)).await;
    rig.engine.acquire().await;

    rig.sim.set_absent(0x44, true);
    let measurement = rig.engine.acquire().await;

    assert_eq!(measurement.ambient_temperature_c, 0.0);
    assert_eq!(measurement.s1, 0.0);
    assert_eq!(measurement.moisture_level, 0.0);
    assert!(measurement.pd1 > 0.0);
    assert!((rig.engine.last_temperature().unwrap_or_default() - 28.0).abs() < 0.01);
}

#[tokio::test]
async fn corrupted_sensor_crc_is_caught_when_verification_is_on() {
    let mut config = test_config();
    config.verify_sensor_crc = true;
    let mut rig = rig_with(config, |sim| sim.set_climate(30.0, 55.0)).await;

    assert!(rig.engine.acquire().await.s1 > 0.0);

    rig.sim.corrupt_moisture_crc(true);
    let measurement = rig.engine.acquire().await;
    assert_eq!(measurement.ambient_temperature_c, 0.0);
    assert_eq!(measurement.s1, 0.0);
}

#[tokio::test]
async fn simulated_readings_stay_in_physical_ranges() {
    let mut rig = rig().await;
    for _ in 0..25 {
        let m = rig.engine.acquire().await;
        assert!((99.9..=150.1).contains(&m.pd1), "pd1 {}", m.pd1);
        assert!((99.9..=150.1).contains(&m.pd2), "pd2 {}", m.pd2);
        assert!((21.9..=30.1).contains(&m.ambient_temperature_c));
        assert!((44.9..=65.1).contains(&m.s3), "s3 {}", m.s3);
        assert!((0.0..=100.0).contains(&m.moisture_level));
    }
}

#[tokio::test]
async fn same_seed_replays_same_measurements() {
    let mut a = rig().await;
    let mut b = rig().await;

    for _ in 0..5 {
        assert_eq!(a.engine.acquire().await, b.engine.acquire().await);
    }
}

#[tokio::test]
async fn acquisition_waits_out_settling_times_on_the_clock() {
    let mut rig = rig().await;
    let before = rig.clock.monotonic_ms();

    let measurement = rig.engine.acquire().await;

    // 15 ms humidity measurement plus three 9 ms conversions
    assert!(rig.clock.monotonic_ms() - before >= 15 + 3 * 9);
    assert_eq!(measurement.timestamp_ms, rig.clock.monotonic_ms());
    assert!(!rig.gpio.pin(rig.engine.config().pins.status_led).level);
}

#[tokio::test]
async fn patient_context_flows_into_measurement_and_treatment() {
    let mut rig = rig().await;
    rig.engine.set_patient_info("Park Jiwoo", "1992-03-14");

    let payload = rig.engine.acquire().await.to_payload(rig.engine.device_id());
    assert_eq!(payload.patient_name, "Park Jiwoo");
    assert_eq!(payload.birth_date, "1992-03-14");
    assert_eq!(payload.device_id, "THE3-SKIN-DEVICE-001");
    assert_eq!(payload.hz, "50.00");

    let treatment = rig.engine.create_treatment(TreatmentMode::LedTherapy);
    let json: serde_json::Value = serde_json::from_str(&treatment.to_json(rig.engine.device_id()).unwrap()).unwrap();
    assert_eq!(json["treatmentType"], "L");
    assert_eq!(json["lMode"], "red");
    assert_eq!(json["lBrightness"], "80");
    assert_eq!(json["patientName"], "Park Jiwoo");
}

#[tokio::test]
async fn data_ready_edges_reach_subscribers() {
    let mut rig = rig().await;
    let pin = rig.engine.config().pins.adc_drdy;
    let mut rx = rig.engine.watch_data_ready().await.unwrap();

    rig.gpio.drive_input(pin, true);
    rig.gpio.drive_input(pin, false);

    let event = rx.try_recv().unwrap();
    assert_eq!(event.pin, pin);
    assert!(!event.level);
}

#[tokio::test]
async fn shutdown_deasserts_power_then_releases_buses() {
    let rig = rig().await;
    let pins = rig.engine.config().pins;
    assert!(rig.gpio.pin(pins.sensor_power).level);
    assert!(rig.gpio.pin(pins.power_led).level);

    rig.engine.shutdown().await;

    assert!(!rig.gpio.pin(pins.sensor_power).level);
    assert!(!rig.gpio.pin(pins.power_led).level);
    assert!(!rig.gpio.pin(pins.status_led).level);
    assert!(rig.gpio.is_cleaned_up());
}
