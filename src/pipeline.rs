//! Acquisition cycle: ordered sensor reads, then calibration,
//! temperature compensation, clamping and categorization.
//!
//! Reading and deriving are split so the arithmetic can be checked
//! without a bus. A failed read never aborts the cycle; the affected
//! field degrades to zero and a warning is logged.

use tracing::warn;

use crate::bus::RegisterBus;
use crate::calibration::CalibrationRecord;
use crate::config::{CompensationConfig, MoistureConfig};
use crate::hal::Clock;
use crate::messages::{
    ElasticityResult, Measurement, MoistureLevelResult, PatientInfo, RawCodes, ThicknessResult,
};
use crate::sensors::{Ads1115, AdcChannel, AdcReading, ClimateReading, ElasticityReading, Sht31, Vl6180x};

/// `value * (1 - (t - t_ref) * k)`; the factor is exactly 1 at `t_ref`.
pub fn compensate(value: f32, temperature_c: f32, cfg: &CompensationConfig) -> f32 {
    let delta = temperature_c - cfg.reference_temp_c;
    if delta == 0.0 {
        return value;
    }
    value * (1.0 - delta * cfg.temp_coefficient)
}

pub fn apply_linear(raw: f32, scale: f32, offset: f32) -> f32 {
    scale * raw + offset
}

/// Gain then clamp into `[min, max]`. NaN lands on `min`.
pub fn moisture_level(compensated: f32, cfg: &MoistureConfig) -> f32 {
    let level = compensated * cfg.level_gain;
    if level.is_nan() {
        return cfg.min;
    }
    level.clamp(cfg.min, cfg.max)
}

/// Everything read from the bus in one cycle, before calibration.
/// `None` marks a read that failed.
#[derive(Debug, Clone, Default)]
pub struct RawSample {
    pub climate: Option<ClimateReading>,
    pub pd1: Option<AdcReading>,
    pub pd2: Option<AdcReading>,
    pub elasticity: Option<ElasticityReading>,
    pub thickness: Option<AdcReading>,
}

impl RawSample {
    pub fn is_degraded(&self) -> bool {
        self.climate.is_none()
            || self.pd1.is_none()
            || self.pd2.is_none()
            || self.elasticity.is_none()
            || self.thickness.is_none()
    }
}

/// Pipeline parameters that do not change between cycles
#[derive(Debug, Clone, Copy)]
pub struct DeriveParams {
    pub compensation: CompensationConfig,
    pub moisture: MoistureConfig,
    pub measurement_hz: f32,
}

/// Turn a raw sample into a finished measurement.
pub fn derive(
    raw: &RawSample,
    record: &CalibrationRecord,
    params: &DeriveParams,
    patient: PatientInfo,
    timestamp_ms: u64,
) -> Measurement {
    let pd1 = raw.pd1.unwrap_or_default();
    let pd2 = raw.pd2.unwrap_or_default();
    let thickness = raw.thickness.unwrap_or_default();

    // without a temperature there is nothing to compensate against
    let (ambient, moisture_raw, humidity_code) = match &raw.climate {
        Some(c) => (c.temperature_c, c.moisture_raw(), c.humidity_code),
        None => (params.compensation.reference_temp_c, 0.0, 0),
    };

    let moisture = apply_linear(moisture_raw, record.moisture_scale, record.moisture_offset);
    let s1 = compensate(moisture, ambient, &params.compensation);
    let s2 = apply_linear(
        raw.elasticity.map_or(0.0, |e| e.elasticity),
        record.elasticity_scale,
        record.elasticity_offset,
    );
    let s3 = apply_linear(thickness.units, record.thickness_scale, record.thickness_offset);
    let level = moisture_level(s1, &params.moisture);

    Measurement {
        pd1: pd1.units + record.pd_offset1,
        pd2: pd2.units + record.pd_offset2,
        hz: params.measurement_hz,
        s1,
        s2,
        s3,
        ambient_temperature_c: raw.climate.map_or(0.0, |c| c.temperature_c),
        raw_codes: RawCodes {
            pd1: pd1.code,
            pd2: pd2.code,
            thickness: thickness.code,
            humidity: humidity_code,
        },
        moisture_level: level,
        moisture_level_result: MoistureLevelResult::from_level(level),
        elasticity_result: ElasticityResult::from_value(s2),
        thickness_result: ThicknessResult::from_value(s3),
        patient,
        timestamp_ms,
    }
}

/// The three measurement drivers, read in fixed order
pub struct SensorSet {
    pub adc: Ads1115,
    pub climate: Sht31,
    pub tof: Vl6180x,
}

impl SensorSet {
    async fn adc_channel(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock, channel: AdcChannel) -> Option<AdcReading> {
        match self.adc.read_channel(bus, clock, channel).await {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!("[pipeline] ADC channel {} raw value degraded to zero: {}", channel.index(), e);
                None
            }
        }
    }

    /// One pass over the sensors: climate, photodiodes, elasticity,
    /// thickness. Reads never overlap.
    pub async fn sample(&self, bus: &mut dyn RegisterBus, clock: &dyn Clock) -> RawSample {
        let climate = match self.climate.read(bus, clock).await {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!("[pipeline] climate read degraded: {}", e);
                None
            }
        };

        let pd1 = self.adc_channel(bus, clock, AdcChannel::Pd1).await;
        let pd2 = self.adc_channel(bus, clock, AdcChannel::Pd2).await;

        let elasticity = match self.tof.read_elasticity(bus, clock).await {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!("[pipeline] elasticity raw value degraded to zero: {}", e);
                None
            }
        };

        let thickness = self.adc_channel(bus, clock, AdcChannel::Thickness).await;

        RawSample {
            climate,
            pd1,
            pd2,
            elasticity,
            thickness,
        }
    }
}
