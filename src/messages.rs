use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Peripheral;

/// Moisture level buckets, driest first
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MoistureLevelResult {
    Dry,
    SlightlyDry,
    Normal,
    Hydrated,
}

impl MoistureLevelResult {
    /// `< 30` dry, `< 50` slightly dry, `< 70` normal, otherwise hydrated.
    /// Cut points belong to the higher bucket.
    pub fn from_level(level: f32) -> Self {
        if level < 30.0 {
            MoistureLevelResult::Dry
        } else if level < 50.0 {
            MoistureLevelResult::SlightlyDry
        } else if level < 70.0 {
            MoistureLevelResult::Normal
        } else {
            MoistureLevelResult::Hydrated
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MoistureLevelResult::Dry => "dry",
            MoistureLevelResult::SlightlyDry => "slightly_dry",
            MoistureLevelResult::Normal => "normal",
            MoistureLevelResult::Hydrated => "hydrated",
        }
    }
}

/// Elasticity buckets, weakest first
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ElasticityResult {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ElasticityResult {
    /// `< 40` poor, `< 60` fair, `< 80` good, otherwise excellent.
    pub fn from_value(value: f32) -> Self {
        if value < 40.0 {
            ElasticityResult::Poor
        } else if value < 60.0 {
            ElasticityResult::Fair
        } else if value < 80.0 {
            ElasticityResult::Good
        } else {
            ElasticityResult::Excellent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElasticityResult::Poor => "poor",
            ElasticityResult::Fair => "fair",
            ElasticityResult::Good => "good",
            ElasticityResult::Excellent => "excellent",
        }
    }
}

/// Thickness buckets, thinnest first
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ThicknessResult {
    Thin,
    Normal,
    Thick,
}

impl ThicknessResult {
    /// `< 35` thin, `< 55` normal, otherwise thick.
    pub fn from_value(value: f32) -> Self {
        if value < 35.0 {
            ThicknessResult::Thin
        } else if value < 55.0 {
            ThicknessResult::Normal
        } else {
            ThicknessResult::Thick
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThicknessResult::Thin => "thin",
            ThicknessResult::Normal => "normal",
            ThicknessResult::Thick => "thick",
        }
    }
}

macro_rules! impl_display_as_str {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

impl_display_as_str!(MoistureLevelResult, ElasticityResult, ThicknessResult);

/// Patient identity carried through untouched
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PatientInfo {
    pub name: String,
    pub birth_date: String,
}

/// Raw conversion codes kept for diagnostics
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawCodes {
    pub pd1: i16,
    pub pd2: i16,
    pub thickness: i16,
    /// Humidity word of the SHT31 response
    pub humidity: u16,
}

/// Output of one acquisition cycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Measurement {
    pub pd1: f32,
    pub pd2: f32,
    pub hz: f32,
    /// Calibrated, temperature-compensated moisture
    pub s1: f32,
    /// Calibrated elasticity
    pub s2: f32,
    /// Calibrated thickness
    pub s3: f32,
    pub ambient_temperature_c: f32,
    pub raw_codes: RawCodes,

    pub moisture_level: f32,
    pub moisture_level_result: MoistureLevelResult,
    pub elasticity_result: ElasticityResult,
    pub thickness_result: ThicknessResult,

    pub patient: PatientInfo,
    /// Monotonic milliseconds
    pub timestamp_ms: u64,
}

/// Wire object consumed by the transport collaborator. Numbers are
/// rendered as two-decimal strings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SkinAnalysisPayload {
    pub device_id: String,
    pub patient_name: String,
    pub birth_date: String,
    pub pd1: String,
    pub pd2: String,
    pub hz: String,
    pub s1: String,
    pub s2: String,
    pub s3: String,
    pub moisture_level: String,
    pub thickness_result: String,
    pub elasticity_result: String,
    pub moisture_level_result: String,
}

pub(crate) fn two_decimals(value: f32) -> String {
    format!("{:.2}", value)
}

impl Measurement {
    pub fn to_payload(&self, device_id: &str) -> SkinAnalysisPayload {
        SkinAnalysisPayload {
            device_id: device_id.to_string(),
            patient_name: self.patient.name.clone(),
            birth_date: self.patient.birth_date.clone(),
            pd1: two_decimals(self.pd1),
            pd2: two_decimals(self.pd2),
            hz: two_decimals(self.hz),
            s1: two_decimals(self.s1),
            s2: two_decimals(self.s2),
            s3: two_decimals(self.s3),
            moisture_level: two_decimals(self.moisture_level),
            thickness_result: self.thickness_result.to_string(),
            elasticity_result: self.elasticity_result.to_string(),
            moisture_level_result: self.moisture_level_result.to_string(),
        }
    }

    /// Serialize the wire payload to JSON
    pub fn to_json(&self, device_id: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_payload(device_id))
    }
}

/// Self-test result: one bit per missing peripheral, 0 when healthy
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceHealth(u8);

impl DeviceHealth {
    pub fn healthy() -> Self {
        DeviceHealth(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        DeviceHealth(bits & 0x0F)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_healthy(&self) -> bool {
        self.0 == 0
    }

    pub fn mark_absent(&mut self, peripheral: Peripheral) {
        self.0 |= peripheral.bit();
    }

    pub fn is_absent(&self, peripheral: Peripheral) -> bool {
        self.0 & peripheral.bit() != 0
    }

    pub fn absent(&self) -> impl Iterator<Item = Peripheral> + '_ {
        Peripheral::ALL.into_iter().filter(|p| self.is_absent(*p))
    }
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_healthy() {
            return f.write_str("all sensors OK");
        }
        let names: Vec<&str> = self.absent().map(|p| p.name()).collect();
        write!(f, "{:#04x} ({} failure)", self.0, names.join(", "))
    }
}
