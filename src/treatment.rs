use serde::{Deserialize, Serialize};

use crate::messages::{two_decimals, PatientInfo};

/// Therapy modules on the handpiece
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreatmentMode {
    Vibration,
    Iontophoresis,
    HighFrequency,
    LedTherapy,
}

impl TreatmentMode {
    /// One-letter type code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            TreatmentMode::Vibration => "V",
            TreatmentMode::Iontophoresis => "I",
            TreatmentMode::HighFrequency => "T",
            TreatmentMode::LedTherapy => "L",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "V" => Some(TreatmentMode::Vibration),
            "I" => Some(TreatmentMode::Iontophoresis),
            "T" => Some(TreatmentMode::HighFrequency),
            "L" => Some(TreatmentMode::LedTherapy),
            _ => None,
        }
    }
}

/// Per-mode session parameters. Times are minutes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TreatmentSettings {
    Vibration {
        mode: String,
        sensitivity: String,
        time_min: u32,
        hz: u32,
    },
    Iontophoresis {
        time_min: u32,
        current_ma: f32,
    },
    HighFrequency {
        time_min: u32,
        voltage_v: f32,
        hz: u32,
    },
    LedTherapy {
        mode: String,
        brightness: u8,
        time_min: u32,
        hz: u32,
    },
}

impl TreatmentSettings {
    /// Factory session settings for `mode`
    pub fn defaults(mode: TreatmentMode) -> Self {
        match mode {
            TreatmentMode::Vibration => TreatmentSettings::Vibration {
                mode: "normal".to_string(),
                sensitivity: "medium".to_string(),
                time_min: 15,
                hz: 60,
            },
            TreatmentMode::Iontophoresis => TreatmentSettings::Iontophoresis {
                time_min: 20,
                current_ma: 0.5,
            },
            TreatmentMode::HighFrequency => TreatmentSettings::HighFrequency {
                time_min: 10,
                voltage_v: 12.0,
                hz: 1000,
            },
            TreatmentMode::LedTherapy => TreatmentSettings::LedTherapy {
                mode: "red".to_string(),
                brightness: 80,
                time_min: 15,
                hz: 0,
            },
        }
    }

    pub fn mode(&self) -> TreatmentMode {
        match self {
            TreatmentSettings::Vibration { .. } => TreatmentMode::Vibration,
            TreatmentSettings::Iontophoresis { .. } => TreatmentMode::Iontophoresis,
            TreatmentSettings::HighFrequency { .. } => TreatmentMode::HighFrequency,
            TreatmentSettings::LedTherapy { .. } => TreatmentMode::LedTherapy,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TreatmentRecord {
    pub settings: TreatmentSettings,
    pub patient: PatientInfo,
    pub timestamp_ms: u64,
}

/// Wire object for a treatment session. Only the fields of the active
/// mode are present.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TreatmentPayload {
    pub device_id: String,
    pub patient_name: String,
    pub birth_date: String,
    pub treatment_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_sensitivity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v_hz: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub i_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i_current: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_voltage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_hz: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub l_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l_brightness: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l_hz: Option<String>,
}

impl TreatmentRecord {
    pub fn new(mode: TreatmentMode, patient: PatientInfo, timestamp_ms: u64) -> Self {
        Self {
            settings: TreatmentSettings::defaults(mode),
            patient,
            timestamp_ms,
        }
    }

    pub fn mode(&self) -> TreatmentMode {
        self.settings.mode()
    }

    pub fn to_payload(&self, device_id: &str) -> TreatmentPayload {
        let mut payload = TreatmentPayload {
            device_id: device_id.to_string(),
            patient_name: self.patient.name.clone(),
            birth_date: self.patient.birth_date.clone(),
            treatment_type: self.mode().code().to_string(),
            ..Default::default()
        };

        match &self.settings {
            TreatmentSettings::Vibration { mode, sensitivity, time_min, hz } => {
                payload.v_mode = Some(mode.clone());
                payload.v_sensitivity = Some(sensitivity.clone());
                payload.v_time = Some(time_min.to_string());
                payload.v_hz = Some(hz.to_string());
            }
            TreatmentSettings::Iontophoresis { time_min, current_ma } => {
                payload.i_time = Some(time_min.to_string());
                payload.i_current = Some(two_decimals(*current_ma));
            }
            TreatmentSettings::HighFrequency { time_min, voltage_v, hz } => {
                payload.t_time = Some(time_min.to_string());
                payload.t_voltage = Some(two_decimals(*voltage_v));
                payload.t_hz = Some(hz.to_string());
            }
            TreatmentSettings::LedTherapy { mode, brightness, time_min, hz } => {
                payload.l_mode = Some(mode.clone());
                payload.l_brightness = Some(brightness.to_string());
                payload.l_time = Some(time_min.to_string());
                payload.l_hz = Some(hz.to_string());
            }
        }
        payload
    }

    pub fn to_json(&self, device_id: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_payload(device_id))
    }
}
