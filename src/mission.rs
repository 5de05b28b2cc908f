use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::yolo_result::Bbox;

/// Raw `/predict` body. Fields stay untyped so numeric and string ids are
/// both accepted and user-supplied values are echoed back unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictRequest {
    #[serde(rename = "challengeId", default)]
    pub challenge_id: Value,
    #[serde(rename = "missionId", default)]
    pub mission_id: Value,
    #[serde(rename = "userId", default)]
    pub user_id: Value,
    #[serde(rename = "tempImageId", default)]
    pub temp_image_id: Value,
    #[serde(rename = "imageUrl", default)]
    pub image_url: Value,
}

/// A request whose required fields are all present.
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub challenge_id: String,
    pub mission_id: String,
    pub user_id: Value,
    pub temp_image_id: Value,
    pub image_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingData;

impl PredictRequest {
    pub fn validate(self) -> Result<Mission, MissingData> {
        let challenge_id = id_string(&self.challenge_id).ok_or(MissingData)?;
        let mission_id = id_string(&self.mission_id).ok_or(MissingData)?;
        if is_blank(&self.user_id) || is_blank(&self.temp_image_id) {
            return Err(MissingData);
        }
        let image_url = match self.image_url {
            Value::String(url) if !url.is_empty() => url,
            _ => return Err(MissingData),
        };
        Ok(Mission {
            challenge_id,
            mission_id,
            user_id: self.user_id,
            temp_image_id: self.temp_image_id,
            image_url,
        })
    }
}

/// Config keys are strings, requests may send `0` or `"0"`.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TargetMatch {
    pub confidence: f32,
    pub bbox: Option<[f32; 4]>,
}

impl TargetMatch {
    pub fn detected(&self) -> bool {
        self.bbox.is_some()
    }
}

/// Takes the first detection, in confidence order, labelled `target`.
pub fn match_target(detections: &[Bbox], names: &[String], target: &str) -> TargetMatch {
    detections
        .iter()
        .find(|b| names.get(b.id()).map(String::as_str) == Some(target))
        .map(|b| TargetMatch {
            confidence: b.confidence(),
            bbox: Some(b.xyxy()),
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    #[serde(rename = "challengeId")]
    pub challenge_id: String,
    #[serde(rename = "missionId")]
    pub mission_id: String,
    #[serde(rename = "userId")]
    pub user_id: Value,
    #[serde(rename = "tempImageId")]
    pub temp_image_id: Value,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "Confidence")]
    pub confidence: f64,
    #[serde(rename = "classDetected")]
    pub class_detected: bool,
    pub bbox: Option<[f64; 4]>,
}

impl PredictResponse {
    pub fn new(mission: Mission, found: TargetMatch) -> Self {
        Self {
            success: true,
            challenge_id: mission.challenge_id,
            mission_id: mission.mission_id,
            user_id: mission.user_id,
            temp_image_id: mission.temp_image_id,
            image_url: mission.image_url,
            confidence: round_to(found.confidence as f64, 4),
            class_detected: found.detected(),
            bbox: found.bbox.map(|b| b.map(|v| round_to(v as f64, 2))),
        }
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
