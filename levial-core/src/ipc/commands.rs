//! Control commands sent by observers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profile::ProfileDelta;

const KNOWN_TYPES: &[&str] = &[
    "start_agent",
    "stop_agent",
    "trigger_wake",
    "update_config",
    "update_knowledge",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    StartAgent,
    StopAgent,
    TriggerWake,
    UpdateConfig(ConfigPatch),
    UpdateKnowledge {
        #[serde(default)]
        updates: ProfileDelta,
    },
}

/// Live config patch. Accepts the flat form
/// `{"silence_duration": 0.5}` and the nested form
/// `{"config": {"silence_duration": 0.5}}`; nested values win.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawConfigPatch")]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proactivity_level: Option<f32>,
}

#[derive(Deserialize)]
struct RawConfigPatch {
    #[serde(default)]
    silence_duration: Option<f32>,
    #[serde(default)]
    proactivity_level: Option<f32>,
    #[serde(default)]
    config: Option<NestedConfigPatch>,
}

#[derive(Deserialize)]
struct NestedConfigPatch {
    #[serde(default)]
    silence_duration: Option<f32>,
    #[serde(default)]
    proactivity_level: Option<f32>,
}

impl From<RawConfigPatch> for ConfigPatch {
    fn from(raw: RawConfigPatch) -> Self {
        let (nested_silence, nested_proactivity) = raw
            .config
            .map(|c| (c.silence_duration, c.proactivity_level))
            .unwrap_or_default();
        Self {
            silence_duration: nested_silence.or(raw.silence_duration),
            proactivity_level: nested_proactivity.or(raw.proactivity_level),
        }
    }
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.silence_duration.is_none() && self.proactivity_level.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("command must be a JSON object with a string `type` field")]
    MissingType,

    #[error("unknown command type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` payload: {detail}")]
    InvalidPayload { kind: String, detail: String },
}

impl ControlCommand {
    /// Decode one inbound text message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            detail: e.to_string(),
        })
    }

    /// Wire `type` tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartAgent => "start_agent",
            Self::StopAgent => "stop_agent",
            Self::TriggerWake => "trigger_wake",
            Self::UpdateConfig(_) => "update_config",
            Self::UpdateKnowledge { .. } => "update_knowledge",
        }
    }
}
