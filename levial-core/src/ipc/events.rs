//! Telemetry and state events broadcast to every observer.
//!
//! | `type` | payload |
//! |---|---|
//! | `connected` | `message`, `state`, `agent_running` |
//! | `idle` / `listening` / `thinking` / `speaking` / `paused` | – |
//! | `wake_word_detected` | `wake_word` |
//! | `transcript` / `response` | `text` |
//! | `audio_level` | `level` in [0, 1] |
//! | `knowledge_update` | `profile` |
//! | `error` | `message`, optional `stage` |
//! | `agent_started` / `agent_stopped` | – |

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterStage;
use crate::engine::session::SessionState;
use crate::profile::UserProfile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// First message on every connection; enough to rebuild current status.
    Connected {
        message: String,
        state: SessionState,
        agent_running: bool,
    },
    Idle,
    WakeWordDetected {
        wake_word: String,
    },
    Listening,
    Thinking,
    Speaking,
    Paused,
    Transcript {
        text: String,
    },
    Response {
        text: String,
    },
    AudioLevel {
        level: f32,
    },
    KnowledgeUpdate {
        profile: UserProfile,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<AdapterStage>,
    },
    AgentStarted,
    AgentStopped,
}

impl OutboundEvent {
    /// Event announcing entry into `state`, for states whose announcement
    /// carries no payload. `WakeDetected` and `Error` are announced by the
    /// loop with their payload instead.
    pub fn state_changed(state: SessionState) -> Option<Self> {
        match state {
            SessionState::Idle => Some(Self::Idle),
            SessionState::Listening => Some(Self::Listening),
            SessionState::Thinking => Some(Self::Thinking),
            SessionState::Speaking => Some(Self::Speaking),
            SessionState::Paused => Some(Self::Paused),
            SessionState::Stopped => Some(Self::AgentStopped),
            SessionState::WakeDetected | SessionState::Error => None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            stage: None,
        }
    }

    /// Wire `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Idle => "idle",
            Self::WakeWordDetected { .. } => "wake_word_detected",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Paused => "paused",
            Self::Transcript { .. } => "transcript",
            Self::Response { .. } => "response",
            Self::AudioLevel { .. } => "audio_level",
            Self::KnowledgeUpdate { .. } => "knowledge_update",
            Self::Error { .. } => "error",
            Self::AgentStarted => "agent_started",
            Self::AgentStopped => "agent_stopped",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(event: &OutboundEvent) -> OutboundEvent {
        let json = event.to_json().expect("serialize event");
        serde_json::from_str(&json).expect("deserialize event")
    }

    #[test]
    fn every_variant_survives_the_wire() {
        let mut profile = UserProfile::default();
        profile.name = Some("Zoë".into());
        profile.interests = vec!["flight sims".into()];
        profile
            .facts
            .insert("home".into(), serde_json::json!({"city": "Kraków"}));

        let events = vec![
            OutboundEvent::Connected {
                message: "Connected to Levial Voice Agent".into(),
                state: SessionState::Speaking,
                agent_running: true,
            },
            OutboundEvent::Idle,
            OutboundEvent::WakeWordDetected {
                wake_word: "Manual Trigger".into(),
            },
            OutboundEvent::Listening,
            OutboundEvent::Thinking,
            OutboundEvent::Speaking,
            OutboundEvent::Paused,
            OutboundEvent::Transcript {
                text: "héllo — 你好 👋 please stop speaking now".into(),
            },
            OutboundEvent::Transcript { text: String::new() },
            OutboundEvent::Response {
                text: "line one\nline \"two\"\tend session".into(),
            },
            OutboundEvent::Response { text: String::new() },
            OutboundEvent::AudioLevel { level: 0.375 },
            OutboundEvent::KnowledgeUpdate { profile },
            OutboundEvent::error("GenerationTimeout: no result after 60s"),
            OutboundEvent::Error {
                message: "TranscriptionFailure: exit 1".into(),
                stage: Some(AdapterStage::Transcription),
            },
            OutboundEvent::AgentStarted,
            OutboundEvent::AgentStopped,
        ];

        for event in &events {
            assert_eq!(&round_trip(event), event, "round trip of {}", event.kind());
        }
    }

    #[test]
    fn tags_and_fields_match_wire_names() {
        let json = serde_json::to_value(OutboundEvent::WakeWordDetected {
            wake_word: "hey levial".into(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "wake_word_detected");
        assert_eq!(json["wake_word"], "hey levial");

        let json = serde_json::to_value(OutboundEvent::AudioLevel { level: 0.5 }).expect("serialize");
        assert_eq!(json["type"], "audio_level");
        assert_eq!(json["level"], 0.5);

        let json = serde_json::to_value(OutboundEvent::Idle).expect("serialize");
        assert_eq!(json, serde_json::json!({"type": "idle"}));
    }

    #[test]
    fn connected_carries_snake_case_state() {
        let json = serde_json::to_value(OutboundEvent::Connected {
            message: "hi".into(),
            state: SessionState::WakeDetected,
            agent_running: true,
        })
        .expect("serialize");
        assert_eq!(json["state"], "wake_detected");
        assert_eq!(json["agent_running"], true);
    }

    #[test]
    fn error_without_stage_omits_the_field() {
        let json = serde_json::to_value(OutboundEvent::error("bad command")).expect("serialize");
        assert!(json.get("stage").is_none());
        assert_eq!(json["message"], "bad command");
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let event = OutboundEvent::KnowledgeUpdate {
            profile: UserProfile::default(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], event.kind());
    }

    #[test]
    fn plain_states_map_to_their_announcements() {
        assert_eq!(
            OutboundEvent::state_changed(SessionState::Thinking),
            Some(OutboundEvent::Thinking)
        );
        assert_eq!(
            OutboundEvent::state_changed(SessionState::Stopped),
            Some(OutboundEvent::AgentStopped)
        );
        assert_eq!(OutboundEvent::state_changed(SessionState::WakeDetected), None);
    }
}
