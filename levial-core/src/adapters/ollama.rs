//! Responder backed by a local Ollama server (`POST /api/generate`).
//!
//! A blocking `reqwest` client is built per call inside the worker thread;
//! the blocking client must not be created or dropped on an async executor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AdapterError, AdapterStage, Responder, ResponderRequest};

const SYSTEM_PROMPT: &str = "You are Levial, a capable and friendly local voice assistant. \
Answer conversationally and concisely (1-3 sentences). Do not use markdown.";

#[derive(Debug, Clone)]
pub struct OllamaResponder {
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaResponder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

/// Flatten profile context, history and the new transcript into one prompt.
pub fn build_prompt(request: &ResponderRequest) -> String {
    let mut lines = vec![SYSTEM_PROMPT.to_string()];

    let profile = &request.profile;
    if let Some(name) = profile.name.as_deref() {
        lines.push(format!("The user's name is {name}."));
    }
    if !profile.preferences.is_empty() {
        lines.push(format!(
            "IMPORTANT - ADAPT TO USER PREFERENCES: {}",
            profile.preferences.join(", ")
        ));
    }
    if !profile.interests.is_empty() {
        lines.push(format!("User interests: {}", profile.interests.join(", ")));
    }
    if !profile.facts.is_empty() {
        let facts = profile
            .facts
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("; ");
        lines.push(format!("Known facts: {facts}"));
    }

    for turn in &request.history {
        lines.push(format!("USER: {}", turn.user));
        lines.push(format!("ASSISTANT: {}", turn.assistant));
    }
    lines.push(format!("USER: {}", request.transcript));
    lines.push("ASSISTANT:".to_string());
    lines.join("\n")
}

impl Responder for OllamaResponder {
    fn respond(&self, request: &ResponderRequest) -> Result<String, AdapterError> {
        let stage = AdapterStage::Generation;
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AdapterError::failure(stage, format!("http client: {e}")))?;

        debug!(
            model = %self.model,
            history = request.history.len(),
            proactivity = request.proactivity_level,
            "querying ollama"
        );
        let body = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(request),
            stream: false,
        };

        let response = client
            .post(self.endpoint())
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::timeout(stage, self.timeout)
                } else {
                    AdapterError::failure(stage, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::failure(stage, format!("ollama returned {status}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| AdapterError::failure(stage, format!("bad ollama payload: {e}")))?;
        let reply = parsed.response.trim().to_string();
        info!(chars = reply.len(), "generation complete");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Turn;
    use crate::profile::UserProfile;

    fn request() -> ResponderRequest {
        let mut profile = UserProfile::default();
        profile.name = Some("Ada".into());
        profile.preferences = vec!["short answers".into()];
        ResponderRequest {
            transcript: "what's the weather".into(),
            history: vec![Turn {
                user: "hi".into(),
                assistant: "hello Ada".into(),
            }],
            profile,
            proactivity_level: 0.4,
        }
    }

    #[test]
    fn prompt_includes_profile_history_and_transcript_in_order() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("The user's name is Ada."));
        assert!(prompt.contains("short answers"));
        let hi = prompt.find("USER: hi").expect("history present");
        let now = prompt.find("USER: what's the weather").expect("transcript present");
        assert!(hi < now);
        assert!(prompt.ends_with("ASSISTANT:"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let r = OllamaResponder::new("http://localhost:11434/", "mistral", Duration::from_secs(1));
        assert_eq!(r.endpoint(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn unreachable_server_is_a_generation_error() {
        // Port 9 (discard) is essentially never serving HTTP.
        let r = OllamaResponder::new("http://127.0.0.1:9", "mistral", Duration::from_secs(2));
        let err = r.respond(&request()).expect_err("must fail");
        assert_eq!(err.stage, AdapterStage::Generation);
    }
}
