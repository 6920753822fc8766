//! Persistent server settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use levial_core::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
const MAX_PHRASES_PER_KIND: usize = 16;

/// How the microphone path detects the wake phrase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeMode {
    /// Transcribe short idle speech segments and match the wake phrases.
    #[default]
    Transcript,
    /// Only the `trigger_wake` command wakes the agent.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub bind_address: String,
    pub preferred_input_device: Option<String>,
    pub wake_mode: WakeMode,
    /// Echo services and a virtual microphone instead of local models.
    pub stub_services: bool,
    pub whisper_binary: String,
    pub whisper_model: PathBuf,
    pub piper_binary: String,
    pub piper_voice: PathBuf,
    pub ollama_url: String,
    pub ollama_model: String,
    /// Program and leading args for playback; platform default when empty.
    pub player_command: Vec<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub profile_path: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        let models = data_dir().join("models");
        Self {
            bind_address: DEFAULT_BIND.into(),
            preferred_input_device: None,
            wake_mode: WakeMode::default(),
            stub_services: false,
            whisper_binary: "whisper-cli".into(),
            whisper_model: models.join("ggml-base.en.bin"),
            piper_binary: "piper".into(),
            piper_voice: models.join("en_US-lessac-medium.onnx"),
            ollama_url: DEFAULT_OLLAMA_URL.into(),
            ollama_model: DEFAULT_OLLAMA_MODEL.into(),
            player_command: Vec::new(),
            artifacts_dir: None,
            profile_path: None,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        self.bind_address = non_empty(&self.bind_address).unwrap_or(defaults.bind_address);
        self.preferred_input_device = self
            .preferred_input_device
            .as_deref()
            .and_then(non_empty);
        self.whisper_binary = non_empty(&self.whisper_binary).unwrap_or(defaults.whisper_binary);
        self.piper_binary = non_empty(&self.piper_binary).unwrap_or(defaults.piper_binary);
        self.ollama_url = non_empty(&self.ollama_url)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.ollama_url);
        self.ollama_model = non_empty(&self.ollama_model).unwrap_or(defaults.ollama_model);
        self.player_command = self
            .player_command
            .iter()
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();

        let phrases = &mut self.orchestrator.phrases;
        phrases.wake = normalize_phrases(&phrases.wake);
        phrases.stop_speaking = normalize_phrases(&phrases.stop_speaking);
        phrases.pause = normalize_phrases(&phrases.pause);
        phrases.end_session = normalize_phrases(&phrases.end_session);
        self.orchestrator.normalize();
    }

    /// Apply `LEVIAL_*` overrides from `lookup` (the process env in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("LEVIAL_BIND") {
            self.bind_address = bind;
        }
        if let Some(url) = lookup("LEVIAL_OLLAMA_URL") {
            self.ollama_url = url;
        }
        if let Some(model) = lookup("LEVIAL_OLLAMA_MODEL") {
            self.ollama_model = model;
        }
        if let Some(mode) = lookup("LEVIAL_WAKE_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "manual" => self.wake_mode = WakeMode::Manual,
                "transcript" => self.wake_mode = WakeMode::Transcript,
                other => warn!("ignoring unknown LEVIAL_WAKE_MODE `{other}`"),
            }
        }
        if let Some(flag) = lookup("LEVIAL_STUB_SERVICES") {
            self.stub_services = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        self.normalize();
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("artifacts"))
    }

    pub fn profile_path(&self) -> PathBuf {
        self.profile_path
            .clone()
            .unwrap_or_else(|| data_dir().join("profile.json"))
    }
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Trim, lowercase, drop empties and duplicates. An empty result keeps the
/// list empty, which disables that control kind.
fn normalize_phrases(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for phrase in raw {
        let normalized = phrase.trim().to_lowercase();
        if normalized.is_empty() || out.contains(&normalized) {
            continue;
        }
        out.push(normalized);
        if out.len() >= MAX_PHRASES_PER_KIND {
            break;
        }
    }
    out
}

/// Per-user data directory for settings, profile and artifacts.
pub fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Levial")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("levial")
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("LEVIAL_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("settings.json"))
}

/// Read settings, falling back to defaults when the file is missing or
/// unreadable.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = ?path, "ignoring malformed settings: {e}");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
