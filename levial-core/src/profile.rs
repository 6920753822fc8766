//! User profile collaborator.
//!
//! The session holds a cached copy of the profile for responder context.
//! Mutations go through a [`ProfileStore`] on a worker task and come back to
//! the loop as a completion event.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LevialError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: Option<String>,
    pub interests: Vec<String>,
    pub facts: BTreeMap<String, serde_json::Value>,
    pub preferences: Vec<String>,
}

/// Partial update sent by `update_knowledge`. Present fields replace the
/// stored value wholesale; absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interests: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Vec<String>>,
}

impl ProfileDelta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.interests.is_none()
            && self.facts.is_none()
            && self.preferences.is_none()
    }
}

impl UserProfile {
    pub fn apply(&mut self, delta: &ProfileDelta) {
        if let Some(name) = &delta.name {
            let trimmed = name.trim();
            self.name = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        if let Some(interests) = &delta.interests {
            self.interests = interests.clone();
        }
        if let Some(facts) = &delta.facts {
            self.facts = facts.clone();
        }
        if let Some(preferences) = &delta.preferences {
            self.preferences = preferences.clone();
        }
    }
}

pub trait ProfileStore: Send + Sync + 'static {
    fn load(&self) -> Result<UserProfile>;

    /// Apply `delta`, persist, and return the resulting profile.
    fn apply(&self, delta: &ProfileDelta) -> Result<UserProfile>;
}

/// Profile persisted as pretty JSON on disk.
#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    // Serialises read-modify-write cycles from concurrent workers.
    lock: Mutex<()>,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<UserProfile> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                LevialError::ProfileStore(format!("corrupt profile {:?}: {e}", self.path))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UserProfile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, profile: &UserProfile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(profile)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Result<UserProfile> {
        let _guard = self.lock.lock();
        self.read()
    }

    fn apply(&self, delta: &ProfileDelta) -> Result<UserProfile> {
        let _guard = self.lock.lock();
        let mut profile = self.read()?;
        profile.apply(delta);
        self.write(&profile)?;
        info!(path = ?self.path, "profile updated");
        Ok(profile)
    }
}

/// In-memory store for tests and stub runs.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profile: Mutex<UserProfile>,
}

impl MemoryProfileStore {
    pub fn new(profile: UserProfile) -> Self {
        Self {
            profile: Mutex::new(profile),
        }
    }
}

impl ProfileStore for MemoryProfileStore {
    fn load(&self) -> Result<UserProfile> {
        Ok(self.profile.lock().clone())
    }

    fn apply(&self, delta: &ProfileDelta) -> Result<UserProfile> {
        let mut profile = self.profile.lock();
        profile.apply(delta);
        Ok(profile.clone())
    }
}
