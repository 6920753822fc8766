//! `Orchestrator`: owns the session loop task.
//!
//! ## Lifecycle
//!
//! ```text
//! Orchestrator::spawn()        → loop task running, agent Stopped
//!     └─► start_agent          → frame source opening … agent_started, Idle
//!         └─► wake / turns     → Listening → Thinking → Speaking → Idle
//!             └─► stop_agent   → source stopped, session cleared, Stopped
//! Orchestrator::shutdown()     → loop task exits
//! ```
//!
//! ## Threading
//!
//! The loop is a single tokio task and the only writer of session state.
//! Frame sources run on their own OS threads (the cpal stream is `!Send`),
//! adapter calls on the blocking pool, observers on their transport tasks.
//! All of them reach the loop through one bounded queue.

pub mod config;
pub mod event_loop;
pub mod session;

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    error::{LevialError, Result},
    gateway::{ObserverHub, StatusSnapshot},
    ipc::ControlCommand,
};

pub use config::{AdapterTimeouts, AudioConfig, ConfigBounds, LiveConfig, OrchestratorConfig};
pub use event_loop::{CapturePurpose, CapturedFrame, Collaborators, LoopEvent, SessionLoop};
pub use session::{Session, SessionState};

/// Depth of the loop's inbound queue. Frames beyond it are dropped.
pub const INBOUND_QUEUE: usize = 256;

/// Cloneable handle for submitting control commands.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<LoopEvent>,
}

impl CommandSender {
    /// Queue a command behind everything already queued.
    pub async fn send(&self, command: ControlCommand) -> Result<()> {
        self.tx
            .send(LoopEvent::Command(command))
            .await
            .map_err(|_| LevialError::LoopClosed)
    }
}

pub struct Orchestrator {
    tx: mpsc::Sender<LoopEvent>,
    hub: Arc<ObserverHub>,
    task: JoinHandle<()>,
}

impl Orchestrator {
    /// Spawn the session loop on the current tokio runtime. The agent starts
    /// Stopped; send `start_agent` to open the frame source.
    pub fn spawn(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        Self::with_hub(config, collaborators, Arc::new(ObserverHub::new()))
    }

    /// Like [`spawn`](Self::spawn), publishing to an existing hub. Lets
    /// collaborators built beforehand read the published state.
    pub fn with_hub(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        hub: Arc<ObserverHub>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let session_loop = SessionLoop::new(config, collaborators, Arc::clone(&hub), tx.clone());
        let task = tokio::spawn(session_loop.run(rx));
        info!("orchestrator spawned");
        Self { tx, hub, task }
    }

    pub fn commands(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    pub fn hub(&self) -> Arc<ObserverHub> {
        Arc::clone(&self.hub)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.hub.status()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        if self.tx.send(LoopEvent::Shutdown).await.is_err() {
            warn!("session loop already gone");
        }
        if let Err(e) = self.task.await {
            warn!("session loop task failed: {e}");
        }
    }
}
