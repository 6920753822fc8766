//! Observer registry and best-effort fan-out.
//!
//! The hub is shared between the session loop (which broadcasts) and the
//! transport's connection tasks (which connect and disconnect). It has its own
//! lock; it is not part of session state. Each observer gets a bounded queue;
//! a queue that is full or closed at broadcast time drops its observer so a
//! slow client can never hold up the others.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::session::SessionState;
use crate::ipc::OutboundEvent;
use crate::profile::UserProfile;

/// Per-observer queue depth.
pub const OBSERVER_QUEUE: usize = 64;

const SNAPSHOT_LEN: usize = 2;
const _: () = assert!(OBSERVER_QUEUE >= SNAPSHOT_LEN);

const CONNECTED_MESSAGE: &str = "Connected to Levial Voice Agent";

pub type ObserverId = u64;

/// What a late joiner needs to rebuild the current status.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub agent_running: bool,
    pub profile: UserProfile,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Stopped,
            agent_running: false,
            profile: UserProfile::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: ObserverId,
    observers: HashMap<ObserverId, mpsc::Sender<OutboundEvent>>,
    status: StatusSnapshot,
}

#[derive(Debug, Default)]
pub struct ObserverHub {
    inner: Mutex<Inner>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Its queue already holds the `connected`
    /// acknowledgment and the current profile.
    pub fn connect(&self) -> (ObserverId, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        for event in snapshot_events(&inner.status) {
            let queued = tx.try_send(event);
            debug_assert!(queued.is_ok(), "snapshot must fit a fresh observer queue");
        }
        inner.observers.insert(id, tx);
        info!(observer = id, total = inner.observers.len(), "observer connected");
        (id, rx)
    }

    pub fn disconnect(&self, id: ObserverId) {
        let mut inner = self.inner.lock();
        if inner.observers.remove(&id).is_some() {
            info!(observer = id, total = inner.observers.len(), "observer disconnected");
        }
    }

    /// Deliver `event` to every observer, dropping the ones that cannot keep up.
    pub fn broadcast(&self, event: OutboundEvent) {
        let mut inner = self.inner.lock();
        if inner.observers.is_empty() {
            return;
        }
        inner.observers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(observer = *id, kind = event.kind(), "observer queue full, dropping observer");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(observer = *id, "observer gone");
                false
            }
        });
    }

    /// Deliver to a single observer (e.g. a protocol error reply).
    pub fn send_to(&self, id: ObserverId, event: OutboundEvent) -> bool {
        let mut inner = self.inner.lock();
        let Some(tx) = inner.observers.get(&id) else {
            return false;
        };
        if tx.try_send(event).is_ok() {
            return true;
        }
        warn!(observer = id, "observer unreachable, dropping observer");
        inner.observers.remove(&id);
        false
    }

    /// Record the session status served to late joiners.
    pub fn publish_status(&self, state: SessionState, agent_running: bool) {
        let mut inner = self.inner.lock();
        inner.status.state = state;
        inner.status.agent_running = agent_running;
    }

    pub fn publish_profile(&self, profile: UserProfile) {
        self.inner.lock().status.profile = profile;
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.lock().status.clone()
    }

    /// Last published state, without cloning the profile.
    pub fn state(&self) -> SessionState {
        self.inner.lock().status.state
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }
}

fn snapshot_events(status: &StatusSnapshot) -> [OutboundEvent; SNAPSHOT_LEN] {
    [
        OutboundEvent::Connected {
            message: CONNECTED_MESSAGE.to_string(),
            state: status.state,
            agent_running: status.agent_running,
        },
        OutboundEvent::KnowledgeUpdate {
            profile: status.profile.clone(),
        },
    ]
}
