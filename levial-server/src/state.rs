//! Shared handles for the HTTP and websocket handlers.

use std::sync::Arc;

use levial_core::{CommandSender, ObserverHub};

#[derive(Clone)]
pub struct AppState {
    pub commands: CommandSender,
    pub hub: Arc<ObserverHub>,
}

impl AppState {
    pub fn new(commands: CommandSender, hub: Arc<ObserverHub>) -> Self {
        Self { commands, hub }
    }
}
