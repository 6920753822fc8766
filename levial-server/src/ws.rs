//! Websocket gateway: one observer per connection.
//!
//! Outbound events are pushed by the hub into the observer's queue and
//! forwarded by a writer task. Inbound text frames are decoded as control
//! commands; anything malformed is answered with an `error` event to that
//! client only.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use levial_core::{ControlCommand, ObserverId, OutboundEvent};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.hub.status();
    Json(json!({
        "server_running": true,
        "agent_running": status.agent_running,
        "state": status.state,
    }))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut events) = state.hub.connect();
    info!(observer = id, "observer connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(observer = id, kind = event.kind(), "event encode failed: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => route_text(&state, id, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                state
                    .hub
                    .send_to(id, OutboundEvent::error("binary frames are not supported"));
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(observer = id, "websocket read error: {e}");
                break;
            }
        }
    }

    state.hub.disconnect(id);
    writer.abort();
    info!(observer = id, "observer disconnected");
}

/// Decode one inbound text frame and hand it to the session loop.
async fn route_text(state: &AppState, id: ObserverId, text: &str) {
    match ControlCommand::decode(text) {
        Ok(command) => {
            debug!(observer = id, kind = command.kind(), "control command");
            if let Err(e) = state.commands.send(command).await {
                warn!(observer = id, "command dropped: {e}");
                state.hub.send_to(id, OutboundEvent::error(e.to_string()));
            }
        }
        Err(e) => {
            warn!(observer = id, "rejected message: {e}");
            state.hub.send_to(id, OutboundEvent::error(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use levial_core::{
        adapters::{
            stub::{StubResponder, StubSynthesizer, StubTranscriber},
            ProcessPlayer,
        },
        audio::VirtualMicrophone,
        profile::MemoryProfileStore,
        Collaborators, Orchestrator, OrchestratorConfig, Services, SessionState,
    };
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    fn orchestrator() -> Orchestrator {
        let (source, _feed) = VirtualMicrophone::new(16_000, 1_280, Duration::from_millis(20));
        Orchestrator::spawn(
            OrchestratorConfig::default(),
            Collaborators {
                services: Services {
                    transcriber: Arc::new(StubTranscriber),
                    responder: Arc::new(StubResponder),
                    synthesizer: Arc::new(StubSynthesizer),
                    playback: Arc::new(ProcessPlayer::system_default(Duration::from_secs(5))),
                },
                profiles: Arc::new(MemoryProfileStore::default()),
                source: Box::new(source),
            },
        )
    }

    /// Next event that is not background telemetry or the async profile load.
    async fn next_event(rx: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
        loop {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event in time")
                .expect("observer open");
            match event {
                OutboundEvent::AudioLevel { .. } | OutboundEvent::KnowledgeUpdate { .. } => {}
                other => return other,
            }
        }
    }

    async fn skip_greeting(rx: &mut mpsc::Receiver<OutboundEvent>) {
        assert!(matches!(next_event(rx).await, OutboundEvent::Connected { .. }));
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<OutboundEvent>) {
        while let Ok(Some(event)) = timeout(Duration::from_millis(100), rx.recv()).await {
            assert!(
                !matches!(event, OutboundEvent::Error { .. }),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn malformed_text_is_answered_with_error_to_sender_only() {
        let orch = orchestrator();
        let state = AppState::new(orch.commands(), orch.hub());
        let (sender, mut sender_rx) = state.hub.connect();
        let (_other, mut other_rx) = state.hub.connect();
        skip_greeting(&mut sender_rx).await;
        skip_greeting(&mut other_rx).await;

        route_text(&state, sender, "{ nope").await;
        match next_event(&mut sender_rx).await {
            OutboundEvent::Error { message, stage } => {
                assert!(message.starts_with("invalid JSON"));
                assert!(stage.is_none());
            }
            other => panic!("expected error, got {other:?}"),
        }

        route_text(&state, sender, r#"{"type":"reboot"}"#).await;
        match next_event(&mut sender_rx).await {
            OutboundEvent::Error { message, .. } => assert!(message.contains("reboot")),
            other => panic!("expected error, got {other:?}"),
        }

        assert_quiet(&mut other_rx).await;
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn valid_command_reaches_the_session_loop() {
        let orch = orchestrator();
        let state = AppState::new(orch.commands(), orch.hub());
        let (id, mut rx) = state.hub.connect();
        skip_greeting(&mut rx).await;

        route_text(&state, id, r#"{"type":"start_agent"}"#).await;
        assert_eq!(next_event(&mut rx).await, OutboundEvent::AgentStarted);
        assert_eq!(next_event(&mut rx).await, OutboundEvent::Idle);
        assert_eq!(state.hub.status().state, SessionState::Idle);
        assert!(state.hub.status().agent_running);

        route_text(&state, id, r#"{"type":"stop_agent"}"#).await;
        assert_eq!(next_event(&mut rx).await, OutboundEvent::AgentStopped);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn commands_after_shutdown_report_closed_loop() {
        let orch = orchestrator();
        let state = AppState::new(orch.commands(), orch.hub());
        let (id, mut rx) = state.hub.connect();
        skip_greeting(&mut rx).await;
        orch.shutdown().await;

        route_text(&state, id, r#"{"type":"trigger_wake"}"#).await;
        match next_event(&mut rx).await {
            OutboundEvent::Error { message, .. } => assert!(message.contains("shut down")),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
