//! The session loop: the single owner and sole writer of session state.
//!
//! Every input (frames, control commands, adapter completions, profile
//! results) arrives as a [`LoopEvent`] on one queue and is handled to
//! completion by [`SessionLoop::handle`] before the next is taken. Adapter
//! calls run on worker tasks; their completions carry the epoch captured at
//! dispatch and are dropped if the session has moved on since.

use std::mem;
use std::ops::ControlFlow;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::adapters::{
    call_with_timeout, AdapterError, AdapterStage, ResponderRequest, Services, SpeechClip,
};
use crate::audio::source::{FrameSink, FrameSource};
use crate::buffering::{
    frame::AudioFrame,
    utterance::{Utterance, UtteranceBuffer},
};
use crate::classifier::{Classification, CommandClassifier, ControlPhrase};
use crate::engine::config::{LiveConfig, OrchestratorConfig};
use crate::engine::session::{Session, SessionState};
use crate::gateway::ObserverHub;
use crate::ipc::{ConfigPatch, ControlCommand, OutboundEvent};
use crate::profile::{ProfileDelta, ProfileStore, UserProfile};
use crate::vad::{EnergyVad, SilenceDetector, VoiceActivityDetector};

/// Wake word reported for `trigger_wake`.
pub const MANUAL_WAKE: &str = "Manual Trigger";

/// A frame as delivered by a frame source.
#[derive(Debug)]
pub struct CapturedFrame {
    /// Generation of the source that produced it.
    pub generation: u64,
    pub frame: AudioFrame,
    /// Wake phrase the detector heard on this frame.
    pub wake: Option<String>,
}

/// Why an utterance is being transcribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePurpose {
    /// The user's turn, captured while Listening.
    Utterance,
    /// Speech captured while Speaking; only stop phrases act on it.
    BargeIn,
}

#[derive(Debug)]
pub enum LoopEvent {
    Frame(CapturedFrame),
    SourceOpened {
        generation: u64,
        result: Result<(), String>,
    },
    Command(ControlCommand),
    Transcribed {
        epoch: u64,
        purpose: CapturePurpose,
        result: Result<String, AdapterError>,
    },
    Responded {
        epoch: u64,
        result: Result<String, AdapterError>,
    },
    Synthesized {
        epoch: u64,
        result: Result<SpeechClip, AdapterError>,
    },
    PlaybackFinished {
        epoch: u64,
        result: Result<(), AdapterError>,
    },
    KnowledgeUpdated(Result<UserProfile, String>),
    Shutdown,
}

/// Everything outside the loop that it drives.
pub struct Collaborators {
    pub services: Services,
    pub profiles: Arc<dyn ProfileStore>,
    pub source: Box<dyn FrameSource>,
}

/// Capture running alongside playback to catch a spoken stop phrase.
struct BargeInMonitor {
    buffer: UtteranceBuffer,
    silence: SilenceDetector,
    in_flight: bool,
}

pub struct SessionLoop {
    config: OrchestratorConfig,
    live: LiveConfig,
    session: Session,
    classifier: CommandClassifier,
    services: Services,
    profiles: Arc<dyn ProfileStore>,
    profile: UserProfile,
    source: Box<dyn FrameSource>,
    source_generation: u64,
    starting: bool,
    hub: Arc<ObserverHub>,
    tx: mpsc::Sender<LoopEvent>,
    vad: EnergyVad,
    silence: SilenceDetector,
    utterance: Option<UtteranceBuffer>,
    barge_in: Option<BargeInMonitor>,
    playback_stop: Option<Arc<AtomicBool>>,
    level_clock: Duration,
    turn_span: Option<Span>,
}

impl SessionLoop {
    /// `tx` must feed the queue this loop is driven from.
    pub fn new(
        mut config: OrchestratorConfig,
        collaborators: Collaborators,
        hub: Arc<ObserverHub>,
        tx: mpsc::Sender<LoopEvent>,
    ) -> Self {
        config.normalize();
        let audio = config.audio;
        hub.publish_status(SessionState::Stopped, false);
        Self {
            live: config.live,
            session: Session::new(),
            classifier: CommandClassifier::new(&config.phrases),
            services: collaborators.services,
            profiles: collaborators.profiles,
            profile: UserProfile::default(),
            source: collaborators.source,
            source_generation: 0,
            starting: false,
            hub,
            tx,
            vad: EnergyVad::new(audio.silence_threshold, audio.vad_hangover_frames),
            silence: SilenceDetector::new(audio.silence_threshold),
            utterance: None,
            barge_in: None,
            playback_stop: None,
            level_clock: Duration::ZERO,
            turn_span: None,
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn live_config(&self) -> LiveConfig {
        self.live
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Generation stamped on events from the current frame source.
    pub fn source_generation(&self) -> u64 {
        self.source_generation
    }

    /// Drain the queue until [`LoopEvent::Shutdown`].
    pub async fn run(mut self, mut rx: mpsc::Receiver<LoopEvent>) {
        info!("session loop started");
        self.load_profile();
        while let Some(event) = rx.recv().await {
            if self.handle(event).is_break() {
                break;
            }
        }
        self.source.stop();
        self.stop_playback();
        info!("session loop exited");
    }

    /// Apply one event. Never blocks; adapter work is dispatched to tasks.
    pub fn handle(&mut self, event: LoopEvent) -> ControlFlow<()> {
        let span = self.turn_span.clone();
        let _entered = span.as_ref().map(Span::enter);

        match event {
            LoopEvent::Frame(captured) => self.on_frame(captured),
            LoopEvent::SourceOpened { generation, result } => self.on_source_opened(generation, result),
            LoopEvent::Command(command) => self.on_command(command),
            LoopEvent::Transcribed {
                epoch,
                purpose,
                result,
            } => {
                if self.is_stale(epoch, AdapterStage::Transcription) {
                    return ControlFlow::Continue(());
                }
                match purpose {
                    CapturePurpose::Utterance => self.on_transcript(result),
                    CapturePurpose::BargeIn => self.on_barge_in_transcript(result),
                }
            }
            LoopEvent::Responded { epoch, result } => {
                if !self.is_stale(epoch, AdapterStage::Generation) {
                    self.on_response(result);
                }
            }
            LoopEvent::Synthesized { epoch, result } => {
                if !self.is_stale(epoch, AdapterStage::Synthesis) {
                    self.on_synthesized(epoch, result);
                }
            }
            LoopEvent::PlaybackFinished { epoch, result } => {
                if !self.is_stale(epoch, AdapterStage::Playback) {
                    self.on_playback_finished(result);
                }
            }
            LoopEvent::KnowledgeUpdated(result) => self.on_knowledge(result),
            LoopEvent::Shutdown => {
                info!("shutdown requested");
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ── Audio ───────────────────────────────────────────────────────────

    fn on_frame(&mut self, captured: CapturedFrame) {
        if captured.generation != self.source_generation || !self.session.is_running() {
            return;
        }
        let frame = captured.frame;
        self.report_level(&frame);

        if let Some(wake_word) = captured.wake {
            if self.session.state().accepts_wake() {
                self.wake(wake_word);
                return;
            }
            debug!(state = %self.session.state(), "wake word ignored");
        }

        match self.session.state() {
            SessionState::Listening => self.listen(&frame),
            SessionState::Speaking => self.monitor_barge_in(&frame),
            _ => {}
        }
    }

    fn report_level(&mut self, frame: &AudioFrame) {
        self.level_clock += frame.duration();
        if self.level_clock < self.config.audio.level_interval() {
            return;
        }
        self.level_clock = Duration::ZERO;
        let level = self.config.audio.scaled_level(frame.level);
        self.emit(OutboundEvent::AudioLevel { level });
    }

    fn listen(&mut self, frame: &AudioFrame) {
        let Some(buffer) = self.utterance.as_mut() else {
            return;
        };
        let voiced = self.vad.classify(frame).is_speech();
        buffer.push(frame, voiced);

        // Read live on every frame so an update applies to this utterance.
        let timeout = self.live.silence_timeout();
        let silence_elapsed = self.silence.observe(frame, timeout);
        let at_limit = buffer.captured() >= self.config.audio.max_utterance();
        if !silence_elapsed && !at_limit {
            return;
        }

        let Some(buffer) = self.utterance.take() else {
            return;
        };
        if buffer.is_near_silent(self.config.audio.min_voiced()) {
            info!(
                captured_ms = buffer.captured().as_millis() as u64,
                "no speech after wake, returning to idle"
            );
            self.finish_turn();
            self.transition(SessionState::Idle);
            return;
        }
        if at_limit && !silence_elapsed {
            info!("utterance reached maximum length");
        }

        self.dispatch_transcription(buffer.finish(), CapturePurpose::Utterance);
        self.transition(SessionState::Thinking);
    }

    fn monitor_barge_in(&mut self, frame: &AudioFrame) {
        let barge_silence = self.config.audio.barge_in_silence();
        let max_len = self.config.audio.max_utterance();
        let sample_rate = self.config.audio.target_sample_rate;
        let Some(monitor) = self.barge_in.as_mut() else {
            return;
        };
        if monitor.in_flight {
            return;
        }

        let voiced = self.vad.classify(frame).is_speech();
        if !voiced && monitor.buffer.is_empty() {
            return;
        }
        monitor.buffer.push(frame, voiced);
        let closed = monitor.silence.observe(frame, barge_silence);
        if !closed && monitor.buffer.captured() < max_len {
            return;
        }

        let buffer = mem::replace(&mut monitor.buffer, UtteranceBuffer::new(sample_rate));
        monitor.silence.reset();
        if buffer.is_near_silent(self.config.audio.min_voiced()) {
            return;
        }
        monitor.in_flight = true;
        debug!("speech during playback, checking for a stop phrase");
        self.dispatch_transcription(buffer.finish(), CapturePurpose::BargeIn);
    }

    fn wake(&mut self, wake_word: String) {
        info!(wake_word = wake_word.as_str(), "wake");
        self.transition(SessionState::WakeDetected);
        self.emit(OutboundEvent::WakeWordDetected { wake_word });

        let epoch = self.session.begin_turn();
        self.turn_span = Some(info_span!("utterance", turn = self.session.turn(), epoch));
        self.utterance = Some(UtteranceBuffer::new(self.config.audio.target_sample_rate));
        self.vad.reset();
        self.silence.reset();
        self.transition(SessionState::Listening);
    }

    // ── Adapter completions ─────────────────────────────────────────────

    fn is_stale(&self, epoch: u64, stage: AdapterStage) -> bool {
        if self.session.is_current(epoch) {
            return false;
        }
        debug!(
            %stage,
            epoch,
            current = self.session.epoch(),
            "discarding stale result"
        );
        true
    }

    fn on_transcript(&mut self, result: Result<String, AdapterError>) {
        if self.session.state() != SessionState::Thinking {
            return;
        }
        let text = match result {
            Ok(text) => text.trim().to_string(),
            Err(e) => return self.fail(e),
        };
        if text.is_empty() {
            info!("empty transcript, returning to idle");
            self.finish_turn();
            self.transition(SessionState::Idle);
            return;
        }

        info!(chars = text.chars().count(), "transcript ready");
        self.session.set_transcript(text.clone());
        self.emit(OutboundEvent::Transcript { text: text.clone() });

        match self.classifier.classify(&text) {
            Classification::Control {
                phrase: ControlPhrase::Pause,
                matched,
            } => {
                info!(phrase = matched.as_str(), "pausing");
                self.finish_turn();
                self.transition(SessionState::Paused);
            }
            Classification::Control {
                phrase: ControlPhrase::EndSession,
                matched,
            } => {
                info!(phrase = matched.as_str(), "ending session");
                self.session.clear_history();
                self.finish_turn();
                self.transition(SessionState::Idle);
            }
            // Stop-speaking outside Speaking and a repeated wake phrase are
            // plain content.
            Classification::Control { .. } | Classification::Content => {
                self.dispatch_response(text);
            }
        }
    }

    fn on_response(&mut self, result: Result<String, AdapterError>) {
        if self.session.state() != SessionState::Thinking {
            return;
        }
        let text = match result {
            Ok(text) => text.trim().to_string(),
            Err(e) => return self.fail(e),
        };
        self.session.set_response(text.clone());
        self.emit(OutboundEvent::Response { text: text.clone() });
        if text.is_empty() {
            info!("empty response, nothing to say");
            self.finish_turn();
            self.transition(SessionState::Idle);
            return;
        }

        self.dispatch_synthesis(text);
        self.barge_in = Some(BargeInMonitor {
            buffer: UtteranceBuffer::new(self.config.audio.target_sample_rate),
            silence: SilenceDetector::new(self.config.audio.silence_threshold),
            in_flight: false,
        });
        self.vad.reset();
        self.transition(SessionState::Speaking);
    }

    fn on_synthesized(&mut self, epoch: u64, result: Result<SpeechClip, AdapterError>) {
        if self.session.state() != SessionState::Speaking {
            return;
        }
        match result {
            Ok(clip) => self.dispatch_playback(epoch, clip),
            Err(e) => self.fail(e),
        }
    }

    fn on_playback_finished(&mut self, result: Result<(), AdapterError>) {
        if self.session.state() != SessionState::Speaking {
            return;
        }
        match result {
            Ok(()) => {
                self.playback_stop = None;
                self.finish_turn();
                self.transition(SessionState::Idle);
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_barge_in_transcript(&mut self, result: Result<String, AdapterError>) {
        if self.session.state() != SessionState::Speaking {
            return;
        }
        if let Some(monitor) = self.barge_in.as_mut() {
            monitor.in_flight = false;
        }
        let text = match result {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!("barge-in transcription failed: {e}");
                return;
            }
        };

        let Classification::Control { phrase, matched } = self.classifier.classify(&text) else {
            debug!("speech during playback was not a stop phrase");
            return;
        };
        let end_session = match phrase {
            ControlPhrase::StopSpeaking => false,
            ControlPhrase::EndSession => true,
            ControlPhrase::Wake | ControlPhrase::Pause => return,
        };

        info!(phrase = matched.as_str(), "barge-in, stopping playback");
        self.emit(OutboundEvent::Transcript { text });
        self.abandon_turn();
        if end_session {
            self.session.clear_history();
        }
        self.transition(SessionState::Idle);
    }

    fn on_knowledge(&mut self, result: Result<UserProfile, String>) {
        match result {
            Ok(profile) => {
                self.profile = profile.clone();
                self.hub.publish_profile(profile.clone());
                self.emit(OutboundEvent::KnowledgeUpdate { profile });
            }
            Err(message) => {
                error!("profile store: {message}");
                self.emit(OutboundEvent::error(format!("knowledge update failed: {message}")));
            }
        }
    }

    /// Adapter failure: announce it, then fall back to Idle.
    fn fail(&mut self, err: AdapterError) {
        error!(stage = %err.stage, "{err}");
        self.abandon_turn();
        self.transition(SessionState::Error);
        self.emit(OutboundEvent::Error {
            message: err.to_string(),
            stage: Some(err.stage),
        });
        self.transition(SessionState::Idle);
    }

    // ── Commands ────────────────────────────────────────────────────────

    fn on_command(&mut self, command: ControlCommand) {
        debug!(command = command.kind(), state = %self.session.state(), "command");
        match command {
            ControlCommand::StartAgent => self.start_agent(),
            ControlCommand::StopAgent => self.stop_agent(),
            ControlCommand::TriggerWake => {
                if self.session.is_running() && self.session.state().accepts_wake() {
                    self.wake(MANUAL_WAKE.to_string());
                } else {
                    info!(state = %self.session.state(), "trigger_wake ignored");
                }
            }
            ControlCommand::UpdateConfig(patch) => self.update_config(patch),
            ControlCommand::UpdateKnowledge { updates } => self.update_knowledge(updates),
        }
    }

    fn start_agent(&mut self) {
        if self.session.is_running() || self.starting {
            info!("start_agent ignored, agent already running");
            return;
        }
        self.source_generation += 1;
        let sink = FrameSink::new(self.tx.clone(), self.source_generation);
        match self.source.start(sink) {
            Ok(()) => {
                self.starting = true;
                info!(generation = self.source_generation, "starting audio pipeline");
            }
            Err(e) => {
                error!("cannot start audio pipeline: {e}");
                self.emit(OutboundEvent::error(format!("audio device unavailable: {e}")));
            }
        }
    }

    fn on_source_opened(&mut self, generation: u64, result: Result<(), String>) {
        if generation != self.source_generation || !self.starting {
            debug!(generation, "ignoring report from a retired source");
            return;
        }
        self.starting = false;
        match result {
            Ok(()) => {
                self.session.set_running(true);
                self.level_clock = self.config.audio.level_interval();
                info!("agent started");
                self.emit(OutboundEvent::AgentStarted);
                self.transition(SessionState::Idle);
            }
            Err(message) => {
                self.source.stop();
                error!("audio device unavailable: {message}");
                self.emit(OutboundEvent::error(format!("audio device unavailable: {message}")));
            }
        }
    }

    fn stop_agent(&mut self) {
        if !self.session.is_running() && !self.starting {
            info!("stop_agent ignored, agent not running");
            return;
        }
        self.starting = false;
        self.source.stop();
        // Frames still in the queue from the old source are ignored.
        self.source_generation += 1;
        self.abandon_turn();
        self.session.clear();
        self.session.set_running(false);
        info!("agent stopped");
        self.transition(SessionState::Stopped);
    }

    fn update_config(&mut self, patch: ConfigPatch) {
        if self.live.apply(&patch, &self.config.bounds) {
            info!(
                silence_duration_secs = self.live.silence_duration_secs,
                proactivity_level = self.live.proactivity_level,
                "live config updated"
            );
        } else {
            debug!("config patch changed nothing");
        }
    }

    fn update_knowledge(&mut self, updates: ProfileDelta) {
        let store = Arc::clone(&self.profiles);
        self.spawn_profile_task(move || store.apply(&updates));
    }

    fn load_profile(&mut self) {
        let store = Arc::clone(&self.profiles);
        self.spawn_profile_task(move || store.load());
    }

    fn spawn_profile_task<F>(&self, work: F)
    where
        F: FnOnce() -> crate::error::Result<UserProfile> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(work).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("profile worker died: {e}")),
            };
            if tx.send(LoopEvent::KnowledgeUpdated(result)).await.is_err() {
                warn!("session loop gone, profile result dropped");
            }
        });
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn dispatch_transcription(&self, utterance: Utterance, purpose: CapturePurpose) {
        let epoch = self.session.epoch();
        let transcriber = Arc::clone(&self.services.transcriber);
        info!(
            epoch,
            ?purpose,
            audio_ms = utterance.duration().as_millis() as u64,
            "dispatching transcription"
        );
        self.dispatch(
            AdapterStage::Transcription,
            self.config.timeouts.transcription(),
            move || transcriber.transcribe(&utterance),
            move |result| LoopEvent::Transcribed {
                epoch,
                purpose,
                result,
            },
        );
    }

    fn dispatch_response(&self, transcript: String) {
        let epoch = self.session.epoch();
        let responder = Arc::clone(&self.services.responder);
        let request = ResponderRequest {
            transcript,
            history: self.session.history().to_vec(),
            profile: self.profile.clone(),
            proactivity_level: self.live.proactivity_level,
        };
        info!(epoch, history = request.history.len(), "dispatching generation");
        self.dispatch(
            AdapterStage::Generation,
            self.config.timeouts.generation(),
            move || responder.respond(&request),
            move |result| LoopEvent::Responded { epoch, result },
        );
    }

    fn dispatch_synthesis(&self, text: String) {
        let epoch = self.session.epoch();
        let synthesizer = Arc::clone(&self.services.synthesizer);
        info!(epoch, "dispatching synthesis");
        self.dispatch(
            AdapterStage::Synthesis,
            self.config.timeouts.synthesis(),
            move || synthesizer.synthesize(&text),
            move |result| LoopEvent::Synthesized { epoch, result },
        );
    }

    fn dispatch_playback(&mut self, epoch: u64, clip: SpeechClip) {
        let stop = Arc::new(AtomicBool::new(false));
        self.playback_stop = Some(Arc::clone(&stop));
        let playback = Arc::clone(&self.services.playback);
        debug!(epoch, ?clip, "starting playback");
        self.dispatch(
            AdapterStage::Playback,
            self.config.timeouts.playback(),
            move || playback.play(&clip, &stop),
            move |result| LoopEvent::PlaybackFinished { epoch, result },
        );
    }

    fn dispatch<T, W, C>(&self, stage: AdapterStage, timeout: Duration, work: W, complete: C)
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, AdapterError> + Send + 'static,
        C: FnOnce(Result<T, AdapterError>) -> LoopEvent + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = call_with_timeout(stage, timeout, work).await;
            if tx.send(complete(result)).await.is_err() {
                debug!(%stage, "session loop gone, completion dropped");
            }
        });
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn transition(&mut self, to: SessionState) {
        let from = self.session.set_state(to);
        info!(%from, %to, epoch = self.session.epoch(), "state");
        self.hub.publish_status(to, self.session.is_running());
        if let Some(event) = OutboundEvent::state_changed(to) {
            self.emit(event);
        }
    }

    fn emit(&self, event: OutboundEvent) {
        self.hub.broadcast(event);
    }

    /// Invalidate everything in flight for the current turn.
    fn abandon_turn(&mut self) {
        self.stop_playback();
        self.session.bump_epoch();
        self.finish_turn();
    }

    fn finish_turn(&mut self) {
        self.utterance = None;
        self.barge_in = None;
        self.turn_span = None;
    }

    fn stop_playback(&mut self) {
        if let Some(stop) = self.playback_stop.take() {
            stop.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::stub::{StubResponder, StubSynthesizer, StubTranscriber};
    use crate::adapters::{Playback, Responder, Synthesizer, Transcriber};
    use crate::profile::MemoryProfileStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct SourceLog {
        starts: usize,
        stops: usize,
    }

    struct RecordingSource {
        log: Arc<Mutex<SourceLog>>,
        refuse: bool,
    }

    impl FrameSource for RecordingSource {
        fn start(&mut self, _sink: FrameSink) -> crate::error::Result<()> {
            self.log.lock().starts += 1;
            if self.refuse {
                return Err(crate::error::LevialError::NoDefaultInputDevice);
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().stops += 1;
        }
    }

    struct FixedTranscriber(&'static str);

    impl Transcriber for FixedTranscriber {
        fn transcribe(&self, _utterance: &Utterance) -> Result<String, AdapterError> {
            Ok(self.0.to_string())
        }
    }

    struct InstantPlayback;

    impl Playback for InstantPlayback {
        fn play(&self, _clip: &SpeechClip, _stop: &AtomicBool) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    struct Harness {
        lp: SessionLoop,
        rx: mpsc::Receiver<LoopEvent>,
        observer: mpsc::Receiver<OutboundEvent>,
        log: Arc<Mutex<SourceLog>>,
    }

    fn services(transcriber: Arc<dyn Transcriber>) -> Services {
        Services {
            transcriber,
            responder: Arc::new(StubResponder) as Arc<dyn Responder>,
            synthesizer: Arc::new(StubSynthesizer) as Arc<dyn Synthesizer>,
            playback: Arc::new(InstantPlayback),
        }
    }

    fn harness_with(transcriber: Arc<dyn Transcriber>, refuse_device: bool) -> Harness {
        let (tx, rx) = mpsc::channel(256);
        let hub = Arc::new(ObserverHub::new());
        let (_, observer) = hub.connect();
        let log = Arc::new(Mutex::new(SourceLog::default()));
        let collaborators = Collaborators {
            services: services(transcriber),
            profiles: Arc::new(MemoryProfileStore::default()),
            source: Box::new(RecordingSource {
                log: Arc::clone(&log),
                refuse: refuse_device,
            }),
        };
        let lp = SessionLoop::new(OrchestratorConfig::default(), collaborators, hub, tx);
        let mut h = Harness {
            lp,
            rx,
            observer,
            log,
        };
        h.events();
        h
    }

    fn harness() -> Harness {
        harness_with(Arc::new(StubTranscriber), false)
    }

    fn voiced() -> AudioFrame {
        AudioFrame::new(vec![0.2; 1_280], 16_000)
    }

    fn quiet() -> AudioFrame {
        AudioFrame::new(vec![0.0; 1_280], 16_000)
    }

    impl Harness {
        fn send(&mut self, event: LoopEvent) {
            let _ = self.lp.handle(event);
        }

        fn command(&mut self, command: ControlCommand) {
            self.send(LoopEvent::Command(command));
        }

        fn frame(&mut self, frame: AudioFrame) {
            let generation = self.lp.source_generation();
            self.send(LoopEvent::Frame(CapturedFrame {
                generation,
                frame,
                wake: None,
            }));
        }

        fn frames(&mut self, frame: AudioFrame, count: usize) {
            for _ in 0..count {
                self.frame(frame.clone());
            }
        }

        fn start(&mut self) {
            self.command(ControlCommand::StartAgent);
            let generation = self.lp.source_generation();
            self.send(LoopEvent::SourceOpened {
                generation,
                result: Ok(()),
            });
        }

        /// Observer events since the last call, minus level telemetry.
        fn events(&mut self) -> Vec<OutboundEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.observer.try_recv() {
                if !matches!(event, OutboundEvent::AudioLevel { .. }) {
                    out.push(event);
                }
            }
            out
        }

        /// Next completion produced by a dispatched worker.
        async fn completion(&mut self) -> LoopEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                    .await
                    .expect("completion in time")
                    .expect("queue open");
                if !matches!(event, LoopEvent::KnowledgeUpdated(_)) {
                    return event;
                }
            }
        }

        /// Wake, speak, then go quiet until Thinking.
        fn speak_turn(&mut self) {
            self.command(ControlCommand::TriggerWake);
            self.frames(voiced(), 5);
            self.frames(quiet(), 19);
        }
    }

    #[tokio::test]
    async fn start_agent_waits_for_device_before_idle() {
        let mut h = harness();
        h.command(ControlCommand::StartAgent);
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert_eq!(h.log.lock().starts, 1);

        let generation = h.lp.source_generation();
        h.send(LoopEvent::SourceOpened {
            generation,
            result: Ok(()),
        });
        assert_eq!(h.lp.state(), SessionState::Idle);
        assert!(h.lp.session().is_running());
        assert_eq!(
            h.events(),
            vec![OutboundEvent::AgentStarted, OutboundEvent::Idle]
        );
    }

    #[tokio::test]
    async fn device_failure_reports_error_and_stays_stopped() {
        let mut h = harness();
        h.command(ControlCommand::StartAgent);
        let generation = h.lp.source_generation();
        h.send(LoopEvent::SourceOpened {
            generation,
            result: Err("no microphone".into()),
        });
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert!(!h.lp.session().is_running());
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], OutboundEvent::Error { message, .. } if message.contains("no microphone")));
    }

    #[tokio::test]
    async fn source_launch_failure_keeps_agent_stopped() {
        let mut h = harness_with(Arc::new(StubTranscriber), true);
        h.command(ControlCommand::StartAgent);
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert!(matches!(h.events().as_slice(), [OutboundEvent::Error { .. }]));
        // A fresh attempt is allowed.
        h.command(ControlCommand::StartAgent);
        assert_eq!(h.log.lock().starts, 2);
    }

    #[tokio::test]
    async fn duplicate_start_and_stop_are_ignored() {
        let mut h = harness();
        h.command(ControlCommand::StopAgent);
        assert!(h.events().is_empty());

        h.start();
        h.events();
        h.command(ControlCommand::StartAgent);
        assert_eq!(h.log.lock().starts, 1);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn trigger_wake_moves_to_listening_and_bumps_epoch() {
        let mut h = harness();
        h.start();
        h.events();
        let before = h.lp.session().epoch();

        h.command(ControlCommand::TriggerWake);
        assert_eq!(h.lp.state(), SessionState::Listening);
        assert_eq!(h.lp.session().epoch(), before + 1);
        assert_eq!(
            h.events(),
            vec![
                OutboundEvent::WakeWordDetected {
                    wake_word: MANUAL_WAKE.into()
                },
                OutboundEvent::Listening,
            ]
        );
    }

    #[tokio::test]
    async fn spoken_wake_only_acts_from_idle_or_paused() {
        let mut h = harness();
        h.start();
        let generation = h.lp.source_generation();
        h.send(LoopEvent::Frame(CapturedFrame {
            generation,
            frame: voiced(),
            wake: Some("hey levial".into()),
        }));
        assert_eq!(h.lp.state(), SessionState::Listening);

        let epoch = h.lp.session().epoch();
        h.send(LoopEvent::Frame(CapturedFrame {
            generation,
            frame: voiced(),
            wake: Some("hey levial".into()),
        }));
        assert_eq!(h.lp.state(), SessionState::Listening);
        assert_eq!(h.lp.session().epoch(), epoch);
    }

    #[tokio::test]
    async fn trigger_wake_is_ignored_while_stopped() {
        let mut h = harness();
        h.command(ControlCommand::TriggerWake);
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn silence_timeout_moves_to_thinking_exactly_once() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        h.frames(voiced(), 5);
        h.events();

        // 18 quiet frames = 1.44 s, still listening.
        h.frames(quiet(), 18);
        assert_eq!(h.lp.state(), SessionState::Listening);
        // 19th reaches 1.52 s.
        h.frame(quiet());
        assert_eq!(h.lp.state(), SessionState::Thinking);
        h.frames(quiet(), 40);

        assert_eq!(h.events(), vec![OutboundEvent::Thinking]);
        let completion = h.completion().await;
        assert!(matches!(
            completion,
            LoopEvent::Transcribed {
                purpose: CapturePurpose::Utterance,
                ..
            }
        ));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.completion())
                .await
                .is_err(),
            "only one transcription dispatched"
        );
    }

    #[tokio::test]
    async fn quiet_wake_is_a_false_wake() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        h.events();
        h.frames(quiet(), 19);
        assert_eq!(h.lp.state(), SessionState::Idle);
        assert_eq!(h.events(), vec![OutboundEvent::Idle]);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.completion())
                .await
                .is_err(),
            "no service call for a false wake"
        );
    }

    #[tokio::test]
    async fn shorter_silence_applies_to_the_utterance_in_progress() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        h.frames(voiced(), 5);
        h.frames(quiet(), 5);
        assert_eq!(h.lp.state(), SessionState::Listening);

        h.command(ControlCommand::UpdateConfig(ConfigPatch {
            silence_duration: Some(0.5),
            proactivity_level: None,
        }));
        // 0.4 s of silence already counted; 0.48 s is not enough, 0.56 s is.
        h.frame(quiet());
        assert_eq!(h.lp.state(), SessionState::Listening);
        h.frame(quiet());
        assert_eq!(h.lp.state(), SessionState::Thinking);
    }

    #[tokio::test]
    async fn utterance_is_cut_at_maximum_length() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        // 30 s of continuous speech at 80 ms per frame.
        h.frames(voiced(), 374);
        assert_eq!(h.lp.state(), SessionState::Listening);
        h.frames(voiced(), 2);
        assert_eq!(h.lp.state(), SessionState::Thinking);
    }

    #[tokio::test]
    async fn full_turn_reaches_idle_through_speaking() {
        let mut h = harness_with(Arc::new(FixedTranscriber("what is the weather")), false);
        h.start();
        h.speak_turn();
        h.events();

        let transcribed = h.completion().await;
        h.send(transcribed);
        assert_eq!(h.lp.session().current_transcript(), Some("what is the weather"));
        assert_eq!(
            h.events(),
            vec![OutboundEvent::Transcript {
                text: "what is the weather".into()
            }]
        );

        let responded = h.completion().await;
        h.send(responded);
        assert_eq!(h.lp.state(), SessionState::Speaking);
        assert_eq!(
            h.events(),
            vec![
                OutboundEvent::Response {
                    text: "You said: what is the weather".into()
                },
                OutboundEvent::Speaking,
            ]
        );

        let synthesized = h.completion().await;
        h.send(synthesized);
        let finished = h.completion().await;
        h.send(finished);
        assert_eq!(h.lp.state(), SessionState::Idle);
        assert_eq!(h.events(), vec![OutboundEvent::Idle]);
        assert_eq!(h.lp.session().history().len(), 1);
    }

    #[tokio::test]
    async fn pause_phrase_skips_generation() {
        let mut h = harness_with(Arc::new(FixedTranscriber("Alexa, hold on")), false);
        h.start();
        h.speak_turn();
        let transcribed = h.completion().await;
        h.send(transcribed);
        assert_eq!(h.lp.state(), SessionState::Paused);
        assert!(h.events().contains(&OutboundEvent::Paused));

        // Paused resumes on wake.
        h.command(ControlCommand::TriggerWake);
        assert_eq!(h.lp.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn end_session_clears_history() {
        let mut h = harness_with(Arc::new(FixedTranscriber("ok goodbye")), false);
        h.start();
        h.lp.session.set_transcript("earlier".into());
        h.lp.session.set_response("reply".into());
        assert_eq!(h.lp.session().history().len(), 1);

        h.speak_turn();
        let transcribed = h.completion().await;
        h.send(transcribed);
        assert_eq!(h.lp.state(), SessionState::Idle);
        assert!(h.lp.session().history().is_empty());
    }

    #[tokio::test]
    async fn stop_phrase_outside_speaking_is_content() {
        let mut h = harness_with(Arc::new(FixedTranscriber("thank you for the help")), false);
        h.start();
        h.speak_turn();
        let transcribed = h.completion().await;
        h.send(transcribed);
        assert_eq!(h.lp.state(), SessionState::Thinking);
        assert!(matches!(h.completion().await, LoopEvent::Responded { .. }));
    }

    #[tokio::test]
    async fn barge_in_stops_speaking_and_drops_stale_synthesis() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        let epoch = h.lp.session().epoch();
        h.lp.session.set_state(SessionState::Thinking);
        h.send(LoopEvent::Responded {
            epoch,
            result: Ok("Here is a long answer".into()),
        });
        assert_eq!(h.lp.state(), SessionState::Speaking);
        h.events();

        h.send(LoopEvent::Transcribed {
            epoch,
            purpose: CapturePurpose::BargeIn,
            result: Ok("please stop speaking now".into()),
        });
        assert_eq!(h.lp.state(), SessionState::Idle);
        assert_eq!(h.lp.session().epoch(), epoch + 1);
        assert_eq!(
            h.events(),
            vec![
                OutboundEvent::Transcript {
                    text: "please stop speaking now".into()
                },
                OutboundEvent::Idle,
            ]
        );

        // The synthesis dispatched for the old epoch completes now.
        let synthesized = h.completion().await;
        assert!(matches!(synthesized, LoopEvent::Synthesized { epoch: e, .. } if e == epoch));
        h.send(synthesized);
        assert_eq!(h.lp.state(), SessionState::Idle);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn ordinary_speech_during_playback_is_ignored() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        let epoch = h.lp.session().epoch();
        h.lp.session.set_state(SessionState::Thinking);
        h.send(LoopEvent::Responded {
            epoch,
            result: Ok("answer".into()),
        });
        h.events();

        h.send(LoopEvent::Transcribed {
            epoch,
            purpose: CapturePurpose::BargeIn,
            result: Ok("hmm interesting".into()),
        });
        assert_eq!(h.lp.state(), SessionState::Speaking);
        assert_eq!(h.lp.session().epoch(), epoch);
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn barge_in_capture_dispatches_transcription_while_speaking() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        let epoch = h.lp.session().epoch();
        h.lp.session.set_state(SessionState::Thinking);
        h.send(LoopEvent::Responded {
            epoch,
            result: Ok("answer".into()),
        });
        // Drain the synthesis completion without applying it.
        assert!(matches!(h.completion().await, LoopEvent::Synthesized { .. }));

        h.frames(voiced(), 4);
        h.frames(quiet(), 13);
        let completion = h.completion().await;
        assert!(matches!(
            completion,
            LoopEvent::Transcribed {
                purpose: CapturePurpose::BargeIn,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_completions_never_mutate_state() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        let old = h.lp.session().epoch();
        h.command(ControlCommand::StopAgent);
        h.start();
        h.command(ControlCommand::TriggerWake);
        assert!(h.lp.session().epoch() > old);
        h.events();

        let stale = [
            LoopEvent::Transcribed {
                epoch: old,
                purpose: CapturePurpose::Utterance,
                result: Ok("hello".into()),
            },
            LoopEvent::Responded {
                epoch: old,
                result: Err(AdapterError::failure(AdapterStage::Generation, "boom")),
            },
            LoopEvent::Synthesized {
                epoch: old,
                result: Ok(SpeechClip::Silent(Duration::ZERO)),
            },
            LoopEvent::PlaybackFinished {
                epoch: old,
                result: Ok(()),
            },
        ];
        for event in stale {
            h.send(event);
            assert_eq!(h.lp.state(), SessionState::Listening);
        }
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn adapter_failure_emits_error_then_idle() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        let epoch = h.lp.session().epoch();
        h.lp.session.set_state(SessionState::Thinking);
        h.events();

        h.send(LoopEvent::Responded {
            epoch,
            result: Err(AdapterError::timeout(
                AdapterStage::Generation,
                Duration::from_secs(60),
            )),
        });
        assert_eq!(h.lp.state(), SessionState::Idle);
        let events = h.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            OutboundEvent::Error { message, stage } => {
                assert!(message.starts_with("GenerationTimeout"));
                assert_eq!(*stage, Some(AdapterStage::Generation));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(events[1], OutboundEvent::Idle);
        assert!(h.lp.session().epoch() > epoch);
    }

    #[tokio::test]
    async fn trigger_wake_then_stop_ends_stopped() {
        let mut h = harness();
        h.start();
        h.command(ControlCommand::TriggerWake);
        h.frames(voiced(), 3);
        h.command(ControlCommand::StopAgent);
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert!(!h.lp.session().is_running());
        assert_eq!(h.log.lock().stops, 1);

        // Leftover frames from the retired source change nothing.
        let old_generation = h.lp.source_generation() - 1;
        h.send(LoopEvent::Frame(CapturedFrame {
            generation: old_generation,
            frame: voiced(),
            wake: Some("hey levial".into()),
        }));
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.completion())
                .await
                .is_err(),
            "nothing left pending"
        );
    }

    #[tokio::test]
    async fn stop_during_startup_cancels_the_open() {
        let mut h = harness();
        h.command(ControlCommand::StartAgent);
        let generation = h.lp.source_generation();
        h.command(ControlCommand::StopAgent);
        h.send(LoopEvent::SourceOpened {
            generation,
            result: Ok(()),
        });
        assert_eq!(h.lp.state(), SessionState::Stopped);
        assert!(!h.lp.session().is_running());
    }

    #[tokio::test]
    async fn update_config_applies_in_any_state_and_clamps() {
        let mut h = harness();
        h.command(ControlCommand::UpdateConfig(ConfigPatch {
            silence_duration: Some(42.0),
            proactivity_level: Some(0.4),
        }));
        let live = h.lp.live_config();
        assert_eq!(live.silence_duration_secs, 10.0);
        assert_eq!(live.proactivity_level, 0.4);
        assert_eq!(h.lp.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn knowledge_update_is_broadcast() {
        let mut h = harness();
        h.command(ControlCommand::UpdateKnowledge {
            updates: ProfileDelta {
                name: Some("Ada".into()),
                ..ProfileDelta::default()
            },
        });
        let event = tokio::time::timeout(Duration::from_secs(5), h.rx.recv())
            .await
            .expect("in time")
            .expect("open");
        h.send(event);
        assert_eq!(h.lp.profile().name.as_deref(), Some("Ada"));
        let events = h.events();
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::KnowledgeUpdate { profile }] if profile.name.as_deref() == Some("Ada")
        ));
    }

    #[tokio::test]
    async fn knowledge_update_survives_a_closed_loop() {
        let mut h = harness();
        let store = Arc::clone(&h.lp.profiles);
        let (_, closed) = mpsc::channel(1);
        drop(mem::replace(&mut h.rx, closed));

        h.command(ControlCommand::UpdateKnowledge {
            updates: ProfileDelta {
                name: Some("Ada".into()),
                ..ProfileDelta::default()
            },
        });
        let persisted = tokio::time::timeout(Duration::from_secs(5), async {
            while store.load().ok().and_then(|p| p.name).as_deref() != Some("Ada") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(persisted.is_ok(), "delta never reached the store");
        // Give the task time to hit the closed channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.events().is_empty());
        assert_eq!(h.lp.profile().name, None);
    }

    #[tokio::test]
    async fn level_telemetry_is_scaled_and_throttled() {
        let mut h = harness();
        h.start();
        h.events();
        h.frames(AudioFrame::new(vec![0.1; 1_280], 16_000), 4);
        let mut levels = Vec::new();
        while let Ok(event) = h.observer.try_recv() {
            if let OutboundEvent::AudioLevel { level } = event {
                levels.push(level);
            }
        }
        // 80 ms frames against a 100 ms interval: frames 1 and 3.
        assert_eq!(levels.len(), 2);
        approx::assert_relative_eq!(levels[0], 0.5, epsilon = 1e-4);
    }

    #[tokio::test]
    async fn shutdown_breaks_the_loop() {
        let mut h = harness();
        assert!(h.lp.handle(LoopEvent::Shutdown).is_break());
    }
}
