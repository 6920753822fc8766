//! Collaborator wiring: local model services or the echo stubs.

use std::sync::Arc;
use std::time::Duration;

use levial_core::{
    adapters::{
        stub::{StubResponder, StubSynthesizer, StubTranscriber},
        OllamaResponder, PiperCli, ProcessPlayer, WhisperCli,
    },
    audio::{MicrophoneSource, VirtualMicrophone},
    engine::AdapterTimeouts,
    profile::JsonProfileStore,
    wake::{ManualWake, TranscriptWake, WakeTuning, WakeWordDetector},
    Collaborators, ObserverHub, Services,
};
use tracing::info;

use crate::settings::{AppSettings, WakeMode};

/// `hub` gates the transcript wake detector so whisper only runs on idle
/// speech.
pub fn build_collaborators(
    settings: &AppSettings,
    hub: &Arc<ObserverHub>,
) -> anyhow::Result<Collaborators> {
    let timeouts = settings.orchestrator.timeouts;
    let profiles = Arc::new(JsonProfileStore::new(settings.profile_path()));

    if settings.stub_services {
        info!("using stub services and a virtual microphone");
        let audio = settings.orchestrator.audio;
        let pace = Duration::from_secs_f64(
            audio.frame_samples as f64 / f64::from(audio.target_sample_rate),
        );
        // Nothing feeds the virtual microphone; it produces silence at real-time pace.
        let (source, _feed) =
            VirtualMicrophone::new(audio.target_sample_rate, audio.frame_samples, pace);
        return Ok(Collaborators {
            services: Services {
                transcriber: Arc::new(StubTranscriber),
                responder: Arc::new(StubResponder),
                synthesizer: Arc::new(StubSynthesizer),
                playback: Arc::new(player(settings, &timeouts)),
            },
            profiles,
            source: Box::new(source),
        });
    }

    let artifacts = settings.artifacts_dir();
    info!(
        whisper = %settings.whisper_binary,
        piper = %settings.piper_binary,
        ollama = %settings.ollama_url,
        model = %settings.ollama_model,
        artifacts = ?artifacts,
        "using local services"
    );
    let whisper = Arc::new(WhisperCli::new(
        settings.whisper_binary.clone().into(),
        settings.whisper_model.clone(),
        artifacts.clone(),
        timeouts.transcription(),
    ));
    let wake: Box<dyn WakeWordDetector> = match settings.wake_mode {
        WakeMode::Manual => {
            info!("wake phrase detection off, use trigger_wake");
            Box::new(ManualWake)
        }
        WakeMode::Transcript => {
            let hub = Arc::clone(hub);
            let detector = TranscriptWake::spawn(
                whisper.clone(),
                &settings.orchestrator.phrases.wake,
                &settings.orchestrator.audio,
                WakeTuning::default(),
            )?
            .gated(move || hub.state().accepts_wake());
            Box::new(detector)
        }
    };
    Ok(Collaborators {
        services: Services {
            transcriber: whisper,
            responder: Arc::new(OllamaResponder::new(
                settings.ollama_url.clone(),
                settings.ollama_model.clone(),
                timeouts.generation(),
            )),
            synthesizer: Arc::new(PiperCli::new(
                settings.piper_binary.clone().into(),
                settings.piper_voice.clone(),
                artifacts,
                timeouts.synthesis(),
            )),
            playback: Arc::new(player(settings, &timeouts)),
        },
        profiles,
        source: Box::new(MicrophoneSource::new(
            settings.preferred_input_device.clone(),
            settings.orchestrator.audio,
            wake,
        )),
    })
}

fn player(settings: &AppSettings, timeouts: &AdapterTimeouts) -> ProcessPlayer {
    match settings.player_command.split_first() {
        Some((program, args)) => {
            ProcessPlayer::new(program.clone(), args.to_vec(), timeouts.playback())
        }
        None => ProcessPlayer::system_default(timeouts.playback()),
    }
}
