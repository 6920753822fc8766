//! Child-process plumbing shared by the CLI adapters, and the process-based
//! audio player.
//!
//! The local services (whisper.cpp, piper, the system player) are driven as
//! child processes. Each call polls its child against its own deadline and an
//! optional stop flag, and kills the child when either trips, so a hung
//! service never outlives its turn.

use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{AdapterError, AdapterStage, Playback, SpeechClip};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a supervised child finished.
#[derive(Debug)]
pub enum ChildOutcome {
    Exited(ExitStatus),
    /// The stop flag was raised and the child was killed.
    Stopped,
}

/// Wait for `child`, killing it on `deadline` or when `stop` is raised.
pub fn supervise(
    mut child: Child,
    stage: AdapterStage,
    deadline: Duration,
    stop: Option<&AtomicBool>,
) -> Result<ChildOutcome, AdapterError> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(ChildOutcome::Exited(status)),
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                return Err(AdapterError::failure(stage, format!("wait failed: {e}")));
            }
        }

        if stop.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            debug!(?stage, "stop requested, killing child");
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ChildOutcome::Stopped);
        }

        if started.elapsed() >= deadline {
            warn!(?stage, ?deadline, "child exceeded deadline, killing");
            let _ = child.kill();
            let _ = child.wait();
            return Err(AdapterError::timeout(stage, deadline));
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Spawn `command`, mapping spawn errors (missing binary, permissions) to a
/// stage failure.
pub fn spawn(command: &mut Command, stage: AdapterStage) -> Result<Child, AdapterError> {
    command
        .spawn()
        .map_err(|e| AdapterError::failure(stage, format!("failed to launch {command:?}: {e}")))
}

/// Plays synthesized clips through an external player (`afplay` / `aplay`).
#[derive(Debug, Clone)]
pub struct ProcessPlayer {
    program: String,
    args: Vec<String>,
    max_duration: Duration,
}

impl ProcessPlayer {
    pub fn new(program: impl Into<String>, args: Vec<String>, max_duration: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            max_duration,
        }
    }

    /// Platform default player.
    pub fn system_default(max_duration: Duration) -> Self {
        #[cfg(target_os = "macos")]
        let (program, args) = ("afplay", Vec::new());
        #[cfg(not(target_os = "macos"))]
        let (program, args) = ("aplay", vec!["-q".to_string()]);
        Self::new(program, args, max_duration)
    }
}

impl Playback for ProcessPlayer {
    fn play(&self, clip: &SpeechClip, stop: &AtomicBool) -> Result<(), AdapterError> {
        match clip {
            SpeechClip::Silent(duration) => {
                let started = Instant::now();
                while started.elapsed() < *duration {
                    if stop.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    std::thread::sleep(POLL_INTERVAL.min(*duration));
                }
                Ok(())
            }
            SpeechClip::File(path) => {
                let mut command = Command::new(&self.program);
                command
                    .args(&self.args)
                    .arg(path)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                let child = spawn(&mut command, AdapterStage::Playback)?;
                match supervise(child, AdapterStage::Playback, self.max_duration, Some(stop))? {
                    ChildOutcome::Stopped => Ok(()),
                    ChildOutcome::Exited(status) if status.success() => Ok(()),
                    ChildOutcome::Exited(status) => Err(AdapterError::failure(
                        AdapterStage::Playback,
                        format!("{} exited with {status}", self.program),
                    )),
                }
            }
        }
    }
}
