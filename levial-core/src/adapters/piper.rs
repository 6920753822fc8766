//! Synthesizer backed by the piper command-line tool.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

use super::process::{spawn, supervise, ChildOutcome};
use super::{AdapterError, AdapterStage, SpeechClip, Synthesizer};

#[derive(Debug, Clone)]
pub struct PiperCli {
    pub binary: PathBuf,
    pub voice: PathBuf,
    pub artifacts_dir: PathBuf,
    pub deadline: Duration,
}

impl PiperCli {
    pub fn new(binary: PathBuf, voice: PathBuf, artifacts_dir: PathBuf, deadline: Duration) -> Self {
        Self {
            binary,
            voice,
            artifacts_dir,
            deadline,
        }
    }
}

impl Synthesizer for PiperCli {
    fn synthesize(&self, text: &str) -> Result<SpeechClip, AdapterError> {
        let stage = AdapterStage::Synthesis;
        std::fs::create_dir_all(&self.artifacts_dir)
            .map_err(|e| AdapterError::failure(stage, format!("artifacts dir: {e}")))?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%3f");
        let out = self.artifacts_dir.join(format!("response_{stamp}.wav"));

        let mut command = Command::new(&self.binary);
        command
            .arg("--model")
            .arg(&self.voice)
            .arg("--output_file")
            .arg(&out)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = spawn(&mut command, stage)?;

        // Dropping stdin after the write closes it so piper starts synthesis.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(text.as_bytes()) {
                let _ = child.kill();
                return Err(AdapterError::failure(stage, format!("piper stdin: {e}")));
            }
        }

        match supervise(child, stage, self.deadline, None)? {
            ChildOutcome::Exited(status) if status.success() => {
                debug!(clip = ?out, "synthesis complete");
                Ok(SpeechClip::File(out))
            }
            ChildOutcome::Exited(status) => Err(AdapterError::failure(
                stage,
                format!("piper exited with {status}"),
            )),
            ChildOutcome::Stopped => Err(AdapterError::failure(stage, "piper was stopped")),
        }
    }
}
