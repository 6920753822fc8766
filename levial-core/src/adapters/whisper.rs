//! Transcriber backed by the whisper.cpp command-line tool.
//!
//! Each utterance is written as a 16-bit mono WAV into the artifacts directory,
//! then `whisper-cli -m <model> -f <wav> -nt -np -otxt -of <stem>` produces
//! `<stem>.txt`, which holds the transcript. whisper-cli appends `.txt` to the
//! stem verbatim, so the stem must not carry a dot of its own.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use super::process::{spawn, supervise, ChildOutcome};
use super::{AdapterError, AdapterStage, Transcriber};
use crate::buffering::utterance::Utterance;

#[derive(Debug, Clone)]
pub struct WhisperCli {
    pub binary: PathBuf,
    pub model: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Kill the CLI after this long.
    pub deadline: Duration,
}

impl WhisperCli {
    pub fn new(binary: PathBuf, model: PathBuf, artifacts_dir: PathBuf, deadline: Duration) -> Self {
        Self {
            binary,
            model,
            artifacts_dir,
            deadline,
        }
    }

    /// Unique per call; the wake worker and the session loop may transcribe
    /// concurrently.
    fn artifact_stem(&self) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%3f");
        self.artifacts_dir.join(format!("utterance_{stamp}-{seq}"))
    }
}

/// `<stem>.<ext>`, appended rather than substituted.
fn with_suffix(stem: &Path, ext: &str) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

impl Transcriber for WhisperCli {
    fn transcribe(&self, utterance: &Utterance) -> Result<String, AdapterError> {
        let stage = AdapterStage::Transcription;
        std::fs::create_dir_all(&self.artifacts_dir)
            .map_err(|e| AdapterError::failure(stage, format!("artifacts dir: {e}")))?;

        let stem = self.artifact_stem();
        let wav_path = with_suffix(&stem, "wav");
        write_wav(&wav_path, utterance)
            .map_err(|e| AdapterError::failure(stage, format!("write {wav_path:?}: {e}")))?;

        debug!(wav = ?wav_path, seconds = utterance.duration().as_secs_f32(), "running whisper-cli");
        let mut command = Command::new(&self.binary);
        command
            .arg("-m")
            .arg(&self.model)
            .arg("-f")
            .arg(&wav_path)
            .args(["-nt", "-np", "-otxt", "-of"])
            .arg(&stem)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = spawn(&mut command, stage)?;

        match supervise(child, stage, self.deadline, None)? {
            ChildOutcome::Exited(status) if status.success() => {}
            ChildOutcome::Exited(status) => {
                return Err(AdapterError::failure(
                    stage,
                    format!("whisper-cli exited with {status}"),
                ))
            }
            ChildOutcome::Stopped => {
                return Err(AdapterError::failure(stage, "whisper-cli was stopped"))
            }
        }

        let txt_path = with_suffix(&stem, "txt");
        let raw = std::fs::read_to_string(&txt_path)
            .map_err(|e| AdapterError::failure(stage, format!("read {txt_path:?}: {e}")))?;
        let transcript = clean_transcript(&raw);
        info!(chars = transcript.len(), "transcription complete");
        Ok(transcript)
    }
}

/// Write f32 samples as 16-bit PCM mono.
pub fn write_wav(path: &Path, utterance: &Utterance) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: utterance.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in &utterance.samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize()
}

/// Join output lines and drop whisper's non-speech markers like `[BLANK_AUDIO]`.
fn clean_transcript(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !(line.starts_with('[') && line.ends_with(']')))
        .collect::<Vec<_>>()
        .join(" ")
}
