//! Collaborators that need neither network nor audio hardware
//!
//! Used by `parley run --simulate` and by tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cleanup::CLIP_PREFIX;
use super::{PlaybackOutcome, Player, Synthesizer, Transcriber};
use crate::audio::{RecordedAudio, samples_to_wav};
use crate::cancel::CancellationToken;
use crate::{Error, Result};

/// Rate of the silent clips
const SILENT_RATE: u32 = 16000;

/// Writes a short silent WAV for every request
#[derive(Debug, Clone)]
pub struct SilentSynthesizer {
    dir: PathBuf,
    length: Duration,
}

impl SilentSynthesizer {
    /// Write clips of `length` into `dir`
    ///
    /// # Errors
    ///
    /// Returns error if `dir` cannot be created
    pub fn new(dir: &Path, length: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            length,
        })
    }
}

impl Synthesizer for SilentSynthesizer {
    fn synthesize(&self, text: &str, _voice: &str) -> Result<PathBuf> {
        let frames = crate::audio::frames_for(self.length, SILENT_RATE);
        let wav = samples_to_wav(&vec![0.0; frames], SILENT_RATE)?;
        let path = self
            .dir
            .join(format!("{CLIP_PREFIX}{}.wav", uuid::Uuid::new_v4().simple()));
        std::fs::write(&path, wav)?;
        tracing::debug!(chars = text.chars().count(), path = %path.display(), "silent clip written");
        Ok(path)
    }
}

/// Pretends to play; waits on the token for a fixed time
#[derive(Debug, Clone, Default)]
pub struct NullPlayer {
    hold: Duration,
}

impl NullPlayer {
    /// Player whose clips last `hold`
    #[must_use]
    pub const fn new(hold: Duration) -> Self {
        Self { hold }
    }
}

impl Player for NullPlayer {
    fn play(&self, path: &Path, stop: &CancellationToken) -> Result<PlaybackOutcome> {
        tracing::trace!(path = %path.display(), "null playback");
        if stop.wait(self.hold) {
            return Ok(PlaybackOutcome::Interrupted {
                reason: stop.reason().unwrap_or_default(),
            });
        }
        Ok(PlaybackOutcome::Completed)
    }

    fn reset(&self) {}
}

/// Transcriber used when no speech-to-text backend is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableTranscriber;

impl Transcriber for UnavailableTranscriber {
    fn transcribe(&self, audio: RecordedAudio) -> Result<String> {
        tracing::warn!(
            duration_ms = audio.duration().as_millis(),
            "dropping recording: no transcriber configured"
        );
        Err(Error::Stt("no transcriber configured".to_string()))
    }
}
