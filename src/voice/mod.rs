//! Voice processing module
//!
//! Speaker side of the assistant: transcription, synthesis, playback, the
//! single-flight speech output session and the barge-in listener.

pub mod cleanup;
pub mod interrupt;
pub mod offline;
pub mod playback;
pub mod speech;
pub mod stt;
pub mod tts;

use std::path::{Path, PathBuf};

use crate::Result;
use crate::audio::RecordedAudio;
use crate::cancel::CancellationToken;

pub use cleanup::CleanupQueue;
pub use interrupt::{InterruptListener, InterruptSettings};
pub use offline::{NullPlayer, SilentSynthesizer, UnavailableTranscriber};
pub use playback::CpalPlayer;
pub use speech::{SpeechOutcome, SpeechOutput, SpeechSettings, SpeechTicket};
pub use stt::WhisperTranscriber;
pub use tts::CloudSynthesizer;

/// Turns a recording into text
pub trait Transcriber: Send + Sync {
    /// Transcribe and consume the recording
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    fn transcribe(&self, audio: RecordedAudio) -> Result<String>;
}

/// Renders text to an audio file
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with `voice`, returning the written file
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    fn synthesize(&self, text: &str, voice: &str) -> Result<PathBuf>;
}

/// How a playback ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to the end
    Completed,
    /// Stopped through the token
    Interrupted {
        /// Reason given to the token
        reason: String,
    },
    /// Cut off by the hard timeout
    TimedOut,
}

/// Plays an audio file on the output device
pub trait Player: Send + Sync {
    /// Play `path` until it ends, `stop` is cancelled, or the hard timeout
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be decoded or the device fails
    fn play(&self, path: &Path, stop: &CancellationToken) -> Result<PlaybackOutcome>;

    /// Release and reacquire the output device
    fn reset(&self);

    /// Short cue tone (best effort)
    fn chime(&self) {}
}
