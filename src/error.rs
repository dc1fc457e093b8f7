//! Error types for the Parley voice assistant

use thiserror::Error;

/// Result type alias for Parley operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the assistant core and its collaborators
///
/// Cancellation is deliberately absent: interrupted recordings and playback
/// are reported through outcome enums, not errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing device, model, key, or bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient audio device or driver failure
    #[error("audio error: {0}")]
    Audio(String),

    /// A guarded device operation failed on every attempt
    #[error("device error after {attempts} attempts: {message}")]
    Device {
        /// Number of consecutive failed attempts
        attempts: u32,
        /// Message of the last failure
        message: String,
    },

    /// A single-owner resource is already held
    #[error("resource busy: {0}")]
    Busy(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// Language model error
    #[error("LLM error: {0}")]
    Llm(String),

    /// A collaborator call exceeded its deadline
    #[error("{operation} timed out after {seconds:.1}s")]
    Timeout {
        /// Name of the operation that timed out
        operation: &'static str,
        /// Deadline that was exceeded
        seconds: f64,
    },

    /// Persistence store error
    #[error("store error: {0}")]
    Store(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// WAV encoding or decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Audio(_) | Self::Busy(_) | Self::Io(_))
    }

    /// Whether the error came from an external collaborator
    /// (transcription, turn handling, synthesis, playback)
    #[must_use]
    pub const fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            Self::Stt(_)
                | Self::Tts(_)
                | Self::Llm(_)
                | Self::Playback(_)
                | Self::Timeout { .. }
                | Self::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_message() {
        let err = Error::Device {
            attempts: 3,
            message: "stream vanished".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "device error after 3 attempts: stream vanished"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_taxonomy() {
        assert!(Error::Audio("underrun".into()).is_transient());
        assert!(Error::Stt("empty".into()).is_collaborator_failure());
        assert!(
            Error::Timeout {
                operation: "turn",
                seconds: 1.0
            }
            .is_collaborator_failure()
        );
        assert!(!Error::Config("no device".into()).is_collaborator_failure());
    }
}
