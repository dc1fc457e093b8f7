//! One user turn of recording
//!
//! A session waits for speech, records until the endpoint policy sees
//! enough trailing silence, and hands back the utterance as a WAV file.
//! It never reads while the mic gate is closed and never runs past its
//! wall-clock budget, gate-off time included.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::classifier::SpeechClassifier;
use super::clock::Clock;
use super::endpoint::EndpointPolicy;
use super::mic::MicStreamManager;
use super::{RecordedAudio, Utterance, duration_of, frames_for, rms_energy};
use crate::Result;
use crate::cancel::CancellationToken;

/// Why a recording with speech ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Trailing silence exceeded the endpoint timeout
    Silence,
    /// The wall-clock budget ran out mid-utterance
    MaxDuration,
}

/// Result of one recording session
#[derive(Debug)]
pub enum RecordingOutcome {
    /// Speech was captured
    Finalized {
        /// The recording, owned by the caller from here on
        audio: RecordedAudio,
        /// What ended it
        reason: StopReason,
    },
    /// The budget ran out before any speech
    NoSpeech,
    /// Stopped through the cancellation token
    Cancelled {
        /// Reason given to the token
        reason: String,
    },
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Audio read per iteration
    pub chunk: Duration,
    /// Sleep while the gate is closed
    pub gate_poll: Duration,
    /// Wall-clock budget for the whole session
    pub max_total: Duration,
    /// Speech shorter than this gets the reduced endpoint tail
    pub short_utterance: Duration,
    /// Upper bound on a single stream read
    pub read_timeout: Duration,
    /// Pause after a failed read
    pub read_error_backoff: Duration,
    /// Trailing-silence policy
    pub endpoint: EndpointPolicy,
    /// Persist recordings here instead of deleting them
    pub keep_dir: Option<PathBuf>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            chunk: Duration::from_millis(500),
            gate_poll: Duration::from_millis(100),
            max_total: Duration::from_secs(30),
            short_utterance: Duration::from_millis(1500),
            read_timeout: Duration::from_secs(2),
            read_error_backoff: Duration::from_millis(100),
            endpoint: EndpointPolicy::default(),
            keep_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitingForSpeech,
    Recording,
}

/// Records user turns from the shared microphone
pub struct RecordingSession {
    mic: Arc<MicStreamManager>,
    classifier: Arc<dyn SpeechClassifier>,
    clock: Arc<dyn Clock>,
    settings: RecorderSettings,
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("classifier", &self.classifier.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RecordingSession {
    /// Create a session factory bound to the shared mic
    #[must_use]
    pub fn new(
        mic: Arc<MicStreamManager>,
        classifier: Arc<dyn SpeechClassifier>,
        clock: Arc<dyn Clock>,
        settings: RecorderSettings,
    ) -> Self {
        Self {
            mic,
            classifier,
            clock,
            settings,
        }
    }

    /// Active settings
    #[must_use]
    pub const fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Record one utterance
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Busy`] if another session holds the capture
    /// lease, or an error if the finished recording cannot be written.
    pub fn record(&self, cancel: &CancellationToken) -> Result<RecordingOutcome> {
        let lease = self.mic.acquire_capture()?;
        let sample_rate = self.mic.sample_rate();
        let chunk_frames = frames_for(self.settings.chunk, sample_rate);

        let started = self.clock.now();
        let mut phase = Phase::WaitingForSpeech;
        let mut buffer: Vec<f32> = Vec::new();
        let mut speech = Duration::ZERO;
        let mut silence = Duration::ZERO;

        tracing::debug!(
            classifier = self.classifier.name(),
            max_total_secs = self.settings.max_total.as_secs_f64(),
            "recording session started"
        );

        let reason = loop {
            if let Some(reason) = cancel.reason() {
                tracing::debug!(reason, "recording cancelled");
                return Ok(RecordingOutcome::Cancelled { reason });
            }

            if self.clock.now().saturating_sub(started) > self.settings.max_total {
                if phase == Phase::WaitingForSpeech {
                    tracing::info!("no speech detected within time limit");
                    return Ok(RecordingOutcome::NoSpeech);
                }
                tracing::info!("maximum recording time reached, finalizing");
                break StopReason::MaxDuration;
            }

            if !self.mic.is_open() {
                self.clock.sleep(self.settings.gate_poll);
                continue;
            }

            let chunk = match lease.read(chunk_frames, self.settings.read_timeout) {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(error = %e, "error reading from stream");
                    self.clock.sleep(self.settings.read_error_backoff);
                    continue;
                }
            };
            // audio time, not wall time; reads may return early or late
            let chunk_time = duration_of(chunk.len(), sample_rate);

            if self.classifier.classify(&chunk, sample_rate) {
                if phase == Phase::WaitingForSpeech {
                    tracing::info!("speech detected, recording started");
                    phase = Phase::Recording;
                }
                buffer.extend_from_slice(&chunk);
                speech += chunk_time;
                silence = Duration::ZERO;
            } else if phase == Phase::Recording {
                buffer.extend_from_slice(&chunk);
                silence += chunk_time;

                let timeout_ms = self.settings.endpoint.next_timeout_ms(
                    rms_energy(&chunk),
                    speech < self.settings.short_utterance,
                );
                tracing::trace!(
                    silence_ms = silence.as_millis(),
                    timeout_ms,
                    "trailing silence"
                );
                if silence > Duration::from_millis(timeout_ms) {
                    tracing::info!(
                        speech_ms = speech.as_millis(),
                        silence_ms = silence.as_millis(),
                        "silence detected, finalizing"
                    );
                    break StopReason::Silence;
                }
            }
        };

        drop(lease);
        let utterance = Utterance::new(buffer, sample_rate);
        let audio = utterance.into_wav(self.settings.keep_dir.as_deref())?;
        Ok(RecordingOutcome::Finalized { audio, reason })
    }
}
