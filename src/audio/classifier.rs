//! Speech/non-speech classification of recorded chunks
//!
//! The classifier is chosen once at startup and shared by every recording
//! session. The model-backed variant wraps `earshot`; the amplitude variant
//! needs no model and is what synthetic tests run against.

use std::sync::{Arc, Mutex, PoisonError};

use earshot::{VoiceActivityDetector, VoiceActivityProfile};
use serde::Deserialize;

use super::{SAMPLE_RATE, peak_amplitude};

/// Decides whether a chunk of mono audio contains speech
pub trait SpeechClassifier: Send + Sync {
    /// Classify one chunk
    fn classify(&self, chunk: &[f32], sample_rate: u32) -> bool;

    /// Short identifier for logs
    fn name(&self) -> &'static str;
}

/// Which classifier to build at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Model-backed voice activity detection
    #[default]
    Earshot,
    /// Peak amplitude threshold
    Amplitude,
}

/// Build the classifier for the configured kind
#[must_use]
pub fn select_classifier(kind: ClassifierKind) -> Arc<dyn SpeechClassifier> {
    let classifier: Arc<dyn SpeechClassifier> = match kind {
        ClassifierKind::Earshot => Arc::new(EarshotClassifier::new()),
        ClassifierKind::Amplitude => Arc::new(AmplitudeClassifier::default()),
    };
    tracing::info!(classifier = classifier.name(), "speech classifier selected");
    classifier
}

/// Speech if any sample exceeds a fixed peak
#[derive(Debug, Clone, Copy)]
pub struct AmplitudeClassifier {
    threshold: f32,
}

impl AmplitudeClassifier {
    /// Default peak threshold
    pub const DEFAULT_THRESHOLD: f32 = 0.05;

    /// Create with a custom threshold
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Default for AmplitudeClassifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl SpeechClassifier for AmplitudeClassifier {
    fn classify(&self, chunk: &[f32], _sample_rate: u32) -> bool {
        peak_amplitude(chunk) > self.threshold
    }

    fn name(&self) -> &'static str {
        "amplitude"
    }
}

/// 30 ms at 16 kHz
const FRAME_SAMPLES: usize = 480;

/// Consecutive voiced frames needed to call a chunk speech (~240 ms)
const MIN_VOICED_FRAMES: usize = 8;

/// Voice activity detection backed by `earshot`
///
/// A chunk counts as speech when it holds a run of voiced frames long
/// enough to be a syllable rather than a click.
pub struct EarshotClassifier {
    detector: Mutex<VoiceActivityDetector>,
    fallback: AmplitudeClassifier,
}

impl std::fmt::Debug for EarshotClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EarshotClassifier").finish_non_exhaustive()
    }
}

impl EarshotClassifier {
    /// Create a detector with the quality profile
    #[must_use]
    pub fn new() -> Self {
        Self {
            detector: Mutex::new(VoiceActivityDetector::new(VoiceActivityProfile::QUALITY)),
            fallback: AmplitudeClassifier::default(),
        }
    }
}

impl Default for EarshotClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped >= 0.0 {
        (clamped * f32::from(i16::MAX)).round() as i16
    } else {
        (clamped * 32_768.0).round() as i16
    }
}

impl SpeechClassifier for EarshotClassifier {
    fn classify(&self, chunk: &[f32], sample_rate: u32) -> bool {
        if sample_rate != SAMPLE_RATE {
            tracing::debug!(sample_rate, "earshot needs 16kHz, using amplitude");
            return self.fallback.classify(chunk, sample_rate);
        }

        let mut detector = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut frame = Vec::with_capacity(FRAME_SAMPLES);
        let mut run = 0usize;

        for samples in chunk.chunks(FRAME_SAMPLES) {
            frame.clear();
            frame.extend(samples.iter().copied().map(float_sample_to_i16));
            frame.resize(FRAME_SAMPLES, 0);

            match detector.predict_16khz(&frame) {
                Ok(true) => {
                    run += 1;
                    if run >= MIN_VOICED_FRAMES {
                        return true;
                    }
                }
                Ok(false) => run = 0,
                Err(e) => {
                    tracing::trace!(error = ?e, "earshot frame rejected");
                    run = 0;
                }
            }
        }

        false
    }

    fn name(&self) -> &'static str {
        "earshot"
    }
}
