//! Microphone side of the assistant
//!
//! Everything that touches capture lives here: the physical stream
//! abstraction, the manager that serializes access to it, the logical mic
//! gate, endpointing and the recording session itself.

pub mod capture;
pub mod classifier;
pub mod clock;
pub mod device;
pub mod endpoint;
pub mod mic;
pub mod recorder;
pub mod synthetic;
pub mod watchdog;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rubato::{FftFixedIn, Resampler as _};
use tempfile::TempPath;

use crate::{Error, Result};

pub use capture::CpalInput;
pub use classifier::{
    AmplitudeClassifier, ClassifierKind, EarshotClassifier, SpeechClassifier, select_classifier,
};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use device::{InputDevice, InputStream, StreamRole, StreamSpec};
pub use endpoint::EndpointPolicy;
pub use mic::{CaptureLease, GateObserver, MicGate, MicSettings, MicStreamManager, MuteGuard};
pub use recorder::{RecorderSettings, RecordingOutcome, RecordingSession, StopReason};
pub use synthetic::SyntheticInput;
pub use watchdog::{DeviceWatchdog, WatchdogPolicy};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Number of frames covering `duration` at `sample_rate`
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn frames_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}

/// Playing time of `frames` samples at `sample_rate`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn duration_of(frames: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate))
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Largest absolute sample value
#[must_use]
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
}

/// A finalized, immutable span of mono speech
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Utterance {
    /// Wrap concatenated chunk samples
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Raw samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether no samples were recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        duration_of(self.samples.len(), self.sample_rate)
    }

    /// Encode as 16-bit WAV on disk
    ///
    /// With `keep_dir` set the file is written there and survives the
    /// returned value; otherwise it lives in a temp file deleted on drop.
    ///
    /// # Errors
    ///
    /// Returns error if the utterance is empty or the file cannot be written
    pub fn into_wav(self, keep_dir: Option<&Path>) -> Result<RecordedAudio> {
        if self.is_empty() {
            return Err(Error::Audio("refusing to write empty recording".to_string()));
        }

        let duration = self.duration();
        let file = if let Some(dir) = keep_dir {
            std::fs::create_dir_all(dir)?;
            let name = format!(
                "rec_{}_{}.wav",
                chrono::Local::now().format("%Y%m%d_%H%M%S"),
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            let path = dir.join(name);
            std::fs::write(&path, samples_to_wav(&self.samples, self.sample_rate)?)?;
            AudioFile::Kept(path)
        } else {
            let temp = tempfile::Builder::new()
                .prefix("parley_rec_")
                .suffix(".wav")
                .tempfile()?;
            std::fs::write(temp.path(), samples_to_wav(&self.samples, self.sample_rate)?)?;
            AudioFile::Temp(temp.into_temp_path())
        };

        tracing::debug!(
            path = %file.path().display(),
            duration_ms = duration.as_millis(),
            "recording written"
        );

        Ok(RecordedAudio {
            file,
            duration,
            sample_rate: self.sample_rate,
        })
    }
}

#[derive(Debug)]
enum AudioFile {
    Temp(TempPath),
    Kept(PathBuf),
}

impl AudioFile {
    fn path(&self) -> &Path {
        match self {
            Self::Temp(temp) => &**temp,
            Self::Kept(path) => path.as_path(),
        }
    }
}

/// A recording on disk, handed by value to the transcriber
///
/// Dropping it deletes the file unless it was written under the keep policy.
#[derive(Debug)]
pub struct RecordedAudio {
    file: AudioFile,
    duration: Duration,
    sample_rate: u32,
}

impl RecordedAudio {
    /// Location of the WAV file
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Length of the recorded audio
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Sample rate of the encoded audio
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the file outlives this value
    #[must_use]
    pub const fn is_kept(&self) -> bool {
        matches!(self.file, AudioFile::Kept(_))
    }

    /// Read the encoded WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path())?)
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }

        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Average interleaved channels down to mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = usize::from(channels);
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio between rates
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, chunk_size, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let expected = (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).round()
        as usize;
    let mut output = Vec::with_capacity(expected + chunk_size);

    for chunk in samples.chunks(chunk_size) {
        let mut block = chunk.to_vec();
        block.resize(chunk_size, 0.0);
        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }

    output.truncate(expected);
    Ok(output)
}
