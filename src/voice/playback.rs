//! Audio playback to speakers

use std::f32::consts::TAU;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use super::{PlaybackOutcome, Player};
use crate::audio::{DeviceWatchdog, WatchdogPolicy, downmix, resample};
use crate::cancel::CancellationToken;
use crate::{Error, Result};

/// Poll interval while waiting for playback to finish
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Rate used for the generated listening cue
const CHIME_SAMPLE_RATE: u32 = 24000;

/// Plays decoded MP3 and WAV files on the default output device
pub struct CpalPlayer {
    slack: Duration,
    watchdog: DeviceWatchdog,
    config: Mutex<Option<StreamConfig>>,
}

impl std::fmt::Debug for CpalPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalPlayer")
            .field("slack", &self.slack)
            .finish_non_exhaustive()
    }
}

impl CpalPlayer {
    /// Create a player
    ///
    /// `slack` is added to each clip's length to form its hard timeout.
    #[must_use]
    pub fn new(slack: Duration, watchdog: WatchdogPolicy) -> Self {
        Self {
            slack,
            watchdog: DeviceWatchdog::without_reinit(watchdog),
            config: Mutex::new(None),
        }
    }

    /// Names of the available output devices
    #[must_use]
    pub fn list_devices() -> Vec<String> {
        cpal::default_host()
            .output_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }

    fn open_output(&self, sample_rate: u32) -> Result<(Device, StreamConfig)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let mut cached = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = cached.as_ref() {
            if config.sample_rate.0 == sample_rate {
                return Ok((device, config.clone()));
            }
        }

        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() <= 2
                    && c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .map(|c| c.with_sample_rate(SampleRate(sample_rate)));

        let config = match supported {
            Some(config) => config.config(),
            // Fallback: device default, resampled on our side
            None => device
                .default_output_config()
                .map_err(|e| Error::Audio(e.to_string()))?
                .config(),
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        *cached = Some(config.clone());
        Ok((device, config))
    }

    fn play_samples(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        stop: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        if samples.is_empty() {
            return Ok(PlaybackOutcome::Completed);
        }

        let (device, config) = self
            .watchdog
            .guard("output open", || self.open_output(sample_rate))?;

        let samples = resample(&samples, sample_rate, config.sample_rate.0)?;
        play_samples_blocking(&device, &config, samples, stop, self.slack)
    }
}

impl Player for CpalPlayer {
    fn play(&self, path: &Path, stop: &CancellationToken) -> Result<PlaybackOutcome> {
        if let Some(reason) = stop.reason() {
            return Ok(PlaybackOutcome::Interrupted { reason });
        }
        let (samples, sample_rate) = decode_file(path)?;
        self.play_samples(samples, sample_rate, stop)
    }

    fn reset(&self) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::debug!("output device reset");
    }

    fn chime(&self) {
        let samples = chime_samples(CHIME_SAMPLE_RATE);
        if let Err(e) = self.play_samples(samples, CHIME_SAMPLE_RATE, &CancellationToken::new()) {
            tracing::debug!(error = %e, "listening cue failed");
        }
    }
}

/// Play samples, blocking until done, stopped or out of time
fn play_samples_blocking(
    device: &Device,
    config: &StreamConfig,
    samples: Vec<f32>,
    stop: &CancellationToken,
    slack: Duration,
) -> Result<PlaybackOutcome> {
    let channels = usize::from(config.channels);
    let sample_count = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));
    let halted = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let finished = Arc::clone(&finished);
        let halted = Arc::clone(&halted);
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let halt = halted.load(Ordering::Relaxed);
                    let mut pos = position.load(Ordering::Relaxed);

                    for frame in data.chunks_mut(channels) {
                        let sample = if !halt && pos < samples.len() {
                            pos += 1;
                            samples[pos - 1]
                        } else {
                            finished.store(true, Ordering::Relaxed);
                            0.0
                        };

                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }

                    position.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(config.sample_rate.0);
    let timeout = Duration::from_millis(duration_ms) + slack;
    let start = Instant::now();

    let outcome = loop {
        if finished.load(Ordering::Relaxed) {
            break PlaybackOutcome::Completed;
        }
        if let Some(reason) = stop.reason() {
            halted.store(true, Ordering::Relaxed);
            break PlaybackOutcome::Interrupted { reason };
        }
        if start.elapsed() > timeout {
            halted.store(true, Ordering::Relaxed);
            tracing::warn!(timeout_ms = timeout.as_millis(), "playback hard timeout");
            break PlaybackOutcome::TimedOut;
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    drop(stream);
    tracing::debug!(
        samples = sample_count,
        played = position.load(Ordering::Relaxed),
        outcome = ?outcome,
        "playback finished"
    );

    Ok(outcome)
}

/// Decode an MP3 or WAV file to mono samples and their rate
///
/// # Errors
///
/// Returns error if the file cannot be read or decoded
pub fn decode_file(path: &Path) -> Result<(Vec<f32>, u32)> {
    let bytes = std::fs::read(path)?;
    let is_wav = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    if is_wav { decode_wav(&bytes) } else { decode_mp3(&bytes) }
}

fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| int_to_float(v, bits)))
                .collect::<std::result::Result<_, _>>()?
        }
    };
    Ok((downmix(&interleaved, spec.channels), spec.sample_rate))
}

#[allow(clippy::cast_precision_loss)]
fn int_to_float(value: i32, bits: u16) -> f32 {
    let scale = (1i64 << bits.saturating_sub(1).min(31)) as f32;
    value as f32 / scale
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                // Convert i16 samples to f32 and handle stereo to mono
                let frame_samples: Vec<f32> = if frame.channels == 2 {
                    frame
                        .data
                        .chunks(2)
                        .map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            f32::midpoint(left, right)
                        })
                        .collect()
                } else {
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect()
                };

                samples.extend(frame_samples);
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Playback("MP3 contained no frames".to_string()));
    }
    Ok((samples, sample_rate))
}

/// Two short rising tones
#[allow(clippy::cast_precision_loss)]
fn chime_samples(sample_rate: u32) -> Vec<f32> {
    let tone = |hz: f32, ms: u32| {
        let frames = (sample_rate * ms / 1000) as usize;
        (0..frames).map(move |i| {
            let t = i as f32 / sample_rate as f32;
            let fade = 1.0 - i as f32 / frames as f32;
            0.2 * fade * (TAU * hz * t).sin()
        })
    };
    tone(880.0, 90).chain(tone(1320.0, 110)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_wav;

    #[test]
    fn test_decode_wav_roundtrips_rate_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        std::fs::write(&path, samples_to_wav(&[0.0, 0.25, -0.25, 0.5], 22050).unwrap()).unwrap();

        let (samples, rate) = decode_file(&path).unwrap();
        assert_eq!(rate, 22050);
        assert_eq!(samples.len(), 4);
        assert!((samples[1] - 0.25).abs() < 0.001);
    }

    #[test]
    fn test_decode_garbage_mp3_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tts_bad.mp3");
        std::fs::write(&path, b"not audio at all").unwrap();
        assert!(decode_file(&path).is_err());
    }

    #[test]
    fn test_chime_is_short_and_quiet() {
        let samples = chime_samples(CHIME_SAMPLE_RATE);
        assert_eq!(samples.len(), 2160 + 2640);
        assert!(samples.iter().all(|s| s.abs() <= 0.2));
    }

    #[test]
    fn test_cancelled_token_skips_playback() {
        let player = CpalPlayer::new(Duration::from_secs(1), WatchdogPolicy::default());
        let token = CancellationToken::new();
        token.cancel("barge-in");
        let outcome = player.play(Path::new("/nonexistent.mp3"), &token).unwrap();
        assert_eq!(
            outcome,
            PlaybackOutcome::Interrupted {
                reason: "barge-in".to_string()
            }
        );
    }
}
