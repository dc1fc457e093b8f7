//! Audio capture from microphone
//!
//! `cpal` streams are not `Send` on every host, so each stream lives on its
//! own owner thread. The handle talks to it over a command channel and reads
//! samples out of a shared buffer filled by the driver callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender};

use super::device::{InputDevice, InputStream, StreamSpec};
use super::{downmix, resample};
use crate::{Error, Result};

/// How long the owner thread gets to build a stream or answer a command
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Seconds of audio buffered before the oldest samples are dropped
const BUFFER_SECONDS: u32 = 10;

/// Audio host backed by `cpal`'s default host
#[derive(Debug, Default)]
pub struct CpalInput {
    initialized: AtomicBool,
}

impl CpalInput {
    /// Create an uninitialized host handle
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputDevice for CpalInput {
    fn initialize(&self) -> Result<()> {
        let host = cpal::default_host();
        if host.default_input_device().is_none() {
            return Err(Error::Audio("no input device available".to_string()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(host = ?host.id(), "audio host initialized");
        Ok(())
    }

    fn terminate(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        tracing::debug!("audio host terminated");
    }

    fn open(&self, device_id: Option<&str>, spec: StreamSpec) -> Result<Arc<dyn InputStream>> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::Audio("audio host not initialized".to_string()));
        }
        let stream = CpalStream::open(device_id.map(ToString::to_string), spec)?;
        Ok(Arc::new(stream))
    }

    fn list_devices(&self) -> Vec<String> {
        let host = cpal::default_host();
        let default_name = host
            .default_input_device()
            .and_then(|d| d.name().ok())
            .unwrap_or_default();

        host.input_devices()
            .map(|devices| {
                devices
                    .filter_map(|d| d.name().ok())
                    .map(|name| {
                        if name == default_name {
                            format!("{name} (default)")
                        } else {
                            name
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
struct NativeFormat {
    sample_rate: u32,
    channels: u16,
}

#[derive(Debug, Default)]
struct Shared {
    samples: Mutex<VecDeque<f32>>,
    ready: Condvar,
    active: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn push(&self, mono: &[f32], capacity: usize) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        let mut buf = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        buf.extend(mono.iter().copied());
        let overflow = buf.len().saturating_sub(capacity);
        if overflow > 0 {
            buf.drain(..overflow);
        }
        drop(buf);
        self.ready.notify_all();
    }

    fn clear(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.ready.notify_all();
    }
}

enum Command {
    Start(Sender<Result<()>>),
    Stop(Sender<Result<()>>),
    Close,
}

/// A capture stream running on its owner thread
pub struct CpalStream {
    commands: Sender<Command>,
    shared: Arc<Shared>,
    format: NativeFormat,
    target_rate: u32,
    owner: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CpalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalStream")
            .field("format", &self.format)
            .field("target_rate", &self.target_rate)
            .finish_non_exhaustive()
    }
}

impl CpalStream {
    fn open(device_id: Option<String>, spec: StreamSpec) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread_shared = Arc::clone(&shared);
        let owner = std::thread::Builder::new()
            .name(format!("parley-{:?}", spec.role).to_lowercase())
            .spawn(move || run_owner(device_id, spec, &thread_shared, &command_rx, &ready_tx))?;

        let format = await_ready(&ready_rx, &shared, &commands, CONTROL_TIMEOUT)?;

        tracing::debug!(
            role = ?spec.role,
            native_rate = format.sample_rate,
            channels = format.channels,
            target_rate = spec.sample_rate,
            "input stream opened"
        );

        Ok(Self {
            commands,
            shared,
            format,
            target_rate: spec.sample_rate,
            owner: Mutex::new(Some(owner)),
        })
    }

    fn request(&self, make: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Audio("stream closed".to_string()));
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| Error::Audio("capture thread gone".to_string()))?;
        reply_rx
            .recv_timeout(CONTROL_TIMEOUT)
            .map_err(|_| Error::Audio("capture thread did not answer".to_string()))?
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn native_frames(&self, frames: usize) -> usize {
        if self.format.sample_rate == self.target_rate {
            frames
        } else {
            (frames as f64 * f64::from(self.format.sample_rate) / f64::from(self.target_rate))
                .ceil() as usize
        }
    }
}

impl InputStream for CpalStream {
    fn start(&self) -> Result<()> {
        self.request(Command::Start)
    }

    fn stop(&self) -> Result<()> {
        self.request(Command::Stop)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.active.store(false, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
        self.shared.ready.notify_all();

        let owner = self
            .owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = owner {
            if handle.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn read(&self, frames: usize, timeout: Duration) -> Result<Vec<f32>> {
        let needed = self.native_frames(frames);
        let deadline = Instant::now() + timeout;

        let mut buf = self
            .shared
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while buf.len() < needed {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(Error::Audio("stream closed".to_string()));
            }
            if !self.shared.active.load(Ordering::SeqCst) {
                return Err(Error::Audio("stream not started".to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Audio(format!(
                    "read timed out with {}/{needed} frames",
                    buf.len()
                )));
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(buf, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            buf = guard;
        }
        let native: Vec<f32> = buf.drain(..needed).collect();
        drop(buf);

        let mut samples = resample(&native, self.format.sample_rate, self.target_rate)?;
        samples.resize(frames, 0.0);
        Ok(samples)
    }

    fn sample_rate(&self) -> u32 {
        self.target_rate
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wait for the owner thread to report the opened stream
///
/// On timeout the stream is marked closed and told to close, so an owner that
/// finishes building late drops its stream and exits.
fn await_ready(
    ready: &Receiver<Result<NativeFormat>>,
    shared: &Shared,
    commands: &Sender<Command>,
    timeout: Duration,
) -> Result<NativeFormat> {
    match ready.recv_timeout(timeout) {
        Ok(result) => result,
        Err(e) => {
            shared.closed.store(true, Ordering::SeqCst);
            let _ = commands.send(Command::Close);
            tracing::warn!(error = %e, "input stream did not open in time, abandoning it");
            Err(Error::Audio("timed out opening input stream".to_string()))
        }
    }
}

fn run_owner(
    device_id: Option<String>,
    spec: StreamSpec,
    shared: &Arc<Shared>,
    commands: &Receiver<Command>,
    ready: &Sender<Result<NativeFormat>>,
) {
    let stream = match build_stream(device_id.as_deref(), spec, shared) {
        Ok(_) if shared.closed.load(Ordering::SeqCst) => {
            tracing::debug!(role = ?spec.role, "input stream opened after the caller gave up, closing");
            return;
        }
        Ok((stream, format)) => {
            let _ = ready.send(Ok(format));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    for command in commands {
        match command {
            Command::Start(reply) => {
                let result = stream.play().map_err(|e| Error::Audio(e.to_string()));
                if result.is_ok() {
                    shared.clear();
                    shared.active.store(true, Ordering::SeqCst);
                    tracing::trace!(role = ?spec.role, "input stream started");
                }
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                shared.active.store(false, Ordering::SeqCst);
                shared.clear();
                let result = stream.pause().map_err(|e| Error::Audio(e.to_string()));
                tracing::trace!(role = ?spec.role, "input stream stopped");
                let _ = reply.send(result);
            }
            Command::Close => break,
        }
    }

    shared.active.store(false, Ordering::SeqCst);
    drop(stream);
    tracing::debug!(role = ?spec.role, "input stream closed");
}

fn find_device(device_id: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match device_id {
        Some(id) => host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|d| d.name().is_ok_and(|name| name == id))
            .ok_or_else(|| Error::Config(format!("input device not found: {id}"))),
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string())),
    }
}

fn build_stream(
    device_id: Option<&str>,
    spec: StreamSpec,
    shared: &Arc<Shared>,
) -> Result<(Stream, NativeFormat)> {
    let device = find_device(device_id)?;

    let (mut config, sample_format): (StreamConfig, SampleFormat) = if spec.exact_format {
        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(spec.sample_rate)
                    && c.max_sample_rate() >= SampleRate(spec.sample_rate)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?
            .with_sample_rate(SampleRate(spec.sample_rate));
        (supported.config(), supported.sample_format())
    } else {
        let supported = device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        (supported.config(), supported.sample_format())
    };

    if let Some(frames) = spec.block_frames {
        config.buffer_size = BufferSize::Fixed(frames);
    }

    let format = NativeFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };
    let capacity = (format.sample_rate * BUFFER_SECONDS) as usize;
    let channels = format.channels;

    let err_fn = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let shared = Arc::clone(shared);
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    shared.push(&downmix(data, channels), capacity);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let shared = Arc::clone(shared);
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let float_data: Vec<f32> =
                        data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                    shared.push(&downmix(&float_data, channels), capacity);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I32 => {
            let shared = Arc::clone(shared);
            device.build_input_stream(
                &config,
                move |data: &[i32], _: &cpal::InputCallbackInfo| {
                    #[allow(clippy::cast_precision_loss)]
                    let float_data: Vec<f32> =
                        data.iter().map(|&s| s as f32 / 2_147_483_648.0).collect();
                    shared.push(&downmix(&float_data, channels), capacity);
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(Error::Audio(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    }
    .map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = format.sample_rate,
        channels = format.channels,
        "audio capture initialized"
    );

    Ok((stream, format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_open_is_abandoned_and_told_to_close() {
        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let owner_shared = Arc::clone(&shared);
        let owner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            if owner_shared.closed.load(Ordering::SeqCst) {
                return false;
            }
            let _ = ready_tx.send(Ok(NativeFormat {
                sample_rate: 48000,
                channels: 2,
            }));
            true
        });

        let result = await_ready(&ready_rx, &shared, &commands, Duration::from_millis(10));
        assert!(matches!(result, Err(Error::Audio(_))));
        assert!(matches!(command_rx.try_recv(), Ok(Command::Close)));
        // owner saw the flag and never reported
        assert!(!owner.join().unwrap());
    }

    #[test]
    fn test_prompt_open_reports_format() {
        let shared = Shared::default();
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        ready_tx
            .send(Ok(NativeFormat {
                sample_rate: 44100,
                channels: 1,
            }))
            .unwrap();

        let format = await_ready(&ready_rx, &shared, &commands, Duration::from_millis(10)).unwrap();
        assert_eq!(format.sample_rate, 44100);
        assert!(!shared.closed.load(Ordering::SeqCst));
        assert!(command_rx.try_recv().is_err());
    }
}
