//! Scripted input device
//!
//! Plays back a queue of tone and silence segments instead of a
//! microphone. Each capture read sleeps on the injected [`Clock`] for the
//! chunk's duration, so with a [`super::VirtualClock`] a 30 second session
//! completes instantly and with a [`super::SystemClock`] it paces like a real
//! device (used by `parley run --simulate`).

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::clock::Clock;
use super::device::{InputDevice, InputStream, StreamRole, StreamSpec};
use super::frames_for;
use crate::{Error, Result};

/// Frequency of generated speech tones
const TONE_HZ: f32 = 220.0;

/// Amplitude used by [`SyntheticInput::push_speech`]
pub const SPEECH_AMPLITUDE: f32 = 0.3;

#[derive(Debug, Clone, Copy)]
enum Segment {
    Tone { remaining: Duration, amplitude: f32 },
    Silence { remaining: Duration },
}

/// Call counts for assertions in tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticCounters {
    /// Successful `initialize` calls
    pub initializes: u32,
    /// `terminate` calls
    pub terminates: u32,
    /// Open attempts, including failed ones
    pub opens: u32,
    /// Streams started
    pub starts: u32,
    /// Streams stopped
    pub stops: u32,
    /// Streams closed
    pub closes: u32,
}

#[derive(Debug, Default)]
struct State {
    script: VecDeque<Segment>,
    monitor_amplitude: f32,
    monitor_levels: VecDeque<f32>,
    initialized: bool,
    fail_opens: u32,
    fail_reads: u32,
    fail_starts: u32,
    reject_exact: bool,
    phase: f32,
    counters: SyntheticCounters,
}

/// Scripted [`InputDevice`]
#[derive(Clone)]
pub struct SyntheticInput {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for SyntheticInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticInput").finish_non_exhaustive()
    }
}

impl SyntheticInput {
    /// Create a device with an empty script (endless silence)
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue speech-like tone
    pub fn push_speech(&self, duration: Duration) -> &Self {
        self.push_tone(duration, SPEECH_AMPLITUDE)
    }

    /// Queue a tone at the given amplitude
    pub fn push_tone(&self, duration: Duration, amplitude: f32) -> &Self {
        self.state().script.push_back(Segment::Tone {
            remaining: duration,
            amplitude,
        });
        self
    }

    /// Queue silence
    pub fn push_silence(&self, duration: Duration) -> &Self {
        self.state()
            .script
            .push_back(Segment::Silence { remaining: duration });
        self
    }

    /// Level heard by monitor streams
    pub fn set_monitor_amplitude(&self, amplitude: f32) {
        self.state().monitor_amplitude = amplitude;
    }

    /// Levels for the next monitor reads, one per read, ahead of the fixed level
    pub fn queue_monitor_levels(&self, levels: &[f32]) {
        self.state().monitor_levels.extend(levels.iter().copied());
    }

    /// Queued monitor levels not yet read
    #[must_use]
    pub fn monitor_levels_left(&self) -> usize {
        self.state().monitor_levels.len()
    }

    /// Make the next `n` opens fail
    pub fn fail_next_opens(&self, n: u32) {
        self.state().fail_opens = n;
    }

    /// Make the next `n` capture reads fail
    pub fn fail_next_reads(&self, n: u32) {
        self.state().fail_reads = n;
    }

    /// Make the next `n` stream starts fail
    pub fn fail_next_starts(&self, n: u32) {
        self.state().fail_starts = n;
    }

    /// Refuse exact-format specs so only minimal ones open
    pub fn reject_exact_format(&self, reject: bool) {
        self.state().reject_exact = reject;
    }

    /// Whether the queued script has been fully consumed
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state().script.is_empty()
    }

    /// Snapshot of call counts
    #[must_use]
    pub fn counters(&self) -> SyntheticCounters {
        self.state().counters
    }
}

impl InputDevice for SyntheticInput {
    fn initialize(&self) -> Result<()> {
        let mut state = self.state();
        state.initialized = true;
        state.counters.initializes += 1;
        Ok(())
    }

    fn terminate(&self) {
        let mut state = self.state();
        state.initialized = false;
        state.counters.terminates += 1;
    }

    fn open(&self, _device_id: Option<&str>, spec: StreamSpec) -> Result<Arc<dyn InputStream>> {
        let mut state = self.state();
        state.counters.opens += 1;
        if !state.initialized {
            return Err(Error::Audio("audio host not initialized".to_string()));
        }
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(Error::Audio("synthetic open failure".to_string()));
        }
        if spec.exact_format && state.reject_exact {
            return Err(Error::Audio("invalid sample rate".to_string()));
        }
        drop(state);

        Ok(Arc::new(SyntheticStream {
            spec,
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn list_devices(&self) -> Vec<String> {
        vec!["synthetic (default)".to_string()]
    }
}

struct SyntheticStream {
    spec: StreamSpec,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
    active: AtomicBool,
    closed: AtomicBool,
}

impl SyntheticStream {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[allow(clippy::cast_precision_loss)]
    fn tone(state: &mut State, out: &mut Vec<f32>, frames: usize, amplitude: f32, rate: u32) {
        let step = TAU * TONE_HZ / rate as f32;
        for _ in 0..frames {
            out.push(amplitude * state.phase.sin());
            state.phase = (state.phase + step) % TAU;
        }
    }

    fn next_capture_chunk(&self, frames: usize) -> Vec<f32> {
        let rate = self.spec.sample_rate;
        let mut out = Vec::with_capacity(frames);
        let mut state = self.state();

        while out.len() < frames {
            let wanted = frames - out.len();
            let Some(segment) = state.script.front_mut() else {
                out.resize(frames, 0.0);
                break;
            };

            let (remaining, amplitude) = match segment {
                Segment::Tone {
                    remaining,
                    amplitude,
                } => (remaining, Some(*amplitude)),
                Segment::Silence { remaining } => (remaining, None),
            };
            let available = frames_for(*remaining, rate);
            let take = available.min(wanted);
            #[allow(clippy::cast_precision_loss)]
            let consumed = Duration::from_secs_f64(take as f64 / f64::from(rate));
            *remaining = remaining.saturating_sub(consumed);
            if take == available {
                state.script.pop_front();
            }

            match amplitude {
                Some(amplitude) => Self::tone(&mut state, &mut out, take, amplitude, rate),
                None => out.resize(out.len() + take, 0.0),
            }
        }

        out
    }
}

impl InputStream for SyntheticStream {
    fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Audio("stream closed".to_string()));
        }
        let mut state = self.state();
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(Error::Audio("synthetic start failure".to_string()));
        }
        state.counters.starts += 1;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Audio("stream closed".to_string()));
        }
        self.state().counters.stops += 1;
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.active.store(false, Ordering::SeqCst);
            self.state().counters.closes += 1;
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn read(&self, frames: usize, _timeout: Duration) -> Result<Vec<f32>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Audio("stream closed".to_string()));
        }
        if !self.is_active() {
            return Err(Error::Audio("stream not started".to_string()));
        }

        #[allow(clippy::cast_precision_loss)]
        let chunk_duration =
            Duration::from_secs_f64(frames as f64 / f64::from(self.spec.sample_rate));

        match self.spec.role {
            StreamRole::Monitor => {
                let mut state = self.state();
                let amplitude = state
                    .monitor_levels
                    .pop_front()
                    .unwrap_or(state.monitor_amplitude);
                let mut out = Vec::with_capacity(frames);
                Self::tone(&mut state, &mut out, frames, amplitude, self.spec.sample_rate);
                Ok(out)
            }
            StreamRole::Capture => {
                {
                    let mut state = self.state();
                    if state.fail_reads > 0 {
                        state.fail_reads -= 1;
                        drop(state);
                        self.clock.sleep(chunk_duration);
                        return Err(Error::Audio("input overflowed".to_string()));
                    }
                }
                let chunk = self.next_capture_chunk(frames);
                self.clock.sleep(chunk_duration);
                Ok(chunk)
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{SAMPLE_RATE, VirtualClock, peak_amplitude};

    fn opened(input: &SyntheticInput, role: StreamRole) -> Arc<dyn InputStream> {
        input.initialize().unwrap();
        let stream = input.open(None, StreamSpec::rich(role, SAMPLE_RATE)).unwrap();
        stream.start().unwrap();
        stream
    }

    #[test]
    fn test_script_plays_in_order_and_advances_clock() {
        let clock = VirtualClock::new();
        let input = SyntheticInput::new(Arc::new(clock.clone()));
        input
            .push_speech(Duration::from_millis(500))
            .push_silence(Duration::from_millis(500));
        let stream = opened(&input, StreamRole::Capture);

        let first = stream.read(8000, Duration::from_secs(1)).unwrap();
        let second = stream.read(8000, Duration::from_secs(1)).unwrap();
        assert!(peak_amplitude(&first) > 0.2);
        assert!(peak_amplitude(&second) < f32::EPSILON);
        assert_eq!(clock.now(), Duration::from_secs(1));
        assert!(input.is_exhausted());
    }

    #[test]
    fn test_chunk_spanning_segments() {
        let input = SyntheticInput::new(Arc::new(VirtualClock::new()));
        input
            .push_silence(Duration::from_millis(250))
            .push_speech(Duration::from_millis(250));
        let stream = opened(&input, StreamRole::Capture);

        let chunk = stream.read(8000, Duration::from_secs(1)).unwrap();
        assert_eq!(chunk.len(), 8000);
        assert!(peak_amplitude(&chunk[..4000]) < f32::EPSILON);
        assert!(peak_amplitude(&chunk[4000..]) > 0.2);
    }

    #[test]
    fn test_read_requires_started_stream() {
        let input = SyntheticInput::new(Arc::new(VirtualClock::new()));
        input.initialize().unwrap();
        let stream = input
            .open(None, StreamSpec::rich(StreamRole::Capture, SAMPLE_RATE))
            .unwrap();
        assert!(stream.read(100, Duration::from_millis(10)).is_err());
        stream.close();
        assert!(stream.start().is_err());
    }

    #[test]
    fn test_monitor_uses_level_and_not_clock() {
        let clock = VirtualClock::new();
        let input = SyntheticInput::new(Arc::new(clock.clone()));
        input.set_monitor_amplitude(0.4);
        let stream = opened(&input, StreamRole::Monitor);
        let chunk = stream.read(3200, Duration::from_millis(100)).unwrap();
        assert!(peak_amplitude(&chunk) > 0.3);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_failure_injection() {
        let input = SyntheticInput::new(Arc::new(VirtualClock::new()));
        input.initialize().unwrap();
        input.fail_next_opens(1);
        let spec = StreamSpec::rich(StreamRole::Capture, SAMPLE_RATE);
        assert!(input.open(None, spec).is_err());
        assert!(input.open(None, spec).is_ok());

        input.reject_exact_format(true);
        assert!(input.open(None, spec).is_err());
        assert!(
            input
                .open(None, StreamSpec::minimal(StreamRole::Capture, SAMPLE_RATE))
                .is_ok()
        );
        assert_eq!(input.counters().opens, 4);
    }
}
