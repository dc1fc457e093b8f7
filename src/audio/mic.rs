//! Microphone ownership
//!
//! [`MicStreamManager`] is the single owner of the physical capture stream,
//! the barge-in monitor stream and the logical [`MicGate`]. Every create,
//! start, stop and close happens under one mutex. Readers clone the stream
//! handle under the lock and read without it, so a slow read never blocks a
//! stop issued from another thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::device::{InputDevice, InputStream, StreamRole, StreamSpec};
use super::watchdog::{DeviceWatchdog, WatchdogPolicy};
use crate::{Error, Result};

/// Logical microphone enable flag
///
/// Open only while the conversation asked for listening and no speech
/// output holds a mute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicGate {
    /// Set by the conversation state machine
    pub listening_requested: bool,
    /// Number of live [`MuteGuard`]s
    pub mute_depth: u32,
}

impl MicGate {
    /// Effective gate value
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.listening_requested && self.mute_depth == 0
    }

    /// Whether a speech output session holds the mic muted
    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.mute_depth > 0
    }
}

/// Called with the new gate after every change, while the manager lock is
/// held; must not call back into the manager
pub type GateObserver = Arc<dyn Fn(MicGate) + Send + Sync>;

/// Settings for the stream manager
#[derive(Debug, Clone)]
pub struct MicSettings {
    /// Input device name; `None` uses the host default
    pub device_id: Option<String>,
    /// Rate delivered to readers
    pub sample_rate: u32,
    /// Minimum spacing between stream resets
    pub reset_interval: Duration,
    /// Retry policy for stream open and start
    pub watchdog: WatchdogPolicy,
}

impl Default for MicSettings {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: super::SAMPLE_RATE,
            reset_interval: Duration::from_secs(1),
            watchdog: WatchdogPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Inner {
    stream: Option<Arc<dyn InputStream>>,
    monitor: Option<Arc<dyn InputStream>>,
    gate: MicGate,
    last_reset: Option<Instant>,
}

/// Serialized owner of the capture device and the mic gate
pub struct MicStreamManager {
    device: Arc<dyn InputDevice>,
    settings: MicSettings,
    watchdog: DeviceWatchdog,
    inner: Mutex<Inner>,
    capture_busy: AtomicBool,
    observer: RwLock<Option<GateObserver>>,
}

impl std::fmt::Debug for MicStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicStreamManager")
            .field("settings", &self.settings)
            .field("gate", &self.gate())
            .finish_non_exhaustive()
    }
}

impl MicStreamManager {
    /// Create a manager
    ///
    /// Nothing touches the device until [`Self::initialize_device`]. The
    /// manager's watchdog resets the stream between failed start attempts.
    #[must_use]
    pub fn new(device: Arc<dyn InputDevice>, settings: MicSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let watchdog = DeviceWatchdog::new(settings.watchdog, move || {
                if let Some(manager) = weak.upgrade() {
                    manager.reset_stream();
                }
            });
            Self {
                device,
                settings,
                watchdog,
                inner: Mutex::new(Inner::default()),
                capture_busy: AtomicBool::new(false),
                observer: RwLock::new(None),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rate delivered by capture reads
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    /// Names of the available input devices
    #[must_use]
    pub fn list_devices(&self) -> Vec<String> {
        self.device.list_devices()
    }

    /// Bring up the audio host
    ///
    /// # Errors
    ///
    /// Returns error if the host stays unavailable after the watchdog's
    /// attempts
    pub fn initialize_device(&self) -> Result<()> {
        let _inner = self.lock();
        DeviceWatchdog::without_reinit(self.settings.watchdog)
            .guard("audio host init", || self.device.initialize())
    }

    fn open_stream(&self, role: StreamRole) -> Option<Arc<dyn InputStream>> {
        let device_id = self.settings.device_id.as_deref();
        let rate = self.settings.sample_rate;

        match self.device.open(device_id, StreamSpec::rich(role, rate)) {
            Ok(stream) => return Some(stream),
            Err(e) => {
                tracing::warn!(role = ?role, error = %e, "stream open failed, retrying with minimal parameters");
            }
        }

        match self.device.open(device_id, StreamSpec::minimal(role, rate)) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::error!(role = ?role, error = %e, "stream open failed, running without microphone");
                None
            }
        }
    }

    fn create_locked(&self, inner: &mut Inner) -> Option<Arc<dyn InputStream>> {
        if let Some(old) = inner.stream.take() {
            old.close();
        }
        inner.stream = self.open_stream(StreamRole::Capture);
        inner.stream.clone()
    }

    /// Open a fresh capture stream, replacing any existing one
    ///
    /// Falls back to minimal parameters when the rich set is refused.
    /// Returns `None` when both fail; the assistant then runs degraded.
    pub fn create_stream(&self) -> Option<Arc<dyn InputStream>> {
        let mut inner = self.lock();
        self.create_locked(&mut inner)
    }

    /// The current capture stream, creating one if absent
    pub fn ensure_valid_stream(&self) -> Option<Arc<dyn InputStream>> {
        let mut inner = self.lock();
        if let Some(stream) = &inner.stream {
            return Some(Arc::clone(stream));
        }
        self.create_locked(&mut inner)
    }

    /// Whether no capture stream could be opened
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.lock().stream.is_none()
    }

    /// Tear the capture path down and rebuild it
    ///
    /// Calls closer together than the reset interval wait out the
    /// remainder first. The new stream is left stopped.
    pub fn reset_stream(&self) {
        let wait = {
            let inner = self.lock();
            inner.last_reset.map_or(Duration::ZERO, |at| {
                self.settings.reset_interval.saturating_sub(at.elapsed())
            })
        };
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis(), "stream reset rate limited");
            std::thread::sleep(wait);
        }

        let mut inner = self.lock();
        inner.last_reset = Some(Instant::now());

        if let Some(stream) = inner.stream.take() {
            if let Err(e) = stream.stop() {
                tracing::debug!(error = %e, "stop during reset failed");
            }
            stream.close();
        }
        if let Some(monitor) = inner.monitor.take() {
            monitor.close();
        }

        self.device.terminate();
        if let Err(e) = self.device.initialize() {
            tracing::error!(error = %e, "audio host reinitialization failed");
            return;
        }

        let created = self.create_locked(&mut inner).is_some();
        tracing::info!(created, "input stream reset");
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        let stream = match &inner.stream {
            Some(stream) => Arc::clone(stream),
            None => self
                .create_locked(inner)
                .ok_or_else(|| Error::Audio("no input stream".to_string()))?,
        };
        if stream.is_active() {
            return Ok(());
        }
        stream.start()
    }

    /// Start the physical capture stream under the watchdog
    ///
    /// Does nothing while the gate is closed. The gate is re-checked under
    /// the lock on every attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] when every attempt failed
    pub fn start(&self) -> Result<()> {
        self.watchdog.guard("mic start", || {
            let mut inner = self.lock();
            // the gate may have closed while the watchdog slept between attempts
            if !inner.gate.is_open() {
                tracing::trace!("gate closed, not starting input stream");
                return Ok(());
            }
            self.start_locked(&mut inner)
        })
    }

    fn stop_locked(inner: &Inner) {
        if let Some(stream) = &inner.stream {
            if stream.is_active() {
                if let Err(e) = stream.stop() {
                    tracing::warn!(error = %e, "failed to stop input stream");
                }
            }
        }
    }

    /// Stop the physical capture stream (best effort)
    pub fn stop(&self) {
        Self::stop_locked(&self.lock());
    }

    /// Current gate
    #[must_use]
    pub fn gate(&self) -> MicGate {
        self.lock().gate
    }

    /// Effective gate value
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.gate().is_open()
    }

    /// Install the gate observer
    pub fn set_gate_observer(&self, observer: impl Fn(MicGate) + Send + Sync + 'static) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    fn publish(&self, gate: MicGate) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(gate);
        }
    }

    /// Change whether the conversation wants the mic
    ///
    /// Closing stops the physical stream; opening starts it when no mute is
    /// held. A start failure leaves the gate open and is logged, so the
    /// recording loop sees read errors and backs off.
    pub fn set_listening(&self, listening: bool) {
        let mut inner = self.lock();
        if inner.gate.listening_requested == listening {
            return;
        }

        if listening {
            inner.gate.listening_requested = true;
            self.publish(inner.gate);
            if inner.gate.is_open() {
                drop(inner);
                if let Err(e) = self.start() {
                    tracing::error!(error = %e, "could not start microphone");
                }
            }
        } else {
            inner.gate.listening_requested = false;
            self.publish(inner.gate);
            Self::stop_locked(&inner);
        }
        tracing::trace!(listening, "listening request changed");
    }

    /// Mute the mic for the lifetime of the returned guard
    ///
    /// The gate closes and the physical stream stops immediately.
    #[must_use]
    pub fn mute(self: &Arc<Self>) -> MuteGuard {
        let mut inner = self.lock();
        inner.gate.mute_depth += 1;
        self.publish(inner.gate);
        Self::stop_locked(&inner);
        tracing::debug!(depth = inner.gate.mute_depth, "microphone muted");
        MuteGuard {
            manager: Arc::clone(self),
        }
    }

    fn unmute(&self) {
        let mut inner = self.lock();
        inner.gate.mute_depth = inner.gate.mute_depth.saturating_sub(1);
        self.publish(inner.gate);
        let reopen = inner.gate.is_open();
        tracing::debug!(depth = inner.gate.mute_depth, reopen, "microphone mute released");
        if reopen {
            drop(inner);
            if let Err(e) = self.start() {
                tracing::warn!(error = %e, "could not restart microphone after mute");
            }
        }
    }

    /// Take exclusive capture ownership
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if another recording session holds the lease
    pub fn acquire_capture(&self) -> Result<CaptureLease<'_>> {
        if self
            .capture_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy("microphone capture already in progress".to_string()));
        }
        Ok(CaptureLease { manager: self })
    }

    fn read_capture(&self, frames: usize, timeout: Duration) -> Result<Vec<f32>> {
        let stream = self
            .lock()
            .stream
            .clone()
            .ok_or_else(|| Error::Audio("no input stream".to_string()))?;
        stream.read(frames, timeout)
    }

    /// Open and start the barge-in monitor stream (best effort)
    ///
    /// Returns whether a monitor is running.
    pub fn start_monitor(&self) -> bool {
        let mut inner = self.lock();
        if inner.monitor.is_none() {
            inner.monitor = self.open_stream(StreamRole::Monitor);
        }
        let Some(monitor) = inner.monitor.clone() else {
            return false;
        };
        if monitor.is_active() {
            return true;
        }
        match monitor.start() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "monitor stream failed to start");
                monitor.close();
                inner.monitor = None;
                false
            }
        }
    }

    /// Stop and close the monitor stream
    pub fn stop_monitor(&self) {
        if let Some(monitor) = self.lock().monitor.take() {
            if let Err(e) = monitor.stop() {
                tracing::trace!(error = %e, "monitor stop failed");
            }
            monitor.close();
        }
    }

    /// Time-boxed read from the monitor stream
    ///
    /// # Errors
    ///
    /// Returns error if no monitor is running or the read fails
    pub fn read_monitor(&self, frames: usize, timeout: Duration) -> Result<Vec<f32>> {
        let monitor = self
            .lock()
            .monitor
            .clone()
            .ok_or_else(|| Error::Audio("no monitor stream".to_string()))?;
        monitor.read(frames, timeout)
    }

    /// Stop and close everything and release the host
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.gate.listening_requested = false;
        self.publish(inner.gate);
        for stream in [inner.stream.take(), inner.monitor.take()]
            .into_iter()
            .flatten()
        {
            if stream.is_active() {
                let _ = stream.stop();
            }
            stream.close();
        }
        self.device.terminate();
        tracing::debug!("microphone shut down");
    }
}

/// Exclusive right to read user-turn audio
///
/// Released on drop.
pub struct CaptureLease<'a> {
    manager: &'a MicStreamManager,
}

impl CaptureLease<'_> {
    /// Read one chunk from the capture stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream is absent, stopped or the read fails
    pub fn read(&self, frames: usize, timeout: Duration) -> Result<Vec<f32>> {
        self.manager.read_capture(frames, timeout)
    }
}

impl Drop for CaptureLease<'_> {
    fn drop(&mut self) {
        self.manager.capture_busy.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CaptureLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLease").finish_non_exhaustive()
    }
}

/// Holds the mic muted; releasing may restart the stream
#[must_use = "the mute is released when the guard is dropped"]
pub struct MuteGuard {
    manager: Arc<MicStreamManager>,
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        self.manager.unmute();
    }
}

impl std::fmt::Debug for MuteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuteGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{SAMPLE_RATE, SyntheticInput, VirtualClock};

    fn manager(input: &SyntheticInput) -> Arc<MicStreamManager> {
        let settings = MicSettings {
            reset_interval: Duration::ZERO,
            watchdog: WatchdogPolicy {
                cooldown: Duration::from_millis(1),
                max_attempts: 3,
            },
            ..MicSettings::default()
        };
        let manager = MicStreamManager::new(Arc::new(input.clone()), settings);
        manager.initialize_device().unwrap();
        manager
    }

    fn synthetic() -> SyntheticInput {
        SyntheticInput::new(Arc::new(VirtualClock::new()))
    }

    #[test]
    fn test_gate_composition() {
        let input = synthetic();
        let mic = manager(&input);
        assert!(!mic.is_open());

        mic.set_listening(true);
        assert!(mic.is_open());
        assert!(mic.ensure_valid_stream().unwrap().is_active());

        let guard = mic.mute();
        assert!(!mic.is_open());
        assert!(!mic.ensure_valid_stream().unwrap().is_active());

        drop(guard);
        assert!(mic.is_open());
        assert!(mic.ensure_valid_stream().unwrap().is_active());

        mic.set_listening(false);
        assert!(!mic.is_open());
        assert!(!mic.ensure_valid_stream().unwrap().is_active());
    }

    #[test]
    fn test_unmute_does_not_open_unrequested_gate() {
        let input = synthetic();
        let mic = manager(&input);
        drop(mic.mute());
        assert!(!mic.is_open());
        assert_eq!(input.counters().starts, 0);
    }

    #[test]
    fn test_create_stream_falls_back_to_minimal() {
        let input = synthetic();
        input.reject_exact_format(true);
        let mic = manager(&input);
        assert!(mic.create_stream().is_some());
        assert_eq!(input.counters().opens, 2);
    }

    #[test]
    fn test_create_stream_failure_is_degraded() {
        let input = synthetic();
        let mic = manager(&input);
        input.fail_next_opens(2);
        assert!(mic.create_stream().is_none());
        assert!(mic.is_degraded());
    }

    #[test]
    fn test_reset_stream_rebuilds_without_starting() {
        let input = synthetic();
        let mic = manager(&input);
        mic.set_listening(true);
        mic.reset_stream();

        let counters = input.counters();
        assert_eq!(counters.terminates, 1);
        assert_eq!(counters.initializes, 2);
        assert_eq!(counters.closes, 1);
        assert!(!mic.ensure_valid_stream().unwrap().is_active());
    }

    #[test]
    fn test_reset_stream_is_rate_limited() {
        let input = synthetic();
        let settings = MicSettings {
            reset_interval: Duration::from_millis(80),
            ..MicSettings::default()
        };
        let mic = MicStreamManager::new(Arc::new(input), settings);
        mic.initialize_device().unwrap();

        let start = Instant::now();
        mic.reset_stream();
        mic.reset_stream();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_start_retries_through_watchdog() {
        let input = synthetic();
        let mic = manager(&input);
        input.fail_next_starts(2);
        mic.set_listening(true);
        // two failed attempts, each followed by a reset
        assert_eq!(input.counters().terminates, 2);
        assert!(mic.ensure_valid_stream().unwrap().is_active());
    }

    #[test]
    fn test_start_gives_up_with_device_error() {
        let input = synthetic();
        let mic = manager(&input);
        input.fail_next_starts(10);
        mic.set_listening(true);
        match mic.start() {
            Err(Error::Device { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected device error, got {other:?}"),
        }
    }

    #[test]
    fn test_start_with_closed_gate_is_noop() {
        let input = synthetic();
        let mic = manager(&input);
        mic.start().unwrap();
        assert_eq!(input.counters().starts, 0);
    }

    #[test]
    fn test_mute_during_start_retry_keeps_stream_stopped() {
        let input = synthetic();
        let settings = MicSettings {
            reset_interval: Duration::ZERO,
            watchdog: WatchdogPolicy {
                cooldown: Duration::from_millis(200),
                max_attempts: 3,
            },
            ..MicSettings::default()
        };
        let mic = MicStreamManager::new(Arc::new(input.clone()), settings);
        mic.initialize_device().unwrap();
        input.fail_next_starts(1);

        let listener = Arc::clone(&mic);
        let opener = std::thread::spawn(move || listener.set_listening(true));
        std::thread::sleep(Duration::from_millis(50));
        let guard = mic.mute();
        opener.join().unwrap();

        assert!(!mic.is_open());
        assert!(!mic.ensure_valid_stream().unwrap().is_active());

        drop(guard);
        assert!(mic.is_open());
        assert!(mic.ensure_valid_stream().unwrap().is_active());
    }

    #[test]
    fn test_capture_lease_is_exclusive() {
        let input = synthetic();
        let mic = manager(&input);
        let lease = mic.acquire_capture().unwrap();
        assert!(matches!(mic.acquire_capture(), Err(Error::Busy(_))));
        drop(lease);
        assert!(mic.acquire_capture().is_ok());
    }

    #[test]
    fn test_read_without_stream_fails() {
        let input = synthetic();
        let mic = manager(&input);
        let lease = mic.acquire_capture().unwrap();
        assert!(lease.read(SAMPLE_RATE as usize / 2, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_monitor_lifecycle() {
        let input = synthetic();
        let mic = manager(&input);
        assert!(mic.read_monitor(100, Duration::from_millis(10)).is_err());
        assert!(mic.start_monitor());
        input.set_monitor_amplitude(0.2);
        let chunk = mic.read_monitor(3200, Duration::from_millis(10)).unwrap();
        assert_eq!(chunk.len(), 3200);
        mic.stop_monitor();
        assert!(mic.read_monitor(100, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_observer_sees_every_gate_change() {
        let input = synthetic();
        let mic = manager(&input);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        mic.set_gate_observer(move |gate| sink.lock().unwrap().push(gate.is_open()));

        mic.set_listening(true);
        let guard = mic.mute();
        drop(guard);
        mic.set_listening(false);

        assert_eq!(*seen.lock().unwrap(), vec![true, false, true, false]);
    }
}
