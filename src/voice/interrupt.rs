//! Barge-in detection while the assistant speaks
//!
//! A background thread samples the monitor stream whenever speech output is
//! active and the mic gate is closed. Sustained energy above the threshold
//! interrupts the current utterance.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::Result;
use crate::audio::{MicStreamManager, frames_for, rms_energy};
use crate::cancel::CancellationToken;

/// Reason passed to the speech session on barge-in
pub const BARGE_IN_REASON: &str = "barge-in";

/// Something the listener can interrupt
pub trait Interruptible: Send + Sync {
    /// Whether output is currently playing
    fn is_speaking(&self) -> bool;

    /// Stop the current output
    fn interrupt(&self, reason: &str);
}

/// Barge-in tuning
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct InterruptSettings {
    /// Run the listener at all
    pub enabled: bool,
    /// RMS energy counted as the user talking
    pub energy_threshold: f32,
    /// Length of each monitor read
    #[serde(with = "crate::config::duration_secs")]
    pub check_interval: Duration,
    /// Loud reads in a row needed to interrupt
    pub consecutive_frames: u32,
    /// Quiet period after an interrupt
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
    /// Delay before the one restart after a crash
    #[serde(with = "crate::config::duration_secs")]
    pub restart_delay: Duration,
}

impl Default for InterruptSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            energy_threshold: 0.05,
            check_interval: Duration::from_millis(200),
            consecutive_frames: 2,
            cooldown: Duration::from_millis(500),
            restart_delay: Duration::from_secs(2),
        }
    }
}

/// Handle to the barge-in thread
pub struct InterruptListener {
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InterruptListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptListener")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl InterruptListener {
    /// Spawn the listener thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start(
        mic: Arc<MicStreamManager>,
        target: Arc<dyn Interruptible>,
        settings: InterruptSettings,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = std::thread::Builder::new()
            .name("parley-interrupt".to_string())
            .spawn(move || supervise(&mic, target.as_ref(), settings, &token))?;

        tracing::info!("voice interrupt listener started");
        Ok(Self {
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the thread is still alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&self) {
        self.shutdown.cancel("shutdown");
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("interrupt listener panicked during shutdown");
            }
            tracing::info!("interrupt listener shut down");
        }
    }
}

impl Drop for InterruptListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn supervise(
    mic: &MicStreamManager,
    target: &dyn Interruptible,
    settings: InterruptSettings,
    shutdown: &CancellationToken,
) {
    let mut restarted = false;

    loop {
        let run = std::panic::catch_unwind(AssertUnwindSafe(|| {
            listen(mic, target, settings, shutdown);
        }));

        if run.is_ok() || shutdown.is_cancelled() {
            return;
        }
        if restarted {
            tracing::error!("interrupt listener crashed again, giving up");
            return;
        }

        tracing::error!(
            delay_ms = settings.restart_delay.as_millis(),
            "interrupt listener crashed, restarting"
        );
        if shutdown.wait(settings.restart_delay) {
            return;
        }
        restarted = true;
    }
}

fn listen(
    mic: &MicStreamManager,
    target: &dyn Interruptible,
    settings: InterruptSettings,
    shutdown: &CancellationToken,
) {
    let frames = frames_for(settings.check_interval, mic.sample_rate());
    let mut streak = LoudStreak::default();

    while !shutdown.is_cancelled() {
        if !(target.is_speaking() && !mic.is_open()) {
            streak.reset();
            shutdown.wait(settings.check_interval);
            continue;
        }

        let started = Instant::now();
        match mic.read_monitor(frames, settings.check_interval * 2) {
            Ok(chunk) => {
                let energy = rms_energy(&chunk);
                if streak.observe(energy, &settings) {
                    tracing::info!(energy, "voice detected during speech, interrupting");
                    target.interrupt(BARGE_IN_REASON);
                    shutdown.wait(settings.cooldown);
                    continue;
                }
            }
            Err(e) => {
                tracing::trace!(error = %e, "monitor read skipped");
            }
        }

        shutdown.wait(settings.check_interval.saturating_sub(started.elapsed()));
    }
}

/// Run of loud monitor reads
///
/// A loud read adds one, a quiet read takes one away.
#[derive(Debug, Default)]
struct LoudStreak {
    count: u32,
}

impl LoudStreak {
    /// Feed one read; true when the streak reaches the trigger and resets
    fn observe(&mut self, energy: f32, settings: &InterruptSettings) -> bool {
        if energy > settings.energy_threshold {
            self.count += 1;
            if self.count >= settings.consecutive_frames {
                self.count = 0;
                return true;
            }
        } else {
            self.count = self.count.saturating_sub(1);
        }
        false
    }

    const fn reset(&mut self) {
        self.count = 0;
    }
}
