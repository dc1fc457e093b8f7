//! Speech output sessions
//!
//! [`SpeechOutput::speak`] is single-flight: a new utterance first waits for
//! the previous one, then cancels it. While an utterance is in flight the
//! mic is muted and its stream stopped. Teardown runs on every path, so the
//! mute is always released and the clip always cleaned up.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::cleanup::CleanupQueue;
use super::interrupt::Interruptible;
use super::{PlaybackOutcome, Player, Synthesizer};
use crate::audio::MicStreamManager;
use crate::cancel::CancellationToken;
use crate::text::{TTS_MAX_CHARS, tts_sanitize};

/// Reason used when a newer utterance replaces a running one
pub const SUPERSEDED_REASON: &str = "superseded";

/// Speech output tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
    /// Voice passed to the synthesizer
    pub voice: String,
    /// How long a new utterance waits for the previous one to finish
    #[serde(with = "crate::config::duration_secs")]
    pub overlap_wait: Duration,
    /// How long a cancelled utterance gets to tear down
    #[serde(with = "crate::config::duration_secs")]
    pub stop_grace: Duration,
    /// Minimum spacing between the end of one utterance and the next
    #[serde(with = "crate::config::duration_secs")]
    pub min_gap: Duration,
    /// Keep synthesized clips on disk
    pub keep_files: bool,
    /// Hand clip deletion to the cleanup thread
    pub deferred_cleanup: bool,
    /// Cap on characters sent to the synthesizer
    pub max_chars: usize,
    /// Open the monitor stream for barge-in while speaking
    pub barge_in: bool,
    /// Play a short cue when the assistant starts listening
    pub listening_cue: bool,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            overlap_wait: Duration::from_secs(5),
            stop_grace: Duration::from_millis(400),
            min_gap: Duration::from_millis(500),
            keep_files: false,
            deferred_cleanup: true,
            max_chars: TTS_MAX_CHARS,
            barge_in: true,
            listening_cue: false,
        }
    }
}

/// How an utterance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Played to the end
    Completed,
    /// Nothing left to say after sanitizing
    Skipped,
    /// Cancelled before or during playback
    Interrupted {
        /// Reason given to the token
        reason: String,
    },
    /// Playback hit its hard timeout
    TimedOut,
    /// Synthesis or playback failed
    Failed {
        /// Error description
        message: String,
    },
}

#[derive(Debug, Default)]
struct Completion {
    outcome: Mutex<Option<SpeechOutcome>>,
    signal: Condvar,
}

impl Completion {
    fn finished(outcome: SpeechOutcome) -> Arc<Self> {
        let completion = Arc::new(Self::default());
        completion.finish(outcome);
        completion
    }

    fn finish(&self, outcome: SpeechOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        self.signal.notify_all();
    }

    fn is_finished(&self) -> bool {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn wait(&self, timeout: Duration) -> Option<SpeechOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

/// Handle to one utterance
#[derive(Debug, Clone)]
pub struct SpeechTicket {
    token: CancellationToken,
    done: Arc<Completion>,
}

impl SpeechTicket {
    /// Wait for the utterance to end; `None` on timeout
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> Option<SpeechOutcome> {
        self.done.wait(timeout)
    }

    /// Whether teardown has completed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done.is_finished()
    }

    /// Stop this utterance
    pub fn cancel(&self, reason: &str) {
        self.token.cancel(reason);
    }
}

#[derive(Debug, Default)]
struct Flight {
    current: Option<SpeechTicket>,
    last_finished: Option<Instant>,
}

/// Single-flight speech output bound to the shared mic
pub struct SpeechOutput {
    mic: Arc<MicStreamManager>,
    synthesizer: Arc<dyn Synthesizer>,
    player: Arc<dyn Player>,
    cleanup: Option<Arc<CleanupQueue>>,
    settings: SpeechSettings,
    speak_lock: Mutex<()>,
    flight: Mutex<Flight>,
}

impl std::fmt::Debug for SpeechOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechOutput")
            .field("settings", &self.settings)
            .field("speaking", &self.is_speaking())
            .finish_non_exhaustive()
    }
}

impl SpeechOutput {
    /// Create the output session owner
    #[must_use]
    pub fn new(
        mic: Arc<MicStreamManager>,
        synthesizer: Arc<dyn Synthesizer>,
        player: Arc<dyn Player>,
        cleanup: Option<Arc<CleanupQueue>>,
        settings: SpeechSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            mic,
            synthesizer,
            player,
            cleanup,
            settings,
            speak_lock: Mutex::new(()),
            flight: Mutex::new(Flight::default()),
        })
    }

    fn flight(&self) -> std::sync::MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active settings
    #[must_use]
    pub const fn settings(&self) -> &SpeechSettings {
        &self.settings
    }

    /// Whether an utterance is in flight
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.flight()
            .current
            .as_ref()
            .is_some_and(|ticket| !ticket.is_finished())
    }

    /// Speak `text` on a background thread
    ///
    /// Returns once the utterance is launched; use the ticket to wait.
    pub fn speak(self: &Arc<Self>, text: &str) -> SpeechTicket {
        let sanitized = tts_sanitize(text, self.settings.max_chars);
        if sanitized.is_empty() {
            return SpeechTicket {
                token: CancellationToken::new(),
                done: Completion::finished(SpeechOutcome::Skipped),
            };
        }

        let _single_flight = self
            .speak_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (previous, last_finished) = {
            let flight = self.flight();
            (flight.current.clone(), flight.last_finished)
        };
        if let Some(previous) = previous {
            self.retire(&previous);
        }
        if let Some(at) = last_finished {
            let gap = self.settings.min_gap.saturating_sub(at.elapsed());
            if !gap.is_zero() {
                std::thread::sleep(gap);
            }
        }

        let mute = self.mic.mute();
        let monitoring = self.settings.barge_in && self.mic.start_monitor();

        let ticket = SpeechTicket {
            token: CancellationToken::new(),
            done: Arc::new(Completion::default()),
        };
        self.flight().current = Some(ticket.clone());

        let this = Arc::clone(self);
        let worker_ticket = ticket.clone();
        let spawned = std::thread::Builder::new()
            .name("parley-speech".to_string())
            .spawn(move || {
                let outcome = this.render(&sanitized, &worker_ticket.token);
                this.teardown(monitoring, mute, outcome.1, &worker_ticket, outcome.0);
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "could not spawn speech thread");
            if monitoring {
                self.mic.stop_monitor();
            }
            ticket.done.finish(SpeechOutcome::Failed {
                message: e.to_string(),
            });
        }

        ticket
    }

    /// Wait out, then cancel, the previous utterance
    fn retire(&self, previous: &SpeechTicket) {
        if previous.wait(self.settings.overlap_wait).is_some() {
            return;
        }
        tracing::debug!("previous utterance still playing, cancelling");
        previous.cancel(SUPERSEDED_REASON);
        if previous.wait(self.settings.stop_grace).is_none() {
            tracing::warn!(
                grace_ms = self.settings.stop_grace.as_millis(),
                "previous utterance did not stop within grace period"
            );
        }
    }

    /// Synthesize and play; returns the outcome and the clip to clean up
    fn render(&self, text: &str, token: &CancellationToken) -> (SpeechOutcome, Option<PathBuf>) {
        if let Some(reason) = token.reason() {
            return (SpeechOutcome::Interrupted { reason }, None);
        }

        let path = match self.synthesizer.synthesize(text, &self.settings.voice) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(error = %e, "failed to generate speech audio");
                return (
                    SpeechOutcome::Failed {
                        message: e.to_string(),
                    },
                    None,
                );
            }
        };

        if let Some(reason) = token.reason() {
            tracing::info!(reason, "speech interrupted before playback");
            return (SpeechOutcome::Interrupted { reason }, Some(path));
        }

        tracing::debug!(chars = text.chars().count(), "playing speech");
        let outcome = match self.player.play(&path, token) {
            Ok(PlaybackOutcome::Completed) => SpeechOutcome::Completed,
            Ok(PlaybackOutcome::Interrupted { reason }) => {
                tracing::info!(reason, "speech interrupted");
                SpeechOutcome::Interrupted { reason }
            }
            Ok(PlaybackOutcome::TimedOut) => SpeechOutcome::TimedOut,
            Err(e) => {
                tracing::error!(error = %e, "audio playback failed");
                SpeechOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };
        (outcome, Some(path))
    }

    fn teardown(
        &self,
        monitoring: bool,
        mute: crate::audio::MuteGuard,
        clip: Option<PathBuf>,
        ticket: &SpeechTicket,
        outcome: SpeechOutcome,
    ) {
        self.player.reset();
        if monitoring {
            self.mic.stop_monitor();
        }
        drop(mute);

        if let Some(path) = clip {
            if self.settings.keep_files {
                tracing::debug!(path = %path.display(), "keeping speech clip");
            } else if let (true, Some(cleanup)) = (self.settings.deferred_cleanup, &self.cleanup) {
                cleanup.schedule(path);
            } else if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove speech clip");
            }
        }

        {
            let mut flight = self.flight();
            flight.last_finished = Some(Instant::now());
            if flight
                .current
                .as_ref()
                .is_some_and(|current| current.token.same_as(&ticket.token))
            {
                flight.current = None;
            }
        }

        tracing::debug!(outcome = ?outcome, "speech finished");
        ticket.done.finish(outcome);
    }

    /// Cancel whatever is playing and wait briefly for teardown
    pub fn cancel_all(&self, reason: &str) {
        let current = self.flight().current.clone();
        if let Some(ticket) = current {
            ticket.cancel(reason);
            if ticket.wait(self.settings.stop_grace).is_none() {
                tracing::warn!("speech did not stop within grace period");
            }
        }
    }

    /// Play the listening cue if enabled
    pub fn cue(&self) {
        if self.settings.listening_cue {
            self.player.chime();
        }
    }
}

impl Interruptible for SpeechOutput {
    fn is_speaking(&self) -> bool {
        Self::is_speaking(self)
    }

    fn interrupt(&self, reason: &str) {
        if let Some(ticket) = self.flight().current.as_ref() {
            ticket.cancel(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mic::MicSettings;
    use crate::audio::{SyntheticInput, VirtualClock};
    use crate::{Error, Result};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FileSynth {
        dir: tempfile::TempDir,
        fail: bool,
    }

    impl Synthesizer for FileSynth {
        fn synthesize(&self, text: &str, _voice: &str) -> Result<PathBuf> {
            if self.fail {
                return Err(Error::Tts("offline".to_string()));
            }
            let path = self
                .dir
                .path()
                .join(format!("tts_{}.mp3", uuid::Uuid::new_v4().simple()));
            std::fs::write(&path, text)?;
            Ok(path)
        }
    }

    #[derive(Default)]
    struct SleepPlayer {
        length: Duration,
        active: AtomicU32,
        max_active: AtomicU32,
        resets: AtomicU32,
    }

    impl Player for SleepPlayer {
        fn play(&self, _path: &Path, stop: &CancellationToken) -> Result<PlaybackOutcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let stopped = stop.wait(self.length);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(if stopped {
                PlaybackOutcome::Interrupted {
                    reason: stop.reason().unwrap_or_default(),
                }
            } else {
                PlaybackOutcome::Completed
            })
        }

        fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn output(length: Duration, fail: bool) -> (Arc<MicStreamManager>, Arc<SleepPlayer>, Arc<SpeechOutput>) {
        let input = SyntheticInput::new(Arc::new(VirtualClock::new()));
        let mic = MicStreamManager::new(Arc::new(input), MicSettings::default());
        mic.initialize_device().unwrap();
        let player = Arc::new(SleepPlayer {
            length,
            ..SleepPlayer::default()
        });
        let synth = Arc::new(FileSynth {
            dir: tempfile::tempdir().unwrap(),
            fail,
        });
        let settings = SpeechSettings {
            overlap_wait: Duration::from_millis(50),
            stop_grace: Duration::from_millis(500),
            min_gap: Duration::ZERO,
            deferred_cleanup: false,
            ..SpeechSettings::default()
        };
        let speech = SpeechOutput::new(Arc::clone(&mic), synth, player.clone(), None, settings);
        (mic, player, speech)
    }

    #[test]
    fn test_speak_mutes_then_restores() {
        let (mic, player, speech) = output(Duration::from_millis(50), false);
        mic.set_listening(true);

        let ticket = speech.speak("hello there");
        assert!(!mic.is_open());
        assert!(speech.is_speaking());
        assert_eq!(ticket.wait(Duration::from_secs(5)), Some(SpeechOutcome::Completed));
        assert!(mic.is_open());
        assert!(!speech.is_speaking());
        assert_eq!(player.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_text_is_skipped() {
        let (mic, _player, speech) = output(Duration::from_millis(10), false);
        mic.set_listening(true);
        let ticket = speech.speak("  <> {} ");
        assert_eq!(ticket.wait(Duration::ZERO), Some(SpeechOutcome::Skipped));
        assert!(mic.is_open());
    }

    #[test]
    fn test_overlapping_speak_never_overlaps_playback() {
        let (_mic, player, speech) = output(Duration::from_secs(2), false);
        let first = speech.speak("first");
        std::thread::sleep(Duration::from_millis(20));
        let second = speech.speak("second");

        assert_eq!(
            first.wait(Duration::from_secs(1)),
            Some(SpeechOutcome::Interrupted {
                reason: SUPERSEDED_REASON.to_string()
            })
        );
        second.cancel("done");
        assert!(second.wait(Duration::from_secs(5)).is_some());
        assert_eq!(player.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_stops_current_utterance() {
        let (_mic, _player, speech) = output(Duration::from_secs(5), false);
        let ticket = speech.speak("a long answer");
        std::thread::sleep(Duration::from_millis(20));
        Interruptible::interrupt(speech.as_ref(), "barge-in");
        assert_eq!(
            ticket.wait(Duration::from_secs(1)),
            Some(SpeechOutcome::Interrupted {
                reason: "barge-in".to_string()
            })
        );
    }

    #[test]
    fn test_synthesis_failure_still_tears_down() {
        let (mic, player, speech) = output(Duration::from_millis(10), true);
        mic.set_listening(true);
        let ticket = speech.speak("hello");
        assert!(matches!(
            ticket.wait(Duration::from_secs(5)),
            Some(SpeechOutcome::Failed { .. })
        ));
        assert!(mic.is_open());
        assert_eq!(player.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clip_deleted_after_playback() {
        let (_mic, _player, speech) = output(Duration::from_millis(10), false);
        let ticket = speech.speak("bye");
        ticket.wait(Duration::from_secs(5)).unwrap();
        // synth dir only ever held the one clip
        let synth_dir_empty = speech
            .synthesizer
            .synthesize("check", "v")
            .map(|p| {
                let dir = p.parent().unwrap().to_path_buf();
                std::fs::remove_file(&p).unwrap();
                std::fs::read_dir(dir).unwrap().count() == 0
            })
            .unwrap();
        assert!(synth_dir_empty);
    }
}
