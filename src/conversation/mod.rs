//! The turn-taking loop
//!
//! One turn is: listen, transcribe, decide, speak. [`Conversation::run`]
//! repeats turns until an exit word or shutdown, counting failures instead
//! of giving up on them.

pub mod history;
pub mod state;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Deserialize;

use crate::audio::{Clock, MicStreamManager, RecordingOutcome, RecordingSession};
use crate::cancel::CancellationToken;
use crate::hotword::{HotwordMatcher, normalize};
use crate::text::clean_stt_text;
use crate::turn::{ChatRole, TurnHandler, TurnReply, intent};
use crate::voice::{InterruptListener, SpeechOutcome, SpeechOutput, SpeechTicket, Transcriber};
use crate::{Error, Result};

pub use history::{History, TranscriptLog};
pub use state::{ConversationState, StateMachine, StateObserver};

/// Spoken after a failed turn
pub const APOLOGY: &str = "Sorry, something went wrong. I'll keep listening.";

/// Spoken on an exit word
pub const GOODBYE: &str = "Goodbye!";

/// Reason used to stop speech on shutdown
pub const SHUTDOWN_REASON: &str = "shutdown";

/// Loop tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// Utterances that end the session
    pub exit_words: Vec<String>,
    /// Utterances that put the assistant on standby
    pub sleep_words: Vec<String>,
    /// Shortest time spent in any state
    #[serde(with = "crate::config::duration_secs")]
    pub min_dwell: Duration,
    /// Deadline for the turn handler
    #[serde(with = "crate::config::duration_secs")]
    pub turn_timeout: Duration,
    /// Deadline for transcription
    #[serde(with = "crate::config::duration_secs")]
    pub transcribe_timeout: Duration,
    /// Longest wait for a reply to finish playing
    #[serde(with = "crate::config::duration_secs")]
    pub speech_timeout: Duration,
    /// Consecutive failures after which apologies stop
    pub error_threshold: u32,
    /// Pause after a failed turn
    #[serde(with = "crate::config::duration_secs")]
    pub error_backoff: Duration,
    /// Exchanges kept as model context
    pub context_turns: usize,
    /// Say a filler line when the handler takes longer than this
    #[serde(with = "crate::config::duration_secs")]
    pub filler_after: Duration,
    /// Minimum spacing between filler lines
    #[serde(with = "crate::config::duration_secs")]
    pub filler_cooldown: Duration,
    /// Speak filler lines at all
    pub fillers: bool,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            exit_words: vec!["quit".to_string(), "exit".to_string(), "stop".to_string()],
            sleep_words: vec![
                "sleep".to_string(),
                "standby".to_string(),
                "go to sleep".to_string(),
            ],
            min_dwell: Duration::from_millis(500),
            turn_timeout: Duration::from_secs(45),
            transcribe_timeout: Duration::from_secs(30),
            speech_timeout: Duration::from_secs(120),
            error_threshold: 5,
            error_backoff: Duration::from_secs(1),
            context_turns: 10,
            filler_after: Duration::from_millis(1200),
            filler_cooldown: Duration::from_secs(30),
            fillers: true,
        }
    }
}

/// What a single turn did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The recording budget ran out with nothing said
    NoSpeech,
    /// Speech was heard but transcribed to nothing
    Empty,
    /// A reply was spoken
    Replied {
        /// Cleaned transcript
        heard: String,
        /// Spoken reply
        reply: TurnReply,
        /// How playback ended
        speech: Option<SpeechOutcome>,
    },
    /// Standby utterance without the hotword
    Ignored,
    /// The hotword ended standby
    Woke,
    /// A sleep word started standby
    Slept,
    /// An exit word ended the session
    Exit,
    /// Shutdown was requested mid-turn
    Cancelled,
}

/// Everything the loop talks to
pub struct Collaborators {
    /// Shared microphone
    pub mic: Arc<MicStreamManager>,
    /// User-turn recorder
    pub recorder: RecordingSession,
    /// Speech-to-text
    pub transcriber: Arc<dyn Transcriber>,
    /// Reply producer
    pub handler: Arc<dyn TurnHandler>,
    /// Speech output
    pub speech: Arc<SpeechOutput>,
    /// Wake word matcher used after standby
    pub hotword: Option<Arc<HotwordMatcher>>,
    /// Time source for dwell and backoff
    pub clock: Arc<dyn Clock>,
}

/// The conversation loop
pub struct Conversation {
    machine: Arc<StateMachine>,
    mic: Arc<MicStreamManager>,
    recorder: RecordingSession,
    transcriber: Arc<dyn Transcriber>,
    handler: Arc<dyn TurnHandler>,
    speech: Arc<SpeechOutput>,
    hotword: Option<Arc<HotwordMatcher>>,
    clock: Arc<dyn Clock>,
    listener: Option<InterruptListener>,
    history: History,
    transcript: TranscriptLog,
    settings: ConversationSettings,
    shutdown: CancellationToken,
    errors: u32,
    asleep: bool,
    last_filler: Option<Instant>,
    filler: Option<SpeechTicket>,
    filler_outcome: Option<SpeechOutcome>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("state", &self.machine.state())
            .field("errors", &self.errors)
            .field("asleep", &self.asleep)
            .finish_non_exhaustive()
    }
}

/// Granularity of waits that must notice shutdown
const POLL: Duration = Duration::from_millis(100);

enum Waited<T> {
    Done(T),
    TimedOut,
    Shutdown,
    Lost,
}

fn spawn_worker<T: Send + 'static>(
    name: &str,
    work: impl FnOnce() -> T + Send + 'static,
) -> Result<Receiver<T>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })?;
    Ok(rx)
}

fn wait_for<T>(
    rx: &Receiver<T>,
    budget: Duration,
    shutdown: &CancellationToken,
) -> Waited<T> {
    let deadline = Instant::now() + budget;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Waited::TimedOut;
        }
        match rx.recv_timeout(POLL.min(deadline - now)) {
            Ok(value) => return Waited::Done(value),
            Err(RecvTimeoutError::Disconnected) => return Waited::Lost,
            Err(RecvTimeoutError::Timeout) if shutdown.is_cancelled() => return Waited::Shutdown,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

impl Conversation {
    /// Assemble the loop
    ///
    /// The speech cue is wired to the listening transition.
    #[must_use]
    pub fn new(
        parts: Collaborators,
        settings: ConversationSettings,
        history: History,
        transcript: TranscriptLog,
        shutdown: CancellationToken,
    ) -> Self {
        let machine = Arc::new(StateMachine::new(
            Arc::clone(&parts.mic),
            Arc::clone(&parts.clock),
            settings.min_dwell,
        ));
        let cue = Arc::clone(&parts.speech);
        machine.set_listening_hook(move || cue.cue());

        Self {
            machine,
            mic: parts.mic,
            recorder: parts.recorder,
            transcriber: parts.transcriber,
            handler: parts.handler,
            speech: parts.speech,
            hotword: parts.hotword,
            clock: parts.clock,
            listener: None,
            history,
            transcript,
            settings,
            shutdown,
            errors: 0,
            asleep: false,
            last_filler: None,
            filler: None,
            filler_outcome: None,
        }
    }

    /// Hand the barge-in listener to the loop so it is stopped on exit
    #[must_use]
    pub fn with_interrupt_listener(mut self, listener: InterruptListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Shared state machine (for observers)
    #[must_use]
    pub fn state_machine(&self) -> Arc<StateMachine> {
        Arc::clone(&self.machine)
    }

    /// Published state
    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.machine.state()
    }

    /// Consecutive failed turns
    #[must_use]
    pub const fn error_count(&self) -> u32 {
        self.errors
    }

    /// Whether the loop is on standby
    #[must_use]
    pub const fn is_asleep(&self) -> bool {
        self.asleep
    }

    /// How the most recent filler line ended, once the reply took over
    #[must_use]
    pub fn last_filler_outcome(&self) -> Option<&SpeechOutcome> {
        self.filler_outcome.as_ref()
    }

    /// Conversation history
    #[must_use]
    pub const fn history(&self) -> &History {
        &self.history
    }

    /// Run turns until an exit word or shutdown, then clean up
    pub fn run(&mut self) {
        tracing::info!("conversation started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.run_turn()));
            match result {
                Ok(Ok(TurnOutcome::Exit | TurnOutcome::Cancelled)) => break,
                Ok(Ok(outcome)) => {
                    if matches!(outcome, TurnOutcome::Replied { .. } | TurnOutcome::Woke) {
                        self.errors = 0;
                    }
                    tracing::trace!(outcome = ?outcome, "turn finished");
                }
                Ok(Err(e)) => self.on_failure(&e.to_string()),
                Err(_) => self.on_failure("turn panicked"),
            }
        }
        self.finish();
    }

    /// Run one turn
    ///
    /// # Errors
    ///
    /// Returns error if recording, transcription or the handler fails
    pub fn run_turn(&mut self) -> Result<TurnOutcome> {
        if self.shutdown.is_cancelled() {
            return Ok(TurnOutcome::Cancelled);
        }
        self.machine.set_state(ConversationState::Listening);

        let audio = match self.recorder.record(&self.shutdown)? {
            RecordingOutcome::Finalized { audio, reason } => {
                tracing::debug!(reason = ?reason, duration_ms = audio.duration().as_millis(), "utterance captured");
                audio
            }
            RecordingOutcome::NoSpeech => {
                tracing::debug!("no speech before recording budget ran out");
                return Ok(TurnOutcome::NoSpeech);
            }
            RecordingOutcome::Cancelled { reason } => {
                tracing::debug!(reason, "recording cancelled");
                return Ok(TurnOutcome::Cancelled);
            }
        };

        self.machine.set_state(ConversationState::Processing);
        let transcriber = Arc::clone(&self.transcriber);
        let rx = spawn_worker("parley-stt", move || transcriber.transcribe(audio))?;
        let raw = match wait_for(&rx, self.settings.transcribe_timeout, &self.shutdown) {
            Waited::Done(result) => result?,
            Waited::Shutdown => return Ok(TurnOutcome::Cancelled),
            Waited::TimedOut => {
                return Err(Error::Timeout {
                    operation: "transcription",
                    seconds: self.settings.transcribe_timeout.as_secs_f64(),
                });
            }
            Waited::Lost => return Err(Error::Stt("transcriber exited without a result".to_string())),
        };
        let mut heard = clean_stt_text(&raw);
        if heard.is_empty() {
            tracing::debug!("empty transcript");
            return Ok(TurnOutcome::Empty);
        }
        tracing::info!(text = %heard, "heard");
        self.transcript.append(ChatRole::User, &heard);

        if self.asleep {
            let Some(hotword) = &self.hotword else {
                self.asleep = false;
                return self.respond(heard);
            };
            let Some(hit) = hotword.detect(&heard) else {
                tracing::debug!("standby: no hotword");
                return Ok(TurnOutcome::Ignored);
            };
            tracing::info!(alias = %hit.alias, score = hit.score, "hotword detected, waking");
            self.asleep = false;
            heard = hotword.strip(&heard, Some(&hit.alias));
            if heard.trim().is_empty() {
                self.say("I'm here.");
                return Ok(TurnOutcome::Woke);
            }
        }

        let command = normalize(&heard);
        if self.settings.exit_words.iter().any(|w| normalize(w) == command) {
            tracing::info!("exit word heard");
            self.say(GOODBYE);
            return Ok(TurnOutcome::Exit);
        }
        if self.settings.sleep_words.iter().any(|w| normalize(w) == command) {
            let word = self
                .hotword
                .as_ref()
                .map_or_else(|| "anything".to_string(), |h| h.word().to_string());
            self.say(&format!("Standing by. Say {word} to wake me."));
            // standby keeps recording each turn; only an utterance carrying
            // the hotword is acted on until then
            self.asleep = true;
            self.machine.set_state(ConversationState::Idle);
            tracing::info!("standby");
            return Ok(TurnOutcome::Slept);
        }

        self.respond(heard)
    }

    fn respond(&mut self, heard: String) -> Result<TurnOutcome> {
        let Some(reply) = self.reply_with_filler(&heard)? else {
            return Ok(TurnOutcome::Cancelled);
        };
        tracing::info!(source = ?reply.source, chars = reply.text.chars().count(), "reply ready");

        let speech = self.say(&reply.text);
        self.settle_filler();
        self.transcript.append(ChatRole::Assistant, &reply.text);
        self.history.push_exchange(&heard, &reply.text);
        if let Err(e) = self.history.save() {
            tracing::warn!(error = %e, "could not save conversation history");
        }

        Ok(TurnOutcome::Replied {
            heard,
            reply,
            speech,
        })
    }

    /// Run the handler under its deadline, speaking a filler line if slow
    ///
    /// `None` means shutdown was requested while waiting.
    fn reply_with_filler(&mut self, heard: &str) -> Result<Option<TurnReply>> {
        let handler = Arc::clone(&self.handler);
        let text = heard.to_string();
        let history = self.history.messages();
        let rx = spawn_worker("parley-turn", move || handler.handle(&text, &history))?;

        let started = Instant::now();
        let deadline = self.settings.turn_timeout;
        let mut waited = Waited::TimedOut;
        if self.settings.fillers && self.settings.filler_after < deadline {
            waited = wait_for(&rx, self.settings.filler_after, &self.shutdown);
            if matches!(waited, Waited::TimedOut) {
                self.filler();
            }
        }
        if matches!(waited, Waited::TimedOut) {
            let remaining = deadline.saturating_sub(started.elapsed());
            waited = wait_for(&rx, remaining, &self.shutdown);
        }

        match waited {
            Waited::Done(result) => result.map(Some),
            Waited::Shutdown => Ok(None),
            Waited::Lost => Err(Error::Llm("turn handler exited without a reply".to_string())),
            Waited::TimedOut => Err(Error::Timeout {
                operation: "turn",
                seconds: deadline.as_secs_f64(),
            }),
        }
    }

    fn filler(&mut self) {
        let due = self
            .last_filler
            .is_none_or(|at| at.elapsed() >= self.settings.filler_cooldown);
        if !due {
            return;
        }
        self.last_filler = Some(Instant::now());
        let line = intent::processing_line();
        tracing::debug!(line, "speaking filler");
        // plays in the processing state; the reply supersedes it
        self.filler = Some(self.speech.speak(line));
    }

    /// Record how the filler ended; the reply has retired it by now
    fn settle_filler(&mut self) {
        let Some(ticket) = self.filler.take() else {
            return;
        };
        let outcome = ticket.wait(self.speech.settings().stop_grace);
        if let Some(SpeechOutcome::Failed { message }) = &outcome {
            tracing::debug!(error = %message, "filler could not be spoken");
        }
        self.filler_outcome = outcome;
    }

    /// Speak `text` in the speaking state and wait for it to end
    fn say(&self, text: &str) -> Option<SpeechOutcome> {
        self.machine.set_state(ConversationState::Speaking);
        let ticket = self.speech.speak(text);
        let deadline = Instant::now() + self.settings.speech_timeout;
        loop {
            if let Some(outcome) = ticket.wait(POLL) {
                return Some(outcome);
            }
            if self.shutdown.is_cancelled() {
                ticket.cancel(SHUTDOWN_REASON);
                return ticket.wait(self.speech.settings().stop_grace);
            }
            if Instant::now() >= deadline {
                tracing::warn!("speech did not finish in time, cancelling");
                ticket.cancel("speech timeout");
                return None;
            }
        }
    }

    fn on_failure(&mut self, message: &str) {
        self.errors += 1;
        tracing::error!(error = message, consecutive = self.errors, "turn failed");

        if self.shutdown.is_cancelled() {
            return;
        }
        if self.errors < self.settings.error_threshold {
            self.say(APOLOGY);
        } else {
            tracing::warn!(
                threshold = self.settings.error_threshold,
                "too many consecutive errors, resetting counter"
            );
            self.errors = 0;
        }
        self.clock.sleep(self.settings.error_backoff);
    }

    /// Guaranteed cleanup: stop speech, the mic and the listener
    fn finish(&mut self) {
        tracing::info!("conversation stopping");
        self.speech.cancel_all(SHUTDOWN_REASON);
        self.machine.set_state(ConversationState::Idle);
        self.mic.stop();
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
        }
        if let Err(e) = self.history.save() {
            tracing::warn!(error = %e, "could not save conversation history");
        }
        tracing::info!("conversation stopped");
    }
}
