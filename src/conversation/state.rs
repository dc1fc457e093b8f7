//! Conversation state and the mic gate ordering rule
//!
//! The microphone may only be open while the published state is
//! [`ConversationState::Listening`]. Every transition away from listening
//! closes the gate before the new state becomes visible, and a transition
//! into listening publishes first and opens the gate last.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::audio::{Clock, MicStreamManager};

/// Where the conversation is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConversationState {
    /// Standing by; the mic is closed
    Idle = 0,
    /// Recording the user
    Listening = 1,
    /// Transcribing or thinking
    Processing = 2,
    /// Playing a reply
    Speaking = 3,
}

impl ConversationState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Listening,
            2 => Self::Processing,
            3 => Self::Speaking,
            _ => Self::Idle,
        }
    }

    /// Lowercase label for logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with `(from, to)` after a transition is published
///
/// Runs while transitions are serialized; must not call `set_state`.
pub type StateObserver = Arc<dyn Fn(ConversationState, ConversationState) + Send + Sync>;

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
struct Current {
    state: ConversationState,
    entered_at: Duration,
}

/// Owner of the conversation state
pub struct StateMachine {
    mic: Arc<MicStreamManager>,
    clock: Arc<dyn Clock>,
    min_dwell: Duration,
    current: Mutex<Current>,
    published: AtomicU8,
    observer: RwLock<Option<StateObserver>>,
    on_listening: RwLock<Option<Hook>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state())
            .field("min_dwell", &self.min_dwell)
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    /// Start in [`ConversationState::Idle`] with the gate closed
    #[must_use]
    pub fn new(mic: Arc<MicStreamManager>, clock: Arc<dyn Clock>, min_dwell: Duration) -> Self {
        mic.set_listening(false);
        let entered_at = clock.now();
        Self {
            mic,
            clock,
            min_dwell,
            current: Mutex::new(Current {
                state: ConversationState::Idle,
                entered_at,
            }),
            published: AtomicU8::new(ConversationState::Idle as u8),
            observer: RwLock::new(None),
            on_listening: RwLock::new(None),
        }
    }

    /// Published state; lock-free
    #[must_use]
    pub fn state(&self) -> ConversationState {
        ConversationState::from_u8(self.published.load(Ordering::SeqCst))
    }

    /// Install the transition observer
    pub fn set_observer(
        &self,
        observer: impl Fn(ConversationState, ConversationState) + Send + Sync + 'static,
    ) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Run `hook` after entering listening, just before the gate opens
    pub fn set_listening_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .on_listening
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Move to `next`
    ///
    /// Returns `false` without side effects when already in `next`.
    /// Otherwise sleeps out the rest of the minimum dwell, applies the gate
    /// ordering rule and notifies the observer.
    pub fn set_state(&self, next: ConversationState) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.state == next {
            return false;
        }

        let dwell = self.clock.now().saturating_sub(current.entered_at);
        if dwell < self.min_dwell {
            self.clock.sleep(self.min_dwell - dwell);
        }

        if next != ConversationState::Listening {
            self.mic.set_listening(false);
        }

        let previous = current.state;
        current.state = next;
        current.entered_at = self.clock.now();
        self.published.store(next as u8, Ordering::SeqCst);
        tracing::debug!(from = %previous, to = %next, "conversation state");

        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(previous, next);
        }

        if next == ConversationState::Listening {
            let hook = self
                .on_listening
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(hook) = hook {
                hook();
            }
            self.mic.set_listening(true);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mic::MicSettings;
    use crate::audio::{SyntheticInput, VirtualClock};

    fn machine(dwell: Duration) -> (StateMachine, Arc<MicStreamManager>, VirtualClock) {
        let clock = VirtualClock::new();
        let input = SyntheticInput::new(Arc::new(clock.clone()));
        let mic = MicStreamManager::new(Arc::new(input), MicSettings::default());
        let machine = StateMachine::new(Arc::clone(&mic), Arc::new(clock.clone()), dwell);
        (machine, mic, clock)
    }

    #[test]
    fn test_starts_idle_and_closed() {
        let (machine, mic, _) = machine(Duration::ZERO);
        assert_eq!(machine.state(), ConversationState::Idle);
        assert!(!mic.is_open());
    }

    #[test]
    fn test_same_state_is_noop() {
        let (machine, mic, clock) = machine(Duration::from_millis(500));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        machine.set_observer(move |from, to| seen.lock().unwrap().push((from, to)));

        assert!(machine.set_state(ConversationState::Listening));
        let after_first = clock.now();
        assert!(!machine.set_state(ConversationState::Listening));

        assert_eq!(clock.now(), after_first);
        assert_eq!(transitions.lock().unwrap().len(), 1);
        assert!(mic.is_open());
    }

    #[test]
    fn test_dwell_is_enforced() {
        let (machine, _, clock) = machine(Duration::from_millis(500));
        machine.set_state(ConversationState::Listening);
        let entered = clock.now();
        machine.set_state(ConversationState::Processing);
        assert!(clock.now() - entered >= Duration::from_millis(500));
    }

    #[test]
    fn test_gate_closed_before_processing_is_published() {
        let (machine, mic, _) = machine(Duration::ZERO);
        let gate_at_publish = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&gate_at_publish);
        let observed_mic = Arc::clone(&mic);
        machine.set_observer(move |_, to| seen.lock().unwrap().push((to, observed_mic.is_open())));

        machine.set_state(ConversationState::Listening);
        machine.set_state(ConversationState::Processing);
        machine.set_state(ConversationState::Speaking);
        machine.set_state(ConversationState::Idle);

        let seen = gate_at_publish.lock().unwrap();
        assert_eq!(seen[0], (ConversationState::Listening, false));
        assert!(seen[1..].iter().all(|(_, open)| !open));
    }

    #[test]
    fn test_listening_hook_runs_before_gate_opens() {
        let (machine, mic, _) = machine(Duration::ZERO);
        let gate_in_hook = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&gate_in_hook);
        let hooked_mic = Arc::clone(&mic);
        machine.set_listening_hook(move || *seen.lock().unwrap() = Some(hooked_mic.is_open()));

        machine.set_state(ConversationState::Listening);
        assert_eq!(*gate_in_hook.lock().unwrap(), Some(false));
        assert!(mic.is_open());
    }
}
