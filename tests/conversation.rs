//! Conversation loop integration tests
//!
//! Runs whole turns over synthetic audio and a virtual clock

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley::audio::{Clock, MicSettings, MicStreamManager, SyntheticInput, VirtualClock};
use parley::conversation::{APOLOGY, ConversationState, GOODBYE, StateMachine};
use parley::turn::ReplySource;
use parley::voice::SpeechOutcome;
use parley::{ConversationSettings, TurnOutcome};
use proptest::prelude::*;

mod common;

use common::Rig;

#[test]
fn test_greeting_is_answered_without_the_model() {
    let mut rig = Rig::new(&["hello"]);
    rig.queue_utterance();

    let outcome = rig.conversation.run_turn().unwrap();
    let TurnOutcome::Replied { heard, reply, speech } = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(heard, "hello");
    assert_eq!(reply.source, ReplySource::Greeting);
    assert_eq!(speech, Some(SpeechOutcome::Completed));
    assert_eq!(rig.model.calls(), 0);
    assert_eq!(rig.synthesizer.spoken(), vec![reply.text]);
    assert_eq!(rig.conversation.history().len(), 2);
}

#[test]
fn test_open_question_goes_to_the_model() {
    let mut rig = Rig::new(&["tell me something about the history of tea"]);
    rig.queue_utterance();

    let outcome = rig.conversation.run_turn().unwrap();
    let TurnOutcome::Replied { reply, .. } = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(reply.source, ReplySource::Model);
    assert_eq!(reply.text, "A model reply.");
    assert_eq!(rig.model.calls(), 1);
}

#[test]
fn test_silence_runs_out_the_budget() {
    let mut rig = Rig::new(&[]);
    rig.input.push_silence(Duration::from_secs(31));

    let started = rig.clock.now();
    let outcome = rig.conversation.run_turn().unwrap();
    assert_eq!(outcome, TurnOutcome::NoSpeech);
    assert!(rig.clock.now() - started >= Duration::from_secs(30));
    assert_eq!(rig.conversation.state(), ConversationState::Listening);
    assert!(rig.synthesizer.spoken().is_empty());
}

#[test]
fn test_empty_transcript_is_not_answered() {
    let mut rig = Rig::new(&["  "]);
    rig.queue_utterance();

    assert_eq!(rig.conversation.run_turn().unwrap(), TurnOutcome::Empty);
    assert_eq!(rig.model.calls(), 0);
    assert!(rig.synthesizer.spoken().is_empty());
}

#[test]
fn test_exit_word_stops_the_loop() {
    let mut rig = Rig::new(&["hello", "Quit."]);
    rig.queue_utterance();
    rig.queue_utterance();

    rig.conversation.run();

    let spoken = rig.synthesizer.spoken();
    assert_eq!(spoken.len(), 2);
    assert_eq!(spoken[1], GOODBYE);
    assert_eq!(rig.conversation.state(), ConversationState::Idle);
    assert!(!rig.mic.is_open());
}

#[test]
fn test_sequential_replies_never_overlap() {
    let mut rig = Rig::new(&["hello", "good morning", "hi there", "exit"]);
    for _ in 0..4 {
        rig.queue_utterance();
    }

    rig.conversation.run();

    assert_eq!(rig.player.plays(), 4);
    assert_eq!(rig.player.max_active(), 1);
}

#[test]
fn test_concurrent_speak_calls_never_overlap() {
    let rig = Rig::new(&[]);
    let speakers: Vec<_> = (0..4)
        .map(|i| {
            let speech = Arc::clone(&rig.speech);
            std::thread::spawn(move || speech.speak(&format!("line {i}")).wait(Duration::from_secs(5)))
        })
        .collect();

    for speaker in speakers {
        assert!(speaker.join().unwrap().is_some());
    }
    assert!(rig.player.plays() >= 1);
    assert_eq!(rig.player.max_active(), 1);
    assert!(!rig.speech.is_speaking());
    assert!(!rig.mic.gate().is_muted());
}

#[test]
fn test_failed_playback_reopens_the_mic() {
    let mut rig = Rig::new(&["hello", "good morning"]);
    rig.queue_utterance();
    rig.queue_utterance();
    rig.player.fail_plays(true);

    let outcome = rig.conversation.run_turn().unwrap();
    let TurnOutcome::Replied { speech, .. } = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert!(matches!(speech, Some(SpeechOutcome::Failed { .. })));
    assert!(!rig.mic.gate().is_muted());
    assert_eq!(rig.conversation.error_count(), 0);

    // next turn can still record
    rig.player.fail_plays(false);
    let outcome = rig.conversation.run_turn().unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Replied {
            speech: Some(SpeechOutcome::Completed),
            ..
        }
    ));
    assert!(!rig.mic.gate().is_muted());
}

#[test]
fn test_failed_filler_does_not_block_the_reply() {
    let mut rig = Rig::with_settings(&["tell me something about the history of tea"], ConversationSettings {
        fillers: true,
        filler_after: Duration::from_millis(50),
        ..common::fast_conversation()
    });
    rig.queue_utterance();
    rig.model.set_delay(Duration::from_millis(400));
    rig.player.fail_plays(true);

    let outcome = rig.conversation.run_turn().unwrap();
    let TurnOutcome::Replied { reply, .. } = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(reply.source, ReplySource::Model);
    assert!(matches!(
        rig.conversation.last_filler_outcome(),
        Some(SpeechOutcome::Failed { .. })
    ));
    let spoken = rig.synthesizer.spoken();
    assert_eq!(spoken.len(), 2);
    assert_eq!(spoken[1], reply.text);
}

#[test]
fn test_shutdown_ends_the_loop() {
    let mut rig = Rig::new(&[]);
    rig.shutdown.cancel("shutdown");

    rig.conversation.run();
    assert_eq!(rig.conversation.state(), ConversationState::Idle);
    assert!(rig.synthesizer.spoken().is_empty());
}

#[test]
fn test_sleep_and_wake() {
    let mut rig = Rig::new(&["go to sleep", "what time is it", "parley"]);
    for _ in 0..3 {
        rig.queue_utterance();
    }

    assert_eq!(rig.conversation.run_turn().unwrap(), TurnOutcome::Slept);
    assert!(rig.conversation.is_asleep());
    assert_eq!(rig.conversation.state(), ConversationState::Idle);

    assert_eq!(rig.conversation.run_turn().unwrap(), TurnOutcome::Ignored);
    assert!(rig.conversation.is_asleep());

    assert_eq!(rig.conversation.run_turn().unwrap(), TurnOutcome::Woke);
    assert!(!rig.conversation.is_asleep());

    let spoken = rig.synthesizer.spoken();
    assert_eq!(spoken.len(), 2);
    assert!(spoken[0].starts_with("Standing by"));
    assert_eq!(spoken[1], "I'm here.");
}

#[test]
fn test_error_streak_apologizes_then_resets() {
    let mut rig = Rig::with_settings(&[], ConversationSettings {
        error_threshold: 5,
        ..common::fast_conversation()
    });
    for _ in 0..5 {
        rig.transcriber.push_failure("backend down");
        rig.queue_utterance();
    }
    rig.transcriber.push_line("exit");
    rig.queue_utterance();

    rig.conversation.run();

    let spoken = rig.synthesizer.spoken();
    let apologies = spoken.iter().filter(|s| s.as_str() == APOLOGY).count();
    assert_eq!(apologies, 4);
    assert_eq!(spoken.last().map(String::as_str), Some(GOODBYE));
    assert_eq!(rig.conversation.error_count(), 0);
}

#[test]
fn test_successful_turn_clears_errors() {
    let mut rig = Rig::new(&[]);
    rig.transcriber.push_failure("backend down");
    rig.queue_utterance();
    rig.transcriber.push_line("hello");
    rig.queue_utterance();
    rig.transcriber.push_line("stop");
    rig.queue_utterance();

    rig.conversation.run();

    let spoken = rig.synthesizer.spoken();
    assert_eq!(spoken[0], APOLOGY);
    assert_eq!(spoken.last().map(String::as_str), Some(GOODBYE));
    assert_eq!(rig.conversation.error_count(), 0);
}

#[test]
fn test_set_state_is_idempotent() {
    let clock = VirtualClock::new();
    let input = SyntheticInput::new(Arc::new(clock.clone()));
    let mic = MicStreamManager::new(Arc::new(input), MicSettings::default());
    mic.initialize_device().unwrap();
    let machine = StateMachine::new(Arc::clone(&mic), Arc::new(clock), Duration::ZERO);

    assert!(machine.set_state(ConversationState::Processing));
    assert!(!machine.set_state(ConversationState::Processing));
    assert_eq!(machine.state(), ConversationState::Processing);
    assert!(!mic.is_open());
}

fn any_state() -> impl Strategy<Value = ConversationState> {
    prop_oneof![
        Just(ConversationState::Idle),
        Just(ConversationState::Listening),
        Just(ConversationState::Processing),
        Just(ConversationState::Speaking),
    ]
}

#[derive(Debug, Clone)]
enum Step {
    Go(ConversationState),
    Mute,
    Unmute,
}

fn any_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => any_state().prop_map(Step::Go),
        1 => Just(Step::Mute),
        1 => Just(Step::Unmute),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_gate_only_open_while_listening(steps in prop::collection::vec(any_step(), 1..40)) {
        let clock = VirtualClock::new();
        let input = SyntheticInput::new(Arc::new(clock.clone()));
        let mic = MicStreamManager::new(Arc::new(input), MicSettings::default());
        mic.initialize_device().unwrap();
        let machine = Arc::new(StateMachine::new(Arc::clone(&mic), Arc::new(clock), Duration::ZERO));

        let violations = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&violations);
        let watched = Arc::clone(&machine);
        mic.set_gate_observer(move |gate| {
            let state = watched.state();
            if gate.is_open() && state != ConversationState::Listening {
                seen.lock().unwrap().push(state);
            }
        });

        let mut mutes = Vec::new();
        for step in steps {
            match step {
                Step::Go(next) => {
                    machine.set_state(next);
                }
                Step::Mute => mutes.push(mic.mute()),
                Step::Unmute => {
                    mutes.pop();
                }
            }
            let state = machine.state();
            if state != ConversationState::Listening {
                prop_assert!(!mic.is_open(), "gate open in {state}");
            }
        }

        prop_assert!(violations.lock().unwrap().is_empty());
    }
}
