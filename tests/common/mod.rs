//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley::audio::{
    AmplitudeClassifier, Clock, MicSettings, MicStreamManager, RecordedAudio, RecorderSettings,
    RecordingSession, SyntheticInput, VirtualClock,
};
use parley::conversation::{Collaborators, History, TranscriptLog};
use parley::hotword::{HotwordMatcher, HotwordSettings};
use parley::store::{NullStore, PersistenceStore};
use parley::turn::{AssistantTurnHandler, ChatMessage, LanguageModel, TurnSettings};
use parley::voice::{
    PlaybackOutcome, Player, SilentSynthesizer, SpeechOutput, SpeechSettings, Synthesizer,
    Transcriber,
};
use parley::{CancellationToken, Conversation, ConversationSettings, Error};

/// Transcriber that replays a fixed script, then returns empty text
#[derive(Default)]
pub struct ScriptedTranscriber {
    script: Mutex<VecDeque<parley::Result<String>>>,
}

impl ScriptedTranscriber {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            script: Mutex::new(lines.iter().map(|l| Ok((*l).to_string())).collect()),
        }
    }

    pub fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(Error::Stt(message.to_string())));
    }

    pub fn push_line(&self, line: &str) {
        self.script.lock().unwrap().push_back(Ok(line.to_string()));
    }
}

impl Transcriber for ScriptedTranscriber {
    fn transcribe(&self, _audio: RecordedAudio) -> parley::Result<String> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Language model that counts calls and answers with a fixed line
#[derive(Default)]
pub struct CountingModel {
    pub calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl CountingModel {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wall-clock pause before each answer
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

impl LanguageModel for CountingModel {
    fn complete(&self, _system: &str, _history: &[ChatMessage], _user: &str) -> parley::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        std::thread::sleep(delay);
        Ok("A model reply.".to_string())
    }
}

/// Synthesizer that remembers every line it was asked to say
pub struct RecordingSynthesizer {
    inner: SilentSynthesizer,
    pub spoken: Mutex<Vec<String>>,
}

impl RecordingSynthesizer {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: SilentSynthesizer::new(dir, Duration::from_millis(20)).unwrap(),
            spoken: Mutex::new(Vec::new()),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl Synthesizer for RecordingSynthesizer {
    fn synthesize(&self, text: &str, voice: &str) -> parley::Result<PathBuf> {
        self.spoken.lock().unwrap().push(text.to_string());
        self.inner.synthesize(text, voice)
    }
}

/// Player that tracks how many clips play at once
#[derive(Default)]
pub struct OverlapPlayer {
    hold: Duration,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub plays: AtomicUsize,
    failing: AtomicBool,
}

impl OverlapPlayer {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    /// Make every later play return an output error
    pub fn fail_plays(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Player for OverlapPlayer {
    fn play(&self, _path: &Path, stop: &CancellationToken) -> parley::Result<PlaybackOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Audio("output device unavailable".to_string()));
        }
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.plays.fetch_add(1, Ordering::SeqCst);
        let cancelled = stop.wait(self.hold);
        self.active.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Ok(PlaybackOutcome::Interrupted {
                reason: stop.reason().unwrap_or_default(),
            });
        }
        Ok(PlaybackOutcome::Completed)
    }

    fn reset(&self) {}
}

/// Speech settings without real-time gaps
pub fn fast_speech() -> SpeechSettings {
    SpeechSettings {
        min_gap: Duration::ZERO,
        overlap_wait: Duration::from_secs(2),
        stop_grace: Duration::from_millis(200),
        deferred_cleanup: false,
        barge_in: false,
        listening_cue: false,
        ..SpeechSettings::default()
    }
}

/// Loop settings without dwell or filler delays
pub fn fast_conversation() -> ConversationSettings {
    ConversationSettings {
        min_dwell: Duration::ZERO,
        fillers: false,
        error_backoff: Duration::from_millis(100),
        ..ConversationSettings::default()
    }
}

/// A conversation over synthetic audio and a virtual clock
pub struct Rig {
    pub clock: VirtualClock,
    pub input: SyntheticInput,
    pub mic: Arc<MicStreamManager>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub model: Arc<CountingModel>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub player: Arc<OverlapPlayer>,
    pub speech: Arc<SpeechOutput>,
    pub shutdown: CancellationToken,
    pub conversation: Conversation,
    _dir: tempfile::TempDir,
}

impl Rig {
    pub fn new(lines: &[&str]) -> Self {
        Self::with_settings(lines, fast_conversation())
    }

    pub fn with_settings(lines: &[&str], settings: ConversationSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = VirtualClock::new();
        let input = SyntheticInput::new(Arc::new(clock.clone()));
        let mic = MicStreamManager::new(Arc::new(input.clone()), MicSettings::default());
        mic.initialize_device().unwrap();

        let clock_dyn: Arc<dyn Clock> = Arc::new(clock.clone());
        let recorder = RecordingSession::new(
            Arc::clone(&mic),
            Arc::new(AmplitudeClassifier::default()),
            Arc::clone(&clock_dyn),
            RecorderSettings::default(),
        );

        let store: Arc<dyn PersistenceStore> = Arc::new(NullStore);
        let transcriber = Arc::new(ScriptedTranscriber::new(lines));
        let model = Arc::new(CountingModel::default());
        let handler = Arc::new(AssistantTurnHandler::new(
            Arc::clone(&store),
            Some(Arc::clone(&model) as Arc<dyn LanguageModel>),
            "You are a test assistant.".to_string(),
            TurnSettings::default(),
        ));
        let synthesizer = Arc::new(RecordingSynthesizer::new(dir.path()));
        let player = Arc::new(OverlapPlayer::new(Duration::from_millis(20)));
        let speech = SpeechOutput::new(
            Arc::clone(&mic),
            Arc::clone(&synthesizer) as Arc<dyn Synthesizer>,
            Arc::clone(&player) as Arc<dyn Player>,
            None,
            fast_speech(),
        );
        let hotword = Arc::new(HotwordMatcher::new(HotwordSettings::default(), store));
        let shutdown = CancellationToken::new();

        let conversation = Conversation::new(
            Collaborators {
                mic: Arc::clone(&mic),
                recorder,
                transcriber: Arc::clone(&transcriber) as Arc<dyn Transcriber>,
                handler,
                speech: Arc::clone(&speech),
                hotword: Some(hotword),
                clock: clock_dyn,
            },
            settings,
            History::in_memory(10),
            TranscriptLog::disabled(),
            shutdown.clone(),
        );

        Self {
            clock,
            input,
            mic,
            transcriber,
            model,
            synthesizer,
            player,
            speech,
            shutdown,
            conversation,
            _dir: dir,
        }
    }

    /// Queue one spoken utterance followed by enough silence to end it
    pub fn queue_utterance(&self) {
        self.input
            .push_speech(Duration::from_secs(1))
            .push_silence(Duration::from_secs(3));
    }
}
