//! Assistant - wires configuration into a running conversation
//!
//! Builds the store, the shared microphone, speech output, the barge-in
//! listener and the turn handler, then hands them to [`Conversation`].

use std::sync::Arc;
use std::time::Duration;

use crate::audio::{
    Clock, CpalInput, InputDevice, MicStreamManager, RecordingSession, SyntheticInput, SystemClock,
    select_classifier,
};
use crate::cancel::CancellationToken;
use crate::conversation::{Collaborators, Conversation, History, TranscriptLog};
use crate::hotword::HotwordMatcher;
use crate::startup::{self, CheckReport};
use crate::store::{NullStore, PersistenceStore, SqliteStore};
use crate::turn::{AssistantTurnHandler, ChatCompletionsModel, LanguageModel};
use crate::voice::tts::TtsProvider;
use crate::voice::{
    CleanupQueue, CloudSynthesizer, CpalPlayer, InterruptListener, NullPlayer, Player,
    SilentSynthesizer, SpeechOutput, Synthesizer, Transcriber, UnavailableTranscriber,
    WhisperTranscriber,
};
use crate::{Config, Error, Result};

/// Where audio comes from and goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Real microphone and speakers
    Hardware,
    /// Synthetic silence in, nothing out
    Simulated,
}

/// Length of clips produced in simulated mode
const SIMULATED_CLIP: Duration = Duration::from_millis(300);

/// Open the configured store, degrading to [`NullStore`]
#[must_use]
pub fn open_store(config: &Config) -> Arc<dyn PersistenceStore> {
    if !config.store.enabled {
        tracing::info!("store disabled");
        return Arc::new(NullStore);
    }
    let path = config.store_path();
    match SqliteStore::open(&path) {
        Ok(store) => {
            tracing::info!(path = %path.display(), "store opened");
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "could not open store, nothing will be remembered");
            Arc::new(NullStore)
        }
    }
}

/// Build the synthesizer for the configured provider
///
/// # Errors
///
/// Returns error if the provider's API key is missing
pub fn build_synthesizer(config: &Config) -> Result<Arc<dyn Synthesizer>> {
    let dir = config.tts_dir();
    let synthesizer = match config.tts.provider {
        TtsProvider::OpenAI => {
            let key = config
                .openai_key()
                .ok_or_else(|| Error::Config("OPENAI_API_KEY is required for TTS".to_string()))?;
            CloudSynthesizer::new_openai(
                key,
                config.tts.model.clone(),
                config.tts.speed,
                &dir,
                config.tts.timeout,
            )?
        }
        TtsProvider::ElevenLabs => {
            let key = config.elevenlabs_key().ok_or_else(|| {
                Error::Config("ELEVENLABS_API_KEY is required for TTS".to_string())
            })?;
            CloudSynthesizer::new_elevenlabs(key, config.tts.model.clone(), &dir, config.tts.timeout)?
        }
    };
    Ok(Arc::new(synthesizer))
}

fn build_transcriber(config: &Config, mode: Mode) -> Result<Arc<dyn Transcriber>> {
    match config.openai_key() {
        Some(key) => Ok(Arc::new(WhisperTranscriber::new(
            key,
            config.stt.model.clone(),
            config.stt.endpoint.clone(),
            config.stt.language.clone(),
            config.stt.timeout,
        )?)),
        None if mode == Mode::Simulated => Ok(Arc::new(UnavailableTranscriber)),
        None => Err(Error::Config(
            "OPENAI_API_KEY is required for transcription".to_string(),
        )),
    }
}

fn build_model(config: &Config) -> Option<Arc<dyn LanguageModel>> {
    let Some(key) = config.llm_key() else {
        tracing::warn!("no language model key; only local answers are available");
        return None;
    };
    match ChatCompletionsModel::new(key, config.llm.clone()) {
        Ok(model) => {
            tracing::info!(model = %config.llm.model, endpoint = %config.llm.endpoint, "language model ready");
            Some(Arc::new(model))
        }
        Err(e) => {
            tracing::warn!(error = %e, "language model unavailable");
            None
        }
    }
}

/// A fully wired assistant
pub struct Assistant {
    conversation: Conversation,
    mic: Arc<MicStreamManager>,
    cleanup: Arc<CleanupQueue>,
    report: CheckReport,
}

impl std::fmt::Debug for Assistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assistant")
            .field("conversation", &self.conversation)
            .finish_non_exhaustive()
    }
}

impl Assistant {
    /// Build everything from `config`
    ///
    /// Must be called outside an async runtime: the HTTP clients are
    /// blocking.
    ///
    /// # Errors
    ///
    /// Returns error for fatal startup problems: a missing transcription
    /// or synthesis key in hardware mode, or a thread that cannot spawn
    pub fn build(config: &Config, mode: Mode, shutdown: CancellationToken) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let store = open_store(config);

        let device: Arc<dyn InputDevice> = match mode {
            Mode::Hardware => Arc::new(CpalInput::new()),
            Mode::Simulated => Arc::new(SyntheticInput::new(Arc::clone(&clock))),
        };
        let mic = MicStreamManager::new(device, config.mic_settings());
        if let Err(e) = mic.initialize_device() {
            tracing::error!(error = %e, "audio input unavailable, running degraded");
        } else if mic.create_stream().is_none() {
            tracing::warn!("no input stream; recordings will fail until the device returns");
        }

        let transcriber = build_transcriber(config, mode)?;
        let (synthesizer, player): (Arc<dyn Synthesizer>, Arc<dyn Player>) = match mode {
            Mode::Hardware => (
                build_synthesizer(config)?,
                Arc::new(CpalPlayer::new(config.audio.playback_slack, config.watchdog)),
            ),
            Mode::Simulated => (
                Arc::new(SilentSynthesizer::new(&config.tts_dir(), SIMULATED_CLIP)?),
                Arc::new(NullPlayer::new(SIMULATED_CLIP)),
            ),
        };

        let cleanup = Arc::new(CleanupQueue::start(config.cleanup_settings())?);
        let speech = SpeechOutput::new(
            Arc::clone(&mic),
            synthesizer,
            player,
            Some(Arc::clone(&cleanup)),
            config.speech.clone(),
        );

        let hotword = Arc::new(HotwordMatcher::new(
            config.hotword.clone(),
            Arc::clone(&store),
        ));
        let handler = Arc::new(AssistantTurnHandler::new(
            Arc::clone(&store),
            build_model(config),
            config.llm.system_prompt.clone(),
            config.turn.clone(),
        ));

        let input_check = match mode {
            Mode::Hardware => startup::check_input(&mic),
            Mode::Simulated => startup::Check {
                name: "input",
                status: startup::CheckStatus::Ok,
                detail: "synthetic silence".to_string(),
            },
        };
        let report = startup::run_checks(config, Some(input_check), &hotword, store.as_ref());

        let recorder = RecordingSession::new(
            Arc::clone(&mic),
            select_classifier(config.audio.classifier),
            Arc::clone(&clock),
            config.recorder_settings(),
        );
        let history = History::load(&config.history_path(), config.conversation.context_turns);
        let transcript = TranscriptLog::new(config.log_dir.clone());

        let mut conversation = Conversation::new(
            Collaborators {
                mic: Arc::clone(&mic),
                recorder,
                transcriber,
                handler,
                speech: Arc::clone(&speech),
                hotword: Some(hotword),
                clock,
            },
            config.conversation.clone(),
            history,
            transcript,
            shutdown,
        );

        if config.interrupt.enabled && config.speech.barge_in {
            let listener = InterruptListener::start(Arc::clone(&mic), speech, config.interrupt)?;
            conversation = conversation.with_interrupt_listener(listener);
        }

        Ok(Self {
            conversation,
            mic,
            cleanup,
            report,
        })
    }

    /// Startup diagnostics gathered during [`Assistant::build`]
    #[must_use]
    pub const fn report(&self) -> &CheckReport {
        &self.report
    }

    /// Run until an exit word or shutdown
    pub fn run(mut self) {
        self.report.log();
        self.conversation.run();
        self.cleanup.shutdown();
        self.mic.shutdown();
        tracing::info!("assistant stopped");
    }
}
