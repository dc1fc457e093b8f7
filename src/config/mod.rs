//! Configuration management for parley
//!
//! Values are resolved with precedence env > TOML file > defaults. Invalid
//! values never abort startup; they fall back to defaults with a warning.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::audio::classifier::ClassifierKind;
use crate::audio::mic::MicSettings;
use crate::audio::{EndpointPolicy, RecorderSettings, SAMPLE_RATE, WatchdogPolicy};
use crate::conversation::ConversationSettings;
use crate::hotword::HotwordSettings;
use crate::turn::{LlmSettings, TurnSettings};
use crate::voice::cleanup::CleanupSettings;
use crate::voice::tts::TtsProvider;
use crate::voice::{InterruptSettings, SpeechSettings};

pub use file::{ParleyConfigFile, config_file_path, load_config_file};

/// Durations written as (fractional) seconds in TOML
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize seconds as an `f64`
    ///
    /// # Errors
    ///
    /// Returns error for negative, non-finite or non-numeric values
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!("invalid duration in seconds: {secs}"))
        })
    }
}

/// Parley configuration
#[derive(Debug)]
pub struct Config {
    /// Data directory (store, history, recordings)
    pub data_dir: PathBuf,

    /// Log directory (daily transcripts)
    pub log_dir: PathBuf,

    /// File the config was read from, if any
    pub source: Option<PathBuf>,

    /// Capture and playback
    pub audio: AudioConfig,

    /// Trailing-silence policy
    pub endpoint: EndpointPolicy,

    /// Device retry policy
    pub watchdog: WatchdogPolicy,

    /// Barge-in listener
    pub interrupt: InterruptSettings,

    /// Speech output
    pub speech: SpeechSettings,

    /// Conversation loop
    pub conversation: ConversationSettings,

    /// Wake word
    pub hotword: HotwordSettings,

    /// Local answers
    pub turn: TurnSettings,

    /// Language model
    pub llm: LlmSettings,

    /// Transcription
    pub stt: SttConfig,

    /// Synthesis
    pub tts: TtsConfig,

    /// Persistence
    pub store: StoreConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Audio device configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name; host default when unset
    pub device_id: Option<String>,

    /// Capture rate delivered to the recorder
    pub sample_rate: u32,

    /// Speech classifier
    pub classifier: ClassifierKind,

    /// Audio read per recorder iteration
    #[serde(with = "duration_secs")]
    pub chunk: Duration,

    /// Longest single recording
    #[serde(with = "duration_secs")]
    pub max_total: Duration,

    /// Utterances shorter than this get the reduced endpoint tail
    #[serde(with = "duration_secs")]
    pub short_utterance: Duration,

    /// Upper bound on one stream read
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    /// Keep recordings instead of deleting them after transcription
    pub keep_recordings: bool,

    /// Where kept recordings go; `<data_dir>/recordings` when unset
    pub recordings_dir: Option<PathBuf>,

    /// Minimum spacing between capture stream resets
    #[serde(with = "duration_secs")]
    pub reset_interval: Duration,

    /// Added to clip length to form the playback hard timeout
    #[serde(with = "duration_secs")]
    pub playback_slack: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: SAMPLE_RATE,
            classifier: ClassifierKind::default(),
            chunk: Duration::from_millis(500),
            max_total: Duration::from_secs(30),
            short_utterance: Duration::from_millis(1500),
            read_timeout: Duration::from_secs(2),
            keep_recordings: false,
            recordings_dir: None,
            reset_interval: Duration::from_secs(1),
            playback_slack: Duration::from_secs(2),
        }
    }
}

/// Speech-to-text configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Model name
    pub model: String,

    /// Transcription URL; `OpenAI` when unset
    pub endpoint: Option<String>,

    /// Language hint (ISO 639-1)
    pub language: Option<String>,

    /// Request timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            endpoint: None,
            language: Some("en".to_string()),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Backend
    pub provider: TtsProvider,

    /// Model name
    pub model: String,

    /// Speed multiplier (0.25 to 4.0, `OpenAI` only)
    pub speed: f32,

    /// Directory for synthesized clips; system temp dir when unset
    pub audio_dir: Option<PathBuf>,

    /// Request timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Age after which leftover clips are swept
    #[serde(with = "duration_secs")]
    pub retention: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::default(),
            model: "tts-1".to_string(),
            speed: 1.0,
            audio_dir: None,
            timeout: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Use `SQLite`; when off nothing is remembered across runs
    pub enabled: bool,

    /// Database path; `<data_dir>/parley.db` when unset
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper and TTS)
    pub openai: Option<SecretString>,

    /// Groq API key (language model)
    pub groq: Option<SecretString>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<SecretString>,
}

/// Options for [`Config::load`]
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file (`--config` / `PARLEY_CONFIG`)
    pub config_path: Option<PathBuf>,

    /// Data directory override
    pub data_dir: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".parley"),
        |d| d.data_local_dir().join("parley"),
    )
}

fn copy_key(key: Option<&SecretString>) -> Option<SecretString> {
    key.map(|k| SecretString::from(k.expose_secret().to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    raw.trim().parse().map_or_else(
        |_| {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment value");
            None
        },
        Some,
    )
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// Never fails: a missing or broken file yields defaults.
    #[must_use]
    pub fn load(options: &LoadOptions) -> Self {
        let explicit = options
            .config_path
            .clone()
            .or_else(|| non_empty(std::env::var("PARLEY_CONFIG").ok()).map(PathBuf::from));
        let source = explicit.clone().or_else(config_file_path);
        let fc = load_config_file(explicit.as_deref());

        let mut config = Self::from_sources(fc, |name| std::env::var(name).ok());
        if let Some(dir) = &options.data_dir {
            config.set_data_dir(dir.clone());
        }
        config.source = source.filter(|p| p.exists());
        config
    }

    /// Assemble configuration from a parsed file and an environment lookup
    #[must_use]
    pub fn from_sources(fc: ParleyConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let env = |name: &str| non_empty(env(name));

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            groq: env("GROQ_API_KEY")
                .or(fc.api_keys.groq)
                .map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .map(SecretString::from),
        };

        let data_dir = env("PARLEY_DATA_DIR")
            .map(PathBuf::from)
            .or(fc.data_dir)
            .unwrap_or_else(default_data_dir);
        let log_dir = env("PARLEY_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        let mut audio = fc.audio;
        if let Some(device) = env("PARLEY_INPUT_DEVICE") {
            audio.device_id = Some(device);
        }

        let mut speech = fc.speech;
        if let Some(voice) = env("PARLEY_VOICE") {
            speech.voice = voice;
        }

        let mut hotword = fc.hotword;
        if let Some(word) = env("PARLEY_HOTWORD") {
            hotword.word = word;
        }

        let mut turn = fc.turn;
        if let Some(zone) = env("PARLEY_TIMEZONE") {
            turn.default_timezone = zone;
        }

        let mut llm = fc.llm;
        if let Some(model) = env("PARLEY_LLM_MODEL") {
            llm.model = model;
        }
        if let Some(endpoint) = env("PARLEY_LLM_ENDPOINT") {
            llm.endpoint = endpoint;
        }

        let mut stt = fc.stt;
        if let Some(model) = env("PARLEY_STT_MODEL") {
            stt.model = model;
        }

        let mut tts = fc.tts;
        if let Some(model) = env("PARLEY_TTS_MODEL") {
            tts.model = model;
        }
        if let Some(speed) = parse_env::<f32>("PARLEY_TTS_SPEED", env("PARLEY_TTS_SPEED")) {
            tts.speed = speed;
        }

        let mut store = fc.store;
        if let Some(enabled) = parse_env::<bool>("PARLEY_STORE", env("PARLEY_STORE")) {
            store.enabled = enabled;
        }

        let mut config = Self {
            data_dir,
            log_dir,
            source: None,
            audio,
            endpoint: fc.endpoint,
            watchdog: fc.watchdog,
            interrupt: fc.interrupt,
            speech,
            conversation: fc.conversation,
            hotword,
            turn,
            llm,
            stt,
            tts,
            store,
            api_keys,
        };
        config.sanitize();
        config
    }

    fn set_data_dir(&mut self, dir: PathBuf) {
        if self.log_dir == self.data_dir.join("logs") {
            self.log_dir = dir.join("logs");
        }
        self.data_dir = dir;
    }

    /// Replace out-of-range values with defaults
    fn sanitize(&mut self) {
        let audio = AudioConfig::default();
        if self.audio.sample_rate < 8000 {
            tracing::warn!(value = self.audio.sample_rate, "sample_rate too low, using default");
            self.audio.sample_rate = audio.sample_rate;
        }
        if self.audio.chunk.is_zero() || self.audio.chunk > Duration::from_secs(5) {
            tracing::warn!(value = ?self.audio.chunk, "chunk out of range, using default");
            self.audio.chunk = audio.chunk;
        }
        if self.audio.max_total < self.audio.chunk {
            tracing::warn!(value = ?self.audio.max_total, "max_total shorter than a chunk, using default");
            self.audio.max_total = audio.max_total;
        }
        if self.audio.read_timeout.is_zero() {
            self.audio.read_timeout = audio.read_timeout;
        }

        let endpoint = EndpointPolicy::default();
        if self.endpoint.base_tail_ms == 0 || self.endpoint.max_tail_ms < self.endpoint.base_tail_ms
        {
            tracing::warn!(
                base = self.endpoint.base_tail_ms,
                max = self.endpoint.max_tail_ms,
                "endpoint tails inconsistent, using defaults"
            );
            self.endpoint.base_tail_ms = endpoint.base_tail_ms;
            self.endpoint.max_tail_ms = endpoint.max_tail_ms;
        }

        let interrupt = InterruptSettings::default();
        if self.interrupt.check_interval.is_zero() {
            tracing::warn!("interrupt check_interval must be positive, using default");
            self.interrupt.check_interval = interrupt.check_interval;
        }
        if self.interrupt.consecutive_frames == 0 {
            tracing::warn!("interrupt consecutive_frames must be positive, using default");
            self.interrupt.consecutive_frames = interrupt.consecutive_frames;
        }
        if !(self.interrupt.energy_threshold > 0.0 && self.interrupt.energy_threshold.is_finite()) {
            tracing::warn!(
                value = self.interrupt.energy_threshold,
                "interrupt energy_threshold must be positive, using default"
            );
            self.interrupt.energy_threshold = interrupt.energy_threshold;
        }

        if self.watchdog.max_attempts == 0 {
            tracing::warn!("watchdog max_attempts must be positive, using default");
            self.watchdog.max_attempts = WatchdogPolicy::default().max_attempts;
        }

        if !(0.25..=4.0).contains(&self.tts.speed) {
            tracing::warn!(value = self.tts.speed, "tts speed out of range, using 1.0");
            self.tts.speed = 1.0;
        }

        if !(0.0..=1.0).contains(&self.hotword.fuzzy_threshold) {
            tracing::warn!(
                value = self.hotword.fuzzy_threshold,
                "hotword fuzzy_threshold out of range, using default"
            );
            self.hotword.fuzzy_threshold = HotwordSettings::default().fuzzy_threshold;
        }
        if self.hotword.word.trim().is_empty() {
            self.hotword.word = HotwordSettings::default().word;
        }

        if crate::turn::zone_offset(&self.turn.default_timezone).is_none() {
            tracing::warn!(
                zone = %self.turn.default_timezone,
                "unknown default timezone, answering in UTC"
            );
        }

        if self.conversation.error_threshold == 0 {
            self.conversation.error_threshold = ConversationSettings::default().error_threshold;
        }
    }

    /// Recorder tuning derived from `[audio]` and `[endpoint]`
    #[must_use]
    pub fn recorder_settings(&self) -> RecorderSettings {
        let keep_dir = self.audio.keep_recordings.then(|| {
            self.audio
                .recordings_dir
                .clone()
                .unwrap_or_else(|| self.data_dir.join("recordings"))
        });
        RecorderSettings {
            chunk: self.audio.chunk,
            max_total: self.audio.max_total,
            short_utterance: self.audio.short_utterance,
            read_timeout: self.audio.read_timeout,
            endpoint: self.endpoint,
            keep_dir,
            ..RecorderSettings::default()
        }
    }

    /// Stream manager settings derived from `[audio]` and `[watchdog]`
    #[must_use]
    pub fn mic_settings(&self) -> MicSettings {
        MicSettings {
            device_id: self.audio.device_id.clone(),
            sample_rate: self.audio.sample_rate,
            reset_interval: self.audio.reset_interval,
            watchdog: self.watchdog,
        }
    }

    /// Cleanup thread settings
    #[must_use]
    pub fn cleanup_settings(&self) -> CleanupSettings {
        CleanupSettings {
            sweep_dir: Some(self.tts_dir()),
            retention: self.tts.retention,
            ..CleanupSettings::default()
        }
    }

    /// Directory for synthesized clips
    #[must_use]
    pub fn tts_dir(&self) -> PathBuf {
        self.tts
            .audio_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("parley"))
    }

    /// `SQLite` database path
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("parley.db"))
    }

    /// Saved conversation context
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("context.json")
    }

    /// Key for the language model: `OpenAI`'s when the endpoint is
    /// `OpenAI`, Groq's otherwise
    #[must_use]
    pub fn llm_key(&self) -> Option<SecretString> {
        if self.llm.endpoint.contains("api.openai.com") {
            copy_key(self.api_keys.openai.as_ref())
        } else {
            copy_key(self.api_keys.groq.as_ref())
        }
    }

    /// Key for transcription and `OpenAI` synthesis
    #[must_use]
    pub fn openai_key(&self) -> Option<SecretString> {
        copy_key(self.api_keys.openai.as_ref())
    }

    /// Key for `ElevenLabs` synthesis
    #[must_use]
    pub fn elevenlabs_key(&self) -> Option<SecretString> {
        copy_key(self.api_keys.elevenlabs.as_ref())
    }

    /// Where the configuration came from, for display
    #[must_use]
    pub fn source_display(&self) -> String {
        self.source
            .as_deref()
            .map_or_else(|| "defaults".to_string(), |p: &Path| p.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::from_sources(ParleyConfigFile::default(), no_env);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.max_total, Duration::from_secs(30));
        assert_eq!(config.hotword.word, "parley");
        assert_eq!(config.turn.default_timezone, "Asia/Kolkata");
        assert!(config.store.enabled);
        assert!(config.api_keys.openai.is_none());
        assert_eq!(config.log_dir, config.data_dir.join("logs"));
    }

    #[test]
    fn test_file_values_parse() {
        let fc = file::parse(
            r#"
            data_dir = "/tmp/parley-test"

            [audio]
            chunk = 0.25
            max_total = 12
            classifier = "amplitude"

            [endpoint]
            base_tail_ms = 900

            [speech]
            voice = "nova"
            min_gap = 0.2

            [conversation]
            exit_words = ["bye"]

            [api_keys]
            groq = "from-file"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(fc, no_env);

        assert_eq!(config.data_dir, PathBuf::from("/tmp/parley-test"));
        assert_eq!(config.audio.chunk, Duration::from_millis(250));
        assert_eq!(config.audio.max_total, Duration::from_secs(12));
        assert_eq!(config.audio.classifier, ClassifierKind::Amplitude);
        assert_eq!(config.endpoint.base_tail_ms, 900);
        assert_eq!(config.endpoint.max_tail_ms, 2800);
        assert_eq!(config.speech.voice, "nova");
        assert_eq!(config.speech.min_gap, Duration::from_millis(200));
        assert_eq!(config.conversation.exit_words, vec!["bye".to_string()]);
        assert_eq!(
            config.api_keys.groq.as_ref().map(|k| k.expose_secret().to_string()),
            Some("from-file".to_string())
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = file::parse(
            r#"
            [speech]
            voice = "nova"

            [api_keys]
            openai = "from-file"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(fc, |name| match name {
            "PARLEY_VOICE" => Some("shimmer".to_string()),
            "OPENAI_API_KEY" => Some("from-env".to_string()),
            "GROQ_API_KEY" => Some("   ".to_string()),
            _ => None,
        });

        assert_eq!(config.speech.voice, "shimmer");
        assert_eq!(
            config.api_keys.openai.as_ref().map(|k| k.expose_secret().to_string()),
            Some("from-env".to_string())
        );
        assert!(config.api_keys.groq.is_none());
    }

    #[test]
    fn test_negative_duration_rejected() {
        assert!(file::parse("[audio]\nchunk = -1.0\n").is_err());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let fc = file::parse(
            r"
            [audio]
            sample_rate = 10
            chunk = 0.5
            max_total = 0.1

            [tts]
            speed = 9.0

            [watchdog]
            max_attempts = 0

            [interrupt]
            check_interval = 0.0
            consecutive_frames = 0
            energy_threshold = -0.5
            ",
        )
        .unwrap();
        let config = Config::from_sources(fc, no_env);
        let interrupt = InterruptSettings::default();

        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.max_total, Duration::from_secs(30));
        assert!((config.tts.speed - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.watchdog.max_attempts, 3);
        assert_eq!(config.interrupt.check_interval, interrupt.check_interval);
        assert_eq!(config.interrupt.consecutive_frames, interrupt.consecutive_frames);
        assert!((config.interrupt.energy_threshold - interrupt.energy_threshold).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unparseable_env_ignored() {
        let config = Config::from_sources(ParleyConfigFile::default(), |name| {
            (name == "PARLEY_TTS_SPEED").then(|| "fast".to_string())
        });
        assert!((config.tts.speed - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_derived_paths() {
        let fc = file::parse("data_dir = \"/srv/parley\"\n[audio]\nkeep_recordings = true\n").unwrap();
        let config = Config::from_sources(fc, no_env);

        assert_eq!(config.store_path(), PathBuf::from("/srv/parley/parley.db"));
        assert_eq!(config.history_path(), PathBuf::from("/srv/parley/context.json"));
        assert_eq!(
            config.recorder_settings().keep_dir,
            Some(PathBuf::from("/srv/parley/recordings"))
        );
        assert_eq!(config.mic_settings().sample_rate, 16000);
    }

    #[test]
    fn test_missing_explicit_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_file(Some(&dir.path().join("absent.toml")));
        assert!(fc.data_dir.is_none());
    }

    #[test]
    fn test_broken_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audio\nchunk = ").unwrap();
        let fc = load_config_file(Some(&path));
        assert_eq!(fc.audio, AudioConfig::default());
    }
}
