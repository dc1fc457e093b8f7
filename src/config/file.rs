//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! Every section is optional; missing keys keep their defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{AudioConfig, StoreConfig, SttConfig, TtsConfig};
use crate::audio::{EndpointPolicy, WatchdogPolicy};
use crate::conversation::ConversationSettings;
use crate::hotword::HotwordSettings;
use crate::turn::{LlmSettings, TurnSettings};
use crate::voice::{InterruptSettings, SpeechSettings};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParleyConfigFile {
    /// Data directory override
    pub data_dir: Option<PathBuf>,
    /// Capture and playback devices
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
    /// API keys for external services
    pub api_keys: ApiKeysFileConfig,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub groq: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load a TOML config file
///
/// With no explicit path the standard location is used. Returns
/// `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(explicit: Option<&Path>) -> ParleyConfigFile {
    let Some(path) = explicit.map(Path::to_path_buf).or_else(config_file_path) else {
        return ParleyConfigFile::default();
    };

    if !path.exists() {
        if explicit.is_some() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
        }
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or a value has the wrong type
pub fn parse(content: &str) -> crate::Result<ParleyConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
