//! Text-to-speech (TTS) processing

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::Synthesizer;
use crate::{Error, Result};

/// TTS provider backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// `OpenAI` speech endpoint
    #[default]
    OpenAI,
    /// ElevenLabs text-to-speech
    ElevenLabs,
}

/// Synthesizes speech through a cloud API into MP3 files
pub struct CloudSynthesizer {
    client: reqwest::blocking::Client,
    api_key: SecretString,
    speed: f32,
    model: String,
    provider: TtsProvider,
    audio_dir: PathBuf,
}

impl std::fmt::Debug for CloudSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSynthesizer")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("audio_dir", &self.audio_dir)
            .finish_non_exhaustive()
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))
}

impl CloudSynthesizer {
    /// Create a synthesizer using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing or the audio directory cannot
    /// be created
    pub fn new_openai(
        api_key: SecretString,
        model: String,
        speed: f32,
        audio_dir: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }
        std::fs::create_dir_all(audio_dir)?;

        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            speed,
            model,
            provider: TtsProvider::OpenAI,
            audio_dir: audio_dir.to_path_buf(),
        })
    }

    /// Create a synthesizer using ElevenLabs
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing or the audio directory cannot
    /// be created
    pub fn new_elevenlabs(
        api_key: SecretString,
        model: String,
        audio_dir: &Path,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }
        std::fs::create_dir_all(audio_dir)?;

        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            // ElevenLabs doesn't use speed in the same way
            speed: 1.0,
            model,
            provider: TtsProvider::ElevenLabs,
            audio_dir: audio_dir.to_path_buf(),
        })
    }

    /// Path for a new synthesized clip
    fn next_path(&self) -> PathBuf {
        self.audio_dir
            .join(format!("tts_{}.mp3", uuid::Uuid::new_v4().simple()))
    }

    /// Synthesize using `OpenAI` TTS
    fn synthesize_openai(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        Ok(response.bytes()?.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    fn synthesize_elevenlabs(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{voice}");

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(&request)
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response.bytes()?.to_vec())
    }
}

impl Synthesizer for CloudSynthesizer {
    fn synthesize(&self, text: &str, voice: &str) -> Result<PathBuf> {
        let audio = match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text, voice)?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text, voice)?,
        };
        if audio.is_empty() {
            return Err(Error::Tts("provider returned no audio".to_string()));
        }

        let path = self.next_path();
        std::fs::write(&path, &audio)?;
        tracing::debug!(
            provider = ?self.provider,
            bytes = audio.len(),
            path = %path.display(),
            "speech synthesized"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CloudSynthesizer::new_openai(
            SecretString::from(String::new()),
            "tts-1".to_string(),
            1.0,
            dir.path(),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_clip_paths_are_unique_and_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let tts = CloudSynthesizer::new_elevenlabs(
            SecretString::from("key".to_string()),
            "eleven_monolingual_v1".to_string(),
            dir.path(),
            Duration::from_secs(5),
        )
        .unwrap();
        let a = tts.next_path();
        let b = tts.next_path();
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tts_") && name.ends_with(".mp3"));
    }
}
