//! Speech-to-text (STT) processing

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use super::Transcriber;
use crate::audio::RecordedAudio;
use crate::text::clean_stt_text;
use crate::{Error, Result};

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes recordings through an `OpenAI`-compatible Whisper endpoint
pub struct WhisperTranscriber {
    client: reqwest::blocking::Client,
    api_key: SecretString,
    model: String,
    endpoint: String,
    language: Option<String>,
}

impl std::fmt::Debug for WhisperTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTranscriber")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl WhisperTranscriber {
    /// Default `OpenAI` transcription endpoint
    pub const OPENAI_ENDPOINT: &'static str = "https://api.openai.com/v1/audio/transcriptions";

    /// Create a transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        api_key: SecretString,
        model: String,
        endpoint: Option<String>,
        language: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model,
            endpoint: endpoint.unwrap_or_else(|| Self::OPENAI_ENDPOINT.to_string()),
            language,
        })
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: RecordedAudio) -> Result<String> {
        let bytes = audio.read_bytes()?;
        tracing::debug!(
            audio_bytes = bytes.len(),
            duration_ms = audio.duration().as_millis(),
            "starting Whisper transcription"
        );

        let mut form = reqwest::blocking::multipart::Form::new()
            .part(
                "file",
                reqwest::blocking::multipart::Part::bytes(bytes)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .multipart(form)
            .send()
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        // recording is no longer needed once the upload is done
        drop(audio);

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        let transcript = clean_stt_text(&result.text);
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}
