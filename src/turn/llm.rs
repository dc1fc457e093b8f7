//! Chat completion client for the model fallback

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions for the model
    System,
    /// The person talking to the assistant
    User,
    /// The assistant
    Assistant,
}

/// One message of conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who said it
    pub role: ChatRole,
    /// What was said
    pub content: String,
}

impl ChatMessage {
    /// Message from the user
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Message from the assistant
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Text generation backend
pub trait LanguageModel: Send + Sync {
    /// Produce a reply to `user` given the prior conversation
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unreachable or replies with nothing
    fn complete(&self, system: &str, history: &[ChatMessage], user: &str) -> Result<String>;
}

/// Settings for [`ChatCompletionsModel`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Chat completions URL
    pub endpoint: String,
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Reply length cap
    pub max_tokens: u32,
    /// System prompt
    pub system_prompt: String,
    /// Request timeout
    #[serde(with = "crate::config::duration_secs")]
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: ChatCompletionsModel::GROQ_ENDPOINT.to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.3,
            max_tokens: 512,
            system_prompt: "You are a concise, helpful voice assistant. Keep answers short enough to say out loud.".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: ChatRole,
    content: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// `OpenAI`-compatible chat completions over blocking HTTP
pub struct ChatCompletionsModel {
    client: reqwest::blocking::Client,
    api_key: SecretString,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsModel")
            .field("endpoint", &self.settings.endpoint)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsModel {
    /// Groq's `OpenAI`-compatible endpoint
    pub const GROQ_ENDPOINT: &'static str = "https://api.groq.com/openai/v1/chat/completions";

    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: SecretString, settings: LlmSettings) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("API key required for the language model".to_string()));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            settings,
        })
    }

    fn request<'a>(
        &'a self,
        system: &'a str,
        history: &'a [ChatMessage],
        user: &'a str,
    ) -> CompletionRequest<'a> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(RequestMessage {
            role: ChatRole::System,
            content: system,
        });
        messages.extend(history.iter().map(|m| RequestMessage {
            role: m.role,
            content: &m.content,
        }));
        messages.push(RequestMessage {
            role: ChatRole::User,
            content: user,
        });

        CompletionRequest {
            model: &self.settings.model,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            messages,
        }
    }
}

impl LanguageModel for ChatCompletionsModel {
    fn complete(&self, system: &str, history: &[ChatMessage], user: &str) -> Result<String> {
        let body = self.request(system, history, user);
        tracing::debug!(
            model = %self.settings.model,
            messages = body.messages.len(),
            "sending chat completion"
        );

        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .map_err(|e| {
                tracing::warn!(error = %e, "chat completion request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            tracing::warn!(status = %status, body = %text, "chat completion error");
            return Err(Error::Llm(format!("API error {status}: {text}")));
        }

        let parsed: CompletionResponse = response.json()?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Llm("empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_config_error() {
        let result = ChatCompletionsModel::new(SecretString::from(String::new()), LlmSettings::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_request_orders_messages() {
        let model =
            ChatCompletionsModel::new(SecretString::from("key".to_string()), LlmSettings::default())
                .unwrap();
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let body = serde_json::to_value(model.request("be brief", &history, "and now?")).unwrap();

        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(body["model"], "llama-3.1-8b-instant");
    }

    #[test]
    fn test_history_round_trips_as_json() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let message: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message, ChatMessage::assistant("ok"));
    }
}
