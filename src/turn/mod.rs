//! Turn handling: from a transcript to a reply
//!
//! [`AssistantTurnHandler`] answers what it can locally (time, stored facts,
//! memory commands, greetings, moods) and only then asks the language model.

pub mod intent;
pub mod llm;
pub mod memory;

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::Result;
use crate::store::{FACTS, META, PersistenceStore};

pub use intent::{Intent, classify};
pub use llm::{ChatCompletionsModel, ChatMessage, ChatRole, LanguageModel, LlmSettings};
pub use memory::{MemoryCapture, Reminder};

/// Reply used when the model gives nothing back
pub const NO_RESPONSE: &str = "Sorry, I couldn't get a response.";

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// Time, date or stored-fact lookup
    QuickAnswer,
    /// Memory command acknowledgement
    Memory,
    /// Canned greeting
    Greeting,
    /// Canned mood response
    Empathy,
    /// Language model
    Model,
    /// Model unavailable or failed
    Fallback,
}

/// Reply to one user turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    /// Text to speak
    pub text: String,
    /// Which path produced it
    pub source: ReplySource,
}

impl TurnReply {
    fn new(text: impl Into<String>, source: ReplySource) -> Self {
        Self {
            text: text.into(),
            source,
        }
    }
}

/// Turns a transcript into a reply
///
/// Implementations may block; the conversation loop runs them on a worker
/// thread under a deadline.
pub trait TurnHandler: Send + Sync {
    /// Handle one user turn
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator fails in a way the handler cannot
    /// absorb
    fn handle(&self, text: &str, history: &[ChatMessage]) -> Result<TurnReply>;
}

/// Turn handler settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// Timezone used until the user sets one
    pub default_timezone: String,
    /// Answer greetings without the model
    pub canned_greetings: bool,
    /// Answer mood statements without the model
    pub empathy: bool,
    /// Longest utterance (in words) still treated as a pure greeting
    pub greeting_max_words: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            default_timezone: "Asia/Kolkata".to_string(),
            canned_greetings: true,
            empathy: true,
            greeting_max_words: 5,
        }
    }
}

static TIME_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(what(?:'s|\s+is)\s+the\s+(?:time|date)|what\s+time\s+is\s+it|what\s+day\s+is\s+(?:it|today)|today'?s\s+date|current\s+time)\b",
    )
    .expect("valid regex")
});

static FACT_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:what|who)(?:'s|\s+is|\s+are)\s+my\s+(.+?)[\s?.!]*$").expect("valid regex")
});

/// UTC offset for a zone name, without daylight saving
#[must_use]
pub fn zone_offset(zone: &str) -> Option<FixedOffset> {
    let seconds = match zone {
        "UTC" | "Etc/GMT" | "Europe/London" | "Europe/Dublin" => 0,
        "Asia/Kolkata" | "Asia/Calcutta" => 5 * 3600 + 1800,
        "Asia/Dubai" => 4 * 3600,
        "Asia/Singapore" | "Asia/Shanghai" => 8 * 3600,
        "Asia/Tokyo" => 9 * 3600,
        "Australia/Sydney" => 10 * 3600,
        "Europe/Berlin" | "Europe/Paris" | "Europe/Madrid" => 3600,
        "America/New_York" => -5 * 3600,
        "America/Chicago" => -6 * 3600,
        "America/Denver" => -7 * 3600,
        "America/Los_Angeles" => -8 * 3600,
        _ => return None,
    };
    FixedOffset::east_opt(seconds)
}

/// The default turn handler
pub struct AssistantTurnHandler {
    store: Arc<dyn PersistenceStore>,
    model: Option<Arc<dyn LanguageModel>>,
    system_prompt: String,
    settings: TurnSettings,
    now: fn() -> DateTime<Utc>,
}

impl std::fmt::Debug for AssistantTurnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistantTurnHandler")
            .field("has_model", &self.model.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AssistantTurnHandler {
    /// Create a handler; without a model, unmatched turns get a fallback line
    #[must_use]
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        model: Option<Arc<dyn LanguageModel>>,
        system_prompt: String,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            model,
            system_prompt,
            settings,
            now: Utc::now,
        }
    }

    /// Replace the wall clock (for tests)
    #[must_use]
    pub fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Stored timezone, falling back to the configured default
    fn timezone(&self) -> String {
        match self.store.get(META, memory::TIMEZONE_KEY) {
            Ok(Some(tz)) => tz,
            Ok(None) => self.settings.default_timezone.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read timezone");
                self.settings.default_timezone.clone()
            }
        }
    }

    /// Current local time and the label of the zone actually used
    fn local_now(&self) -> (DateTime<FixedOffset>, String) {
        let zone = self.timezone();
        let now = (self.now)();
        match zone_offset(&zone) {
            Some(offset) => (now.with_timezone(&offset), zone),
            None => {
                tracing::debug!(zone, "unknown timezone, using UTC");
                (now.fixed_offset(), "UTC".to_string())
            }
        }
    }

    fn quick_answer(&self, text: &str) -> Option<String> {
        if TIME_QUESTION.is_match(text) {
            let (now, zone) = self.local_now();
            return Some(format!(
                "The current time is {} ({zone}).",
                now.format("%A, %d %B %Y, %I:%M %p")
            ));
        }

        let caps = FACT_QUESTION.captures(text)?;
        let name = caps[1].trim().to_lowercase();
        match self.store.get(FACTS, &memory::fact_key(&name)) {
            Ok(Some(value)) => Some(format!("Your {name} is {value}.")),
            Ok(None) => Some(format!(
                "I don't have your {name} yet. Say 'remember that my {name} is ...' to save it."
            )),
            Err(e) => {
                tracing::warn!(error = %e, "fact lookup failed");
                None
            }
        }
    }

    fn canned_reply(&self, text: &str) -> Option<TurnReply> {
        let intent = classify(text);
        if intent == Intent::Greeting
            && self.settings.canned_greetings
            && text.split_whitespace().count() <= self.settings.greeting_max_words
        {
            return intent::greeting_reply(text).map(|r| TurnReply::new(r, ReplySource::Greeting));
        }
        if self.settings.empathy {
            return intent::empathy_reply(intent).map(|r| TurnReply::new(r, ReplySource::Empathy));
        }
        None
    }
}

impl TurnHandler for AssistantTurnHandler {
    fn handle(&self, text: &str, history: &[ChatMessage]) -> Result<TurnReply> {
        if let Some(answer) = self.quick_answer(text) {
            return Ok(TurnReply::new(answer, ReplySource::QuickAnswer));
        }

        let (local, _) = self.local_now();
        let captured = memory::capture(text, local.naive_local());
        if !captured.is_empty() {
            let acks = memory::apply(self.store.as_ref(), &captured)?;
            return Ok(TurnReply::new(
                format!("Got it! I’ll remember: {}.", acks.join("; ")),
                ReplySource::Memory,
            ));
        }

        if let Some(reply) = self.canned_reply(text) {
            return Ok(reply);
        }

        let Some(model) = &self.model else {
            return Ok(TurnReply::new(NO_RESPONSE, ReplySource::Fallback));
        };
        match model.complete(&self.system_prompt, history, text) {
            Ok(reply) => Ok(TurnReply::new(reply, ReplySource::Model)),
            Err(e) if e.is_collaborator_failure() => {
                tracing::warn!(error = %e, "language model unavailable");
                Ok(TurnReply::new(NO_RESPONSE, ReplySource::Fallback))
            }
            Err(e) => Err(e),
        }
    }
}
