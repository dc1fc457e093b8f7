//! Conversation memory on disk
//!
//! [`History`] keeps the last few exchanges in `context.json` so a restart
//! picks up where the previous run left off. [`TranscriptLog`] appends every
//! turn to a daily `transcript_YYYY-MM-DD.jsonl` file.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat};
use serde::Serialize;

use crate::Result;
use crate::text::{LOG_MAX_CHARS, sanitize_for_log};
use crate::turn::{ChatMessage, ChatRole};

/// Rolling window of recent messages
#[derive(Debug)]
pub struct History {
    path: Option<PathBuf>,
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
}

impl History {
    /// In-memory history holding `turns` exchanges
    #[must_use]
    pub fn in_memory(turns: usize) -> Self {
        Self {
            path: None,
            messages: VecDeque::new(),
            max_messages: turns.saturating_mul(2),
        }
    }

    /// Load history from `path`
    ///
    /// A missing or unreadable file starts an empty history.
    #[must_use]
    pub fn load(path: &Path, turns: usize) -> Self {
        let mut history = Self::in_memory(turns);
        history.path = Some(path.to_path_buf());

        let stored: Vec<ChatMessage> = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt conversation history");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read conversation history");
                Vec::new()
            }
        };

        history.messages.extend(
            stored
                .into_iter()
                .filter(|m| m.role != ChatRole::System && !m.content.trim().is_empty()),
        );
        history.trim();
        tracing::debug!(messages = history.messages.len(), "conversation history loaded");
        history
    }

    /// Messages oldest first
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    /// Number of stored messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Record one exchange
    pub fn push_exchange(&mut self, user: &str, assistant: &str) {
        self.messages.push_back(ChatMessage::user(user));
        self.messages.push_back(ChatMessage::assistant(assistant));
        self.trim();
    }

    fn trim(&mut self) {
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }

    /// Write the history to its file, if it has one
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.messages)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct TranscriptLine<'a> {
    ts: String,
    role: ChatRole,
    text: &'a str,
}

/// Daily JSONL transcript writer
#[derive(Debug, Clone, Default)]
pub struct TranscriptLog {
    dir: Option<PathBuf>,
}

impl TranscriptLog {
    /// Log under `dir`
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir: Some(dir) }
    }

    /// A log that writes nothing
    #[must_use]
    pub const fn disabled() -> Self {
        Self { dir: None }
    }

    /// File for today's transcript
    #[must_use]
    pub fn current_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| {
            dir.join(format!(
                "transcript_{}.jsonl",
                Local::now().format("%Y-%m-%d")
            ))
        })
    }

    /// Append one line; failures are logged, never returned
    pub fn append(&self, role: ChatRole, text: &str) {
        let Some(path) = self.current_path() else {
            return;
        };
        if let Err(e) = Self::write_line(&path, role, text) {
            tracing::warn!(path = %path.display(), error = %e, "could not write transcript");
        }
    }

    fn write_line(path: &Path, role: ChatRole, text: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let clean = sanitize_for_log(text, LOG_MAX_CHARS);
        let line = serde_json::to_string(&TranscriptLine {
            ts: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            role,
            text: &clean,
        })?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_last_turns() {
        let mut history = History::in_memory(2);
        for i in 0..5 {
            history.push_exchange(&format!("q{i}"), &format!("a{i}"));
        }
        let messages = history.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ChatMessage::user("q3"));
        assert_eq!(messages[3], ChatMessage::assistant("a4"));
    }

    #[test]
    fn test_history_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");

        let mut history = History::load(&path, 10);
        assert!(history.is_empty());
        history.push_exchange("what's my name", "Your name is Asha.");
        history.save().unwrap();

        let reloaded = History::load(&path, 10);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.messages()[1].content, "Your name is Asha.");
    }

    #[test]
    fn test_history_reload_respects_smaller_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        let mut history = History::load(&path, 10);
        for i in 0..6 {
            history.push_exchange(&format!("q{i}"), &format!("a{i}"));
        }
        history.save().unwrap();

        let reloaded = History::load(&path, 1);
        assert_eq!(reloaded.messages(), vec![ChatMessage::user("q5"), ChatMessage::assistant("a5")]);
    }

    #[test]
    fn test_corrupt_history_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(History::load(&path, 10).is_empty());
    }

    #[test]
    fn test_transcript_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path().to_path_buf());
        log.append(ChatRole::User, "hello");
        log.append(ChatRole::Assistant, "Hey! What can I do for you right now?");

        let path = log.current_path().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["role"], "user");
        assert_eq!(lines[1]["text"], "Hey! What can I do for you right now?");
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn test_disabled_transcript_writes_nothing() {
        let log = TranscriptLog::disabled();
        assert!(log.current_path().is_none());
        log.append(ChatRole::User, "ignored");
    }
}
