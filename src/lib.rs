//! Parley - a turn-taking voice assistant core
//!
//! This library provides the pieces of a spoken conversation loop:
//! - Microphone ownership, the mic gate and endpointed recording
//! - Single-flight speech output with barge-in
//! - Turn handling (local answers, memory, language model fallback)
//! - The conversation state machine that ties them together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Conversation                       │
//! │  Idle → Listening → Processing → Speaking → ...      │
//! └───────┬──────────────┬──────────────────┬───────────┘
//!         │              │                  │
//! ┌───────▼───────┐ ┌────▼──────────┐ ┌─────▼───────────┐
//! │ audio         │ │ turn          │ │ voice           │
//! │ mic, gate,    │ │ intents,      │ │ STT, TTS,       │
//! │ recorder      │ │ memory, LLM   │ │ speech, barge-in│
//! └───────────────┘ └───────────────┘ └─────────────────┘
//! ```

pub mod assistant;
pub mod audio;
pub mod cancel;
pub mod config;
pub mod conversation;
pub mod error;
pub mod hotword;
pub mod startup;
pub mod store;
pub mod text;
pub mod turn;
pub mod voice;

pub use assistant::{Assistant, Mode};
pub use cancel::{CancelScope, CancellationToken};
pub use config::{Config, LoadOptions};
pub use conversation::{Conversation, ConversationSettings, ConversationState, TurnOutcome};
pub use error::{Error, Result};
pub use store::{DbConn, DbPool, PersistenceStore};
