//! Conversation history messages.
//!
//! `Message` is a real sum type (not a `Role` tag + "sometimes-meaningful"
//! fields). The `Summary` variant exists so the compactor can replace a run of
//! older messages with one lossy digest while keeping the history shape
//! uniform for everything downstream.

use crate::{NonEmptyString, ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    content: NonEmptyString,
    timestamp: SystemTime,
}

impl SystemMessage {
    #[must_use]
    pub fn new(content: NonEmptyString) -> Self {
        Self {
            content,
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    content: NonEmptyString,
    timestamp: SystemTime,
}

impl UserMessage {
    #[must_use]
    pub fn new(content: NonEmptyString) -> Self {
        Self {
            content,
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    content: NonEmptyString,
    timestamp: SystemTime,
}

impl AssistantMessage {
    #[must_use]
    pub fn new(content: NonEmptyString) -> Self {
        Self {
            content,
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }
}

/// A lossy digest of older conversation turns, produced by compaction.
///
/// `level` counts how many rounds of summarization fed into this digest:
/// level 1 summarizes raw messages, level N+1 summarizes level-N summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    content: NonEmptyString,
    /// Summarization depth, starting at 1.
    level: u8,
    /// How many messages this digest replaced.
    compacted_count: usize,
    timestamp: SystemTime,
}

impl Summary {
    #[must_use]
    pub fn new(content: NonEmptyString, level: u8, compacted_count: usize) -> Self {
        Self {
            content,
            level,
            compacted_count,
            timestamp: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    #[must_use]
    pub const fn compacted_count(&self) -> usize {
        self.compacted_count
    }
}

/// A complete message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    System(SystemMessage),
    /// Compactor-produced digest of older turns.
    Summary(Summary),
    User(UserMessage),
    Assistant(AssistantMessage),
    /// A tool call requested by the assistant.
    ToolUse(ToolCall),
    /// The result of a tool call execution.
    ToolResult(ToolResult),
}

impl Message {
    #[must_use]
    pub fn system(content: NonEmptyString) -> Self {
        Self::System(SystemMessage::new(content))
    }

    #[must_use]
    pub fn user(content: NonEmptyString) -> Self {
        Self::User(UserMessage::new(content))
    }

    pub fn try_user(content: impl Into<String>) -> Result<Self, crate::EmptyStringError> {
        Ok(Self::user(NonEmptyString::new(content)?))
    }

    #[must_use]
    pub fn assistant(content: NonEmptyString) -> Self {
        Self::Assistant(AssistantMessage::new(content))
    }

    pub fn try_assistant(content: impl Into<String>) -> Result<Self, crate::EmptyStringError> {
        Ok(Self::assistant(NonEmptyString::new(content)?))
    }

    #[must_use]
    pub fn summary(content: NonEmptyString, level: u8, compacted_count: usize) -> Self {
        Self::Summary(Summary::new(content, level, compacted_count))
    }

    #[must_use]
    pub fn tool_use(call: ToolCall) -> Self {
        Self::ToolUse(call)
    }

    #[must_use]
    pub fn tool_result(result: ToolResult) -> Self {
        Self::ToolResult(result)
    }

    /// Wire-level role for providers that only understand role strings.
    ///
    /// Summaries travel as system content; tool results go back as user turns.
    #[must_use]
    pub fn role_str(&self) -> &'static str {
        match self {
            Message::System(_) | Message::Summary(_) => "system",
            Message::User(_) | Message::ToolResult(_) => "user",
            Message::Assistant(_) | Message::ToolUse(_) => "assistant",
        }
    }

    /// Text content of the message as sent to a provider.
    #[must_use]
    pub fn content(&self) -> String {
        match self {
            Message::System(m) => m.content().to_string(),
            Message::Summary(m) => m.content().to_string(),
            Message::User(m) => m.content().to_string(),
            Message::Assistant(m) => m.content().to_string(),
            Message::ToolUse(call) => {
                format!("[tool call] {} {}", call.name, call.arguments)
            }
            Message::ToolResult(result) => result.content(),
        }
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Message::System(_))
    }

    #[must_use]
    pub const fn is_summary(&self) -> bool {
        matches!(self, Message::Summary(_))
    }

    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self, Message::User(_))
    }
}
