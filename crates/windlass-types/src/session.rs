use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, globally unique identifier for an inference session.
///
/// Minted by the scheduler on session creation (a v4 UUID in string form);
/// never reused and not derivable from conversation content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh session identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Author of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry in a session's ordered message log.
///
/// The system message, when present, sits at position 0 and is never
/// mutated; prefill appends user messages, decode appends assistant
/// messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Lifecycle phase of a scheduled session.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Prefilling,
    Decoding,
    Completed,
    Failed,
    Evicted,
}

impl SessionPhase {
    /// A session may accept a new completion only between turns.
    pub fn accepts_completion(self) -> bool {
        matches!(self, SessionPhase::Idle | SessionPhase::Completed)
    }

    /// Evicted and failed sessions no longer count towards worker load.
    pub fn is_active(self) -> bool {
        !matches!(self, SessionPhase::Evicted | SessionPhase::Failed)
    }

    /// Sessions in the middle of a turn must not be evicted.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionPhase::Prefilling | SessionPhase::Decoding)
    }
}
