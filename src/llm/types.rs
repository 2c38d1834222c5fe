//! Common types for reply generation

use super::LlmErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Request sent to the text-generation service
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Ordered exchanges: persona instruction, priming reply, user utterance
    pub messages: Vec<LlmMessage>,
    /// Ask the service for a JSON object instead of free text
    pub json_response: bool,
}

/// Message in the outbound exchange list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub text: String,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Model,
            text: text.into(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Model,
}

/// Raw generated text plus accounting
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Usage,
}

impl LlmResponse {
    #[allow(dead_code)] // Used in tests
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: Usage::default(),
        }
    }
}

/// Token usage
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ============================================================================
// Emotion
// ============================================================================

/// The persona's reactive stance, drives both dialogue tone and illustration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    /// Bashful, guarded
    Shy,
    Withdrawn,
    /// Warm and at ease
    Relaxed,
    Hesitant,
}

impl Emotion {
    pub const ALL: [Emotion; 5] = [
        Emotion::Neutral,
        Emotion::Shy,
        Emotion::Withdrawn,
        Emotion::Relaxed,
        Emotion::Hesitant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Shy => "shy",
            Emotion::Withdrawn => "withdrawn",
            Emotion::Relaxed => "relaxed",
            Emotion::Hesitant => "hesitant",
        }
    }

    /// Case-insensitive lookup; `None` for anything outside the enum
    pub fn parse(value: &str) -> Option<Self> {
        let wanted = value.trim();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(wanted))
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown emotion: {s}"))
    }
}

/// One normalized bot reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotReply {
    pub text: String,
    pub emotion: Emotion,
}

impl BotReply {
    pub fn new(text: impl Into<String>, emotion: Emotion) -> Self {
        Self {
            text: text.into(),
            emotion,
        }
    }
}

// ============================================================================
// Service health
// ============================================================================

/// Coarse service status shown on the operator screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Idle,
    Ok,
    Degraded,
    Error,
}

/// Diagnostic snapshot of the last remote call. Never gates behavior.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub detail: Option<String>,
    /// Failure classification, `None` when the last call succeeded or was skipped
    pub kind: Option<LlmErrorKind>,
}

impl ServiceHealth {
    pub fn ok() -> Self {
        Self {
            status: HealthStatus::Ok,
            detail: None,
            kind: None,
        }
    }

    pub fn idle(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Idle,
            detail: Some(detail.into()),
            kind: None,
        }
    }

    pub fn failure(error: &super::LlmError) -> Self {
        Self {
            status: error.kind.health_status(),
            detail: Some(error.message.clone()),
            kind: Some(error.kind),
        }
    }
}
