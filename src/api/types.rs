//! API request and response types

use crate::db::{ChatMessage, CompletedMission};
use crate::llm::{Emotion, LlmErrorKind};
use crate::runtime::CredentialVerdict;
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// Both sides of a completed turn
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub user: ChatMessage,
    pub reply: ChatMessage,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct MissionRequest {
    pub mission: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MissionResponse {
    pub mission: CompletedMission,
}

#[derive(Debug, Deserialize)]
pub struct EmotionRequest {
    pub emotion: Emotion,
}

#[derive(Debug, Deserialize)]
pub struct AiEnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CredentialRequest {
    pub token: String,
}

/// Outcome of a credential check
#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<LlmErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<CredentialVerdict> for CredentialResponse {
    fn from(verdict: CredentialVerdict) -> Self {
        match verdict {
            CredentialVerdict::Accepted => Self {
                accepted: true,
                kind: None,
                detail: None,
            },
            CredentialVerdict::Rejected { kind, detail } => Self {
                accepted: false,
                kind: Some(kind),
                detail: Some(detail),
            },
        }
    }
}

/// Response for actions with nothing else to report
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
