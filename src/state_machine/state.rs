//! Turn state types

use serde::{Deserialize, Serialize};

/// Where the single conversational turn currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnState {
    /// Persisted state has not been restored yet
    #[default]
    Loading,
    /// Ready for the next user message
    Idle,
    /// The user's message is in the log and a reply is being produced
    AwaitingReply { message_id: i64 },
    /// The reply is in the log and being written to storage
    Persisting { message_id: i64 },
}

impl TurnState {
    /// A turn is in flight
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            TurnState::AwaitingReply { .. } | TurnState::Persisting { .. }
        )
    }

    pub fn is_ready(self) -> bool {
        !matches!(self, TurnState::Loading)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            TurnState::Loading => "loading",
            TurnState::Idle => "idle",
            TurnState::AwaitingReply { .. } => "awaiting_reply",
            TurnState::Persisting { .. } => "persisting",
        }
    }
}

/// How the reply for a turn is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Through the response gateway
    Remote,
    /// Fixed local line, the gateway is bypassed
    Local,
}

impl ReplyMode {
    pub fn for_ai_enabled(enabled: bool) -> Self {
        if enabled {
            ReplyMode::Remote
        } else {
            ReplyMode::Local
        }
    }
}
