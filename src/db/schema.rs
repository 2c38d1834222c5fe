//! Database schema, storage keys, and persisted record types

use crate::llm::Emotion;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Keys owned by the state manager. Scalars are stored as plain strings,
/// logs as JSON arrays.
pub mod keys {
    pub const DAY_COUNT: &str = "day_count";
    pub const LAST_VISIT_DATE: &str = "last_visit_date";
    pub const CHAT_HISTORY: &str = "chat_history";
    pub const MISSION_HISTORY: &str = "mission_history";
    pub const EMOTIONAL_STATE: &str = "emotional_state";
    pub const CHAT_TURN_COUNT: &str = "chat_turn_count";
    pub const CREDENTIAL_OVERRIDE: &str = "credential_override";
    pub const AI_ENABLED: &str = "ai_enabled";

    pub const ALL: [&str; 8] = [
        DAY_COUNT,
        LAST_VISIT_DATE,
        CHAT_HISTORY,
        MISSION_HISTORY,
        EMOTIONAL_STATE,
        CHAT_TURN_COUNT,
        CREDENTIAL_OVERRIDE,
        AI_ENABLED,
    ];

    /// Cleared by a soft reset
    pub const CONVERSATION: [&str; 2] = [CHAT_HISTORY, CHAT_TURN_COUNT];
}

/// Who authored a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
}

/// One entry in the append-only chat log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Milliseconds since the epoch at capture, bumped on collision
    pub id: i64,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    /// Set on bot messages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_state: Option<Emotion>,
}

impl ChatMessage {
    pub fn user(id: i64, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            text: text.into(),
            sender: Sender::User,
            timestamp,
            emotional_state: None,
        }
    }

    pub fn bot(
        id: i64,
        text: impl Into<String>,
        emotion: Emotion,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            sender: Sender::Bot,
            timestamp,
            emotional_state: Some(emotion),
        }
    }
}

/// A mission the user has performed. The label is captured at completion
/// time and never follows later catalog edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedMission {
    pub id: String,
    pub mission_label: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
}
