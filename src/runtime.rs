//! Conversation state runtime
//!
//! The [`StateManager`] is the single owner of persisted app state. It runs
//! turns through the pure state machine, executes the resulting effects,
//! and publishes [`StateEvent`]s to observers.

mod manager;
mod recovery;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use manager::{CredentialVerdict, StateManager, SubmitOutcome};
pub use traits::*;

use crate::db::{ChatMessage, CompletedMission};
use crate::llm::{Emotion, ServiceHealth};
use crate::state_machine::{TransitionError, TurnState};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

/// Type alias for the production manager backed by SQLite
pub type ProductionManager = StateManager<DatabaseStore>;

/// Errors surfaced by state-mutating operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// The in-memory change stands; storage could not record it
    #[error("Failed to persist {keys}: {message}")]
    Persistence { keys: String, message: String },
}

/// Which credential layer is in effect. The token itself is never exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOrigin {
    Override,
    Default,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Chat log and chat counter only
    Soft,
    /// Every persisted key
    Hard,
}

/// Whether durable storage is keeping up with in-memory state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageHealth {
    pub ok: bool,
    /// Keys whose latest value only exists in memory
    pub failing_keys: BTreeSet<String>,
    pub last_error: Option<String>,
}

impl Default for StorageHealth {
    fn default() -> Self {
        Self {
            ok: true,
            failing_keys: BTreeSet::new(),
            last_error: None,
        }
    }
}

/// Read-only view of everything the UI renders
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSnapshot {
    pub turn: TurnState,
    pub day_count: u32,
    pub last_visit_date: NaiveDate,
    pub chat_history: Vec<ChatMessage>,
    /// Most recent first
    pub mission_history: Vec<CompletedMission>,
    pub chat_turn_count: u32,
    pub current_emotional_state: Emotion,
    pub ai_feature_enabled: bool,
    pub service_health: ServiceHealth,
    pub storage_health: StorageHealth,
    pub credential: CredentialOrigin,
    pub model: String,
}

/// Events sent to observers (SSE clients)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    Message {
        message: ChatMessage,
    },
    TurnChanged {
        turn: TurnState,
    },
    Emotion {
        emotion: Emotion,
    },
    Mission {
        mission: CompletedMission,
    },
    Settings {
        ai_feature_enabled: bool,
        credential: CredentialOrigin,
    },
    Health {
        health: ServiceHealth,
    },
    Storage {
        health: StorageHealth,
    },
    Reset {
        scope: ResetScope,
    },
}

impl StateEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            StateEvent::Message { .. } => "message",
            StateEvent::TurnChanged { .. } => "turn_changed",
            StateEvent::Emotion { .. } => "emotion",
            StateEvent::Mission { .. } => "mission",
            StateEvent::Settings { .. } => "settings",
            StateEvent::Health { .. } => "health",
            StateEvent::Storage { .. } => "storage",
            StateEvent::Reset { .. } => "reset",
        }
    }
}
