//! Events that drive a turn

use super::state::ReplyMode;
use crate::db::ChatMessage;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// Persisted state has been restored
    Loaded,
    /// The user submitted a message (already stamped with id and time)
    UserMessage {
        message: ChatMessage,
        mode: ReplyMode,
    },
    /// The reply for the pending turn is ready
    ReplyReceived { message: ChatMessage },
    /// The reply and emotion writes have finished
    TurnPersisted,
}
