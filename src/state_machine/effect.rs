//! Effects produced by state transitions

use crate::db::ChatMessage;
use crate::llm::Emotion;

/// Effects to be executed after state transition, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Append to the in-memory chat log
    AppendMessage { message: ChatMessage },

    /// Count one user-authored message
    IncrementChatCount,

    /// Adopt the emotion carried by a bot reply
    SetEmotion { emotion: Emotion },

    /// Write chat log and chat counter
    PersistConversation,

    /// Write the current emotional state
    PersistEmotion,

    /// Ask the response gateway for a reply
    RequestReply { text: String },

    /// Produce the fixed local reply
    LocalReply,

    /// Report that the turn's writes are done
    FinishTurn,

    /// Tell observers the turn state changed
    NotifyTurnChanged,

    /// Tell observers a message was appended
    NotifyMessage { message: ChatMessage },
}

impl Effect {
    pub fn append(message: &ChatMessage) -> Self {
        Effect::AppendMessage {
            message: message.clone(),
        }
    }

    pub fn notify(message: &ChatMessage) -> Self {
        Effect::NotifyMessage {
            message: message.clone(),
        }
    }
}
