//! Pure state transition function

use super::state::{ReplyMode, TurnState};
use super::{Effect, Event};
use crate::db::Sender;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: TurnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: TurnState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("A reply is already being prepared, wait for it first")]
    TurnInFlight,
    #[error("State is still loading")]
    NotReady,
    #[error("Message is empty")]
    EmptyMessage,
    #[error("No turn is waiting for a reply")]
    NoPendingTurn,
    #[error("State is already loaded")]
    AlreadyLoaded,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function: no I/O, same inputs give the same outputs.
///
/// Within a turn the user message is appended and persisted before the reply
/// is requested; the bot message is persisted before the turn reports idle.
/// The runtime answers [`Effect::FinishTurn`] with [`Event::TurnPersisted`].
pub fn transition(state: &TurnState, event: Event) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // Initial load
        // ============================================================
        (TurnState::Loading, Event::Loaded) => {
            Ok(TransitionResult::new(TurnState::Idle).with_effect(Effect::NotifyTurnChanged))
        }

        (_, Event::Loaded) => Err(TransitionError::AlreadyLoaded),

        // ============================================================
        // User message
        // ============================================================
        (TurnState::Loading, Event::UserMessage { .. }) => Err(TransitionError::NotReady),

        (
            TurnState::AwaitingReply { .. } | TurnState::Persisting { .. },
            Event::UserMessage { .. },
        ) => Err(TransitionError::TurnInFlight),

        (TurnState::Idle, Event::UserMessage { message, mode }) => {
            if message.sender != Sender::User {
                return Err(TransitionError::InvalidTransition(
                    "user turn must start with a user message".to_string(),
                ));
            }
            if message.text.trim().is_empty() {
                return Err(TransitionError::EmptyMessage);
            }

            let request = match mode {
                ReplyMode::Remote => Effect::RequestReply {
                    text: message.text.clone(),
                },
                ReplyMode::Local => Effect::LocalReply,
            };

            Ok(TransitionResult::new(TurnState::AwaitingReply {
                message_id: message.id,
            })
            .with_effect(Effect::append(&message))
            .with_effect(Effect::IncrementChatCount)
            .with_effect(Effect::PersistConversation)
            .with_effect(Effect::notify(&message))
            .with_effect(Effect::NotifyTurnChanged)
            .with_effect(request))
        }

        // ============================================================
        // Reply
        // ============================================================
        (TurnState::AwaitingReply { .. }, Event::ReplyReceived { message }) => {
            let Some(emotion) = message.emotional_state.filter(|_| message.sender == Sender::Bot)
            else {
                return Err(TransitionError::InvalidTransition(
                    "reply must be a bot message with an emotion".to_string(),
                ));
            };

            Ok(TransitionResult::new(TurnState::Persisting {
                message_id: message.id,
            })
            .with_effect(Effect::append(&message))
            .with_effect(Effect::SetEmotion { emotion })
            .with_effect(Effect::PersistConversation)
            .with_effect(Effect::PersistEmotion)
            .with_effect(Effect::notify(&message))
            .with_effect(Effect::FinishTurn))
        }

        (_, Event::ReplyReceived { .. }) => Err(TransitionError::NoPendingTurn),

        // The turn stays busy until its writes are done
        (TurnState::Persisting { .. }, Event::TurnPersisted) => {
            Ok(TransitionResult::new(TurnState::Idle).with_effect(Effect::NotifyTurnChanged))
        }

        (_, Event::TurnPersisted) => Err(TransitionError::NoPendingTurn),
    }
}
