//! Response gateway: one user utterance in, one in-character reply out
//!
//! Every failure path resolves to a usable [`BotReply`]. The health signal
//! travels alongside the reply in [`Conversed`] so the operator view can
//! consume it independently of the chat surface.

use super::credential::Credential;
use super::fallback::{random_fallback, NOT_CONFIGURED_REPLY};
use super::reply::{decode_reply, Decoded};
use super::{BotReply, Emotion, LlmError, LlmService, ServiceHealth};
use crate::system_prompt::Persona;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wall-clock bound on one remote turn
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(15);

/// The two independent outputs of one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversed {
    pub reply: BotReply,
    pub health: ServiceHealth,
}

impl Conversed {
    fn failed(error: &LlmError) -> Self {
        Self {
            reply: random_fallback(),
            health: ServiceHealth::failure(error),
        }
    }
}

pub struct ResponseGateway {
    service: Arc<dyn LlmService>,
    persona: Persona,
    timeout: Duration,
}

impl ResponseGateway {
    pub fn new(service: Arc<dyn LlmService>, persona: Persona) -> Self {
        Self {
            service,
            persona,
            timeout: DEFAULT_TURN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model_id(&self) -> &str {
        self.service.model_id()
    }

    /// Run one turn. Never fails; see [`Conversed::health`] for what happened.
    pub async fn converse(
        &self,
        user_text: &str,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> Conversed {
        let Some(credential) = credential else {
            tracing::warn!("No credential configured, skipping remote call");
            return Conversed {
                reply: BotReply::new(NOT_CONFIGURED_REPLY, Emotion::Neutral),
                health: ServiceHealth::failure(&LlmError::not_configured(
                    "no credential configured",
                )),
            };
        };

        let request = self.persona.request_for(user_text);

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(LlmError::cancelled("turn cancelled")),
            result = tokio::time::timeout(
                self.timeout,
                self.service.complete(&request, credential.expose()),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(LlmError::timeout(format!(
                    "no reply within {}s",
                    self.timeout.as_secs()
                ))),
            },
        };

        match outcome {
            Ok(response) => {
                let (reply, health) = reply_from_raw(&response.text);
                if let Some(detail) = &health.detail {
                    tracing::warn!(detail = %detail, "Reply needed repair");
                }
                Conversed { reply, health }
            }
            Err(e) => {
                tracing::warn!(kind = e.kind.as_str(), error = %e, "Turn fell back");
                Conversed::failed(&e)
            }
        }
    }
}

/// Turn raw generated text into a reply plus its health signal
pub fn reply_from_raw(raw: &str) -> (BotReply, ServiceHealth) {
    match decode_reply(raw) {
        Ok(Decoded::Clean(reply)) => (reply, ServiceHealth::ok()),
        Ok(Decoded::Coerced { reply, problem }) => {
            (reply, ServiceHealth::failure(&LlmError::malformed(problem)))
        }
        Err(e) => {
            let Conversed { reply, health } = Conversed::failed(&e);
            (reply, health)
        }
    }
}
