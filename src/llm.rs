//! Text-generation service abstraction
//!
//! The transport ([`GeminiService`]) sits behind [`LlmService`] so the
//! [`ResponseGateway`] can be exercised against mocks.

mod credential;
mod error;
mod fallback;
mod gateway;
mod gemini;
mod reply;
mod types;


pub use credential::{Credential, CredentialSource};
pub use error::{LlmError, LlmErrorKind};
pub use fallback::LOCAL_REPLY;
#[cfg(test)]
pub use fallback::NOT_CONFIGURED_REPLY;
pub use gateway::{ResponseGateway, DEFAULT_TURN_TIMEOUT};
pub use gemini::GeminiService;
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for text-generation backends
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request. `api_key` is resolved per call.
    async fn complete(&self, request: &LlmRequest, api_key: &str)
        -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: LlmService + ?Sized> LlmService for Arc<T> {
    async fn complete(
        &self,
        request: &LlmRequest,
        api_key: &str,
    ) -> Result<LlmResponse, LlmError> {
        (**self).complete(request, api_key).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(
        &self,
        request: &LlmRequest,
        api_key: &str,
    ) -> Result<LlmResponse, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(request, api_key).await;
        let duration = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    kind = e.kind.as_str(),
                    status = ?e.status,
                    error = %e.message,
                    transient = e.kind.is_transient(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
