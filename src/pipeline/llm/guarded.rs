use std::sync::Arc;

use super::{Admission, BreakerRegistry, FailureKind, LlmClient, LlmError, LlmResponse};
use crate::models::CircuitBreakerSettings;

/// Dependency name of the LLM service in the breaker registry.
pub const LLM_DEPENDENCY: &str = "llm";

/// LLM client behind the shared circuit breaker and a per-call timeout.
#[derive(Clone)]
pub struct GuardedLlm {
    client: Arc<dyn LlmClient>,
    breakers: Arc<BreakerRegistry>,
    default_model: String,
}

impl GuardedLlm {
    pub fn new(client: Arc<dyn LlmClient>, breakers: Arc<BreakerRegistry>, default_model: &str) -> Self {
        Self {
            client,
            breakers,
            default_model: default_model.to_string(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// True when a call would currently be short-circuited.
    pub fn is_open(&self, settings: &CircuitBreakerSettings) -> bool {
        let breaker = self.breakers.get_or_create(LLM_DEPENDENCY, settings);
        breaker.state() == super::CircuitState::Open
    }

    pub async fn generate(
        &self,
        settings: &CircuitBreakerSettings,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<LlmResponse, LlmError> {
        let breaker = self.breakers.get_or_create(LLM_DEPENDENCY, settings);
        let admission = breaker.try_acquire();
        if let Admission::Rejected { retry_after } = admission {
            tracing::warn!(
                dependency = LLM_DEPENDENCY,
                retry_after_secs = retry_after.as_secs(),
                "LLM call short-circuited"
            );
            return Err(LlmError::CircuitOpen {
                dependency: LLM_DEPENDENCY.into(),
            });
        }

        let model = if model.is_empty() {
            self.default_model.clone()
        } else {
            model.to_string()
        };
        let client = self.client.clone();
        let prompt = prompt.to_string();
        let system = system.to_string();
        let timeout = breaker.call_timeout();

        let call = tokio::task::spawn_blocking(move || client.generate(&model, &prompt, &system));
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(LlmError::Worker(join.to_string())),
            Err(_) => Err(LlmError::Timeout {
                secs: timeout.as_secs(),
            }),
        };

        match &outcome {
            Ok(response) => {
                breaker.record_success();
                tracing::debug!(
                    probe = admission == Admission::Probe,
                    prompt_tokens = response.prompt_tokens,
                    completion_tokens = response.completion_tokens,
                    "LLM call succeeded"
                );
            }
            Err(e) => {
                let kind = e.failure_kind();
                breaker.record_failure(kind);
                if kind == FailureKind::Timeout {
                    tracing::warn!(timeout_secs = timeout.as_secs(), "LLM call timed out");
                } else {
                    tracing::warn!(error = %e, "LLM call failed");
                }
            }
        }
        outcome
    }
}
