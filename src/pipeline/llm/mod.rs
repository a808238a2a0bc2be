pub mod breaker;
pub mod guarded;
pub mod ollama;

pub use breaker::*;
pub use guarded::*;
pub use ollama::*;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::models::ErrorClass;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Cannot connect to LLM service at {0}")]
    Connection(String),

    #[error("LLM call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("LLM server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("LLM request rejected {status}: {body}")]
    Client { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Failed to parse LLM response: {0}")]
    ResponseParsing(String),

    #[error("LLM unavailable: circuit '{dependency}' is open")]
    CircuitOpen { dependency: String },

    #[error("LLM worker crashed: {0}")]
    Worker(String),
}

impl LlmError {
    /// How this failure counts against the circuit breaker.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Server { .. } => FailureKind::ServerError,
            _ => FailureKind::Error,
        }
    }

    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::ResponseParsing(_) | Self::Client { .. } => ErrorClass::Content,
            _ => ErrorClass::TransientIo,
        }
    }
}

/// Completion text plus token counters reported by the service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl LlmResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }
}

/// LLM abstraction (allows mocking for tests). Calls are blocking.
pub trait LlmClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<LlmResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Mock LLM client: returns a fixed response and counts calls.
pub struct MockLlmClient {
    response: String,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, _model: &str, prompt: &str, _system: &str) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LlmResponse {
            text: self.response.clone(),
            prompt_tokens: (prompt.len() / 4) as u64,
            completion_tokens: (self.response.len() / 4) as u64,
        })
    }
}

/// Replays a queue of outcomes; the last one repeats once the queue is
/// drained. Records every prompt.
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    last: Mutex<Option<Result<LlmResponse, LlmError>>>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl LlmClient for ScriptedLlmClient {
    fn generate(&self, _model: &str, prompt: &str, _system: &str) -> Result<LlmResponse, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let mut last = self
            .last
            .lock()
            .map_err(|_| LlmError::Worker("script lock poisoned".into()))?;
        match next {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(LlmError::Http("script exhausted".into()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_client_returns_configured_response() {
        let client = MockLlmClient::new("test response");
        let result = client.generate("model", "prompt", "system").unwrap();
        assert_eq!(result.text, "test response");
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn scripted_client_replays_then_repeats_last() {
        let client = ScriptedLlmClient::new(vec![
            Err(LlmError::Server { status: 500, body: "boom".into() }),
            Ok(LlmResponse::text("{}")),
        ]);
        assert!(client.generate("m", "p1", "").is_err());
        assert_eq!(client.generate("m", "p2", "").unwrap().text, "{}");
        assert_eq!(client.generate("m", "p3", "").unwrap().text, "{}");
        assert_eq!(client.prompts(), vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(LlmError::Timeout { secs: 1 }.failure_kind(), FailureKind::Timeout);
        assert_eq!(
            LlmError::Server { status: 503, body: String::new() }.failure_kind(),
            FailureKind::ServerError
        );
        assert_eq!(LlmError::Connection("x".into()).failure_kind(), FailureKind::Error);
        assert_eq!(LlmError::Connection("x".into()).error_class(), ErrorClass::TransientIo);
    }
}
