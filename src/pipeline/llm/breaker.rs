//! Process-wide circuit breaker per downstream dependency.
//!
//! Closed -> Open when consecutive failures reach the threshold, or at once
//! on a timeout / server error when so configured. Open -> HalfOpen after the
//! cooldown. HalfOpen admits a single probe: success closes the circuit,
//! failure reopens it and restarts the cooldown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Timeout,
    ServerError,
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single HalfOpen probe.
    Probe,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub tripped_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    tripped_at: Option<DateTime<Utc>>,
    cooldown_deadline: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    settings: CircuitBreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: &str, settings: CircuitBreakerSettings) -> Self {
        Self {
            dependency: dependency.to_string(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                tripped_at: None,
                cooldown_deadline: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.call_timeout_secs)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.settings.cooldown_secs)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent under poisoning: every update is a plain assignment
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Promote Open -> HalfOpen once the cooldown has elapsed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open
            && inner.cooldown_deadline.is_some_and(|d| Instant::now() >= d)
        {
            tracing::info!(dependency = %self.dependency, "Circuit half-open, admitting probe");
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Admission::Probe
            }
            CircuitState::HalfOpen => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
            CircuitState::Open => Admission::Rejected {
                retry_after: inner
                    .cooldown_deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or_default(),
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(dependency = %self.dependency, "Circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.tripped_at = None;
        inner.cooldown_deadline = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
            CircuitState::Closed => {
                inner.consecutive_failures >= self.settings.failure_threshold
                    || (kind == FailureKind::Timeout && self.settings.trip_on_timeout)
                    || (kind == FailureKind::ServerError && self.settings.trip_on_server_error)
            }
        };
        if trip {
            self.trip(&mut inner, kind);
        }
    }

    fn trip(&self, inner: &mut Inner, kind: FailureKind) {
        tracing::warn!(
            dependency = %self.dependency,
            failures = inner.consecutive_failures,
            reason = ?kind,
            cooldown_secs = self.settings.cooldown_secs,
            "Circuit opened"
        );
        inner.state = CircuitState::Open;
        inner.tripped_at = Some(Utc::now());
        inner.cooldown_deadline = Some(Instant::now() + self.cooldown());
        inner.probe_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        let cooldown_until = inner.cooldown_deadline.and_then(|d| {
            let remaining = d.saturating_duration_since(Instant::now());
            chrono::Duration::from_std(remaining).ok().map(|r| Utc::now() + r)
        });
        CircuitSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            tripped_at: inner.tripped_at,
            cooldown_until,
        }
    }
}

/// One breaker per dependency, shared by all workers. The first caller's
/// settings configure a breaker.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, dependency: &str, settings: &CircuitBreakerSettings) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, *settings)))
            .clone()
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        map.get(dependency).cloned()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut out: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, cooldown_secs: u64) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: threshold,
            call_timeout_secs: 1,
            cooldown_secs,
            trip_on_timeout: true,
            trip_on_server_error: true,
        }
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("llm", settings(3, 300));
        breaker.record_failure(FailureKind::Error);
        breaker.record_failure(FailureKind::Error);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure(FailureKind::Error);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_acquire().is_allowed());
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new("llm", settings(3, 300));
        breaker.record_failure(FailureKind::Error);
        breaker.record_failure(FailureKind::Error);
        breaker.record_success();
        breaker.record_failure(FailureKind::Error);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn single_timeout_or_server_error_trips() {
        let breaker = CircuitBreaker::new("llm", settings(5, 300));
        breaker.record_failure(FailureKind::Timeout);
        assert_eq!(breaker.state(), CircuitState::Open);

        let breaker = CircuitBreaker::new("llm", settings(5, 300));
        breaker.record_failure(FailureKind::ServerError);
        assert_eq!(breaker.state(), CircuitState::Open);

        let mut lenient = settings(5, 300);
        lenient.trip_on_timeout = false;
        let breaker = CircuitBreaker::new("llm", lenient);
        breaker.record_failure(FailureKind::Timeout);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_one_probe_and_closes_on_success() {
        let breaker = CircuitBreaker::new("llm", settings(1, 0));
        breaker.record_failure(FailureKind::Error);
        // zero cooldown: next check is half-open
        assert_eq!(breaker.try_acquire(), Admission::Probe);
        assert!(!breaker.try_acquire().is_allowed());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(), Admission::Allowed);
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new("llm", settings(1, 0));
        breaker.record_failure(FailureKind::Error);
        assert_eq!(breaker.try_acquire(), Admission::Probe);

        let first_trip = breaker.snapshot().tripped_at;
        std::thread::sleep(Duration::from_millis(5));
        breaker.record_failure(FailureKind::Error);
        let snap = breaker.snapshot();
        assert!(snap.tripped_at > first_trip);
    }

    #[test]
    fn open_until_cooldown_elapses() {
        let breaker = CircuitBreaker::new("llm", settings(1, 1));
        breaker.record_failure(FailureKind::Error);
        match breaker.try_acquire() {
            Admission::Rejected { retry_after } => assert!(retry_after <= Duration::from_secs(1)),
            other => panic!("expected rejection, got {other:?}"),
        }
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn registry_shares_breakers_by_dependency() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("llm", &settings(2, 300));
        let b = registry.get_or_create("llm", &settings(9, 300));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.settings().failure_threshold, 2);
        a.record_failure(FailureKind::Error);
        a.record_failure(FailureKind::Error);
        assert_eq!(registry.get("llm").unwrap().state(), CircuitState::Open);
        assert_eq!(registry.snapshots().len(), 1);
    }
}
