//! Per-service circuit breaker.
//!
//! Transitions are pure functions over [`CircuitState`]; [`CircuitBreaker`]
//! applies them against a [`CircuitStateStore`] with one writer per service
//! key (a per-key async mutex plus a versioned compare-and-swap save).
//!
//! ```text
//! Closed --failures >= threshold--> Open --cooldown elapsed--> HalfOpen
//! HalfOpen --successes >= threshold--> Closed
//! HalfOpen --any failure--> Open
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use loom_types::circuit::{CircuitBreakerConfig, CircuitState, CircuitStatus};
use loom_types::error::RepositoryError;
use loom_types::event::WorkflowEvent;
use loom_types::workflow::CircuitBreakerPolicy;
use thiserror::Error;
use tokio::sync::Mutex;

use super::store::CircuitStateStore;
use crate::event::EventSink;

/// Attempts at a compare-and-swap save before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("circuit open for service '{service}'")]
    Open { service: String },

    #[error("circuit store error: {0}")]
    Store(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Whether a call may proceed, applying Open -> HalfOpen once the cooldown
/// has elapsed.
pub fn on_check(
    state: &CircuitState,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> (CircuitState, bool) {
    match state.status {
        CircuitStatus::Closed | CircuitStatus::HalfOpen => (state.clone(), true),
        CircuitStatus::Open => {
            let opened_at = state.circuit_opened_at.unwrap_or(state.last_transition_at);
            let cooldown = chrono::Duration::seconds(config.cooldown_secs as i64);
            if now - opened_at >= cooldown {
                let mut next = state.clone();
                next.status = CircuitStatus::HalfOpen;
                next.half_open_success_count = 0;
                next.last_transition_at = now;
                (next, true)
            } else {
                (state.clone(), false)
            }
        }
    }
}

pub fn on_success(state: &CircuitState, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> CircuitState {
    let mut next = state.clone();
    match state.status {
        CircuitStatus::Closed => next.failure_count = 0,
        CircuitStatus::HalfOpen => {
            next.half_open_success_count += 1;
            if next.half_open_success_count >= config.half_open_success_threshold {
                next.status = CircuitStatus::Closed;
                next.failure_count = 0;
                next.half_open_success_count = 0;
                next.circuit_opened_at = None;
                next.last_transition_at = now;
            }
        }
        // A call admitted before the circuit opened finished late; stay open.
        CircuitStatus::Open => {}
    }
    next
}

pub fn on_failure(state: &CircuitState, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> CircuitState {
    let mut next = state.clone();
    next.failure_count = next.failure_count.saturating_add(1);
    match state.status {
        CircuitStatus::Closed => {
            if next.failure_count >= config.failure_threshold {
                trip(&mut next, now);
            }
        }
        CircuitStatus::HalfOpen => trip(&mut next, now),
        CircuitStatus::Open => {}
    }
    next
}

fn trip(state: &mut CircuitState, now: DateTime<Utc>) {
    state.status = CircuitStatus::Open;
    state.half_open_success_count = 0;
    state.circuit_opened_at = Some(now);
    state.last_transition_at = now;
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker<S> {
    store: Arc<S>,
    config: CircuitBreakerConfig,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    events: Arc<dyn EventSink>,
}

impl<S> Clone for CircuitBreaker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
            locks: Arc::clone(&self.locks),
            events: Arc::clone(&self.events),
        }
    }
}

impl<S: CircuitStateStore> CircuitBreaker<S> {
    pub fn new(store: Arc<S>, config: CircuitBreakerConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            config,
            locks: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Engine defaults overlaid with a step's policy.
    pub fn config_for(&self, policy: Option<&CircuitBreakerPolicy>) -> CircuitBreakerConfig {
        let mut config = self.config;
        if let Some(p) = policy {
            if let Some(v) = p.failure_threshold {
                config.failure_threshold = v;
            }
            if let Some(v) = p.half_open_success_threshold {
                config.half_open_success_threshold = v;
            }
            if let Some(v) = p.cooldown_secs {
                config.cooldown_secs = v;
            }
        }
        config
    }

    /// Gate a call to `service`. Rejects with [`CircuitError::Open`] while the
    /// circuit is open and the cooldown has not elapsed.
    pub async fn check(&self, service: &str, config: &CircuitBreakerConfig) -> Result<(), CircuitError> {
        let Some(state) = self.store.get_state(service).await? else {
            return Ok(());
        };
        if state.status != CircuitStatus::Open {
            return Ok(());
        }
        let (_, allowed) = on_check(&state, config, Utc::now());
        if !allowed {
            return Err(CircuitError::Open {
                service: service.to_string(),
            });
        }

        let updated = self
            .mutate(service, |s| on_check(s, config, Utc::now()).0)
            .await?;
        match updated {
            Some(s) if s.status == CircuitStatus::Open => Err(CircuitError::Open {
                service: service.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub async fn record_success(
        &self,
        service: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<(), CircuitError> {
        // Breakers are created lazily on first failure.
        if self.store.get_state(service).await?.is_none() {
            return Ok(());
        }
        self.mutate(service, |s| on_success(s, config, Utc::now()))
            .await
            .map(|_| ())
    }

    pub async fn record_failure(
        &self,
        service: &str,
        config: &CircuitBreakerConfig,
    ) -> Result<(), CircuitError> {
        self.mutate_or_create(service, |s| on_failure(s, config, Utc::now()))
            .await
            .map(|_| ())
    }

    pub async fn get_state(&self, service: &str) -> Result<Option<CircuitState>, CircuitError> {
        Ok(self.store.get_state(service).await?)
    }

    /// Overwrite a service's state as given (administrative use).
    pub async fn save_state(&self, state: CircuitState) -> Result<CircuitState, CircuitError> {
        let replacement = state.clone();
        self.mutate_or_create(&state.service, move |current| CircuitState {
            version: current.version,
            ..replacement.clone()
        })
        .await
    }

    pub async fn remove_state(&self, service: &str) -> Result<bool, CircuitError> {
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;
        Ok(self.store.remove_state(service).await?)
    }

    pub async fn get_all_states(&self) -> Result<Vec<CircuitState>, CircuitError> {
        Ok(self.store.get_all_states().await?)
    }

    pub async fn force_open(&self, service: &str) -> Result<CircuitState, CircuitError> {
        tracing::warn!(service, "circuit forced open");
        self.mutate_or_create(service, |s| {
            let mut next = s.clone();
            trip(&mut next, Utc::now());
            next
        })
        .await
    }

    pub async fn force_close(&self, service: &str) -> Result<CircuitState, CircuitError> {
        tracing::warn!(service, "circuit forced closed");
        self.mutate_or_create(service, |s| {
            let mut next = CircuitState::closed(&s.service, Utc::now());
            next.version = s.version;
            next
        })
        .await
    }

    /// Forget the service's state; the next failure starts from Closed.
    pub async fn reset(&self, service: &str) -> Result<(), CircuitError> {
        tracing::info!(service, "circuit reset");
        self.remove_state(service).await.map(|_| ())
    }

    pub async fn is_healthy(&self) -> bool {
        self.store.is_healthy().await
    }

    fn lock_for(&self, service: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply `f` to an existing state. `None` when the service has no state.
    async fn mutate<F>(&self, service: &str, f: F) -> Result<Option<CircuitState>, CircuitError>
    where
        F: Fn(&CircuitState) -> CircuitState,
    {
        self.apply(service, false, f).await
    }

    async fn mutate_or_create<F>(&self, service: &str, f: F) -> Result<CircuitState, CircuitError>
    where
        F: Fn(&CircuitState) -> CircuitState,
    {
        let updated = self.apply(service, true, f).await?;
        updated.ok_or_else(|| CircuitError::Store(RepositoryError::NotFound))
    }

    async fn apply<F>(&self, service: &str, create: bool, f: F) -> Result<Option<CircuitState>, CircuitError>
    where
        F: Fn(&CircuitState) -> CircuitState,
    {
        let lock = self.lock_for(service);
        let _guard = lock.lock().await;

        let mut last_conflict = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.get_state(service).await? {
                Some(state) => state,
                None if create => CircuitState::closed(service, Utc::now()),
                None => return Ok(None),
            };
            let next = f(&current);
            if next == current {
                return Ok(Some(current));
            }
            match self.store.save_state(&next, current.version).await {
                Ok(saved) => {
                    if saved.status != current.status {
                        tracing::info!(
                            service,
                            from = %current.status,
                            to = %saved.status,
                            failures = saved.failure_count,
                            "circuit transition"
                        );
                        self.events.publish(WorkflowEvent::CircuitTransition {
                            service: service.to_string(),
                            from: current.status,
                            to: saved.status,
                        });
                    }
                    return Ok(Some(saved));
                }
                Err(RepositoryError::Conflict(msg)) => {
                    tracing::debug!(service, %msg, "circuit state save conflicted, retrying");
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CircuitError::Store(RepositoryError::Conflict(
            last_conflict.unwrap_or_default(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBus, NullSink};
    use crate::resilience::store::InMemoryCircuitStore;

    fn config(failure_threshold: u32, half_open_success_threshold: u32, cooldown_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            half_open_success_threshold,
            cooldown_secs,
        }
    }

    fn breaker() -> CircuitBreaker<InMemoryCircuitStore> {
        CircuitBreaker::new(
            Arc::new(InMemoryCircuitStore::new()),
            config(3, 1, 60),
            Arc::new(NullSink),
        )
    }

    // -----------------------------------------------------------------------
    // Pure transitions
    // -----------------------------------------------------------------------

    #[test]
    fn test_full_cycle_with_explicit_clock() {
        let cfg = config(3, 1, 30);
        let t0 = Utc::now();
        let mut s = CircuitState::closed("svc", t0);

        for _ in 0..2 {
            s = on_failure(&s, &cfg, t0);
            assert_eq!(s.status, CircuitStatus::Closed);
        }
        s = on_failure(&s, &cfg, t0);
        assert_eq!(s.status, CircuitStatus::Open);
        assert_eq!(s.circuit_opened_at, Some(t0));

        let (still_open, allowed) = on_check(&s, &cfg, t0 + chrono::Duration::seconds(10));
        assert!(!allowed);
        assert_eq!(still_open.status, CircuitStatus::Open);

        let (half, allowed) = on_check(&s, &cfg, t0 + chrono::Duration::seconds(31));
        assert!(allowed);
        assert_eq!(half.status, CircuitStatus::HalfOpen);

        let closed = on_success(&half, &cfg, t0 + chrono::Duration::seconds(32));
        assert_eq!(closed.status, CircuitStatus::Closed);
        assert_eq!(closed.failure_count, 0);
        assert_eq!(closed.circuit_opened_at, None);
    }

    #[test]
    fn test_half_open_failure_reopens_and_resets_counter() {
        let cfg = config(3, 2, 30);
        let now = Utc::now();
        let mut s = CircuitState::closed("svc", now);
        s.status = CircuitStatus::HalfOpen;

        s = on_success(&s, &cfg, now);
        assert_eq!(s.status, CircuitStatus::HalfOpen);
        assert_eq!(s.half_open_success_count, 1);

        s = on_failure(&s, &cfg, now);
        assert_eq!(s.status, CircuitStatus::Open);
        assert_eq!(s.half_open_success_count, 0);
        assert_eq!(s.circuit_opened_at, Some(now));
    }

    #[test]
    fn test_success_while_closed_resets_failures() {
        let cfg = config(3, 1, 30);
        let now = Utc::now();
        let s = on_failure(&CircuitState::closed("svc", now), &cfg, now);
        let s = on_failure(&s, &cfg, now);
        assert_eq!(s.failure_count, 2);
        assert_eq!(on_success(&s, &cfg, now).failure_count, 0);
    }

    // -----------------------------------------------------------------------
    // Store-backed breaker
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_three_failures_open_circuit() {
        let breaker = breaker();
        let cfg = *breaker.config();
        assert!(breaker.check("orders", &cfg).await.is_ok());
        assert!(breaker.get_state("orders").await.unwrap().is_none());

        for _ in 0..3 {
            breaker.record_failure("orders", &cfg).await.unwrap();
        }
        let state = breaker.get_state("orders").await.unwrap().unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert!(matches!(
            breaker.check("orders", &cfg).await,
            Err(CircuitError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn test_cooldown_elapsed_moves_to_half_open_then_closed() {
        let breaker = breaker();
        let cfg = config(3, 1, 0);
        for _ in 0..3 {
            breaker.record_failure("orders", &cfg).await.unwrap();
        }
        breaker.check("orders", &cfg).await.unwrap();
        let state = breaker.get_state("orders").await.unwrap().unwrap();
        assert_eq!(state.status, CircuitStatus::HalfOpen);

        breaker.record_success("orders", &cfg).await.unwrap();
        let state = breaker.get_state("orders").await.unwrap().unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test]
    async fn test_success_without_state_creates_nothing() {
        let breaker = breaker();
        let cfg = *breaker.config();
        breaker.record_success("fresh", &cfg).await.unwrap();
        assert!(breaker.get_all_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_overrides() {
        let breaker = breaker();
        let cfg = *breaker.config();

        let state = breaker.force_open("billing").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert!(breaker.check("billing", &cfg).await.is_err());

        let state = breaker.force_close("billing").await.unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert!(breaker.check("billing", &cfg).await.is_ok());

        // automatic transitions resume from the forced state
        for _ in 0..3 {
            breaker.record_failure("billing", &cfg).await.unwrap();
        }
        assert_eq!(
            breaker.get_state("billing").await.unwrap().unwrap().status,
            CircuitStatus::Open
        );

        breaker.reset("billing").await.unwrap();
        assert!(breaker.get_state("billing").await.unwrap().is_none());
        assert!(breaker.is_healthy().await);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let breaker = CircuitBreaker::new(
            Arc::new(InMemoryCircuitStore::new()),
            config(1000, 1, 60),
            Arc::new(NullSink),
        );
        let cfg = *breaker.config();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let b = breaker.clone();
            handles.push(tokio::spawn(async move {
                b.record_failure("hot", &cfg).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let state = breaker.get_state("hot").await.unwrap().unwrap();
        assert_eq!(state.failure_count, 50);
    }

    #[tokio::test]
    async fn test_transition_events_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let breaker = CircuitBreaker::new(
            Arc::new(InMemoryCircuitStore::new()),
            config(1, 1, 60),
            Arc::new(bus),
        );
        let cfg = *breaker.config();
        breaker.record_failure("svc", &cfg).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            WorkflowEvent::CircuitTransition {
                service: "svc".into(),
                from: CircuitStatus::Closed,
                to: CircuitStatus::Open,
            }
        );
    }

    #[test]
    fn test_policy_overrides_defaults() {
        let breaker = breaker();
        let policy = CircuitBreakerPolicy {
            service: None,
            failure_threshold: Some(1),
            half_open_success_threshold: None,
            cooldown_secs: Some(5),
        };
        let cfg = breaker.config_for(Some(&policy));
        assert_eq!(cfg.failure_threshold, 1);
        assert_eq!(cfg.half_open_success_threshold, 1);
        assert_eq!(cfg.cooldown_secs, 5);
    }
}
