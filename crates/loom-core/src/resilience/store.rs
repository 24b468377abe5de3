//! Circuit state store trait and the in-memory implementation.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use loom_types::circuit::CircuitState;
use loom_types::error::RepositoryError;

/// Persistence for breaker state, keyed by service name.
///
/// `save_state` is a compare-and-swap: it succeeds only when the stored
/// version equals `expected_version` (0 = not stored yet) and returns the
/// state with its version bumped. A lost race is `RepositoryError::Conflict`.
pub trait CircuitStateStore: Send + Sync + 'static {
    fn get_state(
        &self,
        service: &str,
    ) -> impl std::future::Future<Output = Result<Option<CircuitState>, RepositoryError>> + Send;

    fn save_state(
        &self,
        state: &CircuitState,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<CircuitState, RepositoryError>> + Send;

    /// Returns `true` if a state existed.
    fn remove_state(
        &self,
        service: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_all_states(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<CircuitState>, RepositoryError>> + Send;

    /// Health of the backing store itself.
    fn is_healthy(&self) -> impl std::future::Future<Output = bool> + Send;
}

/// Process-local store. Each entry is swapped under its shard lock.
#[derive(Debug, Default)]
pub struct InMemoryCircuitStore {
    states: DashMap<String, CircuitState>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitStateStore for InMemoryCircuitStore {
    async fn get_state(&self, service: &str) -> Result<Option<CircuitState>, RepositoryError> {
        Ok(self.states.get(service).map(|s| s.value().clone()))
    }

    async fn save_state(
        &self,
        state: &CircuitState,
        expected_version: u64,
    ) -> Result<CircuitState, RepositoryError> {
        let mut next = state.clone();
        next.version = expected_version + 1;
        match self.states.entry(state.service.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if current != expected_version {
                    return Err(RepositoryError::Conflict(format!(
                        "circuit '{}' is at version {current}, expected {expected_version}",
                        state.service
                    )));
                }
                occupied.insert(next.clone());
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(RepositoryError::Conflict(format!(
                        "circuit '{}' was removed",
                        state.service
                    )));
                }
                vacant.insert(next.clone());
            }
        }
        Ok(next)
    }

    async fn remove_state(&self, service: &str) -> Result<bool, RepositoryError> {
        Ok(self.states.remove(service).is_some())
    }

    async fn get_all_states(&self) -> Result<Vec<CircuitState>, RepositoryError> {
        let mut all: Vec<CircuitState> = self.states.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(all)
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_and_get() {
        let store = InMemoryCircuitStore::new();
        let saved = store
            .save_state(&CircuitState::closed("orders", Utc::now()), 0)
            .await
            .unwrap();
        assert_eq!(saved.version, 1);
        let loaded = store.get_state("orders").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(store.is_healthy().await);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = InMemoryCircuitStore::new();
        let first = store
            .save_state(&CircuitState::closed("orders", Utc::now()), 0)
            .await
            .unwrap();
        store.save_state(&first, 1).await.unwrap();

        // a writer still holding version 1 loses
        let err = store.save_state(&first, 1).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // inserting over an existing entry as if new also loses
        let err = store
            .save_state(&CircuitState::closed("orders", Utc::now()), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let store = InMemoryCircuitStore::new();
        for name in ["b", "a"] {
            store
                .save_state(&CircuitState::closed(name, Utc::now()), 0)
                .await
                .unwrap();
        }
        let all = store.get_all_states().await.unwrap();
        assert_eq!(all.iter().map(|s| s.service.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        assert!(store.remove_state("a").await.unwrap());
        assert!(!store.remove_state("a").await.unwrap());
        assert!(store.get_state("a").await.unwrap().is_none());
    }
}
