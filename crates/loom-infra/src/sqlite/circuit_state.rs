//! SQLite circuit-state store.
//!
//! Implements `CircuitStateStore` from `loom-core`. Saves are guarded by the
//! row's `version` column, so two processes sharing one database file cannot
//! overwrite each other's transitions.

use chrono::{DateTime, Utc};
use loom_core::resilience::CircuitStateStore;
use loom_types::circuit::{CircuitState, CircuitStatus};
use loom_types::error::RepositoryError;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CircuitStateStore`.
pub struct SqliteCircuitStateStore {
    pool: DatabasePool,
}

impl SqliteCircuitStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct CircuitStateRow {
    service: String,
    status: String,
    failure_count: i64,
    half_open_success_count: i64,
    circuit_opened_at: Option<String>,
    last_transition_at: String,
    version: i64,
}

impl CircuitStateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            service: row.try_get("service")?,
            status: row.try_get("status")?,
            failure_count: row.try_get("failure_count")?,
            half_open_success_count: row.try_get("half_open_success_count")?,
            circuit_opened_at: row.try_get("circuit_opened_at")?,
            last_transition_at: row.try_get("last_transition_at")?,
            version: row.try_get("version")?,
        })
    }

    fn into_state(self) -> Result<CircuitState, RepositoryError> {
        let status: CircuitStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let circuit_opened_at = self
            .circuit_opened_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;

        Ok(CircuitState {
            service: self.service,
            status,
            failure_count: self.failure_count as u32,
            half_open_success_count: self.half_open_success_count as u32,
            circuit_opened_at,
            last_transition_at: parse_datetime(&self.last_transition_at)?,
            version: self.version as u64,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT service, status, failure_count, half_open_success_count, \
     circuit_opened_at, last_transition_at, version FROM circuit_states";

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// CircuitStateStore impl
// ---------------------------------------------------------------------------

impl CircuitStateStore for SqliteCircuitStateStore {
    async fn get_state(&self, service: &str) -> Result<Option<CircuitState>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE service = ?"))
            .bind(service)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = CircuitStateRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_state()?))
            }
            None => Ok(None),
        }
    }

    async fn save_state(
        &self,
        state: &CircuitState,
        expected_version: u64,
    ) -> Result<CircuitState, RepositoryError> {
        let mut next = state.clone();
        next.version = expected_version + 1;

        let opened_at = next.circuit_opened_at.as_ref().map(format_datetime);
        let transition_at = format_datetime(&next.last_transition_at);

        let result = if expected_version == 0 {
            sqlx::query(
                r#"INSERT INTO circuit_states
                   (service, status, failure_count, half_open_success_count,
                    circuit_opened_at, last_transition_at, version)
                   VALUES (?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(service) DO NOTHING"#,
            )
            .bind(&next.service)
            .bind(next.status.as_str())
            .bind(next.failure_count as i64)
            .bind(next.half_open_success_count as i64)
            .bind(&opened_at)
            .bind(&transition_at)
            .bind(next.version as i64)
            .execute(&self.pool.writer)
            .await
        } else {
            sqlx::query(
                r#"UPDATE circuit_states SET
                     status = ?,
                     failure_count = ?,
                     half_open_success_count = ?,
                     circuit_opened_at = ?,
                     last_transition_at = ?,
                     version = ?
                   WHERE service = ? AND version = ?"#,
            )
            .bind(next.status.as_str())
            .bind(next.failure_count as i64)
            .bind(next.half_open_success_count as i64)
            .bind(&opened_at)
            .bind(&transition_at)
            .bind(next.version as i64)
            .bind(&next.service)
            .bind(expected_version as i64)
            .execute(&self.pool.writer)
            .await
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "circuit '{}' is no longer at version {expected_version}",
                next.service
            )));
        }

        tracing::debug!(
            service = %next.service,
            status = %next.status,
            version = next.version,
            "circuit state saved"
        );
        Ok(next)
    }

    async fn remove_state(&self, service: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM circuit_states WHERE service = ?")
            .bind(service)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_all_states(&self) -> Result<Vec<CircuitState>, RepositoryError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY service ASC"))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut states = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CircuitStateRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            states.push(r.into_state()?);
        }
        Ok(states)
    }

    async fn is_healthy(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool.reader).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "circuit state store health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::{DatabasePool, database_url_in};

    async fn test_store() -> (tempfile::TempDir, SqliteCircuitStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url_in(dir.path());
        let store = SqliteCircuitStateStore::new(DatabasePool::new(&url).await.unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let (_dir, store) = test_store().await;
        let now = Utc::now();
        let mut state = CircuitState::closed("payments", now);
        state.status = CircuitStatus::Open;
        state.failure_count = 5;
        state.circuit_opened_at = Some(now);

        let saved = store.save_state(&state, 0).await.unwrap();
        assert_eq!(saved.version, 1);

        let loaded = store.get_state("payments").await.unwrap().unwrap();
        assert_eq!(loaded.status, CircuitStatus::Open);
        assert_eq!(loaded.failure_count, 5);
        assert_eq!(loaded.version, 1);
        assert!(loaded.circuit_opened_at.is_some());
    }

    #[tokio::test]
    async fn test_get_nonexistent_returns_none() {
        let (_dir, store) = test_store().await;
        assert!(store.get_state("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (_dir, store) = test_store().await;
        let first = store
            .save_state(&CircuitState::closed("orders", Utc::now()), 0)
            .await
            .unwrap();
        let second = store.save_state(&first, first.version).await.unwrap();
        assert_eq!(second.version, 2);

        let err = store.save_state(&first, first.version).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let err = store
            .save_state(&CircuitState::closed("orders", Utc::now()), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let (_dir, store) = test_store().await;
        for name in ["search", "billing"] {
            store
                .save_state(&CircuitState::closed(name, Utc::now()), 0)
                .await
                .unwrap();
        }

        let all = store.get_all_states().await.unwrap();
        assert_eq!(
            all.iter().map(|s| s.service.as_str()).collect::<Vec<_>>(),
            ["billing", "search"]
        );

        assert!(store.remove_state("billing").await.unwrap());
        assert!(!store.remove_state("billing").await.unwrap());
        assert_eq!(store.get_all_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_database_is_removed_with_its_directory() {
        let (dir, store) = test_store().await;
        store
            .save_state(&CircuitState::closed("payments", Utc::now()), 0)
            .await
            .unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.join("loom.db").exists());

        drop(store);
        drop(dir);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_is_healthy() {
        let (_dir, store) = test_store().await;
        assert!(store.is_healthy().await);
    }
}
