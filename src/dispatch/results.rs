//! Result store: task id → AgentResult with TTL expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::task::AgentResult;

/// Results expire `ttl` after they are written. Expiry is checked on every
/// read, so an expired result is never returned even before the purge sweep
/// removes it.
pub struct ResultStore {
    db: Arc<dyn Database>,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(db: Arc<dyn Database>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self { db, ttl })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Expiry for a result written now.
    pub fn expires_at(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Store a result directly. Terminal task transitions store their own
    /// result through the queue.
    pub async fn put(&self, result: &AgentResult) -> Result<bool, DatabaseError> {
        let stored = self.db.put_result(result, self.expires_at()).await?;
        if stored {
            tracing::debug!(
                task_id = %result.task_id,
                status = result.status.as_str(),
                ttl_secs = self.ttl.as_secs(),
                "Result stored"
            );
        }
        Ok(stored)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<AgentResult>, DatabaseError> {
        self.db.get_result(task_id, Utc::now()).await
    }

    /// Delete expired results. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, DatabaseError> {
        self.db.purge_expired_results(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use serde_json::json;

    async fn store(ttl: Duration) -> Arc<ResultStore> {
        ResultStore::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()), ttl)
    }

    #[tokio::test]
    async fn put_then_get() {
        let results = store(Duration::from_secs(3600)).await;
        let result = AgentResult::success(
            Uuid::new_v4(),
            "gemini",
            json!({"summary": "fine"}),
            Duration::from_millis(12),
        );
        assert!(results.put(&result).await.unwrap());
        assert_eq!(results.get(result.task_id).await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn unknown_task_has_no_result() {
        let results = store(Duration::from_secs(3600)).await;
        assert!(results.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_result_is_absent_before_purge() {
        let results = store(Duration::from_millis(100)).await;
        let result = AgentResult::failure(Uuid::new_v4(), "amp", "boom", Duration::ZERO);
        results.put(&result).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(results.get(result.task_id).await.unwrap().is_none());
        assert_eq!(results.purge_expired().await.unwrap(), 1);
    }
}
