//! Application-facing facade.
//!
//! Writes go through the coordinator, reads hit the primary. Transactions
//! buffer their writes and publish them to the log and the replica queues as
//! one ordered group only when the primary commit succeeds; rolled-back work
//! is never replicated.

use crate::adapter::DatabaseAdapter;
use crate::replication::coordinator::Coordinator;
use crate::replication::error::ReplicationError;
use crate::replication::value::{Row, Value};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

#[derive(Clone)]
pub struct ReplicatedDatabase {
    coordinator: Arc<Coordinator>,
}

impl ReplicatedDatabase {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn execute(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<u64, ReplicationError> {
        self.coordinator.execute(statement, parameters).await
    }

    pub async fn fetch_one(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Option<Row>, ReplicationError> {
        self.coordinator.fetch_one(statement, parameters).await
    }

    pub async fn fetch_all(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Vec<Row>, ReplicationError> {
        self.coordinator.fetch_all(statement, parameters).await
    }

    /// Open a transaction on the primary. Writers are serialized: the
    /// transaction holds the coordinator's write lock until it finishes.
    /// Use the handle's own `execute` inside the scope.
    pub async fn begin(&self) -> Result<ReplicatedTransaction, ReplicationError> {
        if !self.coordinator.is_active() {
            return Err(self.coordinator.refusal());
        }

        let guard = self.coordinator.write_guard().await;
        let primary = self.coordinator.primary()?;
        primary.adapter().begin().await?;

        Ok(ReplicatedTransaction {
            coordinator: Arc::clone(&self.coordinator),
            adapter: Arc::clone(primary.adapter()),
            buffered: Vec::new(),
            finished: false,
            _guard: guard,
        })
    }
}

/// An open transaction. Dropping it without calling [`Self::commit`] rolls
/// the primary back and discards the buffered events.
pub struct ReplicatedTransaction {
    coordinator: Arc<Coordinator>,
    adapter: Arc<dyn DatabaseAdapter>,
    buffered: Vec<(String, Vec<Value>)>,
    finished: bool,
    _guard: OwnedMutexGuard<()>,
}

impl ReplicatedTransaction {
    /// Apply a write inside the transaction. It is buffered for replication
    /// and only published on commit.
    pub async fn execute(
        &mut self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<u64, ReplicationError> {
        let affected = self.adapter.execute(statement, parameters).await?;
        self.buffered
            .push((statement.to_string(), parameters.to_vec()));
        Ok(affected)
    }

    /// Read inside the transaction; sees its own uncommitted writes.
    pub async fn fetch_one(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Option<Row>, ReplicationError> {
        Ok(self.adapter.fetch_one(statement, parameters).await?)
    }

    pub async fn fetch_all(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Vec<Row>, ReplicationError> {
        Ok(self.adapter.fetch_all(statement, parameters).await?)
    }

    /// Commit on the primary, then publish the whole body as one ordered
    /// group of events. In the sync modes a replica without room for the
    /// whole batch fails the commit with `QueueFull` before the primary
    /// commits anything.
    pub async fn commit(mut self) -> Result<(), ReplicationError> {
        if let Err(error) = self.coordinator.batch_room_check(self.buffered.len()) {
            self.finished = true;
            let _ = self.adapter.rollback().await;
            return Err(error);
        }

        self.adapter.commit().await?;
        self.finished = true;

        let buffered = std::mem::take(&mut self.buffered);
        self.coordinator.publish_batch(buffered).await
    }

    /// Roll back the primary and discard every buffered event.
    pub async fn rollback(mut self) -> Result<(), ReplicationError> {
        self.finished = true;
        self.buffered.clear();
        self.adapter.rollback().await?;
        Ok(())
    }
}

impl Drop for ReplicatedTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        warn!("transaction dropped without commit, rolling back");
        let adapter = Arc::clone(&self.adapter);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = adapter.rollback().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::replication::config::{
        CoordinatorConfig, ReplicaConfig, ReplicationMode,
    };
    use std::time::Duration;

    struct Setup {
        db: ReplicatedDatabase,
        coordinator: Arc<Coordinator>,
        primary: Arc<MemoryAdapter>,
        replica: Arc<MemoryAdapter>,
    }

    async fn setup(config: CoordinatorConfig) -> Setup {
        let coordinator = Arc::new(Coordinator::new(config));
        let primary = Arc::new(MemoryAdapter::new("primary"));
        let replica = Arc::new(MemoryAdapter::new("replica-1"));

        coordinator
            .add_replica(
                ReplicaConfig::primary("primary"),
                Arc::clone(&primary) as Arc<dyn DatabaseAdapter>,
            )
            .ok();
        coordinator
            .add_replica(
                ReplicaConfig::replica("replica-1"),
                Arc::clone(&replica) as Arc<dyn DatabaseAdapter>,
            )
            .ok();
        assert!(coordinator.start().await.is_ok());

        Setup {
            db: ReplicatedDatabase::new(Arc::clone(&coordinator)),
            coordinator,
            primary,
            replica,
        }
    }

    fn sync_config() -> CoordinatorConfig {
        CoordinatorConfig {
            mode: ReplicationMode::Synchronous,
            ack_timeout: Duration::from_secs(2),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_writes_and_reads_route_through_the_engine() {
        let s = setup(sync_config()).await;

        let affected = s
            .db
            .execute(
                "INSERT INTO t (k, v) VALUES ($1, $2)",
                &[Value::Int(1), Value::Text("a".into())],
            )
            .await;
        assert_eq!(affected.ok(), Some(1));

        let row = s
            .db
            .fetch_one("SELECT * FROM t WHERE k = $1", &[Value::Int(1)])
            .await
            .ok()
            .flatten();
        assert!(row.is_some_and(|r| r.get("v") == Some(&Value::Text("a".into()))));
        assert_eq!(s.replica.rows("t").len(), 1);

        s.coordinator.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_transaction_commit_publishes_one_ordered_group() {
        let s = setup(sync_config()).await;

        #[allow(clippy::expect_used)]
        let mut tx = s.db.begin().await.expect("begin failed");
        for k in 1..=3 {
            let affected = tx
                .execute("INSERT INTO t (k) VALUES ($1)", &[Value::Int(k)])
                .await;
            assert_eq!(affected.ok(), Some(1));
        }
        assert!(tx.commit().await.is_ok());

        let events = s.coordinator.event_log().iter_since(0);
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(s.primary.rows("t").len(), 3);
        assert_eq!(s.replica.rows("t").len(), 3);

        s.coordinator.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_rollback_replicates_nothing() {
        let s = setup(sync_config()).await;

        if let Ok(mut tx) = s.db.begin().await {
            tx.execute("INSERT INTO t (k) VALUES ($1)", &[Value::Int(1)])
                .await
                .ok();
            tx.execute("INSERT INTO t (k) VALUES ($1)", &[Value::Int(2)])
                .await
                .ok();
            assert!(tx.rollback().await.is_ok());
        }

        assert!(s.coordinator.event_log().is_empty());
        assert_eq!(s.primary.rows("t").len(), 0);
        assert_eq!(s.replica.rows("t").len(), 0);

        // The engine is fully usable afterwards.
        assert!(
            s.db
                .execute("INSERT INTO t (k) VALUES ($1)", &[Value::Int(3)])
                .await
                .is_ok()
        );

        s.coordinator.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_transaction_reads_see_buffered_writes() {
        let s = setup(sync_config()).await;

        if let Ok(mut tx) = s.db.begin().await {
            tx.execute("INSERT INTO t (k) VALUES ($1)", &[Value::Int(1)])
                .await
                .ok();

            let rows = tx.fetch_all("SELECT * FROM t", &[]).await;
            assert!(rows.is_ok_and(|rows| rows.len() == 1));
            assert!(tx.rollback().await.is_ok());
        }

        s.coordinator.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_oversized_batch_fails_commit_in_sync_mode() {
        let config = CoordinatorConfig {
            queue_capacity: 2,
            ..sync_config()
        };
        let s = setup(config).await;

        #[allow(clippy::expect_used)]
        let mut tx = s.db.begin().await.expect("begin failed");
        for k in 1..=3 {
            tx.execute("INSERT INTO t (k) VALUES ($1)", &[Value::Int(k)])
                .await
                .ok();
        }

        // Three buffered events can never fit a queue of two.
        assert!(matches!(
            tx.commit().await,
            Err(ReplicationError::QueueFull(_))
        ));

        // The primary transaction was rolled back with it.
        assert_eq!(s.primary.rows("t").len(), 0);
        assert!(s.coordinator.event_log().is_empty());

        s.coordinator.stop(Duration::from_millis(200)).await;
    }
}
