//! Replication coordinator.
//!
//! Owns the primary and the replica managers. Every write goes through one
//! mutex: the primary apply, the event id assignment and the fan-out happen
//! under it, which is what makes the event order total. Acknowledgements are
//! awaited after the lock is released so slow replicas never serialize
//! unrelated writers.

use crate::adapter::DatabaseAdapter;
use crate::replication::config::{CoordinatorConfig, ReplicaConfig, ReplicaRole, ReplicationMode};
use crate::replication::error::ReplicationError;
use crate::replication::event::ReplicationEvent;
use crate::replication::log::EventLog;
use crate::replication::replica::{AckOutcome, EnqueueOutcome, ReplicaManager};
use crate::replication::stats::ReplicaStats;
use crate::replication::status::{PrimaryStatus, StatusSnapshot};
use crate::replication::value::{Row, Value};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

pub struct Coordinator {
    config: CoordinatorConfig,
    log: Arc<EventLog>,
    next_event_id: AtomicU64,
    active: AtomicBool,
    ever_started: AtomicBool,
    primary_name: RwLock<String>,
    managers: RwLock<HashMap<String, Arc<ReplicaManager>>>,
    write_lock: Arc<Mutex<()>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        let log = Arc::new(EventLog::new(
            config.event_log_capacity,
            config.event_log_max_age,
        ));

        Self {
            config,
            log,
            next_event_id: AtomicU64::new(1),
            active: AtomicBool::new(false),
            ever_started: AtomicBool::new(false),
            primary_name: RwLock::new(String::new()),
            managers: RwLock::new(HashMap::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Register a participant before `start`. Exactly one must carry the
    /// PRIMARY role.
    pub fn add_replica(
        &self,
        config: ReplicaConfig,
        adapter: Arc<dyn DatabaseAdapter>,
    ) -> Result<(), ReplicationError> {
        let mut managers = self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if managers.contains_key(&config.name) {
            return Err(ReplicationError::InvalidConfig(format!(
                "duplicate replica name '{}'",
                config.name
            )));
        }

        if config.role == ReplicaRole::Primary {
            let mut primary = self
                .primary_name
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !primary.is_empty() {
                return Err(ReplicationError::InvalidConfig(format!(
                    "'{primary}' is already the primary, cannot add '{}'",
                    config.name
                )));
            }
            primary.clone_from(&config.name);
        }

        let manager = Arc::new(ReplicaManager::new(
            &config,
            adapter,
            Arc::clone(&self.log),
            &self.config,
        ));
        managers.insert(config.name, manager);
        Ok(())
    }

    fn primary_name(&self) -> String {
        self.primary_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn manager(&self, name: &str) -> Option<Arc<ReplicaManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn primary(&self) -> Result<Arc<ReplicaManager>, ReplicationError> {
        let name = self.primary_name();
        if name.is_empty() {
            return Err(ReplicationError::InvalidConfig(
                "no primary replica configured".into(),
            ));
        }
        self.manager(&name)
            .ok_or_else(|| ReplicationError::NoSuchReplica(name))
    }

    fn all_managers(&self) -> Vec<Arc<ReplicaManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Non-primary managers, whatever their enabled state.
    fn replicas(&self) -> Vec<Arc<ReplicaManager>> {
        let primary = self.primary_name();
        let mut replicas: Vec<Arc<ReplicaManager>> = self
            .all_managers()
            .into_iter()
            .filter(|m| m.name() != primary)
            .collect();
        replicas.sort_by_key(|m| m.name().to_string());
        replicas
    }

    /// Start every manager. Fails if the primary cannot connect; replica
    /// connect failures are tolerated, their workers keep retrying.
    pub async fn start(&self) -> Result<(), ReplicationError> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let primary = self.primary()?;
        primary.start().await?;

        for replica in self.replicas() {
            if let Err(error) = replica.start().await {
                warn!(replica = %replica.name(), %error, "replica starts disconnected");
            }
        }

        self.active.store(true, Ordering::SeqCst);
        self.ever_started.store(true, Ordering::SeqCst);
        info!(
            primary = %primary.name(),
            mode = %self.config.mode,
            replicas = self.replicas().len(),
            "replication coordinator started"
        );
        Ok(())
    }

    /// Stop all managers, draining each queue up to the deadline.
    pub async fn stop(&self, drain: Duration) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        // Let any in-flight write finish before tearing the managers down.
        drop(self.write_lock.lock().await);

        join_all(self.all_managers().iter().map(|m| m.stop(drain))).await;
        info!("replication coordinator stopped");
    }

    /// A stopped coordinator rejects work differently depending on whether
    /// it ever ran: callers racing a shutdown see `ShuttingDown`.
    pub(crate) fn refusal(&self) -> ReplicationError {
        if self.ever_started.load(Ordering::SeqCst) {
            ReplicationError::ShuttingDown
        } else {
            ReplicationError::NotRunning
        }
    }

    /// Apply a write to the primary and replicate it under the configured
    /// acknowledgement mode.
    pub async fn execute(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<u64, ReplicationError> {
        self.execute_with_deadline(statement, parameters, None).await
    }

    /// `execute` with an overall deadline covering the acknowledgement wait.
    /// On expiry the primary write stands and the caller sees
    /// `ReplicationTimeout`.
    #[instrument(skip(self, statement, parameters), fields(mode = %self.config.mode))]
    pub async fn execute_with_deadline(
        &self,
        statement: &str,
        parameters: &[Value],
        deadline: Option<Duration>,
    ) -> Result<u64, ReplicationError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(self.refusal());
        }

        let guard = self.write_lock.lock().await;
        let primary = self.primary()?;

        let affected = primary.adapter().execute(statement, parameters).await?;

        let event = self.record_event(&primary, statement, parameters.to_vec());
        let (ack_targets, missed) = self.distribute(&event);
        drop(guard);

        self.await_acks(event.event_id, ack_targets, missed, deadline)
            .await?;
        Ok(affected)
    }

    /// Assign the next event id, account it on the primary and append it to
    /// the log. Must run under the write lock.
    fn record_event(
        &self,
        primary: &Arc<ReplicaManager>,
        statement: &str,
        parameters: Vec<Value>,
    ) -> Arc<ReplicationEvent> {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = Arc::new(ReplicationEvent::new_from(
            event_id,
            primary.name(),
            statement,
            parameters,
        ));

        primary.stats().record_applied(&event);
        self.log.append(Arc::clone(&event));
        debug!(event_id, table = %event.table, "event recorded");
        event
    }

    /// Enqueue the event into every enabled replica. Returns the managers to
    /// await acks from and the number of replicas that missed the event.
    fn distribute(&self, event: &Arc<ReplicationEvent>) -> (Vec<Arc<ReplicaManager>>, usize) {
        let mut ack_targets = Vec::new();
        let mut missed = 0;

        for replica in self.replicas() {
            match replica.enqueue(Arc::clone(event)) {
                EnqueueOutcome::Accepted => {
                    if replica.is_connected() {
                        ack_targets.push(replica);
                    }
                }
                EnqueueOutcome::QueueFull => {
                    replica.mark_dropped(1);
                    missed += 1;
                    warn!(
                        replica = %replica.name(),
                        event_id = event.event_id,
                        "queue full, event dropped for this replica"
                    );
                }
                EnqueueOutcome::Disabled => {}
                EnqueueOutcome::ShuttingDown => {
                    missed += 1;
                }
            }
        }

        (ack_targets, missed)
    }

    async fn await_acks(
        &self,
        event_id: u64,
        targets: Vec<Arc<ReplicaManager>>,
        missed: usize,
        deadline: Option<Duration>,
    ) -> Result<(), ReplicationError> {
        if self.config.mode == ReplicationMode::Asynchronous {
            return Ok(());
        }

        let expected = targets.len() + missed;
        let wait = self.mode_acks(event_id, targets, missed);

        match deadline {
            None => wait.await,
            Some(limit) => timeout(limit, wait).await.map_or(
                Err(ReplicationError::ReplicationTimeout { acked: 0, expected }),
                |result| result,
            ),
        }
    }

    async fn mode_acks(
        &self,
        event_id: u64,
        targets: Vec<Arc<ReplicaManager>>,
        missed: usize,
    ) -> Result<(), ReplicationError> {
        match self.config.mode {
            ReplicationMode::Asynchronous => Ok(()),
            ReplicationMode::Synchronous => {
                let expected = targets.len() + missed;
                let outcomes = join_all(
                    targets
                        .iter()
                        .map(|m| m.await_ack(event_id, self.config.ack_timeout)),
                )
                .await;

                let acked = outcomes
                    .iter()
                    .filter(|o| **o == AckOutcome::Applied)
                    .count();
                if acked == expected {
                    Ok(())
                } else {
                    Err(ReplicationError::ReplicationTimeout { acked, expected })
                }
            }
            ReplicationMode::SemiSync => {
                let required = self.config.min_replicas_sync;
                if required == 0 {
                    return Ok(());
                }

                let mut pending: FuturesUnordered<_> = targets
                    .iter()
                    .map(|m| m.await_ack(event_id, self.config.ack_timeout))
                    .collect();

                let mut acked = 0;
                while let Some(outcome) = pending.next().await {
                    if outcome == AckOutcome::Applied {
                        acked += 1;
                        if acked >= required {
                            return Ok(());
                        }
                    }
                }
                Err(ReplicationError::InsufficientReplicasAcked { acked, required })
            }
        }
    }

    /// Reads go to the primary; they observe every prior successful write.
    pub async fn fetch_one(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Option<Row>, ReplicationError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(self.refusal());
        }
        Ok(self.primary()?.adapter().fetch_one(statement, parameters).await?)
    }

    pub async fn fetch_all(
        &self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Vec<Row>, ReplicationError> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(self.refusal());
        }
        Ok(self.primary()?.adapter().fetch_all(statement, parameters).await?)
    }

    /// Read from a named replica instead of the primary. The result may lag.
    pub async fn fetch_all_on(
        &self,
        replica: &str,
        statement: &str,
        parameters: &[Value],
    ) -> Result<Vec<Row>, ReplicationError> {
        let manager = self
            .manager(replica)
            .ok_or_else(|| ReplicationError::NoSuchReplica(replica.to_string()))?;
        Ok(manager.adapter().fetch_all(statement, parameters).await?)
    }

    /// Promote a replica to primary. Writes are blocked while the target
    /// drains its queue and catches up on the full log tail; the old primary
    /// comes back as a disabled replica.
    #[instrument(skip(self))]
    pub async fn promote(&self, replica: &str) -> Result<(), ReplicationError> {
        let _guard = self.write_lock.lock().await;

        let target = self
            .manager(replica)
            .ok_or_else(|| ReplicationError::NoSuchReplica(replica.to_string()))?;
        let old_primary = self.primary()?;

        if target.name() == old_primary.name() {
            return Ok(());
        }
        if !target.is_enabled() {
            return Err(ReplicationError::ReplicaNotReady {
                name: replica.to_string(),
                reason: "replica is disabled".into(),
            });
        }
        if !target.is_connected() {
            return Err(ReplicationError::ReplicaNotReady {
                name: replica.to_string(),
                reason: "replica is not connected".into(),
            });
        }
        if target.stats().events_dropped() > 0 {
            return Err(ReplicationError::ReplicaNotReady {
                name: replica.to_string(),
                reason: "replica has dropped events and needs a resync".into(),
            });
        }

        // Catch up to the last assigned event before flipping roles, so the
        // new primary starts from the complete history.
        let last_assigned = self.next_event_id.load(Ordering::SeqCst).saturating_sub(1);
        if last_assigned > 0 {
            match target
                .await_ack(last_assigned, self.config.promotion_drain_timeout)
                .await
            {
                AckOutcome::Applied => {}
                AckOutcome::TimedOut => {
                    return Err(ReplicationError::DrainTimeout(replica.to_string()));
                }
                AckOutcome::Failed => {
                    return Err(ReplicationError::ReplicaNotReady {
                        name: replica.to_string(),
                        reason: "replica failed while draining".into(),
                    });
                }
            }
        }

        old_primary.set_role(ReplicaRole::Replica);
        old_primary.set_enabled(false);
        target.set_role(ReplicaRole::Primary);
        target.set_enabled(true);
        *self
            .primary_name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = replica.to_string();

        // The log is kept, so event ids simply continue.
        info!(
            new_primary = %replica,
            old_primary = %old_primary.name(),
            last_event_id = last_assigned,
            "promotion complete"
        );
        Ok(())
    }

    /// Liveness of the current primary's connection.
    pub async fn ping_primary(&self) -> Result<(), ReplicationError> {
        Ok(self.primary()?.adapter().ping().await?)
    }

    /// Enable or disable a replica at runtime. A disabled replica receives
    /// no events; re-enabling is how a demoted primary rejoins the cluster.
    pub fn set_replica_enabled(
        &self,
        replica: &str,
        enabled: bool,
    ) -> Result<(), ReplicationError> {
        let manager = self
            .manager(replica)
            .ok_or_else(|| ReplicationError::NoSuchReplica(replica.to_string()))?;
        manager.set_enabled(enabled);
        info!(replica = %replica, enabled, "replica toggled");
        Ok(())
    }

    /// The best replica to promote: healthy, lowest priority number, name as
    /// the tie breaker.
    #[must_use]
    pub fn promotion_candidate(&self) -> Option<String> {
        self.replicas()
            .into_iter()
            .filter(|r| r.is_enabled() && r.is_connected() && !r.is_degraded())
            .min_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then_with(|| a.name().cmp(b.name()))
            })
            .map(|r| r.name().to_string())
    }

    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let primary = self.primary().ok();
        let replicas: BTreeMap<_, _> = self
            .replicas()
            .iter()
            .map(|m| (m.name().to_string(), m.status()))
            .collect();

        let healthy_replicas = replicas
            .values()
            .filter(|r| r.connected && r.enabled && !r.degraded)
            .count();

        StatusSnapshot {
            active: self.active.load(Ordering::SeqCst),
            mode: self.config.mode,
            min_replicas_sync: self.config.min_replicas_sync,
            total_replicas: replicas.len(),
            healthy_replicas,
            primary: primary.map_or_else(
                || PrimaryStatus {
                    name: String::new(),
                    connected: false,
                    stats: ReplicaStats::new().snapshot(),
                },
                |p| PrimaryStatus {
                    name: p.name().to_string(),
                    connected: p.is_connected(),
                    stats: p.stats().snapshot(),
                },
            ),
            replicas,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The replay buffer; exposed for inspection and tooling.
    #[must_use]
    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub(crate) async fn write_guard(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.write_lock).lock_owned().await
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Room check ahead of a transactional batch publish: in the sync modes
    /// a replica that cannot take the whole batch fails the commit instead
    /// of silently dropping part of it.
    pub(crate) fn batch_room_check(&self, batch: usize) -> Result<(), ReplicationError> {
        if self.config.mode == ReplicationMode::Asynchronous {
            return Ok(());
        }

        for replica in self.replicas() {
            if !replica.is_enabled() {
                continue;
            }
            let room = replica.queue_capacity().saturating_sub(replica.queue_len());
            if room < batch {
                return Err(ReplicationError::QueueFull(replica.name().to_string()));
            }
        }
        Ok(())
    }

    /// Publish a committed transaction body as one ordered group of events.
    /// Must be called while holding the write guard.
    pub(crate) async fn publish_batch(
        &self,
        statements: Vec<(String, Vec<Value>)>,
    ) -> Result<(), ReplicationError> {
        let primary = self.primary()?;

        let mut last = None;
        let mut missed_by: HashMap<String, u64> = HashMap::new();
        for (statement, parameters) in statements {
            let event = self.record_event(&primary, &statement, parameters);
            // Once a replica's queue is full the rest of the batch is
            // dropped for that replica as well, keeping its stream gap-free
            // up to the point of loss.
            for replica in self.replicas() {
                if let Some(count) = missed_by.get_mut(replica.name()) {
                    *count += 1;
                    continue;
                }
                match replica.enqueue(Arc::clone(&event)) {
                    EnqueueOutcome::Accepted | EnqueueOutcome::Disabled => {}
                    EnqueueOutcome::QueueFull | EnqueueOutcome::ShuttingDown => {
                        missed_by.insert(replica.name().to_string(), 1);
                    }
                }
            }
            last = Some(event);
        }

        for (name, count) in &missed_by {
            if let Some(replica) = self.manager(name) {
                replica.mark_dropped(*count);
                warn!(replica = %name, dropped = count, "transaction batch partially dropped");
            }
        }

        if let Some(event) = last {
            let targets = self
                .replicas()
                .into_iter()
                .filter(|r| r.is_enabled() && r.is_connected() && !missed_by.contains_key(r.name()))
                .collect();
            self.await_acks(event.event_id, targets, missed_by.len(), None)
                .await?;
        }
        Ok(())
    }
}
