//! Replica manager: one adapter, one bounded queue, one worker task.
//!
//! The worker applies events strictly in queue order. Transient failures are
//! retried with linear backoff, connection loss moves the worker into an
//! exponential reconnect loop, and anything else drops the event and keeps
//! the stream going. Dropped and failed events are visible in the stats;
//! they never stop the coordinator.

use crate::adapter::DatabaseAdapter;
use crate::replication::config::{CoordinatorConfig, ReplicaConfig, ReplicaRole};
use crate::replication::error::{AdapterError, ReplicationError};
use crate::replication::event::ReplicationEvent;
use crate::replication::log::EventLog;
use crate::replication::stats::ReplicaStats;
use crate::replication::status::ReplicaStatus;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Extra time granted past the drain deadline for the worker to observe it.
const JOIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    QueueFull,
    Disabled,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Applied,
    Failed,
    TimedOut,
}

/// Published by the worker after every state change; `await_ack` watches it.
#[derive(Debug, Clone, Copy, Default)]
struct WorkerSignal {
    last_applied: u64,
    connected: bool,
}

#[derive(Clone)]
struct WorkerSettings {
    reconnect_min: Duration,
    reconnect_max: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

struct WorkerCtx {
    name: String,
    adapter: Arc<dyn DatabaseAdapter>,
    log: Arc<EventLog>,
    stats: Arc<ReplicaStats>,
    signal_tx: watch::Sender<WorkerSignal>,
    settings: WorkerSettings,
}

/// Shutdown is signalled as the drain deadline; `None` means running.
type ShutdownRx = watch::Receiver<Option<Instant>>;

pub struct ReplicaManager {
    name: String,
    role: Mutex<ReplicaRole>,
    priority: i32,
    max_lag_seconds: f64,
    enabled: AtomicBool,
    adapter: Arc<dyn DatabaseAdapter>,
    log: Arc<EventLog>,
    stats: Arc<ReplicaStats>,
    queue_capacity: usize,
    queue_tx: mpsc::Sender<Arc<ReplicationEvent>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Arc<ReplicationEvent>>>>,
    shutdown_tx: watch::Sender<Option<Instant>>,
    signal_tx: watch::Sender<WorkerSignal>,
    signal_rx: watch::Receiver<WorkerSignal>,
    settings: WorkerSettings,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaManager {
    #[must_use]
    pub fn new(
        config: &ReplicaConfig,
        adapter: Arc<dyn DatabaseAdapter>,
        log: Arc<EventLog>,
        coordinator: &CoordinatorConfig,
    ) -> Self {
        let queue_capacity = coordinator.queue_capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let (shutdown_tx, _) = watch::channel(None);
        let (signal_tx, signal_rx) = watch::channel(WorkerSignal::default());

        Self {
            name: config.name.clone(),
            role: Mutex::new(config.role),
            priority: config.priority,
            max_lag_seconds: config.max_lag_seconds,
            enabled: AtomicBool::new(config.enabled),
            adapter,
            log,
            stats: Arc::new(ReplicaStats::new()),
            queue_capacity,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown_tx,
            signal_tx,
            signal_rx,
            settings: WorkerSettings {
                reconnect_min: coordinator.reconnect_backoff_min,
                reconnect_max: coordinator.reconnect_backoff_max,
                max_retries: coordinator.max_retries,
                retry_backoff: coordinator.retry_backoff,
            },
            worker: Mutex::new(None),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect the adapter and launch the worker. Idempotent; a failed
    /// initial connect is returned but the worker still runs and retries.
    pub async fn start(&self) -> Result<(), AdapterError> {
        if Self::lock(&self.worker).is_some() {
            return Ok(());
        }
        let Some(rx) = Self::lock(&self.queue_rx).take() else {
            return Ok(());
        };

        let connect_result = self.adapter.connect().await;
        let connected = connect_result.is_ok();
        self.stats.set_connected(connected);
        let _ = self.signal_tx.send(WorkerSignal {
            last_applied: self.stats.last_applied(),
            connected,
        });

        let ctx = WorkerCtx {
            name: self.name.clone(),
            adapter: Arc::clone(&self.adapter),
            log: Arc::clone(&self.log),
            stats: Arc::clone(&self.stats),
            signal_tx: self.signal_tx.clone(),
            settings: self.settings.clone(),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        *Self::lock(&self.worker) = Some(tokio::spawn(worker_loop(ctx, rx, shutdown_rx)));

        if let Err(error) = connect_result {
            warn!(replica = %self.name, %error, "initial connect failed, worker will retry");
            return Err(error);
        }

        info!(replica = %self.name, "replica manager started");
        Ok(())
    }

    /// Stop accepting events, drain the queue up to the deadline, disconnect.
    /// Events still queued past the deadline are counted as dropped.
    pub async fn stop(&self, drain: Duration) {
        let deadline = Instant::now() + drain;
        let _ = self.shutdown_tx.send(Some(deadline));

        let handle = Self::lock(&self.worker).take();
        if let Some(handle) = handle
            && timeout_at(deadline + JOIN_GRACE, handle).await.is_err()
        {
            warn!(replica = %self.name, "worker did not stop within the drain deadline");
        }

        let _ = self.adapter.disconnect().await;
        self.stats.set_connected(false);
    }

    pub fn enqueue(&self, event: Arc<ReplicationEvent>) -> EnqueueOutcome {
        if self.shutdown_tx.borrow().is_some() {
            return EnqueueOutcome::ShuttingDown;
        }
        if !self.enabled.load(Ordering::SeqCst) {
            return EnqueueOutcome::Disabled;
        }

        match self.queue_tx.try_send(event) {
            Ok(()) => EnqueueOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::ShuttingDown,
        }
    }

    /// Block until the worker's applied watermark reaches `event_id`, the
    /// replica fails (disconnects), or the timeout elapses.
    pub async fn await_ack(&self, event_id: u64, wait: Duration) -> AckOutcome {
        if self.stats.last_applied() >= event_id {
            return AckOutcome::Applied;
        }

        let mut rx = self.signal_rx.clone();
        match timeout(
            wait,
            rx.wait_for(|s| s.last_applied >= event_id || !s.connected),
        )
        .await
        {
            Ok(Ok(signal)) => {
                if signal.last_applied >= event_id {
                    AckOutcome::Applied
                } else {
                    AckOutcome::Failed
                }
            }
            Ok(Err(_)) => AckOutcome::Failed,
            Err(_) => AckOutcome::TimedOut,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn role(&self) -> ReplicaRole {
        *Self::lock(&self.role)
    }

    pub fn set_role(&self, role: ReplicaRole) {
        *Self::lock(&self.role) = role;
    }

    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stats.is_connected()
    }

    /// Degraded means events were lost or the lag threshold is exceeded.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.stats.is_degraded() || self.stats.lag_seconds() > self.max_lag_seconds
    }

    /// Queued events, including the one the worker is currently applying.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue_capacity - self.queue_tx.capacity() + usize::from(self.stats.is_in_flight())
    }

    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[must_use]
    pub fn last_applied(&self) -> u64 {
        self.stats.last_applied()
    }

    #[must_use]
    pub fn stats(&self) -> &ReplicaStats {
        &self.stats
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    /// Coordinator-side record of events this replica never received.
    pub fn mark_dropped(&self, count: u64) {
        self.stats.record_dropped(count);
    }

    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            connected: self.is_connected(),
            enabled: self.is_enabled(),
            degraded: self.is_degraded(),
            queue_size: self.queue_len(),
            queue_capacity: self.queue_capacity,
            lag_seconds: self.stats.lag_seconds(),
            stats: self.stats.snapshot(),
        }
    }
}

fn shutdown_deadline(rx: &ShutdownRx) -> Option<Instant> {
    *rx.borrow()
}

fn publish_signal(ctx: &WorkerCtx) {
    let _ = ctx.signal_tx.send(WorkerSignal {
        last_applied: ctx.stats.last_applied(),
        connected: ctx.stats.is_connected(),
    });
}

async fn worker_loop(
    ctx: WorkerCtx,
    mut rx: mpsc::Receiver<Arc<ReplicationEvent>>,
    mut shutdown_rx: ShutdownRx,
) {
    loop {
        if let Some(deadline) = shutdown_deadline(&shutdown_rx) {
            drain(&ctx, &mut rx, deadline).await;
            break;
        }

        if !ctx.adapter.is_connected() {
            if reconnect(&ctx, &mut shutdown_rx).await {
                replay(&ctx, &shutdown_rx).await;
            }
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                // Already covered by a replay after reconnect.
                if event.event_id <= ctx.stats.last_applied() {
                    continue;
                }

                // The in-flight event may finish, but only up to the drain
                // deadline once a shutdown arrives.
                ctx.stats.set_in_flight(true);
                let mut apply_rx = shutdown_rx.clone();
                let apply = apply_event(&ctx, &event, &mut apply_rx);
                tokio::pin!(apply);
                tokio::select! {
                    _ = &mut apply => {}
                    _ = shutdown_rx.changed() => {
                        if let Some(deadline) = shutdown_deadline(&shutdown_rx)
                            && timeout_at(deadline, &mut apply).await.is_err()
                        {
                            ctx.stats.record_dropped(1);
                        }
                    }
                }
                ctx.stats.set_in_flight(false);
            }
        }
    }

    debug!(replica = %ctx.name, "worker stopped");
}

/// Apply one event with linear retry for transient errors. Returns false
/// when the connection was lost and the event must be recovered via replay.
async fn apply_event(
    ctx: &WorkerCtx,
    event: &Arc<ReplicationEvent>,
    shutdown_rx: &mut ShutdownRx,
) -> bool {
    let mut attempt: u32 = 0;

    loop {
        match ctx
            .adapter
            .execute(&event.statement, &event.parameters)
            .await
        {
            Ok(_) => {
                ctx.stats.record_applied(event);
                publish_signal(ctx);
                debug!(
                    replica = %ctx.name,
                    event_id = event.event_id,
                    table = %event.table,
                    "event applied"
                );
                return true;
            }
            Err(error) if error.is_connection_lost() => {
                warn!(
                    replica = %ctx.name,
                    event_id = event.event_id,
                    %error,
                    "connection lost while applying, reconnecting"
                );
                ctx.stats.set_connected(false);
                publish_signal(ctx);
                return false;
            }
            Err(error) if error.is_transient() && attempt < ctx.settings.max_retries => {
                attempt += 1;
                warn!(
                    replica = %ctx.name,
                    event_id = event.event_id,
                    attempt,
                    %error,
                    "transient failure, retrying"
                );
                let backoff = ctx.settings.retry_backoff * attempt;
                tokio::select! {
                    () = sleep(backoff) => {}
                    _ = shutdown_rx.changed() => {
                        ctx.stats.record_failed();
                        return true;
                    }
                }
            }
            Err(error) => {
                ctx.stats.record_failed();
                warn!(
                    replica = %ctx.name,
                    event_id = event.event_id,
                    %error,
                    "dropping event after non-retryable failure"
                );
                return true;
            }
        }
    }
}

/// Exponential backoff with ±20 % jitter until the adapter reconnects.
/// Returns false when shutdown interrupted the loop.
async fn reconnect(ctx: &WorkerCtx, shutdown_rx: &mut ShutdownRx) -> bool {
    let mut backoff = ctx.settings.reconnect_min;

    loop {
        if shutdown_deadline(shutdown_rx).is_some() {
            return false;
        }

        match ctx.adapter.connect().await {
            Ok(()) => {
                ctx.stats.set_connected(true);
                ctx.stats.record_reconnect();
                publish_signal(ctx);
                info!(replica = %ctx.name, "reconnected");
                return true;
            }
            Err(error) => {
                debug!(replica = %ctx.name, %error, backoff_ms = backoff.as_millis() as u64, "reconnect failed");
                let jittered = backoff.mul_f64(rand::thread_rng().gen_range(0.8..=1.2));
                tokio::select! {
                    () = sleep(jittered) => {}
                    _ = shutdown_rx.changed() => return false,
                }
                backoff = (backoff * 2).min(ctx.settings.reconnect_max);
            }
        }
    }
}

/// Catch up from the event log after a reconnect. A trimmed range is an
/// unrecoverable gap: the replica is marked degraded and needs a manual
/// resync, but replication of newer events continues.
async fn replay(ctx: &WorkerCtx, shutdown_rx: &ShutdownRx) {
    match ctx.log.replay_from(ctx.stats.last_applied()) {
        Err(missing_from) => {
            let gap = ReplicationError::UnrecoverableGap {
                replica: ctx.name.clone(),
                missing_from,
            };
            warn!(error = %gap, "manual resync required");
            ctx.stats.set_degraded();
        }
        Ok(events) => {
            if events.is_empty() {
                return;
            }
            info!(replica = %ctx.name, count = events.len(), "replaying events from log");

            let mut shutdown_rx = shutdown_rx.clone();
            for event in events {
                if shutdown_deadline(&shutdown_rx).is_some() {
                    return;
                }
                if event.event_id <= ctx.stats.last_applied() {
                    continue;
                }
                if !apply_event(ctx, &event, &mut shutdown_rx).await {
                    // Connection dropped again; the outer loop reconnects.
                    return;
                }
            }
        }
    }
}

/// Drain the queue until the deadline, then count what is left as dropped.
async fn drain(ctx: &WorkerCtx, rx: &mut mpsc::Receiver<Arc<ReplicationEvent>>, deadline: Instant) {
    rx.close();

    while Instant::now() < deadline && ctx.adapter.is_connected() {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                if event.event_id <= ctx.stats.last_applied() {
                    continue;
                }
                let mut shutdown_rx_stub = watch::channel(Some(deadline)).1;
                if timeout_at(deadline, apply_event(ctx, &event, &mut shutdown_rx_stub))
                    .await
                    .is_err()
                {
                    ctx.stats.record_dropped(1);
                    break;
                }
            }
            Ok(None) => return,
            Err(_) => break,
        }
    }

    let mut remaining: u64 = 0;
    while rx.try_recv().is_ok() {
        remaining += 1;
    }
    if remaining > 0 {
        warn!(replica = %ctx.name, remaining, "events dropped at shutdown");
        ctx.stats.record_dropped(remaining);
    }
}
