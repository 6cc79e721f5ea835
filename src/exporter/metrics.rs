//! Prometheus metrics for replication health.
//!
//! The gauges mirror the coordinator's status snapshot on every scrape, so
//! the exporter never keeps state of its own.

use crate::replication::status::StatusSnapshot;
use anyhow::Result;
use prometheus::{GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct ReplicationMetrics {
    registry: Registry,
    lag_seconds: GaugeVec,
    average_lag_ms: GaugeVec,
    queue_depth: IntGaugeVec,
    events_processed: IntGaugeVec,
    events_failed: IntGaugeVec,
    events_dropped: IntGaugeVec,
    reconnects: IntGaugeVec,
    replica_connected: IntGaugeVec,
    healthy_replicas: IntGauge,
    primary_connected: IntGauge,
}

impl ReplicationMetrics {
    /// Build and register the metric families.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lag_seconds = GaugeVec::new(
            Opts::new(
                "replication_lag_seconds",
                "Replication lag behind the primary in seconds",
            ),
            &["replica"],
        )?;
        let average_lag_ms = GaugeVec::new(
            Opts::new(
                "replication_average_apply_latency_ms",
                "Moving average of per-event apply latency in milliseconds",
            ),
            &["replica"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new(
                "replication_queue_depth",
                "Events waiting to be applied on the replica",
            ),
            &["replica"],
        )?;
        let events_processed = IntGaugeVec::new(
            Opts::new(
                "replication_events_processed_total",
                "Events applied on the replica",
            ),
            &["replica"],
        )?;
        let events_failed = IntGaugeVec::new(
            Opts::new(
                "replication_events_failed_total",
                "Events dropped after non-retryable failures",
            ),
            &["replica"],
        )?;
        let events_dropped = IntGaugeVec::new(
            Opts::new(
                "replication_events_dropped_total",
                "Events the replica never received (queue overflow or shutdown)",
            ),
            &["replica"],
        )?;
        let reconnects = IntGaugeVec::new(
            Opts::new(
                "replication_reconnects_total",
                "Successful reconnects after a lost connection",
            ),
            &["replica"],
        )?;
        let replica_connected = IntGaugeVec::new(
            Opts::new(
                "replication_replica_connected",
                "Whether the replica's adapter is connected (1) or not (0)",
            ),
            &["replica"],
        )?;
        let healthy_replicas = IntGauge::with_opts(Opts::new(
            "replication_healthy_replicas",
            "Replicas that are connected, enabled and not degraded",
        ))?;
        let primary_connected = IntGauge::with_opts(Opts::new(
            "replication_primary_connected",
            "Whether the primary's adapter is connected (1) or not (0)",
        ))?;

        registry.register(Box::new(lag_seconds.clone()))?;
        registry.register(Box::new(average_lag_ms.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(events_failed.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(replica_connected.clone()))?;
        registry.register(Box::new(healthy_replicas.clone()))?;
        registry.register(Box::new(primary_connected.clone()))?;

        Ok(Self {
            registry,
            lag_seconds,
            average_lag_ms,
            queue_depth,
            events_processed,
            events_failed,
            events_dropped,
            reconnects,
            replica_connected,
            healthy_replicas,
            primary_connected,
        })
    }

    /// Refresh every gauge from the snapshot and render the exposition text.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render(&self, snapshot: &StatusSnapshot) -> Result<String> {
        self.healthy_replicas
            .set(i64::try_from(snapshot.healthy_replicas).unwrap_or(i64::MAX));
        self.primary_connected
            .set(i64::from(snapshot.primary.connected));

        for (name, replica) in &snapshot.replicas {
            let labels = &[name.as_str()];
            self.lag_seconds
                .with_label_values(labels)
                .set(replica.lag_seconds);
            self.average_lag_ms
                .with_label_values(labels)
                .set(replica.stats.average_lag_ms);
            self.queue_depth
                .with_label_values(labels)
                .set(i64::try_from(replica.queue_size).unwrap_or(i64::MAX));
            self.events_processed
                .with_label_values(labels)
                .set(i64::try_from(replica.stats.events_processed).unwrap_or(i64::MAX));
            self.events_failed
                .with_label_values(labels)
                .set(i64::try_from(replica.stats.events_failed).unwrap_or(i64::MAX));
            self.events_dropped
                .with_label_values(labels)
                .set(i64::try_from(replica.stats.events_dropped).unwrap_or(i64::MAX));
            self.reconnects
                .with_label_values(labels)
                .set(i64::try_from(replica.stats.reconnect_count).unwrap_or(i64::MAX));
            self.replica_connected
                .with_label_values(labels)
                .set(i64::from(replica.connected));
        }

        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::config::ReplicationMode;
    use crate::replication::stats::ReplicaStatsSnapshot;
    use crate::replication::status::{PrimaryStatus, ReplicaStatus};
    use std::collections::BTreeMap;

    fn snapshot() -> StatusSnapshot {
        let stats = ReplicaStatsSnapshot {
            events_processed: 42,
            events_failed: 1,
            events_dropped: 2,
            reconnect_count: 3,
            average_lag_ms: 0.8,
            last_applied_event_id: 42,
        };

        let mut replicas = BTreeMap::new();
        replicas.insert(
            "replica-1".to_string(),
            ReplicaStatus {
                connected: true,
                enabled: true,
                degraded: false,
                queue_size: 5,
                queue_capacity: 10_000,
                lag_seconds: 0.25,
                stats: stats.clone(),
            },
        );

        StatusSnapshot {
            active: true,
            mode: ReplicationMode::Asynchronous,
            min_replicas_sync: 1,
            total_replicas: 1,
            healthy_replicas: 1,
            primary: PrimaryStatus {
                name: "primary".to_string(),
                connected: true,
                stats,
            },
            replicas,
        }
    }

    #[test]
    fn test_metrics_register_without_error() {
        assert!(ReplicationMetrics::new().is_ok());
    }

    #[test]
    fn test_render_exposes_replica_families() {
        let Ok(metrics) = ReplicationMetrics::new() else {
            return;
        };

        let output = metrics.render(&snapshot()).unwrap_or_default();
        assert!(output.contains("replication_lag_seconds"));
        assert!(output.contains("replication_events_processed_total"));
        assert!(output.contains("replica=\"replica-1\""));
        assert!(output.contains("replication_healthy_replicas 1"));
        assert!(output.contains("replication_primary_connected 1"));
    }
}
