//! Status snapshot: the stable JSON contract consumed by external monitoring.

use crate::replication::config::ReplicationMode;
use crate::replication::stats::ReplicaStatsSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub connected: bool,
    pub enabled: bool,
    pub degraded: bool,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub lag_seconds: f64,
    pub stats: ReplicaStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryStatus {
    pub name: String,
    pub connected: bool,
    pub stats: ReplicaStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub active: bool,
    pub mode: ReplicationMode,
    pub min_replicas_sync: usize,
    pub total_replicas: usize,
    pub healthy_replicas: usize,
    pub primary: PrimaryStatus,
    /// Keyed by replica name; the primary is not listed here.
    pub replicas: BTreeMap<String, ReplicaStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> ReplicaStatsSnapshot {
        ReplicaStatsSnapshot {
            events_processed: 10,
            events_failed: 1,
            events_dropped: 0,
            reconnect_count: 2,
            average_lag_ms: 1.5,
            last_applied_event_id: 10,
        }
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut replicas = BTreeMap::new();
        replicas.insert(
            "replica-1".to_string(),
            ReplicaStatus {
                connected: true,
                enabled: true,
                degraded: false,
                queue_size: 0,
                queue_capacity: 10_000,
                lag_seconds: 0.2,
                stats: stats(),
            },
        );

        let snapshot = StatusSnapshot {
            active: true,
            mode: ReplicationMode::SemiSync,
            min_replicas_sync: 1,
            total_replicas: 1,
            healthy_replicas: 1,
            primary: PrimaryStatus {
                name: "primary".to_string(),
                connected: true,
                stats: stats(),
            },
            replicas,
        };

        let json = serde_json::to_value(&snapshot).unwrap_or_default();

        assert_eq!(json.get("mode").and_then(|v| v.as_str()), Some("semi_sync"));
        assert_eq!(json.get("active").and_then(serde_json::Value::as_bool), Some(true));
        assert_eq!(
            json.pointer("/primary/name").and_then(|v| v.as_str()),
            Some("primary")
        );
        for key in [
            "connected",
            "enabled",
            "degraded",
            "queue_size",
            "queue_capacity",
            "lag_seconds",
            "stats",
        ] {
            assert!(
                json.pointer(&format!("/replicas/replica-1/{key}")).is_some(),
                "missing key {key}"
            );
        }
        assert_eq!(
            json.pointer("/replicas/replica-1/stats/last_applied_event_id")
                .and_then(serde_json::Value::as_u64),
            Some(10)
        );
    }
}
