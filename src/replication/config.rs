use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Acknowledgement policy applied after a write reaches the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    Synchronous,
    SemiSync,
    Asynchronous,
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Synchronous => "synchronous",
            Self::SemiSync => "semi_sync",
            Self::Asynchronous => "asynchronous",
        };
        f.write_str(name)
    }
}

impl FromStr for ReplicationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(Self::Synchronous),
            "semi_sync" | "semi-sync" | "semisync" => Ok(Self::SemiSync),
            "asynchronous" | "async" => Ok(Self::Asynchronous),
            other => Err(format!(
                "unknown replication mode '{other}', expected synchronous, semi_sync or asynchronous"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaRole {
    Primary,
    Replica,
}

/// Static configuration of one participant. The adapter itself is handed to
/// the coordinator separately; this struct only carries replication policy.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub name: String,
    pub role: ReplicaRole,
    /// Lower values are preferred for promotion.
    pub priority: i32,
    pub enabled: bool,
    /// Lag beyond this threshold marks the replica degraded.
    pub max_lag_seconds: f64,
}

impl ReplicaConfig {
    #[must_use]
    pub fn replica(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ReplicaRole::Replica,
            priority: 10,
            enabled: true,
            max_lag_seconds: 60.0,
        }
    }

    #[must_use]
    pub fn primary(name: &str) -> Self {
        Self {
            role: ReplicaRole::Primary,
            priority: 0,
            ..Self::replica(name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub mode: ReplicationMode,
    pub min_replicas_sync: usize,
    pub queue_capacity: usize,
    pub ack_timeout: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub event_log_capacity: usize,
    pub event_log_max_age: Duration,
    pub promotion_drain_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Asynchronous,
            min_replicas_sync: 1,
            queue_capacity: 10_000,
            ack_timeout: Duration::from_millis(5_000),
            reconnect_backoff_min: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_millis(30_000),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            event_log_capacity: 100_000,
            event_log_max_age: Duration::from_secs(3_600),
            promotion_drain_timeout: Duration::from_millis(30_000),
        }
    }
}
