//! Per-replica counters and lag tracking.
//!
//! Counters are updated only by the owning worker (plus the coordinator for
//! drops); readers take consistent snapshots through atomics and one short
//! lock around the lag window.

use crate::replication::event::ReplicationEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Size of the sliding window used for the average apply latency.
const LAG_WINDOW: usize = 100;

#[derive(Debug, Default)]
pub struct ReplicaStats {
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    events_dropped: AtomicU64,
    reconnect_count: AtomicU64,
    last_applied_event_id: AtomicU64,
    connected: AtomicBool,
    degraded: AtomicBool,
    in_flight: AtomicBool,
    last_applied_wall: Mutex<Option<DateTime<Utc>>>,
    lag_window_ms: Mutex<VecDeque<f64>>,
}

impl ReplicaStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successfully applied event. `last_applied_event_id` only
    /// ever moves forward.
    pub fn record_applied(&self, event: &ReplicationEvent) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        self.last_applied_event_id
            .fetch_max(event.event_id, Ordering::SeqCst);

        if let Ok(mut wall) = self.last_applied_wall.lock() {
            *wall = Some(event.created_at);
        }

        let lag_ms = event.age_seconds() * 1_000.0;
        if let Ok(mut window) = self.lag_window_ms.lock() {
            if window.len() >= LAG_WINDOW {
                window.pop_front();
            }
            window.push_back(lag_ms);
        }
    }

    pub fn record_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.events_dropped.fetch_add(count, Ordering::Relaxed);
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    /// Marks the event the worker is currently applying; it counts toward
    /// the queue depth until it lands.
    pub fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_applied(&self) -> u64 {
        self.last_applied_event_id.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn average_lag_ms(&self) -> f64 {
        self.lag_window_ms.lock().map_or(0.0, |window| {
            if window.is_empty() {
                0.0
            } else {
                window.iter().sum::<f64>() / window.len() as f64
            }
        })
    }

    /// Wall-clock distance between now and the last applied event, reported
    /// as an absolute value.
    #[must_use]
    pub fn lag_seconds(&self) -> f64 {
        self.last_applied_wall
            .lock()
            .ok()
            .and_then(|wall| *wall)
            .map_or(0.0, |wall| {
                let micros = Utc::now()
                    .signed_duration_since(wall)
                    .num_microseconds()
                    .unwrap_or(0);
                (micros as f64 / 1_000_000.0).abs()
            })
    }

    #[must_use]
    pub fn snapshot(&self) -> ReplicaStatsSnapshot {
        ReplicaStatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            average_lag_ms: self.average_lag_ms(),
            last_applied_event_id: self.last_applied(),
        }
    }
}

/// Point-in-time view of the counters, part of the status contract.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatsSnapshot {
    pub events_processed: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub reconnect_count: u64,
    pub average_lag_ms: f64,
    pub last_applied_event_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::value::Value;

    fn event(id: u64) -> ReplicationEvent {
        ReplicationEvent::new_from(id, "primary", "INSERT INTO t (k) VALUES ($1)", vec![Value::Int(1)])
    }

    #[test]
    fn test_record_applied_advances_watermark() {
        let stats = ReplicaStats::new();
        stats.record_applied(&event(1));
        stats.record_applied(&event(2));

        assert_eq!(stats.last_applied(), 2);
        assert_eq!(stats.events_processed(), 2);
    }

    #[test]
    fn test_watermark_never_decreases() {
        let stats = ReplicaStats::new();
        stats.record_applied(&event(5));
        stats.record_applied(&event(3));

        assert_eq!(stats.last_applied(), 5);
    }

    #[test]
    fn test_dropped_marks_degraded() {
        let stats = ReplicaStats::new();
        assert!(!stats.is_degraded());

        stats.record_dropped(0);
        assert!(!stats.is_degraded());

        stats.record_dropped(3);
        assert!(stats.is_degraded());
        assert_eq!(stats.events_dropped(), 3);
    }

    #[test]
    fn test_average_lag_over_window() {
        let stats = ReplicaStats::new();
        assert!((stats.average_lag_ms() - 0.0).abs() < f64::EPSILON);

        for id in 1..=150 {
            stats.record_applied(&event(id));
        }

        // Window is bounded; the average stays a small positive latency.
        let avg = stats.average_lag_ms();
        assert!(avg >= 0.0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_processed, 150);
        assert_eq!(snapshot.last_applied_event_id, 150);
    }

    #[test]
    fn test_snapshot_serializes_contract_fields() {
        let stats = ReplicaStats::new();
        stats.record_applied(&event(1));
        stats.record_failed();
        stats.record_reconnect();

        let json = serde_json::to_value(stats.snapshot()).unwrap_or_default();
        for key in [
            "events_processed",
            "events_failed",
            "events_dropped",
            "reconnect_count",
            "average_lag_ms",
            "last_applied_event_id",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }
}
