//! Bounded in-memory event log.
//!
//! The log is a best-effort replay buffer, not a write-ahead log. Workers
//! replay from it after a reconnect; once retention trims an event away, any
//! replica still needing it has an unrecoverable gap.

use crate::replication::event::ReplicationEvent;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

pub struct EventLog {
    inner: Mutex<LogInner>,
    capacity: usize,
    max_age: Duration,
}

struct LogInner {
    events: VecDeque<Arc<ReplicationEvent>>,
    /// Highest event id ever trimmed. Replay below this point is impossible.
    trimmed_through: u64,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                events: VecDeque::new(),
                trimmed_through: 0,
            }),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Append one event, trimming the oldest entries past capacity or age.
    pub fn append(&self, event: Arc<ReplicationEvent>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        while inner.events.len() >= self.capacity {
            if let Some(old) = inner.events.pop_front() {
                inner.trimmed_through = inner.trimmed_through.max(old.event_id);
            }
        }
        inner.events.push_back(event);

        let max_age = self.max_age;
        while inner
            .events
            .front()
            .is_some_and(|e| e.created_mono.elapsed() > max_age)
        {
            if let Some(old) = inner.events.pop_front() {
                inner.trimmed_through = inner.trimmed_through.max(old.event_id);
            }
        }
    }

    /// All retained events with `event_id` strictly greater than the given id.
    #[must_use]
    pub fn iter_since(&self, event_id: u64) -> Vec<Arc<ReplicationEvent>> {
        self.inner.lock().map_or_else(
            |_| Vec::new(),
            |inner| {
                inner
                    .events
                    .iter()
                    .filter(|e| e.event_id > event_id)
                    .cloned()
                    .collect()
            },
        )
    }

    /// Drop every event with `event_id` below the given minimum.
    pub fn trim_to(&self, min_event_id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        while inner
            .events
            .front()
            .is_some_and(|e| e.event_id < min_event_id)
        {
            if let Some(old) = inner.events.pop_front() {
                inner.trimmed_through = inner.trimmed_through.max(old.event_id);
            }
        }
    }

    /// Events a replica at `last_applied` needs to catch up, or the first
    /// missing id if retention has already discarded part of that range.
    pub fn replay_from(&self, last_applied: u64) -> Result<Vec<Arc<ReplicationEvent>>, u64> {
        let Ok(inner) = self.inner.lock() else {
            return Ok(Vec::new());
        };

        if inner.trimmed_through > last_applied {
            return Err(last_applied + 1);
        }

        Ok(inner
            .events
            .iter()
            .filter(|e| e.event_id > last_applied)
            .cloned()
            .collect())
    }

    #[must_use]
    pub fn earliest_id(&self) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.events.front().map(|e| e.event_id))
    }

    #[must_use]
    pub fn latest_id(&self) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.events.back().map(|e| e.event_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.events.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64) -> Arc<ReplicationEvent> {
        Arc::new(ReplicationEvent::new_from(
            id,
            "primary",
            "INSERT INTO t (k) VALUES ($1)",
            vec![],
        ))
    }

    fn log_with(capacity: usize, ids: &[u64]) -> EventLog {
        let log = EventLog::new(capacity, Duration::from_secs(3600));
        for &id in ids {
            log.append(event(id));
        }
        log
    }

    #[test]
    fn test_append_and_iter_since() {
        let log = log_with(10, &[1, 2, 3, 4]);

        let tail: Vec<u64> = log.iter_since(2).iter().map(|e| e.event_id).collect();
        assert_eq!(tail, vec![3, 4]);
        assert!(log.iter_since(4).is_empty());
    }

    #[test]
    fn test_capacity_trims_oldest_first() {
        let log = log_with(3, &[1, 2, 3, 4, 5]);

        assert_eq!(log.len(), 3);
        assert_eq!(log.earliest_id(), Some(3));
        assert_eq!(log.latest_id(), Some(5));
    }

    #[test]
    fn test_trim_to() {
        let log = log_with(10, &[1, 2, 3, 4]);
        log.trim_to(3);

        assert_eq!(log.earliest_id(), Some(3));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_replay_from_complete_range() {
        let log = log_with(10, &[1, 2, 3]);

        let replay = log.replay_from(1).map(|events| {
            events.iter().map(|e| e.event_id).collect::<Vec<u64>>()
        });
        assert_eq!(replay, Ok(vec![2, 3]));
    }

    #[test]
    fn test_replay_reports_gap_after_trim() {
        let log = log_with(2, &[1, 2, 3, 4]);

        // Events 1 and 2 were trimmed; a replica at 1 can no longer catch up.
        assert_eq!(log.replay_from(1).err(), Some(2));
        // A replica at 2 only needs 3 and 4, which are retained.
        assert!(log.replay_from(2).is_ok());
    }

    #[test]
    fn test_age_based_trim() {
        let log = EventLog::new(10, Duration::from_millis(0));
        log.append(event(1));
        log.append(event(2));

        // With a zero max age every prior entry is expired on append.
        assert!(log.len() <= 1);
        assert_eq!(log.replay_from(0).err(), Some(1));
    }

    #[test]
    fn test_empty_log() {
        let log = EventLog::new(5, Duration::from_secs(3600));
        assert!(log.is_empty());
        assert_eq!(log.earliest_id(), None);
        assert_eq!(log.latest_id(), None);
        assert!(log.replay_from(0).is_ok_and(|events| events.is_empty()));
    }
}
