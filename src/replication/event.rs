//! Replication events: one immutable record per write applied on the primary.
//!
//! Classification is intentionally shallow. The leading keyword of the
//! trimmed statement decides the kind and a single regex pulls out the table
//! name; anything the heuristic cannot place is `Execute` with an empty
//! table, which downstream code must tolerate.

use crate::replication::value::Value;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::time::Instant;

static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:insert\s+into|update|delete\s+from|from)\s+([A-Za-z_][A-Za-z0-9_.]*)")
        .expect("table pattern is valid")
});

static WHERE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bwhere\s+([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(\$\d+|\?)")
        .expect("where pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Execute,
    Ddl,
}

impl EventKind {
    /// Classify a statement from its leading keyword, case-insensitively.
    /// SELECT maps to `Execute`; CREATE/ALTER/DROP are advisory DDL.
    #[must_use]
    pub fn classify(statement: &str) -> Self {
        let keyword = statement.trim_start().split_whitespace().next().unwrap_or("");

        if keyword.eq_ignore_ascii_case("insert") {
            Self::Insert
        } else if keyword.eq_ignore_ascii_case("update") {
            Self::Update
        } else if keyword.eq_ignore_ascii_case("delete") {
            Self::Delete
        } else if keyword.eq_ignore_ascii_case("create")
            || keyword.eq_ignore_ascii_case("alter")
            || keyword.eq_ignore_ascii_case("drop")
        {
            Self::Ddl
        } else {
            Self::Execute
        }
    }
}

/// Immutable record of one write applied on the primary. Events form a total
/// order by `event_id`; ids are never reused and events are never mutated
/// after creation.
#[derive(Debug, Clone)]
pub struct ReplicationEvent {
    pub event_id: u64,
    /// Wall-clock creation time on the primary.
    pub created_at: DateTime<Utc>,
    /// Monotonic creation time, used for lag measurement.
    pub created_mono: Instant,
    pub kind: EventKind,
    /// Table the statement touches, when the heuristic can tell. May be empty.
    pub table: String,
    /// Query text exactly as applied to the primary, parameter markers intact.
    pub statement: String,
    pub parameters: Vec<Value>,
    /// Best-effort identifier of the affected row(s).
    pub primary_key: Option<String>,
    pub origin_replica: String,
}

impl ReplicationEvent {
    #[must_use]
    pub fn new_from(
        event_id: u64,
        origin_replica: &str,
        statement: &str,
        parameters: Vec<Value>,
    ) -> Self {
        let kind = EventKind::classify(statement);

        Self {
            event_id,
            created_at: Utc::now(),
            created_mono: Instant::now(),
            kind,
            table: extract_table(statement).unwrap_or_default(),
            statement: statement.to_string(),
            parameters,
            primary_key: extract_primary_key(statement, kind),
            origin_replica: origin_replica.to_string(),
        }
    }

    /// Seconds elapsed since this event was created on the primary.
    #[must_use]
    pub fn age_seconds(&self) -> f64 {
        self.created_mono.elapsed().as_secs_f64()
    }
}

fn extract_table(statement: &str) -> Option<String> {
    TABLE_RE
        .captures(statement)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Pull `col=marker` out of a simple WHERE equality. Only meaningful for
/// UPDATE and DELETE; DDL never carries a primary key.
fn extract_primary_key(statement: &str, kind: EventKind) -> Option<String> {
    if !matches!(kind, EventKind::Update | EventKind::Delete) {
        return None;
    }

    WHERE_KEY_RE.captures(statement).and_then(|c| {
        let column = c.get(1)?.as_str();
        let marker = c.get(2)?.as_str();
        Some(format!("{column}={marker}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_leading_keyword() {
        assert_eq!(EventKind::classify("INSERT INTO t VALUES (1)"), EventKind::Insert);
        assert_eq!(EventKind::classify("update t set a = 1"), EventKind::Update);
        assert_eq!(EventKind::classify("  DeLeTe FROM t"), EventKind::Delete);
        assert_eq!(EventKind::classify("SELECT * FROM t"), EventKind::Execute);
    }

    #[test]
    fn test_classify_ddl() {
        assert_eq!(EventKind::classify("CREATE TABLE t (id int)"), EventKind::Ddl);
        assert_eq!(EventKind::classify("alter table t add c int"), EventKind::Ddl);
        assert_eq!(EventKind::classify("DROP INDEX idx"), EventKind::Ddl);
    }

    #[test]
    fn test_classify_unknown_is_execute() {
        assert_eq!(EventKind::classify("VACUUM FULL"), EventKind::Execute);
        assert_eq!(EventKind::classify(""), EventKind::Execute);
        assert_eq!(EventKind::classify("   "), EventKind::Execute);
    }

    #[test]
    fn test_table_extraction() {
        let ev = ReplicationEvent::new_from(1, "primary", "INSERT INTO users (a) VALUES ($1)", vec![]);
        assert_eq!(ev.table, "users");

        let ev = ReplicationEvent::new_from(2, "primary", "UPDATE public.users SET a = $1", vec![]);
        assert_eq!(ev.table, "public.users");

        let ev = ReplicationEvent::new_from(3, "primary", "DELETE FROM t WHERE id = $1", vec![]);
        assert_eq!(ev.table, "t");
    }

    #[test]
    fn test_table_may_be_empty() {
        let ev = ReplicationEvent::new_from(1, "primary", "VACUUM", vec![]);
        assert_eq!(ev.table, "");
        assert_eq!(ev.kind, EventKind::Execute);
    }

    #[test]
    fn test_primary_key_extraction() {
        let ev = ReplicationEvent::new_from(1, "primary", "UPDATE t SET v = $1 WHERE id = $2", vec![]);
        assert_eq!(ev.primary_key.as_deref(), Some("id=$2"));

        let ev = ReplicationEvent::new_from(2, "primary", "DELETE FROM t WHERE k = ?", vec![]);
        assert_eq!(ev.primary_key.as_deref(), Some("k=?"));
    }

    #[test]
    fn test_no_primary_key_for_insert_or_ddl() {
        let ev = ReplicationEvent::new_from(1, "primary", "INSERT INTO t (id) VALUES ($1)", vec![]);
        assert_eq!(ev.primary_key, None);

        let ev = ReplicationEvent::new_from(2, "primary", "DROP TABLE t", vec![]);
        assert_eq!(ev.kind, EventKind::Ddl);
        assert_eq!(ev.primary_key, None);
    }

    #[test]
    fn test_statement_kept_verbatim() {
        let statement = "INSERT INTO t (k, v) VALUES ($1, $2)";
        let ev = ReplicationEvent::new_from(
            9,
            "primary",
            statement,
            vec![Value::Int(1), Value::Text("a".into())],
        );

        assert_eq!(ev.statement, statement);
        assert_eq!(ev.event_id, 9);
        assert_eq!(ev.origin_replica, "primary");
        assert_eq!(ev.parameters.len(), 2);
    }
}
