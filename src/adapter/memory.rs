//! In-memory adapter.
//!
//! Backs tests and local demos without a database server. Statement handling
//! is shallow on purpose: enough of INSERT/UPDATE/DELETE/SELECT is
//! interpreted to observe replicated state, everything else is journaled and
//! reported as zero affected rows. Fault injection knobs simulate slow,
//! failing and disconnected stores.

use crate::adapter::{AdapterResult, DatabaseAdapter};
use crate::replication::error::AdapterError;
use crate::replication::value::{Row, Value};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*insert\s+into\s+([A-Za-z_][A-Za-z0-9_.]*)\s*\(([^)]*)\)\s*values\s*\((.*)\)\s*$")
        .expect("insert pattern is valid")
});

static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*update\s+([A-Za-z_][A-Za-z0-9_.]*)\s+set\s+(.*?)(?:\s+where\s+(.*))?\s*$")
        .expect("update pattern is valid")
});

static DELETE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*delete\s+from\s+([A-Za-z_][A-Za-z0-9_.]*)(?:\s+where\s+(.*))?\s*$")
        .expect("delete pattern is valid")
});

static SELECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*select\s+.*?\s+from\s+([A-Za-z_][A-Za-z0-9_.]*)(?:\s+where\s+(.*))?\s*$")
        .expect("select pattern is valid")
});

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Vec<Row>>,
    journal: Vec<(String, Vec<Value>)>,
    tx_snapshot: Option<HashMap<String, Vec<Row>>>,
}

pub struct MemoryAdapter {
    name: String,
    store: Mutex<Store>,
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    apply_delay: Mutex<Duration>,
    fail_queue: Mutex<VecDeque<AdapterError>>,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            store: Mutex::new(Store::default()),
            connected: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            apply_delay: Mutex::new(Duration::ZERO),
            fail_queue: Mutex::new(VecDeque::new()),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rows currently held for a table, in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.store().tables.get(table).cloned().unwrap_or_default()
    }

    /// Every executed statement with its parameters, in apply order.
    #[must_use]
    pub fn journal(&self) -> Vec<(String, Vec<Value>)> {
        self.store().journal.clone()
    }

    /// Sever the connection and refuse reconnects until [`Self::restore`].
    pub fn kill_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.refuse_connect.store(true, Ordering::SeqCst);
    }

    /// Allow reconnects again after [`Self::kill_connection`].
    pub fn restore(&self) {
        self.refuse_connect.store(false, Ordering::SeqCst);
    }

    /// Delay every subsequent `execute` by the given duration.
    pub fn set_apply_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.apply_delay.lock() {
            *guard = delay;
        }
    }

    /// Make the next `execute` calls fail with the queued errors, in order.
    pub fn fail_next(&self, error: AdapterError) {
        if let Ok(mut guard) = self.fail_queue.lock() {
            guard.push_back(error);
        }
    }

    fn current_delay(&self) -> Duration {
        self.apply_delay
            .lock()
            .map_or(Duration::ZERO, |guard| *guard)
    }

    fn check_connected(&self) -> AdapterResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::ConnectionLost(format!(
                "{} is not connected",
                self.name
            )))
        }
    }

    fn take_injected_failure(&self) -> Option<AdapterError> {
        self.fail_queue
            .lock()
            .ok()
            .and_then(|mut guard| guard.pop_front())
    }

    fn apply(&self, statement: &str, parameters: &[Value]) -> u64 {
        let mut store = self.store();
        store
            .journal
            .push((statement.to_string(), parameters.to_vec()));

        if let Some(caps) = INSERT_RE.captures(statement) {
            let table = capture(&caps, 1);
            let columns: Vec<String> = capture(&caps, 2)
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let mut positional = 0;
            let values: Vec<Value> = capture(&caps, 3)
                .split(',')
                .map(|token| resolve_token(token.trim(), parameters, &mut positional))
                .collect();

            let mut row = Row::new();
            for (i, column) in columns.iter().enumerate() {
                row.insert(
                    column.clone(),
                    values.get(i).cloned().unwrap_or(Value::Null),
                );
            }
            store.tables.entry(table).or_default().push(row);
            return 1;
        }

        if let Some(caps) = UPDATE_RE.captures(statement) {
            let table = capture(&caps, 1);
            let mut positional = 0;
            let assignments: Vec<(String, Value)> = capture(&caps, 2)
                .split(',')
                .filter_map(|pair| parse_equality(pair, parameters, &mut positional))
                .collect();
            let condition = caps
                .get(3)
                .and_then(|m| parse_equality(m.as_str(), parameters, &mut positional));

            let mut affected = 0;
            if let Some(rows) = store.tables.get_mut(&table) {
                for row in rows.iter_mut().filter(|row| matches_condition(row, condition.as_ref())) {
                    for (column, value) in &assignments {
                        row.insert(column.clone(), value.clone());
                    }
                    affected += 1;
                }
            }
            return affected;
        }

        if let Some(caps) = DELETE_RE.captures(statement) {
            let table = capture(&caps, 1);
            let mut positional = 0;
            let condition = caps
                .get(2)
                .and_then(|m| parse_equality(m.as_str(), parameters, &mut positional));

            if let Some(rows) = store.tables.get_mut(&table) {
                let before = rows.len();
                rows.retain(|row| !matches_condition(row, condition.as_ref()));
                return (before - rows.len()) as u64;
            }
            return 0;
        }

        // DDL and anything unclassifiable: journaled, nothing to mutate.
        0
    }

    fn query(&self, statement: &str, parameters: &[Value]) -> Vec<Row> {
        let store = self.store();
        SELECT_RE.captures(statement).map_or_else(Vec::new, |caps| {
            let table = capture(&caps, 1);
            let mut positional = 0;
            let condition = caps
                .get(2)
                .and_then(|m| parse_equality(m.as_str(), parameters, &mut positional));

            store
                .tables
                .get(&table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| matches_condition(row, condition.as_ref()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }
}

fn capture(caps: &regex::Captures<'_>, index: usize) -> String {
    caps.get(index).map_or(String::new(), |m| m.as_str().to_string())
}

/// Resolve one token of a VALUES list or equality right-hand side: `$n` and
/// `?` markers bind parameters, everything else is treated as a literal.
fn resolve_token(token: &str, parameters: &[Value], positional: &mut usize) -> Value {
    if let Some(index) = token.strip_prefix('$').and_then(|n| n.parse::<usize>().ok()) {
        return index
            .checked_sub(1)
            .and_then(|i| parameters.get(i))
            .cloned()
            .unwrap_or(Value::Null);
    }

    if token == "?" {
        let value = parameters.get(*positional).cloned().unwrap_or(Value::Null);
        *positional += 1;
        return value;
    }

    if token.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if token.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if token.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(f) = token.parse::<f64>() {
        return Value::Float(f);
    }

    Value::Text(token.trim_matches('\'').to_string())
}

fn parse_equality(
    clause: &str,
    parameters: &[Value],
    positional: &mut usize,
) -> Option<(String, Value)> {
    let (column, rhs) = clause.split_once('=')?;
    Some((
        column.trim().to_string(),
        resolve_token(rhs.trim(), parameters, positional),
    ))
}

fn matches_condition(row: &Row, condition: Option<&(String, Value)>) -> bool {
    condition.is_none_or(|(column, value)| row.get(column) == Some(value))
}

impl DatabaseAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> BoxFuture<'_, AdapterResult<()>> {
        Box::pin(async move {
            if self.refuse_connect.load(Ordering::SeqCst) {
                return Err(AdapterError::ConnectionLost(format!(
                    "{} refused the connection",
                    self.name
                )));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, AdapterResult<()>> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ping(&self) -> BoxFuture<'_, AdapterResult<()>> {
        Box::pin(async move { self.check_connected() })
    }

    fn execute<'a>(
        &'a self,
        statement: &'a str,
        parameters: &'a [Value],
    ) -> BoxFuture<'a, AdapterResult<u64>> {
        Box::pin(async move {
            let delay = self.current_delay();
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            self.check_connected()?;
            if let Some(error) = self.take_injected_failure() {
                return Err(error);
            }

            Ok(self.apply(statement, parameters))
        })
    }

    fn fetch_one<'a>(
        &'a self,
        statement: &'a str,
        parameters: &'a [Value],
    ) -> BoxFuture<'a, AdapterResult<Option<Row>>> {
        Box::pin(async move {
            self.check_connected()?;
            Ok(self.query(statement, parameters).into_iter().next())
        })
    }

    fn fetch_all<'a>(
        &'a self,
        statement: &'a str,
        parameters: &'a [Value],
    ) -> BoxFuture<'a, AdapterResult<Vec<Row>>> {
        Box::pin(async move {
            self.check_connected()?;
            Ok(self.query(statement, parameters))
        })
    }

    fn begin(&self) -> BoxFuture<'_, AdapterResult<()>> {
        Box::pin(async move {
            self.check_connected()?;
            let mut store = self.store();
            store.tx_snapshot = Some(store.tables.clone());
            Ok(())
        })
    }

    fn commit(&self) -> BoxFuture<'_, AdapterResult<()>> {
        Box::pin(async move {
            self.check_connected()?;
            self.store().tx_snapshot = None;
            Ok(())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, AdapterResult<()>> {
        Box::pin(async move {
            let mut store = self.store();
            if let Some(snapshot) = store.tx_snapshot.take() {
                store.tables = snapshot;
            }
            Ok(())
        })
    }
}
