//! Database adapter capability.
//!
//! The coordinator and the replica workers consume only this trait; no
//! engine-specific types leak past it. Implementations own exactly one
//! logical connection to one backing store.

use crate::replication::error::AdapterError;
use crate::replication::value::{Row, Value};
use futures::future::BoxFuture;

pub mod memory;
pub mod postgres;

pub use memory::MemoryAdapter;
pub use postgres::PostgresAdapter;

pub type AdapterResult<T> = Result<T, AdapterError>;

pub trait DatabaseAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self) -> BoxFuture<'_, AdapterResult<()>>;

    fn disconnect(&self) -> BoxFuture<'_, AdapterResult<()>>;

    fn is_connected(&self) -> bool;

    /// Cheap liveness check; fails with `ConnectionLost` on broken sockets.
    fn ping(&self) -> BoxFuture<'_, AdapterResult<()>>;

    /// Apply one statement, returning the affected row count.
    fn execute<'a>(
        &'a self,
        statement: &'a str,
        parameters: &'a [Value],
    ) -> BoxFuture<'a, AdapterResult<u64>>;

    fn fetch_one<'a>(
        &'a self,
        statement: &'a str,
        parameters: &'a [Value],
    ) -> BoxFuture<'a, AdapterResult<Option<Row>>>;

    fn fetch_all<'a>(
        &'a self,
        statement: &'a str,
        parameters: &'a [Value],
    ) -> BoxFuture<'a, AdapterResult<Vec<Row>>>;

    // Transaction scope on the underlying connection. Commit must follow a
    // begin; rollback is always safe to call.
    fn begin(&self) -> BoxFuture<'_, AdapterResult<()>>;

    fn commit(&self) -> BoxFuture<'_, AdapterResult<()>>;

    fn rollback(&self) -> BoxFuture<'_, AdapterResult<()>>;
}
