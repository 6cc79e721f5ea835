pub mod run;

use crate::replication::config::ReplicationMode;
use secrecy::SecretString;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        primary_dsn: SecretString,
        replicas: Vec<(String, SecretString)>,
        mode: ReplicationMode,
        min_replicas_sync: usize,
        queue_capacity: usize,
        ack_timeout_ms: u64,
    },
}
