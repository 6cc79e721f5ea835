use crate::adapter::{DatabaseAdapter, PostgresAdapter};
use crate::cli::actions::Action;
use crate::exporter;
use crate::replication::config::{CoordinatorConfig, ReplicaConfig};
use crate::replication::coordinator::Coordinator;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build the cluster from the run action and serve until shutdown.
pub async fn handle(action: Action) -> Result<()> {
    let Action::Run {
        port,
        primary_dsn,
        replicas,
        mode,
        min_replicas_sync,
        queue_capacity,
        ack_timeout_ms,
    } = action;

    let config = CoordinatorConfig {
        mode,
        min_replicas_sync,
        queue_capacity,
        ack_timeout: Duration::from_millis(ack_timeout_ms),
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(config));

    let primary = Arc::new(PostgresAdapter::new("primary", primary_dsn));
    info!(target = %primary.display_target(), "configuring primary");
    coordinator.add_replica(
        ReplicaConfig::primary("primary"),
        primary as Arc<dyn DatabaseAdapter>,
    )?;

    for (name, dsn) in replicas {
        let adapter = Arc::new(PostgresAdapter::new(&name, dsn));
        info!(replica = %name, target = %adapter.display_target(), "configuring replica");
        coordinator.add_replica(
            ReplicaConfig::replica(&name),
            adapter as Arc<dyn DatabaseAdapter>,
        )?;
    }

    coordinator
        .start()
        .await
        .context("Failed to start the replication coordinator")?;

    exporter::serve(port, Arc::clone(&coordinator)).await?;

    // The HTTP surface is down; drain the replicas and disconnect.
    coordinator.stop(Duration::from_secs(30)).await;

    Ok(())
}
