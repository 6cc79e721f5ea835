use crate::cli::actions::Action;
use crate::replication::config::ReplicationMode;
use anyhow::{Result, anyhow};
use secrecy::SecretString;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let mode: ReplicationMode = matches
        .get_one::<String>("mode")
        .map_or("asynchronous", String::as_str)
        .parse()
        .map_err(|e: String| anyhow!(e))?;

    let replicas = matches
        .get_many::<String>("replica")
        .map(|specs| specs.map(|s| parse_replica(s)).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();

    Ok(Action::Run {
        port: matches.get_one::<u16>("port").copied().unwrap_or(9433),
        primary_dsn: SecretString::from(
            matches
                .get_one::<String>("primary-dsn")
                .map(ToString::to_string)
                .unwrap_or_default(),
        ),
        replicas,
        mode,
        min_replicas_sync: matches
            .get_one::<usize>("min-replicas-sync")
            .copied()
            .unwrap_or(1),
        queue_capacity: matches
            .get_one::<usize>("queue-capacity")
            .copied()
            .unwrap_or(10_000),
        ack_timeout_ms: matches
            .get_one::<u64>("ack-timeout-ms")
            .copied()
            .unwrap_or(5_000),
    })
}

/// Split a `NAME=DSN` replica spec.
fn parse_replica(spec: &str) -> Result<(String, SecretString)> {
    let (name, dsn) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid replica '{spec}', expected NAME=DSN"))?;

    if name.trim().is_empty() || dsn.trim().is_empty() {
        return Err(anyhow!("invalid replica '{spec}', expected NAME=DSN"));
    }

    Ok((name.trim().to_string(), SecretString::from(dsn.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn test_handler_builds_run_action() {
        let matches = commands::new().get_matches_from(vec![
            "db_replicator",
            "--mode",
            "synchronous",
            "--replica",
            "replica-1=postgres://replica1:5432/app",
        ]);

        let action = handler(&matches);
        assert!(matches!(
            action,
            Ok(Action::Run {
                mode: ReplicationMode::Synchronous,
                ..
            })
        ));

        if let Ok(Action::Run { replicas, .. }) = action {
            assert_eq!(replicas.len(), 1);
            assert_eq!(
                replicas.first().map(|(name, _)| name.as_str()),
                Some("replica-1")
            );
        }
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        let matches = commands::new().get_matches_from(vec!["db_replicator", "--mode", "quorum"]);

        assert!(handler(&matches).is_err());
    }

    #[test]
    fn test_parse_replica() {
        assert!(parse_replica("r1=postgres://host/db").is_ok());
        assert!(parse_replica("r1").is_err());
        assert!(parse_replica("=postgres://host/db").is_err());
        assert!(parse_replica("r1=").is_err());
    }
}
