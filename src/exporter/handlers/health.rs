use crate::exporter::GIT_COMMIT_HASH;
use crate::replication::coordinator::Coordinator;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Liveness of the whole cluster: the primary decides the status code,
/// replica problems only show up in the counts.
#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    name: String,
    version: String,
    primary: String,
    healthy_replicas: usize,
    total_replicas: usize,
}

impl Health {
    fn from_cluster(primary_ok: bool, healthy_replicas: usize, total_replicas: usize) -> Self {
        Self {
            commit: GIT_COMMIT_HASH.map(ToString::to_string),
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            primary: if primary_ok { "ok" } else { "error" }.to_string(),
            healthy_replicas,
            total_replicas,
        }
    }

    /// One-line summary for load balancers that only look at headers:
    /// `primary=ok replicas=2/3`.
    fn summary_header(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let summary = format!(
            "primary={} replicas={}/{}",
            self.primary, self.healthy_replicas, self.total_replicas
        );
        if let Ok(value) = HeaderValue::from_str(&summary) {
            headers.insert("X-Replication-Health", value);
        }
        headers
    }
}

// Main axum handler for health
#[instrument(skip(coordinator), fields(http.route="/health"))]
pub async fn health(
    method: Method,
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> impl IntoResponse {
    let snapshot = coordinator.status();
    let primary_ok = match coordinator.ping_primary().await {
        Ok(()) => true,
        Err(error) => {
            error!(%error, "Failed to ping the primary");
            false
        }
    };

    let health = Health::from_cluster(
        primary_ok,
        snapshot.healthy_replicas,
        snapshot.total_replicas,
    );
    let headers = health.summary_header();

    let status_code = if primary_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    // OPTIONS probes get the verdict without the payload.
    let body = if method == Method::GET {
        Json(&health).into_response().into_body()
    } else {
        Body::empty()
    };

    debug!(
        primary = %health.primary,
        healthy = health.healthy_replicas,
        total = health.total_replicas,
        "health checked"
    );
    (status_code, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serialization_includes_cluster_counts() {
        let health = Health {
            commit: Some("abc123".to_string()),
            name: "db_replicator".to_string(),
            version: "1.0.0".to_string(),
            primary: "ok".to_string(),
            healthy_replicas: 2,
            total_replicas: 3,
        };

        let json = serde_json::to_string(&health).unwrap_or_default();
        assert!(json.contains("abc123"));
        assert!(json.contains("\"healthy_replicas\":2"));
        assert!(json.contains("\"total_replicas\":3"));
        assert!(json.contains("\"primary\":\"ok\""));
    }

    #[test]
    fn test_health_serialization_omits_missing_commit() {
        let health = Health::from_cluster(false, 0, 1);

        let json = serde_json::to_string(&health).unwrap_or_default();
        // commit may be absent depending on build context, but primary
        // status and counts are always there
        assert!(json.contains("\"primary\":\"error\""));
        assert!(json.contains("\"total_replicas\":1"));
    }

    #[test]
    fn test_from_cluster_maps_primary_state() {
        assert_eq!(Health::from_cluster(true, 1, 1).primary, "ok");
        assert_eq!(Health::from_cluster(false, 1, 1).primary, "error");
        assert_eq!(
            Health::from_cluster(true, 0, 0).name,
            env!("CARGO_PKG_NAME")
        );
    }

    #[test]
    fn test_summary_header_shape() {
        let health = Health::from_cluster(true, 2, 3);

        let headers = health.summary_header();
        let value = headers
            .get("X-Replication-Health")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert_eq!(value, "primary=ok replicas=2/3");
    }

    #[test]
    fn test_summary_header_reports_unhealthy_primary() {
        let health = Health::from_cluster(false, 0, 2);

        let headers = health.summary_header();
        let value = headers
            .get("X-Replication-Health")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert_eq!(value, "primary=error replicas=0/2");
    }

    #[test]
    fn test_deserializes_without_commit() {
        let json = r#"{
            "name": "db_replicator",
            "version": "2.0.0",
            "primary": "ok",
            "healthy_replicas": 1,
            "total_replicas": 1
        }"#;

        let health: Result<Health, _> = serde_json::from_str(json);
        assert!(health.as_ref().is_ok_and(|h| h.commit.is_none()));
        assert!(health.is_ok_and(|h| h.primary == "ok"));
    }
}
