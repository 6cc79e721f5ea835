use crate::exporter::metrics::ReplicationMetrics;
use crate::replication::coordinator::Coordinator;
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, error, instrument};

#[instrument(skip(coordinator, metrics), fields(http.route="/metrics"))]
pub async fn metrics(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Extension(metrics): Extension<Arc<ReplicationMetrics>>,
) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );

    match metrics.render(&coordinator.status()) {
        Ok(body) => {
            debug!("Successfully rendered metrics");
            (StatusCode::OK, headers, body)
        }
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("Error rendering metrics: {e}"),
            )
        }
    }
}
