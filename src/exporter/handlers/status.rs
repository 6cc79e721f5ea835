use crate::replication::coordinator::Coordinator;
use axum::{extract::Extension, response::Json};
use std::sync::Arc;
use tracing::instrument;

/// The full status snapshot as JSON; this shape is a stable contract for
/// external monitoring.
#[instrument(skip(coordinator), fields(http.route="/status"))]
pub async fn status(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Json<crate::replication::status::StatusSnapshot> {
    Json(coordinator.status())
}
