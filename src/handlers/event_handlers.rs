//! Trigger endpoint for upload notifications.

use crate::{
    errors::AppError,
    models::event::TriggerPayload,
    services::resize_service::ResizeReport,
    state::AppState,
};
use axum::{Json, extract::State};
use tracing::info;

/// `POST /events`
///
/// Accepts either a bare `{bucket, name}` notification or a Pub/Sub push
/// envelope carrying one, and runs the resizer for it. Per-width failures
/// are reported in the body; only an unreadable source is an error status.
pub async fn handle_event(
    State(state): State<AppState>,
    Json(payload): Json<TriggerPayload>,
) -> Result<Json<ResizeReport>, AppError> {
    let event = payload.into_event()?;
    info!(bucket = %event.bucket, name = %event.name, "received storage event");

    let report = state.resizer.handle_event(&event).await?;
    Ok(Json(report))
}
