//! Defines the routes of the resizer service.
//!
//! ## Structure
//! - **Trigger**
//!   - `POST   /events` — handle an object-finalize notification
//!
//! - **Probes**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Local object store**
//!   - `PUT    /{bucket}` — create bucket
//!   - `PUT    /{bucket}/{*key}` — upload object
//!   - `GET    /{bucket}/{*key}` — download object
//!   - `HEAD   /{bucket}/{*key}` — retrieve attributes only
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        event_handlers::handle_event,
        health_handlers::{healthz, readyz},
        object_handlers::{create_bucket, get_object, head_object, upload_object},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router carrying `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(handle_event))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/{bucket}/{*key}",
            put(upload_object).get(get_object).head(head_object),
        )
        .route("/{bucket}", put(create_bucket))
}
