//! Shared state handed to every HTTP handler.

use crate::services::{resize_service::ResizeService, storage_service::StorageService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    /// Local object store backing both the object routes and the resizer.
    pub storage: StorageService,

    /// Resize handler invoked by the trigger endpoint.
    pub resizer: Arc<ResizeService>,
}
