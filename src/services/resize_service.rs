//! ResizeService handles one storage event at a time.
//!
//! For an eligible image, every width of the size catalog gets its own fresh
//! source reader, its own derived destination and its own transform run.
//! Failures are isolated per width; only failing to read the source's
//! attributes fails the invocation.

use crate::{
    models::{
        event::StorageEvent,
        metadata::resized_marker,
        sizes::SizeCatalog,
    },
    services::{
        guard::{self, Eligibility, SkipReason},
        naming,
        object_store::{ObjectReader, ObjectStore, StorageError},
        transform::{TransformError, Transformer},
    },
};
use serde::Serialize;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSide {
    Read,
    Write,
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSide::Read => f.write_str("read"),
            StreamSide::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("failed to fetch attributes of {bucket}/{name}: {source}")]
    AttributeFetch {
        bucket: String,
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("`{0}` already carries a resize suffix")]
    AlreadyResized(String),
    #[error("failed to open {side} stream for {bucket}/{name}: {source}")]
    StreamOpen {
        side: StreamSide,
        bucket: String,
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("resize to width {width} failed: {source}")]
    Transform {
        width: u32,
        #[source]
        source: TransformError,
    },
    #[error("failed to store {bucket}/{name}: {source}")]
    Commit {
        bucket: String,
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("failed to label {bucket}/{name} as resized: {source}")]
    MetadataUpdate {
        bucket: String,
        name: String,
        #[source]
        source: StorageError,
    },
}

/// What happened to one width of the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WidthOutcome {
    Created {
        width: u32,
        object: String,
        labeled: bool,
    },
    Skipped {
        width: u32,
        reason: String,
    },
    Failed {
        width: u32,
        error: String,
    },
}

/// Result of a successful invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResizeReport {
    Skipped { reason: SkipReason },
    Processed { widths: Vec<WidthOutcome> },
}

pub struct ResizeService {
    store: Arc<dyn ObjectStore>,
    transformer: Arc<dyn Transformer>,
    sizes: SizeCatalog,
    /// Remove a derivative whose resize marker could not be written.
    delete_unlabeled: bool,
    /// Held for a whole invocation so events are handled one at a time.
    serial: Mutex<()>,
}

impl ResizeService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        transformer: Arc<dyn Transformer>,
        sizes: SizeCatalog,
    ) -> Self {
        Self {
            store,
            transformer,
            sizes,
            delete_unlabeled: false,
            serial: Mutex::new(()),
        }
    }

    pub fn with_delete_unlabeled(mut self, delete_unlabeled: bool) -> Self {
        self.delete_unlabeled = delete_unlabeled;
        self
    }

    /// Whether the transform capability is usable right now.
    pub async fn probe_transformer(&self) -> Result<(), TransformError> {
        self.transformer.probe().await
    }

    /// Handle one upload notification.
    pub async fn handle_event(&self, event: &StorageEvent) -> Result<ResizeReport, ResizeError> {
        let _serial = self.serial.lock().await;

        let attrs = self
            .store
            .attributes(&event.bucket, &event.name)
            .await
            .map_err(|source| ResizeError::AttributeFetch {
                bucket: event.bucket.clone(),
                name: event.name.clone(),
                source,
            })?;

        if let Eligibility::Skip(reason) = guard::check(&attrs) {
            info!(
                bucket = %event.bucket,
                name = %event.name,
                %reason,
                "skipping object"
            );
            return Ok(ResizeReport::Skipped { reason });
        }

        let mut widths = Vec::with_capacity(self.sizes.widths().len());
        for width in self.sizes.iter() {
            let outcome = match self.open_source(event).await {
                Ok(reader) => self.resize(event, reader, &attrs.content_type, width).await,
                Err(err) => Err(err),
            };

            widths.push(match outcome {
                Ok(created) => created,
                Err(err @ ResizeError::AlreadyResized(_)) => {
                    info!(bucket = %event.bucket, name = %event.name, width, "{}", err);
                    WidthOutcome::Skipped {
                        width,
                        reason: err.to_string(),
                    }
                }
                Err(err) => {
                    error!(bucket = %event.bucket, name = %event.name, width, "{}", err);
                    WidthOutcome::Failed {
                        width,
                        error: err.to_string(),
                    }
                }
            });
        }

        Ok(ResizeReport::Processed { widths })
    }

    async fn open_source(&self, event: &StorageEvent) -> Result<ObjectReader, ResizeError> {
        self.store
            .open_read(&event.bucket, &event.name)
            .await
            .map_err(|source| ResizeError::StreamOpen {
                side: StreamSide::Read,
                bucket: event.bucket.clone(),
                name: event.name.clone(),
                source,
            })
    }

    /// Produce and label the derivative of `event` at `width`.
    async fn resize(
        &self,
        event: &StorageEvent,
        mut reader: ObjectReader,
        content_type: &str,
        width: u32,
    ) -> Result<WidthOutcome, ResizeError> {
        let derived = naming::derive_name(&event.name, width, &self.sizes)
            .ok_or_else(|| ResizeError::AlreadyResized(event.name.clone()))?;

        let mut writer = self
            .store
            .open_write(&event.bucket, &derived, Some(content_type.to_string()))
            .await
            .map_err(|source| ResizeError::StreamOpen {
                side: StreamSide::Write,
                bucket: event.bucket.clone(),
                name: derived.clone(),
                source,
            })?;

        if let Err(source) = self
            .transformer
            .transform(&mut reader, width, &mut writer)
            .await
        {
            writer.abort().await;
            return Err(ResizeError::Transform { width, source });
        }

        writer
            .commit()
            .await
            .map_err(|source| ResizeError::Commit {
                bucket: event.bucket.clone(),
                name: derived.clone(),
                source,
            })?;
        info!(
            bucket = %event.bucket,
            name = %derived,
            width,
            "Resized image uploaded to {}",
            object_url(&event.bucket, &derived)
        );

        let labeled = self
            .store
            .update_metadata(&event.bucket, &derived, resized_marker())
            .await;
        let Err(source) = labeled else {
            return Ok(WidthOutcome::Created {
                width,
                object: derived,
                labeled: true,
            });
        };

        let err = ResizeError::MetadataUpdate {
            bucket: event.bucket.clone(),
            name: derived.clone(),
            source,
        };
        if !self.delete_unlabeled {
            warn!("{}; derivative kept without marker", err);
            return Ok(WidthOutcome::Created {
                width,
                object: derived,
                labeled: false,
            });
        }

        if let Err(delete_err) = self.store.delete(&event.bucket, &derived).await {
            error!(
                "failed to remove unlabeled derivative {}/{}: {}",
                event.bucket, derived, delete_err
            );
        }
        Err(err)
    }
}

/// `gs://` URL of an object, as it appears in logs.
fn object_url(bucket: &str, name: &str) -> String {
    format!("gs://{}/{}", bucket, name)
}
