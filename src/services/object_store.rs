//! The blob-storage capability consumed by the resizer.
//!
//! The resizer only ever sees this trait, so the backing store can be
//! swapped (local disk in production, in-memory in tests) without touching
//! the guard, naming or driver logic.

use crate::models::metadata::ObjectAttributes;
use async_trait::async_trait;
use std::{collections::HashMap, io};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A readable byte stream over an object's payload.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// A writable byte sink for a new object.
///
/// Nothing is visible in the store until [`ObjectWriter::commit`] returns.
/// A writer must end in exactly one of `commit` or `abort`.
#[async_trait]
pub trait ObjectWriter: AsyncWrite + Send + Unpin {
    /// Flush and publish the object under its name.
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Drop everything written so far.
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn open_read(&self, bucket: &str, name: &str) -> StorageResult<ObjectReader>;

    async fn open_write(
        &self,
        bucket: &str,
        name: &str,
        content_type: Option<String>,
    ) -> StorageResult<Box<dyn ObjectWriter>>;

    async fn attributes(&self, bucket: &str, name: &str) -> StorageResult<ObjectAttributes>;

    /// Merge `metadata` into the object's existing metadata.
    async fn update_metadata(
        &self,
        bucket: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()>;

    async fn delete(&self, bucket: &str, name: &str) -> StorageResult<()>;
}
