//! In-memory doubles for the object store and the transform subprocess.

use crate::{
    models::metadata::ObjectAttributes,
    services::{
        object_store::{ObjectReader, ObjectStore, ObjectWriter, StorageError, StorageResult},
        storage_service::StorageService,
        transform::{TransformError, Transformer},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::SqlitePoolOptions;
use std::{
    collections::{HashMap, HashSet},
    io::{self, Cursor},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// A migrated `StorageService` over an in-memory SQLite database and a fresh
/// directory under the system temp dir.
pub async fn disk_store() -> StorageService {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let base = std::env::temp_dir().join(format!("image-resizer-test-{}", Uuid::new_v4()));
    let service = StorageService::new(Arc::new(db), base);
    service.migrate().await.unwrap();
    service
}

#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub attrs: ObjectAttributes,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<(String, String), StoredObject>,
    failing_reads: usize,
    failing_writes: HashSet<String>,
    failing_labels: HashSet<String>,
}

/// Object store keeping everything in a map, with switchable failures.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, name: &str, data: &[u8], attrs: ObjectAttributes) {
        self.inner.lock().unwrap().objects.insert(
            (bucket.to_string(), name.to_string()),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                attrs,
            },
        );
    }

    pub fn get(&self, bucket: &str, name: &str) -> Option<StoredObject> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }

    /// Sorted object names of a bucket.
    pub fn names(&self, bucket: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Make the next `count` calls to `open_read` fail.
    pub fn fail_next_reads(&self, count: usize) {
        self.inner.lock().unwrap().failing_reads = count;
    }

    pub fn fail_writes_to(&self, name: &str) {
        self.inner.lock().unwrap().failing_writes.insert(name.to_string());
    }

    pub fn fail_labels_on(&self, name: &str) {
        self.inner.lock().unwrap().failing_labels.insert(name.to_string());
    }

    fn not_found(bucket: &str, name: &str) -> StorageError {
        StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: name.to_string(),
        }
    }

    fn injected(what: &str) -> StorageError {
        StorageError::Io(io::Error::new(io::ErrorKind::Other, format!("injected {what} failure")))
    }
}

pub struct MemoryWriter {
    store: MemoryStore,
    bucket: String,
    name: String,
    content_type: Option<String>,
    buf: Vec<u8>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().buf).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().buf).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().buf).poll_shutdown(cx)
    }
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let attrs = ObjectAttributes::new(self.content_type.clone().unwrap_or_default());
        self.store.insert(&self.bucket, &self.name, &self.buf, attrs);
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn open_read(&self, bucket: &str, name: &str) -> StorageResult<ObjectReader> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing_reads > 0 {
                inner.failing_reads -= 1;
                return Err(Self::injected("read"));
            }
        }
        let object = self
            .get(bucket, name)
            .ok_or_else(|| Self::not_found(bucket, name))?;
        Ok(Box::new(Cursor::new(object.data)))
    }

    async fn open_write(
        &self,
        bucket: &str,
        name: &str,
        content_type: Option<String>,
    ) -> StorageResult<Box<dyn ObjectWriter>> {
        if self.inner.lock().unwrap().failing_writes.contains(name) {
            return Err(Self::injected("write"));
        }
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            bucket: bucket.to_string(),
            name: name.to_string(),
            content_type,
            buf: Vec::new(),
        }))
    }

    async fn attributes(&self, bucket: &str, name: &str) -> StorageResult<ObjectAttributes> {
        self.get(bucket, name)
            .map(|object| object.attrs)
            .ok_or_else(|| Self::not_found(bucket, name))
    }

    async fn update_metadata(
        &self,
        bucket: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_labels.contains(name) {
            return Err(Self::injected("metadata"));
        }
        let object = inner
            .objects
            .get_mut(&(bucket.to_string(), name.to_string()))
            .ok_or_else(|| Self::not_found(bucket, name))?;
        object.attrs.metadata.extend(metadata);
        Ok(())
    }

    async fn delete(&self, bucket: &str, name: &str) -> StorageResult<()> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .remove(&(bucket.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(bucket, name))
    }
}

/// What [`FakeTransformer`] writes for `input` at `width`.
pub fn fake_output(width: u32, input: &[u8]) -> Vec<u8> {
    let mut out = format!("{}px:", width).into_bytes();
    out.extend_from_slice(input);
    out
}

/// Transformer that tags its input with the width instead of resizing it.
///
/// Widths listed as failing write a few bytes and then error out, like a
/// subprocess dying half way through.
#[derive(Default)]
pub struct FakeTransformer {
    failing: HashSet<u32>,
    calls: Mutex<Vec<u32>>,
}

impl FakeTransformer {
    pub fn failing_on(widths: &[u32]) -> Self {
        Self {
            failing: widths.iter().copied().collect(),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transformer for FakeTransformer {
    async fn transform(
        &self,
        input: &mut (dyn AsyncRead + Send + Unpin),
        width: u32,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransformError> {
        self.calls.lock().unwrap().push(width);
        let stream_error = |source| TransformError::Stream {
            program: "fake".into(),
            source,
        };

        let mut source = Vec::new();
        input.read_to_end(&mut source).await.map_err(stream_error)?;

        if self.failing.contains(&width) {
            output.write_all(b"partial").await.map_err(stream_error)?;
            return Err(stream_error(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transform died",
            )));
        }

        let resized = fake_output(width, &source);
        output.write_all(&resized).await.map_err(stream_error)?;
        output.flush().await.map_err(stream_error)?;
        Ok(resized.len() as u64)
    }
}

/// Transformer that consumes its input, writes part of a result and then
/// never finishes.
pub struct StalledTransformer;

#[async_trait]
impl Transformer for StalledTransformer {
    async fn transform(
        &self,
        input: &mut (dyn AsyncRead + Send + Unpin),
        _width: u32,
        output: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, TransformError> {
        let stream_error = |source| TransformError::Stream {
            program: "stalled".into(),
            source,
        };
        let mut source = Vec::new();
        input.read_to_end(&mut source).await.map_err(stream_error)?;
        output.write_all(b"partial").await.map_err(stream_error)?;
        output.flush().await.map_err(stream_error)?;
        std::future::pending().await
    }
}

/// Every file below `dir`, relative to it.
pub fn files_under(dir: &std::path::Path) -> Vec<String> {
    fn walk(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }

    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}
