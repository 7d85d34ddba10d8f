//! src/services/storage_service.rs
//!
//! StorageService: the local `ObjectStore` backend. SQLite holds object
//! attributes and user metadata; payloads live on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`.

use crate::{
    models::{
        bucket::Bucket,
        metadata::{MetadataEntry, ObjectAttributes},
        object::Object,
    },
    services::object_store::{
        ObjectReader, ObjectStore, ObjectWriter, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Schema applied by [`StorageService::migrate`].
const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

/// StorageService provides the object operations the resizer needs:
/// - streamed reads of an object payload
/// - streamed writes that only become visible on commit
/// - attribute and metadata reads, metadata merges
/// - deletes
///
/// It also exposes the bucket/upload operations used by the HTTP surface.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StorageResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }

        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }

        if name.starts_with('.')
            || name.ends_with('.')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }

        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }

        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }

        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff).
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    ///
    /// Combines base_path/bucket/{shard}/{shard}/{key}.
    /// Parent directories may not exist yet.
    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Fetch bucket row, or BucketNotFound.
    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>("SELECT id, name, created_at FROM buckets WHERE name = ?")
            .bind(bucket)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
                other => StorageError::Sqlx(other),
            })
    }

    /// Fetch an object row by key, or ObjectNotFound.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, content_type, size_bytes, etag, last_modified
             FROM objects
             WHERE key = ? AND bucket_id = ?",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_metadata(&self, object: &Object) -> StorageResult<HashMap<String, String>> {
        let entries = sqlx::query_as::<_, MetadataEntry>(
            "SELECT key, value FROM object_metadata WHERE object_id = ?",
        )
        .bind(object.id)
        .fetch_all(&*self.db)
        .await?;

        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }

    /// Start a new object write.
    ///
    /// Bytes go to a temporary file next to the final payload location; the
    /// object row and its metadata are only written by
    /// [`DiskObjectWriter::finish`]. An existing object under the same key is
    /// replaced, metadata included.
    pub async fn create_writer(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> StorageResult<DiskObjectWriter> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;

        Ok(DiskObjectWriter {
            service: self.clone(),
            bucket: bucket_rec,
            key: key.to_string(),
            content_type,
            metadata,
            file,
            tmp_path,
            file_path,
            size_bytes: 0,
            digest: md5::Context::new(),
            state: WriteState::Pending,
        })
    }

    /// Stream-upload an object to disk and record it.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let mut writer = self
            .create_writer(bucket, key, content_type, metadata)
            .await?;

        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let written = match chunk_res {
                Ok(chunk) => writer.write_all(&chunk).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                writer.discard().await;
                return Err(StorageError::Io(err));
            }
        }

        writer.finish().await
    }

    /// Fetch an object for reading.
    ///
    /// Returns the object row, its metadata and an opened File handle.
    /// Returns ObjectNotFound if the row exists but the payload is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, HashMap<String, String>, File)> {
        let (object, metadata) = self.get_object_metadata(bucket, key).await?;

        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, metadata, file))
    }

    /// Fetch the object row and its user metadata.
    pub async fn get_object_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, HashMap<String, String>)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;
        let metadata = self.fetch_metadata(&object).await?;
        Ok((object, metadata))
    }

    /// Delete an object row, its metadata and its payload.
    ///
    /// Empty shard directories are pruned afterwards.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(())
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Returns BucketAlreadyExists if name conflict occurs.
    pub async fn create_bucket(&self, name: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO buckets (id, name, created_at) VALUES (?, ?, ?)")
            .bind(bucket.id)
            .bind(&bucket.name)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Recursively remove empty directories up to bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Where a [`DiskObjectWriter`] is in its lifecycle.
enum WriteState {
    /// Bytes live in the temp file only.
    Pending,
    /// The payload sits at its final path but the row is not committed yet.
    /// A payload it replaced waits at `displaced`.
    Published { displaced: Option<PathBuf> },
    Settled,
}

/// An in-progress object write on local disk.
///
/// Size and MD5 etag are computed while bytes stream through. A writer that
/// is dropped before [`finish`](Self::finish) or [`discard`](Self::discard)
/// returns undoes whatever it had done on disk.
pub struct DiskObjectWriter {
    service: StorageService,
    bucket: Bucket,
    key: String,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    file: File,
    tmp_path: PathBuf,
    file_path: PathBuf,
    size_bytes: i64,
    digest: md5::Context,
    state: WriteState,
}

impl DiskObjectWriter {
    /// Publish the payload and upsert the object row.
    ///
    /// - fsyncs the temp file and renames it into place, keeping any previous
    ///   payload aside until the row is written
    /// - upserts the row (overwrite semantics) and replaces its metadata
    ///
    /// On any error the previous payload (if any) is put back and the temp
    /// file is removed.
    pub async fn finish(mut self) -> StorageResult<Object> {
        if let Err(err) = self.persist_payload().await {
            self.remove_tmp().await;
            return Err(err);
        }

        let etag = format!("{:x}", self.digest.clone().compute());
        let recorded = self.record(etag).await;
        let WriteState::Published { displaced } =
            std::mem::replace(&mut self.state, WriteState::Settled)
        else {
            return recorded;
        };

        match (recorded, displaced) {
            (Ok(object), Some(displaced)) => {
                if let Err(err) = fs::remove_file(&displaced).await {
                    debug!("failed to remove {}: {}", displaced.display(), err);
                }
                Ok(object)
            }
            (Ok(object), None) => Ok(object),
            (Err(err), displaced) => {
                let restored = match displaced {
                    Some(displaced) => fs::rename(&displaced, &self.file_path).await,
                    None => fs::remove_file(&self.file_path).await,
                };
                if let Err(restore_err) = restored {
                    debug!(
                        "failed to restore {}: {}",
                        self.file_path.display(),
                        restore_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Remove the temp file without publishing anything.
    pub async fn discard(mut self) {
        self.remove_tmp().await;
    }

    async fn remove_tmp(&mut self) {
        self.state = WriteState::Settled;
        if let Err(err) = fs::remove_file(&self.tmp_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove temp file {}: {}",
                    self.tmp_path.display(),
                    err
                );
            }
        }
    }

    /// Sync the temp file and move it over the final path, moving any
    /// previous payload aside first.
    async fn persist_payload(&mut self) -> StorageResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let displaced = if fs::try_exists(&self.file_path).await? {
            let aside = self
                .tmp_path
                .with_file_name(format!(".prev-{}", Uuid::new_v4()));
            fs::rename(&self.file_path, &aside).await?;
            Some(aside)
        } else {
            None
        };

        if let Err(err) = fs::rename(&self.tmp_path, &self.file_path).await {
            if let Some(aside) = &displaced {
                if let Err(err) = fs::rename(aside, &self.file_path).await {
                    debug!("failed to restore {}: {}", self.file_path.display(), err);
                }
            }
            return Err(StorageError::Io(err));
        }

        self.state = WriteState::Published { displaced };
        Ok(())
    }

    async fn record(&self, etag: String) -> StorageResult<Object> {
        let mut tx = self.service.db.begin().await?;

        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes, etag, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, bucket_id, key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.bucket.id)
        .bind(&self.key)
        .bind(self.content_type.clone())
        .bind(self.size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        for (key, value) in &self.metadata {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object.id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(object)
    }
}

impl Drop for DiskObjectWriter {
    fn drop(&mut self) {
        let undone = match std::mem::replace(&mut self.state, WriteState::Settled) {
            WriteState::Pending => std::fs::remove_file(&self.tmp_path),
            WriteState::Published {
                displaced: Some(displaced),
            } => std::fs::rename(&displaced, &self.file_path),
            WriteState::Published { displaced: None } => std::fs::remove_file(&self.file_path),
            WriteState::Settled => Ok(()),
        };
        if let Err(err) = undone {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to clean up unfinished write of {}: {}",
                    self.file_path.display(),
                    err
                );
            }
        }
    }
}

impl AsyncWrite for DiskObjectWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.size_bytes += n as i64;
                this.digest.consume(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait]
impl ObjectWriter for DiskObjectWriter {
    async fn commit(self: Box<Self>) -> StorageResult<()> {
        (*self).finish().await.map(|_| ())
    }

    async fn abort(self: Box<Self>) {
        (*self).discard().await
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn open_read(&self, bucket: &str, name: &str) -> StorageResult<ObjectReader> {
        let (_, _, file) = self.get_object_reader(bucket, name).await?;
        Ok(Box::new(file))
    }

    async fn open_write(
        &self,
        bucket: &str,
        name: &str,
        content_type: Option<String>,
    ) -> StorageResult<Box<dyn ObjectWriter>> {
        let writer = self
            .create_writer(bucket, name, content_type, HashMap::new())
            .await?;
        Ok(Box::new(writer))
    }

    async fn attributes(&self, bucket: &str, name: &str) -> StorageResult<ObjectAttributes> {
        let (object, metadata) = self.get_object_metadata(bucket, name).await?;
        Ok(ObjectAttributes {
            content_type: object.content_type.unwrap_or_default(),
            metadata,
        })
    }

    async fn update_metadata(
        &self,
        bucket: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> StorageResult<()> {
        let (object, _) = self.get_object_metadata(bucket, name).await?;

        let mut tx = self.db.begin().await?;
        for (key, value) in &metadata {
            sqlx::query(
                "INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)
                 ON CONFLICT(object_id, key) DO UPDATE SET value = excluded.value",
            )
            .bind(object.id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, name: &str) -> StorageResult<()> {
        self.delete_object(bucket, name).await
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
