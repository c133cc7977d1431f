//! Storage backend abstraction for object storage (COS, S3, local).
//!
//! Two things live in object storage: the per-experiment topology files the
//! remote compute nodes download before a job starts, and the lock records
//! behind [`crate::lock::DistributedLock`]. The contract therefore needs
//! conditional writes as well as plain reads and deletes.
//!
//! The version token is an opaque `String`: numeric for [`MemoryBackend`],
//! the entity tag for [`ObjectStoreBackend`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix, in arbitrary order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored path, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn paths(&self) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        let mut paths: Vec<String> = objects.keys().cloned().collect();
        drop(objects);
        paths.sort();
        Ok(paths)
    }

    fn meta(path: &str, obj: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| Self::meta(path, obj))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| Self::meta(path, obj)))
    }
}

/// Storage backend over any [`object_store::ObjectStore`].
///
/// Versions are entity tags. Backends that cannot do conditional updates
/// (for example the local filesystem store) surface `MatchesVersion` writes
/// as storage errors.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    /// Wraps an existing object store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Creates a backend rooted at a local directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be used as a store root.
    pub fn local(root: impl AsRef<std::path::Path>) -> Result<Self> {
        let store = object_store::local::LocalFileSystem::new_with_prefix(root)
            .map_err(|e| Error::storage_with_source("failed to open local object store", e))?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Creates a purely in-process backend (`object_store::memory::InMemory`).
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    fn version_of(e_tag: Option<String>, version: Option<String>) -> String {
        e_tag.or(version).unwrap_or_default()
    }

    fn convert_meta(meta: object_store::ObjectMeta) -> ObjectMeta {
        ObjectMeta {
            path: meta.location.to_string(),
            size: u64::try_from(meta.size).unwrap_or(u64::MAX),
            version: Self::version_of(meta.e_tag, meta.version),
            last_modified: Some(meta.last_modified),
        }
    }

    async fn current_version(&self, path: &str) -> Result<String> {
        Ok(self
            .head(path)
            .await?
            .map_or_else(|| "0".to_string(), |meta| meta.version))
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = ObjectPath::from(path);
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::NotFound(format!("object not found: {path}")));
            }
            Err(e) => return Err(Error::storage_with_source(format!("get {path}"), e)),
        };
        result
            .bytes()
            .await
            .map_err(|e| Error::storage_with_source(format!("read {path}"), e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = ObjectPath::from(path);
        let mode = match precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(e_tag) => PutMode::Update(UpdateVersion {
                e_tag: Some(e_tag),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let options = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&location, PutPayload::from(data), options)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: Self::version_of(result.e_tag, result.version),
            }),
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotFound { .. },
            ) => Ok(WriteResult::PreconditionFailed {
                current_version: self.current_version(path).await?,
            }),
            Err(e) => Err(Error::storage_with_source(format!("put {path}"), e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::storage_with_source(format!("delete {path}"), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = ObjectPath::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| Error::storage_with_source(format!("list {prefix}"), e))?;
        Ok(metas.into_iter().map(Self::convert_meta).collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.store.head(&ObjectPath::from(path)).await {
            Ok(meta) => Ok(Some(Self::convert_meta(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::storage_with_source(format!("head {path}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("10.0.0.1 node0\n");

        let result = backend
            .put("experiments/7/42/hosts", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");
        assert!(matches!(result, WriteResult::Success { ref version } if version == "1"));

        let retrieved = backend
            .get("experiments/7/42/hosts")
            .await
            .expect("get should succeed");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn memory_backend_does_not_exist_precondition() {
        let backend = MemoryBackend::new();
        let first = backend
            .put("lock", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(first.is_success());

        let second = backend
            .put("lock", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(matches!(
            second,
            WriteResult::PreconditionFailed { ref current_version } if current_version == "1"
        ));
    }

    #[tokio::test]
    async fn memory_backend_version_match() {
        let backend = MemoryBackend::new();
        backend
            .put("lock", Bytes::from("a"), WritePrecondition::None)
            .await
            .expect("put");

        let stale = backend
            .put(
                "lock",
                Bytes::from("b"),
                WritePrecondition::MatchesVersion("7".into()),
            )
            .await
            .expect("put");
        assert!(!stale.is_success());

        let fresh = backend
            .put(
                "lock",
                Bytes::from("c"),
                WritePrecondition::MatchesVersion("1".into()),
            )
            .await
            .expect("put");
        assert!(fresh.is_success());
        assert_eq!(backend.get("lock").await.expect("get"), Bytes::from("c"));
    }

    #[tokio::test]
    async fn memory_backend_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.delete("missing").await.expect("delete missing");
        assert!(backend.get("missing").await.expect_err("gone").is_not_found());
        assert!(backend.head("missing").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn memory_backend_lists_by_prefix() {
        let backend = MemoryBackend::new();
        for path in ["experiments/1/10/hosts", "experiments/1/10/hostfile", "locks/1"] {
            backend
                .put(path, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        let listed = backend.list("experiments/1/10/").await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(backend.paths().expect("paths").len(), 3);
    }

    #[tokio::test]
    async fn object_store_backend_create_then_conflict() {
        let backend = ObjectStoreBackend::in_memory();

        let first = backend
            .put("locks/p1", Bytes::from("a"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(first.is_success());

        let second = backend
            .put("locks/p1", Bytes::from("b"), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        assert!(!second.is_success());

        let head = backend.head("locks/p1").await.expect("head").expect("meta");
        assert_eq!(head.size, 1);
        assert_eq!(backend.get("locks/p1").await.expect("get"), Bytes::from("a"));
    }

    #[tokio::test]
    async fn object_store_backend_missing_object_is_not_found() {
        let backend = ObjectStoreBackend::in_memory();
        assert!(backend.get("nope").await.expect_err("missing").is_not_found());
        backend.delete("nope").await.expect("delete is idempotent");
    }
}
