//! The object-store abstraction (spec.md §6).
//!
//! Only the trait is part of the core's contract; concrete drivers (S3, GCS,
//! ...) are external collaborators. This module ships one reference driver,
//! [`FsObjectStore`], so the crate is runnable and testable standalone — see
//! SPEC_FULL.md §6. [`FsObjectStore`] is a thin wrapper over the
//! `object_store` crate's [`object_store::local::LocalFileSystem`] driver,
//! matching how `GitDataAI-git-inner` leans on that crate for the same
//! put/get/list/delete concern rather than hand-rolling a filesystem walker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::StreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStoreExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub created_at: SystemTime,
}

/// Minimal reader/writer/list/delete interface (spec.md §6).
///
/// `list` returns a materialised, lexicographically sorted `Vec` rather than
/// spec.md's abstract iterator-with-`EOF` — a backup cycle's prefixes hold at
/// most a handful of bundles (GC keeps only the latest, see spec.md §4.5 step
/// 4), so collecting is simpler than threading an async iterator through
/// every call site for no practical benefit.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn writer(&self, key: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;
    async fn reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

fn map_object_store_error(key: &str, err: object_store::Error) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::not_found(format!("no such object: {key}")),
        e => Error::internal(anyhow::Error::new(e)),
    }
}

/// Reference filesystem-backed object-store driver, rooted at `root`.
pub struct FsObjectStore {
    inner: Arc<dyn object_store::ObjectStore>,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).map_err(Error::from)?;
        let inner = LocalFileSystem::new_with_prefix(&root).map_err(|e| Error::internal(anyhow::Error::new(e)))?;
        Ok(Self { inner: Arc::new(inner) })
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn writer(&self, key: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let path = ObjectPath::from(key);
        Ok(Box::new(object_store::buffered::BufWriter::new(self.inner.clone(), path)))
    }

    async fn reader(&self, key: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = ObjectPath::from(key);
        let meta = self.inner.head(&path).await.map_err(|e| map_object_store_error(key, e))?;
        Ok(Box::new(object_store::buffered::BufReader::new(self.inner.clone(), &meta)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.inner.delete(&ObjectPath::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::internal(anyhow::Error::new(e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let prefix_path = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let mut stream = self.inner.list(prefix_path.as_ref());
        let mut out = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| Error::internal(anyhow::Error::new(e)))?;
            out.push(ObjectMeta {
                key: meta.location.to_string(),
                size: meta.size,
                created_at: SystemTime::from(meta.last_modified),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();

        let mut w = store.writer("example.com/org/repo/000000000001").await.unwrap();
        w.write_all(b"bundle bytes").await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);

        let mut r = store.reader("example.com/org/repo/000000000001").await.unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bundle bytes");
    }

    #[tokio::test]
    async fn reading_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();
        match store.reader("missing").await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected NotFound"),
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();
        store.delete("never-existed").await.unwrap();
        store.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_lexicographic_order_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();

        for ts in ["000000000001", "000000000003", "000000000002"] {
            let mut w = store.writer(&format!("example.com/org/repo/{ts}")).await.unwrap();
            w.write_all(b"x").await.unwrap();
            w.shutdown().await.unwrap();
        }

        let listed = store.list("example.com/org/repo/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|m| m.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                "example.com/org/repo/000000000001",
                "example.com/org/repo/000000000002",
                "example.com/org/repo/000000000003",
            ]
        );
    }
}
