//! The managed-repository registry (spec.md §4.3): a process-wide map from
//! canonical upstream URL to its [`ManagedRepository`], deduplicating
//! concurrent first-contact initialisation.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::http::Uri;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::git::GitOps;
use crate::repo::ManagedRepository;

/// Passed as an explicit dependency of the edge handler and the backup
/// worker rather than kept as module-level state, so both are trivially
/// testable in isolation (spec.md §9 "Global registry as process-wide state").
pub struct Registry {
    cache_root: PathBuf,
    git: Arc<dyn GitOps>,
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<ManagedRepository>>>>>,
}

impl Registry {
    pub fn new(cache_root: PathBuf, git: Arc<dyn GitOps>) -> Self {
        Self {
            cache_root,
            git,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Maps a canonical URL to `{cache_root}/{host}/{path}`, rejecting any
    /// path component that could escape `cache_root` (`..`, absolute
    /// components) — grounded on the teacher's `Index::open` path sanitisation.
    fn local_path_for(&self, canonical_url: &str) -> Result<PathBuf> {
        let uri: Uri = canonical_url
            .parse()
            .map_err(|_| Error::invalid_argument(format!("unparseable canonical url: {canonical_url}")))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::invalid_argument("canonical url is missing a host"))?;

        let mut local = self.cache_root.clone();
        local.push(host);
        for component in Path::new(uri.path().trim_start_matches('/')).components() {
            match component {
                Component::Normal(c) => local.push(c),
                other => {
                    return Err(Error::invalid_argument(format!(
                        "disallowed path component in canonical url: {other:?}"
                    )))
                }
            }
        }
        Ok(local)
    }

    /// Lookup-or-create(canonical_url) (spec.md §4.3). A losing concurrent
    /// caller blocks on the winner's [`OnceCell`] rather than racing it;
    /// `get_or_try_init` re-runs initialisation on the next call if a
    /// previous attempt failed, satisfying spec.md §7's "subsequent requests
    /// will retry initialisation" without separate retry bookkeeping.
    pub async fn lookup_or_create(&self, canonical_url: &str) -> Result<Arc<ManagedRepository>> {
        let cell = {
            let mut entries = self.entries.lock().expect("registry mutex poisoned");
            entries
                .entry(canonical_url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let git = self.git.clone();
        let local_path = self.local_path_for(canonical_url)?;
        let canonical_url = canonical_url.to_string();

        cell.get_or_try_init(|| async move { ManagedRepository::initialize(canonical_url, local_path, git).await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Snapshot of fully-initialised entries, for the backup worker
    /// (spec.md §4.3 "Iterate"). Entries whose initialisation is still in
    /// flight or failed are omitted rather than blocked on.
    pub fn iterate(&self) -> Vec<Arc<ManagedRepository>> {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        entries.values().filter_map(|cell| cell.get().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockGitOps;

    #[tokio::test]
    async fn lookup_or_create_returns_the_same_object_for_the_same_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));

        let registry = Registry::new(dir.path().to_path_buf(), Arc::new(git));

        let a = registry.lookup_or_create("https://example.com/org/repo").await.unwrap();
        let b = registry.lookup_or_create("https://example.com/org/repo").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_first_contact_initialises_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut git = MockGitOps::new();
        git.expect_init_mirror().times(1).returning(|_, _| Ok(()));

        let registry = Arc::new(Registry::new(dir.path().to_path_buf(), Arc::new(git)));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.lookup_or_create("https://example.com/org/repo").await.unwrap() })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
    }

    #[tokio::test]
    async fn rejects_path_traversal_in_canonical_url() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().to_path_buf(), Arc::new(MockGitOps::new()));
        assert!(registry
            .lookup_or_create("https://example.com/../escape")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn iterate_only_reports_fully_initialised_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut git = MockGitOps::new();
        git.expect_init_mirror().returning(|_, _| Ok(()));
        let registry = Registry::new(dir.path().to_path_buf(), Arc::new(git));

        assert!(registry.iterate().is_empty());
        registry.lookup_or_create("https://example.com/org/repo").await.unwrap();
        assert_eq!(registry.iterate().len(), 1);
    }
}
