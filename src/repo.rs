//! The managed repository (spec.md §3, §4.4): owns one bare mirror, answers
//! `ls-refs` and `fetch`, and serialises upstream refreshes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::git::{GitOps, SpawnedProcess};
use crate::pktline;
use crate::protocol::{Command, FetchArgs, LsRefsArgs};
use crate::upstream::UpstreamClient;

/// Above this age, a response answered from the local mirror logs a "stale
/// cache" warning rather than failing (spec.md §4.4.1 step 4).
const STALE_CACHE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

struct RepoState {
    /// Zero (`UNIX_EPOCH`) until the first successful upstream fetch. Treated
    /// as "no usable local data yet" by [`ManagedRepository::ls_refs_local`],
    /// distinguishing a freshly `git init --bare`d mirror from one that has
    /// actually synced with upstream at least once.
    last_update: SystemTime,
}

/// One canonical upstream URL's cached mirror (spec.md §3 "Managed repository").
pub struct ManagedRepository {
    pub canonical_url: String,
    pub local_path: PathBuf,
    git: Arc<dyn GitOps>,
    state: RwLock<RepoState>,
}

impl ManagedRepository {
    /// One-shot mirror initialisation, run exactly once per canonical URL by
    /// [`crate::registry::Registry::lookup_or_create`] (spec.md §4.3 invariant b).
    pub(crate) async fn initialize(
        canonical_url: String,
        local_path: PathBuf,
        git: Arc<dyn GitOps>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&local_path).await?;
        if !local_path.join("config").exists() {
            git.init_mirror(&local_path, &canonical_url).await?;
        }
        Ok(Self {
            canonical_url,
            local_path,
            git,
            state: RwLock::new(RepoState {
                last_update: SystemTime::UNIX_EPOCH,
            }),
        })
    }

    pub async fn last_update(&self) -> SystemTime {
        self.state.read().await.last_update
    }

    /// spec.md §4.4.1. Returns the pkt-line encoded response body and the
    /// source it was served from, for logging.
    pub async fn ls_refs(
        &self,
        args: &LsRefsArgs,
        raw_command: bytes::Bytes,
        upstream: Option<&UpstreamClient>,
    ) -> Result<(Vec<u8>, &'static str)> {
        if let Some(upstream) = upstream {
            match self.ls_refs_upstream(raw_command, upstream).await {
                Ok(bytes) => return Ok((bytes, "upstream")),
                Err(e) => {
                    tracing::warn!(
                        url = %self.canonical_url,
                        error = %e.message,
                        "upstream ls-refs failed, falling back to local mirror"
                    );
                }
            }
        }

        let bytes = self.ls_refs_local(args).await?;

        let age = SystemTime::now()
            .duration_since(self.last_update().await)
            .unwrap_or_default();
        if age > STALE_CACHE_THRESHOLD {
            tracing::warn!(url = %self.canonical_url, age_secs = age.as_secs(), "stale cache");
        }

        Ok((bytes, "local"))
    }

    async fn ls_refs_upstream(&self, raw_command: bytes::Bytes, upstream: &UpstreamClient) -> Result<Vec<u8>> {
        let mut stream = upstream.ls_refs_stream(&self.canonical_url, raw_command).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    async fn ls_refs_local(&self, args: &LsRefsArgs) -> Result<Vec<u8>> {
        if self.last_update().await == SystemTime::UNIX_EPOCH {
            return Err(Error::unavailable(format!(
                "no local mirror for {}",
                self.canonical_url
            )));
        }

        let refs = self.git.list_refs(&self.local_path).await?;
        let mut out = Vec::new();
        for r in &refs {
            if !args.matches(&r.name) {
                continue;
            }
            out.extend(pktline::encode_data(format!("{} {}\n", r.oid, r.name).as_bytes()));
            if args.symrefs && r.name == "HEAD" {
                if let Some(target) = self.git.symbolic_ref_target(&self.local_path, "HEAD").await? {
                    out.extend(pktline::encode_data(format!("symref-target:{target}\n").as_bytes()));
                }
            }
        }
        out.extend(pktline::encode_response_end());
        Ok(out)
    }

    /// spec.md §4.4.2. Returns the spawned `git upload-pack` process; the
    /// caller streams its stdout as the response body.
    pub async fn fetch(&self, command: &Command, upstream: Option<&UpstreamClient>) -> Result<SpawnedProcess> {
        let args = FetchArgs::from_command(command);

        if let Some(upstream) = upstream {
            if !self.cache_hit(&args, upstream).await? {
                self.upstream_fetch(upstream).await?;
            }
        }

        self.git.upload_pack(&self.local_path, command.raw.clone()).await
    }

    /// spec.md §4.4.2 step 2: `hasAnyUpdate` (want-refs) and `hasAllWants`
    /// (want hashes) must both hold for a local-only answer.
    async fn cache_hit(&self, args: &FetchArgs, upstream: &UpstreamClient) -> Result<bool> {
        if args.want_refs.is_empty() && args.wants.is_empty() {
            return Ok(true);
        }

        if !args.want_refs.is_empty() {
            let upstream_tips = upstream.resolve_refs(&self.canonical_url, &args.want_refs).await?;
            let local_refs = self.git.list_refs(&self.local_path).await?;
            for want_ref in &args.want_refs {
                let Some(upstream_tip) = upstream_tips.iter().find(|r| &r.name == want_ref) else {
                    return Ok(false);
                };
                match local_refs.iter().find(|r| &r.name == want_ref) {
                    Some(local) if local.oid == upstream_tip.oid => {}
                    _ => return Ok(false),
                }
            }
        }

        for want in &args.wants {
            if !self.git.has_object(&self.local_path, want).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// spec.md §4.4.3. Single-flight via the write lock: concurrent callers
    /// block here rather than spawning their own `git fetch`.
    async fn upstream_fetch(&self, upstream: &UpstreamClient) -> Result<()> {
        let mut guard = self.state.write().await;
        let start = SystemTime::now();

        let token = upstream.token_for(&self.canonical_url).await?;
        let auth = if token.is_empty() { None } else { Some(&token) };

        if !self.git.has_head(&self.local_path).await? {
            self.git.fetch_heads_and_changes(&self.local_path, auth).await?;
        }
        self.git.fetch_all(&self.local_path, auth).await?;

        guard.last_update = start;
        Ok(())
    }

    /// spec.md §4.4.4. Acquires a shared lock: bundle creation only reads the
    /// mirror, so it may run alongside other readers.
    pub async fn write_bundle(&self, writer: &mut (impl tokio::io::AsyncWrite + Unpin + Send)) -> Result<()> {
        let _guard = self.state.read().await;
        let spawned = self.git.bundle_create(&self.local_path).await?;
        let (mut stdout, tail) = spawned.into_stdout();
        tokio::io::copy(&mut stdout, writer).await?;
        tail.wait(|line| tracing::debug!(bundle_stderr = line, "git bundle create")).await
    }

    /// spec.md §4.4.4. Acquires the write lock: restoring mutates the mirror.
    pub async fn restore_from_bundle(&self, bundle_path: &Path) -> Result<()> {
        let guard = self.state.write().await;
        self.git.bundle_restore(&self.local_path, bundle_path).await?;
        drop(guard);
        Ok(())
    }

    /// Marks the mirror as populated without going through an upstream fetch,
    /// used after [`ManagedRepository::restore_from_bundle`] on cold start so
    /// subsequent `ls-refs` calls treat the mirror as warm (spec.md §4.5
    /// "Cold-start restore").
    pub async fn mark_restored(&self) {
        self.state.write().await.last_update = SystemTime::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{MockGitOps, RefEntry};
    use bytes::Bytes;
    use mockall::predicate::always;

    fn sample_command(name: &str, args: &[&str]) -> Command {
        let mut out = Vec::new();
        out.extend(pktline::encode_data(format!("command={name}\n").as_bytes()));
        out.extend(pktline::encode_delim());
        for a in args {
            out.extend(pktline::encode_data(format!("{a}\n").as_bytes()));
        }
        out.extend(pktline::encode_flush());
        crate::protocol::parse_commands(Bytes::from(out)).unwrap().remove(0)
    }

    #[tokio::test]
    async fn ls_refs_local_reports_unavailable_before_first_fetch() {
        let git = MockGitOps::new();
        let repo = ManagedRepository {
            canonical_url: "https://example.com/org/repo".to_string(),
            local_path: PathBuf::from("/nonexistent-for-test"),
            git: Arc::new(git),
            state: RwLock::new(RepoState {
                last_update: SystemTime::UNIX_EPOCH,
            }),
        };

        let args = LsRefsArgs::default();
        let err = repo.ls_refs(&args, Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err.code, crate::error::Code::Unavailable));
    }

    #[tokio::test]
    async fn ls_refs_local_lists_matching_refs_after_a_fetch() {
        let mut git = MockGitOps::new();
        git.expect_list_refs().returning(|_| {
            Ok(vec![RefEntry {
                oid: "a".repeat(40),
                name: "refs/heads/main".to_string(),
            }])
        });

        let repo = ManagedRepository {
            canonical_url: "https://example.com/org/repo".to_string(),
            local_path: PathBuf::from("/irrelevant"),
            git: Arc::new(git),
            state: RwLock::new(RepoState {
                last_update: SystemTime::now(),
            }),
        };

        let args = LsRefsArgs::default();
        let (bytes, source) = repo.ls_refs(&args, Bytes::new(), None).await.unwrap();
        assert_eq!(source, "local");
        let expected = {
            let mut out = Vec::new();
            out.extend(pktline::encode_data(
                format!("{} refs/heads/main\n", "a".repeat(40)).as_bytes(),
            ));
            out.extend(pktline::encode_response_end());
            out
        };
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn fetch_with_no_wants_skips_straight_to_upload_pack() {
        let mut git = MockGitOps::new();
        git.expect_upload_pack()
            .with(always(), always())
            .returning(|_, _| Err(Error::internal(anyhow::anyhow!("reached upload_pack as expected"))));

        let repo = ManagedRepository {
            canonical_url: "https://example.com/org/repo".to_string(),
            local_path: PathBuf::from("/irrelevant"),
            git: Arc::new(git),
            state: RwLock::new(RepoState {
                last_update: SystemTime::now(),
            }),
        };

        let command = sample_command("fetch", &["done"]);
        let err = repo.fetch(&command, None).await.unwrap_err();
        assert!(err.message.contains("reached upload_pack"));
    }
}
