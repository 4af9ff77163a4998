//! Wraps the external `git` binary (spec.md §1, §9 "Child-process
//! orchestration"). The core never rewrites object data itself; every
//! mutating or pack-producing operation shells out to `git`.
//!
//! Grounded on the teacher's `GitOps`/`GitCli` split (`src/git.rs`): a small
//! trait so the cache-decision logic in [`crate::repo`] can be exercised
//! against a mock, and one concrete implementation that spawns real child
//! processes.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::config::Token;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub oid: String,
    pub name: String,
}

/// A spawned `git` child process whose stdout is streamed to the caller
/// (`git upload-pack`, `git bundle create`). [`SpawnedProcess::into_stdout`]
/// splits it into the readable half and a [`SpawnedProcessTail`] that must be
/// awaited once the caller is done reading, to surface a non-zero exit status.
#[derive(Debug)]
pub struct SpawnedProcess {
    child: Child,
    stdout: tokio::process::ChildStdout,
    stdin_write: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl SpawnedProcess {
    pub fn stdout(&mut self) -> &mut (impl AsyncRead + Unpin) {
        &mut self.stdout
    }

    pub fn into_stdout(self) -> (tokio::process::ChildStdout, SpawnedProcessTail) {
        (
            self.stdout,
            SpawnedProcessTail {
                child: self.child,
                stdin_write: self.stdin_write,
            },
        )
    }
}

/// The parts of a [`SpawnedProcess`] needed to wait for completion once its
/// stdout has been handed off to a response stream.
pub struct SpawnedProcessTail {
    child: Child,
    stdin_write: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
}

impl SpawnedProcessTail {
    /// Waits for the child to exit, reporting stderr lines to `on_stderr` and
    /// returning `Internal` on a non-zero exit, per spec.md §4.4.2 step 4.
    pub async fn wait(mut self, on_stderr: impl Fn(&str) + Send + 'static) -> Result<()> {
        let stderr = self.child.stderr.take();
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    on_stderr(&line);
                }
            })
        });

        if let Some(stdin_write) = self.stdin_write {
            let _ = stdin_write.await;
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::internal(anyhow::Error::new(e)))?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        if !status.success() {
            return Err(Error::new(
                crate::error::Code::Internal,
                format!("git child process exited with {status}"),
            ));
        }
        Ok(())
    }
}

/// Everything the managed-repository layer needs from `git`, kept mockable so
/// the cache-decision engine (spec.md §4.4.2) can be unit tested without
/// spawning real subprocesses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitOps: Send + Sync + 'static {
    /// `git init --bare` plus the protocol-v2/filter/bitmap config and the
    /// `origin --mirror=fetch` remote (spec.md §3 "Managed repository").
    async fn init_mirror(&self, path: &Path, upstream_url: &str) -> Result<()>;

    /// Whether the mirror already has a `HEAD` (spec.md §4.4.3 step 2).
    async fn has_head(&self, path: &Path) -> Result<bool>;

    /// `git fetch origin refs/heads/*:refs/heads/* refs/changes/*:refs/changes/*`
    /// — the latency optimisation for repositories with many non-branch refs
    /// (spec.md §4.4.3 step 2).
    async fn fetch_heads_and_changes<'a>(&self, path: &Path, auth: Option<&'a Token>) -> Result<()>;

    /// `git fetch origin` (full mirror refresh).
    async fn fetch_all<'a>(&self, path: &Path, auth: Option<&'a Token>) -> Result<()>;

    /// All refs currently in the local mirror, as (oid, refname) pairs.
    async fn list_refs(&self, path: &Path) -> Result<Vec<RefEntry>>;

    /// Resolves a symbolic ref (typically `HEAD`) to its target ref name, or
    /// `None` if it is not symbolic / does not exist.
    async fn symbolic_ref_target(&self, path: &Path, name: &str) -> Result<Option<String>>;

    /// Whether `path` contains an object reachable from some ref (used for
    /// the `hasAllWants` predicate of spec.md §4.4.2 step 2).
    async fn has_object(&self, path: &Path, oid: &str) -> Result<bool>;

    /// `git upload-pack --stateless-rpc <path>`, feeding `input` on stdin and
    /// streaming stdout back (spec.md §4.4.2 step 4).
    async fn upload_pack(&self, path: &Path, input: Bytes) -> Result<SpawnedProcess>;

    /// `git bundle create - --all`, streaming stdout (spec.md §4.4.4).
    async fn bundle_create(&self, path: &Path) -> Result<SpawnedProcess>;

    /// `git fetch --progress -f <bundle_path> refs/*:refs/*` (spec.md §4.4.4
    /// restore-from-bundle).
    async fn bundle_restore(&self, path: &Path, bundle_path: &Path) -> Result<()>;
}

/// Shells out to a real `git` binary. The child environment is scrubbed
/// (spec.md §9 "Child-process orchestration"): no inherited `GIT_*`
/// variables, no system/global config.
pub struct GitCli {
    git_binary: std::path::PathBuf,
}

impl GitCli {
    /// Locates the `git` binary and fails fast if it is absent, per spec.md
    /// §9 ("locate the binary at startup and fail fast if absent").
    pub fn discover() -> Result<Self> {
        let output = std::process::Command::new("git")
            .arg("--version")
            .output()
            .map_err(|e| {
                Error::new(
                    crate::error::Code::Internal,
                    format!("could not locate the `git` binary: {e}"),
                )
            })?;
        if !output.status.success() {
            return Err(Error::new(
                crate::error::Code::Internal,
                "`git --version` exited with a failure status",
            ));
        }
        Ok(Self {
            git_binary: std::path::PathBuf::from("git"),
        })
    }

    fn command(&self, path: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.git_binary);
        cmd.env_clear();
        if let Ok(path_var) = std::env::var("PATH") {
            cmd.env("PATH", path_var);
        }
        cmd.env("GIT_CONFIG_NOSYSTEM", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.arg("-C").arg(path);
        cmd.args(args);
        cmd
    }

    fn auth_args(auth: Option<&Token>) -> Vec<String> {
        match auth.and_then(Token::authorization_header) {
            Some(header) => vec![
                "-c".to_string(),
                format!("http.extraHeader=Authorization: {header}"),
            ],
            None => Vec::new(),
        }
    }

    async fn run(&self, path: &Path, args: &[&str]) -> Result<std::process::Output> {
        let output = self
            .command(path, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::internal(anyhow::Error::new(e)))?;
        if !output.status.success() {
            return Err(Error::new(
                crate::error::Code::Internal,
                format!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr)
                ),
            ));
        }
        Ok(output)
    }

    /// `git fetch` with the `+refs/*:refs/*` mirror refspec never touches the
    /// bare repo's own `HEAD` (it is not under `refs/`). Discover upstream's
    /// symbolic `HEAD` target via `ls-remote --symref` and point our `HEAD` at
    /// it, the way `git clone --mirror` would. Best-effort: a remote that
    /// doesn't advertise a symref for `HEAD` leaves the existing `HEAD` alone.
    async fn update_head_from_remote(&self, path: &Path) {
        let Ok(output) = self.run(path, &["ls-remote", "--symref", "origin", "HEAD"]).await else {
            return;
        };
        let text = String::from_utf8_lossy(&output.stdout);
        let Some(target) = text.lines().find_map(|line| {
            line.strip_prefix("ref: ")
                .and_then(|rest| rest.split('\t').next())
        }) else {
            return;
        };
        let _ = self.run(path, &["symbolic-ref", "HEAD", target]).await;
    }

    async fn spawn(&self, path: &Path, args: &[&str], stdin: Option<Bytes>) -> Result<SpawnedProcess> {
        let mut cmd = self.command(path, args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::internal(anyhow::Error::new(e)))?;
        let stdout = child.stdout.take().expect("stdout was piped");

        let stdin_write = stdin.map(|data| {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            tokio::spawn(async move {
                stdin.write_all(&data).await?;
                stdin.shutdown().await
            })
        });

        Ok(SpawnedProcess {
            child,
            stdout,
            stdin_write,
        })
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn init_mirror(&self, path: &Path, upstream_url: &str) -> Result<()> {
        self.run(path, &["init", "--bare", "."]).await?;
        self.run(path, &["config", "protocol.version", "2"]).await?;
        self.run(path, &["config", "uploadpack.allowfilter", "true"])
            .await?;
        self.run(path, &["config", "uploadpack.allowrefinwant", "true"])
            .await?;
        self.run(path, &["config", "repack.writebitmaps", "true"])
            .await?;
        self.run(
            path,
            &["remote", "add", "--mirror=fetch", "origin", upstream_url],
        )
        .await?;
        Ok(())
    }

    async fn has_head(&self, path: &Path) -> Result<bool> {
        match self.run(path, &["rev-parse", "--verify", "-q", "HEAD"]).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn fetch_heads_and_changes<'a>(&self, path: &Path, auth: Option<&'a Token>) -> Result<()> {
        let auth_args = Self::auth_args(auth);
        let mut args: Vec<&str> = auth_args.iter().map(String::as_str).collect();
        args.extend([
            "fetch",
            "origin",
            "refs/heads/*:refs/heads/*",
            "refs/changes/*:refs/changes/*",
        ]);
        self.run(path, &args).await?;
        Ok(())
    }

    async fn fetch_all<'a>(&self, path: &Path, auth: Option<&'a Token>) -> Result<()> {
        let auth_args = Self::auth_args(auth);
        let mut args: Vec<&str> = auth_args.iter().map(String::as_str).collect();
        args.extend(["fetch", "origin"]);
        self.run(path, &args).await?;
        self.update_head_from_remote(path).await;
        Ok(())
    }

    async fn list_refs(&self, path: &Path) -> Result<Vec<RefEntry>> {
        let output = self
            .run(path, &["for-each-ref", "--format=%(objectname) %(refname)"])
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut refs = Vec::new();
        for line in text.lines() {
            if let Some((oid, name)) = line.split_once(' ') {
                refs.push(RefEntry {
                    oid: oid.to_string(),
                    name: name.to_string(),
                });
            }
        }
        Ok(refs)
    }

    async fn symbolic_ref_target(&self, path: &Path, name: &str) -> Result<Option<String>> {
        match self.run(path, &["symbolic-ref", "-q", name]).await {
            Ok(output) => {
                let target = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if target.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(target))
                }
            }
            Err(_) => Ok(None),
        }
    }

    async fn has_object(&self, path: &Path, oid: &str) -> Result<bool> {
        match self.run(path, &["cat-file", "-e", oid]).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn upload_pack(&self, path: &Path, input: Bytes) -> Result<SpawnedProcess> {
        self.spawn(path, &["upload-pack", "--stateless-rpc", "."], Some(input))
            .await
    }

    async fn bundle_create(&self, path: &Path) -> Result<SpawnedProcess> {
        self.spawn(path, &["bundle", "create", "-", "--all"], None).await
    }

    async fn bundle_restore(&self, path: &Path, bundle_path: &Path) -> Result<()> {
        let bundle = bundle_path.to_string_lossy().into_owned();
        self.run(
            path,
            &["fetch", "--progress", "-f", &bundle, "refs/*:refs/*"],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn make_upstream_with_a_commit() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        run_git(dir.path(), &["init", "-q", "-b", "main"]);
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        run_git(dir.path(), &["add", "a.txt"]);
        run_git(
            dir.path(),
            &[
                "-c", "user.email=t@example.com", "-c", "user.name=t", "commit", "-q", "-m", "init",
            ],
        );
        dir
    }

    #[tokio::test]
    async fn init_mirror_creates_a_bare_repo_with_a_mirror_remote() {
        let git = GitCli::discover().unwrap();
        let dir = tempdir().unwrap();

        git.init_mirror(dir.path(), "https://example.com/org/repo").await.unwrap();

        assert!(dir.path().join("HEAD").exists());
        assert!(!git.has_head(dir.path()).await.unwrap());

        let output = git
            .run(dir.path(), &["config", "--get", "remote.origin.url"])
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            "https://example.com/org/repo"
        );
    }

    #[tokio::test]
    async fn list_refs_and_symbolic_ref_reflect_a_populated_mirror() {
        let git = GitCli::discover().unwrap();
        let upstream_dir = make_upstream_with_a_commit();

        let mirror_dir = tempdir().unwrap();
        git.init_mirror(mirror_dir.path(), upstream_dir.path().to_str().unwrap())
            .await
            .unwrap();
        git.fetch_all(mirror_dir.path(), None).await.unwrap();

        assert!(git.has_head(mirror_dir.path()).await.unwrap());
        let refs = git.list_refs(mirror_dir.path()).await.unwrap();
        assert!(refs.iter().any(|r| r.name == "refs/heads/main"));

        let target = git.symbolic_ref_target(mirror_dir.path(), "HEAD").await.unwrap();
        assert_eq!(target.as_deref(), Some("refs/heads/main"));
    }

    #[tokio::test]
    async fn bundle_create_and_restore_round_trip() {
        let git = GitCli::discover().unwrap();
        let upstream_dir = make_upstream_with_a_commit();

        let mirror_dir = tempdir().unwrap();
        git.init_mirror(mirror_dir.path(), upstream_dir.path().to_str().unwrap())
            .await
            .unwrap();
        git.fetch_all(mirror_dir.path(), None).await.unwrap();

        let spawned = git.bundle_create(mirror_dir.path()).await.unwrap();
        let (mut stdout, tail) = spawned.into_stdout();
        let mut bundle_bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut bundle_bytes)
            .await
            .unwrap();
        tail.wait(|_| {}).await.unwrap();

        let bundle_path = mirror_dir.path().parent().unwrap().join("out.bundle");
        std::fs::write(&bundle_path, &bundle_bytes).unwrap();

        let restored_dir = tempdir().unwrap();
        git.init_mirror(restored_dir.path(), upstream_dir.path().to_str().unwrap())
            .await
            .unwrap();
        git.bundle_restore(restored_dir.path(), &bundle_path)
            .await
            .unwrap();

        let refs = git.list_refs(restored_dir.path()).await.unwrap();
        assert!(refs.iter().any(|r| r.name == "refs/heads/main"));
    }

    #[tokio::test]
    async fn has_object_reports_presence_correctly() {
        let git = GitCli::discover().unwrap();
        let upstream_dir = make_upstream_with_a_commit();
        let oid_output = git
            .run(upstream_dir.path(), &["rev-parse", "HEAD"])
            .await
            .unwrap();
        let oid = String::from_utf8_lossy(&oid_output.stdout).trim().to_string();

        assert!(git.has_object(upstream_dir.path(), &oid).await.unwrap());
        assert!(!git
            .has_object(upstream_dir.path(), "1111111111111111111111111111111111111111")
            .await
            .unwrap());
    }
}
