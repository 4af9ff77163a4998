//! External collaborators (spec.md §6) and CLI wiring.
//!
//! spec.md explicitly treats command-line/configuration parsing, the inbound
//! authentication scheme, outbound token generation, and logging backends as
//! external to the core. This module defines the trait objects the core calls
//! into for each, ships minimal default implementations so `goblet` runs
//! standalone (see SPEC_FULL.md "Ambient stack" §A), and defines the
//! `clap`-derived `Options` the teacher's `main.rs`/`lib.rs` pattern expects.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::Uri;
use clap::Parser;

use crate::error::{Error, Result};
use crate::objectstore::ObjectStore;

/// A caching proxy for the Git smart-HTTP protocol (version 2).
///
/// Serves and updates local bare mirrors of upstream Git repositories,
/// answering as much as possible from the local mirror.
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Options {
    /// Directory holding one bare mirror per managed repository.
    #[arg(long, default_value = "/var/cache/goblet", name = "PATH")]
    pub cache_root: PathBuf,

    /// Bind to port.
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Whether outbound upstream calls are attempted. Disable to force the
    /// proxy to serve strictly from local mirrors (spec.md §6 `upstream_enabled`).
    #[arg(long, default_value = "true")]
    pub upstream_enabled: bool,

    /// Root directory for the bundled filesystem object-store driver. Backups
    /// are disabled unless this and `backup_manifest_name` are both set.
    #[arg(long)]
    pub object_store_root: Option<PathBuf>,

    /// Logical name namespacing this deployment's backup manifests.
    #[arg(long)]
    pub backup_manifest_name: Option<String>,

    /// Backup cycle period, in seconds.
    #[arg(long, default_value = "3600")]
    pub backup_period_secs: u64,

    /// Restore mirrors from the most recent backup manifest before serving.
    #[arg(long, default_value = "false")]
    pub restore_on_start: bool,
}

/// Opaque upstream authentication token (spec.md §3). Tokens are never cached
/// by the core — they are fetched fresh for every upstream interaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Token {
    pub scheme: String,
    pub value: String,
}

impl Token {
    pub fn none() -> Self {
        Token::default()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// The `Authorization` header value, or `None` for public repositories
    /// (spec.md §3: "absent when value is empty").
    pub fn authorization_header(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(format!("{} {}", self.scheme, self.value))
        }
    }
}

/// Maps a client-visible request URL to the canonical upstream URL that
/// identifies the cached repository (spec.md §3, §6).
#[async_trait]
pub trait UrlCanonicaliser: Send + Sync + 'static {
    async fn canonicalise(&self, request_path: &str) -> Result<String>;
}

/// Authorises an inbound request. `Ok(())` means authorised; an `Err` carries
/// the canonical code to report (spec.md §4.1 step 1).
#[async_trait]
pub trait RequestAuthoriser: Send + Sync + 'static {
    async fn authorise(&self, headers: &axum::http::HeaderMap) -> Result<()>;
}

/// Produces a fresh token for a canonical upstream URL (spec.md §3, §9).
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token_for(&self, canonical_url: &str) -> Result<Token>;
}

/// Receives one event per completed client request (spec.md §4.1 step 7).
pub trait RequestLogger: Send + Sync + 'static {
    fn log(&self, event: RequestEvent);
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub latency: Duration,
}

/// Receives progress/completion reports for long-running operations (upstream
/// fetches, bundle writes) per spec.md §6 `long_running_operation_logger`.
pub trait OperationLogger: Send + Sync + 'static {
    fn start(&self, name: &str) -> Box<dyn OperationHandle>;
}

pub trait OperationHandle: Send {
    fn progress(&self, message: &str);
    fn finish(self: Box<Self>, result: std::result::Result<(), &str>);
}

/// Receives asynchronous errors the originating request can no longer observe
/// (spec.md §6 `error_reporter`), e.g. a backup-cycle failure.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, context: &str, error: &Error);
}

/// Strips Git endpoint suffixes and a trailing `.git`, matching spec.md §3's
/// canonicalisation invariant: two requests for the same logical repository
/// must canonicalise identically, and the result must be safe to use as a
/// filesystem path component once host and path are joined.
pub struct DefaultCanonicaliser;

#[async_trait]
impl UrlCanonicaliser for DefaultCanonicaliser {
    async fn canonicalise(&self, request_path: &str) -> Result<String> {
        let stripped = request_path
            .strip_suffix("/info/refs")
            .or_else(|| request_path.strip_suffix("/git-upload-pack"))
            .or_else(|| request_path.strip_suffix("/git-receive-pack"))
            .unwrap_or(request_path);
        let stripped = stripped.strip_suffix(".git").unwrap_or(stripped);

        // Request paths carry no scheme of their own (e.g.
        // `/example.com/org/repo/info/refs`); assume `https` the way the
        // teacher's server does (`format!("https:/{}", upstream)`).
        let with_scheme = if stripped.contains("://") {
            stripped.to_string()
        } else {
            format!("https:/{stripped}")
        };

        let uri: Uri = with_scheme
            .parse()
            .map_err(|_| Error::invalid_argument(format!("unparseable upstream url: {with_scheme}")))?;
        let scheme = uri.scheme_str().unwrap_or("");
        if scheme != "http" && scheme != "https" {
            return Err(Error::invalid_argument(format!(
                "unsupported scheme for upstream url: {with_scheme}"
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| Error::invalid_argument("upstream url is missing a host"))?;
        let path = uri.path().trim_start_matches('/').trim_end_matches('/');
        Ok(format!("{scheme}://{}/{path}", host.to_lowercase()))
    }
}

/// Authorises every request. A real deployment supplies its own
/// [`RequestAuthoriser`] — the concrete authentication scheme is explicitly
/// out of the core's scope (spec.md §1).
pub struct AllowAllAuthoriser;

#[async_trait]
impl RequestAuthoriser for AllowAllAuthoriser {
    async fn authorise(&self, _headers: &axum::http::HeaderMap) -> Result<()> {
        Ok(())
    }
}

/// Returns an empty token, i.e. no `Authorization` header is sent upstream.
/// Suitable for public repositories; a real deployment supplies its own
/// [`TokenSource`] (concrete token generation is out of the core's scope,
/// spec.md §1).
pub struct StaticTokenSource(pub Token);

impl Default for StaticTokenSource {
    fn default() -> Self {
        Self(Token::none())
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token_for(&self, _canonical_url: &str) -> Result<Token> {
        Ok(self.0.clone())
    }
}

/// Reads a static bearer token from the environment on every call. Still
/// "regenerated for every upstream interaction" in the sense that the core
/// never caches it; whether the *value* changes is up to the environment.
pub struct EnvTokenSource {
    pub scheme_var: String,
    pub value_var: String,
}

impl EnvTokenSource {
    pub fn new() -> Self {
        Self {
            scheme_var: "GOBLET_UPSTREAM_SCHEME".to_string(),
            value_var: "GOBLET_UPSTREAM_TOKEN".to_string(),
        }
    }
}

impl Default for EnvTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for EnvTokenSource {
    async fn token_for(&self, _canonical_url: &str) -> Result<Token> {
        let value = std::env::var(&self.value_var).unwrap_or_default();
        let scheme = std::env::var(&self.scheme_var).unwrap_or_else(|_| "Bearer".to_string());
        Ok(Token { scheme, value })
    }
}

pub struct TracingRequestLogger;

impl RequestLogger for TracingRequestLogger {
    fn log(&self, event: RequestEvent) {
        tracing::info!(
            method = %event.method,
            path = %event.path,
            status = event.status,
            request_bytes = event.request_bytes,
            response_bytes = event.response_bytes,
            latency_ms = event.latency.as_millis() as u64,
            "request completed"
        );
    }
}

pub struct TracingOperationLogger;

impl OperationLogger for TracingOperationLogger {
    fn start(&self, name: &str) -> Box<dyn OperationHandle> {
        tracing::info!(operation = name, "operation started");
        Box::new(TracingOperationHandle {
            name: name.to_string(),
        })
    }
}

struct TracingOperationHandle {
    name: String,
}

impl OperationHandle for TracingOperationHandle {
    fn progress(&self, message: &str) {
        tracing::debug!(operation = %self.name, message, "operation progress");
    }

    fn finish(self: Box<Self>, result: std::result::Result<(), &str>) {
        match result {
            Ok(()) => tracing::info!(operation = %self.name, "operation finished"),
            Err(message) => tracing::warn!(operation = %self.name, error = message, "operation failed"),
        }
    }
}

pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, context: &str, error: &Error) {
        tracing::error!(context, code = ?error.code, error = %error.message, "asynchronous error");
    }
}

/// Bundles every external collaborator plus the derived runtime state the core
/// needs. One `AppConfig` is shared (via `Arc`) by the edge handler, the
/// registry, and the backup worker.
pub struct AppConfig {
    pub cache_root: PathBuf,
    pub upstream_enabled: Arc<AtomicBool>,
    pub url_canonicaliser: Arc<dyn UrlCanonicaliser>,
    pub request_authoriser: Arc<dyn RequestAuthoriser>,
    pub token_source: Arc<dyn TokenSource>,
    pub request_logger: Arc<dyn RequestLogger>,
    pub operation_logger: Arc<dyn OperationLogger>,
    pub error_reporter: Arc<dyn ErrorReporter>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub backup_manifest_name: Option<String>,
    pub backup_period: Duration,
}

impl AppConfig {
    pub fn from_options(options: &Options) -> std::io::Result<Self> {
        let object_store = options
            .object_store_root
            .as_ref()
            .map(|root| {
                crate::objectstore::FsObjectStore::new(root.clone())
                    .map(|store| Arc::new(store) as Arc<dyn ObjectStore>)
                    .map_err(std::io::Error::other)
            })
            .transpose()?;
        Ok(Self {
            cache_root: options.cache_root.clone(),
            upstream_enabled: Arc::new(AtomicBool::new(options.upstream_enabled)),
            url_canonicaliser: Arc::new(DefaultCanonicaliser),
            request_authoriser: Arc::new(AllowAllAuthoriser),
            token_source: Arc::new(StaticTokenSource::default()),
            request_logger: Arc::new(TracingRequestLogger),
            operation_logger: Arc::new(TracingOperationLogger),
            error_reporter: Arc::new(TracingErrorReporter),
            object_store,
            backup_manifest_name: options.backup_manifest_name.clone(),
            backup_period: Duration::from_secs(options.backup_period_secs),
        })
    }

    pub fn is_upstream_enabled(&self) -> bool {
        self.upstream_enabled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canonicalises_info_refs_and_upload_pack_identically() {
        let c = DefaultCanonicaliser;
        let a = c
            .canonicalise("https://example.com/org/repo.git/info/refs")
            .await
            .unwrap();
        let b = c
            .canonicalise("https://example.com/org/repo/git-upload-pack")
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "https://example.com/org/repo");
    }

    #[tokio::test]
    async fn rejects_unsupported_scheme() {
        let c = DefaultCanonicaliser;
        assert!(c.canonicalise("ftp://example.com/org/repo").await.is_err());
    }

    #[test]
    fn empty_token_has_no_authorization_header() {
        assert_eq!(Token::none().authorization_header(), None);
    }

    #[test]
    fn non_empty_token_formats_scheme_and_value() {
        let t = Token {
            scheme: "Bearer".into(),
            value: "abc123".into(),
        };
        assert_eq!(t.authorization_header().as_deref(), Some("Bearer abc123"));
    }
}
