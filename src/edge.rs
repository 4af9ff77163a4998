//! The HTTP/Git protocol edge (spec.md §4.1): authenticate, validate the
//! protocol version, route to `ls-refs`/`fetch`, shape the response.
//!
//! Grounded on the teacher's `server.rs`: the same tower-http layer stack
//! (request-id, sensitive-header redaction, tracing, gzip decompression,
//! `Server` header), generalised from a single hardcoded `git-upload-pack`
//! relay into the full protocol-v2 command dispatch spec.md §4.4 describes.

use std::collections::HashMap;
use std::iter::once;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::request_id::{MakeRequestUuid, RequestId};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tower_http::ServiceBuilderExt;
use tracing::Span;

use crate::config::{AppConfig, RequestEvent};
use crate::error::{Error, Result};
use crate::pktline;
use crate::protocol::{self, LsRefsArgs};
use crate::registry::Registry;
use crate::upstream::UpstreamClient;

pub const APP_NAME: &str = "goblet";

const HEALTH_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_DEGRADED_THRESHOLD: Duration = Duration::from_secs(2);

struct AppState {
    config: Arc<AppConfig>,
    registry: Arc<Registry>,
    upstream: Arc<UpstreamClient>,
}

/// Builds the full router: `/healthz`, the catch-all Git protocol dispatch,
/// and the tower-http layer stack applied to every request.
pub fn build_router(config: Arc<AppConfig>, registry: Arc<Registry>, upstream: Arc<UpstreamClient>) -> Router {
    let state = Arc::new(AppState {
        config,
        registry,
        upstream,
    });

    Router::new()
        .route("/healthz", get(healthz))
        .fallback(any(dispatch))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .set_x_request_id(MakeRequestUuid)
                .layer(SetSensitiveRequestHeadersLayer::new(once(header::AUTHORIZATION)))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &axum::http::Request<_>| {
                            let request_id = request.extensions().get::<RequestId>().map(RequestId::header_value);
                            tracing::info_span!("request", ?request_id)
                        })
                        .on_response(
                            |response: &axum::http::Response<
                                tower_http::body::UnsyncBoxBody<bytes::Bytes, Box<dyn std::error::Error + Send + Sync>>,
                            >,
                             latency: Duration,
                             _: &Span| {
                                tracing::info!(?latency, status = response.status().as_u16(), "done");
                            },
                        ),
                )
                .layer(RequestDecompressionLayer::new())
                .propagate_x_request_id()
                .layer(SetResponseHeaderLayer::overriding(
                    header::SERVER,
                    header::HeaderValue::from_static(APP_NAME),
                )),
        )
}

/// Times every request and reports it via the externally supplied
/// [`crate::config::RequestLogger`] (spec.md §4.1 step 7), then converts
/// whatever [`handle`] returned into a real HTTP response.
async fn dispatch(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_bytes = content_length(request.headers());

    let response = match handle(&state, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    let response_bytes = content_length(response.headers());
    state.config.request_logger.log(RequestEvent {
        method: method.to_string(),
        path,
        status: response.status().as_u16(),
        request_bytes,
        response_bytes,
        latency: start.elapsed(),
    });

    response
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

async fn handle(state: &AppState, request: Request<Body>) -> Result<Response> {
    state.config.request_authoriser.authorise(request.headers()).await?;

    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let protocol_version_ok = request
        .headers()
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "version=2")
        .unwrap_or(false);
    if !protocol_version_ok {
        return Err(Error::invalid_argument(
            "missing or unsupported Git-Protocol header; only version=2 is supported",
        ));
    }

    if path.ends_with("/git-receive-pack") {
        return Ok(StatusCode::NOT_IMPLEMENTED.into_response());
    }

    if request.method() == Method::GET && path.ends_with("/info/refs") {
        if query.as_deref() != Some("service=git-upload-pack") {
            return Err(Error::invalid_argument("info/refs requires service=git-upload-pack"));
        }
        return Ok(capability_advertisement());
    }

    if request.method() == Method::POST && path.ends_with("/git-upload-pack") {
        return handle_git_upload_pack(state, &path, request).await;
    }

    Err(Error::not_found("no route matches this request"))
}

fn capability_advertisement() -> Response {
    let mut out = Vec::new();
    out.extend(pktline::encode_data(b"# service=git-upload-pack\n"));
    out.extend(pktline::encode_flush());
    out.extend(pktline::encode_data(b"version 2\n"));
    out.extend(pktline::encode_data(b"ls-refs\n"));
    out.extend(pktline::encode_data(b"fetch=shallow filter\n"));
    out.extend(pktline::encode_data(b"server-option\n"));
    out.extend(pktline::encode_flush());

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-advertisement"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        out,
    )
        .into_response()
}

async fn handle_git_upload_pack(state: &AppState, path: &str, request: Request<Body>) -> Result<Response> {
    let canonical_url = state.config.url_canonicaliser.canonicalise(path).await?;
    let repo = state.registry.lookup_or_create(&canonical_url).await?;

    let body = request
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::invalid_argument(format!("failed to read request body: {e}")))?
        .to_bytes();

    let upstream = state.config.is_upstream_enabled().then_some(state.upstream.as_ref());
    let commands = protocol::parse_commands(body)?;

    let mut out = Vec::new();
    for command in &commands {
        let result = run_one_command(state, &repo, command, upstream, &mut out).await;
        if let Err(e) = result {
            // spec.md §7 "User-visible behaviour": once earlier commands in
            // this body have already produced output, a later failure can no
            // longer change the HTTP status — write a best-effort `ERR` pkt
            // line into the stream instead of discarding what was built so
            // far. A failure on the very first command still surfaces as a
            // normal HTTP error, since nothing has been streamed yet.
            if out.is_empty() {
                return Err(e);
            }
            out.extend(crate::error::err_pkt_line(&e.message));
            break;
        }
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        out,
    )
        .into_response())
}

async fn run_one_command(
    state: &AppState,
    repo: &crate::repo::ManagedRepository,
    command: &protocol::Command,
    upstream: Option<&UpstreamClient>,
    out: &mut Vec<u8>,
) -> Result<()> {
    match command.name.as_str() {
        "ls-refs" => {
            let args = LsRefsArgs::from_command(command);
            let (bytes, _source) = repo.ls_refs(&args, command.raw.clone(), upstream).await?;
            out.extend(bytes);
            Ok(())
        }
        "fetch" => {
            let spawned = repo.fetch(command, upstream).await?;
            let (mut stdout, tail) = spawned.into_stdout();
            tokio::io::AsyncReadExt::read_to_end(&mut stdout, out)
                .await
                .map_err(Error::from)?;
            let operation = state.config.operation_logger.start("upload-pack");
            match tail.wait(|line| tracing::debug!(upload_pack_stderr = line, "git upload-pack")).await {
                Ok(()) => {
                    operation.finish(Ok(()));
                    Ok(())
                }
                Err(e) => {
                    operation.finish(Err(&e.message));
                    Err(e)
                }
            }
        }
        other => Err(Error::invalid_argument(format!("unsupported command: {other}"))),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

struct ComponentHealth {
    status: HealthState,
    message: String,
    latency: Duration,
}

async fn healthz(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
    let detailed = params.get("detailed").map(String::as_str) == Some("true");
    if !detailed {
        return (StatusCode::OK, "ok\n").into_response();
    }

    let outer = tokio::time::timeout(Duration::from_secs(10), detailed_health(&state)).await;
    let (storage, cache) = match outer {
        Ok(result) => result,
        Err(_) => (
            ComponentHealth {
                status: HealthState::Unhealthy,
                message: "health check timed out".to_string(),
                latency: Duration::from_secs(10),
            },
            ComponentHealth {
                status: HealthState::Unhealthy,
                message: "health check timed out".to_string(),
                latency: Duration::ZERO,
            },
        ),
    };

    let overall = storage.status.max(cache.status);
    let status_code = if overall == HealthState::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = json!({
        "status": overall.as_str(),
        "timestamp": unix_timestamp_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "storage": {
                "status": storage.status.as_str(),
                "message": storage.message,
                "latency_ms": storage.latency.as_millis() as u64,
            },
            "cache": {
                "status": cache.status.as_str(),
                "message": cache.message,
            },
        },
    });

    (status_code, Json(body)).into_response()
}

async fn detailed_health(state: &AppState) -> (ComponentHealth, ComponentHealth) {
    let storage = match &state.config.object_store {
        None => ComponentHealth {
            status: HealthState::Healthy,
            message: "no object store configured".to_string(),
            latency: Duration::ZERO,
        },
        Some(store) => {
            let start = Instant::now();
            let probe = tokio::time::timeout(HEALTH_STORAGE_TIMEOUT, store.list("")).await;
            let latency = start.elapsed();
            match probe {
                Ok(Ok(_)) if latency > HEALTH_DEGRADED_THRESHOLD => ComponentHealth {
                    status: HealthState::Degraded,
                    message: format!("object store reachable but slow ({}ms)", latency.as_millis()),
                    latency,
                },
                Ok(Ok(_)) => ComponentHealth {
                    status: HealthState::Healthy,
                    message: "ok".to_string(),
                    latency,
                },
                Ok(Err(e)) => ComponentHealth {
                    status: HealthState::Unhealthy,
                    message: format!("object store error: {}", e.message),
                    latency,
                },
                Err(_) => ComponentHealth {
                    status: HealthState::Unhealthy,
                    message: "object store probe timed out".to_string(),
                    latency,
                },
            }
        }
    };

    let managed = state.registry.iterate().len();
    let cache = ComponentHealth {
        status: HealthState::Healthy,
        message: format!("{managed} managed repositories"),
        latency: Duration::ZERO,
    };

    (storage, cache)
}

fn unix_timestamp_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
