//! `goblet`: a read-through caching proxy for the Git smart-HTTP protocol
//! (version 2). See `SPEC_FULL.md` for the full module-by-module contract.

use std::sync::Arc;

use tokio::net::TcpListener;

pub mod backup;
pub mod config;
pub mod edge;
pub mod error;
pub mod git;
pub mod objectstore;
pub mod pktline;
pub mod protocol;
pub mod registry;
pub mod repo;
pub mod upstream;

pub use config::Options;
pub use error::{Error, Result};

pub const APP_NAME: &str = "goblet";

/// Wires every collaborator from `options`, optionally restores the cache
/// from the latest backup manifest, starts the backup worker, and serves
/// until the process is killed — the teacher's `start()` entry point,
/// generalised from a single-mirror server to the full proxy.
pub async fn start(options: &config::Options) -> std::io::Result<()> {
    let config = Arc::new(config::AppConfig::from_options(options)?);
    let git = Arc::new(git::GitCli::discover().map_err(std::io::Error::other)?);
    let registry = Arc::new(registry::Registry::new(options.cache_root.clone(), git));
    let upstream = Arc::new(upstream::UpstreamClient::new(config.token_source.clone()));

    if options.restore_on_start {
        if let (Some(store), Some(manifest_name)) = (&config.object_store, &config.backup_manifest_name) {
            if let Err(e) = backup::restore_on_start(&registry, store.as_ref(), manifest_name).await {
                tracing::warn!(error = %e.message, "cold-start restore failed");
            }
        } else {
            tracing::warn!("restore_on_start requested but no object store / backup manifest name configured");
        }
    }

    if let (Some(store), Some(manifest_name)) = (&config.object_store, &config.backup_manifest_name) {
        let worker = backup::BackupWorker::new(registry.clone(), store.clone(), manifest_name.clone(), config.backup_period);
        tokio::spawn(async move { worker.run().await });
    }

    let router = edge::build_router(config, registry, upstream);

    let listener = TcpListener::bind(("0.0.0.0", options.port)).await?;
    tracing::info!(port = options.port, "listening");
    axum::serve(listener, router).await
}
