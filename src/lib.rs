pub mod buffer;
pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{cache::FileCache, proxy::upstream::UpstreamClient, settings::Settings};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let cache = FileCache::open(
        settings.cache_dir.clone(),
        settings.max_cache_size,
        settings.default_cache_ttl(),
        settings.notfound_cache_ttl(),
        settings.index_save_interval(),
    )
    .await?;
    let upstream = Arc::new(UpstreamClient::new(&settings)?);

    let app = proxy::AppContext::new(settings, cache, upstream);
    let shutdown = spawn_signal_listener();
    proxy::run(app, shutdown).await
}

/// Flips the returned watch channel on SIGINT or SIGTERM.
fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
