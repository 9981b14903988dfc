use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::{AppContext, handler};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn start_listener(app: AppContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    let bind_addr = app.settings.listen_addr;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    serve_listener(app, listener, shutdown).await
}

/// Accept loop over a pre-bound listener. Stops accepting when `shutdown`
/// flips, drains in-flight connections within the grace window, then closes
/// the cache (final index write, pending downloads aborted).
pub async fn serve_listener(
    app: AppContext,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tls_acceptor = match (&app.settings.tls_cert_file, &app.settings.tls_key_file) {
        (Some(cert), Some(key)) => Some(super::tls::build_tls_acceptor(cert, key)?),
        _ => None,
    };

    let local_addr = listener.local_addr().unwrap_or(app.settings.listen_addr);
    info!(
        address = %local_addr,
        upstream = %app.settings.upstream_url,
        cache_dir = %app.settings.cache_dir.display(),
        max_cache_size = app.settings.max_cache_size,
        tls = tls_acceptor.is_some(),
        "proxy listener started"
    );

    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept incoming connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY on client stream");
                }
                let connection_app = app.clone();
                let acceptor = tls_acceptor.clone();
                connections.spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, peer_addr, connection_app, acceptor).await
                    {
                        debug!(peer = %peer_addr, error = %err, "connection closed with error");
                    }
                });
            }
            // Reap finished connection tasks so the set stays small.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    info!(in_flight = connections.len(), "shutting down; draining connections");
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace window elapsed; aborting remaining connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    app.cache.close().await;
    info!("proxy stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    match tls_acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .context("TLS handshake with client failed")?;
            handler::serve_connection(tls, peer, app).await
        }
        None => handler::serve_connection(stream, peer, app).await,
    }
}
