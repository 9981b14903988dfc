use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use edgestash::cache::FileCache;
use edgestash::cli::LogFormat;
use edgestash::proxy::{self, AppContext, upstream::UpstreamClient};
use edgestash::settings::Settings;

/// A proxy instance bound to an ephemeral port on a private cache root.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    _tmp: Option<TempDir>,
}

pub fn test_settings(upstream_url: &str, cache_dir: &Path) -> Settings {
    Settings {
        listen_addr: "127.0.0.1:0".parse().expect("loopback addr"),
        upstream_url: upstream_url.to_string(),
        cache_dir: cache_dir.to_path_buf(),
        max_cache_size: 64 * 1024 * 1024,
        default_cache_ttl: 3600,
        notfound_cache_ttl: 5,
        upstream_timeout: 10,
        upstream_connect_timeout: 2,
        client_timeout: 5,
        max_idle_conns: 8,
        max_idle_conns_per_host: 4,
        index_save_interval: 3600,
        log: LogFormat::Text,
        tls_cert_file: None,
        tls_key_file: None,
        metrics_listen: None,
    }
}

impl TestProxy {
    pub async fn start(upstream_url: &str) -> Result<Self> {
        Self::start_with(upstream_url, |_| {}).await
    }

    pub async fn start_with(
        upstream_url: &str,
        tweak: impl FnOnce(&mut Settings),
    ) -> Result<Self> {
        let tmp = TempDir::new().context("failed to create cache tempdir")?;
        let cache_dir = tmp.path().to_path_buf();
        Self::start_inner(upstream_url, cache_dir, Some(tmp), tweak).await
    }

    /// Starts on an existing cache root; used by restart-recovery tests.
    pub async fn start_in(upstream_url: &str, cache_dir: PathBuf) -> Result<Self> {
        Self::start_inner(upstream_url, cache_dir, None, |_| {}).await
    }

    async fn start_inner(
        upstream_url: &str,
        cache_dir: PathBuf,
        tmp: Option<TempDir>,
        tweak: impl FnOnce(&mut Settings),
    ) -> Result<Self> {
        let mut settings = test_settings(upstream_url, &cache_dir);
        tweak(&mut settings);
        settings.validate()?;
        let settings = Arc::new(settings);

        let cache = FileCache::open(
            settings.cache_dir.clone(),
            settings.max_cache_size,
            settings.default_cache_ttl(),
            settings.notfound_cache_ttl(),
            settings.index_save_interval(),
        )
        .await?;
        let upstream = Arc::new(UpstreamClient::new(&settings)?);
        let app = AppContext::new(settings, cache, upstream);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(proxy::listener::serve_listener(app, listener, shutdown_rx));

        Ok(Self {
            addr,
            cache_dir,
            shutdown,
            task,
            _tmp: tmp,
        })
    }

    /// Graceful shutdown: drains connections and writes the index.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .context("proxy shutdown timed out")??
    }

    /// Shuts the proxy down but keeps the cache root on disk for a restart.
    pub async fn shutdown_keep_dir(self) -> Result<TempDir> {
        let tmp = self._tmp;
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .context("proxy shutdown timed out")???;
        tmp.context("proxy was not started on a tempdir")
    }
}
