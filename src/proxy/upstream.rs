use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::settings::{Scheme, Settings, UpstreamTarget};
use crate::util::write_all_with_deadline;

use super::http::response::{UpstreamResponseHead, read_response_head};

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// A plain or TLS-wrapped upstream connection.
pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

struct IdleConnection {
    io: UpstreamIo,
    idle_since: Instant,
}

/// Issued request whose head has been read; the body remains on the reader.
pub(crate) struct UpstreamExchange {
    pub head: UpstreamResponseHead,
    pub reader: BufReader<UpstreamIo>,
    pub reused: bool,
}

/// HTTP/1.1 client for the single configured origin, with a bounded pool of
/// idle connections.
pub struct UpstreamClient {
    target: UpstreamTarget,
    tls: Option<TlsConnector>,
    idle: Mutex<VecDeque<IdleConnection>>,
    max_idle: usize,
    connect_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let target = UpstreamTarget::parse(&settings.upstream_url)?;
        let tls = match target.scheme {
            Scheme::Http => None,
            Scheme::Https => Some(build_tls_connector()?),
        };
        // One configured origin means the per-host limit is the effective
        // pool bound; the global limit still caps it.
        let max_idle = settings
            .max_idle_conns_per_host
            .min(settings.max_idle_conns);
        Ok(Self {
            target,
            tls,
            idle: Mutex::new(VecDeque::new()),
            max_idle,
            connect_timeout: settings.upstream_connect_timeout(),
        })
    }

    /// Issues `GET <base><key>` and reads the response head, reusing an idle
    /// connection when one is available. All waits are bounded by `deadline`.
    pub(crate) async fn send_get(&self, key: &str, deadline: Instant) -> Result<UpstreamExchange> {
        if let Some(io) = self.take_idle() {
            match self.exchange(io, key, deadline).await {
                Ok(mut exchange) => {
                    exchange.reused = true;
                    return Ok(exchange);
                }
                Err(err) => {
                    debug!(error = %err, "pooled upstream connection failed; reconnecting");
                }
            }
        }

        let io = self.connect(deadline).await?;
        self.exchange(io, key, deadline).await
    }

    /// Returns a connection whose response body was fully consumed through a
    /// reusable framing.
    pub(crate) fn release(&self, io: UpstreamIo) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push_back(IdleConnection {
                io,
                idle_since: Instant::now(),
            });
        }
    }

    fn take_idle(&self) -> Option<UpstreamIo> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop_front() {
            if conn.idle_since.elapsed() < IDLE_CONNECTION_TIMEOUT {
                return Some(conn.io);
            }
            // Stale; drop it and keep looking.
        }
        None
    }

    async fn exchange(
        &self,
        mut io: UpstreamIo,
        key: &str,
        deadline: Instant,
    ) -> Result<UpstreamExchange> {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept-Encoding: identity\r\n\r\n",
            self.target.request_target(key),
            self.target.host_header(),
        );
        write_all_with_deadline(&mut io, request.as_bytes(), deadline, "writing upstream request")
            .await?;

        let mut reader = BufReader::new(io);
        let head_timeout = remaining_until(deadline)?;
        let head = read_response_head(&mut reader, head_timeout).await?;
        Ok(UpstreamExchange {
            head,
            reader,
            reused: false,
        })
    }

    async fn connect(&self, deadline: Instant) -> Result<UpstreamIo> {
        let resolve_timeout = self.connect_timeout.min(remaining_until(deadline)?);
        let addrs: Vec<_> = timeout(
            resolve_timeout,
            lookup_host((self.target.host.as_str(), self.target.port)),
        )
        .await
        .map_err(|_| anyhow!("resolving upstream host {} timed out", self.target.host))?
        .with_context(|| format!("failed to resolve upstream host {}", self.target.host))?
        .collect();
        ensure!(
            !addrs.is_empty(),
            "upstream host {} resolved to no addresses",
            self.target.host
        );

        let mut last_err = None;
        for addr in &addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(addr = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
                    }
                    debug!(addr = %addr, "connected to upstream");
                    return self.wrap_tls(stream).await;
                }
                Ok(Err(err)) => {
                    last_err = Some(
                        anyhow::Error::new(err)
                            .context(format!("failed to connect to {addr}")),
                    );
                }
                Err(_) => {
                    last_err = Some(anyhow!("connection to {addr} timed out"));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no addresses to connect to upstream")))
    }

    async fn wrap_tls(&self, stream: TcpStream) -> Result<UpstreamIo> {
        let Some(connector) = &self.tls else {
            return Ok(UpstreamIo::Plain(stream));
        };
        let server_name = ServerName::try_from(self.target.host.as_str())
            .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", self.target.host))?
            .to_owned();
        let tls = timeout(self.connect_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| anyhow!("TLS handshake with upstream timed out"))?
            .with_context(|| {
                format!(
                    "failed to establish TLS with upstream {}:{}",
                    self.target.host, self.target.port
                )
            })?;
        Ok(UpstreamIo::Tls(Box::new(tls)))
    }
}

fn build_tls_connector() -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!(error = %err, "failed to load a system trust anchor");
    }
    let (added, ignored) = root_store.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        warn!(ignored, "ignored {ignored} invalid system trust anchors");
    }
    ensure!(
        added > 0,
        "no trust anchors available; install system certificates"
    );

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

fn remaining_until(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("upstream request deadline exceeded"))
}
