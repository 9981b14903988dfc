use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::{Method, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_MAX_REQUEST_BYTES: usize = 16 * 1024;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "requests_total",
        "Proxied requests by method, status, and cache disposition",
    );
    let vec = IntCounterVec::new(opts, &["method", "status", "cache"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static CACHE_LOOKUPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookups_total", "Completed-store lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookups_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evictions_total", "Completed entries evicted")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static NOTFOUND_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("notfound_hits_total", "Requests answered from the negative cache")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register notfound_hits_total");
    counter
});

static UPSTREAM_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("upstream_requests_total", "Upstream fetches by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_requests_total");
    vec
});

static CACHE_SIZE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_size_bytes", "Bytes held by completed entries")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_size_bytes");
    gauge
});

static CACHE_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_pending", "In-flight streaming downloads")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_pending");
    gauge
});

pub fn record_request(method: &Method, status: StatusCode, cache: &str) {
    REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), status.as_str(), cache])
        .inc();
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_eviction() {
    CACHE_EVICTIONS_TOTAL.inc();
}

pub fn record_notfound_hit() {
    NOTFOUND_HITS_TOTAL.inc();
}

pub fn record_upstream_request(outcome: &str) {
    UPSTREAM_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_cache_size(bytes: u64) {
    CACHE_SIZE_BYTES.set(bytes.min(i64::MAX as u64) as i64);
}

pub fn set_cache_pending(pending: usize) {
    CACHE_PENDING.set(pending.min(i64::MAX as usize) as i64);
}

fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves `GET /metrics` on its own listener so the proxy surface stays
/// exactly `/health`, `/stats`, and proxied paths.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(stream: S) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let mut total_bytes = 0usize;

    let bytes = read_limited_line(&mut reader, &mut request_line, &mut total_bytes).await?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    // Consume and ignore headers until the empty line.
    loop {
        let mut line = String::new();
        let n = read_limited_line(&mut reader, &mut line, &mut total_bytes).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == "/metrics" {
        let body = gather();
        build_response(200, TextEncoder::new().format_type(), body)
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

async fn read_limited_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    total: &mut usize,
) -> Result<usize>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let read = timeout(METRICS_READ_TIMEOUT, reader.read_line(buf))
        .await
        .map_err(|_| anyhow::anyhow!("timed out reading metrics request"))??;
    *total += read;
    anyhow::ensure!(
        *total <= METRICS_MAX_REQUEST_BYTES,
        "metrics request exceeds {METRICS_MAX_REQUEST_BYTES} bytes"
    );
    Ok(read)
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
