use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use http::StatusCode;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::util::with_timeout;

use super::AppContext;
use super::http::body::UpstreamBody;
use super::http::request::RequestHead;
use super::http::response::{
    BodyPlan, encode_response_head, finish_chunked, write_chunk, write_simple_response,
};
use super::serve::{self, Served};

/// Per-key fetch serialization. The holder of a key's gate is the only
/// request allowed to open a new upstream fetch for that key; it releases
/// the gate as soon as the pending entry is inserted (or a terminal status
/// is recorded), so a miss storm issues exactly one upstream GET and every
/// other request ends up tailing the streaming file.
#[derive(Clone, Default)]
pub(crate) struct FetchGates {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl FetchGates {
    async fn hold(&self, key: &str) -> GateHold {
        let gate = self
            .inner
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        let permit = gate.clone().lock_owned().await;
        GateHold {
            gates: self.clone(),
            key: key.to_string(),
            gate,
            permit: Some(permit),
        }
    }

    fn finish(&self, key: &str, gate: &Arc<AsyncMutex<()>>) {
        let mut map = self.inner.lock();
        if let Some(current) = map.get(key)
            && Arc::ptr_eq(current, gate)
        {
            map.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

struct GateHold {
    gates: FetchGates,
    key: String,
    gate: Arc<AsyncMutex<()>>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl GateHold {
    fn release(&mut self) {
        if self.permit.take().is_some() {
            self.gates.finish(&self.key, &self.gate);
        }
    }
}

impl Drop for GateHold {
    fn drop(&mut self) {
        self.release();
    }
}

/// The miss path: fetch from upstream, stream to the client, and populate
/// the cache through the pending [`StreamingFile`] on the way.
pub(crate) async fn fetch_and_serve<W>(
    writer: &mut W,
    app: &AppContext,
    head: &RequestHead,
    key: &str,
) -> Result<Served>
where
    W: AsyncWrite + Unpin,
{
    let mut gate = app.gates.hold(key).await;

    // Re-check every cache now that the gate is held: the previous holder
    // may have concluded the fetch while this request waited.
    if app.cache.is_not_found(key) {
        gate.release();
        write_simple_response(writer, StatusCode::NOT_FOUND, &[], "Not Found\n").await?;
        return Ok(Served::new(StatusCode::NOT_FOUND, 0, "NOTFOUND"));
    }
    if let Some(entry) = app.cache.get(key) {
        if serve::validate_entry(&entry) {
            gate.release();
            return serve::serve_hit(writer, app, head, &entry).await;
        }
        app.cache.remove(key);
    }
    if let Some(sf) = app.cache.get_pending(key).await {
        gate.release();
        return serve::serve_streaming(writer, app, head, sf).await;
    }

    let deadline = Instant::now() + app.settings.upstream_timeout();
    let exchange = match app.upstream.send_get(key, deadline).await {
        Ok(exchange) => exchange,
        Err(err) => {
            warn!(key, error = %err, "upstream request failed");
            crate::metrics::record_upstream_request("transport_error");
            gate.release();
            write_simple_response(writer, StatusCode::BAD_GATEWAY, &[], "Bad Gateway\n").await?;
            return Ok(Served::new(StatusCode::BAD_GATEWAY, 0, "MISS"));
        }
    };

    match exchange.head.status {
        StatusCode::NOT_FOUND => {
            crate::metrics::record_upstream_request("notfound");
            app.cache.put_not_found(key);
            gate.release();
            write_simple_response(writer, StatusCode::NOT_FOUND, &[], "Not Found\n").await?;
            return Ok(Served::new(StatusCode::NOT_FOUND, 0, "MISS"));
        }
        StatusCode::OK => {
            crate::metrics::record_upstream_request("ok");
        }
        status => {
            warn!(key, status = status.as_u16(), "unexpected upstream status");
            crate::metrics::record_upstream_request("error_status");
            gate.release();
            write_simple_response(writer, StatusCode::BAD_GATEWAY, &[], "Bad Gateway\n").await?;
            return Ok(Served::new(StatusCode::BAD_GATEWAY, 0, "MISS"));
        }
    }

    let expected_size = exchange.head.content_length;
    let content_type = exchange.head.content_type();

    let (sf, is_new) = match app.cache.get_or_create_pending(key).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(key, error = %err, "failed to create cache file");
            gate.release();
            write_simple_response(
                writer,
                StatusCode::INTERNAL_SERVER_ERROR,
                &[],
                "Internal Server Error\n",
            )
            .await?;
            return Ok(Served::new(StatusCode::INTERNAL_SERVER_ERROR, 0, "MISS"));
        }
    };
    if !is_new {
        // Another fetcher beat us to the insert; abandon this upstream
        // response and tail the in-flight download instead.
        gate.release();
        return serve::serve_streaming(writer, app, head, sf).await;
    }

    let client_timeout = app.settings.client_timeout();
    let headers = [
        ("Content-Type", content_type.clone()),
        ("Accept-Ranges", "bytes".to_string()),
        ("X-Cache", "MISS".to_string()),
    ];

    if head.method == http::Method::HEAD {
        // There is no body to populate the cache with. The gate stays held
        // until the pending entry is gone so no tailer attaches to it.
        app.cache.fail_pending(key).await;
        gate.release();
        let plan = match expected_size {
            Some(size) => BodyPlan::Fixed(size),
            None => BodyPlan::Empty,
        };
        let response = encode_response_head(StatusCode::OK, &headers, plan);
        with_timeout(
            client_timeout,
            async { Ok(writer.write_all(&response).await?) },
            "writing response headers to client",
        )
        .await?;
        writer.flush().await?;
        return Ok(Served::new(StatusCode::OK, 0, "MISS"));
    }

    // The pending entry is visible now; late arrivals tail it from here on.
    gate.release();

    let plan = match expected_size {
        Some(size) => BodyPlan::Fixed(size),
        None => BodyPlan::Chunked,
    };
    let chunked_out = plan == BodyPlan::Chunked;
    let response = encode_response_head(StatusCode::OK, &headers, plan);
    if let Err(err) = with_timeout(
        client_timeout,
        async { Ok(writer.write_all(&response).await?) },
        "writing response headers to client",
    )
    .await
    {
        app.cache.fail_pending(key).await;
        return Err(err);
    }

    let mut reader = exchange.reader;
    let mut body = UpstreamBody::for_get(&exchange.head);
    let mut buf = app.buffers.acquire();
    let mut populating = true;
    let mut total_written = 0u64;

    loop {
        let n = match body.read_chunk(&mut reader, &mut buf, deadline).await {
            Ok(n) => n,
            Err(err) => {
                if populating {
                    app.cache.fail_pending(key).await;
                }
                return Err(err.context("reading upstream body"));
            }
        };
        if n == 0 {
            break;
        }

        if populating {
            if let Err(err) = sf.write(&buf[..n]).await {
                warn!(key, error = %err, "cache write failed; continuing without caching");
                app.cache.fail_pending(key).await;
                populating = false;
            }
        }

        let write_result = if chunked_out {
            with_timeout(
                client_timeout,
                write_chunk(writer, &buf[..n]),
                "writing response body to client",
            )
            .await
        } else {
            with_timeout(
                client_timeout,
                async {
                    writer.write_all(&buf[..n]).await?;
                    writer.flush().await?;
                    Ok(())
                },
                "writing response body to client",
            )
            .await
        };
        if let Err(err) = write_result {
            debug!(key, error = %err, "client write failed mid-stream");
            if populating {
                app.cache.fail_pending(key).await;
            }
            return Err(err);
        }
        total_written += n as u64;
    }

    if let Some(expected) = expected_size
        && total_written != expected
    {
        warn!(key, expected, got = total_written, "upstream size mismatch");
        if populating {
            app.cache.fail_pending(key).await;
        }
        bail!("upstream size mismatch: expected {expected}, got {total_written}");
    }

    if chunked_out
        && let Err(err) = with_timeout(
            client_timeout,
            finish_chunked(writer),
            "finishing chunked response",
        )
        .await
    {
        if populating {
            app.cache.fail_pending(key).await;
        }
        return Err(err);
    }

    if populating {
        app.cache
            .complete_pending(key, total_written, &content_type)
            .await;
    }

    if !exchange.head.connection_close && body.connection_reusable() {
        app.upstream.release(reader.into_inner());
    }

    Ok(Served::new(StatusCode::OK, total_written, "MISS"))
}
