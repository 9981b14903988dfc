use std::sync::Arc;

use anyhow::{Context, Result, bail};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::cache::{CacheEntry, StreamingFile};
use crate::util::with_timeout;

use super::AppContext;
use super::http::request::RequestHead;
use super::http::response::{
    BodyPlan, encode_response_head, finish_chunked, write_chunk, write_simple_response,
};
use super::range::parse_range;

/// What a request ended up as, for the access log and keep-alive decision.
pub(crate) struct Served {
    pub status: StatusCode,
    pub bytes: u64,
    pub cache: &'static str,
    pub close: bool,
}

impl Served {
    pub(crate) fn new(status: StatusCode, bytes: u64, cache: &'static str) -> Self {
        Self {
            status,
            bytes,
            cache,
            close: false,
        }
    }
}

/// Confirms the backing file still matches the entry before it is served.
pub(crate) fn validate_entry(entry: &CacheEntry) -> bool {
    match std::fs::metadata(&entry.file_path) {
        Ok(meta) => meta.len() == entry.size,
        Err(_) => false,
    }
}

/// Serves a completed entry, honoring `Range` per the `bytes=` forms.
pub(crate) async fn serve_hit<W>(
    writer: &mut W,
    app: &AppContext,
    head: &RequestHead,
    entry: &CacheEntry,
) -> Result<Served>
where
    W: AsyncWrite + Unpin,
{
    let mut file = match tokio::fs::File::open(&entry.file_path).await {
        Ok(file) => file,
        Err(err) => {
            debug!(key = %entry.key, error = %err, "cache file unreadable; dropping entry");
            app.cache.remove(&entry.key);
            write_simple_response(writer, StatusCode::INTERNAL_SERVER_ERROR, &[], "Internal Server Error\n")
                .await?;
            return Ok(Served::new(StatusCode::INTERNAL_SERVER_ERROR, 0, "HIT"));
        }
    };

    let client_timeout = app.settings.client_timeout();
    let base_headers = [
        ("Content-Type", entry.content_type.clone()),
        ("Accept-Ranges", "bytes".to_string()),
        ("X-Cache", "HIT".to_string()),
    ];

    if let Some(range_header) = head.range_header() {
        let Some(range) = parse_range(range_header, entry.size) else {
            let headers = [("Content-Range", format!("bytes */{}", entry.size))];
            write_simple_response(
                writer,
                StatusCode::RANGE_NOT_SATISFIABLE,
                &headers,
                "Range Not Satisfiable\n",
            )
            .await?;
            return Ok(Served::new(StatusCode::RANGE_NOT_SATISFIABLE, 0, "HIT"));
        };

        let mut headers: Vec<(&str, String)> = base_headers.to_vec();
        headers.push((
            "Content-Range",
            format!("bytes {}-{}/{}", range.start, range.end, entry.size),
        ));
        let response = encode_response_head(
            StatusCode::PARTIAL_CONTENT,
            &headers,
            BodyPlan::Fixed(range.len()),
        );
        with_timeout(
            client_timeout,
            async { Ok(writer.write_all(&response).await?) },
            "writing response headers to client",
        )
        .await?;

        if head.method == http::Method::HEAD {
            writer.flush().await?;
            return Ok(Served::new(StatusCode::PARTIAL_CONTENT, 0, "HIT"));
        }

        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .with_context(|| format!("failed to seek {}", entry.file_path.display()))?;
        let copied = copy_file_bytes(writer, app, &mut file, range.len(), client_timeout).await?;
        return Ok(Served::new(StatusCode::PARTIAL_CONTENT, copied, "HIT"));
    }

    let response = encode_response_head(StatusCode::OK, &base_headers, BodyPlan::Fixed(entry.size));
    with_timeout(
        client_timeout,
        async { Ok(writer.write_all(&response).await?) },
        "writing response headers to client",
    )
    .await?;

    if head.method == http::Method::HEAD {
        writer.flush().await?;
        return Ok(Served::new(StatusCode::OK, 0, "HIT"));
    }

    let copied = copy_file_bytes(writer, app, &mut file, entry.size, client_timeout).await?;
    Ok(Served::new(StatusCode::OK, copied, "HIT"))
}

async fn copy_file_bytes<W>(
    writer: &mut W,
    app: &AppContext,
    file: &mut tokio::fs::File,
    length: u64,
    client_timeout: std::time::Duration,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = app.buffers.acquire();
    let mut remaining = length;
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..to_read]).await?;
        if n == 0 {
            // Content-Length was already promised; the framing cannot be
            // repaired, so the connection has to drop.
            bail!("cache file truncated while serving");
        }
        with_timeout(
            client_timeout,
            async { Ok(writer.write_all(&buf[..n]).await?) },
            "writing response body to client",
        )
        .await?;
        remaining -= n as u64;
    }
    writer.flush().await?;
    Ok(length)
}

/// Serves a still-growing download by tailing its [`StreamingFile`]. The
/// total length is not yet authoritative, so the body goes out chunked with
/// no `Content-Length`, and `Range` is ignored on this path.
pub(crate) async fn serve_streaming<W>(
    writer: &mut W,
    app: &AppContext,
    head: &RequestHead,
    sf: Arc<StreamingFile>,
) -> Result<Served>
where
    W: AsyncWrite + Unpin,
{
    let client_timeout = app.settings.client_timeout();
    let headers = [("X-Cache", "STREAMING".to_string())];

    if head.method == http::Method::HEAD {
        let response = encode_response_head(StatusCode::OK, &headers, BodyPlan::Empty);
        with_timeout(
            client_timeout,
            async { Ok(writer.write_all(&response).await?) },
            "writing response headers to client",
        )
        .await?;
        writer.flush().await?;
        return Ok(Served::new(StatusCode::OK, 0, "STREAMING"));
    }

    let response = encode_response_head(StatusCode::OK, &headers, BodyPlan::Chunked);
    with_timeout(
        client_timeout,
        async { Ok(writer.write_all(&response).await?) },
        "writing response headers to client",
    )
    .await?;

    let mut reader = sf.reader();
    let mut buf = app.buffers.acquire();
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        with_timeout(
            client_timeout,
            write_chunk(writer, &buf[..n]),
            "writing streamed chunk to client",
        )
        .await?;
        total += n as u64;
    }
    with_timeout(
        client_timeout,
        finish_chunked(writer),
        "finishing chunked response",
    )
    .await?;

    Ok(Served::new(StatusCode::OK, total, "STREAMING"))
}
