use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::logging;

use super::http::request::{RequestHead, read_request_head};
use super::http::response::{write_json_response, write_simple_response};
use super::serve::{self, Served};
use super::{AppContext, fetch};

/// Keep-alive loop over one client connection.
pub(crate) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let idle_timeout = app.settings.client_timeout();
    let header_timeout = app.settings.client_timeout();

    loop {
        let head = match read_request_head(&mut reader, peer, idle_timeout, header_timeout).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                debug!(peer = %peer, error = %err, "invalid request");
                let _ = write_simple_response(
                    reader.get_mut(),
                    StatusCode::BAD_REQUEST,
                    &[],
                    "Bad Request\n",
                )
                .await;
                break;
            }
        };

        let start = Instant::now();
        match route_request(&mut reader, &app, &head).await {
            Ok(served) => {
                logging::log_access(
                    &head.method,
                    head.path(),
                    served.status,
                    served.cache,
                    served.bytes,
                    start.elapsed(),
                );
                if served.close || !head.keep_alive {
                    break;
                }
            }
            Err(err) => {
                debug!(peer = %peer, path = head.path(), error = %err, "request failed");
                break;
            }
        }
    }
    Ok(())
}

/// Routes one request: the two fixed endpoints, then the proxied cache path
/// per the dispatch order notfound → completed → pending → fetch.
async fn route_request<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    head: &RequestHead,
) -> Result<Served>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = head.path().to_string();
    let writer = reader.get_mut();

    if path == "/health" {
        let body = br#"{"status":"ok"}"#;
        write_json_response(writer, StatusCode::OK, body).await?;
        let mut served = Served::new(StatusCode::OK, body.len() as u64, "-");
        served.close = head.has_body;
        return Ok(served);
    }
    if path == "/stats" {
        let stats = app.cache.stats().await;
        let body = serde_json::to_vec(&stats)?;
        write_json_response(writer, StatusCode::OK, &body).await?;
        let mut served = Served::new(StatusCode::OK, body.len() as u64, "-");
        served.close = head.has_body;
        return Ok(served);
    }

    if head.method != Method::GET && head.method != Method::HEAD {
        let headers = [("Allow", "GET, HEAD".to_string())];
        write_simple_response(
            writer,
            StatusCode::METHOD_NOT_ALLOWED,
            &headers,
            "Method Not Allowed\n",
        )
        .await?;
        let mut served = Served::new(StatusCode::METHOD_NOT_ALLOWED, 0, "-");
        served.close = head.has_body;
        return Ok(served);
    }
    if head.has_body {
        // The body would desynchronize the keep-alive loop; refuse and close.
        write_simple_response(writer, StatusCode::BAD_REQUEST, &[], "Bad Request\n").await?;
        let mut served = Served::new(StatusCode::BAD_REQUEST, 0, "-");
        served.close = true;
        return Ok(served);
    }

    let key = path.as_str();

    if app.cache.is_not_found(key) {
        write_simple_response(writer, StatusCode::NOT_FOUND, &[], "Not Found\n").await?;
        return Ok(Served::new(StatusCode::NOT_FOUND, 0, "NOTFOUND"));
    }

    if let Some(entry) = app.cache.get(key) {
        if serve::validate_entry(&entry) {
            return serve::serve_hit(writer, app, head, &entry).await;
        }
        debug!(key, "cache file invalid, refetching");
        app.cache.remove(key);
    }

    if let Some(sf) = app.cache.get_pending(key).await {
        return serve::serve_streaming(writer, app, head, sf).await;
    }

    fetch::fetch_and_serve(writer, app, head, key).await
}
