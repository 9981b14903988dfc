use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, Method, header};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::line::{read_line_with_timeout, trim_line_ending};

pub(crate) const MAX_REQUEST_HEADER_BYTES: usize = 32 * 1024;

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub keep_alive: bool,
    pub has_body: bool,
}

/// Reads one HTTP/1.1 request head from the client. Returns `Ok(None)` when
/// the connection goes idle-quiet or closes cleanly between requests.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    // Wait for the first byte separately so a quiet keep-alive connection
    // closes without being reported as an error.
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut line = String::new();
    let read = read_line_with_timeout(
        reader,
        &mut line,
        header_timeout,
        MAX_REQUEST_HEADER_BYTES,
        "reading request line",
    )
    .await?;
    if read == 0 {
        return Ok(None);
    }
    let mut budget = MAX_REQUEST_HEADER_BYTES
        .checked_sub(read)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;

    let request_line = trim_line_ending(&line);
    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let mut headers = HeaderMap::new();
    loop {
        let read = read_line_with_timeout(
            reader,
            &mut line,
            header_timeout,
            budget.max(1),
            "reading request headers",
        )
        .await?;
        if read == 0 {
            bail!("connection closed during request headers from {peer}");
        }
        budget = budget
            .checked_sub(read)
            .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;

        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        let name = header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let value = header::HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;
        headers.append(name, value);
    }

    let keep_alive = !connection_tokens(&headers).any(|token| token.eq_ignore_ascii_case("close"));
    let has_body = request_has_body(&headers)?;

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        keep_alive,
        has_body,
    }))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
}

fn request_has_body(headers: &HeaderMap) -> Result<bool> {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return Ok(true);
    }
    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => {
            let length: u64 = value
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| anyhow!("invalid Content-Length in request"))?;
            Ok(length > 0)
        }
        None => Ok(false),
    }
}

impl RequestHead {
    /// The cache key: the path component of the target, without the query.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _query)) => path,
            None => &self.target,
        }
    }

    pub fn range_header(&self) -> Option<&str> {
        self.headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
    }
}
