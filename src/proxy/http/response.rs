use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, StatusCode, Version, header};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::line::{read_line_with_timeout, trim_line_ending};

pub(crate) const MAX_RESPONSE_HEADER_BYTES: usize = 32 * 1024;

/// How a response body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    /// No body bytes follow (HEAD, errors without payload).
    Empty,
    /// Exactly this many raw bytes follow; `Content-Length` is emitted.
    Fixed(u64),
    /// Chunked transfer-encoding; used when the total is not yet known.
    Chunked,
}

/// Encodes a response head. `headers` are emitted in order; the body plan
/// appends the framing headers.
pub(crate) fn encode_response_head(
    status: StatusCode,
    headers: &[(&str, String)],
    plan: BodyPlan,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    let reason = status.canonical_reason().unwrap_or("");
    buffer.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", status.as_u16()).as_bytes());
    for (name, value) in headers {
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    match plan {
        BodyPlan::Empty => {}
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        BodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Writes a complete text/plain response, headers and body.
pub(crate) async fn write_simple_response<W>(
    writer: &mut W,
    status: StatusCode,
    extra_headers: &[(&str, String)],
    body: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = vec![("Content-Type", "text/plain; charset=utf-8".to_string())];
    headers.extend_from_slice(extra_headers);
    let head = encode_response_head(status, &headers, BodyPlan::Fixed(body.len() as u64));
    writer.write_all(&head).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a complete application/json response.
pub(crate) async fn write_json_response<W>(
    writer: &mut W,
    status: StatusCode,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let headers = [("Content-Type", "application/json".to_string())];
    let head = encode_response_head(status, &headers, BodyPlan::Fixed(body.len() as u64));
    writer.write_all(&head).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// One chunk of a chunked-encoded body.
pub(crate) async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// The zero-length terminator of a chunked body.
pub(crate) async fn finish_chunked<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Parsed head of an upstream HTTP/1.x response.
#[derive(Debug)]
pub(crate) struct UpstreamResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl UpstreamResponseHead {
    pub fn content_type(&self) -> String {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string()
    }
}

/// Reads and validates an upstream response head.
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
) -> Result<UpstreamResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes = read_line_with_timeout(
        reader,
        &mut line,
        timeout_dur,
        MAX_RESPONSE_HEADER_BYTES,
        "reading upstream status line",
    )
    .await?;
    if bytes == 0 {
        bail!("upstream closed connection before sending status line");
    }
    let mut budget = MAX_RESPONSE_HEADER_BYTES - bytes;

    let (version, status) = parse_status_line(trim_line_ending(&line))?;

    let mut headers = HeaderMap::new();
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = version == Version::HTTP_10;

    loop {
        let read = read_line_with_timeout(
            reader,
            &mut line,
            timeout_dur,
            budget.max(1),
            "reading upstream response headers",
        )
        .await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        budget = budget
            .checked_sub(read)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;

        let trimmed = trim_line_ending(&line);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("upstream header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    connection_close = false;
                }
            }
        }

        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            header::HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    if transfer_encoding_present && content_length.is_some() {
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }
    if transfer_encoding_present {
        // Chunked is the only framing we decode.
        content_length = None;
    }

    Ok(UpstreamResponseHead {
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;

    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => bail!("unsupported upstream HTTP version '{other}'"),
    };

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    let status = StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))?;

    Ok((version, status))
}
