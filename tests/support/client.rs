use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub async fn get(addr: SocketAddr, path: &str) -> Result<Response> {
    request(addr, "GET", path, &[]).await
}

pub async fn head(addr: SocketAddr, path: &str) -> Result<Response> {
    request(addr, "HEAD", path, &[]).await
}

pub async fn get_range(addr: SocketAddr, path: &str, range: &str) -> Result<Response> {
    request(addr, "GET", path, &[("Range", range)]).await
}

/// One request over a fresh connection, `Connection: close`, with the body
/// decoded per the response framing (fixed, chunked, or until-close).
pub async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
) -> Result<Response> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to proxy at {addr}"))?;

    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    ensure!(
        reader.read_line(&mut status_line).await? > 0,
        "proxy closed connection before responding"
    );
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed status line '{status_line}'"))?
        .parse()
        .context("non-numeric status code")?;

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        ensure!(
            reader.read_line(&mut line).await? > 0,
            "proxy closed connection during headers"
        );
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header '{trimmed}'"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let response_without_body = Response {
        status,
        headers,
        body: Vec::new(),
    };

    let body = if method == "HEAD" {
        Vec::new()
    } else if response_without_body
        .header("Transfer-Encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    {
        read_chunked_body(&mut reader).await?
    } else if let Some(length) = response_without_body.header("Content-Length") {
        let length: usize = length.parse().context("invalid Content-Length")?;
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        body
    } else {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        body
    };

    Ok(Response {
        body,
        ..response_without_body
    })
}

async fn read_chunked_body<S>(reader: &mut BufReader<S>) -> Result<Vec<u8>>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        ensure!(
            reader.read_line(&mut size_line).await? > 0,
            "connection closed before chunk size"
        );
        let size_part = size_line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_part, 16)
            .map_err(|_| anyhow!("invalid chunk size '{size_part}'"))?;

        if size == 0 {
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await?;
                if n == 0 || trailer == "\r\n" || trailer == "\n" {
                    break;
                }
            }
            return Ok(body);
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = String::new();
        ensure!(
            reader.read_line(&mut crlf).await? > 0,
            "connection closed before chunk terminator"
        );
        if !crlf.trim_end_matches(['\r', '\n']).is_empty() {
            bail!("missing CRLF after chunk");
        }
    }
}
