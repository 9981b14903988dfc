use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

use super::line::{read_line_with_timeout, trim_line_ending};
use super::response::UpstreamResponseHead;

const MAX_CHUNK_LINE_BYTES: usize = 8 * 1024;

/// Decoder for an upstream response body, yielding raw content bytes one
/// buffer at a time regardless of the wire framing.
pub(crate) enum UpstreamBody {
    Empty,
    Fixed { remaining: u64 },
    Chunked { remaining_in_chunk: u64, finished: bool },
    UntilClose { finished: bool },
}

impl UpstreamBody {
    pub fn for_get(head: &UpstreamResponseHead) -> Self {
        if head.chunked {
            UpstreamBody::Chunked {
                remaining_in_chunk: 0,
                finished: false,
            }
        } else {
            match head.content_length {
                Some(0) => UpstreamBody::Empty,
                Some(length) => UpstreamBody::Fixed { remaining: length },
                None => UpstreamBody::UntilClose { finished: false },
            }
        }
    }

    /// True once the body was fully consumed through a framing that leaves
    /// the connection usable for another request.
    pub fn connection_reusable(&self) -> bool {
        match self {
            UpstreamBody::Empty => true,
            UpstreamBody::Fixed { remaining } => *remaining == 0,
            UpstreamBody::Chunked { finished, .. } => *finished,
            UpstreamBody::UntilClose { .. } => false,
        }
    }

    /// Reads the next run of content bytes into `buf`. Returns `Ok(0)` when
    /// the body is complete. All waits are bounded by `deadline`.
    pub async fn read_chunk<S>(
        &mut self,
        reader: &mut BufReader<S>,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<usize>
    where
        S: AsyncRead + Unpin,
    {
        match self {
            UpstreamBody::Empty => Ok(0),
            UpstreamBody::Fixed { remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let to_read = (*remaining).min(buf.len() as u64) as usize;
                let n = read_with_deadline(reader, &mut buf[..to_read], deadline).await?;
                if n == 0 {
                    bail!("upstream closed connection mid-body");
                }
                *remaining -= n as u64;
                Ok(n)
            }
            UpstreamBody::Chunked {
                remaining_in_chunk,
                finished,
            } => {
                if *finished {
                    return Ok(0);
                }
                if *remaining_in_chunk == 0 {
                    let size = read_chunk_size(reader, deadline).await?;
                    if size == 0 {
                        consume_trailers(reader, deadline).await?;
                        *finished = true;
                        return Ok(0);
                    }
                    *remaining_in_chunk = size;
                }
                let to_read = (*remaining_in_chunk).min(buf.len() as u64) as usize;
                let n = read_with_deadline(reader, &mut buf[..to_read], deadline).await?;
                if n == 0 {
                    bail!("upstream closed connection mid-chunk");
                }
                *remaining_in_chunk -= n as u64;
                if *remaining_in_chunk == 0 {
                    consume_chunk_terminator(reader, deadline).await?;
                }
                Ok(n)
            }
            UpstreamBody::UntilClose { finished } => {
                if *finished {
                    return Ok(0);
                }
                let n = read_with_deadline(reader, buf, deadline).await?;
                if n == 0 {
                    *finished = true;
                }
                Ok(n)
            }
        }
    }
}

async fn read_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("upstream request deadline exceeded"))?;
    timeout_with_context(remaining, reader.read(buf), "reading upstream body").await
}

async fn read_chunk_size<S>(reader: &mut BufReader<S>, deadline: Instant) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let line = read_body_line(reader, deadline, "reading chunk size").await?;
    let size_part = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_part, 16)
        .map_err(|_| anyhow!("invalid chunk size '{size_part}' from upstream"))
}

async fn consume_chunk_terminator<S>(reader: &mut BufReader<S>, deadline: Instant) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let line = read_body_line(reader, deadline, "reading chunk terminator").await?;
    if !line.is_empty() {
        bail!("missing CRLF after chunk data");
    }
    Ok(())
}

async fn consume_trailers<S>(reader: &mut BufReader<S>, deadline: Instant) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    loop {
        let line = read_body_line(reader, deadline, "reading trailers").await?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

async fn read_body_line<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    context: &str,
) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("upstream request deadline exceeded"))?;
    let mut line = String::new();
    let read =
        read_line_with_timeout(reader, &mut line, remaining, MAX_CHUNK_LINE_BYTES, context).await?;
    if read == 0 {
        bail!("upstream closed connection while {context}");
    }
    Ok(trim_line_ending(&line).to_string())
}
