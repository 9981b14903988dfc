use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

/// Reads one `\n`-terminated line into `buf`, bounded by a per-read timeout
/// and a byte limit. Returns 0 on a clean EOF before any byte arrived.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    max_len: usize,
    context: &str,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(timeout_dur, reader.fill_buf(), context).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line exceeds configured limit of {max_len} bytes while {context}");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("line contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

/// Strips the trailing CRLF or LF from a line in place.
pub(crate) fn trim_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}
