use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout};

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

/// Bounds a fallible future that already produces `anyhow::Result`.
pub async fn with_timeout<F, T>(duration: Duration, future: F, context: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
}

/// `write_all` bounded by an absolute deadline.
pub async fn write_all_with_deadline<W>(
    writer: &mut W,
    buf: &[u8],
    deadline: Instant,
    context: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("timed out {context}"))?;
    timeout_with_context(remaining, writer.write_all(buf), context).await
}
