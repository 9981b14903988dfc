use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One access-log line per proxied request.
pub fn log_access(
    method: &http::Method,
    path: &str,
    status: StatusCode,
    cache: &'static str,
    bytes_out: u64,
    elapsed: Duration,
) {
    tracing::info!(
        target: "access_log",
        method = %method,
        path,
        status = status.as_u16(),
        cache,
        bytes_out,
        elapsed_ms = elapsed.as_millis() as u64,
    );

    crate::metrics::record_request(method, status, cache);
}
