pub(crate) mod fetch;
pub(crate) mod handler;
pub(crate) mod http;
pub mod listener;
pub(crate) mod range;
pub(crate) mod serve;
pub(crate) mod tls;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::{buffer::BufferPool, cache::FileCache, settings::Settings};

use fetch::FetchGates;
use upstream::UpstreamClient;

/// Entry points re-exported for the fuzz harness.
pub mod fuzzing {
    pub use super::http::request::{RequestHead, read_request_head};
    pub use super::range::{ByteRange, parse_range};
}

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: FileCache,
    pub upstream: Arc<UpstreamClient>,
    pub(crate) buffers: Arc<BufferPool>,
    pub(crate) gates: FetchGates,
}

/// Copy buffers kept warm between requests.
const POOLED_COPY_BUFFERS: usize = 64;

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: FileCache, upstream: Arc<UpstreamClient>) -> Self {
        let buffers = Arc::new(BufferPool::new(POOLED_COPY_BUFFERS));
        Self {
            settings,
            cache,
            upstream,
            buffers,
            gates: FetchGates::default(),
        }
    }
}

pub async fn run(app: AppContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    listener::start_listener(app, shutdown).await
}
