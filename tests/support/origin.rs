use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How the stub origin answers a path.
#[derive(Clone)]
pub enum OriginBehavior {
    NotFound,
    Status(u16),
    Body {
        content_type: String,
        body: Vec<u8>,
        /// Pause between writes; lets tests hold a download open so
        /// concurrent requests rendezvous on the streaming path.
        delay_per_chunk: Option<Duration>,
        chunk_size: usize,
        /// Serve without Content-Length (body runs until close).
        omit_length: bool,
    },
}

impl OriginBehavior {
    pub fn body(content_type: &str, body: Vec<u8>) -> Self {
        OriginBehavior::Body {
            content_type: content_type.to_string(),
            body,
            delay_per_chunk: None,
            chunk_size: 64 * 1024,
            omit_length: false,
        }
    }

    pub fn slow_body(content_type: &str, body: Vec<u8>, chunk_size: usize, delay: Duration) -> Self {
        OriginBehavior::Body {
            content_type: content_type.to_string(),
            body,
            delay_per_chunk: Some(delay),
            chunk_size,
            omit_length: false,
        }
    }

    pub fn unsized_body(content_type: &str, body: Vec<u8>) -> Self {
        OriginBehavior::Body {
            content_type: content_type.to_string(),
            body,
            delay_per_chunk: None,
            chunk_size: 64 * 1024,
            omit_length: true,
        }
    }
}

#[derive(Default)]
struct OriginState {
    routes: HashMap<String, OriginBehavior>,
    requests: Vec<String>,
}

/// Minimal HTTP/1.1 origin: one request per connection, canned responses,
/// and a log of every request path for single-flight assertions.
#[derive(Clone)]
pub struct StubOrigin {
    addr: SocketAddr,
    state: Arc<Mutex<OriginState>>,
}

impl StubOrigin {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(OriginState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Ok(Self { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set(&self, path: &str, behavior: OriginBehavior) {
        self.state
            .lock()
            .routes
            .insert(path.to_string(), behavior);
    }

    /// Number of requests the origin has seen for `path`.
    pub fn request_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|seen| seen.as_str() == path)
            .count()
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<OriginState>>) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let behavior = {
        let mut state = state.lock();
        state.requests.push(path.clone());
        state.routes.get(&path).cloned()
    };

    let stream = reader.get_mut();
    match behavior {
        None | Some(OriginBehavior::NotFound) => {
            stream
                .write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 10\r\nConnection: close\r\n\r\nNot Found\n",
                )
                .await?;
        }
        Some(OriginBehavior::Status(code)) => {
            let head = format!(
                "HTTP/1.1 {code} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            stream.write_all(head.as_bytes()).await?;
        }
        Some(OriginBehavior::Body {
            content_type,
            body,
            delay_per_chunk,
            chunk_size,
            omit_length,
        }) => {
            let mut head = format!("HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n");
            if !omit_length {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            head.push_str("Connection: close\r\n\r\n");
            stream.write_all(head.as_bytes()).await?;

            for chunk in body.chunks(chunk_size) {
                stream.write_all(chunk).await?;
                stream.flush().await?;
                if let Some(delay) = delay_per_chunk {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    stream.shutdown().await?;
    Ok(())
}
