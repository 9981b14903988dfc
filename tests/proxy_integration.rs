mod support;

use std::time::Duration;

use anyhow::Result;

use support::client;
use support::harness::TestProxy;
use support::origin::{OriginBehavior, StubOrigin};

fn deterministic_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn cold_miss_then_warm_hit() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(128 * 1024);
    origin.set(
        "/a.bin",
        OriginBehavior::body("application/octet-stream", body.clone()),
    );
    let proxy = TestProxy::start(&origin.url()).await?;

    let miss = client::get(proxy.addr, "/a.bin").await?;
    assert_eq!(miss.status, 200);
    assert_eq!(miss.header("X-Cache"), Some("MISS"));
    assert_eq!(miss.header("Content-Length"), Some("131072"));
    assert_eq!(miss.header("Content-Type"), Some("application/octet-stream"));
    assert_eq!(miss.header("Accept-Ranges"), Some("bytes"));
    assert_eq!(miss.body, body);

    let hit = client::get(proxy.addr, "/a.bin").await?;
    assert_eq!(hit.status, 200);
    assert_eq!(hit.header("X-Cache"), Some("HIT"));
    assert_eq!(hit.body, body);

    assert_eq!(origin.request_count("/a.bin"), 1, "warm hit must not refetch");
    proxy.shutdown().await
}

#[tokio::test]
async fn concurrent_misses_coalesce_onto_one_fetch() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(200 * 1024);
    origin.set(
        "/b.bin",
        OriginBehavior::slow_body(
            "application/octet-stream",
            body.clone(),
            16 * 1024,
            Duration::from_millis(20),
        ),
    );
    let proxy = TestProxy::start(&origin.url()).await?;

    let mut requests = Vec::new();
    for _ in 0..20 {
        let addr = proxy.addr;
        requests.push(tokio::spawn(async move {
            client::get(addr, "/b.bin").await
        }));
    }

    let mut miss_count = 0usize;
    for request in requests {
        let response = request.await??;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, body, "all bodies must match the origin body");
        match response.header("X-Cache") {
            Some("MISS") => {
                miss_count += 1;
                assert_eq!(response.header("Content-Length"), Some("204800"));
            }
            Some("STREAMING") => {
                assert_eq!(
                    response.header("Content-Length"),
                    None,
                    "a streaming tail must not promise a length"
                );
            }
            // A request that arrives after completion is a plain hit.
            Some("HIT") => {}
            other => panic!("unexpected X-Cache value {other:?}"),
        }
    }

    assert_eq!(miss_count, 1, "exactly one request drives the fetch");
    assert_eq!(
        origin.request_count("/b.bin"),
        1,
        "a miss storm must issue exactly one upstream GET"
    );
    proxy.shutdown().await
}

#[tokio::test]
async fn range_during_streaming_returns_full_body() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(96 * 1024);
    origin.set(
        "/c.bin",
        OriginBehavior::slow_body(
            "application/octet-stream",
            body.clone(),
            8 * 1024,
            Duration::from_millis(25),
        ),
    );
    let proxy = TestProxy::start(&origin.url()).await?;

    let addr = proxy.addr;
    let first = tokio::spawn(async move { client::get(addr, "/c.bin").await });
    tokio::time::sleep(Duration::from_millis(60)).await;

    let tail = client::get_range(proxy.addr, "/c.bin", "bytes=0-9").await?;
    assert_eq!(tail.status, 200, "range is ignored while streaming");
    assert_eq!(tail.header("X-Cache"), Some("STREAMING"));
    assert_eq!(tail.body, body);

    let first = first.await??;
    assert_eq!(first.body, body);
    assert_eq!(origin.request_count("/c.bin"), 1);
    proxy.shutdown().await
}

#[tokio::test]
async fn upstream_404_is_negatively_cached() -> Result<()> {
    let origin = StubOrigin::start().await?;
    origin.set("/missing", OriginBehavior::NotFound);
    let proxy = TestProxy::start(&origin.url()).await?;

    let first = client::get(proxy.addr, "/missing").await?;
    assert_eq!(first.status, 404);

    let second = client::get(proxy.addr, "/missing").await?;
    assert_eq!(second.status, 404);

    assert_eq!(
        origin.request_count("/missing"),
        1,
        "second 404 must come from the negative cache"
    );
    proxy.shutdown().await
}

#[tokio::test]
async fn upstream_errors_map_to_bad_gateway() -> Result<()> {
    let origin = StubOrigin::start().await?;
    origin.set("/broken", OriginBehavior::Status(503));
    let proxy = TestProxy::start(&origin.url()).await?;

    let response = client::get(proxy.addr, "/broken").await?;
    assert_eq!(response.status, 502);

    // Non-404 failures must not be negatively cached.
    origin.set(
        "/broken",
        OriginBehavior::body("text/plain", b"recovered".to_vec()),
    );
    let retry = client::get(proxy.addr, "/broken").await?;
    assert_eq!(retry.status, 200);
    assert_eq!(retry.body, b"recovered");
    proxy.shutdown().await
}

#[tokio::test]
async fn unreachable_upstream_maps_to_bad_gateway() -> Result<()> {
    // Grab a port that nothing is listening on.
    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let dead_url = format!("http://{}", unused.local_addr()?);
    drop(unused);

    let proxy = TestProxy::start(&dead_url).await?;
    let response = client::get(proxy.addr, "/anything").await?;
    assert_eq!(response.status, 502);
    proxy.shutdown().await
}

#[tokio::test]
async fn range_requests_on_completed_entries() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(4096);
    origin.set("/r.bin", OriginBehavior::body("application/octet-stream", body.clone()));
    let proxy = TestProxy::start(&origin.url()).await?;

    // Warm the cache.
    assert_eq!(client::get(proxy.addr, "/r.bin").await?.status, 200);

    let prefix = client::get_range(proxy.addr, "/r.bin", "bytes=0-1023").await?;
    assert_eq!(prefix.status, 206);
    assert_eq!(prefix.header("Content-Range"), Some("bytes 0-1023/4096"));
    assert_eq!(prefix.header("Content-Length"), Some("1024"));
    assert_eq!(prefix.header("X-Cache"), Some("HIT"));
    assert_eq!(prefix.body, body[..1024]);

    let open_ended = client::get_range(proxy.addr, "/r.bin", "bytes=4000-").await?;
    assert_eq!(open_ended.status, 206);
    assert_eq!(open_ended.header("Content-Range"), Some("bytes 4000-4095/4096"));
    assert_eq!(open_ended.body, body[4000..]);

    let suffix = client::get_range(proxy.addr, "/r.bin", "bytes=-100").await?;
    assert_eq!(suffix.status, 206);
    assert_eq!(suffix.header("Content-Range"), Some("bytes 3996-4095/4096"));
    assert_eq!(suffix.body, body[3996..]);

    let oversized_suffix = client::get_range(proxy.addr, "/r.bin", "bytes=-9999").await?;
    assert_eq!(oversized_suffix.status, 206);
    assert_eq!(oversized_suffix.body, body);

    let whole = client::get_range(proxy.addr, "/r.bin", "bytes=0-4095").await?;
    assert_eq!(whole.status, 206, "a whole-object range is still partial content");
    assert_eq!(whole.body, body);

    let past_end = client::get_range(proxy.addr, "/r.bin", "bytes=4096-").await?;
    assert_eq!(past_end.status, 416);
    assert_eq!(past_end.header("Content-Range"), Some("bytes */4096"));

    let malformed = client::get_range(proxy.addr, "/r.bin", "bytes=0-5,10-15").await?;
    assert_eq!(malformed.status, 416);

    assert_eq!(origin.request_count("/r.bin"), 1);
    proxy.shutdown().await
}

#[tokio::test]
async fn head_requests_describe_without_bodies() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(2048);
    origin.set("/h.bin", OriginBehavior::body("application/octet-stream", body.clone()));
    let proxy = TestProxy::start(&origin.url()).await?;

    let miss = client::head(proxy.addr, "/h.bin").await?;
    assert_eq!(miss.status, 200);
    assert_eq!(miss.header("X-Cache"), Some("MISS"));
    assert_eq!(miss.header("Content-Length"), Some("2048"));
    assert!(miss.body.is_empty());

    // A HEAD miss has no body to populate the cache with; the next GET
    // fetches again and does populate it.
    let get = client::get(proxy.addr, "/h.bin").await?;
    assert_eq!(get.header("X-Cache"), Some("MISS"));
    assert_eq!(get.body, body);
    assert_eq!(origin.request_count("/h.bin"), 2);

    let warm_head = client::head(proxy.addr, "/h.bin").await?;
    assert_eq!(warm_head.status, 200);
    assert_eq!(warm_head.header("X-Cache"), Some("HIT"));
    assert_eq!(warm_head.header("Content-Length"), Some("2048"));
    assert!(warm_head.body.is_empty());
    assert_eq!(origin.request_count("/h.bin"), 2);
    proxy.shutdown().await
}

#[tokio::test]
async fn upstream_body_without_length_is_cached() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(32 * 1024);
    origin.set(
        "/nolen.bin",
        OriginBehavior::unsized_body("application/octet-stream", body.clone()),
    );
    let proxy = TestProxy::start(&origin.url()).await?;

    let miss = client::get(proxy.addr, "/nolen.bin").await?;
    assert_eq!(miss.status, 200);
    assert_eq!(miss.header("X-Cache"), Some("MISS"));
    assert_eq!(
        miss.header("Content-Length"),
        None,
        "unknown upstream length must not be promised to the client"
    );
    assert_eq!(miss.body, body);

    let hit = client::get(proxy.addr, "/nolen.bin").await?;
    assert_eq!(hit.header("X-Cache"), Some("HIT"));
    assert_eq!(hit.header("Content-Length"), Some("32768"));
    assert_eq!(hit.body, body);
    assert_eq!(origin.request_count("/nolen.bin"), 1);
    proxy.shutdown().await
}

#[tokio::test]
async fn restart_recovers_persisted_entries() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let bodies: Vec<(String, Vec<u8>)> = (0..3)
        .map(|i| (format!("/file-{i}.bin"), deterministic_body(1024 * (i + 1))))
        .collect();
    for (path, body) in &bodies {
        origin.set(path, OriginBehavior::body("application/octet-stream", body.clone()));
    }

    let proxy = TestProxy::start(&origin.url()).await?;
    for (path, _body) in &bodies {
        assert_eq!(client::get(proxy.addr, path).await?.status, 200);
    }
    let cache_dir = proxy.cache_dir.clone();
    let _tmp = proxy.shutdown_keep_dir().await?;

    let restarted = TestProxy::start_in(&origin.url(), cache_dir).await?;
    let stats = client::get(restarted.addr, "/stats").await?;
    assert_eq!(stats.status, 200);
    let stats: serde_json::Value = serde_json::from_slice(&stats.body)?;
    assert_eq!(stats["file_entries"], 3);
    let expected_total: u64 = bodies.iter().map(|(_path, body)| body.len() as u64).sum();
    assert_eq!(stats["total_size"], expected_total);

    for (path, body) in &bodies {
        let response = client::get(restarted.addr, path).await?;
        assert_eq!(response.header("X-Cache"), Some("HIT"));
        assert_eq!(&response.body, body);
    }
    assert_eq!(
        bodies
            .iter()
            .map(|(path, _)| origin.request_count(path))
            .sum::<usize>(),
        3,
        "restart must not refetch intact entries"
    );
    restarted.shutdown().await
}

#[tokio::test]
async fn tampered_cache_file_is_refetched() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(512);
    origin.set("/t.bin", OriginBehavior::body("application/octet-stream", body.clone()));
    let proxy = TestProxy::start(&origin.url()).await?;

    assert_eq!(client::get(proxy.addr, "/t.bin").await?.status, 200);

    // Corrupt the backing file behind the cache's back.
    let mut tampered = None;
    for entry in walkdir(&proxy.cache_dir) {
        if entry
            .file_name()
            .is_some_and(|name| name != std::ffi::OsStr::new("index.json"))
        {
            std::fs::write(&entry, b"wrong size")?;
            tampered = Some(entry);
        }
    }
    assert!(tampered.is_some(), "expected a cache file to tamper with");

    let refetched = client::get(proxy.addr, "/t.bin").await?;
    assert_eq!(refetched.header("X-Cache"), Some("MISS"));
    assert_eq!(refetched.body, body);
    assert_eq!(origin.request_count("/t.bin"), 2);
    proxy.shutdown().await
}

fn walkdir(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walkdir(&path));
        } else {
            files.push(path);
        }
    }
    files
}

#[tokio::test]
async fn surface_endpoints_and_method_guard() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let proxy = TestProxy::start(&origin.url()).await?;

    let health = client::get(proxy.addr, "/health").await?;
    assert_eq!(health.status, 200);
    assert_eq!(health.body, br#"{"status":"ok"}"#);

    let stats = client::get(proxy.addr, "/stats").await?;
    assert_eq!(stats.status, 200);
    let stats: serde_json::Value = serde_json::from_slice(&stats.body)?;
    assert_eq!(stats["file_entries"], 0);
    assert_eq!(stats["pending"], 0);
    assert!(stats["max_size"].as_u64().is_some());

    let post = client::request(proxy.addr, "POST", "/a.bin", &[]).await?;
    assert_eq!(post.status, 405);

    let delete = client::request(proxy.addr, "DELETE", "/a.bin", &[]).await?;
    assert_eq!(delete.status, 405);
    proxy.shutdown().await
}

#[tokio::test]
async fn query_strings_are_not_part_of_the_key() -> Result<()> {
    let origin = StubOrigin::start().await?;
    let body = deterministic_body(256);
    origin.set("/q.bin", OriginBehavior::body("application/octet-stream", body.clone()));
    let proxy = TestProxy::start(&origin.url()).await?;

    let first = client::get(proxy.addr, "/q.bin?v=1").await?;
    assert_eq!(first.header("X-Cache"), Some("MISS"));
    let second = client::get(proxy.addr, "/q.bin?v=2").await?;
    assert_eq!(second.header("X-Cache"), Some("HIT"));
    assert_eq!(second.body, body);
    assert_eq!(origin.request_count("/q.bin"), 1);
    proxy.shutdown().await
}
