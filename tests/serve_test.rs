//! End-to-end exercises over real sockets: each test builds an engine on a
//! dedicated loopback port, drives it with raw HTTP/TCP, and checks the
//! bytes that come back.

use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use jinx::config::{
    ForwardProxyConfig, HttpServerConfig, LoadBalancerConfig, ReverseProxyConfig, UpstreamServer,
};
use jinx::lb::LoadBalancingServer;
use jinx::origin::HttpServer;
use jinx::proxy::{ForwardProxyServer, ReverseProxyServer};
use jinx::util;
use jinx::JinxServer;

/// Send one raw HTTP request and collect everything until the server closes.
async fn http_exchange(addr: &str, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Minimal upstream that answers every request with its own request line as
/// the response body.
async fn spawn_echo_upstream(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&head);
                let body = text.lines().next().unwrap_or("").to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
}

/// Upstream that writes a fixed tag and closes; lets tests observe which
/// pool member a connection was relayed to.
async fn spawn_tag_upstream(port: u16, tag: &'static str) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            let _ = stream.write_all(tag.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
}

fn origin_fixture(base: &TempDir, port: u16) -> Arc<HttpServer> {
    let working_dir = base.path().join("http_server");
    let log_root = working_dir.join("logs");
    let site = working_dir.join("www");
    fs::create_dir_all(&log_root).unwrap();
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("index.html"), "DEFAULT").unwrap();
    fs::write(site.join("404.html"), "default 404 page").unwrap();

    let website_root = base.path().join("sites");
    fs::create_dir_all(&website_root).unwrap();

    let config = HttpServerConfig {
        ip: "127.0.0.1".to_string(),
        port,
        website_root: website_root.display().to_string(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_root.display().to_string(),
    };
    HttpServer::new(config, working_dir).unwrap()
}

fn log_dir(base: &TempDir, mode: &str) -> String {
    let dir = base.path().join(mode).join("logs");
    fs::create_dir_all(&dir).unwrap();
    dir.display().to_string()
}

#[tokio::test]
async fn origin_serves_the_default_site_for_loopback() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base, 47701);
    server.start().await.unwrap();

    let response = http_exchange(
        "127.0.0.1:47701",
        "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"));
    let lower = response.to_lowercase();
    assert!(lower.contains("server: jinx"));
    assert!(lower.contains("cache-control: max-age=3600"));
    assert!(response.ends_with("DEFAULT"));

    server.stop().await;
}

#[tokio::test]
async fn origin_serves_byte_ranges() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base, 47710);
    server.start().await.unwrap();

    let response = http_exchange(
        "127.0.0.1:47710",
        "GET / HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-2\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 206"));
    let lower = response.to_lowercase();
    assert!(lower.contains("content-range: bytes 0-2/7"));
    assert!(lower.contains("accept-ranges: bytes"));
    assert!(response.ends_with("DEF"));

    // a range past the end of the file is unsatisfiable
    let response = http_exchange(
        "127.0.0.1:47710",
        "GET / HTTP/1.1\r\nHost: localhost\r\nRange: bytes=100-\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 416"));
    assert!(response.to_lowercase().contains("content-range: bytes */7"));

    server.stop().await;
}

#[tokio::test]
async fn origin_serves_the_custom_404_document() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base, 47706);
    server.start().await.unwrap();

    let response = http_exchange(
        "127.0.0.1:47706",
        "GET /pages/about.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.ends_with("default 404 page"));

    server.stop().await;
}

#[tokio::test]
async fn reverse_proxy_rewrites_the_upstream_path() {
    spawn_echo_upstream(47703).await;

    let base = TempDir::new().unwrap();
    let config = ReverseProxyConfig {
        ip: "127.0.0.1".to_string(),
        port: 47702,
        route_table: String::new(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_dir(&base, "reverse_proxy_server"),
    };
    let table = [("/api".to_string(), "http://127.0.0.1:47703/v1/".to_string())]
        .into_iter()
        .collect();
    let server =
        ReverseProxyServer::new(config, table, base.path().join("reverse_proxy_server")).unwrap();
    server.start().await.unwrap();

    let response = http_exchange(
        "127.0.0.1:47702",
        "GET /api/users?id=5 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("GET /v1/users?id=5"), "unexpected upstream path: {response}");

    server.stop().await;
}

#[tokio::test]
async fn reverse_proxy_route_miss_is_diagnosed() {
    let base = TempDir::new().unwrap();
    let config = ReverseProxyConfig {
        ip: "127.0.0.1".to_string(),
        port: 47707,
        route_table: String::new(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_dir(&base, "reverse_proxy_server"),
    };
    let table = [("/a".to_string(), "http://127.0.0.1:1/".to_string())].into_iter().collect();
    let server =
        ReverseProxyServer::new(config, table, base.path().join("reverse_proxy_server")).unwrap();
    server.start().await.unwrap();

    let response = http_exchange(
        "127.0.0.1:47707",
        "GET /b HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("/b does not exist in route table"));

    server.stop().await;
}

fn forward_fixture(base: &TempDir, port: u16, black_list: &[&str]) -> Arc<ForwardProxyServer> {
    let config = ForwardProxyConfig {
        ip: "127.0.0.1".to_string(),
        port,
        black_list: String::new(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_dir(base, "forward_proxy_server"),
    };
    ForwardProxyServer::new(
        config,
        black_list.iter().map(|s| s.to_string()).collect(),
        base.path().join("forward_proxy_server"),
    )
    .unwrap()
}

#[tokio::test]
async fn forward_proxy_refuses_blacklisted_hosts() {
    let base = TempDir::new().unwrap();
    let server = forward_fixture(&base, 47704, &["bad.example"]);
    server.start().await.unwrap();

    let response = http_exchange(
        "127.0.0.1:47704",
        "GET http://bad.example/ HTTP/1.1\r\nHost: bad.example:443\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 403"));
    assert!(response.contains("bad.example has been blacklisted"));

    server.stop().await;
}

#[tokio::test]
async fn forward_proxy_reports_unreachable_upstreams() {
    let base = TempDir::new().unwrap();
    let server = forward_fixture(&base, 47708, &[]);
    server.start().await.unwrap();

    // nothing listens on this port, so the dial is refused
    let response = http_exchange(
        "127.0.0.1:47708",
        "GET http://127.0.0.1:47999/ HTTP/1.1\r\nHost: 127.0.0.1:47999\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502"), "expected 502, got: {response}");

    server.stop().await;
}

#[tokio::test]
async fn forward_proxy_tunnels_connect_streams() {
    spawn_tag_upstream(47714, "TUNNELED").await;

    let base = TempDir::new().unwrap();
    let server = forward_fixture(&base, 47709, &[]);
    server.start().await.unwrap();

    let mut stream = TcpStream::connect("127.0.0.1:47709").await.unwrap();
    stream
        .write_all(b"CONNECT 127.0.0.1:47714 HTTP/1.1\r\nHost: 127.0.0.1:47714\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.ends_with("TUNNELED"), "tunnel payload missing: {text}");

    server.stop().await;
}

#[tokio::test]
async fn load_balancer_round_robins_connections() {
    spawn_tag_upstream(47711, "A").await;
    spawn_tag_upstream(47712, "B").await;
    spawn_tag_upstream(47713, "C").await;

    let base = TempDir::new().unwrap();
    let pool: Vec<UpstreamServer> = [47711u16, 47712, 47713]
        .iter()
        .map(|&port| UpstreamServer {
            ip: "127.0.0.1".to_string(),
            port,
            weight: 1,
            location: String::new(),
        })
        .collect();
    let config = LoadBalancerConfig {
        ip: "127.0.0.1".to_string(),
        port: 47705,
        server_pool: String::new(),
        algorithm: "round_robin".to_string(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_dir(&base, "load_balancing_server"),
    };
    let server =
        LoadBalancingServer::new(config, pool, base.path().join("load_balancing_server")).unwrap();
    server.start().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let mut stream = TcpStream::connect("127.0.0.1:47705").await.unwrap();
        let mut tag = String::new();
        stream.read_to_string(&mut tag).await.unwrap();
        seen.push(tag);
    }
    assert_eq!(seen, vec!["A", "B", "C", "A"]);

    server.stop().await;
}

#[test]
fn cleaned_paths_route_identically() {
    // lookups are insensitive to redundant slashes, dot segments and
    // trailing slashes because both sides are canonically cleaned
    for raw in ["/api/users", "/api//users", "/api/./users", "/api/x/../users", "/api/users/"] {
        assert_eq!(util::clean_path(raw), "/api/users");
    }
}
