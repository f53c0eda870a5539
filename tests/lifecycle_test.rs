use std::fs;
use tempfile::TempDir;

use jinx::config::{HttpServerConfig, LoadBalancerConfig, UpstreamServer};
use jinx::lb::LoadBalancingServer;
use jinx::origin::HttpServer;
use jinx::JinxServer;

fn origin_fixture(base: &TempDir) -> std::sync::Arc<HttpServer> {
    let working_dir = base.path().join("http_server");
    let log_root = working_dir.join("logs");
    let site = working_dir.join("www");
    fs::create_dir_all(&log_root).unwrap();
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("index.html"), "DEFAULT").unwrap();

    let website_root = base.path().join("sites");
    fs::create_dir_all(&website_root).unwrap();

    let config = HttpServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 47801,
        website_root: website_root.display().to_string(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_root.display().to_string(),
    };
    HttpServer::new(config, working_dir).unwrap()
}

fn balancer_fixture(base: &TempDir) -> std::sync::Arc<LoadBalancingServer> {
    let working_dir = base.path().join("load_balancing_server");
    let log_root = working_dir.join("logs");
    fs::create_dir_all(&log_root).unwrap();

    let pool = vec![UpstreamServer {
        ip: "127.0.0.1".to_string(),
        port: 47899,
        weight: 1,
        location: String::new(),
    }];
    let config = LoadBalancerConfig {
        ip: "127.0.0.1".to_string(),
        port: 47802,
        server_pool: String::new(),
        algorithm: "round_robin".to_string(),
        cert_file: String::new(),
        key_file: String::new(),
        log_root: log_root.display().to_string(),
    };
    LoadBalancingServer::new(config, pool, working_dir).unwrap()
}

/// Stop before Start is a no-op, and stays one when repeated.
#[tokio::test]
async fn stop_before_start_is_a_noop() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base);

    server.stop().await;
    server.stop().await;

    let balancer = balancer_fixture(&base);
    balancer.stop().await;
}

/// Restart before Start is a no-op.
#[tokio::test]
async fn restart_before_start_is_a_noop() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base);
    server.restart().await.unwrap();
}

/// Destroy before Start leaves the working directory untouched.
#[tokio::test]
async fn destroy_before_start_keeps_the_working_dir() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base);

    server.destroy().await;
    assert!(base.path().join("http_server").exists());
}

/// A started engine can be stopped, restarted onto the same address, and
/// finally destroyed, which removes its working directory.
#[tokio::test]
async fn start_stop_restart_destroy_cycle() {
    let base = TempDir::new().unwrap();
    let server = origin_fixture(&base);

    server.start().await.unwrap();
    server.stop().await;

    // the address is free again, so restart can rebind it
    server.restart().await.unwrap();

    server.destroy().await;
    assert!(!base.path().join("http_server").exists());
}
