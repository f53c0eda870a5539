use std::fs;
use tempfile::TempDir;

use jinx::config::{self, Mode};
use jinx::engine::Engine;

/// Full configuration document for the reverse proxy, with the route table
/// loaded from a sibling file.
#[tokio::test]
async fn builds_reverse_proxy_from_config() {
    let base = TempDir::new().unwrap();
    let routes = base.path().join("routes.json");
    fs::write(&routes, r#"{"/api": "http://127.0.0.1:9001/v1/", "/web": "http://127.0.0.1:9002/"}"#)
        .unwrap();

    let doc = format!(
        r#"{{
            "mode": "reverse_proxy_server",
            "reverse_proxy": {{
                "ip": "127.0.0.1",
                "port": 8081,
                "route_table": "{}"
            }}
        }}"#,
        routes.display()
    );
    let config_path = base.path().join("jinx_config.json");
    fs::write(&config_path, doc).unwrap();

    let config = config::load(&config_path).unwrap();
    assert_eq!(config.mode, Mode::ReverseProxyServer);

    let engine = Engine::from_config(&config, base.path()).await.unwrap();
    assert!(matches!(engine, Engine::ReverseProxy(_)));

    // the working tree and log files exist after setup
    let log_dir = base.path().join("reverse_proxy_server").join("logs");
    assert!(log_dir.join("server.log").exists());
    assert!(log_dir.join("error.log").exists());
    // and the resolved configuration was snapshotted
    assert!(base.path().join("reverse_proxy_server").join("jinx_config.json").exists());
}

#[tokio::test]
async fn builds_forward_proxy_with_blacklist() {
    let base = TempDir::new().unwrap();
    let banned = base.path().join("banned.txt");
    fs::write(&banned, "bad.example:443\nevil.example\n").unwrap();

    let doc = format!(
        r#"{{
            "mode": "forward_proxy_server",
            "forward_proxy": {{
                "port": 8082,
                "black_list": "{}"
            }}
        }}"#,
        banned.display()
    );
    let config_path = base.path().join("jinx_config.json");
    fs::write(&config_path, doc).unwrap();

    let config = config::load(&config_path).unwrap();
    let engine = Engine::from_config(&config, base.path()).await.unwrap();
    assert!(matches!(engine, Engine::ForwardProxy(_)));
}

#[tokio::test]
async fn builds_load_balancer_from_pool_file() {
    let base = TempDir::new().unwrap();
    let pool = base.path().join("pool.json");
    fs::write(
        &pool,
        r#"{
            "a": {"IP": "127.0.0.1", "Port": 9001, "Weight": 1, "Location": "us-east"},
            "b": {"IP": "127.0.0.1", "Port": 9002, "Weight": 2, "Location": "eu-west"}
        }"#,
    )
    .unwrap();

    let doc = format!(
        r#"{{
            "mode": "load_balancing_server",
            "load_balancer": {{
                "port": 8083,
                "algorithm": "weighted_round_robin",
                "server_pool": "{}"
            }}
        }}"#,
        pool.display()
    );
    let config_path = base.path().join("jinx_config.json");
    fs::write(&config_path, doc).unwrap();

    let config = config::load(&config_path).unwrap();
    let engine = Engine::from_config(&config, base.path()).await.unwrap();
    assert!(matches!(engine, Engine::LoadBalancer(_)));
}

#[tokio::test]
async fn missing_section_for_mode_is_rejected() {
    let base = TempDir::new().unwrap();
    let config_path = base.path().join("jinx_config.json");
    fs::write(&config_path, r#"{"mode": "load_balancing_server"}"#).unwrap();

    let config = config::load(&config_path).unwrap();
    assert!(Engine::from_config(&config, base.path()).await.is_err());
}

#[tokio::test]
async fn route_table_with_txt_extension_is_rejected() {
    let base = TempDir::new().unwrap();
    let routes = base.path().join("routes.txt");
    fs::write(&routes, r#"{"/a": "http://127.0.0.1:9001/"}"#).unwrap();

    let doc = format!(
        r#"{{
            "mode": "reverse_proxy_server",
            "reverse_proxy": {{"port": 8081, "route_table": "{}"}}
        }}"#,
        routes.display()
    );
    let config_path = base.path().join("jinx_config.json");
    fs::write(&config_path, doc).unwrap();

    let config = config::load(&config_path).unwrap();
    assert!(Engine::from_config(&config, base.path()).await.is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    assert!(config::load("/no/such/dir/jinx_config.json").is_err());
}
