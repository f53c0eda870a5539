//! Per-mode startup: working directories, log files, auxiliary file loading,
//! default-site assets, and construction of the configured engine.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Uri;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

use crate::config::{
    self, ForwardProxyConfig, HttpServerConfig, LoadBalancerConfig, Mode, ReverseProxyConfig,
};
use crate::lb::LoadBalancingServer;
use crate::origin::{self, HttpServer};
use crate::proxy::{ForwardProxyServer, ReverseProxyServer};
use crate::util;

pub const LOG_ROOT: &str = "logs";

const JINX_INDEX_URL: &str = "https://gemkox-spaces.nyc3.cdn.digitaloceanspaces.com/jinx/index.html";
const JINX_404_URL: &str = "https://gemkox-spaces.nyc3.cdn.digitaloceanspaces.com/jinx/404.html";
const JINX_CSS_URL: &str = "https://gemkox-spaces.nyc3.cdn.digitaloceanspaces.com/jinx/style.css";
const JINX_ICO_URL: &str = "https://gemkox-spaces.nyc3.cdn.digitaloceanspaces.com/jinx/jinx.ico";
const JINX_SVG_URL: &str = "https://gemkox-spaces.nyc3.cdn.digitaloceanspaces.com/jinx/jinx.svg";

const FALLBACK_INDEX: &str = "<!DOCTYPE html>\n<html>\n<head><title>Jinx</title><link rel=\"stylesheet\" href=\"style.css\"></head>\n<body><h1>Welcome to Jinx</h1><p>The server is up and serving the default site.</p></body>\n</html>\n";
const FALLBACK_404: &str = "<!DOCTYPE html>\n<html>\n<head><title>404 Not Found</title><link rel=\"stylesheet\" href=\"style.css\"></head>\n<body><h1>404 Not Found</h1><p>The requested resource does not exist on this server.</p></body>\n</html>\n";
const FALLBACK_STYLE: &str = "body { font-family: sans-serif; margin: 4rem auto; max-width: 40rem; }\n";

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("unable to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("{0}: no such file")]
    MissingFile(String),

    #[error("{0} does not exist or is not readable")]
    UnreadableDir(String),

    #[error("a {0} file must be provided")]
    MissingRequiredPath(&'static str),
}

/// Create `<base>/<mode>/logs`, returning the working directory and log
/// directory paths.
fn prepare_working_dir(base: &Path, mode: Mode) -> Result<(PathBuf, PathBuf), SetupError> {
    let working_dir = base.join(mode.as_str());
    let log_root = working_dir.join(LOG_ROOT);
    std::fs::create_dir_all(&log_root)
        .map_err(|e| SetupError::CreateDir { path: log_root.clone(), source: e })?;
    Ok((working_dir, log_root))
}

fn check_tls_files(cert_file: &str, key_file: &str) -> Result<(), SetupError> {
    for path in [cert_file, key_file] {
        if !path.is_empty() && !Path::new(path).exists() {
            return Err(SetupError::MissingFile(path.to_string()));
        }
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<(), SetupError> {
    if port < 1 {
        return Err(SetupError::InvalidPort);
    }
    Ok(())
}

/// Persist the resolved engine configuration next to its logs, for
/// inspection and for later invocations.
fn write_config_snapshot<T: serde::Serialize>(section: &T, working_dir: &Path) -> Result<()> {
    let path = working_dir.join(config::CONFIG_FILE);
    let json = serde_json::to_string_pretty(section)?;
    std::fs::write(&path, json)
        .with_context(|| format!("unable to write configuration to {}", path.display()))?;
    Ok(())
}

/// Build the static HTTP origin engine: verify the website root, prepare the
/// working tree, and make sure the default site exists.
pub async fn http_server(mut config: HttpServerConfig, base: &Path) -> Result<Arc<HttpServer>> {
    validate_port(config.port)?;
    check_tls_files(&config.cert_file, &config.key_file)?;

    if !util::is_dir_readable(Path::new(&config.website_root)) {
        return Err(SetupError::UnreadableDir(config.website_root.clone()).into());
    }

    let (working_dir, log_root) = prepare_working_dir(base, Mode::HttpServer)?;
    if !util::is_dir_writable(&working_dir) {
        return Err(SetupError::UnreadableDir(working_dir.display().to_string()).into());
    }
    config.log_root = log_root.display().to_string();

    let site_dir = working_dir.join(origin::DEFAULT_SITE_DIR);
    let images_dir = site_dir.join(origin::IMAGE_DIR);
    std::fs::create_dir_all(&images_dir)
        .map_err(|e| SetupError::CreateDir { path: images_dir.clone(), source: e })?;

    fetch_default_site(&site_dir, &images_dir).await;

    write_config_snapshot(&config, &working_dir)?;
    HttpServer::new(config, working_dir)
}

/// Build the reverse proxy engine from its route table file.
pub fn reverse_proxy_server(
    mut config: ReverseProxyConfig,
    base: &Path,
) -> Result<Arc<ReverseProxyServer>> {
    validate_port(config.port)?;
    check_tls_files(&config.cert_file, &config.key_file)?;

    if config.route_table.is_empty() {
        return Err(SetupError::MissingRequiredPath("route table").into());
    }
    let route_table = config::load_route_table(&config.route_table)?;

    let (working_dir, log_root) = prepare_working_dir(base, Mode::ReverseProxyServer)?;
    config.log_root = log_root.display().to_string();

    write_config_snapshot(&config, &working_dir)?;
    ReverseProxyServer::new(config, route_table, working_dir)
}

/// Build the forward proxy engine; the blacklist file is optional.
pub fn forward_proxy_server(
    mut config: ForwardProxyConfig,
    base: &Path,
) -> Result<Arc<ForwardProxyServer>> {
    validate_port(config.port)?;
    check_tls_files(&config.cert_file, &config.key_file)?;

    let black_list = if config.black_list.is_empty() {
        Vec::new()
    } else {
        config::load_black_list(&config.black_list)?
    };

    let (working_dir, log_root) = prepare_working_dir(base, Mode::ForwardProxyServer)?;
    config.log_root = log_root.display().to_string();

    write_config_snapshot(&config, &working_dir)?;
    ForwardProxyServer::new(config, black_list, working_dir)
}

/// Build the load balancer engine from its server pool file.
pub fn load_balancing_server(
    mut config: LoadBalancerConfig,
    base: &Path,
) -> Result<Arc<LoadBalancingServer>> {
    validate_port(config.port)?;
    check_tls_files(&config.cert_file, &config.key_file)?;

    if config.server_pool.is_empty() {
        return Err(SetupError::MissingRequiredPath("server pool config").into());
    }
    let pool = config::load_server_pool(&config.server_pool)?;

    let (working_dir, log_root) = prepare_working_dir(base, Mode::LoadBalancingServer)?;
    config.log_root = log_root.display().to_string();

    write_config_snapshot(&config, &working_dir)?;
    LoadBalancingServer::new(config, pool, working_dir)
}

/// Populate the default-site tree. Missing files are fetched from the
/// published asset URLs concurrently; when a page cannot be fetched a
/// built-in minimal document is written instead so the fallback site is
/// always complete.
async fn fetch_default_site(site_dir: &Path, images_dir: &Path) {
    let assets: [(&str, PathBuf, Option<&str>); 5] = [
        (JINX_INDEX_URL, site_dir.join(origin::INDEX_FILE), Some(FALLBACK_INDEX)),
        (JINX_404_URL, site_dir.join(origin::NOT_FOUND_FILE), Some(FALLBACK_404)),
        (JINX_CSS_URL, site_dir.join(origin::STYLE_FILE), Some(FALLBACK_STYLE)),
        (JINX_ICO_URL, images_dir.join("jinx.ico"), None),
        (JINX_SVG_URL, images_dir.join("jinx.svg"), None),
    ];

    let client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpsConnector::new());

    let mut downloads = JoinSet::new();
    for (url, dest, fallback) in assets {
        if dest.exists() {
            continue;
        }
        let client = client.clone();
        downloads.spawn(async move {
            match fetch_resource(&client, url).await {
                Ok(content) => {
                    if let Err(e) = tokio::fs::write(&dest, content).await {
                        warn!("unable to write {}: {e}", dest.display());
                    }
                }
                Err(e) => {
                    warn!("unable to fetch resource from {url}: {e:#}");
                    if let Some(fallback) = fallback {
                        if let Err(e) = tokio::fs::write(&dest, fallback).await {
                            warn!("unable to write {}: {e}", dest.display());
                        }
                    }
                }
            }
        });
    }
    while downloads.join_next().await.is_some() {}
}

async fn fetch_resource(
    client: &Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    url: &str,
) -> Result<Bytes> {
    let uri: Uri = url.parse().context("invalid resource url")?;
    let response = tokio::time::timeout(Duration::from_secs(10), client.get(uri))
        .await
        .context("timed out fetching resource")?
        .context("request failed")?;
    if !response.status().is_success() {
        anyhow::bail!("unexpected status {}", response.status());
    }
    let body = response.into_body().collect().await.context("reading resource body")?;
    Ok(body.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn working_dir_layout() {
        let base = TempDir::new().unwrap();
        let (working_dir, log_root) = prepare_working_dir(base.path(), Mode::ReverseProxyServer).unwrap();
        assert_eq!(working_dir, base.path().join("reverse_proxy_server"));
        assert!(log_root.is_dir());
        assert_eq!(log_root, working_dir.join(LOG_ROOT));
    }

    #[test]
    fn tls_pair_must_exist_when_named() {
        let base = TempDir::new().unwrap();
        let cert = base.path().join("cert.pem");
        std::fs::write(&cert, "x").unwrap();

        assert!(check_tls_files("", "").is_ok());
        assert!(check_tls_files(cert.to_str().unwrap(), "/no/such/key.pem").is_err());
    }

    #[test]
    fn reverse_proxy_requires_a_route_table() {
        let base = TempDir::new().unwrap();
        let config = ReverseProxyConfig {
            ip: "127.0.0.1".to_string(),
            port: 8081,
            route_table: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            log_root: String::new(),
        };
        assert!(reverse_proxy_server(config, base.path()).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let base = TempDir::new().unwrap();
        let config = LoadBalancerConfig {
            ip: "127.0.0.1".to_string(),
            port: 0,
            server_pool: String::new(),
            algorithm: "round_robin".to_string(),
            cert_file: String::new(),
            key_file: String::new(),
            log_root: String::new(),
        };
        assert!(load_balancing_server(config, base.path()).is_err());
    }
}
