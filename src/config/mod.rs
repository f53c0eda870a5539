use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::util;

pub const SOFTWARE_NAME: &str = "Jinx";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONFIG_FILE: &str = "jinx_config.json";
pub const DEFAULT_IP: &str = "127.0.0.1";

/// The four mutually exclusive server roles a `jinx` process can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    HttpServer,
    ReverseProxyServer,
    ForwardProxyServer,
    LoadBalancingServer,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::HttpServer => "http_server",
            Mode::ReverseProxyServer => "reverse_proxy_server",
            Mode::ForwardProxyServer => "forward_proxy_server",
            Mode::LoadBalancingServer => "load_balancing_server",
        }
    }
}

fn default_ip() -> String {
    DEFAULT_IP.to_string()
}

/// Static HTTP origin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,

    /// Directory holding one subdirectory per served hostname.
    pub website_root: String,

    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,

    /// Filled in by setup; requests and errors are logged here.
    #[serde(default)]
    pub log_root: String,
}

/// Reverse proxy configuration. `route_table` points at a JSON file mapping
/// cleaned request paths to upstream base URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseProxyConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,

    pub route_table: String,

    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub log_root: String,
}

/// Forward proxy configuration. `black_list` points at a plain-text file of
/// banned hostnames, one per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardProxyConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,

    #[serde(default)]
    pub black_list: String,

    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub log_root: String,
}

fn default_algorithm() -> String {
    "round_robin".to_string()
}

/// L4 load balancer configuration. `server_pool` points at a JSON file of
/// upstream descriptors; `algorithm` names the selection strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    pub port: u16,

    pub server_pool: String,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub log_root: String,
}

/// One upstream in the balancer pool. Weight and location only matter to the
/// weighted and geographical strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamServer {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Weight", default)]
    pub weight: u32,
    #[serde(rename = "Location", default)]
    pub location: String,
}

impl UpstreamServer {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Top-level configuration document: a mode plus the matching section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JinxConfig {
    pub mode: Mode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_server: Option<HttpServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_proxy: Option<ReverseProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_proxy: Option<ForwardProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerConfig>,
}

/// Base directory for all engine working directories and the config file.
/// `$JINX_HOME` wins; otherwise `~/jinx`.
pub fn base_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("JINX_HOME") {
        return PathBuf::from(home);
    }
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join("jinx"),
        None => PathBuf::from("jinx"),
    }
}

/// Load the main configuration document from a JSON file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<JinxConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to locate configuration file {}", path.display()))?;
    let config: JinxConfig = serde_json::from_str(&content).with_context(|| {
        format!("error occurred while reading configuration file {}", path.display())
    })?;
    Ok(config)
}

/// Reject ports outside 1..=65535. Serde already bounds the upper end via
/// `u16`; zero still has to be caught here.
pub fn validate_port(port: u16) -> Result<()> {
    if port < 1 {
        bail!("port must be between 1 and 65535");
    }
    Ok(())
}

/// Resolve a possibly-invalid IP string, falling back to the loopback
/// address like the default listen address does.
pub fn resolve_ip(ip: &str) -> String {
    if ip.parse::<std::net::IpAddr>().is_ok() {
        ip.to_string()
    } else {
        tracing::warn!("{ip} is an invalid ip address: using loopback address {DEFAULT_IP}");
        DEFAULT_IP.to_string()
    }
}

fn require_extension(path: &Path, ext: &str, what: &str) -> Result<()> {
    let actual = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    if actual != ext {
        bail!("{what} file {} must have a .{ext} extension", path.display());
    }
    Ok(())
}

/// Load a route table: a JSON object mapping request paths to upstream base
/// URLs. The file must carry a `.json` extension. Keys are canonically
/// cleaned so lookups against cleaned request paths are exact.
pub fn load_route_table<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    require_extension(path, "json", "route table")?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read route table {}", path.display()))?;
    let raw: HashMap<String, String> = serde_json::from_str(&content)
        .with_context(|| format!("error occurred while reading route table {}", path.display()))?;

    Ok(raw
        .into_iter()
        .map(|(path, upstream)| (util::clean_path(&path), upstream))
        .collect())
}

/// Load a server pool: a JSON object whose values are upstream descriptors.
/// Entries are ordered by their keys so the pool sequence is deterministic.
pub fn load_server_pool<P: AsRef<Path>>(path: P) -> Result<Vec<UpstreamServer>> {
    let path = path.as_ref();
    require_extension(path, "json", "server pool")?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read server pool config {}", path.display()))?;
    let raw: BTreeMap<String, UpstreamServer> = serde_json::from_str(&content).with_context(|| {
        format!("error occurred while reading server pool config {}", path.display())
    })?;

    if raw.is_empty() {
        bail!("server pool config {} contains no upstream servers", path.display());
    }
    Ok(raw.into_values().collect())
}

/// Load a blacklist: plain text, one hostname per line, `.txt` extension.
/// Ports are stripped and blank lines skipped.
pub fn load_black_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    require_extension(path, "txt", "blacklist")?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read blacklist {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| util::host_without_port(line).to_string())
        .collect())
}
