//! Static HTTP origin engine.
//!
//! Requests resolve against a per-host document root under `website_root`,
//! with the bundled default site as the fallback for loopback hosts and for
//! hosts that have no readable directory of their own.

use anyhow::Result;
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{HttpServerConfig, SOFTWARE_NAME};
use crate::engine::{self, BoxBody, ListenConfig, NetEngine, ServerHandle};
use crate::logging::EngineLogs;
use crate::util;

/// Directory under the working dir holding the fallback site.
pub const DEFAULT_SITE_DIR: &str = "www";
pub const INDEX_FILE: &str = "index.html";
pub const NOT_FOUND_FILE: &str = "404.html";
pub const STYLE_FILE: &str = "style.css";
pub const IMAGE_DIR: &str = "images";

/// How an incoming `Range` header applies to a body of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// No range requested, or one this server ignores (multi-range,
    /// malformed): serve the whole file.
    Full,
    /// Serve the inclusive byte window `start..=end`.
    Partial(u64, u64),
    /// The range cannot be satisfied against this file.
    Unsatisfiable,
}

/// Interpret a single-range `Range: bytes=...` header against a file of
/// `len` bytes. Multi-range requests and unparseable values are ignored and
/// answered with the full file; a well-formed range that selects nothing
/// (start past EOF, empty window, zero-length suffix) is unsatisfiable.
fn resolve_byte_range(header: &str, len: u64) -> ByteRange {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    let spec = spec.trim();
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((start_part, end_part)) = spec.split_once('-') else {
        return ByteRange::Full;
    };

    if start_part.is_empty() {
        // suffix form: the final N bytes
        let Ok(suffix) = end_part.trim().parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial(len.saturating_sub(suffix), len - 1);
    }

    let Ok(start) = start_part.trim().parse::<u64>() else {
        return ByteRange::Full;
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    let end = if end_part.trim().is_empty() {
        len - 1
    } else {
        match end_part.trim().parse::<u64>() {
            Ok(end) => end.min(len - 1),
            Err(_) => return ByteRange::Full,
        }
    };
    if start > end {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial(start, end)
}

pub struct HttpServer {
    config: HttpServerConfig,
    listen: ListenConfig,
    logs: EngineLogs,
    working_dir: PathBuf,
    handle: ServerHandle,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, working_dir: PathBuf) -> Result<Arc<Self>> {
        let logs = EngineLogs::open(Path::new(&config.log_root))?;
        let listen = ListenConfig::new(&config.ip, config.port, &config.cert_file, &config.key_file);
        Ok(Arc::new(Self { config, listen, logs, working_dir, handle: ServerHandle::new() }))
    }

    /// Map a request's host and cleaned URL path to the file to serve.
    /// Returns the 404 document for the chosen root when the target is
    /// missing or is a directory.
    fn resolve_file_path(&self, host: &str, url_path: &str) -> Result<PathBuf, PathBuf> {
        let host = util::host_without_port(host);
        let url_path = util::clean_path(url_path);

        let root = if util::is_loopback_host(host) {
            self.working_dir.join(DEFAULT_SITE_DIR)
        } else {
            let site = Path::new(&self.config.website_root).join(host);
            if util::is_dir_readable(&site) {
                site
            } else {
                self.working_dir.join(DEFAULT_SITE_DIR)
            }
        };

        if url_path == "/" || url_path == "." {
            return Ok(root.join(INDEX_FILE));
        }

        let file = root.join(url_path.trim_start_matches('/'));
        match std::fs::metadata(&file) {
            Ok(meta) if meta.is_file() => Ok(file),
            _ => Err(root.join(NOT_FOUND_FILE)),
        }
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<BoxBody> {
        let started = Instant::now();
        self.logs.info(format!(
            "received request: method={}, url={}, remote_addr={}",
            req.method(),
            req.uri(),
            peer
        ));

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host())
            .unwrap_or_default()
            .to_string();
        let head_only = req.method() == Method::HEAD;
        let range = req
            .headers()
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let response = match self.resolve_file_path(&host, req.uri().path()) {
            Ok(file) => self.serve_file(&file, head_only, range.as_deref()).await,
            Err(not_found) => {
                self.logs.info(format!("file not found, serving {}", not_found.display()));
                self.serve_404(&not_found, head_only).await
            }
        };

        self.logs.info(format!("served response: duration={:?}", started.elapsed()));
        response
    }

    /// Serve a regular file, honoring a single-range `Range` header with a
    /// 206 partial response. Unsatisfiable ranges answer 416 with the file
    /// length; multi-range and malformed headers get the whole file.
    async fn serve_file(&self, path: &Path, head_only: bool, range: Option<&str>) -> Response<BoxBody> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                self.logs.error(format!("unable to read {}: {e}", path.display()));
                let fallback = path
                    .parent()
                    .map(|dir| dir.join(NOT_FOUND_FILE))
                    .unwrap_or_else(|| PathBuf::from(NOT_FOUND_FILE));
                return self.serve_404(&fallback, head_only).await;
            }
        };
        let total = content.len() as u64;

        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let builder = Response::builder()
            .header(header::CACHE_CONTROL, "max-age=3600")
            .header(header::SERVER, SOFTWARE_NAME)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CONTENT_TYPE, mime.as_ref());

        let (builder, selected) = match range.map(|h| resolve_byte_range(h, total)) {
            Some(ByteRange::Unsatisfiable) => {
                return builder
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{total}"))
                    .header(header::CONTENT_LENGTH, 0)
                    .body(engine::empty_body())
                    .unwrap();
            }
            Some(ByteRange::Partial(start, end)) => {
                let window = content[start as usize..=end as usize].to_vec();
                (
                    builder
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}")),
                    window,
                )
            }
            _ => (builder.status(StatusCode::OK), content),
        };

        let builder = builder.header(header::CONTENT_LENGTH, selected.len());
        let body = if head_only { engine::empty_body() } else { engine::full_body(selected) };
        builder.body(body).unwrap()
    }

    /// Serve the custom 404 document, downgrading to plain text when the
    /// document itself cannot be read.
    async fn serve_404(&self, path: &Path, head_only: bool) -> Response<BoxBody> {
        let builder = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::CACHE_CONTROL, "max-age=3600")
            .header(header::SERVER, SOFTWARE_NAME);

        match tokio::fs::read(path).await {
            Ok(content) => {
                let body = if head_only { engine::empty_body() } else { engine::full_body(content) };
                builder.header(header::CONTENT_TYPE, "text/html; charset=utf-8").body(body).unwrap()
            }
            Err(_) => {
                let body = if head_only {
                    engine::empty_body()
                } else {
                    engine::full_body("404 Not Found")
                };
                builder
                    .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                    .body(body)
                    .unwrap()
            }
        }
    }
}

impl NetEngine for HttpServer {
    const NAME: &'static str = "http server";

    fn logs(&self) -> &EngineLogs {
        &self.logs
    }

    fn listen(&self) -> &ListenConfig {
        &self.listen
    }

    fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn serve_conn<I>(self: Arc<Self>, io: I, peer: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let logs = self.logs.clone();
        let engine = self;
        engine::serve_http_connection(io, peer, logs, move |req| {
            Arc::clone(&engine).handle_request(req, peer)
        })
        .await;
    }
}
