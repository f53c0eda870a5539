//! Path-routed reverse proxy engine.
//!
//! Every request resolves against a frozen route table of cleaned paths to
//! upstream base URLs, then takes one of three forwarding paths: an opaque
//! CONNECT tunnel, a WebSocket relay, or a plain HTTP reverse proxy through
//! the shared client with the request rewritten to point at the upstream.

use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::http::uri::{Parts, Scheme};
use hyper::{header, Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::relay;
use crate::config::ReverseProxyConfig;
use crate::engine::{self, text_response, BoxBody, ListenConfig, NetEngine, ServerHandle};
use crate::logging::EngineLogs;
use crate::util;

pub struct ReverseProxyServer {
    listen: ListenConfig,
    route_table: HashMap<String, String>,
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    logs: EngineLogs,
    working_dir: PathBuf,
    handle: ServerHandle,
}

impl ReverseProxyServer {
    pub fn new(
        config: ReverseProxyConfig,
        route_table: HashMap<String, String>,
        working_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let logs = EngineLogs::open(Path::new(&config.log_root))?;
        let listen = ListenConfig::new(&config.ip, config.port, &config.cert_file, &config.key_file);
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
        Ok(Arc::new(Self {
            listen,
            route_table,
            client,
            logs,
            working_dir,
            handle: ServerHandle::new(),
        }))
    }

    /// Look up a cleaned request path in the route table. An exact hit wins;
    /// otherwise the longest route that prefixes the path on a segment
    /// boundary does, and the unmatched remainder is carried to the upstream.
    fn resolve_route(&self, path: &str) -> Option<(String, String)> {
        if let Some(upstream) = self.route_table.get(path) {
            return Some((upstream.clone(), String::new()));
        }
        let mut end = path.len();
        while let Some(idx) = path[..end].rfind('/') {
            let prefix = if idx == 0 { "/" } else { &path[..idx] };
            if let Some(upstream) = self.route_table.get(prefix) {
                return Some((upstream.clone(), path[prefix.len()..].to_string()));
            }
            if idx == 0 {
                break;
            }
            end = idx;
        }
        None
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<BoxBody> {
        self.logs.info(format!(
            "received request: method={}, url={}, remote_addr={}",
            req.method(),
            req.uri(),
            peer
        ));

        let path = util::clean_path(req.uri().path());
        let Some((upstream, remainder)) = self.resolve_route(&path) else {
            return text_response(
                StatusCode::NOT_FOUND,
                format!("{path} does not exist in route table"),
            );
        };

        if req.method() == Method::CONNECT {
            return relay::tunnel(req, &self.logs);
        }
        if relay::wants_websocket_upgrade(req.headers()) {
            return relay::websocket(req, &self.logs, peer).await;
        }

        self.proxy_http(req, &upstream, &remainder).await
    }

    /// Forward one HTTP request to its upstream: scheme, authority and Host
    /// come from the upstream URL, the path is the upstream base path joined
    /// to the unmatched remainder with a single slash, and the query string,
    /// headers, and body pass through untouched.
    async fn proxy_http(
        &self,
        mut req: Request<Incoming>,
        upstream: &str,
        remainder: &str,
    ) -> Response<BoxBody> {
        self.logs.info(format!("handling {upstream} request..."));

        let target: Uri = match upstream.parse() {
            Ok(target) => target,
            Err(e) => {
                self.logs.error(format!("invalid upstream url {upstream}: {e}"));
                return text_response(StatusCode::BAD_GATEWAY, format!("invalid upstream url: {e}"));
            }
        };
        let Some(authority) = target.authority().cloned() else {
            self.logs.error(format!("upstream url {upstream} has no host"));
            return text_response(StatusCode::BAD_GATEWAY, "upstream url has no host");
        };

        let base_path = if target.path().is_empty() { "/" } else { target.path() };
        let path = util::single_joining_slash(base_path, remainder);
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };

        let mut parts = Parts::default();
        parts.scheme = Some(target.scheme().cloned().unwrap_or(Scheme::HTTP));
        parts.authority = Some(authority.clone());
        parts.path_and_query = match path_and_query.parse() {
            Ok(pq) => Some(pq),
            Err(e) => {
                self.logs.error(format!("invalid upstream path {path_and_query}: {e}"));
                return text_response(StatusCode::BAD_GATEWAY, format!("invalid upstream path: {e}"));
            }
        };
        *req.uri_mut() = match Uri::from_parts(parts) {
            Ok(uri) => uri,
            Err(e) => {
                self.logs.error(format!("unable to build upstream uri: {e}"));
                return text_response(StatusCode::BAD_GATEWAY, format!("invalid upstream uri: {e}"));
            }
        };
        match header::HeaderValue::from_str(authority.as_str()) {
            Ok(host) => {
                req.headers_mut().insert(header::HOST, host);
            }
            Err(e) => {
                self.logs.error(format!("invalid upstream host {authority}: {e}"));
                return text_response(StatusCode::BAD_GATEWAY, "invalid upstream host");
            }
        }

        match self.client.request(req).await {
            Ok(response) => {
                self.logs.info(format!("handling {upstream} request completed..."));
                response.map(|body| body.boxed())
            }
            Err(e) => {
                self.logs.error(format!("proxying to {upstream} failed: {e}"));
                text_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }
}

impl NetEngine for ReverseProxyServer {
    const NAME: &'static str = "reverse proxy server";

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
