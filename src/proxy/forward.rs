//! Open forward proxy engine with a hostname blacklist.
//!
//! Requests for banned hosts are refused up front; everything else takes the
//! same three forwarding paths as the reverse proxy, except that plain HTTP
//! requests are forwarded substantially as received.

use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::relay;
use crate::config::ForwardProxyConfig;
use crate::engine::{self, text_response, BoxBody, ListenConfig, NetEngine, ServerHandle};
use crate::logging::EngineLogs;
use crate::util;

pub struct ForwardProxyServer {
    listen: ListenConfig,
    black_list: Vec<String>,
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    logs: EngineLogs,
    working_dir: PathBuf,
    handle: ServerHandle,
}

impl ForwardProxyServer {
    pub fn new(
        config: ForwardProxyConfig,
        black_list: Vec<String>,
        working_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let logs = EngineLogs::open(Path::new(&config.log_root))?;
        let listen = ListenConfig::new(&config.ip, config.port, &config.cert_file, &config.key_file);
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new());
        Ok(Arc::new(Self {
            listen,
            black_list,
            client,
            logs,
            working_dir,
            handle: ServerHandle::new(),
        }))
    }

    fn is_blacklisted(&self, host: &str) -> bool {
        self.black_list.iter().any(|banned| banned == host)
    }

    /// The host a proxied request targets, port stripped: the request
    /// target's authority when present, the `Host` header otherwise.
    fn request_host(req: &Request<Incoming>) -> String {
        let raw = req
            .uri()
            .host()
            .map(str::to_string)
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .unwrap_or_default();
        util::host_without_port(&raw).to_string()
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<BoxBody> {
        self.logs.info(format!(
            "received request: method={}, url={}, remote_addr={}",
            req.method(),
            req.uri(),
            peer
        ));

        let host = Self::request_host(&req);
        if self.is_blacklisted(&host) {
            return text_response(StatusCode::FORBIDDEN, format!("{host} has been blacklisted"));
        }

        if req.method() == Method::CONNECT {
            return relay::tunnel(req, &self.logs);
        }
        if relay::wants_websocket_upgrade(req.headers()) {
            return relay::websocket(req, &self.logs, peer).await;
        }

        self.forward_http(req).await
    }

    /// Forward one HTTP request unchanged. Absolute-form targets go straight
    /// to the client; origin-form targets get an absolute URI synthesized
    /// from the Host header first.
    async fn forward_http(&self, mut req: Request<Incoming>) -> Response<BoxBody> {
        self.logs.info(format!("handling {} request...", req.uri()));

        if req.uri().scheme().is_none() {
            let Some(host) = req
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
            else {
                return text_response(StatusCode::BAD_GATEWAY, "request target is missing a host");
            };
            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            match format!("http://{host}{path_and_query}").parse::<Uri>() {
                Ok(uri) => *req.uri_mut() = uri,
                Err(e) => {
                    self.logs.error(format!("unable to build request target: {e}"));
                    return text_response(StatusCode::BAD_GATEWAY, format!("invalid request target: {e}"));
                }
            }
        }

        let target = req.uri().clone();
        match self.client.request(req).await {
            Ok(response) => {
                self.logs.info(format!("handling {target} request completed..."));
                response.map(|body| body.boxed())
            }
            Err(e) => {
                self.logs.error(format!("forwarding to {target} failed: {e}"));
                text_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
        }
    }
}

impl NetEngine for ForwardProxyServer {
    const NAME: &'static str = "forward proxy server";

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
