//! Engine lifecycle and shared serving plumbing.
//!
//! All four server roles share one contract: `start` binds the listener and
//! begins serving on background tasks, `stop` drains in-flight work within a
//! fixed grace period, `restart` rebinds, and `destroy` additionally removes
//! the engine's working directory. The accept loop, graceful drain, and the
//! per-connection HTTP serving path live here; engines supply only their
//! per-connection behavior.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::config::{self, JinxConfig, Mode};
use crate::lb::LoadBalancingServer;
use crate::logging::EngineLogs;
use crate::origin::HttpServer;
use crate::proxy::{ForwardProxyServer, ReverseProxyServer};
use crate::setup;
use crate::tls;

/// Limit on buffered request head bytes per connection.
pub const MAX_HEADER_BYTES: usize = 1 << 20;
/// Deadline for reading a request head from a connected peer.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for dialing an upstream.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for in-flight work once shutdown begins.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Convert a string or byte payload into a response body.
pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

/// A plain-text response carrying a diagnostic message.
pub fn text_response(status: StatusCode, message: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message))
        .unwrap()
}

/// Listen address plus the optional TLS pair. If either TLS path is empty
/// both are treated as empty and the listener is plaintext.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    cert_file: String,
    key_file: String,
}

impl ListenConfig {
    pub fn new(ip: &str, port: u16, cert_file: &str, key_file: &str) -> Self {
        let tls = !cert_file.is_empty() && !key_file.is_empty();
        Self {
            ip: config::resolve_ip(ip),
            port,
            cert_file: if tls { cert_file.to_string() } else { String::new() },
            key_file: if tls { key_file.to_string() } else { String::new() },
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_tls(&self) -> bool {
        !self.cert_file.is_empty()
    }

    pub fn protocol(&self) -> &'static str {
        if self.is_tls() {
            "HTTPS"
        } else {
            "HTTP"
        }
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>> {
        if !self.is_tls() {
            return Ok(None);
        }
        let acceptor = tls::acceptor(Path::new(&self.cert_file), Path::new(&self.key_file))?;
        Ok(Some(acceptor))
    }
}

struct RunningState {
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    started: bool,
}

/// The mutable half of an engine: the shutdown signal and the serving task
/// for the currently bound listener, if any. Everything else on an engine is
/// immutable after construction.
pub struct ServerHandle {
    state: Mutex<RunningState>,
}

impl Default for ServerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunningState { shutdown: None, task: None, started: false }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunningState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn started(&self) -> bool {
        self.lock().started
    }

    fn install(&self, shutdown: watch::Sender<bool>, task: JoinHandle<()>) {
        let mut state = self.lock();
        state.shutdown = Some(shutdown);
        state.task = Some(task);
        state.started = true;
    }

    /// Block until the current serving task finishes (shutdown completed).
    pub async fn wait(&self) {
        let task = self.lock().task.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Signal shutdown and wait for the drain to finish. Returns false when
    /// the engine was never started.
    async fn stop(&self) -> bool {
        let (shutdown, task) = {
            let mut state = self.lock();
            if !state.started {
                return false;
            }
            (state.shutdown.take(), state.task.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        true
    }
}

/// One of the four server roles. Implementors provide their listen
/// configuration, loggers, running state, working directory, and the
/// per-connection serving future; the lifecycle plumbing is shared.
pub trait NetEngine: Send + Sync + 'static {
    const NAME: &'static str;

    fn logs(&self) -> &EngineLogs;
    fn listen(&self) -> &ListenConfig;
    fn handle(&self) -> &ServerHandle;
    fn working_dir(&self) -> &Path;

    fn serve_conn<I>(
        self: Arc<Self>,
        io: I,
        peer: SocketAddr,
    ) -> impl Future<Output = ()> + Send
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// The lifecycle contract shared by all four engines.
pub trait JinxServer {
    fn start(&self) -> impl Future<Output = Result<()>> + Send;
    fn stop(&self) -> impl Future<Output = ()> + Send;
    fn restart(&self) -> impl Future<Output = Result<()>> + Send;
    fn destroy(&self) -> impl Future<Output = ()> + Send;
}

impl<E: NetEngine> JinxServer for Arc<E> {
    async fn start(&self) -> Result<()> {
        start_engine(self).await
    }

    /// Idempotent; a never-started engine is left untouched.
    async fn stop(&self) {
        if self.handle().stop().await {
            self.logs().info("successfully shutdown server manually");
        }
    }

    async fn restart(&self) -> Result<()> {
        if !self.handle().started() {
            return Ok(());
        }
        JinxServer::stop(self).await;
        start_engine(self).await
    }

    /// Stop, then remove the working directory with logs. Irreversible.
    async fn destroy(&self) {
        if !self.handle().started() {
            return;
        }
        JinxServer::stop(self).await;
        let _ = tokio::fs::remove_dir_all(self.working_dir()).await;
    }
}

async fn start_engine<E: NetEngine>(engine: &Arc<E>) -> Result<()> {
    let listen = engine.listen();
    let logs = engine.logs().clone();
    let addr = listen.addr();

    let acceptor = match listen.tls_acceptor() {
        Ok(acceptor) => acceptor,
        Err(e) => {
            logs.error(format!("failed to initialize tls: {e:#}"));
            return Err(e);
        }
    };

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            logs.error(format!("failed to start server: {e}"));
            return Err(e).with_context(|| format!("unable to bind {addr}"));
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_watcher(shutdown_tx.clone(), logs.clone());

    logs.info(format!(
        "starting jinx {} on {} using {} protocol",
        E::NAME,
        addr,
        listen.protocol()
    ));

    let task = tokio::spawn(accept_loop(Arc::clone(engine), listener, acceptor, shutdown_rx));
    engine.handle().install(shutdown_tx, task);
    Ok(())
}

/// Trigger graceful shutdown when the process receives SIGINT or SIGTERM.
/// The watcher retires silently once its engine's shutdown channel closes.
fn spawn_signal_watcher(shutdown: watch::Sender<bool>, logs: EngineLogs) {
    tokio::spawn(async move {
        if termination_signal(&shutdown).await {
            logs.info("received termination signal: shutting down server...");
            let _ = shutdown.send(true);
        }
    });
}

/// Resolve true on SIGINT/SIGTERM, false when the shutdown channel closes
/// first (the engine was stopped some other way).
#[cfg(unix)]
async fn termination_signal(shutdown: &watch::Sender<bool>) -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return false,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = term.recv() => true,
        _ = shutdown.closed() => false,
    }
}

#[cfg(not(unix))]
async fn termination_signal(shutdown: &watch::Sender<bool>) -> bool {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = shutdown.closed() => false,
    }
}

/// Accept connections until shutdown is signalled, one task per connection,
/// then drain in-flight connections within the grace period.
async fn accept_loop<E: NetEngine>(
    engine: Arc<E>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let logs = engine.logs().clone();
    let mut conns: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let engine = Arc::clone(&engine);
                    match acceptor.clone() {
                        Some(acceptor) => {
                            let logs = logs.clone();
                            conns.spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(stream) => engine.serve_conn(stream, peer).await,
                                    Err(e) => logs.error(format!("tls handshake with {peer} failed: {e}")),
                                }
                            });
                        }
                        None => {
                            conns.spawn(engine.serve_conn(stream, peer));
                        }
                    }
                }
                Err(e) => logs.error(format!("error accepting connection: {e}")),
            },
        }
        // reap connection tasks that have already finished
        while conns.try_join_next().is_some() {}
    }

    drop(listener);

    let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            next = conns.join_next() => {
                if next.is_none() {
                    logs.info("successfully shutdown server");
                    return;
                }
            }
            _ = &mut deadline => {
                logs.error("server shutdown error: grace period exceeded, closing remaining connections");
                conns.shutdown().await;
                return;
            }
        }
    }
}

/// Serve one HTTP/1.1 connection, routing every request through `service`.
/// Upgrades (CONNECT tunnels, WebSocket relays) are enabled.
pub async fn serve_http_connection<I, S, F>(io: I, peer: SocketAddr, logs: EngineLogs, service: S)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Fn(Request<Incoming>) -> F + Send + 'static,
    F: Future<Output = Response<BoxBody>> + Send + 'static,
{
    let service = service_fn(move |req| {
        let response = service(req);
        async move { Ok::<_, Infallible>(response.await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(READ_TIMEOUT)
        .max_buf_size(MAX_HEADER_BYTES)
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();

    if let Err(e) = conn.await {
        let err = e.to_string();
        // benign teardown noise is not worth an error record
        if !err.contains("connection reset") && !err.contains("broken pipe") {
            logs.error(format!("error serving connection from {peer}: {err}"));
        }
    }
}

/// The configured engine, one variant per mode. The `mode` field of the
/// configuration document selects which variant is built.
pub enum Engine {
    Http(Arc<HttpServer>),
    ReverseProxy(Arc<ReverseProxyServer>),
    ForwardProxy(Arc<ForwardProxyServer>),
    LoadBalancer(Arc<LoadBalancingServer>),
}

impl Engine {
    /// Build the engine selected by `config.mode`, preparing its working
    /// directory and loading its auxiliary files.
    pub async fn from_config(config: &JinxConfig, base: &Path) -> Result<Engine> {
        match config.mode {
            Mode::HttpServer => {
                let section = config
                    .http_server
                    .clone()
                    .context("http_server configuration section is missing")?;
                Ok(Engine::Http(setup::http_server(section, base).await?))
            }
            Mode::ReverseProxyServer => {
                let section = config
                    .reverse_proxy
                    .clone()
                    .context("reverse_proxy configuration section is missing")?;
                Ok(Engine::ReverseProxy(setup::reverse_proxy_server(section, base)?))
            }
            Mode::ForwardProxyServer => {
                let section = config
                    .forward_proxy
                    .clone()
                    .context("forward_proxy configuration section is missing")?;
                Ok(Engine::ForwardProxy(setup::forward_proxy_server(section, base)?))
            }
            Mode::LoadBalancingServer => {
                let section = config
                    .load_balancer
                    .clone()
                    .context("load_balancer configuration section is missing")?;
                Ok(Engine::LoadBalancer(setup::load_balancing_server(section, base)?))
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            Engine::Http(s) => s.start().await,
            Engine::ReverseProxy(s) => s.start().await,
            Engine::ForwardProxy(s) => s.start().await,
            Engine::LoadBalancer(s) => s.start().await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Engine::Http(s) => JinxServer::stop(s).await,
            Engine::ReverseProxy(s) => JinxServer::stop(s).await,
            Engine::ForwardProxy(s) => JinxServer::stop(s).await,
            Engine::LoadBalancer(s) => JinxServer::stop(s).await,
        }
    }

    pub async fn restart(&self) -> Result<()> {
        match self {
            Engine::Http(s) => s.restart().await,
            Engine::ReverseProxy(s) => s.restart().await,
            Engine::ForwardProxy(s) => s.restart().await,
            Engine::LoadBalancer(s) => s.restart().await,
        }
    }

    pub async fn destroy(&self) {
        match self {
            Engine::Http(s) => s.destroy().await,
            Engine::ReverseProxy(s) => s.destroy().await,
            Engine::ForwardProxy(s) => s.destroy().await,
            Engine::LoadBalancer(s) => s.destroy().await,
        }
    }

    /// Block until the serving loop exits (i.e. shutdown has completed).
    pub async fn wait(&self) {
        match self {
            Engine::Http(s) => s.handle().wait().await,
            Engine::ReverseProxy(s) => s.handle().wait().await,
            Engine::ForwardProxy(s) => s.handle().wait().await,
            Engine::LoadBalancer(s) => s.handle().wait().await,
        }
    }
}
