//! Layer-4 load balancer engine.
//!
//! The listener accepts raw TCP (optionally TLS-terminated at the front),
//! picks an upstream per connection with the configured strategy, and relays
//! bytes in both directions until either side closes. Cleartext is relayed
//! upstream even when the front is TLS; that asymmetry is deliberate.

pub mod algo;

use anyhow::Result;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{LoadBalancerConfig, UpstreamServer};
use crate::engine::{ListenConfig, NetEngine, ServerHandle, DIAL_TIMEOUT};
use crate::logging::EngineLogs;
use crate::proxy::relay;

pub use algo::{Algorithm, BalancerState, SelectContext};

pub struct LoadBalancingServer {
    listen: ListenConfig,
    pool: Vec<UpstreamServer>,
    algorithm: Algorithm,
    state: Mutex<BalancerState>,
    logs: EngineLogs,
    working_dir: PathBuf,
    handle: ServerHandle,
}

impl LoadBalancingServer {
    pub fn new(
        config: LoadBalancerConfig,
        pool: Vec<UpstreamServer>,
        working_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let logs = EngineLogs::open(Path::new(&config.log_root))?;
        let listen = ListenConfig::new(&config.ip, config.port, &config.cert_file, &config.key_file);
        let algorithm = Algorithm::from_tag(&config.algorithm);
        let state = Mutex::new(BalancerState::new(pool.len()));
        Ok(Arc::new(Self {
            listen,
            pool,
            algorithm,
            state,
            logs,
            working_dir,
            handle: ServerHandle::new(),
        }))
    }

    fn state(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select_upstream(&self, peer: SocketAddr) -> usize {
        let ctx = SelectContext { client_ip: peer.ip(), region: None };
        algo::select(self.algorithm, &self.pool, &mut self.state(), &ctx)
    }

    /// Relay one accepted connection to a freshly selected upstream.
    async fn proxy_tcp<I>(&self, client: I, peer: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let idx = self.select_upstream(peer);
        let addr = self.pool[idx].addr();

        let dial_started = Instant::now();
        let upstream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.logs.error(format!("error connecting to remote {addr}: {e}"));
                return;
            }
            Err(_) => {
                self.logs.error(format!("timed out connecting to remote {addr}"));
                return;
            }
        };

        {
            let mut state = self.state();
            state.record_dial_time(idx, dial_started.elapsed());
            state.begin_connection(idx);
        }

        relay::join_streams(client, upstream).await;

        self.state().end_connection(idx);
    }
}

impl NetEngine for LoadBalancingServer {
    const NAME: &'static str = "load balancing server";

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
        self.proxy_tcp(io, peer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_server(algorithm: &str, pool_size: usize) -> (TempDir, Arc<LoadBalancingServer>) {
        let base = TempDir::new().unwrap();
        let working_dir = base.path().join("load_balancing_server");
        let log_root = working_dir.join("logs");
        std::fs::create_dir_all(&log_root).unwrap();

        let pool: Vec<UpstreamServer> = (0..pool_size)
            .map(|i| UpstreamServer {
                ip: "127.0.0.1".to_string(),
                port: 9000 + i as u16,
                weight: 1,
                location: String::new(),
            })
            .collect();
        let config = LoadBalancerConfig {
            ip: "127.0.0.1".to_string(),
            port: 8083,
            server_pool: String::new(),
            algorithm: algorithm.to_string(),
            cert_file: String::new(),
            key_file: String::new(),
            log_root: log_root.display().to_string(),
        };
        let server = LoadBalancingServer::new(config, pool, working_dir).unwrap();
        (base, server)
    }

    #[test]
    fn unknown_algorithm_tag_defaults_to_round_robin() {
        let (_base, server) = test_server("definitely_not_real", 3);
        assert_eq!(server.algorithm, Algorithm::RoundRobin);
    }

    #[test]
    fn selection_cycles_through_the_pool() {
        let (_base, server) = test_server("round_robin", 3);
        let peer: SocketAddr = "192.0.2.1:50000".parse().unwrap();
        let picks: Vec<usize> = (0..4).map(|_| server.select_upstream(peer)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn connection_accounting_feeds_least_connections() {
        let (_base, server) = test_server("least_connections", 2);
        let peer: SocketAddr = "192.0.2.1:50000".parse().unwrap();

        server.state().begin_connection(0);
        assert_eq!(server.select_upstream(peer), 1);
        server.state().end_connection(0);
    }
}
