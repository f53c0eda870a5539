//! Upstream selection strategies.
//!
//! Every strategy maps (pool, shared balancer state, connection context) to
//! an index into the pool. The caller holds the balancer mutex for the whole
//! call, so a strategy may read and update the cursor and the per-upstream
//! statistics without further coordination.

use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::Duration;

use crate::config::UpstreamServer;

/// Selection strategy tags accepted in the balancer configuration.
/// Unknown tags fall back to round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
    LeastResponseTime,
    Hashing,
    WeightedRoundRobin,
    WeightedLeastConnections,
    WeightedLeastResponseTime,
    Random,
    ResourceBased,
    Geographical,
}

impl Algorithm {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "round_robin" => Algorithm::RoundRobin,
            "least_connections" => Algorithm::LeastConnections,
            "least_response_time" => Algorithm::LeastResponseTime,
            "hashing" => Algorithm::Hashing,
            "weighted_round_robin" => Algorithm::WeightedRoundRobin,
            "weighted_least_connections" => Algorithm::WeightedLeastConnections,
            "weighted_least_response_time" => Algorithm::WeightedLeastResponseTime,
            "random" => Algorithm::Random,
            "resource_based" => Algorithm::ResourceBased,
            "geographical" => Algorithm::Geographical,
            _ => Algorithm::RoundRobin,
        }
    }
}

/// Per-upstream counters maintained by the balancer. All fields are guarded
/// by the same mutex as the cursor.
#[derive(Debug, Clone, Default)]
pub struct UpstreamStats {
    pub active_connections: u32,
    /// Exponentially weighted moving average of upstream dial time.
    pub ewma_dial_ms: f64,
    /// Externally reported load metric (CPU or memory utilization).
    pub reported_load: f64,
    current_weight: i64,
}

/// The balancer's shared mutable state: the round-robin cursor plus one
/// statistics slot per upstream.
#[derive(Debug)]
pub struct BalancerState {
    pub cursor: i64,
    pub stats: Vec<UpstreamStats>,
}

impl BalancerState {
    pub fn new(pool_size: usize) -> Self {
        Self { cursor: -1, stats: vec![UpstreamStats::default(); pool_size] }
    }

    pub fn begin_connection(&mut self, idx: usize) {
        self.stats[idx].active_connections += 1;
    }

    pub fn end_connection(&mut self, idx: usize) {
        let stats = &mut self.stats[idx];
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }

    pub fn record_dial_time(&mut self, idx: usize, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let ewma = &mut self.stats[idx].ewma_dial_ms;
        *ewma = if *ewma == 0.0 { ms } else { 0.8 * *ewma + 0.2 * ms };
    }

    pub fn record_load(&mut self, idx: usize, load: f64) {
        self.stats[idx].reported_load = load;
    }
}

/// Connection-scoped inputs a strategy may consult.
pub struct SelectContext {
    pub client_ip: IpAddr,
    /// Inferred client region, when a resolver supplies one.
    pub region: Option<String>,
}

/// Pick an upstream index from a non-empty pool.
pub fn select(
    algorithm: Algorithm,
    pool: &[UpstreamServer],
    state: &mut BalancerState,
    ctx: &SelectContext,
) -> usize {
    match algorithm {
        Algorithm::RoundRobin => round_robin(pool, state),
        Algorithm::LeastConnections => least_connections(state),
        Algorithm::LeastResponseTime => least_response_time(state),
        Algorithm::Hashing => hashing(pool, ctx.client_ip),
        Algorithm::WeightedRoundRobin => weighted_round_robin(pool, state),
        Algorithm::WeightedLeastConnections => weighted_least_connections(pool, state),
        Algorithm::WeightedLeastResponseTime => weighted_least_response_time(pool, state),
        Algorithm::Random => random(pool),
        Algorithm::ResourceBased => resource_based(state),
        Algorithm::Geographical => geographical(pool, state, ctx),
    }
}

fn round_robin(pool: &[UpstreamServer], state: &mut BalancerState) -> usize {
    let next = (state.cursor + 1).rem_euclid(pool.len() as i64);
    state.cursor = next;
    next as usize
}

fn least_connections(state: &BalancerState) -> usize {
    state
        .stats
        .iter()
        .enumerate()
        .min_by_key(|(_, stats)| stats.active_connections)
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn least_response_time(state: &BalancerState) -> usize {
    (0..state.stats.len())
        .min_by(|&a, &b| {
            let (sa, sb) = (&state.stats[a], &state.stats[b]);
            sa.ewma_dial_ms
                .total_cmp(&sb.ewma_dial_ms)
                .then_with(|| sa.active_connections.cmp(&sb.active_connections))
        })
        .unwrap_or(0)
}

fn hashing(pool: &[UpstreamServer], client_ip: IpAddr) -> usize {
    let mut hasher = DefaultHasher::new();
    client_ip.hash(&mut hasher);
    (hasher.finish() % pool.len() as u64) as usize
}

/// Smooth weighted round-robin: each pick raises every current weight by its
/// configured weight, takes the highest, and lowers the winner by the weight
/// total, spreading picks proportionally without bursts.
fn weighted_round_robin(pool: &[UpstreamServer], state: &mut BalancerState) -> usize {
    let mut total = 0i64;
    let mut best = 0usize;
    for (idx, server) in pool.iter().enumerate() {
        let weight = i64::from(server.weight.max(1));
        total += weight;
        state.stats[idx].current_weight += weight;
        if state.stats[idx].current_weight > state.stats[best].current_weight {
            best = idx;
        }
    }
    state.stats[best].current_weight -= total;
    best
}

fn weighted_least_connections(pool: &[UpstreamServer], state: &BalancerState) -> usize {
    (0..pool.len())
        .min_by(|&a, &b| {
            let load_a = f64::from(state.stats[a].active_connections) / f64::from(pool[a].weight.max(1));
            let load_b = f64::from(state.stats[b].active_connections) / f64::from(pool[b].weight.max(1));
            load_a.total_cmp(&load_b)
        })
        .unwrap_or(0)
}

fn weighted_least_response_time(pool: &[UpstreamServer], state: &BalancerState) -> usize {
    (0..pool.len())
        .min_by(|&a, &b| {
            let load_a = state.stats[a].ewma_dial_ms / f64::from(pool[a].weight.max(1));
            let load_b = state.stats[b].ewma_dial_ms / f64::from(pool[b].weight.max(1));
            load_a.total_cmp(&load_b)
        })
        .unwrap_or(0)
}

fn random(pool: &[UpstreamServer]) -> usize {
    rand::thread_rng().gen_range(0..pool.len())
}

fn resource_based(state: &BalancerState) -> usize {
    (0..state.stats.len())
        .min_by(|&a, &b| {
            let (sa, sb) = (&state.stats[a], &state.stats[b]);
            sa.reported_load
                .total_cmp(&sb.reported_load)
                .then_with(|| sa.active_connections.cmp(&sb.active_connections))
        })
        .unwrap_or(0)
}

fn geographical(pool: &[UpstreamServer], state: &mut BalancerState, ctx: &SelectContext) -> usize {
    if let Some(region) = &ctx.region {
        if let Some(idx) = pool.iter().position(|s| s.location.eq_ignore_ascii_case(region)) {
            return idx;
        }
    }
    round_robin(pool, state)
}
