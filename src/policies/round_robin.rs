//! Per-model round-robin selection

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use super::LoadBalancingPolicy;
use crate::data_connector::ServerRecord;

/// Round-robin selection policy
///
/// Keeps one counter per model. The rotation runs over the candidates in
/// registration order, so callers may pass them in any order without
/// disturbing the cycle. Fairness is exact only while the healthy set is
/// unchanged between requests.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_slot(&self, model_name: &str, len: usize) -> usize {
        let mut counters = self.counters.lock();
        let counter = counters.entry(model_name.to_string()).or_insert(0);
        let slot = *counter % len;
        *counter = (slot + 1) % len;
        slot
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn select_server(&self, model_name: &str, servers: &[ServerRecord]) -> Option<usize> {
        if servers.is_empty() {
            warn!(model = model_name, "No servers available for round-robin selection");
            return None;
        }

        let mut rotation: Vec<usize> = (0..servers.len()).collect();
        rotation.sort_by_key(|&i| servers[i].id);

        let slot = self.next_slot(model_name, servers.len());
        Some(rotation[slot])
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
