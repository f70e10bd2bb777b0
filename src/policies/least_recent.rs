use super::LoadBalancingPolicy;
use crate::data_connector::ServerRecord;

/// Always takes the head of the candidate list, which the registry orders by
/// least recent successful request.
#[derive(Debug, Default)]
pub struct LeastRecentPolicy;

impl LoadBalancingPolicy for LeastRecentPolicy {
    fn select_server(&self, _model_name: &str, servers: &[ServerRecord]) -> Option<usize> {
        if servers.is_empty() { None } else { Some(0) }
    }

    fn name(&self) -> &'static str {
        "least_recent"
    }
}
