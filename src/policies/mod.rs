//! Server selection policies.

use std::{fmt::Debug, sync::Arc};

use crate::{config::RoutingConfig, data_connector::ServerRecord};

mod least_recent;
mod round_robin;

pub use least_recent::LeastRecentPolicy;
pub use round_robin::RoundRobinPolicy;

/// Picks one server out of the healthy candidates for a model.
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    /// Index into `servers`, or `None` when there is nothing to pick.
    fn select_server(&self, model_name: &str, servers: &[ServerRecord]) -> Option<usize>;

    /// Get policy name for metrics and debugging
    fn name(&self) -> &'static str;
}

pub fn create_policy(config: &RoutingConfig) -> Arc<dyn LoadBalancingPolicy> {
    if config.round_robin_enabled {
        Arc::new(RoundRobinPolicy::new())
    } else {
        Arc::new(LeastRecentPolicy)
    }
}
