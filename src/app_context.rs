use std::{sync::Arc, time::Duration};

use reqwest::Client;
use tracing::debug;

use crate::{
    config::GatewayConfig,
    core::{HealthMonitor, HealthProber, RegistrationService},
    data_connector::{RegistryError, RegistryStorage, create_storage},
    policies::create_policy,
    routers::RequestRouter,
};

#[derive(Debug, thiserror::Error)]
pub enum AppContextError {
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Failed to initialize registry: {0}")]
    Registry(#[from] RegistryError),
}

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: GatewayConfig,
    pub registry: Arc<dyn RegistryStorage>,
    pub router: Arc<RequestRouter>,
    pub monitor: Arc<HealthMonitor>,
    pub registration: RegistrationService,
}

impl AppContext {
    /// Builds the storage backend named in the config, then everything on top.
    pub async fn from_config(config: GatewayConfig) -> Result<Self, AppContextError> {
        let registry = create_storage(&config.storage).await?;
        Self::with_registry(config, registry)
    }

    pub fn with_registry(
        config: GatewayConfig,
        registry: Arc<dyn RegistryStorage>,
    ) -> Result<Self, AppContextError> {
        // No client-wide total timeout: it would cut long streams short.
        // Every call sets its own.
        let client = Client::builder()
            .pool_idle_timeout(Some(Duration::from_secs(50)))
            .pool_max_idle_per_host(64)
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()?;

        let prober = HealthProber::new(client.clone());
        let policy = create_policy(&config.routing);
        debug!(policy = policy.name(), "Load balancing policy selected");

        let router = Arc::new(RequestRouter::new(
            client,
            registry.clone(),
            policy,
            config.routing.request_timeout(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            prober.clone(),
            config.health_check.clone(),
        ));
        let registration = RegistrationService::new(
            registry.clone(),
            prober,
            config.health_check.timeout(),
            config.block_private_endpoints,
        );

        Ok(Self {
            config,
            registry,
            router,
            monitor,
            registration,
        })
    }
}
