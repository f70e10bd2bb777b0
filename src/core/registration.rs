//! Registration, update and deregistration of backends.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{info, warn};

use super::{
    error::{RegistrationError, RegistrationResult},
    health::{HealthProber, HealthResult},
    url_validation::validate_endpoint_url,
};
use crate::{
    data_connector::{NewServer, RegistryStorage, ServerRecord, ServerUpdate},
    observability::metrics::GatewayMetrics,
};

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub server: ServerRecord,
    pub initial_health: HealthResult,
}

/// Owns the only write path for identity fields and `is_active`.
#[derive(Clone)]
pub struct RegistrationService {
    registry: Arc<dyn RegistryStorage>,
    prober: HealthProber,
    probe_timeout: Duration,
    block_private_endpoints: bool,
}

impl RegistrationService {
    pub fn new(
        registry: Arc<dyn RegistryStorage>,
        prober: HealthProber,
        probe_timeout: Duration,
        block_private_endpoints: bool,
    ) -> Self {
        Self {
            registry,
            prober,
            probe_timeout,
            block_private_endpoints,
        }
    }

    /// Validates, stores and immediately probes a new backend.
    ///
    /// A failed initial probe does not reject the registration; the server is
    /// stored as unhealthy and the monitor keeps checking it.
    pub async fn register_server(
        &self,
        mut request: NewServer,
    ) -> RegistrationResult<RegistrationOutcome> {
        request.endpoint_url =
            validate_endpoint_url(&request.endpoint_url, self.block_private_endpoints)?;
        request.model_name = validated_model_name(&request.model_name)?;

        let created = self.registry.create_server(request).await?;
        info!(
            registration_id = %created.registration_id,
            model = %created.model_name,
            endpoint = %created.endpoint_url,
            "Registered server"
        );

        let initial_health = self.prober.probe_server(&created, self.probe_timeout).await;
        let server = self
            .registry
            .record_health_result(
                created.id,
                initial_health.is_healthy,
                initial_health.error_message.as_deref(),
            )
            .await?;

        GatewayMetrics::record_registration(initial_health.is_healthy);
        if initial_health.is_healthy {
            info!(
                registration_id = %server.registration_id,
                latency_ms = initial_health.latency_ms,
                "Initial health check passed"
            );
        } else {
            warn!(
                registration_id = %server.registration_id,
                error = initial_health.error_message.as_deref().unwrap_or("unknown"),
                "Initial health check failed, server registered as unhealthy"
            );
        }

        Ok(RegistrationOutcome {
            server,
            initial_health,
        })
    }

    /// Edits an active record. Endpoint changes pass the URL gate again.
    pub async fn update_server(
        &self,
        registration_id: &str,
        mut update: ServerUpdate,
    ) -> RegistrationResult<ServerRecord> {
        if let Some(endpoint) = &update.endpoint_url {
            update.endpoint_url = Some(validate_endpoint_url(
                endpoint,
                self.block_private_endpoints,
            )?);
        }
        if let Some(model) = &update.model_name {
            update.model_name = Some(validated_model_name(model)?);
        }

        let updated = self
            .registry
            .update_server(registration_id, update)
            .await?
            .ok_or_else(|| RegistrationError::NotFound {
                registration_id: registration_id.to_string(),
            })?;

        info!(registration_id, "Updated server");
        Ok(updated)
    }

    /// Soft delete. False if unknown or already inactive.
    pub async fn deregister_server(&self, registration_id: &str) -> RegistrationResult<bool> {
        let removed = self.registry.deregister_server(registration_id).await?;
        if removed {
            GatewayMetrics::record_deregistration("admin");
            info!(registration_id, "Deregistered server");
        }
        Ok(removed)
    }
}

fn validated_model_name(name: &str) -> RegistrationResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RegistrationError::InvalidModelName);
    }
    Ok(trimmed.to_string())
}
