use super::{
    ConfigResult, GatewayConfig, HealthCheckConfig, MetricsConfig, PostgresConfig, RoutingConfig,
    StorageConfig,
};

/// Builder for GatewayConfig that wraps the config itself
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership
    pub fn from_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    // ==================== Server ====================

    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size;
        self
    }

    pub fn admin_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.admin_api_key = Some(key.into());
        self
    }

    pub fn maybe_admin_api_key(mut self, key: Option<String>) -> Self {
        self.config.admin_api_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn block_private_endpoints(mut self, enable: bool) -> Self {
        self.config.block_private_endpoints = enable;
        self
    }

    pub fn include_server_id_header(mut self, enable: bool) -> Self {
        self.config.include_server_id_header = enable;
        self
    }

    // ==================== Health Check ====================

    pub fn health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.config.health_check = health_check;
        self
    }

    pub fn health_check_interval_secs(mut self, secs: u64) -> Self {
        self.config.health_check.check_interval_secs = secs;
        self
    }

    pub fn health_check_timeout_secs(mut self, secs: u64) -> Self {
        self.config.health_check.timeout_secs = secs;
        self
    }

    pub fn max_consecutive_failures(mut self, failures: u32) -> Self {
        self.config.health_check.max_consecutive_failures = failures;
        self
    }

    pub fn auto_deregister(mut self, enable: bool) -> Self {
        self.config.health_check.auto_deregister = enable;
        self
    }

    pub fn max_concurrent_probes(mut self, max: usize) -> Self {
        self.config.health_check.max_concurrent_probes = max;
        self
    }

    // ==================== Routing ====================

    pub fn routing(mut self, routing: RoutingConfig) -> Self {
        self.config.routing = routing;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.routing.request_timeout_secs = secs;
        self
    }

    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.routing.max_retry_attempts = attempts;
        self
    }

    pub fn round_robin(mut self, enable: bool) -> Self {
        self.config.routing.round_robin_enabled = enable;
        self
    }

    // ==================== Storage ====================

    pub fn memory_storage(mut self) -> Self {
        self.config.storage = StorageConfig::Memory;
        self
    }

    pub fn postgres_storage<S: Into<String>>(mut self, db_url: S, pool_max: usize) -> Self {
        self.config.storage = StorageConfig::Postgres(PostgresConfig {
            db_url: db_url.into(),
            pool_max,
        });
        self
    }

    // ==================== Observability ====================

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.log_level = Some(level.into());
        self
    }

    pub fn maybe_log_dir(mut self, dir: Option<String>) -> Self {
        self.config.log_dir = dir;
        self
    }

    pub fn json_logs(mut self, enable: bool) -> Self {
        self.config.json_logs = enable;
        self
    }

    pub fn prometheus<S: Into<String>>(mut self, host: S, port: u16) -> Self {
        self.config.metrics = Some(MetricsConfig {
            host: host.into(),
            port,
        });
        self
    }

    // ==================== Build ====================

    pub fn build(self) -> ConfigResult<GatewayConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Skips validation; tests use this for sub-minimum intervals.
    pub fn build_unchecked(self) -> GatewayConfig {
        self.config
    }
}

impl From<GatewayConfigBuilder> for GatewayConfig {
    fn from(builder: GatewayConfigBuilder) -> Self {
        builder.build_unchecked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_builder_sets_nested_fields() {
        let config = GatewayConfigBuilder::new()
            .host("127.0.0.1")
            .port(9000)
            .health_check_interval_secs(30)
            .health_check_timeout_secs(3)
            .max_consecutive_failures(5)
            .auto_deregister(false)
            .request_timeout_secs(120)
            .max_retry_attempts(4)
            .round_robin(false)
            .build()
            .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.health_check.check_interval_secs, 30);
        assert_eq!(config.health_check.timeout_secs, 3);
        assert_eq!(config.health_check.max_consecutive_failures, 5);
        assert!(!config.health_check.auto_deregister);
        assert_eq!(config.routing.request_timeout_secs, 120);
        assert_eq!(config.routing.max_retry_attempts, 4);
        assert!(!config.routing.round_robin_enabled);
    }

    #[test]
    fn test_build_validates() {
        let result = GatewayConfigBuilder::new()
            .health_check_interval_secs(1)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = GatewayConfigBuilder::new()
            .health_check_interval_secs(1)
            .build_unchecked();
        assert_eq!(config.health_check.check_interval_secs, 1);
    }

    #[test]
    fn test_empty_admin_key_is_ignored() {
        let config = GatewayConfigBuilder::new()
            .maybe_admin_api_key(Some(String::new()))
            .build()
            .unwrap();
        assert!(config.admin_api_key.is_none());
    }

    #[test]
    fn test_postgres_storage() {
        let config = GatewayConfigBuilder::new()
            .postgres_storage("postgres://gateway@localhost/gateway", 8)
            .build()
            .unwrap();
        match config.storage {
            StorageConfig::Postgres(pg) => {
                assert_eq!(pg.db_url, "postgres://gateway@localhost/gateway");
                assert_eq!(pg.pool_max, 8);
            }
            StorageConfig::Memory => panic!("expected postgres storage"),
        }
    }
}
