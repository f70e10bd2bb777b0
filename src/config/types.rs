use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult};

/// Health checks below this period would hammer volunteer-hosted backends.
pub const MIN_HEALTH_CHECK_INTERVAL_SECS: u64 = 10;

/// Shortest admin key accepted when one is configured
pub const MIN_ADMIN_API_KEY_LEN: usize = 16;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub max_payload_size: usize,
    pub admin_api_key: Option<String>,
    /// Reject loopback, private and internal endpoints at registration
    pub block_private_endpoints: bool,
    pub include_server_id_header: bool,
    pub health_check: HealthCheckConfig,
    pub routing: RoutingConfig,
    pub storage: StorageConfig,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
    pub json_logs: bool,
    pub metrics: Option<MetricsConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_payload_size: 1_048_576,
            admin_api_key: None,
            block_private_endpoints: false,
            include_server_id_header: true,
            health_check: HealthCheckConfig::default(),
            routing: RoutingConfig::default(),
            storage: StorageConfig::default(),
            log_level: None,
            log_dir: None,
            json_logs: false,
            metrics: None,
        }
    }
}

/// Background health monitoring of registered servers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub auto_deregister: bool,
    pub max_concurrent_probes: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            timeout_secs: 10,
            max_consecutive_failures: 3,
            auto_deregister: true,
            max_concurrent_probes: 16,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(MIN_HEALTH_CHECK_INTERVAL_SECS))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Request forwarding and server selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    pub request_timeout_secs: u64,
    pub max_retry_attempts: u32,
    /// Falls back to least-recently-used selection when disabled
    pub round_robin_enabled: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            max_retry_attempts: 2,
            round_robin_enabled: true,
        }
    }
}

impl RoutingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where server records live
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Postgres(PostgresConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresConfig {
    pub db_url: String,
    pub pool_max: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            db_url: String::new(),
            pool_max: 16,
        }
    }
}

/// Prometheus exporter listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub port: u16,
    pub host: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: 29000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port".to_string(),
                value: self.port.to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        if self.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size".to_string(),
                value: self.max_payload_size.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if let Some(key) = &self.admin_api_key {
            if key.len() < MIN_ADMIN_API_KEY_LEN {
                return Err(ConfigError::InvalidValue {
                    field: "admin_api_key".to_string(),
                    value: "<redacted>".to_string(),
                    reason: format!("must be at least {MIN_ADMIN_API_KEY_LEN} characters"),
                });
            }
        }

        if let Some(level) = &self.log_level {
            if !LOG_LEVELS.contains(&level.to_lowercase().as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "log_level".to_string(),
                    value: level.clone(),
                    reason: format!("must be one of {}", LOG_LEVELS.join(", ")),
                });
            }
        }

        self.health_check.validate()?;
        self.routing.validate()?;
        self.storage.validate()?;

        Ok(())
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.check_interval_secs < MIN_HEALTH_CHECK_INTERVAL_SECS {
            return Err(ConfigError::InvalidValue {
                field: "health_check.check_interval_secs".to_string(),
                value: self.check_interval_secs.to_string(),
                reason: format!("must be at least {MIN_HEALTH_CHECK_INTERVAL_SECS} seconds"),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.timeout_secs".to_string(),
                value: self.timeout_secs.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.max_consecutive_failures".to_string(),
                value: self.max_consecutive_failures.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_concurrent_probes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.max_concurrent_probes".to_string(),
                value: self.max_concurrent_probes.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "routing.request_timeout_secs".to_string(),
                value: self.request_timeout_secs.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "routing.max_retry_attempts".to_string(),
                value: self.max_retry_attempts.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if let StorageConfig::Postgres(pg) = self {
            if pg.db_url.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "storage.postgres.db_url".to_string(),
                });
            }
            if pg.pool_max == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "storage.postgres.pool_max".to_string(),
                    value: pg.pool_max.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_payload_size, 1_048_576);
        assert!(config.admin_api_key.is_none());
        assert!(!config.block_private_endpoints);
        assert!(config.include_server_id_header);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert!(config.metrics.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_health_check_defaults() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.check_interval_secs, 60);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.max_consecutive_failures, 3);
        assert!(config.auto_deregister);
        assert_eq!(config.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_routing_defaults() {
        let config = RoutingConfig::default();
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.max_retry_attempts, 2);
        assert!(config.round_robin_enabled);
    }

    #[test]
    fn test_interval_is_clamped_to_minimum() {
        let config = HealthCheckConfig {
            check_interval_secs: 1,
            ..Default::default()
        };
        assert_eq!(config.interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_short_interval_rejected() {
        let mut config = GatewayConfig::default();
        config.health_check.check_interval_secs = 5;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("check_interval_secs"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = GatewayConfig::default();
        config.routing.max_retry_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "routing.max_retry_attempts"
        ));
    }

    #[test]
    fn test_short_admin_key_rejected_without_leaking_it() {
        let config = GatewayConfig {
            admin_api_key: Some("short".to_string()),
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("admin_api_key"));
        assert!(!err.contains("short"));
    }

    #[test]
    fn test_postgres_requires_url() {
        let config = GatewayConfig {
            storage: StorageConfig::Postgres(PostgresConfig::default()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let config = GatewayConfig {
            log_level: Some("verbose".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GatewayConfig {
            log_level: Some("DEBUG".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_serde() {
        let storage = StorageConfig::Postgres(PostgresConfig {
            db_url: "postgres://localhost/gateway".to_string(),
            pool_max: 4,
        });
        let json = serde_json::to_value(&storage).unwrap();
        assert_eq!(json["type"], "postgres");
        assert_eq!(json["pool_max"], 4);

        let back: StorageConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, storage);
    }
}
