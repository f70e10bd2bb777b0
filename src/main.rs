use clap::{ArgAction, Parser};
use inference_gateway::{
    config::{ConfigResult, GatewayConfig, GatewayConfigBuilder},
    server,
};

#[derive(Parser, Debug)]
#[command(name = "inference-gateway")]
#[command(about = "OpenAI-compatible gateway over self-registered inference servers")]
#[command(long_about = r#"
Inference Gateway - routes OpenAI-style requests to healthy registered backends

Examples:
  # In-memory registry, admin API enabled
  inference-gateway --admin-api-key 0123456789abcdef0123

  # Durable registry, faster health checks
  inference-gateway --database-url postgres://gateway@db/gateway \
    --health-check-interval-seconds 15 --max-consecutive-failures 5
"#)]
struct CliArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Admin key (16+ chars). Admin routes are disabled without one.
    #[arg(long, env = "ADMIN_API_KEY", hide_env_values = true)]
    admin_api_key: Option<String>,

    #[arg(long, env = "MAX_REQUEST_BODY_SIZE", default_value_t = 1_048_576)]
    max_payload_size: usize,

    /// Refuse loopback, private and internal endpoints at registration
    #[arg(long, env = "BLOCK_PRIVATE_ENDPOINTS", default_value_t = false, action = ArgAction::Set)]
    block_private_endpoints: bool,

    #[arg(long, env = "INCLUDE_GATEWAY_SERVER_ID_HEADER", default_value_t = true, action = ArgAction::Set)]
    include_server_id_header: bool,

    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECONDS", default_value_t = 60)]
    health_check_interval_seconds: u64,

    #[arg(long, env = "HEALTH_CHECK_TIMEOUT_SECONDS", default_value_t = 10)]
    health_check_timeout_seconds: u64,

    #[arg(long, env = "MAX_CONSECUTIVE_FAILURES", default_value_t = 3)]
    max_consecutive_failures: u32,

    #[arg(long, env = "AUTO_DEREGISTER_AFTER_FAILURES", default_value_t = true, action = ArgAction::Set)]
    auto_deregister_after_failures: bool,

    #[arg(long, env = "MAX_CONCURRENT_HEALTH_PROBES", default_value_t = 16)]
    max_concurrent_probes: usize,

    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value_t = 300)]
    request_timeout_seconds: u64,

    #[arg(long, env = "MAX_RETRY_ATTEMPTS", default_value_t = 2)]
    max_retry_attempts: u32,

    #[arg(long, env = "ROUND_ROBIN_ENABLED", default_value_t = true, action = ArgAction::Set)]
    round_robin_enabled: bool,

    /// Postgres URL; the in-memory registry is used when absent
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_POOL_MAX", default_value_t = 16)]
    database_pool_max: usize,

    #[arg(long, env = "LOG_LEVEL", default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error", "TRACE", "DEBUG", "INFO", "WARN", "ERROR"])]
    log_level: String,

    #[arg(long, env = "LOG_DIR")]
    log_dir: Option<String>,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    #[arg(long, env = "PROMETHEUS_PORT")]
    prometheus_port: Option<u16>,

    #[arg(long, env = "PROMETHEUS_HOST", default_value = "0.0.0.0")]
    prometheus_host: String,
}

impl CliArgs {
    fn to_gateway_config(&self) -> ConfigResult<GatewayConfig> {
        let mut builder = GatewayConfigBuilder::new()
            .host(&self.host)
            .port(self.port)
            .maybe_admin_api_key(self.admin_api_key.clone())
            .max_payload_size(self.max_payload_size)
            .block_private_endpoints(self.block_private_endpoints)
            .include_server_id_header(self.include_server_id_header)
            .health_check_interval_secs(self.health_check_interval_seconds)
            .health_check_timeout_secs(self.health_check_timeout_seconds)
            .max_consecutive_failures(self.max_consecutive_failures)
            .auto_deregister(self.auto_deregister_after_failures)
            .max_concurrent_probes(self.max_concurrent_probes)
            .request_timeout_secs(self.request_timeout_seconds)
            .max_retry_attempts(self.max_retry_attempts)
            .round_robin(self.round_robin_enabled)
            .log_level(self.log_level.to_lowercase())
            .maybe_log_dir(self.log_dir.clone())
            .json_logs(self.log_json);

        if let Some(url) = &self.database_url {
            builder = builder.postgres_storage(url, self.database_pool_max);
        }
        if let Some(port) = self.prometheus_port {
            builder = builder.prometheus(&self.prometheus_host, port);
        }

        builder.build()
    }
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = args.to_gateway_config()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server::startup(config))
}
