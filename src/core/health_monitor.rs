//! Background loop that probes every active server on a fixed interval.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use super::health::HealthProber;
use crate::{
    config::HealthCheckConfig,
    data_connector::{RegistryResult, RegistryStorage, ServerRecord},
    observability::metrics::GatewayMetrics,
};

/// Delay before retrying after a cycle could not run at all.
const CYCLE_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// How long `stop` waits for the loop to exit before aborting it.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthCycleStats {
    pub total_checked: usize,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub deregistered_count: usize,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub auto_deregister: bool,
}

enum ProbeOutcome {
    Healthy,
    Unhealthy,
    Deregistered,
}

/// One pass over the registry. Cheap to clone into the background task.
#[derive(Clone)]
struct HealthCycle {
    registry: Arc<dyn RegistryStorage>,
    prober: HealthProber,
    config: HealthCheckConfig,
}

impl HealthCycle {
    async fn run(&self) -> RegistryResult<HealthCycleStats> {
        let start = Instant::now();
        let servers = self.registry.list_active_servers().await?;
        let total_checked = servers.len();
        let timeout = self.config.timeout();

        let outcomes: Vec<ProbeOutcome> = stream::iter(servers)
            .map(|server| self.check_server(server, timeout))
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .collect()
            .await;

        let mut stats = HealthCycleStats {
            total_checked,
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                ProbeOutcome::Healthy => stats.healthy_count += 1,
                ProbeOutcome::Unhealthy => stats.unhealthy_count += 1,
                ProbeOutcome::Deregistered => {
                    stats.unhealthy_count += 1;
                    stats.deregistered_count += 1;
                }
            }
        }

        let elapsed = start.elapsed();
        stats.duration_seconds = elapsed.as_secs_f64();
        GatewayMetrics::record_health_cycle(elapsed, stats.healthy_count);

        info!(
            total = stats.total_checked,
            healthy = stats.healthy_count,
            unhealthy = stats.unhealthy_count,
            deregistered = stats.deregistered_count,
            duration_ms = elapsed.as_millis() as u64,
            "Health check cycle completed"
        );
        Ok(stats)
    }

    async fn check_server(&self, server: ServerRecord, timeout: Duration) -> ProbeOutcome {
        let result = self.prober.probe_server(&server, timeout).await;

        let updated = match self
            .registry
            .record_health_result(server.id, result.is_healthy, result.error_message.as_deref())
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(
                    server_id = %server.id,
                    registration_id = %server.registration_id,
                    error = %e,
                    "Failed to record health result"
                );
                return if result.is_healthy {
                    ProbeOutcome::Healthy
                } else {
                    ProbeOutcome::Unhealthy
                };
            }
        };

        if result.is_healthy {
            return ProbeOutcome::Healthy;
        }

        warn!(
            server_id = %updated.id,
            registration_id = %updated.registration_id,
            model = %updated.model_name,
            failures = updated.consecutive_failures,
            error = result.error_message.as_deref().unwrap_or("unknown"),
            "Health check failed"
        );

        if !self.config.auto_deregister
            || updated.consecutive_failures < self.config.max_consecutive_failures
        {
            return ProbeOutcome::Unhealthy;
        }

        match self.registry.deregister_server(&updated.registration_id).await {
            Ok(true) => {
                warn!(
                    registration_id = %updated.registration_id,
                    model = %updated.model_name,
                    failures = updated.consecutive_failures,
                    "Auto-deregistered server after consecutive health check failures"
                );
                GatewayMetrics::record_deregistration("failures");
                ProbeOutcome::Deregistered
            }
            Ok(false) => ProbeOutcome::Unhealthy,
            Err(e) => {
                error!(
                    registration_id = %updated.registration_id,
                    error = %e,
                    "Failed to auto-deregister server"
                );
                ProbeOutcome::Unhealthy
            }
        }
    }
}

struct MonitorTask {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns the background health check task.
///
/// `start` is idempotent. `stop` signals the loop and waits a bounded grace
/// period before aborting it.
pub struct HealthMonitor {
    cycle: HealthCycle,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<dyn RegistryStorage>,
        prober: HealthProber,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            cycle: HealthCycle {
                registry,
                prober,
                config,
            },
            task: Mutex::new(None),
        }
    }

    /// Runs one cycle immediately, independent of the background loop.
    pub async fn run_health_check_cycle(&self) -> RegistryResult<HealthCycleStats> {
        self.cycle.run().await
    }

    /// Spawns the loop on the current runtime. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.join.is_finished()) {
            warn!("Health monitor is already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(self.cycle.clone(), shutdown_rx));
        *task = Some(MonitorTask { shutdown_tx, join });

        info!(
            interval_secs = self.cycle.config.interval().as_secs(),
            timeout_secs = self.cycle.config.timeout_secs,
            max_failures = self.cycle.config.max_consecutive_failures,
            auto_deregister = self.cycle.config.auto_deregister,
            "Health monitor started"
        );
        true
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            debug!("Health monitor is not running");
            return;
        };

        let _ = task.shutdown_tx.send(true);
        let mut join = task.join;
        match tokio::time::timeout(STOP_GRACE_PERIOD, &mut join).await {
            Ok(_) => info!("Health monitor stopped"),
            Err(_) => {
                warn!(
                    grace_secs = STOP_GRACE_PERIOD.as_secs(),
                    "Health monitor did not stop within timeout, aborting task"
                );
                join.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.join.is_finished())
    }

    pub fn status(&self) -> MonitorStatus {
        let config = &self.cycle.config;
        MonitorStatus {
            running: self.is_running(),
            check_interval_secs: config.interval().as_secs(),
            timeout_secs: config.timeout_secs,
            max_consecutive_failures: config.max_consecutive_failures,
            auto_deregister: config.auto_deregister,
        }
    }
}

async fn run_loop(cycle: HealthCycle, mut shutdown: watch::Receiver<bool>) {
    let interval = cycle.config.interval();
    loop {
        let delay = tokio::select! {
            _ = shutdown.changed() => break,
            result = cycle.run() => match result {
                Ok(_) => interval,
                Err(e) => {
                    error!(error = %e, "Health check cycle failed");
                    CYCLE_ERROR_BACKOFF
                }
            },
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(delay) => {}
        }
    }
    debug!("Health monitor loop exited");
}
