//! Top-level control loop (§4.6): startup gates, the 60-second tick, and
//! graceful shutdown. Mirrors `start_pilot`/`handle_pilot` from the original:
//! ping the orchestrator then the metrics backend before the first tick,
//! and treat any unhandled per-tick panic as fatal to that tick rather than
//! the whole process — a restart loop replaces the original's recursive
//! `start_pilot()` call in its `finally` block.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::config::Policy;
use crate::metrics::MetricsSource;
use crate::node_lifecycle::NodeLifecycle;
use crate::orchestrator::Orchestrator;
use crate::provider::Provider;
use crate::scaler::ServiceScaler;

const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Wires a metrics source, an orchestrator, and an optional provider into
/// the per-tick scale decisions, under one shared policy.
pub struct ControlLoop<'a> {
    policy: &'a Policy,
    metrics: &'a (dyn MetricsSource + Send + Sync),
    orchestrator: &'a (dyn Orchestrator + Send + Sync),
    provider: Option<&'a (dyn Provider + Send + Sync)>,
}

impl<'a> ControlLoop<'a> {
    pub fn new(
        policy: &'a Policy,
        metrics: &'a (dyn MetricsSource + Send + Sync),
        orchestrator: &'a (dyn Orchestrator + Send + Sync),
        provider: Option<&'a (dyn Provider + Send + Sync)>,
    ) -> Self {
        Self {
            policy,
            metrics,
            orchestrator,
            provider,
        }
    }

    /// Runs `run_once` until a shutdown signal arrives. Returns once the
    /// process should exit.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("starting swarm-autopilot");
        info!("configured settings:");
        info!("node scaling enabled: {}", self.policy.node_scaling_enabled);
        info!("node min scale: {}", self.policy.node_min);
        info!("node max scale: {}", self.policy.node_max);
        info!("cpu scale up threshold: {:?}", self.policy.cpu_up);
        info!("cpu scale down threshold: {:?}", self.policy.cpu_down);
        info!("memory scale up threshold: {:?}", self.policy.mem_up);
        info!("memory scale down threshold: {:?}", self.policy.mem_down);

        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = self.run_once() => {
                    // run_once only returns when a startup gate failed or a
                    // tick panicked; fall through and restart from the top.
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down.");
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down.");
                    return Ok(());
                }
            }
        }
    }

    /// Startup gates followed by the tick loop. Returns when either gate
    /// fails or a tick panics, so `run`'s outer loop restarts it from the
    /// top — the Rust analogue of the original's recursive
    /// `start_pilot()` call from its `except`/`finally` block, which
    /// re-runs both ping gates on every restart rather than just once at
    /// process start.
    async fn run_once(&self) {
        if !self.orchestrator.ping().await {
            error!("couldn't connect to the orchestrator socket, restarting.");
            return;
        }

        if !self.metrics.ping().await {
            error!("couldn't connect to the metrics backend for 9 minutes, restarting.");
            return;
        }

        self.tick_loop().await;
    }

    /// Runs ticks until one panics, then returns so `run_once` can restart
    /// from the ping gates.
    async fn tick_loop(&self) {
        loop {
            let outcome = AssertUnwindSafe(self.tick()).catch_unwind().await;
            if let Err(panic) = outcome {
                error!("tick panicked, restarting control loop: {:?}", panic);
                return;
            }
        }
    }

    async fn tick(&self) {
        let Some(total_cpu_cores) = self.metrics.total_cpu_cores(self.policy.reserved_cpu_cores).await else {
            error!("couldn't fetch CPU cores count, waiting 10 seconds to check again.");
            tokio::time::sleep(RETRY_DELAY).await;
            return;
        };

        let Some((services, total_service_usage)) = self.metrics.services_cpu_usage().await else {
            error!("couldn't fetch usage, waiting 10 seconds to check again.");
            tokio::time::sleep(RETRY_DELAY).await;
            return;
        };

        let free_cpu_resources = total_cpu_cores - total_service_usage;

        let mem_usages = self
            .metrics
            .services_memory_usage()
            .await
            .map(|(usages, _)| usages)
            .unwrap_or_default();

        let scaler = ServiceScaler::new(self.policy, self.orchestrator);
        scaler.run_tick(&services, &mem_usages).await;

        if self.policy.node_scaling_enabled {
            if let Some(provider) = self.provider {
                let lifecycle = NodeLifecycle::new(
                    provider,
                    self.orchestrator,
                    self.policy.node_min,
                    self.policy.node_max,
                    self.policy.cpu_up.unwrap_or(1.0),
                    self.policy.cpu_down.unwrap_or(0.0),
                );
                lifecycle.run_tick(free_cpu_resources, total_cpu_cores).await;
            }
        }

        tokio::time::sleep(Duration::from_secs(self.policy.tick_interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::FakeMetricsSource;
    use crate::metrics::ServiceCpuUsage;
    use crate::orchestrator::tests::FakeOrchestrator;
    use crate::types::{ServiceMode, ServiceSpec};
    use std::collections::HashMap;

    fn policy() -> Policy {
        Policy {
            cpu_up: Some(0.8),
            cpu_down: Some(0.2),
            mem_up: None,
            mem_down: None,
            reserved_cpu_cores: 0.0,
            node_scaling_enabled: false,
            node_min: 0,
            node_max: 10,
            tick_interval_secs: 60,
            metrics_url: String::new(),
            docker_socket: String::new(),
            log_json: false,
        }
    }

    fn web_spec(replicas: u64) -> ServiceSpec {
        let mut labels = HashMap::new();
        labels.insert("autopilot.enabled".to_string(), "true".to_string());
        labels.insert("autopilot.scale_min".to_string(), "1".to_string());
        labels.insert("autopilot.scale_max".to_string(), "5".to_string());
        ServiceSpec {
            id: "web-id".to_string(),
            name: "web".to_string(),
            version: 1,
            mode: ServiceMode::Replicated,
            replicas: Some(replicas),
            cpu_limit_cores: Some(1.0),
            memory_limit_mib: None,
            labels,
            task_template: serde_json::json!({}),
            update_config: serde_json::json!({}),
            rollback_config: serde_json::json!({}),
            endpoint_spec: serde_json::json!({}),
        }
    }

    /// A missing `total_cpu_cores` reading must not reach the scaler: the
    /// tick sleeps 10s and returns without calling `services_cpu_usage` or
    /// touching the orchestrator.
    #[tokio::test(start_paused = true)]
    async fn retries_tick_head_when_total_cpu_cores_missing() {
        let metrics = FakeMetricsSource::new().with_total_cpu_cores(vec![None]);
        let orchestrator = FakeOrchestrator::with_services(vec![web_spec(2)]);
        let policy = policy();
        let control_loop = ControlLoop::new(&policy, &metrics, &orchestrator, None);

        let tick = control_loop.tick();
        tokio::time::timeout(Duration::from_secs(30), tick)
            .await
            .expect("tick should return after the 10s retry sleep, not hang");

        assert!(orchestrator.scale_calls().is_empty());
    }

    /// Once both metrics reads succeed, the tick runs the scaler cascade and
    /// sleeps for the configured tick interval.
    #[tokio::test(start_paused = true)]
    async fn completes_tick_and_scales_when_metrics_available() {
        let metrics = FakeMetricsSource::new()
            .with_total_cpu_cores(vec![Some(16.0)])
            .with_services_cpu_usage(vec![Some((
                vec![ServiceCpuUsage { name: "web".into(), cpu_usage: 1.8 }],
                1.8,
            ))]);
        let orchestrator = FakeOrchestrator::with_services(vec![web_spec(2)]);
        let policy = policy();
        let control_loop = ControlLoop::new(&policy, &metrics, &orchestrator, None);

        let tick = control_loop.tick();
        tokio::time::timeout(Duration::from_secs(90), tick)
            .await
            .expect("tick should complete within the tick interval");

        assert_eq!(orchestrator.scale_calls(), vec![("web".to_string(), 3)]);
    }

    /// A transient `None` followed by a successful read resumes the tick
    /// head: `total_cpu_cores` is called again rather than the loop giving
    /// up, matching "sleep 10s and retry the tick head".
    #[tokio::test(start_paused = true)]
    async fn recovers_on_next_attempt_after_transient_metrics_failure() {
        let metrics = FakeMetricsSource::new().with_total_cpu_cores(vec![None, Some(16.0)]);
        let orchestrator = FakeOrchestrator::with_services(vec![]);
        let policy = policy();
        let control_loop = ControlLoop::new(&policy, &metrics, &orchestrator, None);

        tokio::time::timeout(Duration::from_secs(30), control_loop.tick())
            .await
            .unwrap();
        assert_eq!(metrics.total_cpu_cores_call_count(), 1);

        tokio::time::timeout(Duration::from_secs(90), control_loop.tick())
            .await
            .unwrap();
        assert_eq!(metrics.total_cpu_cores_call_count(), 2);
    }
}
