//! Per-service replica decisions (§4.4): maps observed CPU (or, dormantly,
//! memory) load to a single replica-count transition per tick, under the
//! per-service `autopilot.*` labels.

use tracing::{debug, error, info};

use crate::config::Policy;
use crate::metrics::ServiceCpuUsage;
use crate::orchestrator::Orchestrator;
use crate::types::{ServiceMode, ServiceSpec};

/// Outcome of evaluating the scaling cascade against a load factor. Mirrors
/// the branch table in §4.4 exactly, first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeDecision {
    /// Above the up-threshold but already at `scale_max`.
    ClampedAtMax,
    ScaleUp(u64),
    /// Below the down-threshold but already at `scale_min`.
    ClampedAtMin,
    ScaleDown(u64),
    /// Below `scale_min` outside the threshold cascade; jump straight to it.
    ClampToMin(u64),
    /// Above `scale_max` outside the threshold cascade; jump straight to it.
    ClampToMax(u64),
    NoOp,
}

/// Pure decision function, the first-match cascade from §4.4, table form.
pub fn decide_cascade(
    load: f64,
    replicas: u64,
    up: f64,
    down: f64,
    scale_min: u64,
    scale_max: u64,
) -> CascadeDecision {
    if load > up {
        if replicas >= scale_max {
            return CascadeDecision::ClampedAtMax;
        }
        return CascadeDecision::ScaleUp(replicas + 1);
    }
    if load < down {
        if replicas <= scale_min {
            return CascadeDecision::ClampedAtMin;
        }
        return CascadeDecision::ScaleDown(replicas - 1);
    }
    if replicas < scale_min {
        return CascadeDecision::ClampToMin(scale_min);
    }
    if replicas > scale_max {
        return CascadeDecision::ClampToMax(scale_max);
    }
    CascadeDecision::NoOp
}

/// Drives the cascade across the services the metrics backend reported
/// usage for this tick, in iteration order.
pub struct ServiceScaler<'a> {
    policy: &'a Policy,
    orchestrator: &'a (dyn Orchestrator + Send + Sync),
}

impl<'a> ServiceScaler<'a> {
    pub fn new(policy: &'a Policy, orchestrator: &'a (dyn Orchestrator + Send + Sync)) -> Self {
        Self { policy, orchestrator }
    }

    /// Evaluates every service the metrics query surfaced usage for. Any
    /// per-service failure is logged and the service skipped; it never
    /// aborts the rest of the batch.
    pub async fn run_tick(
        &self,
        cpu_usages: &[ServiceCpuUsage],
        mem_usages: &[ServiceCpuUsage],
    ) {
        for usage in cpu_usages {
            self.evaluate_service(&usage.name, Some(usage.cpu_usage), mem_usages).await;
        }
    }

    async fn evaluate_service(
        &self,
        service_name: &str,
        cpu_usage_cores: Option<f64>,
        mem_usages: &[ServiceCpuUsage],
    ) {
        let Some(spec) = self.orchestrator.get_service(service_name).await else {
            debug!("couldn't find service: {}, skipping.", service_name);
            return;
        };

        if !spec.autopilot_enabled() {
            debug!("service hasn't enabled autopilot: {}, skipping.", service_name);
            return;
        }

        let Some(scale_min) = spec.scale_min() else {
            error!(
                "service has enabled autopilot: {}, but hasn't set autopilot.scale_min.",
                service_name
            );
            return;
        };

        if spec.cpu_limit_cores.is_none() && spec.memory_limit_mib.is_none() {
            error!(
                "couldn't find configured limits on service: {}, limits must be configured.",
                service_name
            );
            return;
        }

        if spec.mode != ServiceMode::Replicated {
            error!(
                "couldn't find Replicated defined on service: {}, Replicated is the only type supported.",
                service_name
            );
            return;
        }

        let Some(replicas) = spec.replicas else {
            error!("service {} is Replicated but reported no replica count.", service_name);
            return;
        };
        if replicas == 0 {
            error!(
                "replicas is set to 0 on service: {}, must be a positive number and not zero.",
                service_name
            );
            return;
        }

        let scale_max = spec.scale_max();

        if let Some(cpu_limit) = spec.cpu_limit_cores {
            let (Some(up), Some(down)) = (self.policy.cpu_up, self.policy.cpu_down) else {
                return;
            };
            let Some(usage) = cpu_usage_cores else {
                return;
            };
            let load = usage / (cpu_limit * replicas as f64);
            self.apply_decision(&spec, service_name, replicas, scale_min, scale_max, load, up, down)
                .await;
            return;
        }

        if let Some(mem_limit) = spec.memory_limit_mib {
            let (Some(up), Some(down)) = (self.policy.mem_up, self.policy.mem_down) else {
                return;
            };
            let Some(usage) = mem_usages
                .iter()
                .find(|u| u.name == service_name)
                .map(|u| u.cpu_usage)
            else {
                return;
            };
            let load = usage / (mem_limit * replicas as f64);
            self.apply_decision(&spec, service_name, replicas, scale_min, scale_max, load, up, down)
                .await;
        }
    }

    async fn apply_decision(
        &self,
        spec: &ServiceSpec,
        service_name: &str,
        replicas: u64,
        scale_min: u64,
        scale_max: u64,
        load: f64,
        up: f64,
        down: f64,
    ) {
        match decide_cascade(load, replicas, up, down, scale_min, scale_max) {
            CascadeDecision::ClampedAtMax => {
                info!(
                    "couldn't scale service: {} more up, replicas is at max setting, current replicas: {}.",
                    service_name, replicas
                );
            }
            CascadeDecision::ScaleUp(target) => {
                info!("scaling service: {} up, too little free resources.", service_name);
                self.orchestrator.scale(spec, target).await;
            }
            CascadeDecision::ClampedAtMin => {
                debug!(
                    "couldn't scale service: {} more down, replicas is at min setting, current replicas: {}.",
                    service_name, replicas
                );
            }
            CascadeDecision::ScaleDown(target) => {
                info!("scaling service: {} down, too many free resources.", service_name);
                self.orchestrator.scale(spec, target).await;
            }
            CascadeDecision::ClampToMin(target) => {
                info!("scaling service: {} up, is under min ({}) replicas.", service_name, target);
                self.orchestrator.scale(spec, target).await;
            }
            CascadeDecision::ClampToMax(target) => {
                info!("scaling service: {} down, is over max ({}) replicas.", service_name, target);
                self.orchestrator.scale(spec, target).await;
            }
            CascadeDecision::NoOp => {
                debug!("no scale is needed for service: {}.", service_name);
            }
        }
    }
}
