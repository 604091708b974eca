//! Metrics backend client.
//!
//! Query shapes mirror the original Prometheus queries byte for byte:
//! `sum(machine_cpu_cores)` for cluster capacity and
//! `sum(rate(container_cpu_usage_seconds_total{container_label_com_docker_swarm_task_name=~'.+'}[5m]))BY(container_label_com_docker_swarm_service_name)`
//! for per-service usage.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::MetricsError;

const TOTAL_CPU_QUERY: &str = "sum(machine_cpu_cores)";
const SERVICE_CPU_QUERY: &str = "sum(rate(container_cpu_usage_seconds_total{container_label_com_docker_swarm_task_name=~'.+'}[5m]))BY(container_label_com_docker_swarm_service_name)";
const SERVICE_LABEL: &str = "container_label_com_docker_swarm_service_name";

/// One entry of a per-service CPU usage sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCpuUsage {
    pub name: String,
    pub cpu_usage: f64,
}

/// Read-only access to cluster capacity and per-service usage. Implementors
/// must not retry beyond what is specified below — a failed tick yields
/// `None`/`false` and the control loop decides whether to retry.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// `sum(machine_cpu_cores) - reserved`, or `None` on a non-success
    /// response or an empty result set.
    async fn total_cpu_cores(&self, reserved: f64) -> Option<f64>;

    /// Per-service CPU usage (a 5-minute rate, in cores) plus the scalar sum
    /// across the returned set, or `None` on failure.
    async fn services_cpu_usage(&self) -> Option<(Vec<ServiceCpuUsage>, f64)>;

    /// Per-service memory usage (MiB), symmetric with `services_cpu_usage`
    /// for the memory cascade in `ServiceScaler`. No shipped backend query
    /// populates this today — see DESIGN.md — so the default returns `None`,
    /// which keeps the memory branch reachable in code but dormant in
    /// practice until a concrete query is wired up.
    async fn services_memory_usage(&self) -> Option<(Vec<ServiceCpuUsage>, f64)> {
        None
    }

    /// Startup gate: succeeds if the backend reports config status
    /// `"success"` within 9 attempts spaced 60s apart (~9 minutes total).
    async fn ping(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    status: String,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

#[derive(Debug, Deserialize)]
struct ConfigStatusEnvelope {
    status: String,
}

fn parse_query_envelope(body: &str) -> Result<QueryEnvelope, MetricsError> {
    serde_json::from_str(body).map_err(MetricsError::Decode)
}

fn parse_config_status(body: &str) -> Result<ConfigStatusEnvelope, MetricsError> {
    serde_json::from_str(body).map_err(MetricsError::Decode)
}

/// Concrete `MetricsSource` backed by a Prometheus-compatible HTTP API.
pub struct PrometheusMetricsSource {
    base_url: String,
    client: reqwest::Client,
}

impl PrometheusMetricsSource {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base_url, client })
    }

    async fn query(&self, query: &str) -> Result<QueryEnvelope, MetricsError> {
        let url = format!(
            "{}/api/v1/query?query={}",
            self.base_url,
            urlencoding::encode(query)
        );
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MetricsError::NonSuccessStatus(format!(
                "HTTP {} querying {}",
                status, query
            )));
        }
        parse_query_envelope(&body)
    }
}

#[async_trait]
impl MetricsSource for PrometheusMetricsSource {
    async fn total_cpu_cores(&self, reserved: f64) -> Option<f64> {
        let envelope = match self.query(TOTAL_CPU_QUERY).await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("failed to query total_cpu_cores: {}", e);
                return None;
            }
        };

        if envelope.status != "success" {
            error!("metrics backend reported non-success status for total_cpu_cores");
            return None;
        }

        let sample = envelope.data.result.first()?;
        let value: f64 = sample.value.1.parse().ok()?;
        Some(value - reserved)
    }

    async fn services_cpu_usage(&self) -> Option<(Vec<ServiceCpuUsage>, f64)> {
        let envelope = match self.query(SERVICE_CPU_QUERY).await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("failed to query services_cpu_usage: {}", e);
                return None;
            }
        };

        if envelope.status != "success" {
            error!("metrics backend reported non-success status for services_cpu_usage");
            return None;
        }

        let mut total = 0.0;
        let mut services = Vec::with_capacity(envelope.data.result.len());
        for result in envelope.data.result {
            let Some(name) = result.metric.get(SERVICE_LABEL).cloned() else {
                warn!("metrics result missing service name label, skipping");
                continue;
            };
            let Ok(cpu_usage) = result.value.1.parse::<f64>() else {
                warn!("metrics result for service {} had a non-numeric value, skipping", name);
                continue;
            };
            total += cpu_usage;
            services.push(ServiceCpuUsage { name, cpu_usage });
        }

        Some((services, total))
    }

    async fn ping(&self) -> bool {
        for attempt in 1..=9 {
            let url = format!("{}/api/v1/status/config", self.base_url);
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    if let Ok(status) = parse_config_status(&body) {
                        if status.status == "success" {
                            return true;
                        }
                    }
                }
                Ok(response) => {
                    debug!("metrics ping attempt {} got status {}", attempt, response.status());
                }
                Err(e) => {
                    debug!("metrics ping attempt {} failed: {}", attempt, e);
                }
            }
            if attempt < 9 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
        false
    }
}
