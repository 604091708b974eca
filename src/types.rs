//! Shared read-model types consumed by the scaling and node-lifecycle logic.
//!
//! Everything here is a plain snapshot re-fetched every tick; nothing is
//! cached across calls (see §5 of the design notes). The only durable state
//! the autoscaler owns lives in [`ProviderNode::labels`] on the provider side.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// The replication mode of an orchestrator service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Replicated,
    Global,
}

/// A service as observed from the orchestrator, with autopilot settings
/// already derived from its label map.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub mode: ServiceMode,
    /// Only meaningful when `mode == Replicated`.
    pub replicas: Option<u64>,
    pub cpu_limit_cores: Option<f64>,
    pub memory_limit_mib: Option<f64>,
    pub labels: HashMap<String, String>,

    /// Opaque fields preserved verbatim across a scale update.
    pub task_template: serde_json::Value,
    pub update_config: serde_json::Value,
    pub rollback_config: serde_json::Value,
    pub endpoint_spec: serde_json::Value,
}

impl ServiceSpec {
    /// Derived from the `autopilot.enabled` label: `"true"` enables, any
    /// other value (including absence) disables.
    pub fn autopilot_enabled(&self) -> bool {
        self.labels
            .get("autopilot.enabled")
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Derived from `autopilot.scale_min`; `None` (absent or `"0"`) means
    /// the service is misconfigured for autoscaling.
    pub fn scale_min(&self) -> Option<u64> {
        match self.labels.get("autopilot.scale_min") {
            Some(raw) if raw != "0" => raw.parse().ok(),
            _ => None,
        }
    }

    /// Derived from `autopilot.scale_max`, defaulting to the original's
    /// effectively-unbounded sentinel.
    pub fn scale_max(&self) -> u64 {
        self.labels
            .get("autopilot.scale_max")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(10_000_000)
    }
}

/// A node as observed from the orchestrator (hostname is the join key to
/// [`ProviderNode::name`]).
#[derive(Debug, Clone)]
pub struct OrchestratorNode {
    pub id: String,
    pub version: u64,
    pub hostname: String,
    pub role: String,
}

/// Externalized phase of the node lifecycle state machine, stored as the
/// `Status` provider label so it survives process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Creating,
    Running,
    Draining,
}

impl NodeStatus {
    pub fn as_label_value(self) -> &'static str {
        match self {
            NodeStatus::Creating => "Creating",
            NodeStatus::Running => "Running",
            NodeStatus::Draining => "Draining",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Creating" => Some(NodeStatus::Creating),
            "Running" => Some(NodeStatus::Running),
            "Draining" => Some(NodeStatus::Draining),
            _ => None,
        }
    }
}

/// A node as observed from the cloud provider.
#[derive(Debug, Clone)]
pub struct ProviderNode {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

impl ProviderNode {
    pub fn status(&self) -> Option<NodeStatus> {
        self.labels.get("Status").and_then(|s| NodeStatus::parse(s))
    }
}
