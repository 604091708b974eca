//! Per-component error enums (`thiserror`), glued together by `anyhow::Result`
//! at call sites that only need to log and move on rather than match on a
//! variant. Mirrors the layering the rest of the corpus uses: one `Error`
//! enum per subsystem, each convertible into the caller's error type.

use thiserror::Error;

/// Failures surfaced by [`crate::metrics::MetricsSource`] implementations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics backend returned non-success status: {0}")]
    NonSuccessStatus(String),

    #[error("metrics backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("metrics backend response could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Failures surfaced by [`crate::orchestrator::Orchestrator`] implementations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Request(#[from] hyper::Error),

    #[error("orchestrator returned status {status} for {endpoint}: {body}")]
    NonSuccessStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("orchestrator response could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("optimistic concurrency conflict updating {kind} {id} at version {version}")]
    StaleVersion {
        kind: &'static str,
        id: String,
        version: u64,
    },
}

/// Failures surfaced by [`crate::provider::Provider`] implementations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned status {status} for {operation}: {body}")]
    NonSuccessStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("provider response could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("provider returned an unparseable node timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

/// Configuration errors raised while validating CLI flags into a [`crate::config::Policy`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--cpu_scale_up_threshold and --cpu_scale_down_threshold must be provided together")]
    UnpairedCpuThresholds,

    #[error("--memory_scale_up_threshold and --memory_scale_down_threshold must be provided together")]
    UnpairedMemoryThresholds,

    #[error("at least one of CPU or memory scaling thresholds must be provided")]
    NoScalingDimension,

    #[error("--node_scale_provider is required when --node_scale_enabled is set")]
    MissingProvider,

    #[error("unknown node scale provider '{0}'")]
    UnknownProvider(String),

    #[error("--api_key is required for the hetzner provider")]
    MissingApiKey,

    #[error("--node_image is required for the hetzner provider")]
    MissingNodeImage,

    #[error("--node_type is required for the hetzner provider")]
    MissingNodeType,

    #[error("--node_location is required for the hetzner provider")]
    MissingNodeLocation,

    #[error("--node_user_data could not be base64-decoded: {0}")]
    InvalidUserData(#[source] base64::DecodeError),
}
