//! Command-line parsing and validation.
//!
//! `Cli` mirrors the flags the distilled Python CLI accepted one-for-one,
//! plus the ambient flags a real binary needs (tick cadence, metrics URL,
//! orchestrator socket path, log format) that the original hardcoded.
//! [`Cli::into_policy`] performs the same pairing/required-field validation
//! the Python `main()` did, but as a single typed pass instead of a chain of
//! `raise ValueError`s.

use clap::{Args, Parser};

use crate::error::ConfigError;

/// Process-wide, immutable once parsed. Consumed by `ServiceScaler` and
/// `NodeLifecycle`.
#[derive(Debug, Clone)]
pub struct Policy {
    pub cpu_up: Option<f64>,
    pub cpu_down: Option<f64>,
    pub mem_up: Option<f64>,
    pub mem_down: Option<f64>,
    pub reserved_cpu_cores: f64,

    pub node_scaling_enabled: bool,
    pub node_min: u64,
    pub node_max: u64,

    pub tick_interval_secs: u64,
    pub metrics_url: String,
    pub docker_socket: String,
    pub log_json: bool,
}

/// Raw CLI surface, parsed by `clap` before validation into [`Policy`].
#[derive(Debug, Parser)]
#[command(name = "swarm-autopilot", about = "Closed-loop CPU autoscaler for a container orchestrator swarm")]
pub struct Cli {
    #[arg(long, default_value_t = false)]
    pub node_scale_enabled: bool,

    #[arg(long)]
    pub node_scale_provider: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub node_scale_min_scale: u64,

    #[arg(long, default_value_t = 10)]
    pub node_scale_max_scale: u64,

    #[arg(long)]
    pub cpu_scale_up_threshold: Option<f64>,

    #[arg(long)]
    pub cpu_scale_down_threshold: Option<f64>,

    #[arg(long)]
    pub memory_scale_up_threshold: Option<f64>,

    #[arg(long)]
    pub memory_scale_down_threshold: Option<f64>,

    #[arg(long, default_value_t = 0.0)]
    pub reserved_cpu_cores: f64,

    /// Exposed for testability; the original hardcoded this to 60 seconds.
    #[arg(long, default_value_t = 60)]
    pub tick_interval_secs: u64,

    #[arg(long, default_value = "http://prometheus:9090")]
    pub metrics_url: String,

    #[arg(long, default_value = "/var/run/docker.sock")]
    pub docker_socket: String,

    #[arg(long, default_value_t = false)]
    pub log_json: bool,

    #[command(flatten)]
    pub hetzner: HetznerArgs,
}

/// Provider-specific flags for the Hetzner Cloud provider. Only consumed
/// when `--node_scale_provider hetzner` is selected.
#[derive(Debug, Args, Clone)]
pub struct HetznerArgs {
    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long, default_value = "node-autopilot-")]
    pub node_prefix: String,

    #[arg(long, default_value = "autopilot")]
    pub node_label: String,

    #[arg(long, default_value = "")]
    pub node_user_data: String,

    #[arg(long, default_value = "")]
    pub node_networks: String,

    #[arg(long, default_value = "")]
    pub node_firewalls: String,

    #[arg(long)]
    pub node_image: Option<String>,

    #[arg(long)]
    pub node_type: Option<String>,

    #[arg(long)]
    pub node_location: Option<String>,

    #[arg(long, default_value = "")]
    pub node_ssh_keys: String,
}

impl Cli {
    /// Validates the paired-threshold and provider-required invariants,
    /// producing an immutable [`Policy`]. Does not construct the provider
    /// itself — that is [`crate::provider::build_provider`]'s job, since it
    /// needs the full `HetznerArgs` too.
    pub fn into_policy(&self) -> Result<Policy, ConfigError> {
        let cpu_paired = self.cpu_scale_up_threshold.is_some() == self.cpu_scale_down_threshold.is_some();
        if !cpu_paired {
            return Err(ConfigError::UnpairedCpuThresholds);
        }

        let mem_paired =
            self.memory_scale_up_threshold.is_some() == self.memory_scale_down_threshold.is_some();
        if !mem_paired {
            return Err(ConfigError::UnpairedMemoryThresholds);
        }

        if self.cpu_scale_up_threshold.is_none() && self.memory_scale_up_threshold.is_none() {
            return Err(ConfigError::NoScalingDimension);
        }

        if self.node_scale_enabled && self.node_scale_provider.is_none() {
            return Err(ConfigError::MissingProvider);
        }

        Ok(Policy {
            cpu_up: self.cpu_scale_up_threshold,
            cpu_down: self.cpu_scale_down_threshold,
            mem_up: self.memory_scale_up_threshold,
            mem_down: self.memory_scale_down_threshold,
            reserved_cpu_cores: self.reserved_cpu_cores,
            node_scaling_enabled: self.node_scale_enabled,
            node_min: self.node_scale_min_scale,
            node_max: self.node_scale_max_scale,
            tick_interval_secs: self.tick_interval_secs,
            metrics_url: self.metrics_url.clone(),
            docker_socket: self.docker_socket.clone(),
            log_json: self.log_json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            node_scale_enabled: false,
            node_scale_provider: None,
            node_scale_min_scale: 0,
            node_scale_max_scale: 10,
            cpu_scale_up_threshold: Some(0.8),
            cpu_scale_down_threshold: Some(0.2),
            memory_scale_up_threshold: None,
            memory_scale_down_threshold: None,
            reserved_cpu_cores: 0.0,
            tick_interval_secs: 60,
            metrics_url: "http://prometheus:9090".into(),
            docker_socket: "/var/run/docker.sock".into(),
            log_json: false,
            hetzner: HetznerArgs {
                api_key: None,
                node_prefix: "node-autopilot-".into(),
                node_label: "autopilot".into(),
                node_user_data: "".into(),
                node_networks: "".into(),
                node_firewalls: "".into(),
                node_image: None,
                node_type: None,
                node_location: None,
                node_ssh_keys: "".into(),
            },
        }
    }

    #[test]
    fn accepts_paired_cpu_thresholds() {
        assert!(base_cli().into_policy().is_ok());
    }

    #[test]
    fn rejects_unpaired_cpu_thresholds() {
        let mut cli = base_cli();
        cli.cpu_scale_down_threshold = None;
        assert!(matches!(
            cli.into_policy(),
            Err(ConfigError::UnpairedCpuThresholds)
        ));
    }

    #[test]
    fn rejects_unpaired_memory_thresholds() {
        let mut cli = base_cli();
        cli.memory_scale_up_threshold = Some(0.9);
        assert!(matches!(
            cli.into_policy(),
            Err(ConfigError::UnpairedMemoryThresholds)
        ));
    }

    #[test]
    fn rejects_no_scaling_dimension() {
        let mut cli = base_cli();
        cli.cpu_scale_up_threshold = None;
        cli.cpu_scale_down_threshold = None;
        assert!(matches!(
            cli.into_policy(),
            Err(ConfigError::NoScalingDimension)
        ));
    }

    #[test]
    fn rejects_node_scaling_without_provider() {
        let mut cli = base_cli();
        cli.node_scale_enabled = true;
        assert!(matches!(cli.into_policy(), Err(ConfigError::MissingProvider)));
    }

    #[test]
    fn accepts_memory_only_dimension() {
        let mut cli = base_cli();
        cli.cpu_scale_up_threshold = None;
        cli.cpu_scale_down_threshold = None;
        cli.memory_scale_up_threshold = Some(0.8);
        cli.memory_scale_down_threshold = Some(0.2);
        assert!(cli.into_policy().is_ok());
    }
}
