//! Closed-loop CPU autoscaler for a container orchestrator swarm: binary
//! entry point. Parses CLI flags, validates them into a `Policy`, wires up
//! the metrics/orchestrator/provider clients, and hands off to `ControlLoop`.

mod config;
mod control_loop;
mod error;
mod metrics;
mod node_lifecycle;
mod orchestrator;
mod provider;
mod scaler;
mod types;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use config::Cli;
use control_loop::ControlLoop;
use metrics::PrometheusMetricsSource;
use orchestrator::SwarmOrchestrator;
use provider::build_provider;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("swarm_autopilot=info")),
            )
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("swarm_autopilot=info")),
            )
            .init();
    }

    let policy = match cli.into_policy() {
        Ok(policy) => policy,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let provider = if policy.node_scaling_enabled {
        let provider_name = cli
            .node_scale_provider
            .as_deref()
            .expect("into_policy guarantees a provider name when node scaling is enabled");
        match build_provider(provider_name, &cli.hetzner) {
            Ok(provider) => Some(provider),
            Err(e) => {
                error!("couldn't construct node scale provider: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        None
    };

    let metrics = match PrometheusMetricsSource::new(policy.metrics_url.clone()) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("couldn't construct metrics client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = SwarmOrchestrator::new(policy.docker_socket.clone());

    let control_loop = ControlLoop::new(
        &policy,
        &metrics,
        &orchestrator,
        provider.as_deref(),
    );

    if let Err(e) = control_loop.run().await {
        error!("swarm-autopilot exited with an error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
