//! Node lifecycle state machine (§4.5): create → warm-up → drain → remove.
//!
//! The only durable state is the `Status` label on the provider node
//! (`Creating` / `Running` / `Draining`); everything else is re-derived from
//! a fresh `list_nodes()`/`get_node()` snapshot each tick, so a restart picks
//! up exactly where the process left off.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;
use crate::provider::Provider;
use crate::types::{NodeStatus, ProviderNode};

const GRACE_WINDOW_MINUTES: i64 = 15;
const ORPHAN_WINDOW_HOURS: i64 = 1;

/// Drives node scale-up/scale-down and warm-up reconciliation against a
/// provider and the orchestrator, once per tick.
pub struct NodeLifecycle<'a> {
    provider: &'a (dyn Provider + Send + Sync),
    orchestrator: &'a (dyn Orchestrator + Send + Sync),
    node_min: u64,
    node_max: u64,
    cpu_up: f64,
    cpu_down: f64,
}

impl<'a> NodeLifecycle<'a> {
    pub fn new(
        provider: &'a (dyn Provider + Send + Sync),
        orchestrator: &'a (dyn Orchestrator + Send + Sync),
        node_min: u64,
        node_max: u64,
        cpu_up: f64,
        cpu_down: f64,
    ) -> Self {
        Self {
            provider,
            orchestrator,
            node_min,
            node_max,
            cpu_up,
            cpu_down,
        }
    }

    /// Runs the scale-up/scale-down decision, then the warm-up reconciliation
    /// scan, against a freshly fetched node list. Mirrors `handle_pilot`'s
    /// per-tick node block: `check_node_cpu_resources` first, then the
    /// Creating-node sweep, both against the same snapshot.
    pub async fn run_tick(&self, free_cpu_resources: f64, total_cpu_cores: f64) {
        let nodes = match self.provider.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("couldn't list provider nodes: {}", e);
                return;
            }
        };

        self.check_node_cpu_resources(free_cpu_resources, total_cpu_cores, &nodes).await;

        if !nodes.is_empty() {
            debug!("checking if new nodes has joined the swarm.");
            for node in &nodes {
                self.reconcile_warmup(node).await;
            }
        }
    }

    /// Scale-up if free capacity is below threshold or the fleet is under
    /// `node_min`; otherwise, if there's slack, look for exactly one node to
    /// start draining. Matches `check_node_cpu_resources` — first node past
    /// the grace window wins and the loop stops (`break` in the original).
    async fn check_node_cpu_resources(
        &self,
        free_cpu_resources: f64,
        total_cpu_cores: f64,
        nodes: &[ProviderNode],
    ) {
        let free_ratio = free_cpu_resources / total_cpu_cores;
        let node_count = nodes.len() as u64;

        if free_ratio < self.cpu_up || node_count < self.node_min {
            info!("swarm is too low on CPU resources, adding new node.");
            if node_count < self.node_min {
                for _ in 0..(self.node_min - node_count) {
                    match self.provider.create_node().await {
                        Ok(node) => info!("new node is being created: {}", node.name),
                        Err(e) => error!("failed to create new node: {}", e),
                    }
                }
            } else {
                match self.provider.create_node().await {
                    Ok(node) => info!("new node is being created: {}", node.name),
                    Err(e) => error!("failed to create new node: {}", e),
                }
            }
            return;
        }

        let over_capacity = free_ratio > self.cpu_down || (nodes.len() as u64) > self.node_max;
        if over_capacity && !nodes.is_empty() {
            info!("swarm has too many free CPU resources, looking for node to remove.");
            let grace_cutoff = Utc::now() - ChronoDuration::minutes(GRACE_WINDOW_MINUTES);

            for node in nodes {
                if node.created_at >= grace_cutoff {
                    continue;
                }
                info!("found node: {}, trying to remove it.", node.name);
                self.drain_or_remove(node).await;
                break;
            }
        }
    }

    /// Dispatches on the node's durable `Status` label: `Running` starts a
    /// drain, `Draining` confirms and removes. Exactly one action per node
    /// per tick, matching the original's single `drain()`/`remove()` call
    /// before its `break`.
    async fn drain_or_remove(&self, node: &ProviderNode) {
        let Some(status) = node.status() else {
            error!("provider node {} has no Status label, skipping.", node.name);
            return;
        };

        let Some(orchestrator_node) = self.orchestrator.get_node(&node.name).await else {
            error!("couldn't find node {} in the orchestrator.", node.name);
            return;
        };

        match status {
            NodeStatus::Running => {
                info!("drain of node: {}, needed.", node.name);
                if self.orchestrator.drain(&orchestrator_node).await {
                    info!("drain of node: {}, has begun.", node.name);
                    let mut labels = node.labels.clone();
                    labels.insert("Status".to_string(), NodeStatus::Draining.as_label_value().to_string());
                    self.provider.update_labels(&node.id, labels).await;
                    debug!("updated label Status to Draining on node: {}.", node.name);
                } else {
                    error!("drain of node: {}, has encountered an error.", node.name);
                }
            }
            NodeStatus::Draining => {
                info!("confirming drain has completed on node: {}.", node.name);
                if self.orchestrator.confirm_drain(&orchestrator_node).await {
                    info!("deleting node: {}, from swarm.", node.name);
                    if self.orchestrator.remove(&orchestrator_node).await {
                        info!("deleting node from provider: {}", node.name);
                        self.provider.delete_node(&node.id).await;
                        info!("node: {} is set to remove on provider.", node.name);
                    } else {
                        error!("deletion of swarm node: {}, encountered an error.", node.name);
                    }
                } else {
                    info!("drain of node: {}, hasn't completed, waiting.", node.name);
                }
            }
            NodeStatus::Creating => {
                debug!("node {} is still Creating, not eligible for drain.", node.name);
            }
        }
    }

    /// A `Creating` node that now answers to the orchestrator is promoted to
    /// `Running`; one that's been `Creating` for over an hour with no sign
    /// of life is treated as orphaned and deleted at the provider.
    async fn reconcile_warmup(&self, node: &ProviderNode) {
        if node.status() != Some(NodeStatus::Creating) {
            return;
        }

        info!("checking if node: {}, has joined the cluster.", node.name);
        let orphan_cutoff = Utc::now() - ChronoDuration::hours(ORPHAN_WINDOW_HOURS);

        match self.orchestrator.get_node(&node.name).await {
            Some(_) => {
                let mut labels = node.labels.clone();
                labels.insert("Status".to_string(), NodeStatus::Running.as_label_value().to_string());
                self.provider.update_labels(&node.id, labels).await;
                info!("found node: {}, updated label Status to Running.", node.name);
            }
            None if node.created_at < orphan_cutoff => {
                error!(
                    "waited for node: {} for one hour, and it didn't show up in swarm. Removing node.",
                    node.name
                );
                self.provider.delete_node(&node.id).await;
                info!("node: {} is set to remove on provider.", node.name);
            }
            None => {
                debug!("node: {} hasn't joined the swarm yet, still within the warm-up window.", node.name);
            }
        }
    }
}
