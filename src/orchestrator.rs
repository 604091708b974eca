//! Orchestrator client: the swarm's local HTTP-over-unix-socket API.
//!
//! Every operation maps to exactly one API call; optimistic concurrency
//! (the `version` query parameter) is mandatory on every update, matching
//! the wire contract in §6 of the design notes.

use std::collections::HashMap;

use async_trait::async_trait;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::error::OrchestratorError;
use crate::types::{OrchestratorNode, ServiceMode, ServiceSpec};

/// Read/scale services; fetch, drain, confirm-drain, and remove nodes.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn ping(&self) -> bool;

    /// Exact-name filter, first match. `None` if absent or the call fails.
    async fn get_service(&self, name: &str) -> Option<ServiceSpec>;

    /// Posts an update at `spec.version`. On success, re-reads the service
    /// to refresh its version token. On failure, logs and leaves the spec
    /// unchanged. Not retried within the tick.
    async fn scale(&self, spec: &ServiceSpec, new_replicas: u64) -> bool;

    async fn get_node(&self, name: &str) -> Option<OrchestratorNode>;

    /// Marks a node unavailable for new tasks. Returns success.
    async fn drain(&self, node: &OrchestratorNode) -> bool;

    /// `true` iff no task scheduled on `node` is in state `running`.
    async fn confirm_drain(&self, node: &OrchestratorNode) -> bool;

    /// Force-deletes the node from the orchestrator.
    async fn remove(&self, node: &OrchestratorNode) -> bool;
}

#[derive(Debug, Deserialize)]
struct VersionField {
    #[serde(rename = "Index")]
    index: u64,
}

#[derive(Debug, Deserialize)]
struct ServiceSpecJson {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TaskTemplate")]
    task_template: serde_json::Value,
    #[serde(rename = "UpdateConfig", default)]
    update_config: Option<serde_json::Value>,
    #[serde(rename = "RollbackConfig", default)]
    rollback_config: Option<serde_json::Value>,
    #[serde(rename = "EndpointSpec", default)]
    endpoint_spec: Option<serde_json::Value>,
    #[serde(rename = "Mode")]
    mode: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ServiceJson {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Version")]
    version: VersionField,
    #[serde(rename = "Spec")]
    spec: ServiceSpecJson,
}

fn empty_object() -> serde_json::Value {
    json!({})
}

fn service_from_json(doc: ServiceJson) -> ServiceSpec {
    let labels: HashMap<String, String> = doc
        .spec
        .task_template
        .get("ContainerSpec")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let limits = doc
        .spec
        .task_template
        .get("Resources")
        .and_then(|r| r.get("Limits"));
    let cpu_limit_cores = limits
        .and_then(|l| l.get("NanoCPUs"))
        .and_then(|v| v.as_f64())
        .map(|nano| nano / 1_000_000_000.0);
    let memory_limit_mib = limits
        .and_then(|l| l.get("MemoryBytes"))
        .and_then(|v| v.as_f64())
        .map(|bytes| bytes / 1024.0 / 1024.0);

    let (mode, replicas) = match doc.spec.mode.get("Replicated") {
        Some(replicated) => (
            ServiceMode::Replicated,
            replicated.get("Replicas").and_then(|v| v.as_u64()),
        ),
        None => (ServiceMode::Global, None),
    };

    ServiceSpec {
        id: doc.id,
        name: doc.spec.name,
        version: doc.version.index,
        mode,
        replicas,
        cpu_limit_cores,
        memory_limit_mib,
        labels,
        task_template: doc.spec.task_template,
        update_config: doc.spec.update_config.unwrap_or_else(empty_object),
        rollback_config: doc.spec.rollback_config.unwrap_or_else(empty_object),
        endpoint_spec: doc.spec.endpoint_spec.unwrap_or_else(empty_object),
    }
}

#[derive(Debug, Deserialize)]
struct NodeDescriptionJson {
    #[serde(rename = "Hostname")]
    hostname: String,
}

#[derive(Debug, Deserialize)]
struct NodeSpecJson {
    #[serde(rename = "Role")]
    role: String,
}

#[derive(Debug, Deserialize)]
struct NodeJson {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Version")]
    version: VersionField,
    #[serde(rename = "Description")]
    description: NodeDescriptionJson,
    #[serde(rename = "Spec")]
    spec: NodeSpecJson,
}

fn node_from_json(doc: NodeJson) -> OrchestratorNode {
    OrchestratorNode {
        id: doc.id,
        version: doc.version.index,
        hostname: doc.description.hostname,
        role: doc.spec.role,
    }
}

#[derive(Debug, Deserialize)]
struct TaskStatusJson {
    #[serde(rename = "State")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct TaskJson {
    #[serde(rename = "Status")]
    status: TaskStatusJson,
}

#[derive(Debug, Serialize)]
struct ScaleUpdatePayload<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "TaskTemplate")]
    task_template: &'a serde_json::Value,
    #[serde(rename = "Mode")]
    mode: serde_json::Value,
    #[serde(rename = "UpdateConfig")]
    update_config: &'a serde_json::Value,
    #[serde(rename = "RollbackConfig")]
    rollback_config: &'a serde_json::Value,
    #[serde(rename = "EndpointSpec")]
    endpoint_spec: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct DrainPayload<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Labels")]
    labels: serde_json::Value,
    #[serde(rename = "Role")]
    role: &'a str,
    #[serde(rename = "Availability")]
    availability: &'a str,
}

/// Swarm orchestrator client over a local unix domain socket.
pub struct SwarmOrchestrator {
    socket_path: String,
    client: Client<UnixConnector, Body>,
}

impl SwarmOrchestrator {
    pub fn new(socket_path: String) -> Self {
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    fn uri(&self, path_and_query: &str) -> hyper::Uri {
        UnixUri::new(&self.socket_path, path_and_query).into()
    }

    async fn get(&self, path_and_query: &str) -> Result<(StatusCode, String), OrchestratorError> {
        let response = self.client.get(self.uri(path_and_query)).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }

    async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(StatusCode, String), OrchestratorError> {
        let mut builder = Request::builder().method(method).uri(self.uri(path_and_query));
        let body = match payload {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("request builder invariants upheld");
        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    }

    async fn read_service_version(&self, id: &str) -> Option<u64> {
        let (status, body) = self.get(&format!("/services/{id}")).await.ok()?;
        if !status.is_success() {
            error!("couldn't refresh version for service {}", id);
            return None;
        }
        let doc: ServiceJson = serde_json::from_str(&body).ok()?;
        Some(doc.version.index)
    }

    async fn read_node_version(&self, id: &str) -> Option<u64> {
        let (status, body) = self.get(&format!("/nodes/{id}")).await.ok()?;
        if !status.is_success() {
            error!("couldn't refresh version for node {}", id);
            return None;
        }
        let doc: NodeJson = serde_json::from_str(&body).ok()?;
        Some(doc.version.index)
    }
}

fn name_filter(name: &str) -> String {
    let filter = json!({ "name": [name] });
    urlencoding::encode(&filter.to_string()).into_owned()
}

fn node_task_filter(node_id: &str) -> String {
    let filter = json!({ "node": [node_id] });
    urlencoding::encode(&filter.to_string()).into_owned()
}

/// Classifies a non-success update response: a `409 Conflict` means the
/// `version` token we posted was stale, anything else is a generic
/// non-success status.
fn update_error(
    endpoint: String,
    kind: &'static str,
    id: &str,
    version: u64,
    status: StatusCode,
    body: String,
) -> OrchestratorError {
    if status == StatusCode::CONFLICT {
        OrchestratorError::StaleVersion {
            kind,
            id: id.to_string(),
            version,
        }
    } else {
        OrchestratorError::NonSuccessStatus {
            endpoint,
            status: status.as_u16(),
            body,
        }
    }
}

#[async_trait]
impl Orchestrator for SwarmOrchestrator {
    async fn ping(&self) -> bool {
        matches!(self.get("/_ping").await, Ok((status, _)) if status.is_success())
    }

    async fn get_service(&self, name: &str) -> Option<ServiceSpec> {
        let path = format!("/services?filters={}", name_filter(name));
        let (status, body) = match self.get(&path).await {
            Ok(result) => result,
            Err(e) => {
                error!("error fetching service {}: {}", name, e);
                return None;
            }
        };
        if !status.is_success() {
            error!(
                "{}",
                OrchestratorError::NonSuccessStatus {
                    endpoint: path,
                    status: status.as_u16(),
                    body,
                }
            );
            return None;
        }
        let docs: Vec<ServiceJson> = match serde_json::from_str(&body) {
            Ok(docs) => docs,
            Err(e) => {
                error!("{}", OrchestratorError::Decode(e));
                return None;
            }
        };
        docs.into_iter().next().map(service_from_json)
    }

    async fn scale(&self, spec: &ServiceSpec, new_replicas: u64) -> bool {
        let payload = ScaleUpdatePayload {
            name: &spec.name,
            task_template: &spec.task_template,
            mode: json!({ "Replicated": { "Replicas": new_replicas } }),
            update_config: &spec.update_config,
            rollback_config: &spec.rollback_config,
            endpoint_spec: &spec.endpoint_spec,
        };
        let path = format!("/services/{}/update?version={}", spec.id, spec.version);
        match self
            .send(Method::POST, &path, Some(serde_json::to_value(&payload).unwrap()))
            .await
        {
            Ok((status, _)) if status.is_success() => {
                debug!("scaled service {} to {} replicas", spec.name, new_replicas);
                // Caller is expected to re-fetch the ServiceSpec on the next
                // tick; the version refresh itself happens here so a direct
                // follow-up scale() call within the same tick would observe
                // the new token.
                self.read_service_version(&spec.id).await;
                true
            }
            Ok((status, body)) => {
                let err = update_error(path, "service", &spec.id, spec.version, status, body);
                error!("error scaling service {} to {} replicas: {}", spec.name, new_replicas, err);
                false
            }
            Err(e) => {
                error!("error scaling service {}: {}", spec.name, e);
                false
            }
        }
    }

    async fn get_node(&self, name: &str) -> Option<OrchestratorNode> {
        let path = format!("/nodes?filters={}", name_filter(name));
        let (status, body) = match self.get(&path).await {
            Ok(result) => result,
            Err(e) => {
                error!("error fetching node {}: {}", name, e);
                return None;
            }
        };
        if !status.is_success() {
            error!(
                "{}",
                OrchestratorError::NonSuccessStatus {
                    endpoint: path,
                    status: status.as_u16(),
                    body,
                }
            );
            return None;
        }
        let docs: Vec<NodeJson> = match serde_json::from_str(&body) {
            Ok(docs) => docs,
            Err(e) => {
                error!("{}", OrchestratorError::Decode(e));
                return None;
            }
        };
        docs.into_iter().next().map(node_from_json)
    }

    async fn drain(&self, node: &OrchestratorNode) -> bool {
        let payload = DrainPayload {
            name: &node.hostname,
            labels: json!({ "draining": "true" }),
            role: &node.role,
            availability: "drain",
        };
        let path = format!("/nodes/{}/update?version={}", node.id, node.version);
        match self
            .send(Method::POST, &path, Some(serde_json::to_value(&payload).unwrap()))
            .await
        {
            Ok((status, _)) if status.is_success() => {
                self.read_node_version(&node.id).await;
                true
            }
            Ok((status, body)) => {
                let err = update_error(path, "node", &node.id, node.version, status, body);
                error!("error draining node {}: {}", node.hostname, err);
                false
            }
            Err(e) => {
                error!("error draining node {}: {}", node.hostname, e);
                false
            }
        }
    }

    async fn confirm_drain(&self, node: &OrchestratorNode) -> bool {
        let path = format!("/tasks?filters={}", node_task_filter(&node.id));
        let (status, body) = match self.get(&path).await {
            Ok(result) => result,
            Err(e) => {
                error!("error confirming drain on node {}: {}", node.hostname, e);
                return false;
            }
        };
        if !status.is_success() {
            error!(
                "{}",
                OrchestratorError::NonSuccessStatus {
                    endpoint: path,
                    status: status.as_u16(),
                    body,
                }
            );
            return false;
        }
        let tasks: Vec<TaskJson> = match serde_json::from_str(&body) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("couldn't decode task list for node {}: {}", node.hostname, OrchestratorError::Decode(e));
                return false;
            }
        };
        !tasks.iter().any(|t| t.status.state == "running")
    }

    async fn remove(&self, node: &OrchestratorNode) -> bool {
        let path = format!("/nodes/{}?force=true", node.id);
        match self.send(Method::DELETE, &path, None).await {
            Ok((status, _)) if status.is_success() => true,
            Ok((status, body)) => {
                let err = OrchestratorError::NonSuccessStatus {
                    endpoint: path,
                    status: status.as_u16(),
                    body,
                };
                error!("error deleting node {} from swarm: {}", node.hostname, err);
                false
            }
            Err(e) => {
                error!("error deleting node {} from swarm: {}", node.hostname, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory fake used by `scaler` and `node_lifecycle` unit tests.
    /// Records every `scale()` call; `get_service`/`get_node` serve whatever
    /// was seeded via the `with_*` constructors.
    pub(crate) struct FakeOrchestrator {
        services: Vec<ServiceSpec>,
        nodes: Vec<OrchestratorNode>,
        ping_ok: bool,
        scale_calls: Mutex<Vec<(String, u64)>>,
        drain_calls: Mutex<Vec<String>>,
        confirm_drain_results: Mutex<Vec<bool>>,
        remove_calls: Mutex<Vec<String>>,
    }

    impl FakeOrchestrator {
        pub(crate) fn with_services(services: Vec<ServiceSpec>) -> Self {
            Self {
                services,
                nodes: Vec::new(),
                ping_ok: true,
                scale_calls: Mutex::new(Vec::new()),
                drain_calls: Mutex::new(Vec::new()),
                confirm_drain_results: Mutex::new(Vec::new()),
                remove_calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_nodes(nodes: Vec<OrchestratorNode>) -> Self {
            Self {
                services: Vec::new(),
                nodes,
                ping_ok: true,
                scale_calls: Mutex::new(Vec::new()),
                drain_calls: Mutex::new(Vec::new()),
                confirm_drain_results: Mutex::new(vec![true]),
                remove_calls: Mutex::new(Vec::new()),
            }
        }

        /// Queue of confirm_drain() results returned in order, last one sticky.
        pub(crate) fn set_confirm_drain_sequence(&self, results: Vec<bool>) {
            *self.confirm_drain_results.lock().unwrap() = results;
        }

        pub(crate) fn scale_calls(&self) -> Vec<(String, u64)> {
            self.scale_calls.lock().unwrap().clone()
        }

        pub(crate) fn drain_calls(&self) -> Vec<String> {
            self.drain_calls.lock().unwrap().clone()
        }

        pub(crate) fn remove_calls(&self) -> Vec<String> {
            self.remove_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Orchestrator for FakeOrchestrator {
        async fn ping(&self) -> bool {
            self.ping_ok
        }

        async fn get_service(&self, name: &str) -> Option<ServiceSpec> {
            self.services.iter().find(|s| s.name == name).cloned()
        }

        async fn scale(&self, spec: &ServiceSpec, new_replicas: u64) -> bool {
            self.scale_calls
                .lock()
                .unwrap()
                .push((spec.name.clone(), new_replicas));
            true
        }

        async fn get_node(&self, name: &str) -> Option<OrchestratorNode> {
            self.nodes.iter().find(|n| n.hostname == name).cloned()
        }

        async fn drain(&self, node: &OrchestratorNode) -> bool {
            self.drain_calls.lock().unwrap().push(node.hostname.clone());
            true
        }

        async fn confirm_drain(&self, _node: &OrchestratorNode) -> bool {
            let mut results = self.confirm_drain_results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results.first().copied().unwrap_or(true)
            }
        }

        async fn remove(&self, node: &OrchestratorNode) -> bool {
            self.remove_calls.lock().unwrap().push(node.hostname.clone());
            true
        }
    }

    #[test]
    fn decodes_replicated_service() {
        let body = r#"{
            "ID": "svc1",
            "Version": {"Index": 5},
            "Spec": {
                "Name": "web",
                "TaskTemplate": {
                    "ContainerSpec": {"Labels": {"autopilot.enabled": "true", "autopilot.scale_min": "1"}},
                    "Resources": {"Limits": {"NanoCPUs": 1000000000, "MemoryBytes": 536870912}}
                },
                "Mode": {"Replicated": {"Replicas": 3}}
            }
        }"#;
        let doc: ServiceJson = serde_json::from_str(body).unwrap();
        let spec = service_from_json(doc);
        assert_eq!(spec.name, "web");
        assert_eq!(spec.version, 5);
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.cpu_limit_cores, Some(1.0));
        assert_eq!(spec.memory_limit_mib, Some(512.0));
        assert!(spec.autopilot_enabled());
        assert_eq!(spec.scale_min(), Some(1));
        assert_eq!(spec.mode, ServiceMode::Replicated);
    }

    #[test]
    fn decodes_global_service_with_missing_optional_configs() {
        let body = r#"{
            "ID": "svc2",
            "Version": {"Index": 1},
            "Spec": {
                "Name": "logging",
                "TaskTemplate": {"ContainerSpec": {"Labels": {}}},
                "Mode": {"Global": {}}
            }
        }"#;
        let doc: ServiceJson = serde_json::from_str(body).unwrap();
        let spec = service_from_json(doc);
        assert_eq!(spec.mode, ServiceMode::Global);
        assert_eq!(spec.replicas, None);
        assert_eq!(spec.update_config, json!({}));
        assert_eq!(spec.rollback_config, json!({}));
        assert_eq!(spec.endpoint_spec, json!({}));
    }

    #[test]
    fn decodes_node() {
        let body = r#"{
            "ID": "node1",
            "Version": {"Index": 9},
            "Description": {"Hostname": "worker-1"},
            "Spec": {"Role": "worker"}
        }"#;
        let doc: NodeJson = serde_json::from_str(body).unwrap();
        let node = node_from_json(doc);
        assert_eq!(node.hostname, "worker-1");
        assert_eq!(node.version, 9);
    }

    #[test]
    fn confirm_drain_false_when_any_task_running() {
        let body = r#"[{"Status": {"State": "complete"}}, {"Status": {"State": "running"}}]"#;
        let tasks: Vec<TaskJson> = serde_json::from_str(body).unwrap();
        assert!(tasks.iter().any(|t| t.status.state == "running"));
    }

    #[test]
    fn name_filter_is_url_encoded_json() {
        let encoded = name_filter("web");
        assert!(encoded.contains("%22name%22") || encoded.contains("name"));
    }
}
