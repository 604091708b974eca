//! Hetzner Cloud provider: the one shipped implementation of [`super::Provider`].
//!
//! Supplies base64-decoded cloud-init, comma-split network/firewall/ssh-key
//! lists, bearer-token auth, and 50-item pagination via `meta.pagination.last_page`
//! — the same contract the original Python implementation spoke.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::config::HetznerArgs;
use crate::error::{ConfigError, ProviderError};
use crate::types::ProviderNode;

use super::Provider;

const BASE_URL: &str = "https://api.hetzner.cloud/v1";
const PAGE_SIZE: u32 = 50;
const NAME_SUFFIX_LEN: usize = 15;

pub struct HetznerProvider {
    client: reqwest::Client,
    api_key: String,
    node_prefix: String,
    node_label: String,
    node_user_data: String,
    node_networks: Vec<i64>,
    node_firewalls: Vec<String>,
    node_image: String,
    node_type: String,
    node_location: String,
    node_ssh_keys: Vec<String>,
}

fn split_csv(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        vec![String::new()]
    } else {
        raw.split(',').map(|s| s.to_string()).collect()
    }
}

impl HetznerProvider {
    pub fn new(args: &HetznerArgs) -> Result<Self, ConfigError> {
        let api_key = args.api_key.clone().ok_or(ConfigError::MissingApiKey)?;
        let node_image = args.node_image.clone().ok_or(ConfigError::MissingNodeImage)?;
        let node_type = args.node_type.clone().ok_or(ConfigError::MissingNodeType)?;
        let node_location = args
            .node_location
            .clone()
            .ok_or(ConfigError::MissingNodeLocation)?;

        let node_user_data = if args.node_user_data.is_empty() {
            String::new()
        } else {
            let decoded = BASE64
                .decode(&args.node_user_data)
                .map_err(ConfigError::InvalidUserData)?;
            String::from_utf8_lossy(&decoded).into_owned()
        };

        let node_networks = split_csv(&args.node_networks)
            .iter()
            .filter_map(|s| s.parse::<i64>().ok())
            .collect();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder invariants upheld");

        Ok(Self {
            client,
            api_key,
            node_prefix: args.node_prefix.clone(),
            node_label: args.node_label.clone(),
            node_user_data,
            node_networks,
            node_firewalls: split_csv(&args.node_firewalls),
            node_image,
            node_type,
            node_location,
            node_ssh_keys: split_csv(&args.node_ssh_keys),
        })
    }

    fn random_node_name(&self) -> String {
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..NAME_SUFFIX_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{}{}", self.node_prefix, suffix)
    }
}

#[derive(Debug, Deserialize)]
struct ServerJson {
    id: u64,
    name: String,
    created: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    last_page: u32,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct ListServersResponse {
    servers: Vec<ServerJson>,
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: ServerJson,
}

#[derive(Debug, Serialize)]
struct FirewallRef {
    firewall: String,
}

#[derive(Debug, Serialize)]
struct CreateServerPayload {
    firewalls: Vec<FirewallRef>,
    image: String,
    labels: HashMap<String, String>,
    location: String,
    name: String,
    networks: Vec<i64>,
    server_type: String,
    ssh_keys: Vec<String>,
    user_data: String,
}

fn server_to_provider_node(server: ServerJson) -> Result<ProviderNode, ProviderError> {
    let created_at: DateTime<Utc> = server.created.parse()?;
    Ok(ProviderNode {
        id: server.id.to_string(),
        name: server.name,
        created_at,
        labels: server.labels,
    })
}

#[async_trait]
impl Provider for HetznerProvider {
    async fn list_nodes(&self) -> Result<Vec<ProviderNode>, ProviderError> {
        let mut nodes = Vec::new();
        let mut page = 1;
        loop {
            let url = format!(
                "{BASE_URL}/servers?page={page}&per_page={PAGE_SIZE}&label_selector=Type={}",
                self.node_label
            );
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::NonSuccessStatus {
                    operation: "list_nodes",
                    status: status.as_u16(),
                    body,
                });
            }
            let body: ListServersResponse = response.json().await?;
            let last_page = body.meta.pagination.last_page;
            for server in body.servers {
                nodes.push(server_to_provider_node(server)?);
            }
            if page >= last_page {
                break;
            }
            page += 1;
        }
        Ok(nodes)
    }

    async fn create_node(&self) -> Result<ProviderNode, ProviderError> {
        let mut labels = HashMap::new();
        labels.insert("Type".to_string(), self.node_label.clone());
        labels.insert("Status".to_string(), "Creating".to_string());

        let payload = CreateServerPayload {
            firewalls: self
                .node_firewalls
                .iter()
                .map(|f| FirewallRef { firewall: f.clone() })
                .collect(),
            image: self.node_image.clone(),
            labels,
            location: self.node_location.clone(),
            name: self.random_node_name(),
            networks: self.node_networks.clone(),
            server_type: self.node_type.clone(),
            ssh_keys: self.node_ssh_keys.clone(),
            user_data: self.node_user_data.clone(),
        };

        let response = self
            .client
            .post(format!("{BASE_URL}/servers"))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() != 201 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::NonSuccessStatus {
                operation: "create_node",
                status: status.as_u16(),
                body,
            });
        }
        let body: CreateServerResponse = response.json().await?;
        server_to_provider_node(body.server)
    }

    async fn delete_node(&self, id: &str) -> bool {
        match self
            .client
            .delete(format!("{BASE_URL}/servers/{id}"))
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!("hetzner delete_node({}) returned status {}", id, response.status());
                false
            }
            Err(e) => {
                error!("hetzner delete_node({}) failed: {}", id, e);
                false
            }
        }
    }

    async fn update_labels(&self, id: &str, labels: HashMap<String, String>) -> bool {
        match self
            .client
            .put(format!("{BASE_URL}/servers/{id}"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "labels": labels }))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!("hetzner update_labels({}) returned status {}", id, response.status());
                false
            }
            Err(e) => {
                error!("hetzner update_labels({}) failed: {}", id, e);
                false
            }
        }
    }
}
