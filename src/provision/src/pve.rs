//! Client for the hypervisor's JSON HTTP API.
//!
//! Authenticates with an API token (`PVEAPIToken=<user>!<tokenid>=<secret>`).
//! Every response wraps its payload in a `data` field.

use crate::config::HypervisorConfig;
use crate::provisioner::ProvisionError;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Poll interval while waiting for a VM to stop.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STOP_MAX_POLLS: u32 = 120;

/// A VM as listed by `/cluster/resources`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterVm {
    #[serde(default)]
    pub id: String,
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Current state of a VM on its node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeVm {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub maxdisk: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub destroy_unreferenced_disks: bool,
    pub purge: bool,
    pub skip_lock: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            destroy_unreferenced_disks: true,
            purge: true,
            skip_lock: false,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    data: T,
}

/// Hypervisor operations used by provisioning and teardown.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Ids of every VM in the cluster.
    async fn vm_ids(&self) -> Result<HashSet<u32>, ProvisionError>;

    /// Current state of one VM, as reported by its node.
    async fn vm_status(&self, node: &str, vmid: u32) -> Result<NodeVm, ProvisionError>;

    async fn add_to_pool(&self, pool: &str, vmid: u32) -> Result<(), ProvisionError>;

    async fn vms_by_name(&self, name: &str) -> Result<Vec<ClusterVm>, ProvisionError>;

    async fn force_stop(&self, node: &str, vmid: u32) -> Result<(), ProvisionError>;

    async fn delete_vm(
        &self,
        node: &str,
        vmid: u32,
        options: DeleteOptions,
    ) -> Result<(), ProvisionError>;
}

pub struct PveClient {
    client: Client,
    base_url: String,
    auth_header: String,
}

impl PveClient {
    pub fn new(config: &HypervisorConfig) -> Result<Self, ProvisionError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .build()
            .map_err(|e| {
                ProvisionError::Config(format!("Failed to create hypervisor HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            auth_header: format!(
                "PVEAPIToken={}!{}={}",
                config.user, config.token_id, config.token_secret
            ),
        })
    }

    async fn request<T: DeserializeOwned + Default>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, ProvisionError> {
        let url = format!("{}/api2/json{}", self.base_url, path);
        tracing::debug!("[PveClient] {} {}", method, url);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &self.auth_header)
            .query(query);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await.map_err(|e| {
            ProvisionError::Hypervisor(format!("{} {} failed: {}", method, url, e))
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ProvisionError::Hypervisor(format!("{} {}: cannot read body: {}", method, url, e))
        })?;

        if !status.is_success() {
            return Err(ProvisionError::Hypervisor(format!(
                "{} {} returned {}: {}",
                method,
                url,
                status,
                text.trim()
            )));
        }

        let envelope: Envelope<T> = serde_json::from_str(&text).map_err(|e| {
            ProvisionError::Hypervisor(format!("{} {}: unexpected response: {}", method, url, e))
        })?;
        Ok(envelope.data)
    }

    pub async fn cluster_vms(&self) -> Result<Vec<ClusterVm>, ProvisionError> {
        self.request(
            Method::GET,
            "/cluster/resources",
            &[("type", "vm".to_string())],
            None,
        )
        .await
    }

    pub async fn cluster_vms_by_name(&self, name: &str) -> Result<Vec<ClusterVm>, ProvisionError> {
        Ok(self
            .cluster_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.name == name)
            .collect())
    }

    pub async fn node_vm(&self, node: &str, vmid: u32) -> Result<NodeVm, ProvisionError> {
        self.request(
            Method::GET,
            &format!("/nodes/{}/qemu/{}/status/current", node, vmid),
            &[],
            None,
        )
        .await
    }

    pub async fn add_to_pool(&self, pool: &str, vmid: u32) -> Result<(), ProvisionError> {
        let _: serde_json::Value = self
            .request(
                Method::PUT,
                &format!("/pools/{}", pool),
                &[],
                Some(serde_json::json!({ "vms": vmid })),
            )
            .await?;
        tracing::info!("[PveClient] Added VM {} to pool {}", vmid, pool);
        Ok(())
    }

    /// Hard-stop a VM and wait until the node reports it stopped.
    pub async fn force_stop(&self, node: &str, vmid: u32) -> Result<(), ProvisionError> {
        let _: serde_json::Value = self
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{}/status/stop", node, vmid),
                &[],
                None,
            )
            .await?;

        for _ in 0..STOP_MAX_POLLS {
            if self.node_vm(node, vmid).await?.status == "stopped" {
                tracing::info!("[PveClient] Stopped VM {} on node {}", vmid, node);
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        Err(ProvisionError::Hypervisor(format!(
            "VM {} on node {} did not stop within {}s",
            vmid,
            node,
            STOP_MAX_POLLS as u64 * STOP_POLL_INTERVAL.as_secs()
        )))
    }

    pub async fn delete_vm(
        &self,
        node: &str,
        vmid: u32,
        options: DeleteOptions,
    ) -> Result<(), ProvisionError> {
        let flag = |b: bool| (if b { "1" } else { "0" }).to_string();
        let _: serde_json::Value = self
            .request(
                Method::DELETE,
                &format!("/nodes/{}/qemu/{}", node, vmid),
                &[
                    (
                        "destroy-unreferenced-disks",
                        flag(options.destroy_unreferenced_disks),
                    ),
                    ("purge", flag(options.purge)),
                    ("skiplock", flag(options.skip_lock)),
                ],
                None,
            )
            .await?;
        tracing::info!(
            "[PveClient] Deleted VM {} on node {} (destroy-unreferenced-disks: {}, purge: {}, skiplock: {})",
            vmid,
            node,
            options.destroy_unreferenced_disks,
            options.purge,
            options.skip_lock
        );
        Ok(())
    }

    /// Permissions granted to the configured token.
    pub async fn permissions(&self) -> Result<serde_json::Value, ProvisionError> {
        self.request(Method::GET, "/access/permissions", &[], None)
            .await
    }
}

#[async_trait]
impl Hypervisor for PveClient {
    async fn vm_ids(&self) -> Result<HashSet<u32>, ProvisionError> {
        Ok(self.cluster_vms().await?.into_iter().map(|vm| vm.vmid).collect())
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<NodeVm, ProvisionError> {
        self.node_vm(node, vmid).await
    }

    async fn add_to_pool(&self, pool: &str, vmid: u32) -> Result<(), ProvisionError> {
        PveClient::add_to_pool(self, pool, vmid).await
    }

    async fn vms_by_name(&self, name: &str) -> Result<Vec<ClusterVm>, ProvisionError> {
        self.cluster_vms_by_name(name).await
    }

    async fn force_stop(&self, node: &str, vmid: u32) -> Result<(), ProvisionError> {
        PveClient::force_stop(self, node, vmid).await
    }

    async fn delete_vm(
        &self,
        node: &str,
        vmid: u32,
        options: DeleteOptions,
    ) -> Result<(), ProvisionError> {
        PveClient::delete_vm(self, node, vmid, options).await
    }
}
