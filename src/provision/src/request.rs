//! VM requests and the accept / reject / edit workflow around the orchestrator.
//!
//! Storage and notification are external concerns reached through the
//! [`RequestStore`] and [`Notifier`] traits. A JSON-file store and a
//! log-only notifier are provided for the CLI.

use crate::config::PoolConfig;
use crate::orchestrator::{ProvisionedVm, VmProvisioner};
use crate::provisioner::ProvisionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Tag added to every VM created from a request.
pub const CREATED_BY_TAG: &str = "created-by-vmwiz";

/// Everything the orchestrator needs to build one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCreationOptions {
    /// Image selector: full label, short label or codename.
    pub image: String,
    pub fqdn: String,
    /// Reuse the existing DNS binding instead of allocating a new one.
    #[serde(default)]
    pub reinstall: bool,
    pub cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    #[serde(default)]
    pub use_qemu_agent: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free text stored in the VM description, one `key=value` per line.
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    pub resource_pool: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => f.write_str("pending"),
            RequestStatus::Accepted => f.write_str("accepted"),
            RequestStatus::Rejected => f.write_str("rejected"),
        }
    }
}

/// A persisted VM request as submitted through the request form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRequest {
    pub id: u64,
    pub status: RequestStatus,
    /// University address of the requester.
    pub email: String,
    #[serde(default)]
    pub personal_email: String,
    #[serde(default)]
    pub is_organization: bool,
    #[serde(default)]
    pub org_name: String,
    pub hostname: String,
    pub image: String,
    pub cores: u32,
    pub ram_gb: u32,
    pub disk_gb: u32,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub comment: String,
}

impl VmRequest {
    /// Hostname qualified with `domain` unless it already contains a dot.
    pub fn fqdn(&self, domain: &str) -> String {
        let host = self.hostname.trim();
        if host.contains('.') {
            host.to_string()
        } else {
            format!("{}.{}", host, domain)
        }
    }

    pub fn to_creation_options(
        &self,
        domain: &str,
        pools: &PoolConfig,
        qemu_agent: bool,
    ) -> VmCreationOptions {
        let nethz = self.email.split('@').next().unwrap_or_default();
        let mut notes = vec![
            format!("nethz={}", nethz),
            format!("uni_contact={}", self.email),
        ];
        if !self.personal_email.is_empty() {
            notes.push(format!("contact={}", self.personal_email));
        }
        if self.is_organization {
            notes.push(format!("organization={}", self.org_name));
        }
        notes.push(format!("request={}", self.id));
        notes.extend(
            self.comment
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| format!("comment={}", l)),
        );

        VmCreationOptions {
            image: self.image.clone(),
            fqdn: self.fqdn(domain),
            reinstall: false,
            cores: self.cores,
            ram_mb: self.ram_gb.saturating_mul(1024),
            disk_gb: self.disk_gb,
            use_qemu_agent: qemu_agent,
            tags: vec![CREATED_BY_TAG.to_string()],
            notes: notes.join("\n"),
            ssh_keys: self.ssh_keys.clone(),
            resource_pool: select_resource_pool(self.is_organization, pools).to_string(),
        }
    }
}

/// Organization requests go to the organization pool, everything else to the
/// personal pool.
pub fn select_resource_pool(is_organization: bool, pools: &PoolConfig) -> &str {
    if is_organization {
        &pools.organization
    } else {
        &pools.personal
    }
}

/// Changes an operator may apply to a pending request. `None` keeps the
/// current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditRequest {
    pub hostname: Option<String>,
    pub cores: Option<u32>,
    pub ram_gb: Option<u32>,
    pub disk_gb: Option<u32>,
}

impl EditRequest {
    pub fn apply(&self, request: &mut VmRequest) {
        if let Some(hostname) = self.hostname.as_deref().filter(|h| !h.trim().is_empty()) {
            request.hostname = hostname.trim().to_string();
        }
        if let Some(cores) = self.cores.filter(|c| *c != 0) {
            request.cores = cores;
        }
        if let Some(ram) = self.ram_gb.filter(|r| *r != 0) {
            request.ram_gb = ram;
        }
        if let Some(disk) = self.disk_gb.filter(|d| *d != 0) {
            request.disk_gb = disk;
        }
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn get(&self, id: u64) -> Result<VmRequest, ProvisionError>;

    async fn list(&self) -> Result<Vec<VmRequest>, ProvisionError>;

    async fn update_status(&self, id: u64, status: RequestStatus) -> Result<(), ProvisionError>;

    /// Replace the editable fields of an existing request.
    async fn update_fields(&self, request: &VmRequest) -> Result<(), ProvisionError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell the requester their request changed status.
    async fn status_changed(&self, request: &VmRequest, message: &str)
        -> Result<(), ProvisionError>;

    /// Post a progress message to the operators.
    async fn creation_update(&self, message: &str) -> Result<(), ProvisionError>;

    /// Send the finished VM's summary to the requester.
    async fn send_summary(
        &self,
        request: &VmRequest,
        vm: &ProvisionedVm,
    ) -> Result<(), ProvisionError>;
}

/// Notifier that only writes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn status_changed(
        &self,
        request: &VmRequest,
        message: &str,
    ) -> Result<(), ProvisionError> {
        tracing::info!(
            "[Notifier] Request {} ({}) is now {}{}{}",
            request.id,
            request.email,
            request.status,
            if message.is_empty() { "" } else { ": " },
            message
        );
        Ok(())
    }

    async fn creation_update(&self, message: &str) -> Result<(), ProvisionError> {
        tracing::info!("[Notifier] {}", message);
        Ok(())
    }

    async fn send_summary(
        &self,
        request: &VmRequest,
        vm: &ProvisionedVm,
    ) -> Result<(), ProvisionError> {
        tracing::info!(
            "[Notifier] Summary for {}:\n{}",
            request.email,
            vm
        );
        Ok(())
    }
}

/// Request store kept in memory and optionally mirrored to a JSON file.
pub struct MemoryRequestStore {
    requests: Mutex<BTreeMap<u64, VmRequest>>,
    path: Option<PathBuf>,
}

impl MemoryRequestStore {
    pub fn in_memory(requests: Vec<VmRequest>) -> Self {
        Self {
            requests: Mutex::new(requests.into_iter().map(|r| (r.id, r)).collect()),
            path: None,
        }
    }

    /// Load the JSON array at `path`; a missing file is an empty store.
    pub async fn open(path: &Path) -> Result<Self, ProvisionError> {
        let requests: Vec<VmRequest> = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ProvisionError::Request(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ProvisionError::Request(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        tracing::debug!(
            "[RequestStore] Loaded {} request(s) from {}",
            requests.len(),
            path.display()
        );

        Ok(Self {
            requests: Mutex::new(requests.into_iter().map(|r| (r.id, r)).collect()),
            path: Some(path.to_path_buf()),
        })
    }

    async fn persist(&self, requests: &BTreeMap<u64, VmRequest>) -> Result<(), ProvisionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let all: Vec<&VmRequest> = requests.values().collect();
        let json = serde_json::to_string_pretty(&all)
            .map_err(|e| ProvisionError::Request(format!("Failed to serialize requests: {}", e)))?;
        tokio::fs::write(path, json).await.map_err(|e| {
            ProvisionError::Request(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    fn not_found(id: u64) -> ProvisionError {
        ProvisionError::Request(format!("No request with id {}", id))
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn get(&self, id: u64) -> Result<VmRequest, ProvisionError> {
        self.requests
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::not_found(id))
    }

    async fn list(&self) -> Result<Vec<VmRequest>, ProvisionError> {
        Ok(self.requests.lock().await.values().cloned().collect())
    }

    async fn update_status(&self, id: u64, status: RequestStatus) -> Result<(), ProvisionError> {
        let mut requests = self.requests.lock().await;
        let request = requests.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
        request.status = status;
        self.persist(&requests).await
    }

    async fn update_fields(&self, request: &VmRequest) -> Result<(), ProvisionError> {
        let mut requests = self.requests.lock().await;
        let stored = requests
            .get_mut(&request.id)
            .ok_or_else(|| Self::not_found(request.id))?;
        stored.hostname = request.hostname.clone();
        stored.cores = request.cores;
        stored.ram_gb = request.ram_gb;
        stored.disk_gb = request.disk_gb;
        self.persist(&requests).await
    }
}

/// Operator actions on pending requests.
pub struct RequestHandler {
    store: Arc<dyn RequestStore>,
    notifier: Arc<dyn Notifier>,
    provisioner: Arc<dyn VmProvisioner>,
    pools: PoolConfig,
    domain: String,
    qemu_agent: bool,
}

impl RequestHandler {
    pub fn new(
        store: Arc<dyn RequestStore>,
        notifier: Arc<dyn Notifier>,
        provisioner: Arc<dyn VmProvisioner>,
        pools: PoolConfig,
        domain: String,
        qemu_agent: bool,
    ) -> Self {
        Self {
            store,
            notifier,
            provisioner,
            pools,
            domain,
            qemu_agent,
        }
    }

    pub fn store(&self) -> &dyn RequestStore {
        self.store.as_ref()
    }

    /// Find a request by id or by hostname.
    pub async fn find(&self, id: Option<u64>, name: Option<&str>) -> Result<VmRequest, ProvisionError> {
        if let Some(id) = id {
            return self.store.get(id).await;
        }
        let name = name.ok_or_else(|| {
            ProvisionError::Validation("either a request id or a hostname is required".to_string())
        })?;
        let mut matches: Vec<VmRequest> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.hostname == name || r.fqdn(&self.domain) == name)
            .collect();
        match matches.len() {
            0 => Err(ProvisionError::Request(format!("No request for hostname {}", name))),
            1 => Ok(matches.remove(0)),
            n => Err(ProvisionError::Request(format!(
                "{} requests for hostname {}, use the id instead",
                n, name
            ))),
        }
    }

    /// Mark a request accepted and provision its VM.
    pub async fn accept_request(
        &self,
        id: u64,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedVm, ProvisionError> {
        let mut request = self.store.get(id).await?;
        if request.status == RequestStatus::Accepted {
            return Err(ProvisionError::Validation(format!(
                "Request {} was already accepted",
                id
            )));
        }

        request.status = RequestStatus::Accepted;
        self.notifier
            .status_changed(&request, "Creating VM now, it'll take a while ...")
            .await?;

        let options = request.to_creation_options(&self.domain, &self.pools, self.qemu_agent);
        self.store.update_status(id, RequestStatus::Accepted).await?;
        tracing::info!(
            "[RequestHandler] Accepted request {} for {} in pool {}",
            id,
            options.fqdn,
            options.resource_pool
        );

        let vm = match self.provisioner.provision(&options, cancel).await {
            Ok(vm) => vm,
            Err(failure) => {
                self.notifier
                    .creation_update(&format!(
                        "Request {}: Error creating VM:\n```\n{}\n```",
                        id, failure
                    ))
                    .await?;
                return Err(ProvisionError::Failed(Box::new(failure)));
            }
        };

        self.notifier.send_summary(&request, &vm).await?;
        self.notifier
            .creation_update(&format!(
                "Request {}: VM {} created successfully:\n```\n{}\n```",
                id,
                vm.fqdn,
                vm.to_string().trim_end()
            ))
            .await?;
        Ok(vm)
    }

    pub async fn reject_request(&self, id: u64) -> Result<(), ProvisionError> {
        let request = self.store.get(id).await?;
        if request.status == RequestStatus::Accepted {
            return Err(ProvisionError::Validation(
                "Cannot reject an accepted request".to_string(),
            ));
        }

        self.store.update_status(id, RequestStatus::Rejected).await?;
        let request = self.store.get(id).await?;
        self.notifier.status_changed(&request, "").await?;
        tracing::info!(
            "[RequestHandler] Rejected request {} ({})",
            id,
            request.fqdn(&self.domain)
        );
        Ok(())
    }

    pub async fn edit_request(&self, id: u64, edit: &EditRequest) -> Result<VmRequest, ProvisionError> {
        let mut request = self.store.get(id).await?;
        if request.status != RequestStatus::Pending {
            return Err(ProvisionError::Validation(format!(
                "Request {} is {} and can no longer be edited",
                id, request.status
            )));
        }
        edit.apply(&mut request);
        self.store.update_fields(&request).await?;
        tracing::info!(
            "[RequestHandler] Updated request {}: {} cores, {} GB RAM, {} GB disk",
            id,
            request.cores,
            request.ram_gb,
            request.disk_gb
        );
        Ok(request)
    }
}
