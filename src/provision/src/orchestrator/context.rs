//! State shared by the provisioning steps of one run.

use crate::boot_monitor::BootMonitor;
use crate::builder::{ConfigBuilder, RenderedConfig};
use crate::config::{ProvisionerConfig, StorageConfig};
use crate::fingerprint::Fingerprint;
use crate::identity::{self, VmIdRange, VmIdentity};
use crate::images::ImageSpec;
use crate::provisioner::{ProgressReporter, ProvisionError};
use crate::pve::Hypervisor;
use crate::remote::{RemoteExecutor, RemoteTarget};
use crate::request::VmCreationOptions;
use netcenter::{IpBinding, NetworkIdentity};
use rand::Rng;
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Remote state a run created and does not remove by itself.
///
/// Recorded in the order it was created; a cleanup pass would walk the list
/// backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensatableAction {
    DnsRecord { fqdn: String, ip: IpAddr },
    DiskCreated { pool: String, name: String },
    VmDefinitionWritten { vmid: u32, path: String },
    VmStarted { vmid: u32, node: String },
    /// The command that creates this failed or timed out after it was
    /// issued, so the resource may or may not exist.
    Unconfirmed(Box<CompensatableAction>),
}

impl CompensatableAction {
    pub fn unconfirmed(self) -> Self {
        match self {
            already @ CompensatableAction::Unconfirmed(_) => already,
            action => CompensatableAction::Unconfirmed(Box::new(action)),
        }
    }
}

impl std::fmt::Display for CompensatableAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompensatableAction::DnsRecord { fqdn, ip } => {
                write!(f, "DNS record {} -> {} (vmwiz dns release {})", fqdn, ip, fqdn)
            }
            CompensatableAction::DiskCreated { pool, name } => {
                write!(f, "disk {}/{} (rbd -p {} rm {})", pool, name, pool, name)
            }
            CompensatableAction::VmDefinitionWritten { vmid, path } => {
                write!(f, "VM definition {} at {}", vmid, path)
            }
            CompensatableAction::VmStarted { vmid, node } => {
                write!(f, "running VM {} on {} (qm stop {})", vmid, node, vmid)
            }
            CompensatableAction::Unconfirmed(action) => write!(f, "possibly {}", action),
        }
    }
}

/// Fixed parameters of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub cluster_manager_role: Regex,
    pub compute_role: Regex,
    /// Hypervisor node name of the compute host.
    pub node: String,
    pub storage: StorageConfig,
    pub vm_ids: VmIdRange,
    pub id_attempts: u32,
    pub admin_pubkey_path: PathBuf,
    /// known_hosts on the cluster manager.
    pub known_hosts: String,
    pub command_timeout: Duration,
    pub import_timeout: Duration,
    pub post_install_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ProvisionerConfig) -> Result<Self, ProvisionError> {
        let role = |target: RemoteTarget, pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| ProvisionError::Config(format!("{} role_pattern: {}", target, e)))
        };

        Ok(Self {
            cluster_manager_role: role(
                RemoteTarget::ClusterManager,
                config
                    .cluster_manager
                    .role_pattern(RemoteTarget::ClusterManager),
            )?,
            compute_role: role(
                RemoteTarget::Compute,
                config.compute.role_pattern(RemoteTarget::Compute),
            )?,
            node: config.hypervisor.node.clone(),
            storage: config.storage.clone(),
            vm_ids: VmIdRange::new(config.vm.id_min, config.vm.id_max),
            id_attempts: config.vm.id_attempts,
            admin_pubkey_path: config.vm.admin_pubkey_path.clone(),
            known_hosts: config.paths.known_hosts.clone(),
            command_timeout: Duration::from_secs(120),
            import_timeout: Duration::from_secs(1800),
            post_install_timeout: Duration::from_secs(3600),
        })
    }
}

/// Collaborators of the orchestrator.
pub struct Services {
    pub remote: Arc<dyn RemoteExecutor>,
    pub network: Arc<dyn NetworkIdentity>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub builder: ConfigBuilder,
    pub boot: BootMonitor,
    pub progress: Arc<dyn ProgressReporter>,
    pub settings: OrchestratorSettings,
    /// VM ids picked by runs still in flight, not yet visible to the hypervisor.
    reserved_ids: Mutex<HashSet<u32>>,
}

impl Services {
    pub fn new(
        remote: Arc<dyn RemoteExecutor>,
        network: Arc<dyn NetworkIdentity>,
        hypervisor: Arc<dyn Hypervisor>,
        builder: ConfigBuilder,
        boot: BootMonitor,
        progress: Arc<dyn ProgressReporter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            remote,
            network,
            hypervisor,
            builder,
            boot,
            progress,
            settings,
            reserved_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn reserved_ids(&self) -> Vec<u32> {
        self.reserved_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Draw a VM id outside `live` and every id held by another run, and
    /// hold it until [`Services::release_id`].
    ///
    /// The draw happens under the reservation lock, so two runs can never
    /// pick the same id.
    pub fn reserve_vmid<R: Rng + ?Sized>(
        &self,
        live: &HashSet<u32>,
        rng: &mut R,
    ) -> Result<u32, ProvisionError> {
        let mut ids = self
            .reserved_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let taken: HashSet<u32> = live.union(&ids).copied().collect();
        let vmid = identity::allocate_vmid(
            self.settings.vm_ids,
            &taken,
            self.settings.id_attempts,
            rng,
        )?;
        ids.insert(vmid);
        Ok(vmid)
    }

    pub fn release_id(&self, vmid: u32) {
        let mut ids = self
            .reserved_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&vmid);
    }
}

/// Boot results kept for the summary.
#[derive(Debug, Clone)]
pub struct BootReport {
    pub elapsed: Duration,
    pub fingerprints: Vec<Fingerprint>,
}

/// Mutable state threaded through the steps.
pub struct ProvisionContext<'a> {
    pub services: &'a Services,
    pub options: &'a VmCreationOptions,
    pub cancel: &'a CancellationToken,
    pub image: Option<&'static ImageSpec>,
    pub admin_keys: String,
    pub binding: Option<IpBinding>,
    pub identity: Option<VmIdentity>,
    pub rendered: Option<RenderedConfig>,
    pub boot: Option<BootReport>,
    pub ledger: Vec<CompensatableAction>,
    /// Temporary files removed at the end of the run.
    pub scratch: Vec<(RemoteTarget, String)>,
}

impl<'a> ProvisionContext<'a> {
    pub fn new(
        services: &'a Services,
        options: &'a VmCreationOptions,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            services,
            options,
            cancel,
            image: None,
            admin_keys: String::new(),
            binding: None,
            identity: None,
            rendered: None,
            boot: None,
            ledger: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn image(&self) -> Result<&'static ImageSpec, ProvisionError> {
        self.image
            .ok_or_else(|| ProvisionError::Internal("image not resolved".to_string()))
    }

    pub fn binding(&self) -> Result<&IpBinding, ProvisionError> {
        self.binding
            .as_ref()
            .ok_or_else(|| ProvisionError::Internal("network binding not set".to_string()))
    }

    pub fn identity(&self) -> Result<&VmIdentity, ProvisionError> {
        self.identity
            .as_ref()
            .ok_or_else(|| ProvisionError::Internal("VM identity not built".to_string()))
    }

    pub fn rendered(&self) -> Result<&RenderedConfig, ProvisionError> {
        self.rendered
            .as_ref()
            .ok_or_else(|| ProvisionError::Internal("configuration not rendered".to_string()))
    }

    pub fn remote(&self) -> &'a dyn RemoteExecutor {
        self.services.remote.as_ref()
    }

    pub fn settings(&self) -> &'a OrchestratorSettings {
        &self.services.settings
    }

    /// Write a temporary file that is removed when the run ends.
    pub async fn write_scratch(
        &mut self,
        target: RemoteTarget,
        path: String,
        contents: &[u8],
    ) -> Result<(), ProvisionError> {
        self.scratch.push((target, path.clone()));
        self.services
            .remote
            .write_file(target, &path, contents)
            .await?;
        Ok(())
    }
}
