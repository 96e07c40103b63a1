//! Provisioning state machine.
//!
//! One run walks the states of [`ProvisionState`] in order. Each state is
//! handled by a [`steps::ProvisionStep`]; the first failing step ends the run
//! with a [`ProvisionFailure`] naming the state and the remote state left
//! behind. Nothing is rolled back automatically.

pub mod context;
pub mod steps;

pub use context::{
    BootReport, CompensatableAction, OrchestratorSettings, ProvisionContext, Services,
};

use crate::boot_monitor::{BootMonitor, BootSettings};
use crate::builder::ConfigBuilder;
use crate::config::ProvisionerConfig;
use crate::fingerprint::Fingerprint;
use crate::identity::DiskSet;
use crate::provisioner::{ProgressReporter, ProvisionError};
use crate::pve::PveClient;
use crate::remote::SshExecutor;
use crate::render::TemplateRenderer;
use crate::request::VmCreationOptions;
use async_trait::async_trait;
use netcenter::{NetcenterClient, NetworkAllocator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Orchestrator states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvisionState {
    Validating,
    AllocatingNetwork,
    BuildingIdentity,
    CreatingDisks,
    UploadingConfig,
    ImportingImage,
    Booting,
    AwaitingFirstBoot,
    RunningPostInstall,
    Complete,
}

impl ProvisionState {
    pub const ALL: [ProvisionState; 10] = [
        ProvisionState::Validating,
        ProvisionState::AllocatingNetwork,
        ProvisionState::BuildingIdentity,
        ProvisionState::CreatingDisks,
        ProvisionState::UploadingConfig,
        ProvisionState::ImportingImage,
        ProvisionState::Booting,
        ProvisionState::AwaitingFirstBoot,
        ProvisionState::RunningPostInstall,
        ProvisionState::Complete,
    ];

    /// Progress percentage reported when the state is entered.
    pub fn progress(&self) -> u32 {
        match self {
            ProvisionState::Validating => 5,
            ProvisionState::AllocatingNetwork => 10,
            ProvisionState::BuildingIdentity => 15,
            ProvisionState::CreatingDisks => 20,
            ProvisionState::UploadingConfig => 30,
            ProvisionState::ImportingImage => 40,
            ProvisionState::Booting => 55,
            ProvisionState::AwaitingFirstBoot => 60,
            ProvisionState::RunningPostInstall => 85,
            ProvisionState::Complete => 95,
        }
    }

    pub fn next(&self) -> Option<ProvisionState> {
        let index = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(index + 1).copied()
    }
}

impl std::fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionState::Validating => "Validating",
            ProvisionState::AllocatingNetwork => "AllocatingNetwork",
            ProvisionState::BuildingIdentity => "BuildingIdentity",
            ProvisionState::CreatingDisks => "CreatingDisks",
            ProvisionState::UploadingConfig => "UploadingConfig",
            ProvisionState::ImportingImage => "ImportingImage",
            ProvisionState::Booting => "Booting",
            ProvisionState::AwaitingFirstBoot => "AwaitingFirstBoot",
            ProvisionState::RunningPostInstall => "RunningPostInstall",
            ProvisionState::Complete => "Complete",
        };
        f.write_str(s)
    }
}

/// What a step asks the state machine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(ProvisionState),
    Done,
}

/// The aborted terminal state.
#[derive(Debug)]
pub struct ProvisionFailure {
    pub fqdn: String,
    /// State the run was in when it failed.
    pub state: ProvisionState,
    pub error: ProvisionError,
    /// Remote state created before the failure, oldest first.
    pub left_behind: Vec<CompensatableAction>,
}

impl std::fmt::Display for ProvisionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Failed to provision {}: {}: {}",
            self.fqdn, self.state, self.error
        )
    }
}

impl std::error::Error for ProvisionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Summary of a finished VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedVm {
    pub vmid: u32,
    pub node: String,
    pub fqdn: String,
    pub pool: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub image: String,
    pub login_user: String,
    pub cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub disks: DiskSet,
    pub fingerprints: Vec<Fingerprint>,
    pub boot_duration: Duration,
}

impl std::fmt::Display for ProvisionedVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "VM ID: {}", self.vmid)?;
        writeln!(f, "Node: {}", self.node)?;
        writeln!(f, "SSH: {}@{}", self.login_user, self.fqdn)?;
        writeln!(f, "IPv4: {}", self.ipv4)?;
        writeln!(f, "IPv6: {}", self.ipv6)?;
        writeln!(f, "Image: {}", self.image)?;
        writeln!(f, "CPU: {} cores", self.cores)?;
        writeln!(f, "RAM: {} MB", self.ram_mb)?;
        writeln!(f, "Disk: {} GB", self.disk_gb)?;
        writeln!(f, "Fingerprints:")?;
        for fp in &self.fingerprints {
            writeln!(f, "  {}", fp)?;
        }
        Ok(())
    }
}

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// One async mutex per hostname, dropped from the map with its last user.
#[derive(Default)]
pub struct HostLocks {
    locks: LockMap,
}

/// Holds the lock of one hostname.
pub struct HostGuard {
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    key: String,
    locks: LockMap,
}

impl HostLocks {
    pub async fn lock_owned(&self, fqdn: &str) -> HostGuard {
        let key = fqdn.to_ascii_lowercase();
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        HostGuard {
            guard: Some(lock.lock_owned().await),
            key,
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        // Map lock first, so nobody clones the entry between release and check
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(self.guard.take());
        let idle = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.key);
        }
    }
}

/// Provisions VMs from creation options.
#[async_trait]
pub trait VmProvisioner: Send + Sync {
    async fn provision(
        &self,
        options: &VmCreationOptions,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedVm, ProvisionFailure>;
}

pub struct Orchestrator {
    services: Services,
    host_locks: HostLocks,
}

impl Orchestrator {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            host_locks: HostLocks::default(),
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(
        config: &ProvisionerConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self, ProvisionError> {
        tracing::info!("[Orchestrator] Initializing...");

        let renderer = match &config.paths.templates_dir {
            Some(dir) => TemplateRenderer::new(dir.clone())?,
            None => TemplateRenderer::from_embedded()?,
        };
        let subnet = config
            .netcenter
            .subnet
            .parse()
            .map_err(|e| ProvisionError::Config(e.to_string()))?;
        let netcenter = NetcenterClient::new(&config.netcenter)
            .map_err(|e| ProvisionError::Config(e.to_string()))?;

        let services = Services::new(
            Arc::new(SshExecutor::new(
                config.cluster_manager.clone(),
                config.compute.clone(),
                config.paths.ssh_control_dir.clone(),
            )),
            Arc::new(NetworkAllocator::new(netcenter, subnet)),
            Arc::new(PveClient::new(&config.hypervisor)?),
            ConfigBuilder::new(renderer, config.network.clone(), config.storage.clone()),
            BootMonitor::new(BootSettings {
                timeout: config.boot.timeout(),
                heartbeat: config.boot.heartbeat(),
            }),
            progress,
            OrchestratorSettings::from_config(config)?,
        );
        Ok(Self::new(services))
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    async fn run_states(
        &self,
        ctx: &mut ProvisionContext<'_>,
    ) -> Result<(), (ProvisionState, ProvisionError)> {
        let mut state = ProvisionState::Validating;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err((state, ProvisionError::Cancelled));
            }

            let step = steps::step_for(state);
            self.services.progress.emit_detailed(
                state.progress(),
                format!("{}: {}", ctx.options.fqdn, state),
                Some(state.to_string()),
                None,
            );
            tracing::info!("[Orchestrator] {}: {}", ctx.options.fqdn, state);

            let started = Instant::now();
            let result = step.run(ctx).await;
            let elapsed = started.elapsed();

            match result {
                Ok(transition) => {
                    tracing::info!(
                        "[TIMING] Step {} completed in {}ms",
                        step.state(),
                        elapsed.as_millis()
                    );
                    match transition {
                        Transition::Next(next) => state = next,
                        Transition::Done => return Ok(()),
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "[TIMING] Step {} failed after {}ms",
                        step.state(),
                        elapsed.as_millis()
                    );
                    return Err((state, e));
                }
            }
        }
    }

    /// Remove uploaded scratch files; failures are only logged.
    async fn remove_scratch(&self, ctx: &ProvisionContext<'_>) {
        for (target, path) in &ctx.scratch {
            if let Err(e) = self.services.remote.remove_file(*target, path).await {
                tracing::warn!("[Orchestrator] Could not remove {}:{}: {}", target, path, e);
            }
        }
    }

    fn summary(&self, ctx: &ProvisionContext<'_>) -> Result<ProvisionedVm, ProvisionError> {
        let image = ctx.image()?;
        let binding = ctx.binding()?;
        let identity = ctx.identity()?;
        let boot = ctx
            .boot
            .as_ref()
            .ok_or_else(|| ProvisionError::Internal("boot report missing".to_string()))?;

        Ok(ProvisionedVm {
            vmid: identity.vmid,
            node: self.services.settings.node.clone(),
            fqdn: identity.fqdn.clone(),
            pool: ctx.options.resource_pool.clone(),
            ipv4: binding.ipv4,
            ipv6: binding.ipv6,
            image: image.id.to_string(),
            login_user: image.login_user.to_string(),
            cores: ctx.options.cores,
            ram_mb: ctx.options.ram_mb,
            disk_gb: ctx.options.disk_gb,
            disks: identity.disks.clone(),
            fingerprints: boot.fingerprints.clone(),
            boot_duration: boot.elapsed,
        })
    }
}

#[async_trait]
impl VmProvisioner for Orchestrator {
    async fn provision(
        &self,
        options: &VmCreationOptions,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedVm, ProvisionFailure> {
        let _host = self.host_locks.lock_owned(&options.fqdn).await;
        let run_start = Instant::now();
        let mut ctx = ProvisionContext::new(&self.services, options, cancel);

        let outcome = match self.run_states(&mut ctx).await {
            Ok(()) => self
                .summary(&ctx)
                .map_err(|e| (ProvisionState::Complete, e)),
            Err(failed) => Err(failed),
        };

        self.remove_scratch(&ctx).await;
        if let Some(identity) = &ctx.identity {
            self.services.release_id(identity.vmid);
        }

        match outcome {
            Ok(vm) => {
                self.services.progress.emit(100, format!("{} is ready", vm.fqdn));
                tracing::info!(
                    "[TIMING] Provisioning {} completed in {}ms",
                    vm.fqdn,
                    run_start.elapsed().as_millis()
                );
                tracing::info!("[Orchestrator] VM created:\n{}", vm);
                Ok(vm)
            }
            Err((state, error)) => {
                let failure = ProvisionFailure {
                    fqdn: options.fqdn.clone(),
                    state,
                    error,
                    left_behind: std::mem::take(&mut ctx.ledger),
                };
                tracing::error!("[Orchestrator] {} ({})", failure, failure.error.kind());
                if failure.left_behind.is_empty() {
                    tracing::info!("[Orchestrator] No remote state was left behind");
                } else {
                    tracing::warn!(
                        "[Orchestrator] {} item(s) left behind, remove manually:",
                        failure.left_behind.len()
                    );
                    for action in failure.left_behind.iter().rev() {
                        tracing::warn!("[Orchestrator]   {}", action);
                    }
                }
                Err(failure)
            }
        }
    }
}
