//! One [`ProvisionStep`] per orchestrator state.

use super::context::{BootReport, CompensatableAction, ProvisionContext};
use super::{ProvisionState, Transition};
use crate::fingerprint;
use crate::identity::VmIdentity;
use crate::images;
use crate::provisioner::{ProvisionError, ResultExt};
use crate::remote::commands::{self, RemotePaths};
use crate::remote::{verify_role, RemoteTarget};
use crate::tasks::RemoteTask;
use crate::workflow::{run_tasks, TaskExecutor};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;

#[async_trait]
pub trait ProvisionStep: Send + Sync {
    fn state(&self) -> ProvisionState;

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError>;
}

/// The step handling `state`.
pub fn step_for(state: ProvisionState) -> &'static dyn ProvisionStep {
    match state {
        ProvisionState::Validating => &Validate,
        ProvisionState::AllocatingNetwork => &AllocateNetwork,
        ProvisionState::BuildingIdentity => &BuildIdentity,
        ProvisionState::CreatingDisks => &CreateDisks,
        ProvisionState::UploadingConfig => &UploadConfig,
        ProvisionState::ImportingImage => &ImportImage,
        ProvisionState::Booting => &Boot,
        ProvisionState::AwaitingFirstBoot => &AwaitFirstBoot,
        ProvisionState::RunningPostInstall => &RunPostInstall,
        ProvisionState::Complete => &Complete,
    }
}

fn report(ctx: &ProvisionContext<'_>, state: ProvisionState, done: u32, total: u32, msg: &str) {
    let start = state.progress();
    let end = state.next().map(|s| s.progress()).unwrap_or(100);
    let pct = start + (end - start) * done / total.max(1);
    ctx.services.progress.emit_detailed(
        pct,
        msg.to_string(),
        Some(state.to_string()),
        None,
    );
}

pub struct Validate;

#[async_trait]
impl ProvisionStep for Validate {
    fn state(&self) -> ProvisionState {
        ProvisionState::Validating
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let options = ctx.options;

        // Local checks first: nothing remote runs for a bad request
        let image = images::lookup(&options.image)?;
        if options.fqdn.trim().is_empty() || options.fqdn.contains(char::is_whitespace) {
            return Err(ProvisionError::Validation(format!(
                "invalid hostname '{}'",
                options.fqdn
            )));
        }
        if options.cores == 0 || options.ram_mb == 0 || options.disk_gb == 0 {
            return Err(ProvisionError::Validation(
                "cores, RAM and disk size must be greater than zero".to_string(),
            ));
        }
        if options.resource_pool.trim().is_empty() {
            return Err(ProvisionError::Validation(
                "no resource pool selected".to_string(),
            ));
        }
        ctx.image = Some(image);

        let settings = ctx.settings();
        let admin_keys = tokio::fs::read_to_string(&settings.admin_pubkey_path)
            .await
            .map_err(|e| {
                ProvisionError::Config(format!(
                    "Cannot read administrative public key {}: {}",
                    settings.admin_pubkey_path.display(),
                    e
                ))
            })?;

        verify_role(
            ctx.remote(),
            RemoteTarget::ClusterManager,
            &settings.cluster_manager_role,
        )
        .await
        .context("Verifying cluster manager host")?;
        verify_role(ctx.remote(), RemoteTarget::Compute, &settings.compute_role)
            .await
            .context("Verifying compute host")?;

        let image_path = image.image_path(&settings.storage.template_dir_cm);
        let exists = ctx
            .remote()
            .file_exists(RemoteTarget::ClusterManager, &image_path)
            .await
            .context("Checking base image")?;
        if !exists {
            return Err(ProvisionError::Validation(format!(
                "base image {} not found on the cluster manager",
                image_path
            )));
        }

        ctx.admin_keys = admin_keys;
        tracing::info!(
            "[Orchestrator] Validated request for {} ({}, {} cores, {} MB RAM, {} GB disk, reinstall: {})",
            options.fqdn,
            image.id,
            options.cores,
            options.ram_mb,
            options.disk_gb,
            options.reinstall
        );
        Ok(Transition::Next(ProvisionState::AllocatingNetwork))
    }
}

pub struct AllocateNetwork;

#[async_trait]
impl ProvisionStep for AllocateNetwork {
    fn state(&self) -> ProvisionState {
        ProvisionState::AllocatingNetwork
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let fqdn = ctx.options.fqdn.clone();
        let network = ctx.services.network.clone();

        let existing = network
            .lookup(&fqdn)
            .await
            .context("Looking up existing DNS entries")?;
        tracing::info!(
            "[Orchestrator] Existing addresses of {}: {:?}",
            fqdn,
            existing.addresses()
        );

        if existing.is_ambiguous() {
            return Err(ProvisionError::AmbiguousBinding {
                fqdn,
                ipv4: existing.ipv4.len(),
                ipv6: existing.ipv6.len(),
            });
        }

        if ctx.options.reinstall {
            let binding = existing
                .single(&fqdn, network.subnet_name())
                .ok_or_else(|| ProvisionError::MissingBinding { fqdn: fqdn.clone() })?;
            tracing::info!(
                "[Orchestrator] Reinstall keeps {} / {} for {}",
                binding.ipv4,
                binding.ipv6,
                fqdn
            );
            ctx.binding = Some(binding);
            return Ok(Transition::Next(ProvisionState::BuildingIdentity));
        }

        if !existing.is_empty() {
            return Err(ProvisionError::AlreadyBound {
                fqdn,
                addresses: existing.addresses(),
            });
        }

        match network.allocate(&fqdn).await {
            Ok(binding) => {
                ctx.ledger.push(CompensatableAction::DnsRecord {
                    fqdn: fqdn.clone(),
                    ip: IpAddr::V4(binding.ipv4),
                });
                ctx.ledger.push(CompensatableAction::DnsRecord {
                    fqdn: fqdn.clone(),
                    ip: IpAddr::V6(binding.ipv6),
                });
                ctx.binding = Some(binding);
                Ok(Transition::Next(ProvisionState::BuildingIdentity))
            }
            Err(e) => {
                if let netcenter::NetcenterError::PartialRegistration {
                    fqdn, registered, ..
                } = &e
                {
                    ctx.ledger.push(CompensatableAction::DnsRecord {
                        fqdn: fqdn.clone(),
                        ip: *registered,
                    });
                }
                Err(e).context("Registering DNS entries")
            }
        }
    }
}

pub struct BuildIdentity;

#[async_trait]
impl ProvisionStep for BuildIdentity {
    fn state(&self) -> ProvisionState {
        ProvisionState::BuildingIdentity
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let live: HashSet<u32> = ctx
            .services
            .hypervisor
            .vm_ids()
            .await
            .context("Listing cluster VM ids")?;
        let vmid = ctx.services.reserve_vmid(&live, &mut rand::thread_rng())?;

        // Set before rendering so the reservation is released however the run ends
        ctx.identity = Some(VmIdentity::new(vmid, &ctx.options.fqdn));
        let identity = ctx.identity()?;
        tracing::info!(
            "[Orchestrator] VM id {} and MAC {} for {}",
            identity.vmid,
            identity.mac,
            identity.fqdn
        );

        let rendered = ctx
            .services
            .builder
            .render(
                ctx.options,
                ctx.image()?,
                identity,
                ctx.binding()?,
                &ctx.admin_keys,
            )
            .context("Rendering VM configuration")?;

        ctx.rendered = Some(rendered);
        Ok(Transition::Next(ProvisionState::CreatingDisks))
    }
}

pub struct CreateDisks;

#[async_trait]
impl ProvisionStep for CreateDisks {
    fn state(&self) -> ProvisionState {
        ProvisionState::CreatingDisks
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let settings = ctx.settings();
        let storage = &settings.storage;
        let disks = ctx.identity()?.disks.clone();

        let tasks = vec![
            RemoteTask::new(
                "Create swap disk",
                RemoteTarget::Compute,
                commands::create_block_disk(&storage.pool, &storage.swap_size, &disks.swap),
            )
            .with_timeout(settings.command_timeout)
            .leaving(CompensatableAction::DiskCreated {
                pool: storage.pool.clone(),
                name: disks.swap.clone(),
            }),
            RemoteTask::new(
                "Create EFI disk",
                RemoteTarget::Compute,
                commands::create_block_disk(&storage.pool, &storage.efi_size, &disks.efi),
            )
            .with_timeout(settings.command_timeout)
            .leaving(CompensatableAction::DiskCreated {
                pool: storage.pool.clone(),
                name: disks.efi.clone(),
            }),
        ];

        run_step_tasks(ctx, ProvisionState::CreatingDisks, &tasks).await?;
        Ok(Transition::Next(ProvisionState::UploadingConfig))
    }
}

pub struct UploadConfig;

#[async_trait]
impl ProvisionStep for UploadConfig {
    fn state(&self) -> ProvisionState {
        ProvisionState::UploadingConfig
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let vmid = ctx.identity()?.vmid;
        let rendered = ctx.rendered()?.clone();
        let paths = RemotePaths::new(vmid);

        report(ctx, ProvisionState::UploadingConfig, 0, 3, "Uploading authorized keys");
        ctx.write_scratch(
            RemoteTarget::Compute,
            paths.authorized_keys(),
            rendered.authorized_keys.as_bytes(),
        )
        .await
        .context("Uploading authorized keys")?;

        report(ctx, ProvisionState::UploadingConfig, 1, 3, "Uploading cloud-init fragment");
        ctx.write_scratch(
            RemoteTarget::Compute,
            paths.cloud_init_tail(),
            format!("{}\n", rendered.cloud_init).as_bytes(),
        )
        .await
        .context("Uploading cloud-init fragment")?;

        report(ctx, ProvisionState::UploadingConfig, 2, 3, "Uploading VM definition");
        let written = ctx
            .remote()
            .write_file(
                RemoteTarget::Compute,
                &paths.vm_config(),
                rendered.vm_config.as_bytes(),
            )
            .await;
        let action = CompensatableAction::VmDefinitionWritten {
            vmid,
            path: paths.vm_config(),
        };
        match written {
            Ok(()) => ctx.ledger.push(action),
            Err(e) => {
                // A failed upload may still have created a partial file
                ctx.ledger.push(action.unconfirmed());
                return Err(e).context("Uploading VM definition");
            }
        }

        Ok(Transition::Next(ProvisionState::ImportingImage))
    }
}

pub struct ImportImage;

#[async_trait]
impl ProvisionStep for ImportImage {
    fn state(&self) -> ProvisionState {
        ProvisionState::ImportingImage
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let settings = ctx.settings();
        let storage = &settings.storage;
        let identity = ctx.identity()?.clone();
        let rendered = ctx.rendered()?;
        let image = ctx.image()?;
        let paths = RemotePaths::new(identity.vmid);
        let vm_config = paths.vm_config();
        let timeout = settings.command_timeout;

        // Network stanzas go last: `qm set` rewrites the definition file
        let tasks = vec![
            RemoteTask::new(
                "Import base image",
                RemoteTarget::Compute,
                commands::import_disk(
                    identity.vmid,
                    &image.image_path(&storage.template_dir_compute),
                    &storage.pool,
                ),
            )
            .with_timeout(settings.import_timeout)
            .leaving(CompensatableAction::DiskCreated {
                pool: storage.pool.clone(),
                name: identity.disks.root.clone(),
            }),
            RemoteTask::new(
                "Attach root disk",
                RemoteTarget::Compute,
                commands::attach_root_disk(identity.vmid, &storage.pool, &identity.disks.root),
            )
            .with_timeout(timeout),
            RemoteTask::new(
                "Resize root disk",
                RemoteTarget::Compute,
                commands::resize_root_disk(identity.vmid, ctx.options.disk_gb),
            )
            .with_timeout(timeout),
            RemoteTask::new(
                "Append cloud-init fragment",
                RemoteTarget::Compute,
                commands::append_file(&paths.cloud_init_tail(), &vm_config),
            )
            .with_timeout(timeout),
            RemoteTask::new(
                "Create cloud-init disk",
                RemoteTarget::Compute,
                commands::attach_cloud_init_disk(identity.vmid, &storage.pool),
            )
            .with_timeout(timeout),
            RemoteTask::new(
                "Inject SSH keys",
                RemoteTarget::Compute,
                commands::set_ssh_keys(identity.vmid, &paths.authorized_keys()),
            )
            .with_timeout(timeout),
            RemoteTask::new(
                "Append network interface",
                RemoteTarget::Compute,
                commands::append_line(&rendered.net0, &vm_config),
            )
            .with_timeout(timeout),
        ];

        run_step_tasks(ctx, ProvisionState::ImportingImage, &tasks).await?;
        Ok(Transition::Next(ProvisionState::Booting))
    }
}

pub struct Boot;

#[async_trait]
impl ProvisionStep for Boot {
    fn state(&self) -> ProvisionState {
        ProvisionState::Booting
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let settings = ctx.settings();
        let vmid = ctx.identity()?.vmid;
        let tasks = vec![RemoteTask::new(
            "Start VM",
            RemoteTarget::Compute,
            commands::start_vm(vmid),
        )
        .with_timeout(settings.command_timeout)
        .leaving(CompensatableAction::VmStarted {
            vmid,
            node: settings.node.clone(),
        })];

        run_step_tasks(ctx, ProvisionState::Booting, &tasks).await?;

        let vm = ctx
            .services
            .hypervisor
            .vm_status(&settings.node, vmid)
            .await
            .context(format!("Checking status of VM {}", vmid))?;
        if vm.status != "running" {
            return Err(ProvisionError::Hypervisor(format!(
                "VM {} on {} is '{}' right after start",
                vmid, settings.node, vm.status
            )));
        }
        tracing::info!("[Orchestrator] VM {} is running on {}", vmid, settings.node);

        Ok(Transition::Next(ProvisionState::AwaitingFirstBoot))
    }
}

pub struct AwaitFirstBoot;

#[async_trait]
impl ProvisionStep for AwaitFirstBoot {
    fn state(&self) -> ProvisionState {
        ProvisionState::AwaitingFirstBoot
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let settings = ctx.settings();
        let image = ctx.image()?;
        let binding = ctx.binding()?.clone();
        let paths = RemotePaths::new(ctx.identity()?.vmid);
        let marker = image.marker_regex()?;

        let outcome = ctx
            .services
            .boot
            .await_first_boot(
                ctx.remote(),
                RemoteTarget::Compute,
                &paths.serial_console(),
                &marker,
                ctx.cancel,
            )
            .await;

        // The console log is kept on the cluster manager for audit either way
        let log = outcome.log_text();
        let persisted = ctx
            .remote()
            .write_file(
                RemoteTarget::ClusterManager,
                &paths.boot_log(),
                log.as_bytes(),
            )
            .await;

        match (&outcome.status, persisted) {
            (Ok(_), Err(e)) => return Err(e).context("Saving boot log"),
            (Err(_), Err(e)) => {
                tracing::warn!("[Orchestrator] Could not save partial boot log: {}", e)
            }
            (_, Ok(())) => tracing::info!(
                "[Orchestrator] Boot log ({} lines) saved to {}:{}",
                outcome.lines.len(),
                RemoteTarget::ClusterManager,
                paths.boot_log()
            ),
        }
        outcome.status.context("Waiting for first boot")?;

        let keys = fingerprint::extract_host_keys(&log).context("Reading host keys")?;
        let ed25519 = fingerprint::select_ed25519(&keys)
            .context("Reading host keys")?
            .clone();
        let fingerprints = fingerprint::fingerprint_all(&keys).context("Fingerprinting host keys")?;

        // Stale entries for recycled addresses would make ssh refuse the new key
        for ip in [IpAddr::V4(binding.ipv4), IpAddr::V6(binding.ipv6)] {
            let command = commands::forget_known_host(&settings.known_hosts, &ip.to_string());
            if let Err(e) = ctx.remote().run(RemoteTarget::ClusterManager, &command).await {
                tracing::warn!("[Orchestrator] Could not purge known_hosts entry for {}: {}", ip, e);
            }
        }
        let entry =
            fingerprint::known_hosts_entry(&binding.fqdn, binding.ipv4, binding.ipv6, &ed25519);
        ctx.remote()
            .run_checked(
                RemoteTarget::ClusterManager,
                &commands::append_line(&entry, &settings.known_hosts),
            )
            .await
            .context("Updating known_hosts")?;

        ctx.boot = Some(BootReport {
            elapsed: outcome.elapsed,
            fingerprints,
        });
        Ok(Transition::Next(ProvisionState::RunningPostInstall))
    }
}

pub struct RunPostInstall;

#[async_trait]
impl ProvisionStep for RunPostInstall {
    fn state(&self) -> ProvisionState {
        ProvisionState::RunningPostInstall
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let settings = ctx.settings();
        let image = ctx.image()?;
        let ipv4 = IpAddr::V4(ctx.binding()?.ipv4);
        let paths = RemotePaths::new(ctx.identity()?.vmid);
        let script = ctx.rendered()?.post_install.clone();
        let script_on_vm = paths.post_install_script_on_vm(image.login_user);

        ctx.write_scratch(
            RemoteTarget::ClusterManager,
            paths.post_install_script(),
            script.as_bytes(),
        )
        .await
        .context("Staging post-install script")?;

        let tasks = vec![
            RemoteTask::new(
                "Copy post-install script",
                RemoteTarget::ClusterManager,
                commands::copy_to_vm(
                    &paths.post_install_script(),
                    image.login_user,
                    ipv4,
                    &script_on_vm,
                ),
            )
            .with_timeout(settings.command_timeout),
            RemoteTask::new(
                "Run post-install script",
                RemoteTarget::ClusterManager,
                commands::run_post_install(
                    image.login_user,
                    ipv4,
                    &script_on_vm,
                    &paths.post_install_log(),
                ),
            )
            .with_timeout(settings.post_install_timeout),
        ];

        run_step_tasks(ctx, ProvisionState::RunningPostInstall, &tasks).await?;
        tracing::info!(
            "[Orchestrator] Post-install log kept at {}:{}",
            RemoteTarget::ClusterManager,
            paths.post_install_log()
        );
        Ok(Transition::Next(ProvisionState::Complete))
    }
}

pub struct Complete;

#[async_trait]
impl ProvisionStep for Complete {
    fn state(&self) -> ProvisionState {
        ProvisionState::Complete
    }

    async fn run(&self, ctx: &mut ProvisionContext<'_>) -> Result<Transition, ProvisionError> {
        let vmid = ctx.identity()?.vmid;
        ctx.services
            .hypervisor
            .add_to_pool(&ctx.options.resource_pool, vmid)
            .await
            .context(format!("Adding VM to pool {}", ctx.options.resource_pool))?;
        Ok(Transition::Done)
    }
}

async fn run_step_tasks(
    ctx: &mut ProvisionContext<'_>,
    state: ProvisionState,
    tasks: &[RemoteTask],
) -> Result<(), ProvisionError> {
    let services = ctx.services;
    let executor = TaskExecutor::new(services.remote.as_ref());
    let progress = services.progress.clone();
    let start = state.progress();
    let end = state.next().map(|s| s.progress()).unwrap_or(100);
    let phase = state.to_string();

    run_tasks(tasks, &executor, &mut ctx.ledger, start, end, |pct, msg| {
        progress.emit_detailed(pct, msg.to_string(), Some(phase.clone()), None)
    })
    .await
}
