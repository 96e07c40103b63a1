//! End-to-end orchestrator runs against recording fakes of the cluster nodes,
//! the IPAM service and the hypervisor API.

use async_trait::async_trait;
use netcenter::{ExistingBindings, IpBinding, NetcenterError, NetworkIdentity};
use provision::boot_monitor::{BootMonitor, BootSettings};
use provision::builder::ConfigBuilder;
use provision::config::{NetworkConfig, StorageConfig};
use provision::identity::VmIdRange;
use provision::orchestrator::{OrchestratorSettings, ProvisionState, Services};
use provision::pve::{ClusterVm, DeleteOptions, Hypervisor, NodeVm};
use provision::remote::{CommandOutput, LineStream, RemoteError, RemoteExecutor, RemoteTarget};
use provision::{
    CompensatableAction, ErrorKind, Orchestrator, ProgressReporter, ProvisionError,
    TemplateRenderer, VmCreationOptions, VmProvisioner,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use std::collections::HashSet;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ED25519: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";
const NODE: &str = "comp-epyc-lee-3";

fn console_with_keys() -> Vec<String> {
    vec![
        "[    0.000000] Linux version 6.8.0-31-generic".to_string(),
        "[   12.100000] cloud-init[812]: Generating public/private ed25519 key pair.".to_string(),
        "-----BEGIN SSH HOST KEY KEYS-----".to_string(),
        format!("ssh-ed25519 {} root@testvm", ED25519),
        "-----END SSH HOST KEY KEYS-----".to_string(),
        "[   31.400000] cloud-init[990]: Cloud-init v. 24.1.3 finished at Mon, 01 Jul 2024 10:00:00 +0000. Up 31.38 seconds".to_string(),
    ]
}

#[derive(Default)]
struct ExecLog {
    commands: Vec<(RemoteTarget, String)>,
    probes: Vec<(RemoteTarget, String)>,
    writes: Vec<(RemoteTarget, String, String)>,
    removed: Vec<(RemoteTarget, String)>,
}

/// Remote executor that records everything and answers like healthy nodes.
struct FakeCluster {
    log: Mutex<ExecLog>,
    console: Vec<String>,
    /// Keep the console stream open after the scripted lines.
    hold_console: bool,
    /// Commands containing this never return.
    hang_on: Option<&'static str>,
    held: Mutex<Vec<mpsc::Sender<Result<String, RemoteError>>>>,
}

impl FakeCluster {
    fn new(console: Vec<String>) -> Self {
        Self {
            log: Mutex::new(ExecLog::default()),
            console,
            hold_console: false,
            hang_on: None,
            held: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<(RemoteTarget, String)> {
        self.log.lock().unwrap().commands.clone()
    }

    fn position(&self, needle: &str) -> usize {
        self.commands()
            .iter()
            .position(|(_, c)| c.contains(needle))
            .unwrap_or_else(|| panic!("no command containing {:?}", needle))
    }

    fn written(&self, path: &str) -> Option<(RemoteTarget, String)> {
        self.log
            .lock()
            .unwrap()
            .writes
            .iter()
            .find(|(_, p, _)| p == path)
            .map(|(t, _, c)| (*t, c.clone()))
    }
}

#[async_trait]
impl RemoteExecutor for FakeCluster {
    async fn run(&self, target: RemoteTarget, command: &str) -> Result<CommandOutput, RemoteError> {
        self.log
            .lock()
            .unwrap()
            .commands
            .push((target, command.to_string()));
        if self.hang_on.is_some_and(|needle| command.contains(needle)) {
            tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        }
        let stdout = if command == "hostname --fqdn" {
            match target {
                RemoteTarget::ClusterManager => "cm-01.sos.ethz.ch\n".to_string(),
                RemoteTarget::Compute => format!("{}.sos.ethz.ch\n", NODE),
            }
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn write_file(
        &self,
        target: RemoteTarget,
        path: &str,
        contents: &[u8],
    ) -> Result<(), RemoteError> {
        self.log.lock().unwrap().writes.push((
            target,
            path.to_string(),
            String::from_utf8_lossy(contents).to_string(),
        ));
        Ok(())
    }

    async fn read_file(&self, _: RemoteTarget, _: &str) -> Result<Vec<u8>, RemoteError> {
        Ok(Vec::new())
    }

    async fn file_exists(&self, target: RemoteTarget, path: &str) -> Result<bool, RemoteError> {
        self.log
            .lock()
            .unwrap()
            .probes
            .push((target, path.to_string()));
        Ok(true)
    }

    async fn remove_file(&self, target: RemoteTarget, path: &str) -> Result<(), RemoteError> {
        self.log
            .lock()
            .unwrap()
            .removed
            .push((target, path.to_string()));
        Ok(())
    }

    async fn stream_lines(
        &self,
        target: RemoteTarget,
        command: &str,
    ) -> Result<LineStream, RemoteError> {
        self.log
            .lock()
            .unwrap()
            .commands
            .push((target, command.to_string()));
        let (tx, rx) = mpsc::channel(self.console.len() + 1);
        for line in &self.console {
            let _ = tx.try_send(Ok(line.clone()));
        }
        if self.hold_console {
            self.held.lock().unwrap().push(tx);
        }
        Ok(rx)
    }
}

struct FakeNetwork {
    existing: ExistingBindings,
    allocations: Mutex<Vec<String>>,
}

impl FakeNetwork {
    fn new(existing: ExistingBindings) -> Self {
        Self {
            existing,
            allocations: Mutex::new(Vec::new()),
        }
    }

    fn allocation_count(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }
}

#[async_trait]
impl NetworkIdentity for FakeNetwork {
    fn subnet_name(&self) -> &str {
        "vm"
    }

    async fn lookup(&self, _: &str) -> netcenter::Result<ExistingBindings> {
        Ok(self.existing.clone())
    }

    async fn allocate(&self, fqdn: &str) -> netcenter::Result<IpBinding> {
        self.allocations.lock().unwrap().push(fqdn.to_string());
        Ok(IpBinding {
            fqdn: fqdn.to_string(),
            ipv4: Ipv4Addr::new(192, 33, 91, 40),
            ipv6: "2001:67c:10ec:49c3::121".parse().unwrap(),
            subnet: "vm".to_string(),
        })
    }

    async fn release(&self, fqdn: &str) -> netcenter::Result<Vec<IpAddr>> {
        Err(NetcenterError::Rejected(format!("unexpected release of {}", fqdn)))
    }
}

#[derive(Default)]
struct FakeHypervisor {
    pool_adds: Mutex<Vec<(String, u32)>>,
    status_checks: Mutex<Vec<(String, u32)>>,
    /// Reported instead of "running" after start.
    status_override: Option<&'static str>,
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn vm_ids(&self) -> Result<HashSet<u32>, ProvisionError> {
        Ok([100_100, 100_101].into_iter().collect())
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<NodeVm, ProvisionError> {
        self.status_checks
            .lock()
            .unwrap()
            .push((node.to_string(), vmid));
        Ok(NodeVm {
            vmid,
            status: self.status_override.unwrap_or("running").into(),
            ..Default::default()
        })
    }

    async fn add_to_pool(&self, pool: &str, vmid: u32) -> Result<(), ProvisionError> {
        self.pool_adds.lock().unwrap().push((pool.to_string(), vmid));
        Ok(())
    }

    async fn vms_by_name(&self, _: &str) -> Result<Vec<ClusterVm>, ProvisionError> {
        Ok(Vec::new())
    }

    async fn force_stop(&self, _: &str, _: u32) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn delete_vm(&self, _: &str, _: u32, _: DeleteOptions) -> Result<(), ProvisionError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<(u32, Option<String>)>>,
}

impl ProgressReporter for RecordingProgress {
    fn emit(&self, percentage: u32, _message: String) {
        self.events.lock().unwrap().push((percentage, None));
    }

    fn emit_detailed(
        &self,
        percentage: u32,
        _message: String,
        phase: Option<String>,
        _task_name: Option<String>,
    ) {
        self.events.lock().unwrap().push((percentage, phase));
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    network: Arc<FakeNetwork>,
    hypervisor: Arc<FakeHypervisor>,
    progress: Arc<RecordingProgress>,
    orchestrator: Orchestrator,
    _admin_key: tempfile::NamedTempFile,
}

fn harness(cluster: FakeCluster, existing: ExistingBindings) -> Harness {
    harness_with(
        cluster,
        existing,
        TemplateRenderer::from_embedded().unwrap(),
        VmIdRange::new(100_000, 999_999),
        FakeHypervisor::default(),
    )
}

fn harness_with(
    cluster: FakeCluster,
    existing: ExistingBindings,
    renderer: TemplateRenderer,
    vm_ids: VmIdRange,
    hypervisor: FakeHypervisor,
) -> Harness {
    let mut admin_key = tempfile::NamedTempFile::new().unwrap();
    writeln!(admin_key, "ssh-ed25519 AAAAadminkey admin@vsos").unwrap();

    let cluster = Arc::new(cluster);
    let network = Arc::new(FakeNetwork::new(existing));
    let hypervisor = Arc::new(hypervisor);
    let progress = Arc::new(RecordingProgress::default());

    let settings = OrchestratorSettings {
        cluster_manager_role: Regex::new(r"^cm-.+\.sos\.ethz\.ch$").unwrap(),
        compute_role: Regex::new(r"^comp-.+\.sos\.ethz\.ch$").unwrap(),
        node: NODE.to_string(),
        storage: StorageConfig::default(),
        vm_ids,
        id_attempts: 64,
        admin_pubkey_path: admin_key.path().to_path_buf(),
        known_hosts: "/root/.ssh/known_hosts".to_string(),
        command_timeout: Duration::from_secs(120),
        import_timeout: Duration::from_secs(1800),
        post_install_timeout: Duration::from_secs(3600),
    };

    let services = Services::new(
        cluster.clone(),
        network.clone(),
        hypervisor.clone(),
        ConfigBuilder::new(
            renderer,
            NetworkConfig::default(),
            StorageConfig::default(),
        ),
        BootMonitor::new(BootSettings {
            timeout: Duration::from_secs(120),
            heartbeat: Duration::from_secs(30),
        }),
        progress.clone(),
        settings,
    );

    Harness {
        cluster,
        network,
        hypervisor,
        progress,
        orchestrator: Orchestrator::new(services),
        _admin_key: admin_key,
    }
}

fn testvm_options() -> VmCreationOptions {
    VmCreationOptions {
        image: "Ubuntu 24.04".into(),
        fqdn: "testvm.vsos.ethz.ch".into(),
        reinstall: false,
        cores: 2,
        ram_mb: 2048,
        disk_gb: 15,
        use_qemu_agent: false,
        tags: vec!["created-by-vmwiz".into()],
        notes: "nethz=jdoe\nuni_contact=jdoe@ethz.ch".into(),
        ssh_keys: vec![format!("ssh-ed25519 {} user@host", ED25519)],
        resource_pool: "vsos".into(),
    }
}

fn bound(ipv4: &[&str], ipv6: &[&str]) -> ExistingBindings {
    ExistingBindings {
        ipv4: ipv4.iter().map(|s| s.parse().unwrap()).collect(),
        ipv6: ipv6.iter().map(|s| s.parse().unwrap()).collect(),
    }
}

#[tokio::test]
async fn test_create_testvm_end_to_end() {
    let h = harness(FakeCluster::new(console_with_keys()), ExistingBindings::default());

    let vm = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap();

    assert!((100_000..999_999).contains(&vm.vmid));
    assert_eq!(vm.vmid.to_string().len(), 6);
    assert_ne!(vm.vmid, 100_100);
    assert_eq!(vm.node, NODE);
    assert_eq!(vm.login_user, "ubuntu");
    assert_eq!(vm.ipv4, Ipv4Addr::new(192, 33, 91, 40));
    assert_eq!(vm.ipv6, "2001:67c:10ec:49c3::121".parse::<Ipv6Addr>().unwrap());
    assert_eq!(vm.fingerprints.len(), 1);
    assert_eq!(vm.fingerprints[0].key_type, "ssh-ed25519");
    assert!(vm.fingerprints[0].sha256.starts_with("SHA256:"));
    assert_eq!(h.network.allocation_count(), 1);
    assert_eq!(
        *h.hypervisor.pool_adds.lock().unwrap(),
        vec![("vsos".to_string(), vm.vmid)]
    );
    assert_eq!(
        *h.hypervisor.status_checks.lock().unwrap(),
        vec![(NODE.to_string(), vm.vmid)]
    );

    // Disks before the definition is extended, network stanza last, boot after
    let id = vm.vmid;
    let order = [
        format!("rbd -p ssd create --size 512M vm-{}-disk-0", id),
        format!("rbd -p ssd create --size 4M vm-{}-efivars", id),
        format!("qm importdisk {} ", id),
        format!("qm set {} --scsi0 ssd:vm-{}-disk-1,discard=on", id, id),
        format!("qm resize {} scsi0 15G", id),
        format!("cat /tmp/vmwiz-{}.cloudinit.tail >> ", id),
        format!("qm set {} --scsi2 ssd:cloudinit", id),
        format!("qm set {} --sshkey /tmp/vmwiz-{}.ssh.pub", id, id),
        "'net0: virtio=02:9b:c6:ff:a5:9b,bridge=vmbr1,rate=125'".to_string(),
        format!("qm start {}", id),
        format!("socat -u /var/run/qemu-server/{}.serial0 -", id),
        "ssh-keygen -f /root/.ssh/known_hosts -R 192.33.91.40".to_string(),
        "ssh-keygen -f /root/.ssh/known_hosts -R 2001:67c:10ec:49c3::121".to_string(),
        "testvm.vsos.ethz.ch,192.33.91.40,2001:67c:10ec:49c3::121 ssh-ed25519".to_string(),
        "scp -o BatchMode=yes".to_string(),
        "sudo /home/ubuntu/vmwiz-post-install.sh".to_string(),
    ];
    let positions: Vec<usize> = order.iter().map(|n| h.cluster.position(n)).collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "commands out of order: {:?}",
        h.cluster.commands()
    );

    for (target, cmd) in h.cluster.commands() {
        if cmd.starts_with("qm ") || cmd.starts_with("rbd ") {
            assert_eq!(target, RemoteTarget::Compute, "{}", cmd);
        }
        if cmd.starts_with("ssh-keygen") || cmd.starts_with("scp") {
            assert_eq!(target, RemoteTarget::ClusterManager, "{}", cmd);
        }
    }

    let (target, conf) = h
        .cluster
        .written(&format!("/etc/pve/local/qemu-server/{}.conf", id))
        .unwrap();
    assert_eq!(target, RemoteTarget::Compute);
    assert!(conf.contains("name: testvm.vsos.ethz.ch\n"));
    assert!(!conf.contains("net0"));

    let (_, keys) = h
        .cluster
        .written(&format!("/tmp/vmwiz-{}.ssh.pub", id))
        .unwrap();
    assert_eq!(
        keys,
        format!(
            "ssh-ed25519 {} user@host\nssh-ed25519 AAAAadminkey admin@vsos\n",
            ED25519
        )
    );

    let (target, boot_log) = h
        .cluster
        .written(&format!("/tmp/{}.vmwiz.boot.log", id))
        .unwrap();
    assert_eq!(target, RemoteTarget::ClusterManager);
    assert_eq!(boot_log.lines().count(), console_with_keys().len());

    // Scratch files are removed, audit logs are kept
    let removed = h.cluster.log.lock().unwrap().removed.clone();
    assert_eq!(removed.len(), 3);
    assert!(removed.iter().all(|(_, p)| !p.contains("boot.log")));

    let events = h.progress.events.lock().unwrap();
    assert!(events.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(events.last().map(|e| e.0), Some(100));
}

#[tokio::test]
async fn test_reinstall_reuses_existing_binding() {
    let h = harness(
        FakeCluster::new(console_with_keys()),
        bound(&["192.33.91.77"], &["2001:67c:10ec:49c3::177"]),
    );
    let options = VmCreationOptions {
        reinstall: true,
        ..testvm_options()
    };

    let vm = h
        .orchestrator
        .provision(&options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(vm.ipv4, "192.33.91.77".parse::<Ipv4Addr>().unwrap());
    assert_eq!(vm.ipv6, "2001:67c:10ec:49c3::177".parse::<Ipv6Addr>().unwrap());
    assert_eq!(h.network.allocation_count(), 0);
}

#[tokio::test]
async fn test_reinstall_without_binding_aborts_before_remote_changes() {
    let h = harness(FakeCluster::new(console_with_keys()), ExistingBindings::default());
    let options = VmCreationOptions {
        reinstall: true,
        ..testvm_options()
    };

    let failure = h
        .orchestrator
        .provision(&options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::AllocatingNetwork);
    assert_eq!(failure.error.kind(), ErrorKind::Allocation);
    assert!(matches!(
        failure.error.root(),
        ProvisionError::MissingBinding { .. }
    ));
    assert!(failure.left_behind.is_empty());
    assert_eq!(h.network.allocation_count(), 0);

    // Only the read-only role probes ran
    assert!(h
        .cluster
        .commands()
        .iter()
        .all(|(_, c)| c == "hostname --fqdn"));
    assert!(h.cluster.log.lock().unwrap().writes.is_empty());
}

#[tokio::test]
async fn test_unknown_image_issues_no_remote_command() {
    let h = harness(FakeCluster::new(console_with_keys()), ExistingBindings::default());
    let options = VmCreationOptions {
        image: "Windows 11".into(),
        ..testvm_options()
    };

    let failure = h
        .orchestrator
        .provision(&options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::Validating);
    assert_eq!(failure.error.kind(), ErrorKind::Validation);
    assert!(matches!(failure.error.root(), ProvisionError::UnknownImage(name) if name == "Windows 11"));
    let log = h.cluster.log.lock().unwrap();
    assert!(log.commands.is_empty());
    assert!(log.probes.is_empty());
}

#[tokio::test]
async fn test_create_refuses_existing_dns_entries() {
    let h = harness(
        FakeCluster::new(console_with_keys()),
        bound(&["192.33.91.77"], &[]),
    );

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::AllocatingNetwork);
    assert_eq!(failure.error.kind(), ErrorKind::Validation);
    match failure.error.root() {
        ProvisionError::AlreadyBound { addresses, .. } => {
            assert_eq!(addresses, &vec!["192.33.91.77".parse::<IpAddr>().unwrap()])
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.network.allocation_count(), 0);
}

#[tokio::test]
async fn test_ambiguous_binding_is_rejected() {
    let h = harness(
        FakeCluster::new(console_with_keys()),
        bound(
            &["192.33.91.77", "192.33.91.78"],
            &["2001:67c:10ec:49c3::177"],
        ),
    );
    let options = VmCreationOptions {
        reinstall: true,
        ..testvm_options()
    };

    let failure = h
        .orchestrator
        .provision(&options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error.root(),
        ProvisionError::AmbiguousBinding { ipv4: 2, ipv6: 1, .. }
    ));
    assert_eq!(h.network.allocation_count(), 0);
}

#[tokio::test]
async fn test_missing_host_key_reports_left_behind_state() {
    let console = vec![
        "[    0.000000] Linux version 6.8.0-31-generic".to_string(),
        "Cloud-init v. 24.1.3 finished at Mon, 01 Jul 2024 10:00:00 +0000".to_string(),
    ];
    let h = harness(FakeCluster::new(console), ExistingBindings::default());

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::AwaitingFirstBoot);
    assert_eq!(failure.error.kind(), ErrorKind::FingerprintExtraction);
    assert!(failure
        .to_string()
        .starts_with("Failed to provision testvm.vsos.ethz.ch: AwaitingFirstBoot: "));

    let kinds: Vec<&str> = failure
        .left_behind
        .iter()
        .map(|a| match a {
            CompensatableAction::DnsRecord { .. } => "dns",
            CompensatableAction::DiskCreated { .. } => "disk",
            CompensatableAction::VmDefinitionWritten { .. } => "definition",
            CompensatableAction::VmStarted { .. } => "started",
            CompensatableAction::Unconfirmed(_) => "unconfirmed",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["dns", "dns", "disk", "disk", "definition", "disk", "started"]
    );

    // Boot log is still kept for the operator
    let has_boot_log = h
        .cluster
        .log
        .lock()
        .unwrap()
        .writes
        .iter()
        .any(|(t, p, _)| *t == RemoteTarget::ClusterManager && p.ends_with(".vmwiz.boot.log"));
    assert!(has_boot_log);
    assert!(h.hypervisor.pool_adds.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_boot_timeout_is_distinct_error() {
    let mut cluster = FakeCluster::new(vec!["[    0.000000] Linux version 6.8.0-31-generic".to_string()]);
    cluster.hold_console = true;
    let h = harness(cluster, ExistingBindings::default());

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::AwaitingFirstBoot);
    assert_eq!(failure.error.kind(), ErrorKind::BootTimeout);
    assert!(matches!(
        failure.error.root(),
        ProvisionError::BootTimeout { elapsed_secs: 120 }
    ));

    let partial = h
        .cluster
        .log
        .lock()
        .unwrap()
        .writes
        .iter()
        .find(|(_, p, _)| p.ends_with(".vmwiz.boot.log"))
        .map(|(_, _, c)| c.clone())
        .unwrap();
    assert_eq!(partial, "[    0.000000] Linux version 6.8.0-31-generic\n");
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = harness(FakeCluster::new(console_with_keys()), ExistingBindings::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::Validating);
    assert_eq!(failure.error.kind(), ErrorKind::Cancelled);
    assert!(h.cluster.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_import_timeout_reports_unconfirmed_root_disk() {
    let mut cluster = FakeCluster::new(console_with_keys());
    cluster.hang_on = Some("qm importdisk");
    let h = harness(cluster, ExistingBindings::default());

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::ImportingImage);
    assert_eq!(failure.error.kind(), ErrorKind::RemoteExecution);
    assert!(matches!(
        failure.error.root(),
        ProvisionError::Remote(RemoteError::Timeout { secs: 1800, .. })
    ));

    match failure.left_behind.last() {
        Some(CompensatableAction::Unconfirmed(inner)) => match inner.as_ref() {
            CompensatableAction::DiskCreated { pool, name } => {
                assert_eq!(pool, "ssd");
                assert!(name.ends_with("-disk-1"), "{}", name);
            }
            other => panic!("unexpected action {:?}", other),
        },
        other => panic!("unexpected ledger tail {:?}", other),
    }
    // swap + efi were confirmed before the import
    assert_eq!(
        failure
            .left_behind
            .iter()
            .filter(|a| matches!(a, CompensatableAction::DiskCreated { .. }))
            .count(),
        2
    );
    assert!(h
        .cluster
        .commands()
        .iter()
        .all(|(_, c)| !c.starts_with("qm start")));
}

#[tokio::test]
async fn test_render_failure_releases_reserved_vmid() {
    let templates = tempfile::tempdir().unwrap();
    std::fs::write(templates.path().join("vm.conf.j2"), "name: {{ missing }}\n").unwrap();
    let h = harness_with(
        FakeCluster::new(console_with_keys()),
        ExistingBindings::default(),
        TemplateRenderer::new(templates.path().to_path_buf()).unwrap(),
        VmIdRange::new(100_000, 999_999),
        FakeHypervisor::default(),
    );

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::BuildingIdentity);
    assert!(matches!(failure.error.root(), ProvisionError::Template(_)));
    assert!(h.orchestrator.services().reserved_ids().is_empty());
}

#[tokio::test]
async fn test_vmid_reservations_never_collide() {
    // 100_100 and 100_101 are live, leaving 100_099 and 100_102
    let h = harness_with(
        FakeCluster::new(console_with_keys()),
        ExistingBindings::default(),
        TemplateRenderer::from_embedded().unwrap(),
        VmIdRange::new(100_099, 100_103),
        FakeHypervisor::default(),
    );
    let services = h.orchestrator.services();
    let live: HashSet<u32> = [100_100, 100_101].into_iter().collect();
    let mut rng = StdRng::seed_from_u64(11);

    let first = services.reserve_vmid(&live, &mut rng).unwrap();
    let second = services.reserve_vmid(&live, &mut rng).unwrap();
    let mut got = vec![first, second];
    got.sort();
    assert_eq!(got, vec![100_099, 100_102]);

    assert!(matches!(
        services.reserve_vmid(&live, &mut rng),
        Err(ProvisionError::VmIdExhausted { attempts: 64 })
    ));

    services.release_id(first);
    assert_eq!(services.reserve_vmid(&live, &mut rng).unwrap(), first);
}

#[tokio::test]
async fn test_vm_not_running_after_start_aborts_boot() {
    let h = harness_with(
        FakeCluster::new(console_with_keys()),
        ExistingBindings::default(),
        TemplateRenderer::from_embedded().unwrap(),
        VmIdRange::new(100_000, 999_999),
        FakeHypervisor {
            status_override: Some("stopped"),
            ..Default::default()
        },
    );

    let failure = h
        .orchestrator
        .provision(&testvm_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.state, ProvisionState::Booting);
    assert_eq!(failure.error.kind(), ErrorKind::RemoteExecution);
    assert!(failure.error.to_string().contains("is 'stopped' right after start"));
    assert!(matches!(
        failure.left_behind.last(),
        Some(CompensatableAction::VmStarted { .. })
    ));
    // The console is never opened
    assert!(h
        .cluster
        .commands()
        .iter()
        .all(|(_, c)| !c.starts_with("socat")));
}
