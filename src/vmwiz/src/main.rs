//! vmwiz: operator CLI for provisioning VMs on the SOS cluster.

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use netcenter::{NetcenterClient, NetworkAllocator, NetworkIdentity};
use provision::request::{select_resource_pool, CREATED_BY_TAG};
use provision::{
    decommission, images, startup_check, ChannelProgressReporter, EditRequest, LogNotifier,
    LogProgressReporter, MemoryRequestStore, Orchestrator, ProvisionError, ProvisionProgress,
    ProvisionerConfig, PveClient, RequestHandler, RequestStatus, SshExecutor,
    VmCreationOptions, VmProvisioner, DEFAULT_CONFIG_FILE,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "vmwiz", version, about = "Provision and manage VMs on the SOS cluster")]
struct Cli {
    #[arg(short, long, env = "VMWIZ_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check configuration, credentials and connectivity
    Health,

    /// List the image catalogue
    Images,

    #[command(subcommand)]
    Ip(IpCommand),

    #[command(subcommand)]
    Dns(DnsCommand),

    #[command(subcommand)]
    Vm(VmCommand),

    #[command(subcommand)]
    Request(RequestCommand),
}

#[derive(Subcommand, Debug)]
enum IpCommand {
    /// Count free addresses in the VM subnet
    List,
}

#[derive(Subcommand, Debug)]
enum DnsCommand {
    /// Show the addresses bound to a name
    Lookup { name: String },
    /// Delete every DNS record bound to a name
    Release {
        name: String,
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum VmCommand {
    /// Create a new VM
    Create(VmArgs),
    /// Rebuild a VM reusing its existing DNS entries
    Reinstall(VmArgs),
    /// Stop and delete every VM with the given name
    Delete {
        #[arg(long)]
        name: String,
        /// Also release the name's DNS entries
        #[arg(long)]
        delete_dns: bool,
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct VmArgs {
    /// Hostname; qualified with the configured domain when it has no dot
    #[arg(long)]
    fqdn: String,
    /// Image label, short label or codename
    #[arg(long)]
    image: String,
    #[arg(long, default_value_t = 2)]
    cores: u32,
    #[arg(long, default_value_t = 2048)]
    ram_mb: u32,
    #[arg(long, default_value_t = 15)]
    disk_gb: u32,
    /// Public key line; may be repeated
    #[arg(long = "ssh-key")]
    ssh_keys: Vec<String>,
    /// File of public keys, one per line
    #[arg(long)]
    ssh_key_file: Option<PathBuf>,
    /// Put the VM in the organization pool
    #[arg(long)]
    organization: bool,
    #[arg(long, default_value = "")]
    notes: String,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct RequestSelector {
    #[arg(long)]
    id: Option<u64>,
    /// Hostname or FQDN of the request
    #[arg(long)]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum RequestCommand {
    List {
        #[arg(long, default_value = "requests.json")]
        store: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Accept {
        #[arg(long, default_value = "requests.json")]
        store: PathBuf,
        #[command(flatten)]
        select: RequestSelector,
        #[arg(short, long)]
        yes: bool,
    },
    Reject {
        #[arg(long, default_value = "requests.json")]
        store: PathBuf,
        #[command(flatten)]
        select: RequestSelector,
        #[arg(short, long)]
        yes: bool,
    },
    Edit {
        #[arg(long, default_value = "requests.json")]
        store: PathBuf,
        #[command(flatten)]
        select: RequestSelector,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        cores: Option<u32>,
        #[arg(long)]
        ram_gb: Option<u32>,
        #[arg(long)]
        disk_gb: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    // Default to info level if RUST_LOG not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<ProvisionError>() {
            Some(pe) => eprintln!("Error ({}): {}", pe.kind(), e),
            None => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Command::Images = cli.command {
        for image in images::CATALOG {
            println!(
                "{:<32} {:<14} {:<10} login: {}",
                image.id, image.short, image.codename, image.login_user
            );
        }
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Images => Ok(()),
        Command::Health => health(&config).await,
        Command::Ip(IpCommand::List) => {
            let allocator = allocator(&config)?;
            let counts = allocator.free_address_counts().await?;
            let subnet = allocator.subnet();
            println!("Subnet {} ({}, {})", subnet.name, subnet.v4, subnet.v6);
            println!("  free IPv4: {}", counts.ipv4);
            println!("  free IPv6: {}", counts.ipv6);
            Ok(())
        }
        Command::Dns(DnsCommand::Lookup { name }) => {
            let bindings = allocator(&config)?.lookup(&name).await?;
            if bindings.is_empty() {
                println!("{} has no DNS entries", name);
            }
            for ip in bindings.addresses() {
                println!("{} {}", name, ip);
            }
            Ok(())
        }
        Command::Dns(DnsCommand::Release { name, yes }) => {
            if !yes && !confirm(&format!("Release all DNS entries of {}?", name))? {
                return Ok(());
            }
            let released = allocator(&config)?.release(&name).await?;
            for ip in &released {
                println!("Released {} {}", name, ip);
            }
            Ok(())
        }
        Command::Vm(VmCommand::Create(args)) => create_vm(&config, args, false).await,
        Command::Vm(VmCommand::Reinstall(args)) => create_vm(&config, args, true).await,
        Command::Vm(VmCommand::Delete {
            name,
            delete_dns,
            yes,
        }) => {
            let prompt = if delete_dns {
                format!("Delete every VM named {} and its DNS entries?", name)
            } else {
                format!("Delete every VM named {}?", name)
            };
            if !yes && !confirm(&prompt)? {
                return Ok(());
            }
            let pve = PveClient::new(&config.hypervisor)?;
            let report = decommission(&pve, &allocator(&config)?, &name, delete_dns).await?;
            for (node, vmid) in &report.deleted {
                println!("Deleted VM {} on {}", vmid, node);
            }
            for ip in &report.released {
                println!("Released {}", ip);
            }
            Ok(())
        }
        Command::Request(cmd) => request(&config, cmd).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<ProvisionerConfig> {
    if !path.exists() {
        bail!(
            "Config file {} not found (set --config or VMWIZ_CONFIG)",
            path.display()
        );
    }
    Ok(ProvisionerConfig::load(path)?)
}

fn allocator(config: &ProvisionerConfig) -> anyhow::Result<NetworkAllocator> {
    let subnet = config.netcenter.subnet.parse()?;
    let client = NetcenterClient::new(&config.netcenter)?;
    Ok(NetworkAllocator::new(client, subnet))
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Cancel the token on Ctrl+C so a running provision stops at the next
/// state boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn health(config: &ProvisionerConfig) -> anyhow::Result<()> {
    let allocator = allocator(config).ok();
    let pve = PveClient::new(&config.hypervisor).ok();
    let executor = SshExecutor::new(
        config.cluster_manager.clone(),
        config.compute.clone(),
        config.paths.ssh_control_dir.clone(),
    );

    let checks =
        startup_check::run_all(config, allocator.as_ref(), pve.as_ref(), &executor).await;
    for check in &checks {
        print!("{}", check);
    }

    let failed = checks.iter().filter(|c| c.failed()).count();
    if failed > 0 {
        bail!("{} of {} checks failed", failed, checks.len());
    }
    Ok(())
}

async fn create_vm(config: &ProvisionerConfig, args: VmArgs, reinstall: bool) -> anyhow::Result<()> {
    let mut ssh_keys = args.ssh_keys;
    if let Some(path) = &args.ssh_key_file {
        let content = tokio::fs::read_to_string(path).await?;
        ssh_keys.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
    }

    let fqdn = if args.fqdn.contains('.') {
        args.fqdn.clone()
    } else {
        format!("{}.{}", args.fqdn, config.vm.domain)
    };

    let options = VmCreationOptions {
        image: args.image,
        fqdn,
        reinstall,
        cores: args.cores,
        ram_mb: args.ram_mb,
        disk_gb: args.disk_gb,
        use_qemu_agent: config.vm.qemu_agent,
        tags: vec![CREATED_BY_TAG.to_string()],
        notes: args.notes,
        ssh_keys,
        resource_pool: select_resource_pool(args.organization, &config.pools).to_string(),
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel::<ProvisionProgress>(64);
    let printer = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            eprintln!("{}", p);
        }
    });

    let reporter = ChannelProgressReporter::with_fqdn(tx, options.fqdn.clone());
    let orchestrator = Orchestrator::from_config(config, Arc::new(reporter))?;
    let result = orchestrator.provision(&options, &cancel_on_ctrl_c()).await;
    // Closes the channel so the printer drains and exits
    drop(orchestrator);
    let _ = printer.await;
    let vm = result.map_err(|failure| ProvisionError::Failed(Box::new(failure)))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&vm)?);
    } else {
        print!("{}", vm);
    }
    Ok(())
}

async fn request(config: &ProvisionerConfig, cmd: RequestCommand) -> anyhow::Result<()> {
    let store_path = match &cmd {
        RequestCommand::List { store, .. }
        | RequestCommand::Accept { store, .. }
        | RequestCommand::Reject { store, .. }
        | RequestCommand::Edit { store, .. } => store.clone(),
    };
    let store = Arc::new(MemoryRequestStore::open(&store_path).await?);

    let provisioner: Arc<dyn VmProvisioner> = Arc::new(Orchestrator::from_config(
        config,
        Arc::new(LogProgressReporter),
    )?);
    let handler = RequestHandler::new(
        store,
        Arc::new(LogNotifier),
        provisioner,
        config.pools.clone(),
        config.vm.domain.clone(),
        config.vm.qemu_agent,
    );

    match cmd {
        RequestCommand::List { json, .. } => {
            let requests = handler.store().list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&requests)?);
                return Ok(());
            }
            for r in requests {
                println!(
                    "{:>5} {:<9} {:<40} {:<16} {}c/{}G/{}G {}",
                    r.id,
                    r.status,
                    r.fqdn(&config.vm.domain),
                    r.image,
                    r.cores,
                    r.ram_gb,
                    r.disk_gb,
                    r.email
                );
            }
            Ok(())
        }
        RequestCommand::Accept { select, yes, .. } => {
            let request = handler.find(select.id, select.name.as_deref()).await?;
            if request.status != RequestStatus::Pending {
                tracing::warn!("Request {} is {}", request.id, request.status);
            }
            if !yes
                && !confirm(&format!(
                    "Accept request {} and create {}?",
                    request.id,
                    request.fqdn(&config.vm.domain)
                ))?
            {
                return Ok(());
            }
            let vm = handler
                .accept_request(request.id, &cancel_on_ctrl_c())
                .await?;
            print!("{}", vm);
            Ok(())
        }
        RequestCommand::Reject { select, yes, .. } => {
            let request = handler.find(select.id, select.name.as_deref()).await?;
            if !yes && !confirm(&format!("Reject request {}?", request.id))? {
                return Ok(());
            }
            handler.reject_request(request.id).await?;
            println!("Rejected request {}", request.id);
            Ok(())
        }
        RequestCommand::Edit {
            select,
            hostname,
            cores,
            ram_gb,
            disk_gb,
            ..
        } => {
            let request = handler.find(select.id, select.name.as_deref()).await?;
            let edit = EditRequest {
                hostname,
                cores,
                ram_gb,
                disk_gb,
            };
            let updated = handler.edit_request(request.id, &edit).await?;
            println!(
                "Request {}: {} with {} cores, {} GB RAM, {} GB disk",
                updated.id,
                updated.fqdn(&config.vm.domain),
                updated.cores,
                updated.ram_gb,
                updated.disk_gb
            );
            Ok(())
        }
    }
}
