//! Health checks run before serving requests (`vmwiz health`).

use crate::config::ProvisionerConfig;
use crate::pve::PveClient;
use crate::remote::{verify_role, RemoteExecutor, RemoteTarget};
use netcenter::{FreeAddressCounts, NetworkAllocator};
use regex::Regex;
use std::path::Path;

/// Below this many free addresses per family the subnet is reported as a
/// warning.
pub const LOW_ADDRESS_THRESHOLD: usize = 20;

/// Outcome of one named check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupCheck {
    pub name: String,
    pub successes: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl StartupCheck {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_success(&mut self, msg: impl Into<String>) {
        self.successes.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    fn indicator(&self) -> char {
        if !self.errors.is_empty() {
            'X'
        } else if !self.warnings.is_empty() {
            '!'
        } else {
            '+'
        }
    }
}

impl std::fmt::Display for StartupCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "[{}] {}", self.indicator(), self.name)?;
        for s in &self.successes {
            writeln!(f, "\t[+] {}", s)?;
        }
        for w in &self.warnings {
            writeln!(f, "\t[!] {}", w)?;
        }
        for e in &self.errors {
            writeln!(f, "\t[X] {}", e)?;
        }
        Ok(())
    }
}

pub fn check_config(config: &ProvisionerConfig) -> StartupCheck {
    let mut check = StartupCheck::new("Configuration");
    match config.validate() {
        Ok(()) => check.add_success("Configuration is valid"),
        Err(e) => check.add_error(e.to_string()),
    }

    let secrets = [
        ("netcenter.user", &config.netcenter.user),
        ("netcenter.password", &config.netcenter.password),
        ("hypervisor.user", &config.hypervisor.user),
        ("hypervisor.token_id", &config.hypervisor.token_id),
        ("hypervisor.token_secret", &config.hypervisor.token_secret),
    ];
    for (name, value) in secrets {
        if value.is_empty() {
            check.add_error(format!("{} is not set", name));
        } else {
            check.add_success(format!("{} is set", name));
        }
    }
    check
}

/// Classify free address counts of `subnet_v4` / `subnet_v6`.
pub fn address_availability(
    counts: FreeAddressCounts,
    subnet_v4: &str,
    subnet_v6: &str,
) -> StartupCheck {
    let mut check = StartupCheck::new("Check availability of free IPs");
    for (family, count, subnet) in [
        ("IPv4", counts.ipv4, subnet_v4),
        ("IPv6", counts.ipv6, subnet_v6),
    ] {
        let msg = format!(
            "Found {} free {} addresses in subnet '{}'",
            count, family, subnet
        );
        if count < LOW_ADDRESS_THRESHOLD {
            check.add_warning(msg);
        } else {
            check.add_success(msg);
        }
    }
    check
}

pub async fn check_netcenter(allocator: &NetworkAllocator) -> StartupCheck {
    let subnet = allocator.subnet();
    match allocator.free_address_counts().await {
        Ok(counts) => {
            address_availability(counts, &subnet.v4.to_string(), &subnet.v6.to_string())
        }
        Err(e) => {
            let mut check = StartupCheck::new("Check availability of free IPs");
            check.add_error(format!("Error when querying Netcenter: {}", e));
            check
        }
    }
}

pub async fn check_hypervisor(client: &PveClient) -> StartupCheck {
    let mut check = StartupCheck::new("Hypervisor API authentication");
    match client.permissions().await {
        Ok(perms) => {
            let paths = perms.as_object().map(|o| o.len()).unwrap_or(0);
            check.add_success(format!(
                "Authenticated with the hypervisor API ({} permission path(s))",
                paths
            ));
            if paths == 0 {
                check.add_warning("Token has no permissions");
            }
        }
        Err(e) => check.add_error(format!("Failed to get permissions: {}", e)),
    }
    check
}

pub async fn check_role(
    executor: &dyn RemoteExecutor,
    target: RemoteTarget,
    pattern: &str,
) -> StartupCheck {
    let mut check = StartupCheck::new(format!("{} SSH access", target));
    let pattern = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            check.add_error(format!("Invalid role pattern: {}", e));
            return check;
        }
    };
    match verify_role(executor, target, &pattern).await {
        Ok(hostname) => check.add_success(format!("Connected to {}", hostname)),
        Err(e) => check.add_error(e.to_string()),
    }
    check
}

pub async fn check_admin_key(path: &Path) -> StartupCheck {
    let mut check = StartupCheck::new("Administrative public key");
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.lines().any(|l| !l.trim().is_empty()) => {
            check.add_success(format!("Read {}", path.display()))
        }
        Ok(_) => check.add_error(format!("{} is empty", path.display())),
        Err(e) => check.add_error(format!("Cannot read {}: {}", path.display(), e)),
    }
    check
}

/// Run every check in order. Later checks are skipped once the configuration
/// check fails.
pub async fn run_all(
    config: &ProvisionerConfig,
    allocator: Option<&NetworkAllocator>,
    hypervisor: Option<&PveClient>,
    executor: &dyn RemoteExecutor,
) -> Vec<StartupCheck> {
    let mut checks = vec![check_config(config)];
    if checks[0].failed() {
        return checks;
    }

    if let Some(allocator) = allocator {
        checks.push(check_netcenter(allocator).await);
    }
    if let Some(client) = hypervisor {
        checks.push(check_hypervisor(client).await);
    }
    checks.push(
        check_role(
            executor,
            RemoteTarget::ClusterManager,
            config.cluster_manager.role_pattern(RemoteTarget::ClusterManager),
        )
        .await,
    );
    checks.push(
        check_role(
            executor,
            RemoteTarget::Compute,
            config.compute.role_pattern(RemoteTarget::Compute),
        )
        .await,
    );
    checks.push(check_admin_key(&config.vm.admin_pubkey_path).await);
    checks
}
