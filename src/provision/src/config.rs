//! Provisioner configuration
//! Loaded from vmwiz.toml, secrets may come from the environment

use crate::provisioner::ProvisionError;
use crate::remote::RemoteTarget;
use netcenter::NetcenterConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "vmwiz.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvisionerConfig {
    #[serde(default)]
    pub cluster_manager: SshHostConfig,

    #[serde(default)]
    pub compute: SshHostConfig,

    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    #[serde(default)]
    pub netcenter: NetcenterConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub vm: VmConfig,

    #[serde(default)]
    pub pools: PoolConfig,

    #[serde(default)]
    pub boot: BootConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

impl ProvisionerConfig {
    /// Load configuration from file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ProvisionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let mut config: ProvisionerConfig = toml::from_str(&content).map_err(|e| {
            ProvisionError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        config.apply_env();
        config.validate()?;

        tracing::info!("Loaded provisioner config from {:?}", path);
        Ok(config)
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env(&mut self) {
        self.netcenter.apply_env();
        let overrides: [(&str, &mut String); 4] = [
            ("PVE_HOST", &mut self.hypervisor.api_url),
            ("PVE_USER", &mut self.hypervisor.user),
            ("PVE_TOKENID", &mut self.hypervisor.token_id),
            ("PVE_UUID", &mut self.hypervisor.token_secret),
        ];
        for (var, field) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *field = value;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        let fail = |msg: String| Err(ProvisionError::Config(msg));

        for (target, host) in [
            (RemoteTarget::ClusterManager, &self.cluster_manager),
            (RemoteTarget::Compute, &self.compute),
        ] {
            if host.host.trim().is_empty() {
                return fail(format!("{} host is not set", target));
            }
            regex::Regex::new(host.role_pattern(target)).map_err(|e| {
                ProvisionError::Config(format!("{} role_pattern: {}", target, e))
            })?;
        }

        if self.hypervisor.api_url.trim().is_empty() {
            return fail("hypervisor.api_url is not set".to_string());
        }
        if self.hypervisor.node.trim().is_empty() {
            return fail("hypervisor.node is not set".to_string());
        }
        if self.hypervisor.timeout_secs == 0 {
            return fail("hypervisor.timeout_secs must be greater than zero".to_string());
        }

        self.netcenter
            .validate()
            .map_err(|e| ProvisionError::Config(e.to_string()))?;

        if self.pools.personal.trim().is_empty() || self.pools.organization.trim().is_empty() {
            return fail("both pools.personal and pools.organization must be set".to_string());
        }
        if self.vm.id_min >= self.vm.id_max {
            return fail(format!(
                "vm.id_min ({}) must be below vm.id_max ({})",
                self.vm.id_min, self.vm.id_max
            ));
        }
        if self.vm.id_attempts == 0 {
            return fail("vm.id_attempts must be greater than zero".to_string());
        }
        if self.boot.timeout_secs == 0 || self.boot.heartbeat_secs == 0 {
            return fail("boot timeout and heartbeat must be greater than zero".to_string());
        }
        if self.storage.pool.trim().is_empty() {
            return fail("storage.pool is not set".to_string());
        }
        Ok(())
    }
}

/// SSH access to one of the cluster nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshHostConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key; passphrase-protected keys must be loaded into ssh-agent.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Regex the host's FQDN must match; defaults depend on the role.
    #[serde(default)]
    pub role_pattern: Option<String>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for SshHostConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
            role_pattern: None,
        }
    }
}

impl SshHostConfig {
    pub fn role_pattern(&self, target: RemoteTarget) -> &str {
        self.role_pattern
            .as_deref()
            .unwrap_or_else(|| target.default_role_pattern())
    }
}

/// Hypervisor HTTP API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub token_id: String,
    #[serde(default)]
    pub token_secret: String,
    /// Node name of the compute host in the cluster.
    #[serde(default)]
    pub node: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub insecure: bool,
}

fn default_api_timeout_secs() -> u64 {
    10
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            user: String::new(),
            token_id: String::new(),
            token_secret: String::new(),
            node: String::new(),
            timeout_secs: default_api_timeout_secs(),
            insecure: false,
        }
    }
}

/// Guest network parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_gateway4")]
    pub gateway4: String,
    #[serde(default = "default_netmask4")]
    pub netmask4: u8,
    #[serde(default = "default_gateway6")]
    pub gateway6: String,
    #[serde(default = "default_netmask6")]
    pub netmask6: u8,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// NIC rate limit in MB/s
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_nic_model")]
    pub nic_model: String,
}

fn default_gateway4() -> String {
    "192.33.91.1".to_string()
}

fn default_netmask4() -> u8 {
    24
}

fn default_gateway6() -> String {
    "2001:67c:10ec:49c3::1".to_string()
}

fn default_netmask6() -> u8 {
    118
}

fn default_bridge() -> String {
    "vmbr1".to_string()
}

fn default_rate_limit() -> u32 {
    125
}

fn default_nic_model() -> String {
    "virtio".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            gateway4: default_gateway4(),
            netmask4: default_netmask4(),
            gateway6: default_gateway6(),
            netmask6: default_netmask6(),
            bridge: default_bridge(),
            rate_limit: default_rate_limit(),
            nic_model: default_nic_model(),
        }
    }
}

/// Block storage and image locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default = "default_swap_size")]
    pub swap_size: String,
    #[serde(default = "default_efi_size")]
    pub efi_size: String,
    /// Image store as mounted on the cluster manager
    #[serde(default = "default_template_dir_cm")]
    pub template_dir_cm: String,
    /// Same store as mounted on the compute node
    #[serde(default = "default_template_dir_compute")]
    pub template_dir_compute: String,
}

fn default_pool() -> String {
    "ssd".to_string()
}

fn default_swap_size() -> String {
    "512M".to_string()
}

fn default_efi_size() -> String {
    "4M".to_string()
}

fn default_template_dir_cm() -> String {
    "/srv/cnfs".to_string()
}

fn default_template_dir_compute() -> String {
    "/mnt/pve/cnfs".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            swap_size: default_swap_size(),
            efi_size: default_efi_size(),
            template_dir_cm: default_template_dir_cm(),
            template_dir_compute: default_template_dir_compute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// Inclusive lower bound of the VM id space
    #[serde(default = "default_id_min")]
    pub id_min: u32,
    /// Exclusive upper bound
    #[serde(default = "default_id_max")]
    pub id_max: u32,
    #[serde(default = "default_id_attempts")]
    pub id_attempts: u32,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Administrative public key added to every VM
    #[serde(default = "default_admin_pubkey_path")]
    pub admin_pubkey_path: PathBuf,
    #[serde(default)]
    pub qemu_agent: bool,
}

fn default_id_min() -> u32 {
    100_000
}

fn default_id_max() -> u32 {
    999_999
}

fn default_id_attempts() -> u32 {
    16
}

fn default_domain() -> String {
    "vsos.ethz.ch".to_string()
}

fn default_admin_pubkey_path() -> PathBuf {
    PathBuf::from("/root/.ssh/vm_univ_pubkey.key")
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            id_min: default_id_min(),
            id_max: default_id_max(),
            id_attempts: default_id_attempts(),
            domain: default_domain(),
            admin_pubkey_path: default_admin_pubkey_path(),
            qemu_agent: false,
        }
    }
}

/// Resource pools VMs are assigned to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_personal_pool")]
    pub personal: String,
    #[serde(default = "default_organization_pool")]
    pub organization: String,
}

fn default_personal_pool() -> String {
    "vsos".to_string()
}

fn default_organization_pool() -> String {
    "vsos-org".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            personal: default_personal_pool(),
            organization: default_organization_pool(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default = "default_boot_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_boot_timeout_secs() -> u64 {
    1800
}

fn default_heartbeat_secs() -> u64 {
    30
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_boot_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

impl BootConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// known_hosts file on the cluster manager
    #[serde(default = "default_known_hosts")]
    pub known_hosts: String,
    /// Local directory for ssh control sockets
    #[serde(default = "default_ssh_control_dir")]
    pub ssh_control_dir: PathBuf,
    /// Override directory for templates; embedded templates are used when unset
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
}

fn default_known_hosts() -> String {
    "/root/.ssh/known_hosts".to_string()
}

fn default_ssh_control_dir() -> PathBuf {
    std::env::temp_dir().join("vmwiz-ssh")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            known_hosts: default_known_hosts(),
            ssh_control_dir: default_ssh_control_dir(),
            templates_dir: None,
        }
    }
}
