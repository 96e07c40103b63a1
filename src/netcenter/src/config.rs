use crate::error::{NetcenterError, Result};
use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Default Netcenter endpoint
pub const DEFAULT_NETCENTER_URL: &str = "https://www.netcenter.ethz.ch";

/// Default ISG group that owns the DNS records we create
pub const DEFAULT_ISG_GROUP: &str = "adm-soseth";

/// User agent sent with every Netcenter request
pub const USER_AGENT: &str = "SOSETH netcenter automation (vsos-support@sos.ethz.ch)";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetcenterConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_isg_group")]
    pub isg_group: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub subnet: SubnetConfig,
}

fn default_base_url() -> String {
    DEFAULT_NETCENTER_URL.to_string()
}

fn default_isg_group() -> String {
    DEFAULT_ISG_GROUP.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for NetcenterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user: String::new(),
            password: String::new(),
            isg_group: default_isg_group(),
            timeout_secs: default_timeout_secs(),
            subnet: SubnetConfig::default(),
        }
    }
}

impl NetcenterConfig {
    /// Override credentials from `NETCENTER_USER` / `NETCENTER_PWD` when set.
    pub fn apply_env(&mut self) {
        if let Ok(user) = std::env::var("NETCENTER_USER") {
            if !user.is_empty() {
                self.user = user;
            }
        }
        if let Ok(pwd) = std::env::var("NETCENTER_PWD") {
            if !pwd.is_empty() {
                self.password = pwd;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(NetcenterError::Config("base_url is empty".to_string()));
        }
        if self.user.is_empty() || self.password.is_empty() {
            return Err(NetcenterError::Config(
                "Netcenter credentials are not set".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(NetcenterError::Config(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.subnet.parse()?;
        Ok(())
    }
}

/// Subnet as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub name: String,
    /// IPv4 network in CIDR notation; host bits are ignored.
    pub ipv4: String,
    pub ipv6: String,
    /// IPv6 offsets up to and including this value are reserved.
    #[serde(default = "default_ipv6_exclusion_offset")]
    pub ipv6_exclusion_offset: u64,
    #[serde(default)]
    pub comment: String,
}

fn default_ipv6_exclusion_offset() -> u64 {
    0x20
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            name: "vm".to_string(),
            ipv4: "192.33.91.255/24".to_string(),
            ipv6: "2001:67c:10ec:49c3::/118".to_string(),
            ipv6_exclusion_offset: default_ipv6_exclusion_offset(),
            comment: "VM (sos-dc-server-1)".to_string(),
        }
    }
}

impl SubnetConfig {
    pub fn parse(&self) -> Result<Subnet> {
        let v4: Ipv4Network = self
            .ipv4
            .parse()
            .map_err(|e| NetcenterError::Config(format!("subnet ipv4 '{}': {}", self.ipv4, e)))?;
        let v6: Ipv6Network = self
            .ipv6
            .parse()
            .map_err(|e| NetcenterError::Config(format!("subnet ipv6 '{}': {}", self.ipv6, e)))?;

        // Normalize to the network address
        let v4 = Ipv4Network::new(v4.network(), v4.prefix())
            .map_err(|e| NetcenterError::Config(e.to_string()))?;
        let v6 = Ipv6Network::new(v6.network(), v6.prefix())
            .map_err(|e| NetcenterError::Config(e.to_string()))?;

        Ok(Subnet {
            name: self.name.clone(),
            v4,
            v6,
            ipv6_exclusion_offset: u128::from(self.ipv6_exclusion_offset),
        })
    }
}

/// A parsed dual-stack subnet the allocator draws from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub name: String,
    pub v4: Ipv4Network,
    pub v6: Ipv6Network,
    pub ipv6_exclusion_offset: u128,
}

impl Subnet {
    pub fn v4_base(&self) -> Ipv4Addr {
        self.v4.network()
    }

    pub fn v6_base(&self) -> Ipv6Addr {
        self.v6.network()
    }

    /// Offset of `ip` from the IPv6 network address, `None` when outside the subnet.
    pub fn v6_offset(&self, ip: Ipv6Addr) -> Option<u128> {
        if !self.v6.contains(ip) {
            return None;
        }
        Some(u128::from(ip) - u128::from(self.v6_base()))
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.v4, self.v6)
    }
}
