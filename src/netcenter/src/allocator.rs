//! Network identity allocation on top of Netcenter.
//!
//! A name owns at most one IPv4 and one IPv6 record. Netcenter has no
//! transactional "claim", so the read of the free list and the registration
//! that follows run under a per-subnet lock held by the allocator. Share one
//! `NetworkAllocator` (behind an `Arc`) between concurrent provisioning runs.

use crate::client::NetcenterClient;
use crate::config::Subnet;
use crate::error::{NetcenterError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::sync::Mutex;

/// A dual-stack address pair bound to one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpBinding {
    pub fqdn: String,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    /// Name of the subnet both addresses were drawn from.
    pub subnet: String,
}

/// Address records currently bound to a name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingBindings {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl ExistingBindings {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    pub fn is_ambiguous(&self) -> bool {
        self.ipv4.len() > 1 || self.ipv6.len() > 1
    }

    /// The binding when exactly one address of each family is present.
    pub fn single(&self, fqdn: &str, subnet: &str) -> Option<IpBinding> {
        match (self.ipv4.as_slice(), self.ipv6.as_slice()) {
            ([v4], [v6]) => Some(IpBinding {
                fqdn: fqdn.to_string(),
                ipv4: *v4,
                ipv6: *v6,
                subnet: subnet.to_string(),
            }),
            _ => None,
        }
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.ipv4
            .iter()
            .map(|ip| IpAddr::V4(*ip))
            .chain(self.ipv6.iter().map(|ip| IpAddr::V6(*ip)))
            .collect()
    }
}

/// Free address counts of the configured subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeAddressCounts {
    pub ipv4: usize,
    pub ipv6: usize,
}

#[async_trait]
pub trait NetworkIdentity: Send + Sync {
    /// Subnet addresses are drawn from.
    fn subnet_name(&self) -> &str;

    async fn lookup(&self, fqdn: &str) -> Result<ExistingBindings>;

    /// Pick one free IPv4 and one usable IPv6 and register both for `fqdn`.
    async fn allocate(&self, fqdn: &str) -> Result<IpBinding>;

    /// Remove every record bound to `fqdn`, returning the released addresses.
    async fn release(&self, fqdn: &str) -> Result<Vec<IpAddr>>;
}

pub struct NetworkAllocator {
    client: NetcenterClient,
    subnet: Subnet,
    claim_lock: Mutex<()>,
}

impl NetworkAllocator {
    pub fn new(client: NetcenterClient, subnet: Subnet) -> Self {
        Self {
            client,
            subnet,
            claim_lock: Mutex::new(()),
        }
    }

    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    pub async fn free_address_counts(&self) -> Result<FreeAddressCounts> {
        let ipv4 = self.client.free_ipv4s(self.subnet.v4_base()).await?;
        let ipv6 = self.client.free_ipv6s(self.subnet.v6_base()).await?;
        let usable_v6 = ipv6
            .iter()
            .filter(|ip| is_usable_ipv6(&self.subnet, **ip))
            .count();
        Ok(FreeAddressCounts {
            ipv4: ipv4.len(),
            ipv6: usable_v6,
        })
    }
}

#[async_trait]
impl NetworkIdentity for NetworkAllocator {
    fn subnet_name(&self) -> &str {
        &self.subnet.name
    }

    async fn lookup(&self, fqdn: &str) -> Result<ExistingBindings> {
        let used_v4 = self.client.used_ipv4s(self.subnet.v4_base()).await?;
        let used_v6 = self.client.used_ipv6s(self.subnet.v6_base()).await?;

        let mut bindings = ExistingBindings::default();
        for used in used_v4.into_iter().chain(used_v6) {
            if !same_name(&used.fqdn, fqdn) {
                continue;
            }
            match used.ip {
                IpAddr::V4(ip) => bindings.ipv4.push(ip),
                IpAddr::V6(ip) => bindings.ipv6.push(ip),
            }
        }

        tracing::debug!(
            "[NetworkAllocator] {} has IPv4 {:?} IPv6 {:?}",
            fqdn,
            bindings.ipv4,
            bindings.ipv6
        );
        Ok(bindings)
    }

    async fn allocate(&self, fqdn: &str) -> Result<IpBinding> {
        let _claim = self.claim_lock.lock().await;

        let free_v4 = self.client.free_ipv4s(self.subnet.v4_base()).await?;
        let ipv4 = pick_ipv4(&free_v4).ok_or_else(|| NetcenterError::NoFreeAddress {
            family: "IPv4",
            subnet: self.subnet.v4.to_string(),
        })?;

        let free_v6 = self.client.free_ipv6s(self.subnet.v6_base()).await?;
        let ipv6 =
            pick_ipv6(&self.subnet, &free_v6).ok_or_else(|| NetcenterError::NoFreeAddress {
                family: "IPv6",
                subnet: self.subnet.v6.to_string(),
            })?;

        tracing::info!(
            "[NetworkAllocator] {} free IPv4 in {}, choosing {} and {} for {}",
            free_v4.len(),
            self.subnet.v4,
            ipv4,
            ipv6,
            fqdn
        );

        self.client.create_dns_entry(IpAddr::V4(ipv4), fqdn).await?;

        // The IPv4 record stays registered if this fails
        if let Err(e) = self.client.create_dns_entry(IpAddr::V6(ipv6), fqdn).await {
            tracing::warn!(
                "[NetworkAllocator] IPv6 registration for {} failed, {} stays registered: {}",
                fqdn,
                ipv4,
                e
            );
            return Err(NetcenterError::PartialRegistration {
                fqdn: fqdn.to_string(),
                registered: IpAddr::V4(ipv4),
                source: Box::new(e),
            });
        }

        Ok(IpBinding {
            fqdn: fqdn.to_string(),
            ipv4,
            ipv6,
            subnet: self.subnet.name.clone(),
        })
    }

    async fn release(&self, fqdn: &str) -> Result<Vec<IpAddr>> {
        let bindings = self.lookup(fqdn).await?;
        let mut released = Vec::new();
        let mut failures = Vec::new();

        for ip in bindings.addresses() {
            match self.client.delete_dns_entry(ip).await {
                Ok(()) => released.push(ip),
                Err(e) => {
                    tracing::error!("[NetworkAllocator] Failed to release {} ({}): {}", ip, fqdn, e);
                    failures.push((ip, e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(NetcenterError::Release {
                fqdn: fqdn.to_string(),
                failures,
            });
        }
        Ok(released)
    }
}

/// First address the service reported as free.
pub fn pick_ipv4(free: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    free.first().copied()
}

/// First free address past the reserved low range of the subnet.
pub fn pick_ipv6(subnet: &Subnet, free: &[Ipv6Addr]) -> Option<Ipv6Addr> {
    free.iter().copied().find(|ip| is_usable_ipv6(subnet, *ip))
}

fn is_usable_ipv6(subnet: &Subnet, ip: Ipv6Addr) -> bool {
    subnet
        .v6_offset(ip)
        .map(|offset| offset > subnet.ipv6_exclusion_offset)
        .unwrap_or(false)
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('.').eq_ignore_ascii_case(b.trim().trim_end_matches('.'))
}
