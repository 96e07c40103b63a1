//! Netcenter IPAM client and network identity allocation.

pub mod allocator;
pub mod client;
pub mod config;
pub mod error;
pub mod xml;

pub use allocator::{
    pick_ipv4, pick_ipv6, ExistingBindings, FreeAddressCounts, IpBinding, NetworkAllocator,
    NetworkIdentity,
};
pub use client::{NetcenterClient, UsedAddress};
pub use config::{NetcenterConfig, Subnet, SubnetConfig};
pub use error::{NetcenterError, Result};
