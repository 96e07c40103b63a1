//! Unit tests for Netcenter configuration
//!
//! Defaults, TOML parsing and validation of subnet definitions.

use netcenter::{NetcenterConfig, NetcenterError, SubnetConfig};
use std::net::Ipv4Addr;

#[test]
fn test_defaults_match_vm_subnet() {
    let config = NetcenterConfig::default();
    assert_eq!(config.base_url, "https://www.netcenter.ethz.ch");
    assert_eq!(config.isg_group, "adm-soseth");
    assert_eq!(config.subnet.name, "vm");
    assert_eq!(config.subnet.ipv6_exclusion_offset, 0x20);
}

#[test]
fn test_parse_from_toml() {
    let config: NetcenterConfig = toml::from_str(
        r#"
base_url = "https://netcenter.example.org/"
user = "svc"
password = "pw"

[subnet]
name = "lab"
ipv4 = "10.1.2.0/25"
ipv6 = "fd00:1::/120"
ipv6_exclusion_offset = 16
"#,
    )
    .unwrap();

    assert_eq!(config.isg_group, "adm-soseth");
    assert_eq!(config.timeout_secs, 30);
    let subnet = config.subnet.parse().unwrap();
    assert_eq!(subnet.name, "lab");
    assert_eq!(subnet.v4_base(), Ipv4Addr::new(10, 1, 2, 0));
    assert_eq!(subnet.ipv6_exclusion_offset, 16);
    assert!(config.validate().is_ok());
}

#[test]
fn test_validate_requires_credentials() {
    let config = NetcenterConfig::default();
    assert!(matches!(config.validate(), Err(NetcenterError::Config(_))));
}

#[test]
fn test_validate_rejects_bad_subnet() {
    let config = NetcenterConfig {
        user: "svc".into(),
        password: "pw".into(),
        subnet: SubnetConfig {
            ipv6: "2001:67c:10ec:49c3::/200".into(),
            ..SubnetConfig::default()
        },
        ..NetcenterConfig::default()
    };
    assert!(config.validate().is_err());
}
