//! Provisioner configuration loading, defaults and validation.

use provision::{ErrorKind, ProvisionError, ProvisionerConfig, RemoteTarget};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const SAMPLE: &str = r#"
[cluster_manager]
host = "cm-01.sos.ethz.ch"

[compute]
host = "comp-epyc-lee-3.sos.ethz.ch"
user = "provision"
port = 2222
identity_file = "/etc/vmwiz/id_ed25519"

[hypervisor]
api_url = "https://pve.sos.ethz.ch:8006/"
user = "vmwiz@pve"
token_id = "automation"
token_secret = "from-file"
node = "comp-epyc-lee-3"

[netcenter]
user = "svc-vmwiz"
password = "hunter2"

[vm]
domain = "vsos.ethz.ch"
admin_pubkey_path = "/etc/vmwiz/admin.pub"

[boot]
timeout_secs = 900
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_sample_with_defaults() {
    let file = write_config(SAMPLE);
    let config = ProvisionerConfig::load(file.path()).unwrap();

    assert_eq!(config.cluster_manager.user, "root");
    assert_eq!(config.cluster_manager.port, 22);
    assert_eq!(config.compute.port, 2222);
    assert_eq!(
        config.compute.identity_file.as_deref(),
        Some(Path::new("/etc/vmwiz/id_ed25519"))
    );
    assert_eq!(
        config.compute.role_pattern(RemoteTarget::Compute),
        RemoteTarget::Compute.default_role_pattern()
    );

    assert_eq!(config.hypervisor.timeout_secs, 10);
    assert_eq!(config.network.netmask6, 118);
    assert_eq!(config.network.bridge, "vmbr1");
    assert_eq!(config.storage.pool, "ssd");
    assert_eq!(config.storage.template_dir_compute, "/mnt/pve/cnfs");
    assert_eq!(config.pools.personal, "vsos");
    assert_eq!(config.pools.organization, "vsos-org");
    assert_eq!(config.vm.id_min, 100_000);
    assert_eq!(config.boot.timeout(), Duration::from_secs(900));
    assert_eq!(config.boot.heartbeat(), Duration::from_secs(30));
    assert_eq!(config.paths.known_hosts, "/root/.ssh/known_hosts");
    assert!(config.paths.templates_dir.is_none());
}

#[test]
fn test_missing_file_is_config_error() {
    let err = ProvisionerConfig::load(Path::new("/nonexistent/vmwiz.toml")).unwrap_err();
    assert!(matches!(err, ProvisionError::Config(_)));
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn test_malformed_toml_is_rejected() {
    let file = write_config("[vm\nid_min = 1");
    let err = ProvisionerConfig::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_validate_rejects_inverted_id_range() {
    let mut config: ProvisionerConfig = toml::from_str(SAMPLE).unwrap();
    assert!(config.validate().is_ok());

    config.vm.id_min = 200_000;
    config.vm.id_max = 100_000;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("vm.id_min (200000) must be below vm.id_max (100000)"));
}

#[test]
fn test_validate_rejects_bad_role_pattern() {
    let mut config: ProvisionerConfig = toml::from_str(SAMPLE).unwrap();
    config.cluster_manager.role_pattern = Some("cm-(".to_string());
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("role_pattern"));
}

#[test]
fn test_validate_requires_hosts_and_pool() {
    let mut config: ProvisionerConfig = toml::from_str(SAMPLE).unwrap();
    config.compute.host.clear();
    assert!(config.validate().is_err());

    let mut config: ProvisionerConfig = toml::from_str(SAMPLE).unwrap();
    config.storage.pool = " ".to_string();
    assert!(config
        .validate()
        .unwrap_err()
        .to_string()
        .contains("storage.pool is not set"));

    let mut config: ProvisionerConfig = toml::from_str(SAMPLE).unwrap();
    config.netcenter.password.clear();
    assert!(config.validate().is_err());
}

#[test]
fn test_env_overrides_token_secret() {
    let mut config: ProvisionerConfig = toml::from_str(SAMPLE).unwrap();
    std::env::set_var("PVE_UUID", "from-env");
    config.apply_env();
    std::env::remove_var("PVE_UUID");

    assert_eq!(config.hypervisor.token_secret, "from-env");
    // Unset variables leave the file value alone
    assert_eq!(config.hypervisor.node, "comp-epyc-lee-3");
}
