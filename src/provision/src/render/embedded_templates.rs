//! Embedded VM templates, compiled into the binary so the CLI is self-contained.

/// Hypervisor VM definition
pub static VM_CONFIG: &str = include_str!("templates/vm.conf.j2");

/// Network fragment appended to the VM definition after disk setup
pub static CLOUD_INIT_TAIL: &str = include_str!("templates/cloudinit.tail.j2");

/// First-login script run as root on the guest
pub static POST_INSTALL: &str = include_str!("templates/post-install.sh.j2");

/// All embedded templates as (name, content) pairs for registration with Tera.
pub const ALL_TEMPLATES: &[(&str, &str)] = &[
    ("vm.conf.j2", VM_CONFIG),
    ("cloudinit.tail.j2", CLOUD_INIT_TAIL),
    ("post-install.sh.j2", POST_INSTALL),
];
