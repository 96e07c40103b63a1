//! VM provisioning crate
//!
//! Turns an accepted VM request into a running, reachable VM on the cluster:
//! network identity, VM identity and rendered configuration, remote execution
//! on the cluster-manager and compute nodes, first-boot monitoring and host
//! key capture. Request storage and notifications are reached through traits.

pub mod progress;
pub mod provisioner;

pub use progress::ProvisionProgress;
pub use provisioner::{
    ChannelProgressReporter, ErrorKind, LogProgressReporter, ProgressReporter, ProvisionError,
    ResultExt,
};

pub mod config;
pub use config::{ProvisionerConfig, DEFAULT_CONFIG_FILE};

// Remote execution on the cluster nodes
pub mod remote;
pub use remote::{CommandOutput, RemoteError, RemoteExecutor, RemoteTarget, SshExecutor};

pub mod tasks;
pub mod workflow;

// Identity and configuration
pub mod builder;
pub mod identity;
pub mod images;
pub mod render;
pub use builder::{ConfigBuilder, RenderedConfig};
pub use identity::{mac_from_fqdn, VmIdRange, VmIdentity};
pub use render::TemplateRenderer;

pub mod boot_monitor;
pub mod fingerprint;
pub use boot_monitor::{BootMonitor, BootOutcome, BootSettings};
pub use fingerprint::{Fingerprint, FingerprintError, HostKey};

pub mod pve;
pub use pve::{Hypervisor, PveClient};

pub mod orchestrator;
pub use orchestrator::{
    CompensatableAction, Orchestrator, ProvisionFailure, ProvisionState, ProvisionedVm,
    Services, VmProvisioner,
};

pub mod request;
pub use request::{
    EditRequest, LogNotifier, MemoryRequestStore, Notifier, RequestHandler, RequestStatus,
    RequestStore, VmCreationOptions, VmRequest,
};

pub mod startup_check;
pub mod teardown;
pub use startup_check::StartupCheck;
pub use teardown::{decommission, TeardownReport};
