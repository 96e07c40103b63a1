//! Progress reporting and error types for provisioning operations.

use crate::fingerprint::FingerprintError;
use crate::orchestrator::ProvisionFailure;
use crate::progress::ProvisionProgress;
use crate::remote::RemoteError;
use netcenter::NetcenterError;
use std::net::IpAddr;
use std::time::Instant;

/// Channel-based progress reporter.
pub struct ChannelProgressReporter {
    sender: tokio::sync::mpsc::Sender<ProvisionProgress>,
    fqdn: String,
    started: Instant,
}

impl ChannelProgressReporter {
    pub fn with_fqdn(sender: tokio::sync::mpsc::Sender<ProvisionProgress>, fqdn: String) -> Self {
        Self {
            sender,
            fqdn,
            started: Instant::now(),
        }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        self.emit_detailed(percentage, message, None, None);
    }

    fn emit_detailed(
        &self,
        percentage: u32,
        message: String,
        phase: Option<String>,
        _task_name: Option<String>,
    ) {
        let progress = ProvisionProgress::new(
            self.fqdn.clone(),
            percentage,
            message,
            self.started.elapsed(),
        )
        .in_phase(phase.as_deref());
        let _ = self.sender.try_send(progress);
    }
}

/// Reporter that only writes to the log.
pub struct LogProgressReporter;

impl ProgressReporter for LogProgressReporter {
    fn emit(&self, percentage: u32, message: String) {
        tracing::info!("[Progress] {:>3}% {}", percentage, message);
    }
}

/// Progress reporter for provisioning operations.
pub trait ProgressReporter: Send + Sync + 'static {
    fn emit(&self, percentage: u32, message: String);

    /// Emit progress with phase and task_name metadata.
    fn emit_detailed(
        &self,
        percentage: u32,
        message: String,
        _phase: Option<String>,
        _task_name: Option<String>,
    ) {
        self.emit(percentage, message);
    }
}

/// Coarse failure classes surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or misconfigured target; nothing was changed.
    Validation,
    /// No address or VM id could be obtained.
    Allocation,
    /// Transport or command failure; remote state may be partial.
    RemoteExecution,
    BootTimeout,
    /// The VM runs but its host keys could not be captured.
    FingerprintExtraction,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Allocation => "allocation",
            ErrorKind::RemoteExecution => "remote execution",
            ErrorKind::BootTimeout => "boot timeout",
            ErrorKind::FingerprintExtraction => "fingerprint extraction",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error type for provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown image '{0}'")]
    UnknownImage(String),

    #[error("{target} host '{hostname}' does not match role pattern '{pattern}'")]
    RoleMismatch {
        target: String,
        hostname: String,
        pattern: String,
    },

    #[error("{fqdn} must have at most one IPv4 and one IPv6 address, found {ipv4} and {ipv6}")]
    AmbiguousBinding {
        fqdn: String,
        ipv4: usize,
        ipv6: usize,
    },

    #[error("{fqdn} already has DNS entries ({}); use reinstall or release them first", format_addrs(.addresses))]
    AlreadyBound { fqdn: String, addresses: Vec<IpAddr> },

    #[error("Cannot reinstall {fqdn}: it does not have both an IPv4 and an IPv6 DNS entry")]
    MissingBinding { fqdn: String },

    #[error("Network allocation failed: {0}")]
    Allocation(#[from] NetcenterError),

    #[error("No unused VM id found after {attempts} attempts")]
    VmIdExhausted { attempts: u32 },

    #[error("Remote execution failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Hypervisor API error: {0}")]
    Hypervisor(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("VM did not finish first boot within {elapsed_secs}s")]
    BootTimeout { elapsed_secs: u64 },

    #[error("Serial console closed before first boot completed")]
    ConsoleClosed,

    #[error("Provisioning cancelled")]
    Cancelled,

    #[error("Host key extraction failed: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Request store error: {0}")]
    Request(String),

    #[error("{0}")]
    Failed(Box<ProvisionFailure>),

    #[error("Failed to remove {} of {total} VMs named {name}: {}", .failures.len(), .failures.join("; "))]
    Teardown {
        name: String,
        total: usize,
        failures: Vec<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProvisionError>,
    },
}

fn format_addrs(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(|ip| ip.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Validation(_)
            | ProvisionError::UnknownImage(_)
            | ProvisionError::RoleMismatch { .. }
            | ProvisionError::AmbiguousBinding { .. }
            | ProvisionError::AlreadyBound { .. } => ErrorKind::Validation,
            ProvisionError::MissingBinding { .. } | ProvisionError::VmIdExhausted { .. } => {
                ErrorKind::Allocation
            }
            // Only an exhausted subnet is side-effect free; anything else may
            // have reached the IPAM service.
            ProvisionError::Allocation(n) if n.is_exhaustion() => ErrorKind::Allocation,
            ProvisionError::Allocation(NetcenterError::Config(_)) => ErrorKind::Internal,
            ProvisionError::Allocation(_) => ErrorKind::RemoteExecution,
            ProvisionError::Remote(_)
            | ProvisionError::Hypervisor(_)
            | ProvisionError::ConsoleClosed
            | ProvisionError::Teardown { .. } => ErrorKind::RemoteExecution,
            ProvisionError::BootTimeout { .. } => ErrorKind::BootTimeout,
            ProvisionError::Fingerprint(_) => ErrorKind::FingerprintExtraction,
            ProvisionError::Cancelled => ErrorKind::Cancelled,
            ProvisionError::Config(_)
            | ProvisionError::Template(_)
            | ProvisionError::Request(_)
            | ProvisionError::Internal(_)
            | ProvisionError::Io(_) => ErrorKind::Internal,
            ProvisionError::Failed(failure) => failure.error.kind(),
            ProvisionError::Context { source, .. } => source.kind(),
        }
    }

    /// Innermost error beneath any context wrappers.
    pub fn root(&self) -> &ProvisionError {
        match self {
            ProvisionError::Context { source, .. } => source.root(),
            ProvisionError::Failed(failure) => failure.error.root(),
            other => other,
        }
    }
}

/// Attach an operation name to an error, building the breadcrumb chain.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, ProvisionError>;
}

impl<T, E: Into<ProvisionError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, ProvisionError> {
        self.map_err(|e| ProvisionError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }
}
