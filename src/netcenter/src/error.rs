use std::net::IpAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetcenterError>;

#[derive(Error, Debug)]
pub enum NetcenterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {url} returned status {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Netcenter rejected the request: {0}")]
    Rejected(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Invalid address '{0}' in Netcenter response")]
    InvalidAddress(String),

    #[error("No free {family} address in subnet {subnet}")]
    NoFreeAddress {
        family: &'static str,
        subnet: String,
    },

    #[error("Registered {registered} for {fqdn} but the second registration failed: {source}")]
    PartialRegistration {
        fqdn: String,
        registered: IpAddr,
        #[source]
        source: Box<NetcenterError>,
    },

    #[error("Failed to release {} address(es) of {fqdn}: {}", .failures.len(), format_failures(.failures))]
    Release {
        fqdn: String,
        failures: Vec<(IpAddr, String)>,
    },
}

fn format_failures(failures: &[(IpAddr, String)]) -> String {
    failures
        .iter()
        .map(|(ip, e)| format!("{}: {}", ip, e))
        .collect::<Vec<_>>()
        .join("; ")
}

impl NetcenterError {
    /// True for "the subnet ran dry", which callers may retry later.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, NetcenterError::NoFreeAddress { .. })
    }
}
