//! SSH host key extraction from the first-boot console log.
//!
//! cloud-init prints the generated host keys between
//! `-----BEGIN SSH HOST KEY KEYS-----` and `-----END SSH HOST KEY KEYS-----`.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("no SSH host key block found in boot log")]
    NoHostKeyFound,

    #[error("no ssh-ed25519 host key among {}", .0.join(", "))]
    NoEd25519Key(Vec<String>),

    #[error("invalid {key_type} host key: {message}")]
    InvalidKey { key_type: String, message: String },
}

/// A public host key line: `<type> <base64>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKey {
    pub key_type: String,
    pub base64: String,
}

impl HostKey {
    /// Parse the first two fields of a key line, ignoring any comment.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let key_type = fields.next()?;
        let base64 = fields.next()?;
        if !key_type.starts_with("ssh-") && !key_type.starts_with("ecdsa-") {
            return None;
        }
        Some(Self {
            key_type: key_type.to_string(),
            base64: base64.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub key_type: String,
    pub sha256: String,
    pub md5: String,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.key_type, self.sha256, self.md5)
    }
}

const BEGIN_SENTINEL: &str = "-----BEGIN SSH HOST KEY KEYS-----";
const END_SENTINEL: &str = "-----END SSH HOST KEY KEYS-----";

fn host_key_block(log: &str) -> Option<&str> {
    let start = log.find(BEGIN_SENTINEL)? + BEGIN_SENTINEL.len();
    let len = log[start..].find(END_SENTINEL)?;
    Some(&log[start..start + len])
}

/// All host keys printed between the sentinels.
pub fn extract_host_keys(log: &str) -> Result<Vec<HostKey>, FingerprintError> {
    let block = host_key_block(log).ok_or(FingerprintError::NoHostKeyFound)?;

    let keys: Vec<HostKey> = block
        .lines()
        .filter_map(|line| {
            // Console lines may carry a kernel timestamp prefix
            let start = ["ssh-", "ecdsa-"]
                .iter()
                .filter_map(|p| line.find(p))
                .min()?;
            HostKey::parse(&line[start..])
        })
        .collect();

    if keys.is_empty() {
        return Err(FingerprintError::NoHostKeyFound);
    }
    Ok(keys)
}

pub fn select_ed25519(keys: &[HostKey]) -> Result<&HostKey, FingerprintError> {
    keys.iter()
        .find(|k| k.key_type == "ssh-ed25519")
        .ok_or_else(|| {
            FingerprintError::NoEd25519Key(keys.iter().map(|k| k.key_type.clone()).collect())
        })
}

/// `ssh-keygen -l` style SHA256 and MD5 fingerprints.
pub fn fingerprint(key: &HostKey) -> Result<Fingerprint, FingerprintError> {
    let blob = STANDARD
        .decode(key.base64.trim())
        .map_err(|e| FingerprintError::InvalidKey {
            key_type: key.key_type.clone(),
            message: e.to_string(),
        })?;

    let sha256 = format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&blob)));
    let md5 = format!(
        "MD5:{}",
        Md5::digest(&blob)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    );

    Ok(Fingerprint {
        key_type: key.key_type.clone(),
        sha256,
        md5,
    })
}

/// Fingerprints of every key. A garbled ed25519 key is an error; other
/// garbled keys are logged and left out.
pub fn fingerprint_all(keys: &[HostKey]) -> Result<Vec<Fingerprint>, FingerprintError> {
    let mut prints = Vec::with_capacity(keys.len());
    for key in keys {
        match fingerprint(key) {
            Ok(print) => prints.push(print),
            Err(e) if key.key_type != "ssh-ed25519" => {
                tracing::warn!("[Fingerprint] Skipping {}", e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(prints)
}

/// known_hosts line covering the name and both addresses.
pub fn known_hosts_entry(fqdn: &str, ipv4: Ipv4Addr, ipv6: Ipv6Addr, key: &HostKey) -> String {
    format!(
        "{},{},{} {} {}",
        fqdn, ipv4, ipv6, key.key_type, key.base64
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f";
    const ECDSA: &str = "AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4fICEiIyQlJicoKSorLC0uLzAxMjM0NTY3ODk6Ozw9Pj8=";

    fn boot_log() -> String {
        format!(
            "[  10.0] cloud-init[700]: Generating public/private ed25519 key pair.\n\
             -----BEGIN SSH HOST KEY KEYS-----\n\
             ecdsa-sha2-nistp256 {} root@testvm\n\
             ssh-ed25519 {} root@testvm\n\
             -----END SSH HOST KEY KEYS-----\n\
             Cloud-init v. 24.1 finished at today\n",
            ECDSA, ED25519
        )
    }

    #[test]
    fn test_extract_and_select() {
        let keys = extract_host_keys(&boot_log()).unwrap();
        assert_eq!(keys.len(), 2);
        let ed = select_ed25519(&keys).unwrap();
        assert_eq!(ed.base64, ED25519);
    }

    #[test]
    fn test_fingerprints_match_ssh_keygen() {
        let keys = extract_host_keys(&boot_log()).unwrap();
        let prints = fingerprint_all(&keys).unwrap();
        assert_eq!(
            prints[0].sha256,
            "SHA256:zS9hnzWeppM32oaZEwFAEXagQOJYmxUFy9OmfOm9QTI"
        );
        assert_eq!(
            prints[0].md5,
            "MD5:78:59:e9:5a:9c:eb:6b:1d:7c:53:90:3b:75:06:7f:01"
        );
        assert_eq!(
            prints[1].sha256,
            "SHA256:ZkAslGjFiUHdGf/WUL8rQvkib4PTvQatUV0OUQSncCA"
        );
        assert_eq!(
            prints[1].md5,
            "MD5:0f:a2:0a:d7:38:3e:65:45:08:6b:63:84:1c:ff:dc:ba"
        );
    }

    #[test]
    fn test_missing_block() {
        let err = extract_host_keys("Cloud-init v. 24.1 finished\n").unwrap_err();
        assert!(matches!(err, FingerprintError::NoHostKeyFound));
    }

    #[test]
    fn test_missing_ed25519() {
        let log = format!(
            "-----BEGIN SSH HOST KEY KEYS-----\necdsa-sha2-nistp256 {} root@x\n-----END SSH HOST KEY KEYS-----\n",
            ECDSA
        );
        let keys = extract_host_keys(&log).unwrap();
        let err = select_ed25519(&keys).unwrap_err();
        assert!(matches!(err, FingerprintError::NoEd25519Key(ref t) if t == &["ecdsa-sha2-nistp256"]));
    }

    #[test]
    fn test_invalid_base64() {
        let key = HostKey {
            key_type: "ssh-ed25519".into(),
            base64: "not base64!".into(),
        };
        assert!(matches!(
            fingerprint(&key),
            Err(FingerprintError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_garbled_secondary_key_is_skipped() {
        let keys = vec![
            HostKey {
                key_type: "ssh-rsa".into(),
                base64: "AAAA%truncated".into(),
            },
            HostKey {
                key_type: "ssh-ed25519".into(),
                base64: ED25519.into(),
            },
        ];
        let prints = fingerprint_all(&keys).unwrap();
        assert_eq!(prints.len(), 1);
        assert_eq!(prints[0].key_type, "ssh-ed25519");

        let keys = vec![HostKey {
            key_type: "ssh-ed25519".into(),
            base64: "AAAA%truncated".into(),
        }];
        assert!(matches!(
            fingerprint_all(&keys),
            Err(FingerprintError::InvalidKey { ref key_type, .. }) if key_type == "ssh-ed25519"
        ));
    }

    #[test]
    fn test_known_hosts_entry() {
        let key = HostKey::parse(&format!("ssh-ed25519 {} root@vm", ED25519)).unwrap();
        assert_eq!(
            known_hosts_entry(
                "testvm.vsos.ethz.ch",
                "192.33.91.40".parse().unwrap(),
                "2001:67c:10ec:49c3::21".parse().unwrap(),
                &key
            ),
            format!(
                "testvm.vsos.ethz.ch,192.33.91.40,2001:67c:10ec:49c3::21 ssh-ed25519 {}",
                ED25519
            )
        );
    }
}
