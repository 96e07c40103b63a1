//! VM identity: numeric id, MAC address and disk names.

use crate::provisioner::ProvisionError;
use md5::{Digest, Md5};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// MAC address derived from the FQDN.
///
/// First five bytes of md5(fqdn) behind a `02` octet, which sets the
/// locally-administered bit and keeps the address unicast.
pub fn mac_from_fqdn(fqdn: &str) -> String {
    let digest = Md5::digest(fqdn.as_bytes());
    let mut octets = vec!["02".to_string()];
    octets.extend(digest.iter().take(5).map(|b| format!("{:02x}", b)));
    octets.join(":")
}

/// Block device names of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSet {
    pub efi: String,
    pub swap: String,
    pub root: String,
}

impl DiskSet {
    pub fn for_vmid(vmid: u32) -> Self {
        Self {
            efi: format!("vm-{}-efivars", vmid),
            swap: format!("vm-{}-disk-0", vmid),
            root: format!("vm-{}-disk-1", vmid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub vmid: u32,
    pub fqdn: String,
    pub mac: String,
    pub disks: DiskSet,
}

impl VmIdentity {
    pub fn new(vmid: u32, fqdn: &str) -> Self {
        Self {
            vmid,
            fqdn: fqdn.to_string(),
            mac: mac_from_fqdn(fqdn),
            disks: DiskSet::for_vmid(vmid),
        }
    }
}

/// Half-open range `[min, max)` VM ids are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmIdRange {
    pub min: u32,
    pub max: u32,
}

impl VmIdRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, id: u32) -> bool {
        (self.min..self.max).contains(&id)
    }
}

/// Draw a random id not present in `taken`, giving up after `attempts` draws.
pub fn allocate_vmid<R: Rng + ?Sized>(
    range: VmIdRange,
    taken: &HashSet<u32>,
    attempts: u32,
    rng: &mut R,
) -> Result<u32, ProvisionError> {
    if range.min >= range.max {
        return Err(ProvisionError::Config(format!(
            "Empty VM id range {}..{}",
            range.min, range.max
        )));
    }

    for attempt in 1..=attempts {
        let candidate = rng.gen_range(range.min..range.max);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        tracing::debug!(
            "[Identity] VM id {} already in use (attempt {}/{})",
            candidate,
            attempt,
            attempts
        );
    }

    Err(ProvisionError::VmIdExhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_mac_known_values() {
        assert_eq!(mac_from_fqdn("testvm.vsos.ethz.ch"), "02:9b:c6:ff:a5:9b");
        assert_eq!(mac_from_fqdn("example.vsos.ethz.ch"), "02:47:fb:2b:f8:17");
    }

    #[test]
    fn test_mac_is_deterministic_and_local() {
        for name in ["a.vsos.ethz.ch", "b.vsos.ethz.ch", "", "x"] {
            let mac = mac_from_fqdn(name);
            assert_eq!(mac, mac_from_fqdn(name));
            assert!(mac.starts_with("02:"));
            assert_eq!(mac.len(), 17);
        }
    }

    #[test]
    fn test_disk_names() {
        let disks = DiskSet::for_vmid(123456);
        assert_eq!(disks.efi, "vm-123456-efivars");
        assert_eq!(disks.swap, "vm-123456-disk-0");
        assert_eq!(disks.root, "vm-123456-disk-1");
    }

    #[test]
    fn test_vmid_avoids_taken_ids() {
        let range = VmIdRange::new(100, 104);
        let taken: HashSet<u32> = [100, 101, 103].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(allocate_vmid(range, &taken, 200, &mut rng).unwrap(), 102);
        }
    }

    #[test]
    fn test_vmid_six_digits() {
        let range = VmIdRange::new(100_000, 999_999);
        let mut rng = StdRng::seed_from_u64(1);
        let id = allocate_vmid(range, &HashSet::new(), 1, &mut rng).unwrap();
        assert!(range.contains(id));
        assert_eq!(id.to_string().len(), 6);
    }

    #[test]
    fn test_vmid_exhausted() {
        let range = VmIdRange::new(10, 12);
        let taken: HashSet<u32> = [10, 11].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(3);
        let err = allocate_vmid(range, &taken, 5, &mut rng).unwrap_err();
        assert!(matches!(err, ProvisionError::VmIdExhausted { attempts: 5 }));
    }
}
