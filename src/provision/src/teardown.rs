//! Decommissioning VMs by name.

use crate::provisioner::ProvisionError;
use crate::pve::{DeleteOptions, Hypervisor};
use netcenter::NetworkIdentity;
use std::net::IpAddr;

/// What a decommission run removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// `(node, vmid)` of every deleted VM.
    pub deleted: Vec<(String, u32)>,
    pub released: Vec<IpAddr>,
}

/// Stop and delete every VM called `name`, then optionally release its DNS
/// entries.
///
/// Every VM is attempted even if an earlier one fails; the failures are
/// reported together. DNS is only released when all VMs are gone.
pub async fn decommission(
    hypervisor: &dyn Hypervisor,
    network: &dyn NetworkIdentity,
    name: &str,
    delete_dns: bool,
) -> Result<TeardownReport, ProvisionError> {
    let vms = hypervisor.vms_by_name(name).await?;
    if vms.is_empty() {
        return Err(ProvisionError::Validation(format!(
            "No VM named {} found",
            name
        )));
    }
    tracing::info!("[Teardown] Found {} VM(s) named {}", vms.len(), name);

    let mut report = TeardownReport::default();
    let mut failures = Vec::new();

    for vm in &vms {
        let result = async {
            hypervisor.force_stop(&vm.node, vm.vmid).await?;
            hypervisor
                .delete_vm(&vm.node, vm.vmid, DeleteOptions::default())
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!("[Teardown] Deleted VM {} on {}", vm.vmid, vm.node);
                report.deleted.push((vm.node.clone(), vm.vmid));
            }
            Err(e) => {
                tracing::error!("[Teardown] VM {} on {}: {}", vm.vmid, vm.node, e);
                failures.push(format!("VM {} on {}: {}", vm.vmid, vm.node, e));
            }
        }
    }

    if !failures.is_empty() {
        return Err(ProvisionError::Teardown {
            name: name.to_string(),
            total: vms.len(),
            failures,
        });
    }

    if delete_dns {
        report.released = network.release(name).await?;
        tracing::info!(
            "[Teardown] Released {} address(es) of {}",
            report.released.len(),
            name
        );
    }
    Ok(report)
}
