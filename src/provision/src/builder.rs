//! Renders the per-VM artifacts uploaded to the cluster nodes.

use crate::config::{NetworkConfig, StorageConfig};
use crate::identity::VmIdentity;
use crate::images::ImageSpec;
use crate::provisioner::ProvisionError;
use crate::render::TemplateRenderer;
use crate::request::VmCreationOptions;
use netcenter::IpBinding;
use tera::Context;

/// Everything the orchestrator writes for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Hypervisor VM definition, without network stanza.
    pub vm_config: String,
    /// `ipconfig0` line appended once disks are attached.
    pub cloud_init: String,
    /// `net0` line, appended last.
    pub net0: String,
    pub post_install: String,
    pub authorized_keys: String,
}

pub struct ConfigBuilder {
    renderer: TemplateRenderer,
    network: NetworkConfig,
    storage: StorageConfig,
}

impl ConfigBuilder {
    pub fn new(renderer: TemplateRenderer, network: NetworkConfig, storage: StorageConfig) -> Self {
        Self {
            renderer,
            network,
            storage,
        }
    }

    pub fn render(
        &self,
        options: &VmCreationOptions,
        image: &ImageSpec,
        identity: &VmIdentity,
        binding: &IpBinding,
        admin_keys: &str,
    ) -> Result<RenderedConfig, ProvisionError> {
        let mut vm = Context::new();
        vm.insert("description_lines", &description_lines(&options.notes));
        vm.insert("agent", &u8::from(options.use_qemu_agent));
        vm.insert("cores", &options.cores);
        vm.insert("memory_mb", &options.ram_mb);
        vm.insert("pool", &self.storage.pool);
        vm.insert("efi_disk", &identity.disks.efi);
        vm.insert("efi_size", &self.storage.efi_size);
        vm.insert("swap_disk", &identity.disks.swap);
        vm.insert("swap_size", &self.storage.swap_size);
        vm.insert("fqdn", &identity.fqdn);
        vm.insert("uuid", &uuid::Uuid::now_v7().to_string());
        vm.insert("tags", &options.tags.join(";"));
        let vm_config = self.renderer.render("vm.conf.j2", &vm)?;

        let mut net = Context::new();
        net.insert("gateway4", &self.network.gateway4);
        net.insert("netmask4", &self.network.netmask4);
        net.insert("gateway6", &self.network.gateway6);
        net.insert("netmask6", &self.network.netmask6);
        net.insert("ipv4", &binding.ipv4.to_string());
        net.insert("ipv6", &binding.ipv6.to_string());
        let cloud_init = self
            .renderer
            .render("cloudinit.tail.j2", &net)?
            .trim_end()
            .to_string();

        let mut post = Context::new();
        post.insert("fqdn", &identity.fqdn);
        post.insert("codename", image.codename);
        post.insert("distro", image.distro.as_str());
        post.insert("sources_list", image.sources_list().trim_end());
        post.insert("gateway6", &self.network.gateway6);
        post.insert("qemu_agent", &options.use_qemu_agent);
        let post_install = self.renderer.render("post-install.sh.j2", &post)?;

        tracing::debug!(
            "[ConfigBuilder] Rendered configuration for VM {} ({})",
            identity.vmid,
            identity.fqdn
        );

        Ok(RenderedConfig {
            vm_config,
            cloud_init,
            net0: net0_line(&self.network, &identity.mac),
            post_install,
            authorized_keys: authorized_keys(&options.ssh_keys, admin_keys),
        })
    }
}

/// Request keys followed by the administrative keys, one per line.
pub fn authorized_keys(user_keys: &[String], admin_keys: &str) -> String {
    let mut out = String::new();
    for key in user_keys
        .iter()
        .map(String::as_str)
        .chain(admin_keys.lines())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        out.push_str(key);
        out.push('\n');
    }
    out
}

pub fn net0_line(network: &NetworkConfig, mac: &str) -> String {
    format!(
        "net0: {}={},bridge={},rate={}",
        network.nic_model, mac, network.bridge, network.rate_limit
    )
}

fn description_lines(notes: &str) -> Vec<String> {
    notes
        .lines()
        .map(|l| l.trim_end().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}
