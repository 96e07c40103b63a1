//! Shell one-liners issued on the cluster nodes.
//!
//! Kept as pure functions so the exact strings can be asserted in tests
//! without a remote host.

use std::net::IpAddr;

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Well-known paths of one VM's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    vmid: u32,
}

impl RemotePaths {
    pub fn new(vmid: u32) -> Self {
        Self { vmid }
    }

    pub fn vm_config(&self) -> String {
        format!("/etc/pve/local/qemu-server/{}.conf", self.vmid)
    }

    pub fn authorized_keys(&self) -> String {
        format!("/tmp/vmwiz-{}.ssh.pub", self.vmid)
    }

    pub fn cloud_init_tail(&self) -> String {
        format!("/tmp/vmwiz-{}.cloudinit.tail", self.vmid)
    }

    pub fn serial_console(&self) -> String {
        format!("/var/run/qemu-server/{}.serial0", self.vmid)
    }

    pub fn boot_log(&self) -> String {
        format!("/tmp/{}.vmwiz.boot.log", self.vmid)
    }

    pub fn post_install_script(&self) -> String {
        format!("/tmp/{}-vmwiz-post-install.sh", self.vmid)
    }

    pub fn post_install_log(&self) -> String {
        format!("/tmp/{}-vmwiz-post-install.log", self.vmid)
    }

    pub fn post_install_script_on_vm(&self, user: &str) -> String {
        format!("/home/{}/vmwiz-post-install.sh", user)
    }
}

pub fn hostname_query() -> &'static str {
    "hostname --fqdn"
}

pub fn create_block_disk(pool: &str, size: &str, name: &str) -> String {
    format!(
        "rbd -p {} create --size {} {}",
        shell_quote(pool),
        shell_quote(size),
        shell_quote(name)
    )
}

pub fn import_disk(vmid: u32, image: &str, pool: &str) -> String {
    format!(
        "qm importdisk {} {} {}",
        vmid,
        shell_quote(image),
        shell_quote(pool)
    )
}

pub fn attach_root_disk(vmid: u32, pool: &str, disk: &str) -> String {
    format!(
        "qm set {} --scsi0 {}",
        vmid,
        shell_quote(&format!("{}:{},discard=on", pool, disk))
    )
}

pub fn resize_root_disk(vmid: u32, size_gb: u32) -> String {
    format!("qm resize {} scsi0 {}G", vmid, size_gb)
}

pub fn append_file(source: &str, destination: &str) -> String {
    format!(
        "cat {} >> {}",
        shell_quote(source),
        shell_quote(destination)
    )
}

pub fn append_line(line: &str, destination: &str) -> String {
    format!(
        "printf '%s\\n' {} >> {}",
        shell_quote(line),
        shell_quote(destination)
    )
}

pub fn attach_cloud_init_disk(vmid: u32, pool: &str) -> String {
    format!(
        "qm set {} --scsi2 {}",
        vmid,
        shell_quote(&format!("{}:cloudinit", pool))
    )
}

pub fn set_ssh_keys(vmid: u32, keys_path: &str) -> String {
    format!("qm set {} --sshkey {}", vmid, shell_quote(keys_path))
}

pub fn start_vm(vmid: u32) -> String {
    format!("qm start {}", vmid)
}

pub fn tail_serial_console(console_path: &str) -> String {
    format!("socat -u {} -", shell_quote(console_path))
}

pub fn forget_known_host(known_hosts: &str, host: &str) -> String {
    format!(
        "ssh-keygen -f {} -R {}",
        shell_quote(known_hosts),
        shell_quote(host)
    )
}

pub fn copy_to_vm(source: &str, user: &str, ip: IpAddr, destination: &str) -> String {
    format!(
        "scp -o BatchMode=yes {} {}@{}:{}",
        shell_quote(source),
        user,
        scp_host(ip),
        shell_quote(destination)
    )
}

/// Run the uploaded script as root on the VM; output lands in `log` on the
/// node issuing the command.
pub fn run_post_install(user: &str, ip: IpAddr, script: &str, log: &str) -> String {
    let remote = format!("chmod +x {0} && sudo {0}", shell_quote(script));
    format!(
        "ssh -o BatchMode=yes {}@{} {} > {} 2>&1",
        user,
        ip,
        shell_quote(&remote),
        shell_quote(log)
    )
}

fn scp_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ssd"), "ssd");
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_disk_commands() {
        assert_eq!(
            create_block_disk("ssd", "512M", "vm-123456-disk-0"),
            "rbd -p ssd create --size 512M vm-123456-disk-0"
        );
        assert_eq!(
            attach_root_disk(123456, "ssd", "vm-123456-disk-1"),
            "qm set 123456 --scsi0 ssd:vm-123456-disk-1,discard=on"
        );
        assert_eq!(resize_root_disk(123456, 15), "qm resize 123456 scsi0 15G");
        assert_eq!(
            import_disk(123456, "/mnt/pve/cnfs/cloudinit/current-noble-amd64.qcow2", "ssd"),
            "qm importdisk 123456 /mnt/pve/cnfs/cloudinit/current-noble-amd64.qcow2 ssd"
        );
    }

    #[test]
    fn test_append_line_quotes_payload() {
        assert_eq!(
            append_line(
                "net0: virtio=02:9b:c6:ff:a5:9b,bridge=vmbr1,rate=125",
                "/etc/pve/local/qemu-server/1.conf"
            ),
            "printf '%s\\n' 'net0: virtio=02:9b:c6:ff:a5:9b,bridge=vmbr1,rate=125' >> /etc/pve/local/qemu-server/1.conf"
        );
    }

    #[test]
    fn test_post_install_command() {
        let ip: IpAddr = "192.33.91.40".parse().unwrap();
        assert_eq!(
            run_post_install(
                "ubuntu",
                ip,
                "/home/ubuntu/vmwiz-post-install.sh",
                "/tmp/1-vmwiz-post-install.log"
            ),
            "ssh -o BatchMode=yes ubuntu@192.33.91.40 'chmod +x /home/ubuntu/vmwiz-post-install.sh && sudo /home/ubuntu/vmwiz-post-install.sh' > /tmp/1-vmwiz-post-install.log 2>&1"
        );
    }

    #[test]
    fn test_scp_brackets_ipv6() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(
            copy_to_vm("/tmp/s.sh", "debian", ip, "/home/debian/s.sh"),
            "scp -o BatchMode=yes /tmp/s.sh debian@[2001:db8::1]:/home/debian/s.sh"
        );
    }

    #[test]
    fn test_paths() {
        let p = RemotePaths::new(654321);
        assert_eq!(p.vm_config(), "/etc/pve/local/qemu-server/654321.conf");
        assert_eq!(p.serial_console(), "/var/run/qemu-server/654321.serial0");
        assert_eq!(p.cloud_init_tail(), "/tmp/vmwiz-654321.cloudinit.tail");
        assert_eq!(
            p.post_install_script_on_vm("debian"),
            "/home/debian/vmwiz-post-install.sh"
        );
    }
}
