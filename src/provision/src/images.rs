//! Catalogue of installable OS images.
//!
//! Each image maps to a cloud image file on the shared template store, the
//! account cloud-init creates for SSH access, the serial-console line that
//! marks the end of first boot and the apt sources written by post-install.

use crate::provisioner::ProvisionError;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Debian,
    Ubuntu,
}

impl Distro {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distro::Debian => "debian",
            Distro::Ubuntu => "ubuntu",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Full label as offered in the request form.
    pub id: &'static str,
    pub short: &'static str,
    pub codename: &'static str,
    pub distro: Distro,
    pub login_user: &'static str,
    /// Regex matched against serial console lines.
    pub boot_marker: &'static str,
}

const CLOUD_INIT_FINISHED: &str = r"Cloud-init .* finished";

pub static CATALOG: &[ImageSpec] = &[
    ImageSpec {
        id: "Ubuntu 22.04 - Jammy Jellyfish",
        short: "Ubuntu 22.04",
        codename: "jammy",
        distro: Distro::Ubuntu,
        login_user: "ubuntu",
        boot_marker: CLOUD_INIT_FINISHED,
    },
    ImageSpec {
        id: "Ubuntu 24.04 - Noble Numbat",
        short: "Ubuntu 24.04",
        codename: "noble",
        distro: Distro::Ubuntu,
        login_user: "ubuntu",
        boot_marker: CLOUD_INIT_FINISHED,
    },
    ImageSpec {
        id: "Debian 11 - Bullseye",
        short: "Debian 11",
        codename: "bullseye",
        distro: Distro::Debian,
        login_user: "debian",
        boot_marker: CLOUD_INIT_FINISHED,
    },
    ImageSpec {
        id: "Debian 12 - Bookworm",
        short: "Debian 12",
        codename: "bookworm",
        distro: Distro::Debian,
        login_user: "debian",
        boot_marker: CLOUD_INIT_FINISHED,
    },
    ImageSpec {
        id: "Debian 13 - Trixie",
        short: "Debian 13",
        codename: "trixie",
        distro: Distro::Debian,
        login_user: "debian",
        boot_marker: CLOUD_INIT_FINISHED,
    },
];

/// Find an image by full label, short label or codename (case-insensitive).
pub fn lookup(selector: &str) -> Result<&'static ImageSpec, ProvisionError> {
    let wanted = selector.trim();
    CATALOG
        .iter()
        .find(|image| {
            [image.id, image.short, image.codename]
                .iter()
                .any(|name| name.eq_ignore_ascii_case(wanted))
        })
        .ok_or_else(|| ProvisionError::UnknownImage(selector.to_string()))
}

impl ImageSpec {
    /// Cloud image path below the template store mount `dir`.
    pub fn image_path(&self, dir: &str) -> String {
        format!(
            "{}/cloudinit/current-{}-amd64.qcow2",
            dir.trim_end_matches('/'),
            self.codename
        )
    }

    pub fn marker_regex(&self) -> Result<Regex, ProvisionError> {
        Regex::new(self.boot_marker).map_err(|e| {
            ProvisionError::Config(format!("Invalid boot marker for {}: {}", self.id, e))
        })
    }

    /// Contents of `/etc/apt/sources.list` for this release.
    pub fn sources_list(&self) -> String {
        let c = self.codename;
        let entries: Vec<(String, String)> = match self.distro {
            Distro::Debian => vec![
                (
                    "http://ftp.ch.debian.org/debian/".to_string(),
                    format!("{} main", c),
                ),
                (
                    "http://ftp.ch.debian.org/debian/".to_string(),
                    format!("{}-updates main", c),
                ),
                (
                    "http://security.debian.org/debian-security".to_string(),
                    format!("{}-security main", c),
                ),
            ],
            Distro::Ubuntu => {
                let components = "main universe multiverse";
                vec![
                    (
                        "http://ch.archive.ubuntu.com/ubuntu/".to_string(),
                        format!("{} {}", c, components),
                    ),
                    (
                        "http://ch.archive.ubuntu.com/ubuntu/".to_string(),
                        format!("{}-updates {}", c, components),
                    ),
                    (
                        "http://security.ubuntu.com/ubuntu".to_string(),
                        format!("{}-security {}", c, components),
                    ),
                ]
            }
        };

        let mut out = String::new();
        for (mirror, suite) in entries {
            out.push_str(&format!("deb {} {}\n", mirror, suite));
            out.push_str(&format!("# deb-src {} {}\n", mirror, suite));
        }
        out
    }
}
