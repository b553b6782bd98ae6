//! Preflight checks for host tooling.
//!
//! Validates that the host has the tools the attach strategy and sandbox
//! shell out to, before any image is touched.
//!
//! # Example
//!
//! ```rust
//! use disk_provisioner::platform::HostOs;
//! use disk_provisioner::preflight::{check_required_tools, command_exists, required_tools};
//!
//! if !command_exists("losetup") {
//!     println!("util-linux not installed");
//! }
//!
//! if let Err(e) = check_required_tools(required_tools(HostOs::Linux)) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::platform::HostOs;
use anyhow::{bail, Result};

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools used on Linux hosts. Each tuple is (command_name, package_name).
pub const LINUX_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("lsblk", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("chroot", "coreutils"),
];

/// Tools used on macOS hosts.
pub const DARWIN_TOOLS: &[(&str, &str)] = &[
    ("hdiutil", "macOS base system"),
    ("diskutil", "macOS base system"),
];

/// Tools required on `os`.
pub fn required_tools(os: HostOs) -> &'static [(&'static str, &'static str)] {
    match os {
        HostOs::Linux => LINUX_TOOLS,
        HostOs::Darwin => DARWIN_TOOLS,
        HostOs::Unknown => &[],
    }
}

/// Tools for writing images to removable media on Linux.
pub const LINUX_MEDIA_TOOLS: &[(&str, &str)] = &[
    ("lsblk", "util-linux"),
    ("umount", "util-linux"),
    ("eject", "util-linux"),
    ("dd", "coreutils"),
];

/// Tools for writing images to removable media on macOS.
pub const DARWIN_MEDIA_TOOLS: &[(&str, &str)] = &[
    ("diskutil", "macOS base system"),
    ("plutil", "macOS base system"),
    ("dd", "macOS base system"),
];

/// Tools the media backend for `os` shells out to.
pub fn media_tools(os: HostOs) -> &'static [(&'static str, &'static str)] {
    match os {
        HostOs::Linux => LINUX_MEDIA_TOOLS,
        HostOs::Darwin => DARWIN_MEDIA_TOOLS,
        HostOs::Unknown => &[],
    }
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and the package providing it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}
