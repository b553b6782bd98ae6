//! Host platform detection and capability resolution.
//!
//! Runs once before anything touches host state. Decides which block-device
//! attach strategy is usable and whether the chroot sandbox may run at all.

use crate::attach::loop_mount::LoopMountStrategy;
use crate::attach::virtual_disk::VirtualDiskAttachStrategy;
use crate::attach::AttachStrategy;
use crate::error::PlatformError;
use crate::media::{DiskutilMedia, LsblkMedia, MediaBackend};
use crate::preflight;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HostOs {
    Linux,
    Darwin,
    Unknown,
}

impl fmt::Display for HostOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostOs::Linux => write!(f, "linux"),
            HostOs::Darwin => write!(f, "darwin"),
            HostOs::Unknown => write!(f, "unknown"),
        }
    }
}

/// CPU architecture, used for both the host and the image target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
    Arm,
    Riscv64,
    Unknown,
}

impl Arch {
    /// Architecture of the running binary.
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        return Arch::X86_64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Aarch64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(target_arch = "riscv64")]
        return Arch::Riscv64;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "riscv64"
        )))]
        return Arch::Unknown;
    }

    /// Architecture name as used in `qemu-<name>-static`.
    pub fn qemu_name(&self) -> Option<&'static str> {
        match self {
            Arch::X86_64 => Some("x86_64"),
            Arch::Aarch64 => Some("aarch64"),
            Arch::Arm => Some("arm"),
            Arch::Riscv64 => Some("riscv64"),
            Arch::Unknown => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qemu_name().unwrap_or("unknown"))
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Arch::X86_64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "arm" | "armhf" | "armv7" | "armv7l" | "armv6" => Ok(Arch::Arm),
            "riscv64" => Ok(Arch::Riscv64),
            other => Err(format!(
                "unsupported architecture '{}' (expected x86_64, aarch64, arm or riscv64)",
                other
            )),
        }
    }
}

/// Host primitive the core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Expose an image file as a partitioned block device.
    BlockAttach,
    /// Bind host kernel interfaces into another root.
    BindMount,
    /// Run commands with another root as filesystem context.
    SandboxExecution,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::BlockAttach => write!(f, "block-attach"),
            Capability::BindMount => write!(f, "bind-mount"),
            Capability::SandboxExecution => write!(f, "sandbox-execution"),
        }
    }
}

/// Detected host platform.
#[derive(Debug, Clone, Serialize)]
pub struct Platform {
    pub os: HostOs,
    pub arch: Arch,
    pub kernel_version: Option<String>,
    /// Effective uid is 0.
    pub privileged: bool,
    pub capabilities: BTreeSet<Capability>,
}

impl Platform {
    /// Detect the running host.
    pub fn detect() -> Self {
        let os = detect_os();
        let privileged = is_privileged();
        let capabilities = detect_capabilities(os, privileged);
        let platform = Self {
            os,
            arch: Arch::host(),
            kernel_version: detect_kernel_version(),
            privileged,
            capabilities,
        };
        debug!(?platform, "platform detected");
        platform
    }

    /// Platform with an explicit capability set, bypassing probing.
    pub fn with_capabilities(
        os: HostOs,
        arch: Arch,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            os,
            arch,
            kernel_version: None,
            privileged: true,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn require(&self, capability: Capability) -> Result<(), PlatformError> {
        if self.has(capability) {
            return Ok(());
        }
        let reason = match (self.os, capability) {
            (HostOs::Darwin, Capability::BindMount | Capability::SandboxExecution) => {
                "macOS cannot bind kernel interfaces into a foreign root".to_string()
            }
            (HostOs::Linux, Capability::BlockAttach) => {
                "no loop device support (missing /dev/loop-control and losetup)".to_string()
            }
            (HostOs::Linux, _) if !self.privileged => "requires root privileges".to_string(),
            _ => format!("not available on {}", self.os),
        };
        Err(PlatformError::MissingCapability { capability, reason })
    }

    /// Fail unless at least block attachment is possible on this host.
    pub fn resolve(&self) -> Result<(), PlatformError> {
        if self.os == HostOs::Unknown {
            return Err(PlatformError::Unsupported {
                os: self.os.to_string(),
                reason: "only Linux and macOS hosts are supported".to_string(),
            });
        }
        if !self.has(Capability::BlockAttach) {
            return Err(PlatformError::Unsupported {
                os: self.os.to_string(),
                reason: "no block-device attach primitive available".to_string(),
            });
        }
        info!(
            os = %self.os,
            arch = %self.arch,
            capabilities = ?self.capabilities,
            "platform resolved"
        );
        Ok(())
    }

    /// Concrete attach strategy for this host.
    pub fn attach_strategy(&self) -> Result<Arc<dyn AttachStrategy>, PlatformError> {
        self.resolve()?;
        match self.os {
            HostOs::Linux => Ok(Arc::new(LoopMountStrategy::new())),
            HostOs::Darwin => Ok(Arc::new(VirtualDiskAttachStrategy::new())),
            HostOs::Unknown => unreachable!("resolve() rejects unknown hosts"),
        }
    }

    /// Backend for listing and writing removable disks.
    pub fn media_backend(&self) -> Result<Arc<dyn MediaBackend>, PlatformError> {
        match self.os {
            HostOs::Linux => Ok(Arc::new(LsblkMedia::new())),
            HostOs::Darwin => Ok(Arc::new(DiskutilMedia::new())),
            HostOs::Unknown => Err(PlatformError::Unsupported {
                os: self.os.to_string(),
                reason: "no removable media backend for this host".to_string(),
            }),
        }
    }

    /// Host tools the media backend shells out to.
    pub fn check_media_tools(&self) -> Result<(), PlatformError> {
        preflight::check_required_tools(preflight::media_tools(self.os)).map_err(|e| {
            PlatformError::MissingTools {
                reason: format!("{:#}", e),
            }
        })
    }

    /// Host tools the selected strategy and sandbox shell out to.
    pub fn check_host_tools(&self) -> Result<(), PlatformError> {
        preflight::check_required_tools(preflight::required_tools(self.os)).map_err(|e| {
            PlatformError::MissingTools {
                reason: format!("{:#}", e),
            }
        })
    }
}

fn detect_os() -> HostOs {
    #[cfg(target_os = "linux")]
    return HostOs::Linux;

    #[cfg(target_os = "macos")]
    return HostOs::Darwin;

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    return HostOs::Unknown;
}

fn detect_kernel_version() -> Option<String> {
    crate::process::Cmd::new("uname")
        .arg("-r")
        .run()
        .ok()
        .map(|out| out.stdout_trimmed().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(unix)]
fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_privileged() -> bool {
    false
}

fn detect_capabilities(os: HostOs, privileged: bool) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::new();
    match os {
        HostOs::Linux => {
            if Path::new("/dev/loop-control").exists() || preflight::command_exists("losetup") {
                caps.insert(Capability::BlockAttach);
            }
            if privileged && Path::new("/proc/self/ns/mnt").exists() {
                caps.insert(Capability::BindMount);
                caps.insert(Capability::SandboxExecution);
            }
        }
        HostOs::Darwin => {
            if preflight::command_exists("hdiutil") {
                caps.insert(Capability::BlockAttach);
            }
        }
        HostOs::Unknown => {}
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_parse_aliases() {
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("AMD64".parse::<Arch>().unwrap(), Arch::X86_64);
        assert_eq!("armhf".parse::<Arch>().unwrap(), Arch::Arm);
        assert!("sparc".parse::<Arch>().is_err());
    }

    #[test]
    fn test_qemu_names() {
        assert_eq!(Arch::Aarch64.qemu_name(), Some("aarch64"));
        assert_eq!(Arch::Unknown.qemu_name(), None);
    }

    #[test]
    fn test_unknown_os_is_unsupported() {
        let p = Platform::with_capabilities(HostOs::Unknown, Arch::X86_64, []);
        assert!(matches!(
            p.resolve(),
            Err(PlatformError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_missing_block_attach_is_unsupported() {
        let p = Platform::with_capabilities(HostOs::Linux, Arch::X86_64, [Capability::BindMount]);
        assert!(p.resolve().is_err());
        assert!(p.attach_strategy().is_err());
    }

    #[test]
    fn test_darwin_selects_virtual_disk_strategy() {
        let p = Platform::with_capabilities(HostOs::Darwin, Arch::Aarch64, [Capability::BlockAttach]);
        assert_eq!(p.attach_strategy().unwrap().name(), "virtual-disk");
        let err = p.require(Capability::SandboxExecution).unwrap_err();
        assert!(err.to_string().contains("macOS"));
    }

    #[test]
    fn test_linux_selects_loop_strategy() {
        let p = Platform::with_capabilities(HostOs::Linux, Arch::X86_64, [Capability::BlockAttach]);
        assert_eq!(p.attach_strategy().unwrap().name(), "loop");
    }

    #[test]
    fn test_media_backend_per_os() {
        let linux = Platform::with_capabilities(HostOs::Linux, Arch::X86_64, []);
        assert_eq!(linux.media_backend().unwrap().name(), "lsblk");
        let mac = Platform::with_capabilities(HostOs::Darwin, Arch::Aarch64, []);
        assert_eq!(mac.media_backend().unwrap().name(), "diskutil");
        let other = Platform::with_capabilities(HostOs::Unknown, Arch::X86_64, []);
        assert!(matches!(
            other.media_backend(),
            Err(PlatformError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_detect_reports_host_arch() {
        let p = Platform::detect();
        assert_eq!(p.arch, Arch::host());
    }
}
