//! Foreign-architecture execution sandbox.
//!
//! Runs commands with a mounted image root as their filesystem context:
//! host kernel interfaces are bound into the root, the host DNS configuration
//! is copied in, and a user-mode emulator is installed when the image targets
//! another architecture than the host.
//!
//! ```text
//! Unentered --enter--> Bound --exec--> Executing --done--> Bound --leave--> Unbound
//!                        ^                                                   |
//!                        +---------------------- enter ----------------------+
//! ```
//!
//! Every resource acquired by `enter` is registered with the run's
//! [`CleanupRegistry`], so an abandoned context is still torn down when the
//! registry drains.

pub mod chroot;
pub mod emulator;

use crate::attach::PartitionMount;
use crate::cleanup::{CleanupRegistry, CleanupToken};
use crate::error::SandboxError;
use crate::platform::{Arch, Capability, Platform};
use anyhow::Context;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

const DNS_CONFIG: &str = "etc/resolv.conf";
const DNS_BACKUP: &str = "etc/resolv.conf.provisioner-orig";

/// Host kernel interface exposed inside the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelInterface {
    Proc,
    Dev,
    DevPts,
    Sys,
}

impl KernelInterface {
    /// Bind order. Teardown runs in reverse.
    pub const ALL: [KernelInterface; 4] = [
        KernelInterface::Proc,
        KernelInterface::Dev,
        KernelInterface::DevPts,
        KernelInterface::Sys,
    ];

    pub fn host_path(&self) -> &'static Path {
        Path::new(match self {
            KernelInterface::Proc => "/proc",
            KernelInterface::Dev => "/dev",
            KernelInterface::DevPts => "/dev/pts",
            KernelInterface::Sys => "/sys",
        })
    }

    /// Mount point relative to the root.
    pub fn relative(&self) -> &'static str {
        match self {
            KernelInterface::Proc => "proc",
            KernelInterface::Dev => "dev",
            KernelInterface::DevPts => "dev/pts",
            KernelInterface::Sys => "sys",
        }
    }
}

impl fmt::Display for KernelInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.relative())
    }
}

/// Result of one sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Host mechanism for binding interfaces and running commands in a root.
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn bind(&self, interface: KernelInterface, source: &Path, target: &Path)
        -> anyhow::Result<()>;

    fn unbind(&self, target: &Path) -> anyhow::Result<()>;

    /// Run `command` through `/bin/sh -c` inside `root`.
    fn run(
        &self,
        root: &Path,
        command: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub exec_timeout: Duration,
    pub install_timeout: Duration,
    /// Explicit emulator binary; otherwise looked up in PATH.
    pub emulator: Option<PathBuf>,
    pub dns_source: PathBuf,
    /// Extra environment for sandboxed commands.
    pub env: Vec<(String, String)>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            emulator: None,
            dns_source: PathBuf::from("/etc/resolv.conf"),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Unentered,
    Bound,
    Executing,
    Unbound,
}

#[derive(Debug)]
struct BoundInterface {
    interface: KernelInterface,
    token: CleanupToken,
}

/// One root prepared for sandboxed execution.
#[derive(Debug)]
pub struct SandboxContext {
    root: PathBuf,
    state: SandboxState,
    bound: Vec<BoundInterface>,
    dns: Option<CleanupToken>,
    emulator: Option<(PathBuf, CleanupToken)>,
}

impl SandboxContext {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == SandboxState::Bound
    }

    pub fn bound_interfaces(&self) -> Vec<KernelInterface> {
        self.bound.iter().map(|b| b.interface).collect()
    }

    /// Emulator installed by this context, if any.
    pub fn emulator(&self) -> Option<&Path> {
        self.emulator.as_ref().map(|(p, _)| p.as_path())
    }

    /// Release every acquired resource, newest first. Returns warnings.
    fn teardown(&mut self, registry: &mut CleanupRegistry) -> Vec<String> {
        let mut tokens = Vec::new();
        if let Some((_, token)) = self.emulator.take() {
            tokens.push(("emulator".to_string(), token));
        }
        if let Some(token) = self.dns.take() {
            tokens.push(("dns config".to_string(), token));
        }
        for b in self.bound.drain(..).rev() {
            tokens.push((b.interface.to_string(), b.token));
        }

        let mut warnings = Vec::new();
        for (what, token) in tokens {
            if let Some(Err(e)) = registry.release(token) {
                let msg = format!("sandbox teardown of {} failed: {:#}", what, e);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
        warnings
    }
}

/// Sandbox bound to one backend and one target architecture.
pub struct Sandbox {
    backend: Arc<dyn SandboxBackend>,
    unsupported: Option<String>,
    host_arch: Arch,
    target_arch: Arch,
    settings: SandboxSettings,
}

impl Sandbox {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        platform: &Platform,
        target_arch: Arch,
        settings: SandboxSettings,
    ) -> Self {
        let unsupported = platform
            .require(Capability::SandboxExecution)
            .and_then(|_| platform.require(Capability::BindMount))
            .err()
            .map(|e| e.to_string());
        Self {
            backend,
            unsupported,
            host_arch: platform.arch,
            target_arch,
            settings,
        }
    }

    pub fn target_arch(&self) -> Arch {
        self.target_arch
    }

    /// The root needs an emulator to run target binaries.
    pub fn needs_emulation(&self) -> bool {
        self.host_arch != self.target_arch
    }

    /// Unentered context for `root`.
    pub fn open(&self, root: &Path) -> SandboxContext {
        SandboxContext {
            root: root.to_path_buf(),
            state: SandboxState::Unentered,
            bound: Vec::new(),
            dns: None,
            emulator: None,
        }
    }

    /// Enter the root filesystem of an attachment.
    pub fn enter_root(
        &self,
        mount: &PartitionMount,
        registry: &mut CleanupRegistry,
    ) -> Result<SandboxContext, SandboxError> {
        if !mount.is_mounted() {
            return Err(SandboxError::RootNotMounted(mount.path.clone()));
        }
        let mut ctx = self.open(&mount.path);
        self.enter(&mut ctx, registry)?;
        Ok(ctx)
    }

    /// Bind interfaces, install DNS config and the emulator.
    ///
    /// A context that is already bound is left as is. On failure everything
    /// acquired so far is released again.
    pub fn enter(
        &self,
        ctx: &mut SandboxContext,
        registry: &mut CleanupRegistry,
    ) -> Result<(), SandboxError> {
        if let Some(reason) = &self.unsupported {
            return Err(SandboxError::Unsupported {
                reason: reason.clone(),
            });
        }
        if matches!(ctx.state, SandboxState::Bound | SandboxState::Executing) {
            debug!(root = %ctx.root.display(), "sandbox already entered");
            return Ok(());
        }
        if !ctx.root.is_dir() {
            return Err(SandboxError::RootNotMounted(ctx.root.clone()));
        }

        info!(
            root = %ctx.root.display(),
            backend = self.backend.name(),
            target = %self.target_arch,
            "Entering sandbox"
        );

        if let Err(e) = self.acquire(ctx, registry) {
            ctx.teardown(registry);
            ctx.state = SandboxState::Unbound;
            return Err(e);
        }
        ctx.state = SandboxState::Bound;
        Ok(())
    }

    fn acquire(
        &self,
        ctx: &mut SandboxContext,
        registry: &mut CleanupRegistry,
    ) -> Result<(), SandboxError> {
        for interface in KernelInterface::ALL {
            let target = ctx.root.join(interface.relative());
            let bind_failed = |reason: String| SandboxError::BindFailed {
                interface: interface.to_string(),
                target: target.clone(),
                reason,
            };
            fs::create_dir_all(&target).map_err(|e| bind_failed(e.to_string()))?;
            self.backend
                .bind(interface, interface.host_path(), &target)
                .map_err(|e| bind_failed(format!("{:#}", e)))?;
            let backend = Arc::clone(&self.backend);
            let unbind_target = target.clone();
            let token = registry.push(format!("unbind {}", target.display()), move || {
                backend.unbind(&unbind_target)
            });
            ctx.bound.push(BoundInterface { interface, token });
        }

        ctx.dns = self.install_dns(&ctx.root, registry)?;

        if self.needs_emulation() {
            let source = emulator::locate(self.target_arch, self.settings.emulator.as_deref())?;
            if let Some(installed) =
                emulator::install(&ctx.root, self.target_arch, &source, self.settings.install_timeout)?
            {
                let path = installed.clone();
                let token = registry.push(format!("remove {}", installed.display()), move || {
                    fs::remove_file(&path)
                        .with_context(|| format!("removing emulator '{}'", path.display()))
                });
                ctx.emulator = Some((installed, token));
            }
        }
        Ok(())
    }

    fn install_dns(
        &self,
        root: &Path,
        registry: &mut CleanupRegistry,
    ) -> Result<Option<CleanupToken>, SandboxError> {
        let source = &self.settings.dns_source;
        if !source.exists() {
            warn!(source = %source.display(), "host DNS configuration missing, skipping");
            return Ok(None);
        }
        let target = root.join(DNS_CONFIG);
        let backup = root.join(DNS_BACKUP);
        let dns_failed = |reason: String| SandboxError::DnsSetupFailed {
            root: root.to_path_buf(),
            reason,
        };
        if let Some(parent) = target.parent() {
            if !parent.is_dir() {
                warn!(root = %root.display(), "root has no /etc, skipping DNS configuration");
                return Ok(None);
            }
        }

        // symlink_metadata so a dangling resolv.conf symlink is preserved too.
        let had_original = fs::symlink_metadata(&target).is_ok();
        if had_original {
            fs::rename(&target, &backup).map_err(|e| dns_failed(e.to_string()))?;
        }
        if let Err(e) = fs::copy(source, &target) {
            let mut reason = e.to_string();
            if had_original {
                if let Err(restore) = put_back_original_dns(&target, &backup) {
                    reason = format!("{}; {}", reason, restore);
                }
            }
            return Err(dns_failed(reason));
        }
        debug!(target = %target.display(), "host DNS configuration installed");

        let token = registry.push(format!("restore {}", target.display()), move || {
            restore_dns(&target, &backup, had_original)
        });
        Ok(Some(token))
    }

    /// Run one command inside the bound root.
    pub fn exec(&self, ctx: &mut SandboxContext, command: &str) -> Result<ExecOutput, SandboxError> {
        if ctx.state != SandboxState::Bound {
            return Err(SandboxError::NotBound(ctx.root.clone()));
        }
        info!(root = %ctx.root.display(), %command, "Executing in sandbox");
        ctx.state = SandboxState::Executing;
        let result = self.backend.run(
            &ctx.root,
            command,
            &self.settings.env,
            self.settings.exec_timeout,
        );
        ctx.state = SandboxState::Bound;
        let out = result?;
        debug!(exit_code = out.exit_code, "sandboxed command finished");
        Ok(out)
    }

    /// Undo `enter`. Best effort: failures come back as warnings.
    ///
    /// Leaving a context that is not bound does nothing.
    pub fn leave(&self, ctx: &mut SandboxContext, registry: &mut CleanupRegistry) -> Vec<String> {
        if !matches!(ctx.state, SandboxState::Bound | SandboxState::Executing) {
            debug!(root = %ctx.root.display(), "sandbox not entered, nothing to leave");
            return Vec::new();
        }
        info!(root = %ctx.root.display(), "Leaving sandbox");
        let warnings = ctx.teardown(registry);
        ctx.state = SandboxState::Unbound;
        warnings
    }
}

/// Rename the image's own resolv.conf back after a failed copy.
fn put_back_original_dns(target: &Path, backup: &Path) -> Result<(), String> {
    let _ = fs::remove_file(target);
    fs::rename(backup, target).map_err(|e| {
        warn!(
            target = %target.display(),
            backup = %backup.display(),
            "could not restore original DNS configuration: {}",
            e
        );
        format!(
            "restoring original '{}' from '{}' failed: {}",
            target.display(),
            backup.display(),
            e
        )
    })
}

fn restore_dns(target: &Path, backup: &Path, had_original: bool) -> anyhow::Result<()> {
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)
            .with_context(|| format!("removing copied '{}'", target.display()))?;
    }
    if had_original {
        fs::rename(backup, target)
            .with_context(|| format!("restoring '{}'", target.display()))?;
    }
    Ok(())
}
