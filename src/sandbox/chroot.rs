//! chroot(8) backend with kernel interfaces mounted via mount(2).

use super::{ExecOutput, KernelInterface, SandboxBackend};
use crate::error::SandboxError;
use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct ChrootBackend;

impl ChrootBackend {
    pub fn new() -> Self {
        Self
    }
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().as_bytes())
        .with_context(|| format!("invalid path '{}'", path.display()))
}

impl SandboxBackend for ChrootBackend {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn bind(&self, interface: KernelInterface, source: &Path, target: &Path) -> Result<()> {
        mount_interface(interface, source, target)?;
        debug!(%interface, target = %target.display(), "kernel interface bound");
        Ok(())
    }

    fn unbind(&self, target: &Path) -> Result<()> {
        unmount_interface(target)
    }

    fn run(
        &self,
        root: &Path,
        command: &str,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let mut child = Command::new("chroot")
            .arg(root)
            .args(["/bin/sh", "-c", command])
            .env_clear()
            .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
            .env("HOME", "/root")
            .env("LANG", "C.UTF-8")
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let exit_code = wait_with_timeout(&mut child, timeout, command)?;

        let mut output = stdout.join().unwrap_or_default();
        output.push_str(&stderr.join().unwrap_or_default());
        Ok(ExecOutput { exit_code, output })
    }
}

#[cfg(target_os = "linux")]
fn mount_interface(interface: KernelInterface, source: &Path, target: &Path) -> Result<()> {
    let target_c = cstring(target)?;
    let result = match interface {
        KernelInterface::Proc => {
            let proc_c = CString::new("proc")?;
            // SAFETY: every pointer is a valid NUL-terminated string that
            // outlives the call; data is null.
            unsafe {
                libc::mount(
                    proc_c.as_ptr(),
                    target_c.as_ptr(),
                    proc_c.as_ptr(),
                    libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                    std::ptr::null(),
                )
            }
        }
        KernelInterface::Dev | KernelInterface::DevPts | KernelInterface::Sys => {
            let source_c = cstring(source)?;
            // SAFETY: as above; fstype is ignored for MS_BIND.
            unsafe {
                libc::mount(
                    source_c.as_ptr(),
                    target_c.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND,
                    std::ptr::null(),
                )
            }
        }
    };
    if result != 0 {
        bail!(
            "mount {} -> {}: {}",
            source.display(),
            target.display(),
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount_interface(target: &Path) -> Result<()> {
    let target_c = cstring(target)?;
    // SAFETY: target_c is a valid NUL-terminated path.
    if unsafe { libc::umount2(target_c.as_ptr(), 0) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    warn!(
        target = %target.display(),
        "umount failed ({}), retrying with lazy detach",
        err
    );
    // SAFETY: as above.
    if unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) } != 0 {
        bail!(
            "umount {}: {}",
            target.display(),
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn mount_interface(interface: KernelInterface, _source: &Path, target: &Path) -> Result<()> {
    bail!(
        "binding {} at '{}' requires a Linux host",
        interface,
        target.display()
    )
}

#[cfg(not(target_os = "linux"))]
fn unmount_interface(target: &Path) -> Result<()> {
    bail!("unmounting '{}' requires a Linux host", target.display())
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for `child`, killing it once `timeout` passes.
pub(crate) fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    command: &str,
) -> Result<i32, SandboxError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(exit_code_of(status)),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SandboxError::TimedOut {
                    command: command.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            Ok(None) => thread::sleep(WAIT_POLL_INTERVAL),
            Err(e) => {
                return Err(SandboxError::SpawnFailed {
                    command: command.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_with_timeout_kills_slow_child() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let err = wait_with_timeout(&mut child, Duration::from_millis(200), "sleep 5").unwrap_err();
        assert!(matches!(err, SandboxError::TimedOut { .. }));
    }

    #[test]
    fn test_wait_with_timeout_reports_exit_code() {
        let mut child = Command::new("sh").args(["-c", "exit 7"]).spawn().unwrap();
        let code = wait_with_timeout(&mut child, Duration::from_secs(5), "exit 7").unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn test_killed_child_maps_to_shell_convention() {
        let mut child = Command::new("sh").args(["-c", "kill -9 $$"]).spawn().unwrap();
        let code = wait_with_timeout(&mut child, Duration::from_secs(5), "kill").unwrap();
        assert_eq!(code, 137);
    }
}
