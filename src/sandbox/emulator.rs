//! User-mode emulator install for foreign-architecture roots.

use crate::error::SandboxError;
use crate::platform::Arch;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// `qemu-aarch64-static`
pub fn binary_name(arch: Arch) -> Option<String> {
    arch.qemu_name().map(|n| format!("qemu-{}-static", n))
}

/// Find the emulator on the host: explicit path first, then PATH.
pub fn locate(arch: Arch, configured: Option<&Path>) -> Result<PathBuf, SandboxError> {
    let unavailable = |reason: String| SandboxError::EmulatorUnavailable {
        arch: arch.to_string(),
        reason,
    };
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(unavailable(format!(
            "configured emulator '{}' does not exist",
            path.display()
        )));
    }
    let name = binary_name(arch)
        .ok_or_else(|| unavailable("no emulator known for this architecture".to_string()))?;
    which::which(&name).map_err(|_| unavailable(format!("'{}' not found in PATH", name)))
}

/// Destination inside the root.
pub fn target_path(root: &Path, arch: Arch) -> Option<PathBuf> {
    binary_name(arch).map(|name| root.join("usr/bin").join(name))
}

/// Copy `source` into the root with mode 0755, bounded by `timeout`.
///
/// Returns `Ok(None)` when the root already carries the emulator, in which
/// case nothing was installed and nothing must be removed later.
pub fn install(
    root: &Path,
    arch: Arch,
    source: &Path,
    timeout: Duration,
) -> Result<Option<PathBuf>, SandboxError> {
    let unavailable = |reason: String| SandboxError::EmulatorUnavailable {
        arch: arch.to_string(),
        reason,
    };
    let target = target_path(root, arch)
        .ok_or_else(|| unavailable("no emulator known for this architecture".to_string()))?;
    if fs::symlink_metadata(&target).is_ok() {
        info!(path = %target.display(), "emulator already present in root");
        return Ok(None);
    }

    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let src = source.to_path_buf();
    let dst = target.clone();
    let thread_cancel = cancel.clone();
    thread::spawn(move || {
        let result = copy_executable(&src, &dst, &thread_cancel);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => {
            info!(
                emulator = %source.display(),
                target = %target.display(),
                "Installed user-mode emulator"
            );
            warn_if_unregistered(arch);
            Ok(Some(target))
        }
        Ok(Err(e)) => {
            let _ = fs::remove_file(&target);
            Err(unavailable(e.to_string()))
        }
        Err(_) => {
            // A copy still in flight removes its own output once it sees the flag.
            cancel.store(true, Ordering::SeqCst);
            let _ = fs::remove_file(&target);
            Err(unavailable(format!(
                "install did not finish within {}s",
                timeout.as_secs()
            )))
        }
    }
}

const COPY_CHUNK: usize = 64 * 1024;

/// Chunked copy that gives up, and deletes `dst`, once `cancel` is set.
fn copy_executable(src: &Path, dst: &Path, cancel: &AtomicBool) -> io::Result<()> {
    let result = copy_chunks(src, dst, cancel);
    if result.is_err() || cancel.load(Ordering::SeqCst) {
        let _ = fs::remove_file(dst);
    }
    match result {
        Ok(()) if cancel.load(Ordering::SeqCst) => Err(cancelled()),
        other => other,
    }
}

fn copy_chunks(src: &Path, dst: &Path, cancel: &AtomicBool) -> io::Result<()> {
    let mut input = File::open(src)?;
    if cancel.load(Ordering::SeqCst) {
        return Err(cancelled());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut output = File::create(dst)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(cancelled());
        }
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        output.write_all(&buf[..n])?;
    }
    output.sync_all()?;
    fs::set_permissions(dst, fs::Permissions::from_mode(0o755))
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "emulator install cancelled")
}

/// The kernel needs a binfmt_misc handler to run foreign binaries transparently.
fn warn_if_unregistered(arch: Arch) {
    let Some(name) = arch.qemu_name() else {
        return;
    };
    let entry = Path::new("/proc/sys/fs/binfmt_misc").join(format!("qemu-{}", name));
    if !entry.exists() {
        warn!(
            %arch,
            "no binfmt_misc registration for qemu-{}; foreign binaries may fail to execute",
            name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_binary_name() {
        assert_eq!(
            binary_name(Arch::Aarch64).as_deref(),
            Some("qemu-aarch64-static")
        );
        assert_eq!(binary_name(Arch::Unknown), None);
    }

    #[test]
    fn test_install_sets_mode_0755() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("qemu-arm-static");
        fs::write(&src, b"\x7fELF").unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let installed = install(&root, Arch::Arm, &src, Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(installed, root.join("usr/bin/qemu-arm-static"));
        let mode = fs::metadata(&installed).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_install_skips_existing_emulator() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("qemu");
        fs::write(&src, b"x").unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/qemu-riscv64-static"), b"y").unwrap();

        assert!(install(&root, Arch::Riscv64, &src, Duration::from_secs(5))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cancelled_copy_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("qemu");
        fs::write(&src, vec![0u8; 3 * COPY_CHUNK]).unwrap();
        let dst = tmp.path().join("root/usr/bin/qemu-arm-static");

        let cancel = AtomicBool::new(true);
        let err = copy_executable(&src, &dst, &cancel).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert!(!dst.exists());

        let cancel = AtomicBool::new(false);
        copy_executable(&src, &dst, &cancel).unwrap();
        assert_eq!(fs::metadata(&dst).unwrap().len(), 3 * COPY_CHUNK as u64);
    }

    #[test]
    fn test_install_timeout_does_not_leave_late_copy() {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        // Reading a FIFO blocks until a writer shows up, stalling the copy.
        let src = tmp.path().join("qemu-fifo");
        let c_src = CString::new(src.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_src.as_ptr(), 0o600) }, 0);
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let err = install(&root, Arch::Arm, &src, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, SandboxError::EmulatorUnavailable { .. }));

        // Release the stalled copy; it must notice the cancellation.
        let mut writer = fs::OpenOptions::new().write(true).open(&src).unwrap();
        writer.write_all(b"\x7fELF").unwrap();
        drop(writer);
        thread::sleep(Duration::from_millis(500));
        assert!(!root.join("usr/bin/qemu-arm-static").exists());
    }

    #[test]
    fn test_locate_rejects_missing_configured_path() {
        let err = locate(Arch::Aarch64, Some(Path::new("/nonexistent/qemu"))).unwrap_err();
        assert!(matches!(err, SandboxError::EmulatorUnavailable { .. }));
    }
}
