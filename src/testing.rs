//! In-memory stand-ins for host primitives, so lifecycle tests run unprivileged.

use crate::attach::{AttachStrategy, AttachedDevice, PartitionNode};
use crate::error::SandboxError;
use crate::media::{MediaBackend, RemovableDisk};
use crate::platform::{Arch, Capability, HostOs, Platform};
use crate::sandbox::{ExecOutput, KernelInterface, SandboxBackend};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Sparse image of `size` bytes with `first_sector` written at offset 0.
pub fn write_image(path: &Path, size: u64, first_sector: &[u8]) -> PathBuf {
    let mut file = File::create(path).unwrap();
    file.set_len(size).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(first_sector).unwrap();
    path.to_path_buf()
}

/// Linux host with every capability.
pub fn full_platform() -> Platform {
    Platform::with_capabilities(
        HostOs::Linux,
        Arch::host(),
        [
            Capability::BlockAttach,
            Capability::BindMount,
            Capability::SandboxExecution,
        ],
    )
}

/// Root filesystem tree of a typical image: etc, usr, bin, etc/fstab, boot/.
pub fn root_tree(dir: &Path) -> PathBuf {
    for d in ["etc", "usr/lib", "bin", "boot"] {
        fs::create_dir_all(dir.join(d)).unwrap();
    }
    fs::write(dir.join("usr/lib/os-release"), "ID=test\n").unwrap();
    fs::write(dir.join("bin/sh"), "#!stub\n").unwrap();
    fs::write(dir.join("etc/fstab"), "/dev/root / ext4 defaults 0 1\n").unwrap();
    fs::write(dir.join("etc/hostname"), "testhost\n").unwrap();
    dir.to_path_buf()
}

/// Boot partition tree: cmdline.txt and config.txt.
pub fn boot_tree(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("cmdline.txt"), "console=serial0 root=/dev/mmcblk0p2\n").unwrap();
    fs::write(dir.join("config.txt"), "arm_64bit=1\n").unwrap();
    dir.to_path_buf()
}

fn copy_tree(src: &Path, dst: &Path) {
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let to = dst.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            fs::create_dir_all(&to).unwrap();
            copy_tree(&entry.path(), &to);
        } else {
            fs::copy(entry.path(), &to).unwrap();
        }
    }
}

fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if fs::symlink_metadata(&path)?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[derive(Default)]
struct StrategyState {
    next_device: u32,
    attached: HashSet<String>,
    mounts: HashMap<PathBuf, u32>,
    mount_order: Vec<u32>,
    unmount_order: Vec<PathBuf>,
    fixtures: HashMap<u32, PathBuf>,
    fail_attach: u32,
    fail_mount: HashMap<u32, u32>,
    fail_unmount: u32,
    fail_release: u32,
    attach_calls: u32,
    release_calls: u32,
    read_only_attaches: u32,
}

/// Attach strategy that "mounts" by copying fixture trees into the target
/// and "unmounts" by clearing it again.
#[derive(Default)]
pub struct FakeStrategy {
    state: Mutex<StrategyState>,
}

impl FakeStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate partition `index` from `tree` on every mount.
    pub fn with_fixture(self, index: u32, tree: &Path) -> Self {
        self.state
            .lock()
            .unwrap()
            .fixtures
            .insert(index, tree.to_path_buf());
        self
    }

    pub fn fail_attach(&self, times: u32) {
        self.state.lock().unwrap().fail_attach = times;
    }

    pub fn fail_mount_of(&self, index: u32, times: u32) {
        self.state.lock().unwrap().fail_mount.insert(index, times);
    }

    pub fn fail_unmount(&self, times: u32) {
        self.state.lock().unwrap().fail_unmount = times;
    }

    pub fn fail_release(&self, times: u32) {
        self.state.lock().unwrap().fail_release = times;
    }

    pub fn active_mounts(&self) -> usize {
        self.state.lock().unwrap().mounts.len()
    }

    pub fn attached_devices(&self) -> usize {
        self.state.lock().unwrap().attached.len()
    }

    pub fn mount_order(&self) -> Vec<u32> {
        self.state.lock().unwrap().mount_order.clone()
    }

    pub fn unmount_order(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().unmount_order.clone()
    }

    pub fn attach_calls(&self) -> u32 {
        self.state.lock().unwrap().attach_calls
    }

    pub fn release_calls(&self) -> u32 {
        self.state.lock().unwrap().release_calls
    }

    pub fn read_only_attaches(&self) -> u32 {
        self.state.lock().unwrap().read_only_attaches
    }
}

impl AttachStrategy for FakeStrategy {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn attach_device(
        &self,
        _image: &Path,
        read_only: bool,
        expected: &[u32],
        _timeout: Duration,
    ) -> Result<AttachedDevice> {
        let mut s = self.state.lock().unwrap();
        s.attach_calls += 1;
        if s.fail_attach > 0 {
            s.fail_attach -= 1;
            return Err(anyhow!("device busy"));
        }
        if read_only {
            s.read_only_attaches += 1;
        }
        let id = format!("/dev/fake{}", s.next_device);
        s.next_device += 1;
        s.attached.insert(id.clone());
        let partitions = expected
            .iter()
            .map(|i| PartitionNode {
                index: *i,
                path: PathBuf::from(format!("{}p{}", id, i)),
                fstype: None,
            })
            .collect();
        Ok(AttachedDevice { id, partitions })
    }

    fn mount(&self, partition: &PartitionNode, target: &Path, _read_only: bool) -> Result<String> {
        let mut s = self.state.lock().unwrap();
        if let Some(left) = s.fail_mount.get_mut(&partition.index) {
            if *left > 0 {
                *left -= 1;
                return Err(anyhow!("mount: wrong fs type"));
            }
        }
        if let Some(tree) = s.fixtures.get(&partition.index) {
            copy_tree(tree, target);
        }
        s.mounts.insert(target.to_path_buf(), partition.index);
        s.mount_order.push(partition.index);
        Ok(if partition.index == 1 { "vfat" } else { "ext4" }.to_string())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_unmount > 0 {
            s.fail_unmount -= 1;
            return Err(anyhow!("umount: target is busy"));
        }
        if s.mounts.remove(target).is_none() {
            return Err(anyhow!("umount: {}: not mounted", target.display()));
        }
        clear_dir(target)?;
        s.unmount_order.push(target.to_path_buf());
        Ok(())
    }

    fn release(&self, device: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.release_calls += 1;
        if s.fail_release > 0 {
            s.fail_release -= 1;
            return Err(anyhow!("losetup: {}: detach failed: device busy", device));
        }
        s.attached.remove(device);
        Ok(())
    }

    fn is_attached(&self, device: &str) -> bool {
        self.state.lock().unwrap().attached.contains(device)
    }
}

#[derive(Default)]
struct BackendState {
    binds: Vec<PathBuf>,
    unbind_order: Vec<PathBuf>,
    fail_bind: Option<KernelInterface>,
    commands: Vec<String>,
}

/// Sandbox backend that records binds and interprets a tiny command set:
/// `true` exits 0, `false` exits 1, `exit N` exits N, `sleep` times out,
/// anything else exits 0.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_bind(&self, interface: KernelInterface) {
        self.state.lock().unwrap().fail_bind = Some(interface);
    }

    pub fn active_binds(&self) -> usize {
        self.state.lock().unwrap().binds.len()
    }

    pub fn unbind_order(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().unbind_order.clone()
    }

    pub fn run_count(&self) -> usize {
        self.state.lock().unwrap().commands.len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

impl SandboxBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn bind(&self, interface: KernelInterface, _source: &Path, target: &Path) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_bind == Some(interface) {
            return Err(anyhow!("mount: permission denied"));
        }
        s.binds.push(target.to_path_buf());
        Ok(())
    }

    fn unbind(&self, target: &Path) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let pos = s
            .binds
            .iter()
            .position(|b| b == target)
            .ok_or_else(|| anyhow!("{} not bound", target.display()))?;
        s.binds.remove(pos);
        s.unbind_order.push(target.to_path_buf());
        Ok(())
    }

    fn run(
        &self,
        _root: &Path,
        command: &str,
        _env: &[(String, String)],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        self.state.lock().unwrap().commands.push(command.to_string());
        let cmd = command.trim();
        let exit_code = match cmd {
            "true" => 0,
            "false" => 1,
            _ if cmd.starts_with("sleep") => {
                return Err(SandboxError::TimedOut {
                    command: command.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            _ => cmd
                .strip_prefix("exit ")
                .and_then(|n| n.trim().parse().ok())
                .unwrap_or(0),
        };
        Ok(ExecOutput {
            exit_code,
            output: format!("ran {}\n", cmd),
        })
    }
}

#[derive(Default)]
struct MediaState {
    disks: HashMap<PathBuf, RemovableDisk>,
    calls: Vec<String>,
    fail_eject: bool,
}

/// Media backend over a table of pretend disks; records every call.
#[derive(Default)]
pub struct FakeMedia {
    state: Mutex<MediaState>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(self, device: &str, size_bytes: u64, removable: bool) -> Self {
        let disk = RemovableDisk {
            device: PathBuf::from(device),
            volume_name: "Untitled".to_string(),
            size_bytes,
            file_system: "FDisk_partition_scheme".to_string(),
            removable,
            ejectable: removable,
        };
        self.state
            .lock()
            .unwrap()
            .disks
            .insert(disk.device.clone(), disk);
        self
    }

    pub fn fail_eject(&self) {
        self.state.lock().unwrap().fail_eject = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: &str, path: &Path) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{} {}", call, path.display()));
    }
}

impl MediaBackend for FakeMedia {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn list_external(&self) -> Result<Vec<RemovableDisk>> {
        let state = self.state.lock().unwrap();
        let mut disks: Vec<_> = state
            .disks
            .values()
            .filter(|d| d.is_external())
            .cloned()
            .collect();
        disks.sort_by(|a, b| a.device.cmp(&b.device));
        Ok(disks)
    }

    fn disk_info(&self, device: &Path) -> Result<RemovableDisk> {
        self.record("info", device);
        self.state
            .lock()
            .unwrap()
            .disks
            .get(device)
            .cloned()
            .ok_or_else(|| anyhow!("no such disk: {}", device.display()))
    }

    fn unmount_disk(&self, device: &Path) -> Result<()> {
        self.record("unmount", device);
        Ok(())
    }

    fn raw_device(&self, device: &Path) -> PathBuf {
        let text = device.to_string_lossy();
        match text.strip_prefix("/dev/disk") {
            Some(rest) => PathBuf::from(format!("/dev/rdisk{}", rest)),
            None => device.to_path_buf(),
        }
    }

    fn write_image(&self, image: &Path, raw_device: &Path) -> Result<()> {
        fs::metadata(image)?;
        self.record("write", raw_device);
        Ok(())
    }

    fn eject(&self, device: &Path) -> Result<()> {
        self.record("eject", device);
        if self.state.lock().unwrap().fail_eject {
            return Err(anyhow!("disk busy"));
        }
        Ok(())
    }
}
