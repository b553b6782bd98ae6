//! Block-device attachment of image files.
//!
//! An image is exposed as a partitioned block device through an
//! [`AttachStrategy`] chosen by the platform resolver:
//!
//! - [`loop_mount::LoopMountStrategy`] - Linux loop devices (`losetup --partscan`)
//! - [`virtual_disk::VirtualDiskAttachStrategy`] - macOS `hdiutil attach -nomount`
//!
//! [`AttachmentManager`] drives the strategy: attach the device, wait for
//! partition nodes, mount root then boot nested below it, and register every
//! acquired resource with the run's [`CleanupRegistry`]. Detach undoes the
//! same steps in reverse.

pub mod loop_mount;
pub mod virtual_disk;

use crate::cleanup::{CleanupRegistry, CleanupToken};
use crate::error::{AttachError, DetachError};
use crate::image::{ImageHandle, PartitionTableDescriptor};
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default upper bound for partition nodes to appear after attach.
pub const DEFAULT_ENUMERATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for partition nodes.
pub const ENUMERATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default boot mount point, relative to the root mount.
pub const DEFAULT_BOOT_MOUNT: &str = "boot";

/// Partition node exposed by an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNode {
    /// 1-based table slot.
    pub index: u32,
    /// Host path of the node (e.g. `/dev/loop3p2`, `/dev/disk4s2`).
    pub path: PathBuf,
    /// Filesystem type if the host already knows it.
    pub fstype: Option<String>,
}

/// Whole-image block device returned by a strategy.
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub id: String,
    pub partitions: Vec<PartitionNode>,
}

/// Host mechanism that exposes an image file as a block device.
pub trait AttachStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Attach the whole image and wait (bounded) until `expected` partition
    /// nodes exist.
    fn attach_device(
        &self,
        image: &Path,
        read_only: bool,
        expected: &[u32],
        timeout: Duration,
    ) -> Result<AttachedDevice>;

    /// Mount one partition node at `target`. Returns the filesystem type.
    fn mount(&self, partition: &PartitionNode, target: &Path, read_only: bool) -> Result<String>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Detach the whole-image device.
    fn release(&self, device: &str) -> Result<()>;

    /// The device is still attached to the host.
    fn is_attached(&self, device: &str) -> bool;
}

/// Poll until every path exists or `timeout` expires.
pub(crate) fn wait_for_nodes(paths: &[PathBuf], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let missing: Vec<&PathBuf> = paths.iter().filter(|p| !p.exists()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "partition nodes did not appear within {}ms: {}",
                timeout.as_millis(),
                missing
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        thread::sleep(ENUMERATE_POLL_INTERVAL);
    }
}

/// Which table slots hold root and boot.
///
/// The default is the positional convention of Raspberry Pi style images:
/// slot 1 is the boot partition, slot 2 the root filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub root: u32,
    pub boot: Option<u32>,
}

impl Default for PartitionLayout {
    fn default() -> Self {
        Self {
            root: 2,
            boot: Some(1),
        }
    }
}

/// Layout after checking it against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLayout {
    pub root: u32,
    pub boot: Option<u32>,
}

impl PartitionLayout {
    /// Match the layout against the partitions the table declares.
    ///
    /// An image with a single mountable partition under the default layout is
    /// treated as root-only. A configured boot slot that is absent is dropped
    /// with a warning.
    pub fn resolve(
        &self,
        table: &PartitionTableDescriptor,
    ) -> std::result::Result<ResolvedLayout, String> {
        let mountable = |index: u32| table.entry(index).is_some_and(|e| e.is_mountable());

        if !mountable(self.root) {
            let candidates: Vec<u32> = table.mountable().map(|e| e.index).collect();
            if *self == Self::default() && candidates.len() == 1 {
                debug!(slot = candidates[0], "single-partition image, using it as root");
                return Ok(ResolvedLayout {
                    root: candidates[0],
                    boot: None,
                });
            }
            return Err(format!(
                "partition {} is not a mountable entry (mountable slots: {:?})",
                self.root, candidates
            ));
        }

        let boot = match self.boot {
            Some(b) if b == self.root => None,
            Some(b) if mountable(b) => Some(b),
            Some(b) => {
                warn!(slot = b, "configured boot partition not present, mounting root only");
                None
            }
            None => None,
        };
        Ok(ResolvedLayout {
            root: self.root,
            boot,
        })
    }
}

/// Attach behavior knobs.
#[derive(Debug, Clone)]
pub struct AttachSettings {
    pub layout: PartitionLayout,
    pub retry: RetryPolicy,
    pub enumerate_timeout: Duration,
    /// Boot mount point relative to the root mount.
    pub boot_mount: PathBuf,
    /// Parent directory for mount points.
    pub work_dir: PathBuf,
    pub read_only: bool,
}

impl Default for AttachSettings {
    fn default() -> Self {
        Self {
            layout: PartitionLayout::default(),
            retry: RetryPolicy::default(),
            enumerate_timeout: DEFAULT_ENUMERATE_TIMEOUT,
            boot_mount: PathBuf::from(DEFAULT_BOOT_MOUNT),
            work_dir: std::env::temp_dir().join("disk-provisioner"),
            read_only: false,
        }
    }
}

/// Role of a mounted partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountRole {
    Root,
    Boot,
}

impl fmt::Display for MountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountRole::Root => write!(f, "root"),
            MountRole::Boot => write!(f, "boot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Mounted,
    Unmounted,
}

/// One mounted partition of an attachment.
#[derive(Debug)]
pub struct PartitionMount {
    pub index: u32,
    pub role: MountRole,
    pub path: PathBuf,
    pub fstype: String,
    state: MountState,
    token: CleanupToken,
}

impl PartitionMount {
    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }
}

/// Live attachment of one image. Owned by whoever called `attach`.
#[derive(Debug)]
pub struct Attachment {
    device: String,
    image: PathBuf,
    read_only: bool,
    mounts: Vec<PartitionMount>,
    attempts: u32,
    mount_dir: PathBuf,
    device_token: CleanupToken,
    dir_token: CleanupToken,
}

impl Attachment {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Mounts in acquisition order (root first).
    pub fn mounts(&self) -> &[PartitionMount] {
        &self.mounts
    }

    pub fn mounted_count(&self) -> usize {
        self.mounts.iter().filter(|m| m.is_mounted()).count()
    }

    /// Attempts the successful attach needed.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn root(&self) -> &PartitionMount {
        &self.mounts[0]
    }

    pub fn boot(&self) -> Option<&PartitionMount> {
        self.mounts.iter().find(|m| m.role == MountRole::Boot)
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }
}

/// Tokens acquired during one attach attempt, for rollback.
#[derive(Default)]
struct AttemptTokens {
    device: Option<CleanupToken>,
    mounts: Vec<CleanupToken>,
}

enum AttemptError {
    Transient(anyhow::Error),
    Permanent(AttachError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transient(e) => write!(f, "{:#}", e),
            AttemptError::Permanent(e) => write!(f, "{}", e),
        }
    }
}

static MOUNT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Attaches and detaches images through one strategy.
#[derive(Clone)]
pub struct AttachmentManager {
    strategy: Arc<dyn AttachStrategy>,
    settings: AttachSettings,
}

impl AttachmentManager {
    pub fn new(strategy: Arc<dyn AttachStrategy>, settings: AttachSettings) -> Self {
        Self { strategy, settings }
    }

    pub fn strategy(&self) -> &Arc<dyn AttachStrategy> {
        &self.strategy
    }

    pub fn settings(&self) -> &AttachSettings {
        &self.settings
    }

    /// Same strategy and settings, but attaching and mounting read-only.
    pub fn read_only(&self) -> Self {
        let mut settings = self.settings.clone();
        settings.read_only = true;
        Self {
            strategy: Arc::clone(&self.strategy),
            settings,
        }
    }

    /// Attach `image`, mount root and (optionally) boot.
    ///
    /// Transient failures are retried per the retry policy; each failed
    /// attempt is rolled back before the next one starts.
    pub fn attach(
        &self,
        image: &ImageHandle,
        registry: &mut CleanupRegistry,
    ) -> Result<Attachment, AttachError> {
        let image_path = image.path().to_path_buf();
        let table = image.partition_table().map_err(|e| AttachError::Image {
            image: image_path.clone(),
            reason: format!("{:#}", e),
        })?;
        let layout = self
            .settings
            .layout
            .resolve(&table)
            .map_err(|reason| AttachError::Layout {
                image: image_path.clone(),
                role: MountRole::Root.to_string(),
                reason,
            })?;

        info!(
            image = %image_path.display(),
            strategy = self.strategy.name(),
            read_only = self.settings.read_only,
            "Attaching image"
        );

        let (mount_dir, dir_token) =
            self.create_mount_dir(registry)
                .map_err(|e| AttachError::Failed {
                    image: image_path.clone(),
                    attempts: 0,
                    reason: format!("{:#}", e),
                })?;

        let outcome = self.settings.retry.run_while(
            "attach",
            |e: &AttemptError| matches!(e, AttemptError::Transient(_)),
            |_| self.attach_attempt(&image_path, &mount_dir, layout, registry),
        );

        match outcome {
            Ok(((device, mounts), attempts)) => {
                info!(
                    device = %device.1,
                    mounts = mounts.len(),
                    attempts,
                    "Image attached"
                );
                Ok(Attachment {
                    device: device.1,
                    image: image_path,
                    read_only: self.settings.read_only,
                    mounts,
                    attempts,
                    mount_dir,
                    device_token: device.0,
                    dir_token,
                })
            }
            Err(err) => {
                if let Some(Err(e)) = registry.release(dir_token) {
                    warn!("removing mount directory failed: {:#}", e);
                }
                Err(match err.last {
                    AttemptError::Permanent(e) => e,
                    AttemptError::Transient(e) => AttachError::Failed {
                        image: image_path,
                        attempts: err.attempts,
                        reason: format!("{:#}", e),
                    },
                })
            }
        }
    }

    fn create_mount_dir(&self, registry: &mut CleanupRegistry) -> Result<(PathBuf, CleanupToken)> {
        let seq = MOUNT_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = self
            .settings
            .work_dir
            .join(format!("mnt-{}-{}", std::process::id(), seq));
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating mount directory '{}'", dir.display()))?;
        let cleanup_dir = dir.clone();
        // remove_dir refuses non-empty directories, so a still-mounted
        // filesystem is never deleted through here.
        let token = registry.push(format!("remove {}", dir.display()), move || {
            if cleanup_dir.exists() {
                fs::remove_dir(&cleanup_dir).with_context(|| {
                    format!("removing mount directory '{}'", cleanup_dir.display())
                })?;
            }
            Ok(())
        });
        Ok((dir, token))
    }

    #[allow(clippy::type_complexity)]
    fn attach_attempt(
        &self,
        image: &Path,
        mount_dir: &Path,
        layout: ResolvedLayout,
        registry: &mut CleanupRegistry,
    ) -> std::result::Result<((CleanupToken, String), Vec<PartitionMount>), AttemptError> {
        let mut tokens = AttemptTokens::default();
        let result = self.attach_steps(image, mount_dir, layout, registry, &mut tokens);
        if result.is_err() {
            rollback(registry, tokens);
        }
        result
    }

    #[allow(clippy::type_complexity)]
    fn attach_steps(
        &self,
        image: &Path,
        mount_dir: &Path,
        layout: ResolvedLayout,
        registry: &mut CleanupRegistry,
        tokens: &mut AttemptTokens,
    ) -> std::result::Result<((CleanupToken, String), Vec<PartitionMount>), AttemptError> {
        let read_only = self.settings.read_only;
        let mut expected = vec![layout.root];
        expected.extend(layout.boot);

        let device = self
            .strategy
            .attach_device(image, read_only, &expected, self.settings.enumerate_timeout)
            .map_err(AttemptError::Transient)?;
        let strategy = Arc::clone(&self.strategy);
        let device_id = device.id.clone();
        let device_token = registry.push(format!("release {}", device.id), move || {
            strategy.release(&device_id)
        });
        tokens.device = Some(device_token);
        debug!(device = %device.id, partitions = device.partitions.len(), "device attached");

        let node = |index: u32| {
            device
                .partitions
                .iter()
                .find(|p| p.index == index)
                .cloned()
                .ok_or_else(|| {
                    AttemptError::Transient(anyhow!(
                        "device {} exposes no node for partition {}",
                        device.id,
                        index
                    ))
                })
        };

        let mut mounts = Vec::new();

        let root_node = node(layout.root)?;
        let root = self.mount_one(&root_node, MountRole::Root, mount_dir, registry)?;
        tokens.mounts.push(root.token);
        mounts.push(root);

        if let Some(boot_index) = layout.boot {
            let boot_node = node(boot_index)?;
            let target = mount_dir.join(&self.settings.boot_mount);
            if !target.is_dir() {
                if read_only {
                    return Err(AttemptError::Permanent(AttachError::Layout {
                        image: image.to_path_buf(),
                        role: MountRole::Boot.to_string(),
                        reason: format!(
                            "mount point '{}' does not exist on the root filesystem",
                            self.settings.boot_mount.display()
                        ),
                    }));
                }
                fs::create_dir_all(&target)
                    .with_context(|| format!("creating boot mount point '{}'", target.display()))
                    .map_err(AttemptError::Transient)?;
            }
            let boot = self.mount_one(&boot_node, MountRole::Boot, &target, registry)?;
            tokens.mounts.push(boot.token);
            mounts.push(boot);
        }

        tokens.device = None;
        tokens.mounts.clear();
        Ok(((device_token, device.id.clone()), mounts))
    }

    fn mount_one(
        &self,
        node: &PartitionNode,
        role: MountRole,
        target: &Path,
        registry: &mut CleanupRegistry,
    ) -> std::result::Result<PartitionMount, AttemptError> {
        let fstype = self
            .strategy
            .mount(node, target, self.settings.read_only)
            .with_context(|| format!("mounting {} partition {}", role, node.path.display()))
            .map_err(AttemptError::Transient)?;
        let strategy = Arc::clone(&self.strategy);
        let unmount_target = target.to_path_buf();
        let token = registry.push(format!("unmount {}", target.display()), move || {
            strategy.unmount(&unmount_target)
        });
        debug!(%role, partition = node.index, target = %target.display(), %fstype, "mounted");
        Ok(PartitionMount {
            index: node.index,
            role,
            path: target.to_path_buf(),
            fstype,
            state: MountState::Mounted,
            token,
        })
    }

    /// Unmount boot then root and release the device.
    ///
    /// Each step uses the retry policy. On failure the remaining cleanup
    /// actions stay armed in `registry`.
    pub fn detach(
        &self,
        mut attachment: Attachment,
        registry: &mut CleanupRegistry,
    ) -> Result<(), DetachError> {
        let device = attachment.device.clone();
        info!(device = %device, "Detaching image");
        let retry = self.settings.retry;
        let mut total_attempts = 0;

        for mount in attachment.mounts.iter_mut().rev() {
            if !mount.is_mounted() {
                continue;
            }
            let target = mount.path.clone();
            let (_, attempts) = retry
                .run(&format!("unmount {}", target.display()), |_| {
                    self.strategy.unmount(&target)
                })
                .map_err(|e| self.detach_error(&device, total_attempts + e.attempts, e.last))?;
            total_attempts += attempts;
            mount.state = MountState::Unmounted;
            registry.disarm(mount.token);
        }

        let (_, attempts) = retry
            .run(&format!("release {}", device), |_| self.strategy.release(&device))
            .map_err(|e| self.detach_error(&device, total_attempts + e.attempts, e.last))?;
        total_attempts += attempts;
        registry.disarm(attachment.device_token);

        if let Some(Err(e)) = registry.release(attachment.dir_token) {
            warn!("removing mount directory failed: {:#}", e);
        }

        info!(device = %device, attempts = total_attempts, "Image detached");
        Ok(())
    }

    fn detach_error(&self, device: &str, attempts: u32, err: anyhow::Error) -> DetachError {
        DetachError {
            device: device.to_string(),
            attempts,
            reason: format!("{:#}", err),
            device_still_attached: self.strategy.is_attached(device),
        }
    }
}

fn rollback(registry: &mut CleanupRegistry, tokens: AttemptTokens) {
    for token in tokens.mounts.into_iter().rev().chain(tokens.device) {
        if let Some(Err(e)) = registry.release(token) {
            warn!("rollback step failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::table::tests::mbr_sector;
    use crate::testing::{root_tree, write_image, FakeStrategy, MIB};
    use tempfile::TempDir;

    fn manager(strategy: &Arc<FakeStrategy>, work: &Path) -> AttachmentManager {
        let settings = AttachSettings {
            retry: RetryPolicy::new(3, Duration::ZERO),
            work_dir: work.to_path_buf(),
            ..AttachSettings::default()
        };
        AttachmentManager::new(strategy.clone(), settings)
    }

    fn two_partition_image(tmp: &TempDir) -> PathBuf {
        write_image(
            &tmp.path().join("disk.img"),
            150 * MIB,
            &mbr_sector(&[(0x0c, 8192, 65536, true), (0x83, 73728, 200000, false)]),
        )
    }

    #[test]
    fn test_attach_mounts_root_then_boot() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        assert_eq!(att.mounts().len(), 2);
        assert_eq!(att.root().role, MountRole::Root);
        assert_eq!(att.root().index, 2);
        let boot = att.boot().unwrap();
        assert_eq!(boot.index, 1);
        assert!(boot.path.starts_with(&att.root().path));
        assert_eq!(fake.mount_order(), vec![2, 1]);
        assert_eq!(att.attempts(), 1);

        mgr.detach(att, &mut reg).unwrap();
        assert!(reg.is_empty());
        assert_eq!(fake.active_mounts(), 0);
        assert_eq!(fake.attached_devices(), 0);
    }

    #[test]
    fn test_detach_unmounts_boot_before_root() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        let boot_path = att.boot().unwrap().path.clone();
        let root_path = att.root().path.clone();
        mgr.detach(att, &mut reg).unwrap();
        assert_eq!(fake.unmount_order(), vec![boot_path, root_path]);
    }

    #[test]
    fn test_attach_retries_transient_failure() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        fake.fail_attach(2);
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        assert_eq!(att.attempts(), 3);
        mgr.detach(att, &mut reg).unwrap();
    }

    #[test]
    fn test_attach_exhausts_retries() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        fake.fail_attach(5);
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let err = mgr.attach(&image, &mut reg).unwrap_err();
        assert!(matches!(err, AttachError::Failed { attempts: 3, .. }));
        assert!(reg.is_empty());
        assert_eq!(fake.attached_devices(), 0);
    }

    #[test]
    fn test_boot_mount_failure_rolls_back_root_and_device() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        fake.fail_mount_of(1, 10);
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let err = mgr.attach(&image, &mut reg).unwrap_err();
        assert!(matches!(err, AttachError::Failed { .. }));
        assert_eq!(fake.active_mounts(), 0);
        assert_eq!(fake.attached_devices(), 0);
        assert!(reg.is_empty());
        assert!(fs::read_dir(tmp.path().join("work")).unwrap().next().is_none());
    }

    #[test]
    fn test_detach_retries_once_then_succeeds() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        fake.fail_release(1);
        mgr.detach(att, &mut reg).unwrap();
        assert_eq!(fake.release_calls(), 2);
        assert_eq!(fake.attached_devices(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_detach_failure_leaves_cleanup_armed() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        fake.fail_release(3);
        let err = mgr.detach(att, &mut reg).unwrap_err();
        assert!(err.device_still_attached);
        assert_eq!(err.attempts, 5);

        let report = reg.drain();
        assert!(report.is_clean());
        assert_eq!(fake.attached_devices(), 0);
    }

    #[test]
    fn test_single_partition_image_is_root_only() {
        let tmp = TempDir::new().unwrap();
        let path = write_image(
            &tmp.path().join("one.img"),
            120 * MIB,
            &mbr_sector(&[(0x83, 2048, 200000, false)]),
        );
        let image = ImageHandle::inspect(&path).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        assert_eq!(att.mounts().len(), 1);
        assert_eq!(att.root().index, 1);
        assert!(att.boot().is_none());
        mgr.detach(att, &mut reg).unwrap();
    }

    #[test]
    fn test_layout_mismatch_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let path = write_image(
            &tmp.path().join("odd.img"),
            120 * MIB,
            &mbr_sector(&[(0x83, 2048, 1000, false), (0x83, 4096, 1000, false)]),
        );
        let image = ImageHandle::inspect(&path).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let settings = AttachSettings {
            layout: PartitionLayout {
                root: 3,
                boot: None,
            },
            retry: RetryPolicy::new(3, Duration::ZERO),
            work_dir: tmp.path().join("work"),
            ..AttachSettings::default()
        };
        let mgr = AttachmentManager::new(fake.clone(), settings);
        let mut reg = CleanupRegistry::new();

        let err = mgr.attach(&image, &mut reg).unwrap_err();
        assert!(matches!(err, AttachError::Layout { .. }));
        assert_eq!(fake.attach_calls(), 0);
    }

    #[test]
    fn test_drain_after_interrupted_attach_leaks_nothing() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let fake = Arc::new(FakeStrategy::new());
        let mgr = manager(&fake, &tmp.path().join("work"));
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        assert_eq!(fake.active_mounts(), 2);
        drop(att);
        let report = reg.drain();
        assert!(report.is_clean());
        assert_eq!(fake.active_mounts(), 0);
        assert_eq!(fake.attached_devices(), 0);
    }

    #[test]
    fn test_read_only_attach_leaves_image_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let image = ImageHandle::inspect(&two_partition_image(&tmp)).unwrap();
        let before = image.fingerprint().unwrap();
        let tree = root_tree(&tmp.path().join("tree"));
        let fake = Arc::new(FakeStrategy::new().with_fixture(2, &tree));
        let mgr = manager(&fake, &tmp.path().join("work")).read_only();
        let mut reg = CleanupRegistry::new();

        let att = mgr.attach(&image, &mut reg).unwrap();
        assert!(att.is_read_only());
        assert_eq!(fake.read_only_attaches(), 1);
        mgr.detach(att, &mut reg).unwrap();
        assert_eq!(image.fingerprint().unwrap(), before);
    }

    #[test]
    fn test_wait_for_nodes_times_out() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("loop9p1");
        let err = wait_for_nodes(&[missing], Duration::from_millis(150)).unwrap_err();
        assert!(err.to_string().contains("did not appear"));
    }

    #[test]
    fn test_layout_drops_missing_boot() {
        let mut table = PartitionTableDescriptor::default();
        table.entries.push(crate::image::PartitionEntry {
            index: 2,
            offset: 0,
            size: 0,
            part_type: crate::image::PartitionType::Mbr(0x83),
            active: false,
        });
        let resolved = PartitionLayout::default().resolve(&table).unwrap();
        assert_eq!(resolved.root, 2);
        assert_eq!(resolved.boot, None);
    }
}
