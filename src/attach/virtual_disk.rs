//! macOS raw disk image attach via `hdiutil` and `diskutil`.

use super::{wait_for_nodes, AttachStrategy, AttachedDevice, PartitionNode};
use crate::process::Cmd;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct VirtualDiskAttachStrategy;

impl VirtualDiskAttachStrategy {
    pub fn new() -> Self {
        Self
    }
}

/// One line of `hdiutil attach` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HdiutilEntry {
    pub node: String,
    pub content_hint: Option<String>,
}

pub(crate) fn parse_hdiutil_attach(stdout: &str) -> Vec<HdiutilEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let node = cols.next()?;
            if !node.starts_with("/dev/disk") {
                return None;
            }
            Some(HdiutilEntry {
                node: node.to_string(),
                content_hint: cols.next().map(str::to_string),
            })
        })
        .collect()
}

/// `/dev/disk4s2` -> Some(2); `/dev/disk4` -> None
pub(crate) fn slice_index(node: &str) -> Option<u32> {
    let name = node.strip_prefix("/dev/disk")?;
    let (_, slice) = name.split_once('s')?;
    slice.parse().ok()
}

fn fstype_from_hint(hint: &str) -> Option<String> {
    match hint {
        "Windows_FAT_32" | "Windows_FAT_16" | "DOS_FAT_32" | "DOS_FAT_16" | "DOS_FAT_12" => {
            Some("msdos".to_string())
        }
        "Apple_HFS" => Some("hfs".to_string()),
        "Apple_APFS" => Some("apfs".to_string()),
        _ => None,
    }
}

impl AttachStrategy for VirtualDiskAttachStrategy {
    fn name(&self) -> &'static str {
        "virtual-disk"
    }

    fn attach_device(
        &self,
        image: &Path,
        read_only: bool,
        expected: &[u32],
        timeout: Duration,
    ) -> Result<AttachedDevice> {
        let mut cmd = Cmd::new("hdiutil").args([
            "attach",
            "-imagekey",
            "diskimage-class=CRawDiskImage",
            "-nomount",
        ]);
        if read_only {
            cmd = cmd.arg("-readonly");
        }
        let out = cmd
            .arg_path(image)
            .error_msg("attaching disk image")
            .run()?;

        let entries = parse_hdiutil_attach(&out.stdout);
        let device = entries
            .iter()
            .find(|e| slice_index(&e.node).is_none())
            .map(|e| e.node.clone())
            .ok_or_else(|| anyhow!("hdiutil reported no whole-disk device for '{}'", image.display()))?;
        debug!(%device, image = %image.display(), "disk image attached");

        let nodes: Vec<PathBuf> = expected
            .iter()
            .map(|i| PathBuf::from(format!("{}s{}", device, i)))
            .collect();
        if let Err(e) = wait_for_nodes(&nodes, timeout) {
            if let Err(release) = self.release(&device) {
                warn!("releasing {} after failed enumeration: {:#}", device, release);
            }
            return Err(e.context(format!("enumerating partitions of {}", device)));
        }

        let partitions = expected
            .iter()
            .zip(nodes)
            .map(|(index, path)| {
                let fstype = entries
                    .iter()
                    .find(|e| slice_index(&e.node) == Some(*index))
                    .and_then(|e| e.content_hint.as_deref())
                    .and_then(fstype_from_hint);
                PartitionNode {
                    index: *index,
                    path,
                    fstype,
                }
            })
            .collect();

        Ok(AttachedDevice {
            id: device,
            partitions,
        })
    }

    fn mount(&self, partition: &PartitionNode, target: &Path, read_only: bool) -> Result<String> {
        let mut cmd = Cmd::new("diskutil").arg("mount");
        if read_only {
            cmd = cmd.arg("readOnly");
        }
        cmd.arg("-mountPoint")
            .arg_path(target)
            .arg_path(&partition.path)
            .error_msg("mounting partition")
            .run()
            .with_context(|| {
                format!(
                    "macOS may not support the filesystem on {}",
                    partition.path.display()
                )
            })?;
        Ok(partition
            .fstype
            .clone()
            .unwrap_or_else(|| "unknown".to_string()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("diskutil")
            .arg("unmount")
            .arg_path(target)
            .error_msg("unmounting partition")
            .run()?;
        Ok(())
    }

    fn release(&self, device: &str) -> Result<()> {
        Cmd::new("hdiutil")
            .args(["detach", device])
            .error_msg("detaching disk image")
            .run()?;
        Ok(())
    }

    fn is_attached(&self, device: &str) -> bool {
        Cmd::new("diskutil")
            .args(["info", device])
            .allow_fail()
            .run()
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTACH_OUTPUT: &str = "/dev/disk4          \tFDisk_partition_scheme         \t\n\
/dev/disk4s1        \tWindows_FAT_32                 \t\n\
/dev/disk4s2        \tLinux                          \t\n";

    #[test]
    fn test_parse_hdiutil_attach() {
        let entries = parse_hdiutil_attach(ATTACH_OUTPUT);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].node, "/dev/disk4");
        assert_eq!(entries[1].content_hint.as_deref(), Some("Windows_FAT_32"));
    }

    #[test]
    fn test_slice_index() {
        assert_eq!(slice_index("/dev/disk4s2"), Some(2));
        assert_eq!(slice_index("/dev/disk4"), None);
        assert_eq!(slice_index("/dev/sda1"), None);
    }

    #[test]
    fn test_fat_hint_maps_to_msdos() {
        assert_eq!(fstype_from_hint("Windows_FAT_32").as_deref(), Some("msdos"));
        assert_eq!(fstype_from_hint("Linux"), None);
    }
}
