//! Linux loop-device attach via `losetup --partscan`.

use super::{wait_for_nodes, AttachStrategy, AttachedDevice, PartitionNode};
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct LoopMountStrategy;

impl LoopMountStrategy {
    pub fn new() -> Self {
        Self
    }
}

/// `/dev/loop3` + 2 -> `/dev/loop3p2`
pub(crate) fn partition_path(device: &str, index: u32) -> PathBuf {
    PathBuf::from(format!("{}p{}", device, index))
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

/// Map of `/dev/<name>` to filesystem type from `lsblk --json -o NAME,FSTYPE`.
pub(crate) fn parse_lsblk(json: &str) -> Result<HashMap<PathBuf, Option<String>>> {
    let parsed: LsblkOutput = serde_json::from_str(json).context("parsing lsblk output")?;
    let mut map = HashMap::new();
    let mut stack: Vec<LsblkDevice> = parsed.blockdevices;
    while let Some(dev) = stack.pop() {
        map.insert(PathBuf::from(format!("/dev/{}", dev.name)), dev.fstype);
        stack.extend(dev.children);
    }
    Ok(map)
}

fn query_fstypes(device: &str) -> HashMap<PathBuf, Option<String>> {
    let out = Cmd::new("lsblk")
        .args(["--json", "-o", "NAME,FSTYPE", device])
        .allow_fail()
        .run();
    match out {
        Ok(out) if out.success() => parse_lsblk(&out.stdout).unwrap_or_else(|e| {
            warn!("{:#}", e);
            HashMap::new()
        }),
        _ => HashMap::new(),
    }
}

impl AttachStrategy for LoopMountStrategy {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn attach_device(
        &self,
        image: &Path,
        read_only: bool,
        expected: &[u32],
        timeout: Duration,
    ) -> Result<AttachedDevice> {
        let mut cmd = Cmd::new("losetup").args(["--find", "--show", "--partscan"]);
        if read_only {
            cmd = cmd.arg("--read-only");
        }
        let out = cmd
            .arg_path(image)
            .error_msg("attaching loop device")
            .run()?;
        let device = out.stdout_trimmed().to_string();
        if !device.starts_with("/dev/") {
            bail!("losetup returned unexpected device '{}'", device);
        }
        debug!(%device, image = %image.display(), "loop device allocated");

        let nodes: Vec<PathBuf> = expected
            .iter()
            .map(|i| partition_path(&device, *i))
            .collect();
        if let Err(e) = wait_for_nodes(&nodes, timeout) {
            // Not registered yet, so it must be released here.
            if let Err(release) = self.release(&device) {
                warn!("releasing {} after failed enumeration: {:#}", device, release);
            }
            return Err(e.context(format!("enumerating partitions of {}", device)));
        }

        let fstypes = query_fstypes(&device);
        let partitions = expected
            .iter()
            .zip(nodes)
            .map(|(index, path)| PartitionNode {
                index: *index,
                fstype: fstypes.get(&path).cloned().flatten(),
                path,
            })
            .collect();

        Ok(AttachedDevice {
            id: device,
            partitions,
        })
    }

    fn mount(&self, partition: &PartitionNode, target: &Path, read_only: bool) -> Result<String> {
        let mut cmd = Cmd::new("mount");
        if read_only {
            cmd = cmd.args(["-o", "ro"]);
        }
        cmd.arg_path(&partition.path)
            .arg_path(target)
            .error_msg("mounting partition")
            .run()?;

        if let Some(fstype) = &partition.fstype {
            return Ok(fstype.clone());
        }
        let fstype = Cmd::new("findmnt")
            .args(["-n", "-o", "FSTYPE"])
            .arg_path(target)
            .allow_fail()
            .run()
            .ok()
            .filter(|o| o.success())
            .map(|o| o.stdout_trimmed().to_string())
            .filter(|s| !s.is_empty());
        Ok(fstype.unwrap_or_else(|| "unknown".to_string()))
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .error_msg("unmounting partition")
            .run()?;
        Ok(())
    }

    fn release(&self, device: &str) -> Result<()> {
        Cmd::new("losetup")
            .args(["-d", device])
            .error_msg("detaching loop device")
            .run()?;
        Ok(())
    }

    fn is_attached(&self, device: &str) -> bool {
        Cmd::new("losetup")
            .arg(device)
            .allow_fail()
            .run()
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_path() {
        assert_eq!(partition_path("/dev/loop3", 2), PathBuf::from("/dev/loop3p2"));
    }

    #[test]
    fn test_parse_lsblk_children() {
        let json = r#"{
            "blockdevices": [
                {"name": "loop3", "fstype": null, "children": [
                    {"name": "loop3p1", "fstype": "vfat"},
                    {"name": "loop3p2", "fstype": "ext4"}
                ]}
            ]
        }"#;
        let map = parse_lsblk(json).unwrap();
        assert_eq!(
            map.get(Path::new("/dev/loop3p1")).cloned().flatten().as_deref(),
            Some("vfat")
        );
        assert_eq!(
            map.get(Path::new("/dev/loop3p2")).cloned().flatten().as_deref(),
            Some("ext4")
        );
        assert_eq!(map.get(Path::new("/dev/loop3")).cloned().flatten(), None);
    }

    #[test]
    fn test_parse_lsblk_rejects_garbage() {
        assert!(parse_lsblk("not json").is_err());
    }
}
