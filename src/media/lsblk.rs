//! Linux external disks via `lsblk`, written with `dd`.

use super::{MediaBackend, RemovableDisk};
use crate::process::Cmd;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,SIZE,RM,HOTPLUG,FSTYPE,LABEL,MOUNTPOINT";

#[derive(Debug, Default)]
pub struct LsblkMedia;

impl LsblkMedia {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkNode>,
}

#[derive(Debug, Deserialize)]
struct LsblkNode {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<u64>,
    #[serde(default)]
    rm: bool,
    #[serde(default)]
    hotplug: bool,
    fstype: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

impl LsblkNode {
    fn mountpoints(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.mountpoint.iter().map(PathBuf::from).collect();
        for child in &self.children {
            out.extend(child.mountpoints());
        }
        out
    }

    fn into_disk(self) -> RemovableDisk {
        let volume_name = self
            .children
            .iter()
            .find_map(|c| c.label.clone())
            .or_else(|| self.label.clone())
            .unwrap_or_default();
        let file_system = self
            .fstype
            .clone()
            .or_else(|| self.children.iter().find_map(|c| c.fstype.clone()))
            .unwrap_or_else(|| "Unknown".to_string());
        RemovableDisk {
            device: PathBuf::from(self.path),
            volume_name,
            size_bytes: self.size.unwrap_or(0),
            file_system,
            removable: self.rm,
            ejectable: self.hotplug,
        }
    }
}

fn parse(json: &str) -> Result<Vec<LsblkNode>> {
    let parsed: LsblkOutput = serde_json::from_str(json).context("parsing lsblk output")?;
    Ok(parsed.blockdevices)
}

/// Whole disks flagged removable or hotplug.
fn external(nodes: Vec<LsblkNode>) -> Vec<RemovableDisk> {
    nodes
        .into_iter()
        .filter(|n| n.kind == "disk" && (n.rm || n.hotplug))
        .map(LsblkNode::into_disk)
        .collect()
}

fn query(device: Option<&Path>) -> Result<Vec<LsblkNode>> {
    let mut cmd = Cmd::new("lsblk").args(["--json", "--bytes", "-o", LSBLK_COLUMNS]);
    if let Some(device) = device {
        cmd = cmd.arg_path(device);
    }
    let out = cmd.error_msg("listing block devices").run()?;
    parse(&out.stdout)
}

fn query_disk(device: &Path) -> Result<LsblkNode> {
    query(Some(device))?
        .into_iter()
        .find(|n| n.kind == "disk")
        .ok_or_else(|| anyhow!("'{}' is not a whole disk", device.display()))
}

impl MediaBackend for LsblkMedia {
    fn name(&self) -> &'static str {
        "lsblk"
    }

    fn list_external(&self) -> Result<Vec<RemovableDisk>> {
        Ok(external(query(None)?))
    }

    fn disk_info(&self, device: &Path) -> Result<RemovableDisk> {
        Ok(query_disk(device)?.into_disk())
    }

    fn unmount_disk(&self, device: &Path) -> Result<()> {
        for mountpoint in query_disk(device)?.mountpoints() {
            debug!(mountpoint = %mountpoint.display(), "unmounting volume");
            Cmd::new("umount")
                .arg_path(&mountpoint)
                .error_msg("unmounting volume")
                .run()?;
        }
        Ok(())
    }

    fn raw_device(&self, device: &Path) -> PathBuf {
        device.to_path_buf()
    }

    fn write_image(&self, image: &Path, raw_device: &Path) -> Result<()> {
        Cmd::new("dd")
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", raw_device.display()))
            .args(["bs=4M", "conv=fsync", "status=none"])
            .error_msg("writing image")
            .run()?;
        Ok(())
    }

    fn eject(&self, device: &Path) -> Result<()> {
        Cmd::new("eject")
            .arg_path(device)
            .error_msg("ejecting disk")
            .run()?;
        Ok(())
    }
}
