//! macOS external disks via `diskutil`, written with `dd` to the raw node.
//!
//! `diskutil -plist` output is converted to JSON with `plutil` before parsing.

use super::{MediaBackend, RemovableDisk};
use crate::process::Cmd;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct DiskutilMedia;

impl DiskutilMedia {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskList {
    #[serde(default)]
    all_disks_and_partitions: Vec<ListedDisk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedDisk {
    #[serde(default)]
    device_identifier: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    size: u64,
    removable: Option<bool>,
    ejectable: Option<bool>,
    mount_point: Option<String>,
    #[serde(default)]
    partitions: Vec<ListedVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedVolume {
    volume_name: Option<String>,
    mount_point: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskInfo {
    device_identifier: String,
    volume_name: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content: String,
    #[serde(default)]
    removable: bool,
    #[serde(default)]
    removable_media: bool,
    #[serde(default)]
    ejectable: bool,
}

fn file_system(content: &str) -> String {
    if content.is_empty() {
        "Unknown".to_string()
    } else {
        content.to_string()
    }
}

pub(crate) fn parse_list(json: &str) -> Result<Vec<RemovableDisk>> {
    let list: DiskList = serde_json::from_str(json).context("parsing diskutil list output")?;
    let mut disks = Vec::new();
    for disk in list.all_disks_and_partitions {
        if disk.device_identifier.is_empty() {
            continue;
        }
        let volume = disk.partitions.iter().find_map(|p| p.volume_name.clone());
        let mount_point = disk
            .partitions
            .iter()
            .find_map(|p| p.mount_point.clone())
            .or(disk.mount_point.clone());
        let volume_name = volume
            .or_else(|| {
                mount_point.as_deref().and_then(|m| {
                    Path::new(m)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_default();

        // `list external` only reports external disks; missing flags mean yes.
        let removable = disk.removable.unwrap_or(false);
        let ejectable = disk.ejectable.unwrap_or(true);
        if !(removable || ejectable || mount_point.is_some() || !disk.partitions.is_empty()) {
            continue;
        }
        disks.push(RemovableDisk {
            device: PathBuf::from(format!("/dev/{}", disk.device_identifier)),
            volume_name,
            size_bytes: disk.size,
            file_system: file_system(&disk.content),
            removable,
            ejectable,
        });
    }
    Ok(disks)
}

pub(crate) fn parse_info(json: &str) -> Result<RemovableDisk> {
    let info: DiskInfo = serde_json::from_str(json).context("parsing diskutil info output")?;
    Ok(RemovableDisk {
        device: PathBuf::from(format!("/dev/{}", info.device_identifier)),
        volume_name: info
            .volume_name
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        size_bytes: info.size,
        file_system: file_system(&info.content),
        removable: info.removable || info.removable_media,
        ejectable: info.ejectable,
    })
}

/// `/dev/disk4` -> `/dev/rdisk4`
pub(crate) fn raw_node(device: &Path) -> PathBuf {
    let text = device.to_string_lossy();
    match text.strip_prefix("/dev/disk") {
        Some(rest) => PathBuf::from(format!("/dev/rdisk{}", rest)),
        None => device.to_path_buf(),
    }
}

fn plist_as_json(plist: &str) -> Result<String> {
    let out = Cmd::new("plutil")
        .args(["-convert", "json", "-o", "-", "-"])
        .input(plist)
        .error_msg("converting diskutil plist")
        .run()?;
    Ok(out.stdout)
}

impl MediaBackend for DiskutilMedia {
    fn name(&self) -> &'static str {
        "diskutil"
    }

    fn list_external(&self) -> Result<Vec<RemovableDisk>> {
        let out = Cmd::new("diskutil")
            .args(["list", "-plist", "external", "physical"])
            .error_msg("listing external disks")
            .run()?;
        parse_list(&plist_as_json(&out.stdout)?)
    }

    fn disk_info(&self, device: &Path) -> Result<RemovableDisk> {
        let out = Cmd::new("diskutil")
            .args(["info", "-plist"])
            .arg_path(device)
            .error_msg("querying disk")
            .run()?;
        parse_info(&plist_as_json(&out.stdout)?)
    }

    fn unmount_disk(&self, device: &Path) -> Result<()> {
        Cmd::new("diskutil")
            .arg("unmountDisk")
            .arg_path(device)
            .error_msg("unmounting disk")
            .run()?;
        Ok(())
    }

    fn raw_device(&self, device: &Path) -> PathBuf {
        raw_node(device)
    }

    fn write_image(&self, image: &Path, raw_device: &Path) -> Result<()> {
        Cmd::new("dd")
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", raw_device.display()))
            .arg("bs=1m")
            .error_msg("writing image")
            .run()?;
        Ok(())
    }

    fn eject(&self, device: &Path) -> Result<()> {
        Cmd::new("diskutil")
            .arg("eject")
            .arg_path(device)
            .error_msg("ejecting disk")
            .run()?;
        Ok(())
    }
}
