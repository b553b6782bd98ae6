//! Structural verification of image files.
//!
//! Basic verification only reads the first two sectors and the file size.
//! Extended verification additionally attaches the image read-only and
//! checks that the root filesystem contains the expected paths.

use crate::attach::{Attachment, AttachmentManager, MountRole};
use crate::cleanup::CleanupRegistry;
use crate::error::VerifyError;
use crate::image::{ImageHandle, PartitionTableDescriptor, TableKind, SECTOR_SIZE};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// 100 MiB: smaller files cannot hold a bootable OS image.
pub const DEFAULT_MIN_IMAGE_BYTES: u64 = 100 * 1024 * 1024;
/// 64 GiB
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    Basic,
    Extended,
}

impl std::str::FromStr for VerifyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(VerifyLevel::Basic),
            "extended" => Ok(VerifyLevel::Extended),
            other => Err(format!(
                "unknown verification level '{}' (expected basic or extended)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifySettings {
    pub min_image_bytes: u64,
    pub max_image_bytes: u64,
    /// Paths relative to the root filesystem that must exist and be non-empty.
    pub required_paths: Vec<String>,
    /// Paths whose absence is only a warning.
    pub optional_paths: Vec<String>,
    /// The boot mount, if any, must contain at least one entry.
    pub require_boot_contents: bool,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            min_image_bytes: DEFAULT_MIN_IMAGE_BYTES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            required_paths: ["etc", "usr", "bin", "etc/fstab"]
                .map(String::from)
                .to_vec(),
            optional_paths: ["boot/cmdline.txt", "boot/config.txt", "etc/hostname"]
                .map(String::from)
                .to_vec(),
            require_boot_contents: true,
        }
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub level: VerifyLevel,
    pub size: u64,
    /// Authoritative table kind.
    pub kind: TableKind,
    pub mbr_valid: bool,
    pub gpt_valid: bool,
    /// Non-empty MBR slots in bytes 446-509.
    pub active_entries: usize,
    pub descriptor: PartitionTableDescriptor,
    pub warnings: Vec<String>,
}

pub struct Verifier {
    settings: VerifySettings,
    attacher: Option<AttachmentManager>,
}

impl Verifier {
    pub fn new(settings: VerifySettings) -> Self {
        Self {
            settings,
            attacher: None,
        }
    }

    /// Enable extended verification. The manager is switched to read-only.
    pub fn with_attacher(mut self, manager: &AttachmentManager) -> Self {
        self.attacher = Some(manager.read_only());
        self
    }

    pub fn settings(&self) -> &VerifySettings {
        &self.settings
    }

    pub fn verify(&self, image: &Path, level: VerifyLevel) -> Result<VerifyReport, VerifyError> {
        let mut report = self.verify_structure(image)?;
        if level == VerifyLevel::Extended {
            report.level = VerifyLevel::Extended;
            report.warnings.extend(self.verify_contents(image)?);
        }
        info!(
            image = %image.display(),
            level = ?report.level,
            kind = ?report.kind,
            warnings = report.warnings.len(),
            "Image verified"
        );
        Ok(report)
    }

    /// Size bounds, table signatures and sector alignment.
    pub fn verify_structure(&self, image: &Path) -> Result<VerifyReport, VerifyError> {
        let unreadable = |e: anyhow::Error| VerifyError::Unreadable {
            path: image.to_path_buf(),
            reason: format!("{:#}", e),
        };
        let handle = ImageHandle::inspect(image).map_err(unreadable)?;
        let size = handle.size();

        if size < self.settings.min_image_bytes {
            return Err(VerifyError::TooSmall {
                path: image.to_path_buf(),
                size,
                min: self.settings.min_image_bytes,
            });
        }
        if size > self.settings.max_image_bytes {
            return Err(VerifyError::TooLarge {
                path: image.to_path_buf(),
                size,
                max: self.settings.max_image_bytes,
            });
        }

        let descriptor = handle.partition_table().map_err(unreadable)?;
        let kind = descriptor.kind.ok_or_else(|| VerifyError::NoPartitionTable {
            path: image.to_path_buf(),
        })?;

        if size % SECTOR_SIZE != 0 {
            return Err(VerifyError::Misaligned {
                path: image.to_path_buf(),
                size,
            });
        }

        let mut warnings = Vec::new();
        if descriptor.has_both_signatures() {
            let protective = descriptor.is_protective_mbr();
            let msg = if protective {
                "image carries a protective MBR and a GPT header; using GPT".to_string()
            } else {
                "image carries both an MBR and a GPT header; treating GPT as authoritative"
                    .to_string()
            };
            warn!(image = %image.display(), "{}", msg);
            warnings.push(msg);
        }
        if descriptor.mountable_count() == 0 {
            let msg = "partition table declares no mountable partitions".to_string();
            warn!(image = %image.display(), "{}", msg);
            warnings.push(msg);
        }

        debug!(
            image = %image.display(),
            size,
            ?kind,
            active = descriptor.mbr_active_slots,
            "structure verified"
        );

        Ok(VerifyReport {
            level: VerifyLevel::Basic,
            size,
            kind,
            mbr_valid: descriptor.mbr_signature,
            gpt_valid: descriptor.gpt_signature,
            active_entries: descriptor.mbr_active_slots,
            descriptor,
            warnings,
        })
    }

    /// Attach read-only, check paths, always detach again.
    fn verify_contents(&self, image: &Path) -> Result<Vec<String>, VerifyError> {
        let manager = self
            .attacher
            .as_ref()
            .ok_or(VerifyError::ExtendedUnavailable)?;
        let handle = ImageHandle::inspect(image).map_err(|e| VerifyError::Unreadable {
            path: image.to_path_buf(),
            reason: format!("{:#}", e),
        })?;

        let mut registry = CleanupRegistry::new();
        let attachment = manager.attach(&handle, &mut registry)?;
        let checked = self.check_paths(&attachment);
        let detached = manager.detach(attachment, &mut registry);
        let drained = registry.drain();
        for (label, err) in &drained.failures {
            warn!("cleanup '{}' failed after verification: {}", label, err);
        }

        let warnings = checked?;
        detached?;
        Ok(warnings)
    }

    /// Required and optional path checks against a live attachment.
    ///
    /// Returns warnings for missing optional paths.
    pub fn check_paths(&self, attachment: &Attachment) -> Result<Vec<String>, VerifyError> {
        let root = &attachment.root().path;
        for rel in &self.settings.required_paths {
            check_required(root, rel)?;
        }

        if self.settings.require_boot_contents {
            if let Some(boot) = attachment.boot() {
                let empty = fs::read_dir(&boot.path)
                    .map(|mut it| it.next().is_none())
                    .unwrap_or(true);
                if empty {
                    return Err(VerifyError::EmptyRequiredPath {
                        path: format!("{} partition {}", MountRole::Boot, boot.index),
                    });
                }
            }
        }

        let mut warnings = Vec::new();
        for rel in &self.settings.optional_paths {
            if fs::symlink_metadata(root.join(rel)).is_err() {
                let msg = format!("optional path '{}' is missing", rel);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }
        Ok(warnings)
    }
}

/// Symlinks count as present: `bin -> usr/bin` is normal on merged-usr roots.
fn check_required(root: &Path, rel: &str) -> Result<(), VerifyError> {
    let path = root.join(rel);
    let meta = fs::symlink_metadata(&path).map_err(|_| VerifyError::MissingRequiredPath {
        path: rel.to_string(),
    })?;
    let empty = if meta.file_type().is_symlink() {
        false
    } else if meta.is_dir() {
        fs::read_dir(&path)
            .map(|mut it| it.next().is_none())
            .unwrap_or(true)
    } else {
        meta.len() == 0
    };
    if empty {
        return Err(VerifyError::EmptyRequiredPath {
            path: rel.to_string(),
        });
    }
    Ok(())
}
