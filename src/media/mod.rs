//! Writing a finished image onto removable media.
//!
//! A [`MediaBackend`] lists external disks and performs the raw write;
//! [`MediaWriter`] wraps it with the checks that keep a write away from the
//! wrong disk: the image must pass basic verification, the target must be
//! removable or ejectable and large enough, and the image is locked for the
//! duration of the copy.

pub mod diskutil;
pub mod lsblk;

pub use diskutil::DiskutilMedia;
pub use lsblk::LsblkMedia;

use crate::error::{MediaError, VerifyError};
use crate::image::ImageHandle;
use crate::verify::{Verifier, VerifyLevel};
use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A whole disk the host exposes as external.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovableDisk {
    pub device: PathBuf,
    pub volume_name: String,
    pub size_bytes: u64,
    pub file_system: String,
    pub removable: bool,
    pub ejectable: bool,
}

impl RemovableDisk {
    pub fn size_gib(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    /// `boot (/dev/disk4)`, or just the device when the volume is unnamed.
    pub fn display_name(&self) -> String {
        if self.volume_name.is_empty() || self.volume_name == "Untitled" {
            self.device.display().to_string()
        } else {
            format!("{} ({})", self.volume_name, self.device.display())
        }
    }

    /// Safe to overwrite as a whole.
    pub fn is_external(&self) -> bool {
        self.removable || self.ejectable
    }
}

/// Host primitives for external disks.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// External physical disks currently attached.
    fn list_external(&self) -> Result<Vec<RemovableDisk>>;

    fn disk_info(&self, device: &Path) -> Result<RemovableDisk>;

    /// Unmount every volume of the disk so nothing writes behind `dd`.
    fn unmount_disk(&self, device: &Path) -> Result<()>;

    /// Device node used for the raw copy.
    fn raw_device(&self, device: &Path) -> PathBuf;

    /// Copy the whole image onto `raw_device`.
    fn write_image(&self, image: &Path, raw_device: &Path) -> Result<()>;

    fn eject(&self, device: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub eject: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { eject: true }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    pub image: PathBuf,
    pub device: PathBuf,
    pub raw_device: PathBuf,
    pub bytes: u64,
    pub duration_ms: u64,
    pub ejected: bool,
    pub warnings: Vec<String>,
}

pub struct MediaWriter {
    backend: Arc<dyn MediaBackend>,
    verifier: Verifier,
}

impl MediaWriter {
    pub fn new(backend: Arc<dyn MediaBackend>, verifier: Verifier) -> Self {
        Self { backend, verifier }
    }

    pub fn backend(&self) -> &Arc<dyn MediaBackend> {
        &self.backend
    }

    pub fn list(&self) -> Result<Vec<RemovableDisk>> {
        self.backend.list_external()
    }

    /// Verify `image`, then overwrite `device` with it.
    pub fn write(
        &self,
        image: &Path,
        device: &Path,
        options: WriteOptions,
    ) -> Result<WriteReport, MediaError> {
        let tool = |operation: &'static str, e: anyhow::Error| MediaError::Tool {
            operation,
            device: device.to_path_buf(),
            reason: format!("{:#}", e),
        };

        let verified = self
            .verifier
            .verify(image, VerifyLevel::Basic)
            .map_err(|e| MediaError::Image(image.to_path_buf(), e))?;
        let mut warnings = verified.warnings;

        let disk = self
            .backend
            .disk_info(device)
            .map_err(|e| tool("inspecting", e))?;
        if !disk.is_external() {
            return Err(MediaError::NotRemovable {
                device: device.to_path_buf(),
            });
        }
        if verified.size > disk.size_bytes {
            return Err(MediaError::DeviceTooSmall {
                device: device.to_path_buf(),
                image_size: verified.size,
                device_size: disk.size_bytes,
            });
        }

        let unreadable = |e: anyhow::Error| {
            let reason = VerifyError::Unreadable {
                path: image.to_path_buf(),
                reason: format!("{:#}", e),
            };
            MediaError::Image(image.to_path_buf(), reason)
        };
        let mut handle = ImageHandle::open_locked(image)
            .map_err(unreadable)?
            .ok_or_else(|| MediaError::Locked(image.to_path_buf()))?;

        info!(
            image = %image.display(),
            device = %disk.display_name(),
            size_gib = format!("{:.2}", disk.size_gib()),
            backend = self.backend.name(),
            "=== Writing image to media ==="
        );
        self.backend
            .unmount_disk(device)
            .map_err(|e| tool("unmounting", e))?;

        let raw = self.backend.raw_device(device);
        let started = Instant::now();
        let written = self.backend.write_image(image, &raw);
        handle.close();
        written.map_err(|e| tool("writing", e))?;
        let duration_ms = started.elapsed().as_millis().min(u64::MAX as u128) as u64;
        info!(device = %raw.display(), duration_ms, "Image written");

        let mut ejected = false;
        if options.eject {
            match self.backend.eject(device) {
                Ok(()) => ejected = true,
                Err(e) => {
                    // The data is on the disk; only the eject failed.
                    let msg = format!("ejecting '{}' failed: {:#}", device.display(), e);
                    warn!("{}", msg);
                    warnings.push(msg);
                }
            }
        }

        Ok(WriteReport {
            image: image.to_path_buf(),
            device: device.to_path_buf(),
            raw_device: raw,
            bytes: verified.size,
            duration_ms,
            ejected,
            warnings,
        })
    }
}
