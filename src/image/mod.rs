//! Image file handle and on-disk partition table access.

pub mod table;

pub use table::{
    PartitionEntry, PartitionTableDescriptor, PartitionType, TableKind, SECTOR_SIZE,
};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Image file spanning one pipeline run.
///
/// While open, the handle holds an exclusive advisory lock on the file so a
/// second pipeline cannot mutate the same image concurrently.
#[derive(Debug)]
pub struct ImageHandle {
    path: PathBuf,
    size: u64,
    file: Option<File>,
}

impl ImageHandle {
    /// Describe an image without opening or locking it.
    pub fn inspect(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .with_context(|| format!("reading image metadata '{}'", path.display()))?;
        if !meta.is_file() {
            anyhow::bail!("image '{}' is not a regular file", path.display());
        }
        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            file: None,
        })
    }

    /// Open the image and take an exclusive lock for the lifetime of the handle.
    ///
    /// Returns `Ok(None)` if another handle already holds the lock.
    pub fn open_locked(path: &Path) -> Result<Option<Self>> {
        let mut handle = Self::inspect(path)?;
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("opening image '{}'", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        debug!(image = %path.display(), "image locked");
        handle.file = Some(file);
        Ok(Some(handle))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whole sectors in the image.
    pub fn sector_count(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock and close the file.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            debug!(image = %self.path.display(), "image unlocked");
        }
    }

    /// Parse the partition table.
    pub fn partition_table(&self) -> Result<PartitionTableDescriptor> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("opening image '{}'", self.path.display()))?;
        PartitionTableDescriptor::read(&mut file, self.size)
            .with_context(|| format!("reading partition table of '{}'", self.path.display()))
    }

    /// SHA-256 of the image contents as lowercase hex.
    pub fn fingerprint(&self) -> Result<String> {
        sha256_file(&self.path)
    }
}

impl Drop for ImageHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_inspect_reports_size_and_sectors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        File::create(&path).unwrap().set_len(4096).unwrap();

        let handle = ImageHandle::inspect(&path).unwrap();
        assert_eq!(handle.size(), 4096);
        assert_eq!(handle.sector_count(), 8);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_second_lock_is_refused_until_close() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        File::create(&path).unwrap().set_len(1024).unwrap();

        let mut first = ImageHandle::open_locked(&path).unwrap().unwrap();
        assert!(first.is_open());
        assert!(ImageHandle::open_locked(&path).unwrap().is_none());

        first.close();
        assert!(ImageHandle::open_locked(&path).unwrap().is_some());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        fs::write(&path, b"abc").unwrap();
        let handle = ImageHandle::inspect(&path).unwrap();
        assert_eq!(
            handle.fingerprint().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        fs::write(&path, b"abd").unwrap();
        assert_ne!(
            handle.fingerprint().unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_inspect_rejects_directory() {
        let tmp = TempDir::new().unwrap();
        assert!(ImageHandle::inspect(tmp.path()).is_err());
    }
}
