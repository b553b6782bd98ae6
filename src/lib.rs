//! Lifecycle engine for customizing bootable OS disk images.
//!
//! Takes a raw partitioned image (e.g. a Raspberry Pi OS release), exposes it
//! as a block device, mounts its partitions, runs provisioning commands inside
//! a chroot of the image root (emulating a foreign CPU architecture with a
//! user-mode emulator when needed), verifies the result and tears everything
//! down again, on success as well as on failure or interruption.
//!
//! - **Platform** - host detection and capability resolution
//! - **Attach** - loop-device / hdiutil attach, mount, retry, rollback
//! - **Verify** - MBR/GPT structure checks and required-path checks
//! - **Sandbox** - bind host kernel interfaces, DNS, emulator, exec
//! - **Pipeline** - stage state machine with a per-run cleanup registry
//! - **Media** - list external disks and write a finished image onto one
//!
//! # Architecture
//!
//! ```text
//! Pipeline
//!     │
//!     ├── Verifier ──────────── image::PartitionTableDescriptor
//!     ├── AttachmentManager ─── dyn AttachStrategy (loop | virtual-disk)
//!     ├── Sandbox ───────────── dyn SandboxBackend (chroot) + emulator
//!     └── CleanupRegistry ───── LIFO teardown, drained on every exit
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use disk_provisioner::{Config, run_pipeline};
//!
//! let config = Config::load("provision.toml".as_ref())?;
//! let report = run_pipeline(config)?;
//! println!("{}", report.to_json()?);
//! ```

pub mod attach;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod image;
pub mod interrupt;
pub mod media;
pub mod pipeline;
pub mod platform;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod sandbox;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use attach::{Attachment, AttachmentManager, AttachStrategy, PartitionLayout, PartitionMount};
pub use cleanup::CleanupRegistry;
pub use config::{Config, ProvisionStep};
pub use error::{
    AttachError, DetachError, MediaError, PipelineError, PlatformError, SandboxError, Stage, StageCause,
    VerifyError,
};
pub use image::ImageHandle;
pub use interrupt::InterruptFlag;
pub use media::{MediaBackend, MediaWriter, RemovableDisk, WriteOptions, WriteReport};
pub use pipeline::{run_pipeline, Pipeline, PipelineReport, PipelineState};
pub use platform::{Arch, Capability, HostOs, Platform};
pub use sandbox::{ExecOutput, Sandbox, SandboxContext};
pub use verify::{Verifier, VerifyLevel, VerifyReport, VerifySettings};
