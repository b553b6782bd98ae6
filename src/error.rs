//! Error types for the image lifecycle core.

use crate::platform::Capability;
use std::fmt;
use std::path::PathBuf;

/// Host cannot run the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("unsupported platform '{os}': {reason}")]
    Unsupported { os: String, reason: String },

    #[error("platform capability not available: {capability} ({reason})")]
    MissingCapability {
        capability: Capability,
        reason: String,
    },

    #[error("missing host tools: {reason}")]
    MissingTools { reason: String },
}

/// Block-device attach failed.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// Retries exhausted; partial work was already rolled back.
    #[error("failed to attach '{image}' after {attempts} attempt(s): {reason}")]
    Failed {
        image: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// The partition layout does not match what the image declares.
    #[error("image '{image}' has no usable {role} partition: {reason}")]
    Layout {
        image: PathBuf,
        role: String,
        reason: String,
    },

    #[error("cannot read image '{image}': {reason}")]
    Image { image: PathBuf, reason: String },

    #[error("image '{0}' is locked by another pipeline")]
    Locked(PathBuf),
}

/// Unmount or release did not complete within the retry bound.
#[derive(Debug, thiserror::Error)]
#[error("failed to detach '{device}' after {attempts} attempt(s): {reason}")]
pub struct DetachError {
    pub device: String,
    pub attempts: u32,
    pub reason: String,
    /// The block device is still attached to the host.
    pub device_still_attached: bool,
}

/// Structural verification failed. The display string is the reason.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("cannot read image '{path}': {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("image '{path}' is {size} bytes, below the minimum plausible OS image size of {min} bytes")]
    TooSmall { path: PathBuf, size: u64, min: u64 },

    #[error("image '{path}' is {size} bytes, above the maximum sane image size of {max} bytes")]
    TooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("image '{path}' has neither an MBR signature (0x55AA at byte 510) nor a GPT header ('EFI PART' at byte 512)")]
    NoPartitionTable { path: PathBuf },

    #[error("image '{path}' is {size} bytes, not a multiple of the 512-byte sector size")]
    Misaligned { path: PathBuf, size: u64 },

    #[error("required path '{path}' is missing from the image")]
    MissingRequiredPath { path: String },

    #[error("required path '{path}' exists but is empty")]
    EmptyRequiredPath { path: String },

    #[error("extended verification needs an attach strategy")]
    ExtendedUnavailable,

    #[error("extended verification could not attach the image: {0}")]
    Attach(#[from] AttachError),

    #[error("extended verification could not detach the image: {0}")]
    Detach(#[from] DetachError),
}

impl VerifyError {
    /// Human-readable reason.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn is_size_related(&self) -> bool {
        matches!(
            self,
            VerifyError::TooSmall { .. } | VerifyError::TooLarge { .. }
        )
    }
}

/// Writing an image onto removable media failed.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("image '{0}' failed verification: {1}")]
    Image(PathBuf, #[source] VerifyError),

    #[error("'{device}' is not a removable or ejectable disk; refusing to overwrite it")]
    NotRemovable { device: PathBuf },

    #[error("image is {image_size} bytes but '{device}' only holds {device_size} bytes")]
    DeviceTooSmall {
        device: PathBuf,
        image_size: u64,
        device_size: u64,
    },

    #[error("image '{0}' is locked by another pipeline")]
    Locked(PathBuf),

    #[error("{operation} '{device}' failed: {reason}")]
    Tool {
        operation: &'static str,
        device: PathBuf,
        reason: String,
    },
}

/// Sandbox setup or execution failed.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The host cannot isolate a root; commands are never run on the host instead.
    #[error("sandbox execution not supported on this host: {reason}")]
    Unsupported { reason: String },

    #[error("sandbox root '{0}' is not backed by an active partition mount")]
    RootNotMounted(PathBuf),

    #[error("failed to bind {interface} at '{target}': {reason}")]
    BindFailed {
        interface: String,
        target: PathBuf,
        reason: String,
    },

    #[error("failed to install DNS configuration into '{root}': {reason}")]
    DnsSetupFailed { root: PathBuf, reason: String },

    #[error("user-mode emulator for {arch} unavailable: {reason}")]
    EmulatorUnavailable { arch: String, reason: String },

    #[error("sandbox at '{0}' is not entered")]
    NotBound(PathBuf),

    #[error("failed to run '{command}' in sandbox: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("'{command}' did not finish within {timeout_secs}s and was killed")]
    TimedOut { command: String, timeout_secs: u64 },
}

/// Pipeline stage, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    PreVerify,
    Attach,
    EnterSandbox,
    Provision,
    PostVerify,
    Detach,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::PreVerify => "pre-verify",
            Stage::Attach => "attach",
            Stage::EnterSandbox => "enter-sandbox",
            Stage::Provision => "provision",
            Stage::PostVerify => "post-verify",
            Stage::Detach => "detach",
        };
        f.write_str(name)
    }
}

/// Underlying cause of a stage failure, carried unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StageCause {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Detach(#[from] DetachError),

    #[error("step '{step}' exited with status {exit_code}")]
    StepFailed {
        step: String,
        exit_code: i32,
        output: String,
    },

    #[error("interrupted by signal {0}")]
    Interrupted(i32),
}

/// Pipeline failure: the stage that failed and why.
#[derive(Debug)]
pub struct PipelineError {
    pub stage: Stage,
    pub cause: StageCause,
    /// Set when the image was already mutated when the failure happened.
    pub image_may_be_inconsistent: bool,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.cause)?;
        if self.image_may_be_inconsistent {
            write!(f, " (image may be inconsistent)")?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    pub fn new(stage: Stage, cause: impl Into<StageCause>) -> Self {
        Self {
            stage,
            cause: cause.into(),
            image_may_be_inconsistent: false,
        }
    }

    pub fn inconsistent(mut self) -> Self {
        self.image_may_be_inconsistent = true;
        self
    }

    pub fn is_inconsistent(&self) -> bool {
        self.image_may_be_inconsistent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_errors_are_size_related() {
        let err = VerifyError::TooSmall {
            path: PathBuf::from("a.img"),
            size: 50,
            min: 100,
        };
        assert!(err.is_size_related());
        assert!(err.reason().contains("minimum"));
        assert!(!VerifyError::NoPartitionTable {
            path: PathBuf::from("a.img")
        }
        .is_size_related());
    }

    #[test]
    fn test_pipeline_error_display_carries_stage_and_cause() {
        let err = PipelineError::new(
            Stage::Provision,
            StageCause::StepFailed {
                step: "apt".into(),
                exit_code: 100,
                output: String::new(),
            },
        )
        .inconsistent();
        let text = err.to_string();
        assert!(text.starts_with("provision stage failed"));
        assert!(text.contains("status 100"));
        assert!(text.contains("may be inconsistent"));
    }

    #[test]
    fn test_stage_cause_from_verify_error() {
        let cause: StageCause = VerifyError::ExtendedUnavailable.into();
        assert!(matches!(cause, StageCause::Verify(_)));
    }
}
