//! Machine-readable summary of one pipeline run.

use super::PipelineState;
use crate::attach::{Attachment, MountRole};
use crate::config::{Config, ProvisionStep};
use crate::image::TableKind;
use crate::platform::Arch;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    /// Non-zero exit of a critical step; the run stopped here.
    Failed,
    /// Non-zero exit of a non-critical step.
    FailedNonCritical,
    /// Phase not enabled.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub phase: Option<String>,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Why the command could not be run to completion, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub(crate) fn new(step: &ProvisionStep, status: StepStatus, exit_code: Option<i32>) -> Self {
        Self {
            name: step.name.clone(),
            phase: step.phase.clone(),
            status,
            exit_code,
            error: None,
            duration_ms: 0,
        }
    }

    pub(crate) fn skipped(step: &ProvisionStep) -> Self {
        Self::new(step, StepStatus::Skipped, None)
    }

    pub(crate) fn took(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MountRecord {
    pub index: u32,
    pub role: MountRole,
    pub fstype: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub image: PathBuf,
    pub target_arch: Arch,
    pub state: PipelineState,
    pub started_at: String,
    pub duration_ms: u64,
    pub table: Option<TableKind>,
    pub attach_attempts: Option<u32>,
    pub mounts: Vec<MountRecord>,
    pub steps: Vec<StepRecord>,
    pub warnings: Vec<String>,
    pub fingerprint_before: Option<String>,
    pub fingerprint_after: Option<String>,
}

impl PipelineReport {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            image: config.image.clone(),
            target_arch: config.target_arch,
            state: PipelineState::Init,
            started_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            duration_ms: 0,
            table: None,
            attach_attempts: None,
            mounts: Vec::new(),
            steps: Vec::new(),
            warnings: Vec::new(),
            fingerprint_before: None,
            fingerprint_after: None,
        }
    }

    pub(crate) fn record_attachment(&mut self, attachment: &Attachment) {
        self.attach_attempts = Some(attachment.attempts());
        self.mounts = attachment
            .mounts()
            .iter()
            .map(|m| MountRecord {
                index: m.index,
                role: m.role,
                fstype: m.fstype.clone(),
            })
            .collect();
    }

    pub(crate) fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub(crate) fn finish(&mut self, state: PipelineState, elapsed: Duration) {
        self.state = state;
        self.duration_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
    }

    /// The image content changed between the two fingerprints.
    pub fn image_changed(&self) -> Option<bool> {
        match (&self.fingerprint_before, &self.fingerprint_after) {
            (Some(a), Some(b)) => Some(a != b),
            _ => None,
        }
    }

    pub fn steps_run(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status != StepStatus::Skipped)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
