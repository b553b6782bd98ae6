//! Image lifecycle orchestration.
//!
//! ```text
//! Init -> PreVerified -> Attached -> Sandboxed -> Provisioned -> PostVerified -> Detached -> Done
//!   \__________\____________\___________\____________\______________\______________\--> Error
//! ```
//!
//! Every resource acquired along the way is registered with one
//! [`CleanupRegistry`] per run, which is drained on every exit path.

pub mod report;

pub use report::{MountRecord, PipelineReport, StepRecord, StepStatus};

use crate::attach::{AttachStrategy, Attachment, AttachmentManager};
use crate::cleanup::CleanupRegistry;
use crate::config::{Config, ProvisionStep};
use crate::error::{AttachError, PipelineError, Stage, StageCause, VerifyError};
use crate::image::ImageHandle;
use crate::interrupt::InterruptFlag;
use crate::platform::Platform;
use crate::sandbox::chroot::ChrootBackend;
use crate::sandbox::{Sandbox, SandboxBackend, SandboxContext};
use crate::verify::{VerifyLevel, Verifier};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    PreVerified,
    Attached,
    Sandboxed,
    Provisioned,
    PostVerified,
    Detached,
    Done,
    Error,
}

/// Resources alive during one run.
struct Run<'a> {
    registry: &'a mut CleanupRegistry,
    report: &'a mut PipelineReport,
    image: Option<ImageHandle>,
    attachment: Option<Attachment>,
    sandbox: Option<SandboxContext>,
    /// At least one provisioning step started; the image may have changed.
    mutated: bool,
}

pub struct Pipeline {
    config: Config,
    attacher: AttachmentManager,
    sandbox: Sandbox,
    verifier: Verifier,
    interrupt: InterruptFlag,
    state: PipelineState,
}

impl Pipeline {
    /// Pipeline using the host's native attach strategy and chroot backend.
    pub fn new(config: Config, platform: &Platform) -> Result<Self, PipelineError> {
        let strategy = platform
            .attach_strategy()
            .map_err(|e| PipelineError::new(Stage::Init, e))?;
        platform
            .check_host_tools()
            .map_err(|e| PipelineError::new(Stage::Init, e))?;
        Ok(Self::with_components(
            config,
            platform,
            strategy,
            Arc::new(ChrootBackend::new()),
        ))
    }

    /// Pipeline with explicit host primitives.
    pub fn with_components(
        config: Config,
        platform: &Platform,
        strategy: Arc<dyn AttachStrategy>,
        backend: Arc<dyn SandboxBackend>,
    ) -> Self {
        let attacher = AttachmentManager::new(strategy, config.attach.clone());
        let sandbox = Sandbox::new(
            backend,
            platform,
            config.target_arch,
            config.sandbox.clone(),
        );
        let verifier = Verifier::new(config.verify.clone()).with_attacher(&attacher);
        Self {
            config,
            attacher,
            sandbox,
            verifier,
            interrupt: InterruptFlag::new(),
            state: PipelineState::Init,
        }
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every stage once. The cleanup registry is drained on every path.
    pub fn run(&mut self) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        self.state = PipelineState::Init;
        let mut registry = CleanupRegistry::new();
        let mut report = PipelineReport::new(&self.config);

        info!("=== Provisioning {} ===", self.config.image.display());

        let mut held_image = None;
        let result = {
            let mut run = Run {
                registry: &mut registry,
                report: &mut report,
                image: None,
                attachment: None,
                sandbox: None,
                mutated: false,
            };
            let result = self.execute(&mut run);
            if result.is_err() {
                // Abandoned contexts and attachments are torn down by the drain.
                if let Some(ctx) = run.sandbox.as_mut() {
                    for w in self.sandbox.leave(ctx, run.registry) {
                        run.report.warn(w);
                    }
                }
            }
            held_image = run.image.take();
            result
        };

        // The image lock outlives every mount and device the drain releases.
        let drained = registry.drain();
        for (label, err) in &drained.failures {
            report.warn(format!("cleanup '{}' failed: {}", label, err));
        }
        if let Some(mut handle) = held_image.take() {
            handle.close();
        }

        match result {
            Ok(()) => {
                self.state = PipelineState::Done;
                report.finish(PipelineState::Done, started.elapsed());
                info!(
                    steps = report.steps_run(),
                    warnings = report.warnings.len(),
                    duration_ms = report.duration_ms,
                    "=== Provisioning complete ==="
                );
                Ok(report)
            }
            Err(err) => {
                self.state = PipelineState::Error;
                error!(
                    stage = %err.stage,
                    inconsistent = err.is_inconsistent(),
                    "{}",
                    err
                );
                Err(err)
            }
        }
    }

    fn checkpoint(&self, stage: Stage, run: &Run<'_>) -> Result<(), PipelineError> {
        if let Some(signal) = self.interrupt.signal() {
            warn!(%stage, signal, "interrupted, unwinding");
            let err = PipelineError::new(stage, StageCause::Interrupted(signal));
            return Err(if run.mutated { err.inconsistent() } else { err });
        }
        Ok(())
    }

    fn advance(&mut self, state: PipelineState) {
        self.state = state;
        info!(?state, "stage complete");
    }

    fn execute(&mut self, run: &mut Run<'_>) -> Result<(), PipelineError> {
        self.pre_verify(run)?;
        self.attach(run)?;
        self.provision(run)?;
        self.post_verify(run)?;
        self.detach(run)?;
        Ok(())
    }

    fn pre_verify(&mut self, run: &mut Run<'_>) -> Result<(), PipelineError> {
        self.checkpoint(Stage::PreVerify, run)?;
        info!("=== Pre-verification ===");
        let image = &self.config.image;
        let verified = self
            .verifier
            .verify(image, VerifyLevel::Basic)
            .map_err(|e| PipelineError::new(Stage::PreVerify, e))?;
        run.report.table = Some(verified.kind);
        for w in verified.warnings {
            run.report.warn(w);
        }
        self.advance(PipelineState::PreVerified);
        Ok(())
    }

    fn attach(&mut self, run: &mut Run<'_>) -> Result<(), PipelineError> {
        self.checkpoint(Stage::Attach, run)?;
        info!("=== Attach ===");
        let image = &self.config.image;
        let handle = ImageHandle::open_locked(image)
            .map_err(|e| {
                PipelineError::new(
                    Stage::Attach,
                    AttachError::Image {
                        image: image.clone(),
                        reason: format!("{:#}", e),
                    },
                )
            })?
            .ok_or_else(|| PipelineError::new(Stage::Attach, AttachError::Locked(image.clone())))?;

        if self.config.fingerprint {
            run.report.fingerprint_before = Some(fingerprint(&handle, Stage::Attach)?);
        }

        let attachment = self
            .attacher
            .attach(&handle, run.registry)
            .map_err(|e| PipelineError::new(Stage::Attach, e))?;
        run.report.record_attachment(&attachment);
        run.image = Some(handle);
        run.attachment = Some(attachment);
        self.advance(PipelineState::Attached);
        Ok(())
    }

    fn provision(&mut self, run: &mut Run<'_>) -> Result<(), PipelineError> {
        let active: Vec<ProvisionStep> = self.config.active_steps().cloned().collect();
        let skipped: Vec<ProvisionStep> = self.config.skipped_steps().cloned().collect();
        for step in &skipped {
            info!(step = %step.name, phase = ?step.phase, "phase not enabled, skipping step");
        }

        if active.is_empty() {
            info!("no provisioning steps enabled, not entering sandbox");
            run.report
                .steps
                .extend(skipped.iter().map(StepRecord::skipped));
            self.advance(PipelineState::Provisioned);
            return Ok(());
        }

        self.checkpoint(Stage::EnterSandbox, run)?;
        info!("=== Enter sandbox ===");
        let root = run
            .attachment
            .as_ref()
            .map(|a| a.root())
            .ok_or_else(|| {
                PipelineError::new(
                    Stage::EnterSandbox,
                    crate::error::SandboxError::NotBound(self.config.image.clone()),
                )
            })?;
        let ctx = self
            .sandbox
            .enter_root(root, run.registry)
            .map_err(|e| PipelineError::new(Stage::EnterSandbox, e))?;
        run.sandbox = Some(ctx);
        self.advance(PipelineState::Sandboxed);

        info!("=== Provision ({} steps) ===", active.len());
        let mut records = Vec::new();
        let outcome = self.run_steps(&active, run, &mut records);
        records.extend(skipped.iter().map(StepRecord::skipped));
        run.report.steps.extend(records);
        outcome?;

        if let Some(mut ctx) = run.sandbox.take() {
            for w in self.sandbox.leave(&mut ctx, run.registry) {
                run.report.warn(w);
            }
        }
        self.advance(PipelineState::Provisioned);
        Ok(())
    }

    fn run_steps(
        &self,
        steps: &[ProvisionStep],
        run: &mut Run<'_>,
        records: &mut Vec<StepRecord>,
    ) -> Result<(), PipelineError> {
        for step in steps {
            self.checkpoint(Stage::Provision, run)?;
            let ctx = run.sandbox.as_mut().ok_or_else(|| {
                PipelineError::new(
                    Stage::Provision,
                    crate::error::SandboxError::NotBound(self.config.image.clone()),
                )
            })?;

            info!(step = %step.name, "Running step");
            let started = Instant::now();
            run.mutated = true;
            let out = match self.sandbox.exec(ctx, &step.command) {
                Ok(out) => out,
                Err(e) => {
                    let record = StepRecord::new(step, StepStatus::Failed, None)
                        .took(started.elapsed())
                        .with_error(e.to_string());
                    if step.critical {
                        records.push(record);
                        return Err(PipelineError::new(Stage::Provision, e).inconsistent());
                    }
                    let msg = format!("non-critical step '{}' did not complete: {}", step.name, e);
                    warn!("{}", msg);
                    run.report.warn(msg);
                    records.push(StepRecord {
                        status: StepStatus::FailedNonCritical,
                        ..record
                    });
                    continue;
                }
            };
            let elapsed = started.elapsed();

            if out.success() {
                records.push(
                    StepRecord::new(step, StepStatus::Succeeded, Some(out.exit_code)).took(elapsed),
                );
                continue;
            }

            if step.critical {
                records.push(
                    StepRecord::new(step, StepStatus::Failed, Some(out.exit_code)).took(elapsed),
                );
                return Err(PipelineError::new(
                    Stage::Provision,
                    StageCause::StepFailed {
                        step: step.name.clone(),
                        exit_code: out.exit_code,
                        output: out.output,
                    },
                )
                .inconsistent());
            }

            let msg = format!(
                "non-critical step '{}' exited with status {}",
                step.name, out.exit_code
            );
            warn!("{}", msg);
            run.report.warn(msg);
            records.push(
                StepRecord::new(step, StepStatus::FailedNonCritical, Some(out.exit_code))
                    .took(elapsed),
            );
        }
        Ok(())
    }

    fn post_verify(&mut self, run: &mut Run<'_>) -> Result<(), PipelineError> {
        self.checkpoint(Stage::PostVerify, run)?;
        info!("=== Post-verification ===");
        let mutated = run.mutated;
        let post_err = move |e: VerifyError| {
            let err = PipelineError::new(Stage::PostVerify, e);
            if mutated {
                err.inconsistent()
            } else {
                err
            }
        };

        let structure = self
            .verifier
            .verify_structure(&self.config.image)
            .map_err(post_err)?;
        if run.report.table.is_some_and(|t| t != structure.kind) {
            run.report.warn(format!(
                "partition table kind changed during provisioning (now {:?})",
                structure.kind
            ));
        }
        if let Some(attachment) = run.attachment.as_ref() {
            for w in self.verifier.check_paths(attachment).map_err(post_err)? {
                run.report.warn(w);
            }
        }
        self.advance(PipelineState::PostVerified);
        Ok(())
    }

    fn detach(&mut self, run: &mut Run<'_>) -> Result<(), PipelineError> {
        self.checkpoint(Stage::Detach, run)?;
        info!("=== Detach ===");
        if let Some(attachment) = run.attachment.take() {
            if let Err(e) = self.attacher.detach(attachment, run.registry) {
                let drained = run.registry.drain();
                for (label, err) in &drained.failures {
                    run.report.warn(format!("cleanup '{}' failed: {}", label, err));
                }
                if self.attacher.strategy().is_attached(&e.device) {
                    let err = PipelineError::new(Stage::Detach, e);
                    return Err(if run.mutated { err.inconsistent() } else { err });
                }
                let msg = format!("{}; device released by cleanup", e);
                warn!("{}", msg);
                run.report.warn(msg);
            }
        }

        if let Some(mut handle) = run.image.take() {
            if self.config.fingerprint {
                run.report.fingerprint_after = Some(fingerprint(&handle, Stage::Detach)?);
            }
            handle.close();
        }
        self.advance(PipelineState::Detached);
        Ok(())
    }
}

fn fingerprint(handle: &ImageHandle, stage: Stage) -> Result<String, PipelineError> {
    handle.fingerprint().map_err(|e| {
        PipelineError::new(
            stage,
            VerifyError::Unreadable {
                path: handle.path().to_path_buf(),
                reason: format!("{:#}", e),
            },
        )
    })
}

/// Detect the host, build a pipeline for it and run it, honoring process signals.
pub fn run_pipeline(config: Config) -> Result<PipelineReport, PipelineError> {
    let platform = Platform::detect();
    Pipeline::new(config, &platform)?
        .with_interrupt(InterruptFlag::process())
        .run()
}
