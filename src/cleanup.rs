//! Run-scoped LIFO stack of teardown actions.
//!
//! Every resource the pipeline acquires (mount directory, block device,
//! partition mount, bind mount, DNS override, emulator binary) pushes its
//! teardown here immediately after it is acquired. The owner disarms the
//! entry when it releases the resource itself; whatever is still armed runs
//! in reverse acquisition order on [`CleanupRegistry::drain`] or on drop.
//!
//! A registry belongs to exactly one pipeline run. Actions are `Send` so
//! independent runs can live on separate threads.

use anyhow::Result;
use tracing::{debug, info, warn};

/// Teardown action for one acquired resource.
pub type TeardownFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Handle to a registered teardown action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupToken(u64);

struct Entry {
    id: u64,
    label: String,
    action: TeardownFn,
}

/// Outcome of draining the registry.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Labels of actions that ran, in execution order.
    pub ran: Vec<String>,
    /// `(label, error)` for actions that failed.
    pub failures: Vec<(String, String)>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// LIFO teardown stack scoped to one pipeline run.
#[derive(Default)]
pub struct CleanupRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown action for a resource that was just acquired.
    pub fn push<F>(&mut self, label: impl Into<String>, action: F) -> CleanupToken
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let label = label.into();
        debug!(%label, "cleanup registered");
        self.entries.push(Entry {
            id,
            label,
            action: Box::new(action),
        });
        CleanupToken(id)
    }

    /// Forget an action because its resource was released normally.
    ///
    /// Returns `false` if the token was already disarmed or run.
    pub fn disarm(&mut self, token: CleanupToken) -> bool {
        match self.position(token) {
            Some(pos) => {
                let entry = self.entries.remove(pos);
                debug!(label = %entry.label, "cleanup disarmed");
                true
            }
            None => false,
        }
    }

    /// Run one action now and remove it, regardless of its stack position.
    ///
    /// Returns `None` if the token is no longer registered.
    pub fn release(&mut self, token: CleanupToken) -> Option<Result<()>> {
        let pos = self.position(token)?;
        let entry = self.entries.remove(pos);
        debug!(label = %entry.label, "cleanup released early");
        Some((entry.action)())
    }

    pub fn is_armed(&self, token: CleanupToken) -> bool {
        self.position(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels of armed actions, oldest first.
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }

    /// Run every armed action newest-first. A failing action does not stop
    /// the ones below it.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        if self.entries.is_empty() {
            return report;
        }

        info!("Draining {} cleanup action(s)", self.entries.len());
        while let Some(entry) = self.entries.pop() {
            match (entry.action)() {
                Ok(()) => debug!(label = %entry.label, "cleanup ok"),
                Err(e) => {
                    warn!(label = %entry.label, "cleanup failed: {:#}", e);
                    report.failures.push((entry.label.clone(), format!("{:#}", e)));
                }
            }
            report.ran.push(entry.label);
        }
        report
    }

    fn position(&self, token: CleanupToken) -> Option<usize> {
        self.entries.iter().position(|e| e.id == token.0)
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                "cleanup registry dropped with {} armed action(s); draining",
                self.entries.len()
            );
            self.drain();
        }
    }
}
