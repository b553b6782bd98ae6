//! Async-signal-safe interrupt flag.
//!
//! The signal handler only stores the signal number in an atomic. The
//! pipeline polls the flag between stages and unwinds through its cleanup
//! registry; nothing is torn down from signal context.

use anyhow::{Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::info;

/// Last termination signal received by the process (0 if none).
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
}

/// Route SIGINT, SIGTERM and SIGHUP to the process-wide flag.
///
/// Call once from `main` before starting a pipeline.
pub fn install_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only performs an atomic store, which is
        // async-signal-safe.
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("installing handler for {}", sig))?;
    }
    info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Interrupt source checked between pipeline stages.
///
/// Each flag has its own trigger; flags created with
/// [`InterruptFlag::process`] also observe process signals.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
    local: Arc<AtomicI32>,
    watch_signals: bool,
}

impl InterruptFlag {
    /// Flag that only trips through [`raise`](Self::raise).
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag that also trips on SIGINT, SIGTERM or SIGHUP.
    pub fn process() -> Self {
        Self {
            local: Arc::default(),
            watch_signals: true,
        }
    }

    /// Trip the flag as if `signal` had been delivered.
    pub fn raise(&self, signal: i32) {
        self.local.store(signal, Ordering::SeqCst);
    }

    /// Signal number if the flag has tripped.
    pub fn signal(&self) -> Option<i32> {
        let local = self.local.load(Ordering::SeqCst);
        if local != 0 {
            return Some(local);
        }
        if self.watch_signals {
            let global = SIGNAL_RECEIVED.load(Ordering::SeqCst);
            if global != 0 {
                return Some(global);
            }
        }
        None
    }

    pub fn is_raised(&self) -> bool {
        self.signal().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_flag_is_independent() {
        let a = InterruptFlag::new();
        let b = InterruptFlag::new();
        a.raise(libc::SIGTERM);
        assert_eq!(a.signal(), Some(libc::SIGTERM));
        assert!(!b.is_raised());
    }

    #[test]
    fn test_delivered_signal_trips_process_flag() {
        install_handlers().unwrap();
        assert!(!InterruptFlag::new().is_raised());
        signal::raise(Signal::SIGHUP).unwrap();
        assert_eq!(InterruptFlag::process().signal(), Some(libc::SIGHUP));
        assert!(!InterruptFlag::new().is_raised());
    }

    #[test]
    fn test_clones_share_state() {
        let a = InterruptFlag::new();
        let b = a.clone();
        b.raise(libc::SIGINT);
        assert!(a.is_raised());
    }
}
