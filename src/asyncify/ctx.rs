//! `CallCtx`: the per-call cancellation/deadline handle threaded through a
//! dispatch and into host handlers (spec.md §9 "Context-carried scheduler
//! and asyncify handles" — "pass them explicitly to host handlers as a
//! first argument (`CallCtx`), removing the ambient-state dependency").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{AbiError, AbiResult};

/// Cancellation and deadline propagation for one export call. Cloning
/// shares the same cancellation flag, so a `CallCtx` handed to a
/// suspended handler's `op.execute` observes a cancellation raised from
/// outside the scheduler loop (spec.md §5 "Cancellation & timeouts").
#[derive(Clone)]
pub struct CallCtx {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CallCtx {
    pub fn new() -> Self {
        CallCtx {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        CallCtx {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Raises cancellation, observable by every clone of this context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails with [`AbiError::canceled`]/[`AbiError::timeout`] if this
    /// context has been cancelled or its deadline has passed, checked at
    /// every `step` entry (spec.md §4.I "Cancellation").
    pub fn check(&self) -> AbiResult<()> {
        if self.is_cancelled() {
            return Err(AbiError::canceled());
        }
        if self.is_expired() {
            return Err(AbiError::timeout());
        }
        Ok(())
    }
}

impl Default for CallCtx {
    fn default() -> Self {
        CallCtx::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_context_passes_check() {
        assert!(CallCtx::new().check().is_ok());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let ctx = CallCtx::new();
        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.check().is_err());
    }

    #[test]
    fn past_deadline_times_out() {
        let ctx = CallCtx::with_deadline(Instant::now() - Duration::from_secs(1));
        assert_eq!(ctx.check().unwrap_err().kind(), crate::error::ErrorKind::Timeout);
    }
}
