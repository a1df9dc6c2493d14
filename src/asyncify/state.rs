//! The three-state Asyncify state machine (spec.md §4.I): `Normal` is the
//! steady state; `start_unwind`/`stop_unwind` bracket a suspended call;
//! `start_rewind`/`stop_rewind` bracket replaying the stack back to the
//! suspension point.

use std::sync::atomic::{AtomicU8, Ordering};

/// Mirrors the guest's own asyncify state. The guest export is the
/// canonical source of truth; this atomic exists so a cheap pre-call check
/// (e.g. "is it even worth calling `suspend` again?") doesn't need a guest
/// round trip (spec.md §5 "per-instance state accessed only from the
/// owning driver thread, but mirrored atomically for the is_normal check").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AsyncifyState {
    Normal,
    Unwinding,
    Rewinding,
}

impl AsyncifyState {
    fn to_u8(self) -> u8 {
        match self {
            AsyncifyState::Normal => 0,
            AsyncifyState::Unwinding => 1,
            AsyncifyState::Rewinding => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => AsyncifyState::Unwinding,
            2 => AsyncifyState::Rewinding,
            _ => AsyncifyState::Normal,
        }
    }
}

/// An [`AsyncifyState`] behind an atomic, cheaply readable from any thread
/// holding a reference to the scheduler.
#[derive(Debug)]
pub struct AtomicAsyncifyState(AtomicU8);

impl AtomicAsyncifyState {
    pub fn new(initial: AsyncifyState) -> Self {
        AtomicAsyncifyState(AtomicU8::new(initial.to_u8()))
    }

    pub fn load(&self) -> AsyncifyState {
        AsyncifyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: AsyncifyState) {
        self.0.store(state.to_u8(), Ordering::SeqCst);
    }
}

impl Default for AtomicAsyncifyState {
    fn default() -> Self {
        AtomicAsyncifyState::new(AsyncifyState::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for state in [AsyncifyState::Normal, AsyncifyState::Unwinding, AsyncifyState::Rewinding] {
            let atomic = AtomicAsyncifyState::new(state);
            assert_eq!(atomic.load(), state);
        }
    }

    #[test]
    fn default_state_is_normal() {
        assert_eq!(AtomicAsyncifyState::default().load(), AsyncifyState::Normal);
    }
}
