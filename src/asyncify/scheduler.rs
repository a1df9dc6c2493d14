//! The per-instance Asyncify scheduler: the guest's five exported contract
//! functions, the stack buffer they share with the host, and the
//! suspend/resume primitives built on top of them (spec.md §4.I).

use std::sync::Mutex;

use crate::asyncify::op::PendingOp;
use crate::asyncify::state::{AsyncifyState, AtomicAsyncifyState};
use crate::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory};
use crate::error::{AbiError, AbiResult};
use crate::flat::FlatValue;

/// Cached handles to the guest's five asyncify exports, resolved once per
/// instance (spec.md §4.I: "`asyncify_get_state`, `asyncify_start_unwind`,
/// `asyncify_stop_unwind`, `asyncify_start_rewind`, `asyncify_stop_rewind`").
#[derive(Clone)]
pub struct AsyncifyExports<Function> {
    pub get_state: Function,
    pub start_unwind: Function,
    pub stop_unwind: Function,
    pub start_rewind: Function,
    pub stop_rewind: Function,
}

impl<Function: Clone> AsyncifyExports<Function> {
    pub fn resolve<Instance>(instance: &Instance) -> AbiResult<Self>
    where
        Instance: InstanceWithFunction<Function = Function>,
    {
        Ok(AsyncifyExports {
            get_state: instance.load_function("asyncify_get_state")?,
            start_unwind: instance.load_function("asyncify_start_unwind")?,
            stop_unwind: instance.load_function("asyncify_stop_unwind")?,
            start_rewind: instance.load_function("asyncify_start_rewind")?,
            stop_rewind: instance.load_function("asyncify_stop_rewind")?,
        })
    }
}

/// The value/error pair stashed between a `start_unwind` and the matching
/// `start_rewind`, handed back to the suspended handler through
/// [`Scheduler::resume`].
struct ResumeValue {
    value: u64,
    error: Option<AbiError>,
}

/// Drives one guest instance's asyncify state machine. Not reentrant —
/// "single-threaded per instance" (spec.md §5) — callers serialize access
/// the same way they must already serialize calls into the instance.
pub struct Scheduler<Instance: InstanceWithFunction> {
    exports: AsyncifyExports<Instance::Function>,
    data_addr: GuestPointer,
    stack_size: u32,
    state: AtomicAsyncifyState,
    pending: Mutex<Option<Box<dyn PendingOp>>>,
    resume_value: Mutex<Option<ResumeValue>>,
}

impl<Instance: InstanceWithFunction> Scheduler<Instance> {
    pub fn new(exports: AsyncifyExports<Instance::Function>, data_addr: u32, stack_size: u32) -> Self {
        Scheduler {
            exports,
            data_addr: GuestPointer(data_addr),
            stack_size,
            state: AtomicAsyncifyState::default(),
            pending: Mutex::new(None),
            resume_value: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AsyncifyState {
        self.state.load()
    }

    pub fn is_normal(&self) -> bool {
        self.state() == AsyncifyState::Normal
    }

    pub fn is_unwinding(&self) -> bool {
        self.state() == AsyncifyState::Unwinding
    }

    pub fn is_rewinding(&self) -> bool {
        self.state() == AsyncifyState::Rewinding
    }

    /// Rewrites the stack buffer's cursor/end fields so the next unwind
    /// starts from an empty stack (spec.md §4.I: "the stack cursor is reset
    /// to `data_addr + 8` before each top-level `execute`").
    pub fn reset_stack(&self, instance: &mut Instance) -> AbiResult<()>
    where
        Instance: InstanceWithMemory,
    {
        let stack_start = self.data_addr.advance(8);
        let stack_end = stack_start.advance(self.stack_size);
        instance.memory_mut().write(self.data_addr, &stack_start.0.to_le_bytes())?;
        instance
            .memory_mut()
            .write(self.data_addr.advance(4), &stack_end.0.to_le_bytes())
    }

    /// Re-reads the guest's own idea of the current state, for the rare
    /// caller that doesn't trust the atomic mirror (debugging, or recovery
    /// after a trap).
    pub fn refresh_state_from_guest(&self, instance: &mut Instance) -> AbiResult<AsyncifyState> {
        let results = instance.call(&self.exports.get_state, &[])?;
        let raw = results
            .first()
            .ok_or_else(|| AbiError::internal("asyncify_get_state returned no results"))?
            .as_u32();
        let state = match raw {
            0 => AsyncifyState::Normal,
            1 => AsyncifyState::Unwinding,
            2 => AsyncifyState::Rewinding,
            other => return Err(AbiError::internal(format!("guest reported unknown asyncify state {other}"))),
        };
        self.state.store(state);
        Ok(state)
    }

    /// Records `op` as the operation to run once the in-flight export call
    /// unwinds, and tells the guest to begin unwinding (spec.md §4.I step
    /// 1: "a handler calls `suspend(op)`; the scheduler records `op` ...
    /// and calls `start_unwind(data_addr)`").
    pub fn suspend(&self, instance: &mut Instance, op: Box<dyn PendingOp>) -> AbiResult<()> {
        if !self.is_normal() {
            return Err(AbiError::invalid("suspend called while the scheduler is not in the Normal state"));
        }
        *self.pending.lock().unwrap() = Some(op);
        instance
            .call(&self.exports.start_unwind, &[FlatValue::I32(self.data_addr.0)])?;
        self.state.store(AsyncifyState::Unwinding);
        Ok(())
    }

    /// Tells the guest to stop unwinding, transitioning `Unwinding` →
    /// `Normal` (spec.md §4.I step 2). A `stop_unwind` failure is
    /// classified `Internal`.
    pub fn stop_unwind(&self, instance: &mut Instance) -> AbiResult<()> {
        instance.call(&self.exports.stop_unwind, &[]).map_err(|err| {
            AbiError::internal(format!("asyncify_stop_unwind failed: {err}")).with_source(err)
        })?;
        self.state.store(AsyncifyState::Normal);
        Ok(())
    }

    /// Takes the operation recorded by the most recent [`Scheduler::suspend`],
    /// if any — `None` means the scheduler unwound with nothing pending,
    /// an internal inconsistency the [`crate::asyncify::step::StepDriver`]
    /// treats as [`crate::error::ErrorKind::Internal`].
    pub fn take_pending(&self) -> Option<Box<dyn PendingOp>> {
        self.pending.lock().unwrap().take()
    }

    /// Stores the result of the pending operation and tells the guest to
    /// begin rewinding (spec.md §4.I step 4: "the driver ... stores
    /// `(value, error)` ... and calls `start_rewind(data_addr)`").
    pub fn start_rewind(&self, instance: &mut Instance, value: u64, error: Option<AbiError>) -> AbiResult<()> {
        *self.resume_value.lock().unwrap() = Some(ResumeValue { value, error });
        instance
            .call(&self.exports.start_rewind, &[FlatValue::I32(self.data_addr.0)])?;
        self.state.store(AsyncifyState::Rewinding);
        Ok(())
    }

    /// The primitive a suspended handler calls once it is re-entered
    /// during rewind replay: reads the stored `(value, error)`, tells the
    /// guest to stop rewinding, clears the pending slot, and either
    /// returns the value or propagates the error (spec.md §4.I step 5).
    pub fn resume(&self, instance: &mut Instance) -> AbiResult<u64> {
        if !self.is_rewinding() {
            return Err(AbiError::invalid("resume called while the scheduler is not in the Rewinding state"));
        }
        let resumed = self
            .resume_value
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AbiError::internal("resume called with no stored value"))?;
        instance.call(&self.exports.stop_rewind, &[]).map_err(|err| {
            AbiError::internal(format!("asyncify_stop_rewind failed: {err}")).with_source(err)
        })?;
        self.state.store(AsyncifyState::Normal);
        match resumed.error {
            Some(error) => Err(error),
            None => Ok(resumed.value),
        }
    }
}
