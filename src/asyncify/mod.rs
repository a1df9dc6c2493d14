//! Asyncify: the cooperative scheduler that lets a host operation suspend
//! a guest export call mid-flight and resume it later without a native
//! thread per call (spec.md §4.I).

mod ctx;
mod op;
mod scheduler;
mod state;
mod step;

pub use ctx::CallCtx;
pub use op::{ClosureOp, PendingOp};
pub use scheduler::{AsyncifyExports, Scheduler};
pub use state::AsyncifyState;
pub use step::{StepDriver, StepResult};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory, RuntimeMemory};
    use crate::error::{AbiError, AbiResult};
    use crate::flat::FlatValue;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A minimal fake instance with just enough behavior to exercise the
    /// suspend → stop_unwind → start_rewind → resume round trip: its five
    /// asyncify exports are no-ops except for bookkeeping, and its `log`
    /// import stand-in is simulated by directly driving the scheduler
    /// (real guest replay is out of scope for this unit test; the
    /// end-to-end version lives in `tests/` against `testutil::FakeInstance`).
    #[derive(Clone, Debug, PartialEq, Eq)]
    enum FakeFn {
        GetState,
        StartUnwind,
        StopUnwind,
        StartRewind,
        StopRewind,
        Export,
    }

    struct FakeMemory {
        bytes: Vec<u8>,
    }

    impl RuntimeMemory for FakeMemory {
        fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
            let start = location.0 as usize;
            Ok(self.bytes[start..start + length as usize].to_vec())
        }

        fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()> {
            let start = location.0 as usize;
            self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }

        fn size(&self) -> u32 {
            self.bytes.len() as u32
        }
    }

    struct FakeInstance {
        memory: FakeMemory,
        call_log: Rc<RefCell<Vec<FakeFn>>>,
    }

    impl InstanceWithMemory for FakeInstance {
        type Memory = FakeMemory;
        fn memory(&self) -> &Self::Memory {
            &self.memory
        }
        fn memory_mut(&mut self) -> &mut Self::Memory {
            &mut self.memory
        }
    }

    impl InstanceWithFunction for FakeInstance {
        type Function = FakeFn;

        fn load_function(&self, name: &str) -> AbiResult<Self::Function> {
            Ok(match name {
                "asyncify_get_state" => FakeFn::GetState,
                "asyncify_start_unwind" => FakeFn::StartUnwind,
                "asyncify_stop_unwind" => FakeFn::StopUnwind,
                "asyncify_start_rewind" => FakeFn::StartRewind,
                "asyncify_stop_rewind" => FakeFn::StopRewind,
                other => return Err(AbiError::invalid(format!("no such export: {other}"))),
            })
        }

        fn call(&mut self, function: &Self::Function, _args: &[FlatValue]) -> AbiResult<Vec<FlatValue>> {
            self.call_log.borrow_mut().push(function.clone());
            match function {
                FakeFn::Export => Ok(vec![FlatValue::I32(42)]),
                FakeFn::GetState => Ok(vec![FlatValue::I32(0)]),
                _ => Ok(vec![]),
            }
        }
    }

    fn new_scheduler(instance: &FakeInstance) -> Scheduler<FakeInstance> {
        let exports = AsyncifyExports::resolve(instance).unwrap();
        Scheduler::new(exports, 16, 1024)
    }

    #[test]
    fn reset_stack_writes_cursor_and_end() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        scheduler.reset_stack(&mut instance).unwrap();
        let cursor = u32::from_le_bytes(instance.memory.bytes[16..20].try_into().unwrap());
        let end = u32::from_le_bytes(instance.memory.bytes[20..24].try_into().unwrap());
        assert_eq!(cursor, 16 + 8);
        assert_eq!(end, 16 + 8 + 1024);
    }

    #[test]
    fn suspend_records_pending_and_flips_to_unwinding() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        assert!(scheduler.is_normal());
        scheduler
            .suspend(&mut instance, Box::new(ClosureOp(|_ctx| (7, None))))
            .unwrap();
        assert!(scheduler.is_unwinding());
        assert!(scheduler.take_pending().is_some());
    }

    #[test]
    fn suspend_outside_normal_state_is_rejected() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        scheduler
            .suspend(&mut instance, Box::new(ClosureOp(|_ctx| (1, None))))
            .unwrap();
        let err = scheduler
            .suspend(&mut instance, Box::new(ClosureOp(|_ctx| (1, None))))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn resume_outside_rewinding_is_rejected() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        let err = scheduler.resume(&mut instance).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn step_before_execute_is_invalid() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        let mut driver = StepDriver::new(&scheduler);
        let err = driver.step(&mut instance, &CallCtx::new(), None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn run_completes_immediately_when_the_guest_never_suspends() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        let mut driver = StepDriver::new(&scheduler);
        let results = driver
            .run(&mut instance, &CallCtx::new(), &FakeFn::Export, &[])
            .unwrap();
        assert_eq!(results, vec![FlatValue::I32(42)]);
        assert!(scheduler.is_normal());
    }

    #[test]
    fn run_fails_fast_on_a_cancelled_context() {
        let mut instance = FakeInstance {
            memory: FakeMemory { bytes: vec![0u8; 2048] },
            call_log: Rc::new(RefCell::new(Vec::new())),
        };
        let scheduler = new_scheduler(&instance);
        let mut driver = StepDriver::new(&scheduler);
        let ctx = CallCtx::new();
        ctx.cancel();
        let err = driver.run(&mut instance, &ctx, &FakeFn::Export, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Canceled);
    }
}
