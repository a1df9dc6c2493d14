//! The asyncify suspend/resume round trip (spec.md §8's sixth scenario),
//! driven through [`StepDriver`]/[`Scheduler`] against a dedicated guest
//! fixture.
//!
//! [`witty_abi::testutil::FakeInstance`]'s host imports only ever see a
//! [`witty_abi::engine::RawGuestMemory`] view, deliberately narrower than a
//! real engine's `Caller<'_, T>` — it has no way to call back into the
//! scheduler that owns the very call it's running under. A real engine
//! binding supports that reentrancy (wasmtime's `Store` does); this fixture
//! reproduces it directly so the suspend/resume contract can be exercised
//! without one.

use std::cell::RefCell;
use std::rc::Rc;

use witty_abi::asyncify::{AsyncifyExports, CallCtx, ClosureOp, Scheduler, StepDriver};
use witty_abi::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory, RuntimeMemory};
use witty_abi::error::{AbiError, AbiResult};
use witty_abi::flat::FlatValue;

#[derive(Clone, Debug, PartialEq, Eq)]
enum GuestFn {
    Process,
    GetState,
    StartUnwind,
    StopUnwind,
    StartRewind,
    StopRewind,
}

struct ScenarioMemory {
    bytes: Vec<u8>,
}

impl RuntimeMemory for ScenarioMemory {
    fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
        let start = location.0 as usize;
        let end = start + length as usize;
        self.bytes
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| AbiError::internal("out of bounds read"))
    }

    fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()> {
        let start = location.0 as usize;
        let end = start + bytes.len();
        self.bytes
            .get_mut(start..end)
            .ok_or_else(|| AbiError::internal("out of bounds write"))?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }
}

/// A guest instance whose single export suspends on its first call and
/// resumes with the suspended value on replay — standing in for a real
/// asyncify-instrumented module's own compiled stack save/restore. The
/// scheduler handle is installed after construction since it is generic
/// over this very type.
struct SuspendingInstance {
    memory: ScenarioMemory,
    scheduler: Rc<RefCell<Option<Scheduler<SuspendingInstance>>>>,
    unwound_once: bool,
    stop_unwind_calls: Rc<RefCell<u32>>,
}

impl InstanceWithMemory for SuspendingInstance {
    type Memory = ScenarioMemory;

    fn memory(&self) -> &Self::Memory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut Self::Memory {
        &mut self.memory
    }
}

impl InstanceWithFunction for SuspendingInstance {
    type Function = GuestFn;

    fn load_function(&self, name: &str) -> AbiResult<Self::Function> {
        Ok(match name {
            "process" => GuestFn::Process,
            "asyncify_get_state" => GuestFn::GetState,
            "asyncify_start_unwind" => GuestFn::StartUnwind,
            "asyncify_stop_unwind" => GuestFn::StopUnwind,
            "asyncify_start_rewind" => GuestFn::StartRewind,
            "asyncify_stop_rewind" => GuestFn::StopRewind,
            other => return Err(AbiError::invalid(format!("no such export: {other}"))),
        })
    }

    fn call(&mut self, function: &Self::Function, _args: &[FlatValue]) -> AbiResult<Vec<FlatValue>> {
        match function {
            GuestFn::Process => {
                if self.unwound_once {
                    self.unwound_once = false;
                    let scheduler_handle = self.scheduler.clone();
                    let borrowed = scheduler_handle.borrow();
                    let scheduler = borrowed.as_ref().expect("scheduler installed before first call");
                    let value = scheduler.resume(self)?;
                    Ok(vec![FlatValue::I64(value)])
                } else {
                    self.unwound_once = true;
                    let scheduler_handle = self.scheduler.clone();
                    let borrowed = scheduler_handle.borrow();
                    let scheduler = borrowed.as_ref().expect("scheduler installed before first call");
                    scheduler.suspend(self, Box::new(ClosureOp(|_ctx| (42, None))))?;
                    Ok(vec![])
                }
            }
            GuestFn::GetState => Ok(vec![FlatValue::I32(0)]),
            GuestFn::StopUnwind => {
                *self.stop_unwind_calls.borrow_mut() += 1;
                Ok(vec![])
            }
            GuestFn::StartUnwind | GuestFn::StartRewind | GuestFn::StopRewind => Ok(vec![]),
        }
    }
}

#[test]
fn suspend_then_resume_round_trips_the_pending_ops_value() {
    let scheduler_slot: Rc<RefCell<Option<Scheduler<SuspendingInstance>>>> = Rc::new(RefCell::new(None));
    let stop_unwind_calls = Rc::new(RefCell::new(0u32));
    let mut instance = SuspendingInstance {
        memory: ScenarioMemory { bytes: vec![0u8; 2048] },
        scheduler: scheduler_slot.clone(),
        unwound_once: false,
        stop_unwind_calls: stop_unwind_calls.clone(),
    };
    let exports = AsyncifyExports::resolve(&instance).unwrap();
    *scheduler_slot.borrow_mut() = Some(Scheduler::new(exports, 16, 1024));

    let scheduler_handle = scheduler_slot.clone();
    let borrowed = scheduler_handle.borrow();
    let scheduler = borrowed.as_ref().unwrap();

    let mut driver = StepDriver::new(scheduler);
    let ctx = CallCtx::new();
    let results = driver.run(&mut instance, &ctx, &GuestFn::Process, &[]).unwrap();

    assert_eq!(results, vec![FlatValue::I64(42)]);
    assert!(scheduler.is_normal());
    assert!(scheduler.take_pending().is_none());
    assert_eq!(*stop_unwind_calls.borrow(), 1, "asyncify_stop_unwind must run exactly once per suspend");
}
