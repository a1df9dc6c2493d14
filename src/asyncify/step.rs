//! `StepDriver`: drives one top-level export call through however many
//! suspend/resume round trips it needs (spec.md §4.I: "`execute`, `step`,
//! `run`").

use crate::asyncify::ctx::CallCtx;
use crate::asyncify::op::PendingOp;
use crate::asyncify::scheduler::Scheduler;
use crate::engine::{InstanceWithFunction, InstanceWithMemory};
use crate::error::{AbiError, AbiResult};
use crate::flat::FlatValue;

/// What happened on one [`StepDriver::step`] call.
pub enum StepResult {
    /// The guest suspended; here is the operation to run before the next
    /// `step`.
    Continue(Box<dyn PendingOp>),
    /// The scheduler is between calls with no pending operation and no
    /// result — only reachable through caller error (calling `step` after
    /// `Done`, or a handler that traps without suspending).
    Idle,
    /// The top-level export call returned; these are its flat results.
    Done(Vec<FlatValue>),
}

/// Drives a single top-level export call across zero or more suspensions.
/// Not reentrant: one `StepDriver` drives one in-flight call at a time
/// (spec.md §5 "the owning driver").
pub struct StepDriver<'scheduler, Instance: InstanceWithFunction> {
    scheduler: &'scheduler Scheduler<Instance>,
    function: Option<Instance::Function>,
    initial_args: Vec<FlatValue>,
    started: bool,
}

impl<'scheduler, Instance> StepDriver<'scheduler, Instance>
where
    Instance: InstanceWithFunction + InstanceWithMemory,
{
    pub fn new(scheduler: &'scheduler Scheduler<Instance>) -> Self {
        StepDriver {
            scheduler,
            function: None,
            initial_args: Vec::new(),
            started: false,
        }
    }

    /// Begins a new top-level call. Fails unless the scheduler is
    /// currently `Normal` (spec.md §4.I: "`execute` ... must be called
    /// while `is_normal`").
    pub fn execute(&mut self, instance: &mut Instance, function: &Instance::Function, args: &[FlatValue]) -> AbiResult<()> {
        if !self.scheduler.is_normal() {
            return Err(AbiError::invalid("execute called while the scheduler is not in the Normal state"));
        }
        self.scheduler.reset_stack(instance)?;
        self.function = Some(function.clone());
        self.initial_args = args.to_vec();
        self.started = true;
        Ok(())
    }

    /// Advances the call by one segment. `yield_result` is `None` for the
    /// first `step` after `execute`, and `Some` on every subsequent call,
    /// carrying the result of the [`PendingOp`] the previous `step`
    /// returned via [`StepResult::Continue`].
    pub fn step(
        &mut self,
        instance: &mut Instance,
        ctx: &CallCtx,
        yield_result: Option<Result<u64, AbiError>>,
    ) -> AbiResult<StepResult> {
        ctx.check()?;
        if !self.started {
            return Err(AbiError::invalid("step called before execute"));
        }
        let function = self
            .function
            .clone()
            .ok_or_else(|| AbiError::internal("step has no function recorded"))?;

        if let Some(result) = yield_result {
            let (value, error) = match result {
                Ok(value) => (value, None),
                Err(error) => (0, Some(error)),
            };
            self.scheduler.start_rewind(instance, value, error)?;
        }

        let results = instance.call(&function, &self.initial_args)?;
        self.after_call(instance, results)
    }

    fn after_call(&mut self, instance: &mut Instance, results: Vec<FlatValue>) -> AbiResult<StepResult> {
        if self.scheduler.is_unwinding() {
            let pending = self
                .scheduler
                .take_pending()
                .ok_or_else(|| AbiError::internal("scheduler is unwinding with no pending operation"))?;
            self.scheduler.stop_unwind(instance)?;
            Ok(StepResult::Continue(pending))
        } else {
            self.started = false;
            Ok(StepResult::Done(results))
        }
    }

    /// Convenience loop: `execute`s, then `step`s until the call is
    /// `Done`, running each suspended operation in between (spec.md §4.I:
    /// "`run(ctx, fn, args) -> results`").
    pub fn run(
        &mut self,
        instance: &mut Instance,
        ctx: &CallCtx,
        function: &Instance::Function,
        args: &[FlatValue],
    ) -> AbiResult<Vec<FlatValue>> {
        self.execute(instance, function, args)?;
        let mut yield_result = None;
        loop {
            match self.step(instance, ctx, yield_result.take())? {
                StepResult::Done(results) => return Ok(results),
                StepResult::Idle => {
                    return Err(AbiError::internal("scheduler went idle with no pending operation and no result"))
                }
                StepResult::Continue(mut op) => {
                    let (value, error) = op.execute(ctx);
                    yield_result = Some(match error {
                        Some(error) => Err(error),
                        None => Ok(value),
                    });
                }
            }
        }
    }
}
