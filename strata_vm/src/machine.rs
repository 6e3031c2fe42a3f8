//! Machine entry points.

use crate::coroutine;
use crate::dispatch::EXIT_DONE;
use crate::frame::{Frame, MAX_RECURSION_DEPTH};
use crate::hooks::{NopHooks, RuntimeHooks};
use std::cell::Cell;
use std::sync::Arc;
use strata_compiler::{RootProgram, Tier};
use strata_core::{CoroutineState, Value, VmError, VmResult};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Guest recursion guard; one per `execute`/`resume` activation.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<DepthGuard, VmError> {
        DEPTH.with(|d| {
            if d.get() >= MAX_RECURSION_DEPTH {
                Err(VmError::StackOverflow)
            } else {
                d.set(d.get() + 1);
                Ok(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Executes root programs. Machines are cheap; the interesting state
/// (tier, cached data, quickened bytecode) lives in the roots
/// themselves and is shared by every machine executing them.
pub struct Machine {
    pub(crate) hooks: Arc<dyn RuntimeHooks>,
}

impl Machine {
    pub fn new() -> Self {
        Machine {
            hooks: Arc::new(NopHooks),
        }
    }

    pub fn with_hooks(hooks: Arc<dyn RuntimeHooks>) -> Self {
        Machine { hooks }
    }

    pub fn hooks(&self) -> &Arc<dyn RuntimeHooks> {
        &self.hooks
    }

    /// Execute `root` with `args`, driving tier transitions until the
    /// activation finishes or an uncaught exception propagates.
    pub fn execute(&self, root: &Arc<RootProgram>, args: &[Value]) -> VmResult<Value> {
        let mut frame = Frame::new(root, args);
        self.run(root, &mut frame, 0)
    }

    /// Resume a suspended coroutine with `sent` as the yield's value.
    pub fn resume(
        &self,
        root: &Arc<RootProgram>,
        coroutine: &Arc<CoroutineState>,
        sent: Value,
    ) -> VmResult<Value> {
        let saved = coroutine
            .take_frame()
            .ok_or_else(|| VmError::Guest(Value::str("coroutine already resumed")))?;
        let mut frame = coroutine::resume_frame(saved, sent);
        self.run(root, &mut frame, coroutine.location.bci)
    }

    /// Re-enter `frame` at an arbitrary bci (on-stack-replacement entry
    /// and the resume path).
    pub fn continue_at(
        &self,
        root: &Arc<RootProgram>,
        frame: &mut Frame,
        bci: u16,
    ) -> VmResult<Value> {
        self.run(root, frame, bci)
    }

    fn run(&self, root: &Arc<RootProgram>, frame: &mut Frame, start: u16) -> VmResult<Value> {
        let _depth = match DepthGuard::enter() {
            Ok(guard) => guard,
            Err(e) => return Err(self.hooks.intercept_internal_exception(e, start)),
        };
        // Invocation counting for the uncached tier.
        if root.tier() == Tier::Uncached && root.decrement_uncached_budget() {
            root.set_tier(Tier::Cached);
        }
        let mut bci = start;
        loop {
            let tier = root.tier();
            let exit = self.dispatch_loop(root, frame, bci, tier)?;
            if (exit & 0xFFFF) as u16 == EXIT_DONE {
                return Ok(std::mem::take(&mut frame.result));
            }
            // Tier changed mid-activation; re-enter where the loop left
            // off.
            bci = frame.bci;
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}
