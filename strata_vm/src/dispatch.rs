//! Tiered dispatch loop.
//!
//! One loop services all three tiers; the tier only changes which slow
//! paths are armed (uncached budget accounting, quickening, probes).
//! Dispatch is a single match on the decoded instruction kind, per the
//! tagged-variant design: custom instructions funnel into one handler
//! that consults the instruction table for their execute functions.
//!
//! The loop's return value packs `sp << 16 | low`: `low == 0xFFFF`
//! means the activation finished (result in `frame.result`), any other
//! value is the tier to re-enter with (resume bci in `frame.bci`).

use crate::coroutine;
use crate::exception;
use crate::frame::Frame;
use crate::hooks::ProbeEvent;
use crate::machine::Machine;
use crate::quicken;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use strata_compiler::{CachedData, CachedNode, RootProgram, Tier};
use strata_core::instruction::opcodes;
use strata_core::{
    InstructionDescr, InstructionKind, InstructionTable, LocalArgs, OpError, Value, VmError,
    VmResult, BCI_SLOT,
};

/// Backward branches per loop report.
pub const REPORT_LOOP_STRIDE: u32 = 256;

/// Low half-word of the exit encoding meaning "activation finished".
pub const EXIT_DONE: u16 = 0xFFFF;

#[inline]
pub fn encode_exit(sp: usize, low: u16) -> u32 {
    ((sp as u32) << 16) | low as u32
}

/// Outcome of one instruction.
enum Step {
    Next(u16),
    Jump(u16),
    Exit(u32),
}

/// An exception in flight inside the loop.
enum Thrown {
    Guest(Value),
    Internal(VmError),
}

impl From<VmError> for Thrown {
    fn from(e: VmError) -> Thrown {
        match e {
            VmError::Guest(v) => Thrown::Guest(v),
            other => Thrown::Internal(other),
        }
    }
}

impl Machine {
    /// Run `frame` from `start_bci` until it finishes, suspends, or
    /// requests a tier change.
    pub(crate) fn dispatch_loop(
        &self,
        root: &Arc<RootProgram>,
        frame: &mut Frame,
        start_bci: u16,
        tier: Tier,
    ) -> VmResult<u32> {
        let model = root.model().clone();
        let table = &model.instructions;
        let cached = if tier != Tier::Uncached {
            Some(root.cached_data())
        } else {
            None
        };

        let mut bci = start_bci;
        let mut pending: u32 = 0;
        loop {
            let opcode = root.word_at(bci);
            let Some(descr) = table.lookup(opcode) else {
                let thrown = Thrown::Internal(VmError::internal(format!(
                    "undefined opcode {} at bci {}",
                    opcode, bci
                )));
                match self.handle_throw(root, frame, bci, thrown, &mut pending) {
                    Ok(handler) => {
                        bci = handler;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };
            match self.step(root, table, cached, frame, bci, tier, &mut pending, descr, opcode) {
                Ok(Step::Next(len)) => bci += len,
                Ok(Step::Jump(target)) => bci = target,
                Ok(Step::Exit(code)) => return Ok(code),
                Err(thrown) => match self.handle_throw(root, frame, bci, thrown, &mut pending) {
                    Ok(handler) => bci = handler,
                    Err(e) => return Err(e),
                },
            }
        }
    }

    /// Route a thrown exception: intercept hooks, then the handler
    /// table; loop counts are reported before propagation.
    fn handle_throw(
        &self,
        root: &Arc<RootProgram>,
        frame: &mut Frame,
        bci: u16,
        thrown: Thrown,
        pending: &mut u32,
    ) -> Result<u16, VmError> {
        let value = match thrown {
            Thrown::Internal(err) => match self.hooks.intercept_internal_exception(err, bci) {
                VmError::Guest(v) => v,
                other => {
                    self.report_pending(pending);
                    return Err(other);
                }
            },
            Thrown::Guest(v) => v,
        };
        let value = self.hooks.intercept_guest_exception(value, bci);
        match exception::find_handler(root, bci) {
            Some(entry) => Ok(exception::enter_handler(frame, &entry, value)?),
            None => {
                self.report_pending(pending);
                Err(VmError::Guest(value))
            }
        }
    }

    fn report_pending(&self, pending: &mut u32) {
        if *pending > 0 {
            self.hooks.on_loop_report(*pending);
            *pending = 0;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        root: &Arc<RootProgram>,
        table: &InstructionTable,
        cached: Option<&CachedData>,
        frame: &mut Frame,
        bci: u16,
        tier: Tier,
        pending: &mut u32,
        descr: &InstructionDescr,
        opcode: u16,
    ) -> Result<Step, Thrown> {
        use InstructionKind as K;
        let len = descr.length();
        let imm = |k: u16| root.word_at(bci + 1 + k);

        match descr.kind {
            K::Trap => Err(Thrown::Internal(VmError::internal(format!(
                "trap at bci {}",
                bci
            )))),

            K::Branch => Ok(Step::Jump(imm(0))),

            K::BranchBackward => {
                *pending += 1;
                if *pending == REPORT_LOOP_STRIDE {
                    self.hooks.on_loop_report(REPORT_LOOP_STRIDE);
                    *pending = 0;
                }
                let target = imm(0);
                if tier == Tier::Uncached && root.decrement_uncached_budget() {
                    root.set_tier(Tier::Cached);
                    frame.bci = target;
                    return Ok(Step::Exit(encode_exit(frame.sp(), Tier::Cached as u16)));
                }
                Ok(Step::Jump(target))
            }

            K::BranchFalse => {
                let cond = frame.pop()?;
                let jump = !cond.is_truthy();
                if let Some(cached) = cached {
                    if let Some(profile) = cached.profiles.get(imm(1) as usize) {
                        if jump {
                            profile.taken.fetch_add(1, Ordering::Relaxed);
                        } else {
                            profile.not_taken.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                if jump {
                    Ok(Step::Jump(imm(0)))
                } else {
                    Ok(Step::Next(len))
                }
            }

            K::LoadConstant => {
                frame.push(root.constant(imm(0)).clone());
                Ok(Step::Next(len))
            }

            K::LoadArgument => {
                let value = frame
                    .args
                    .get(imm(0) as usize)
                    .cloned()
                    .unwrap_or(Value::Null);
                frame.push(value);
                Ok(Step::Next(len))
            }

            K::LoadLocal => {
                let value = frame.local(imm(0))?.clone();
                frame.push(value);
                Ok(Step::Next(len))
            }

            K::StoreLocal => {
                let slot = imm(0);
                let value = frame.pop()?;
                match opcode {
                    opcodes::STORE_LOCAL => {
                        if tier != Tier::Uncached {
                            quicken::quicken_store_local(root, table, bci, slot, &value);
                        }
                    }
                    opcodes::STORE_LOCAL_INT => {
                        if !matches!(value, Value::Int(_)) {
                            quicken::unquicken_store_local(root, bci, slot);
                        }
                    }
                    opcodes::STORE_LOCAL_FLOAT => {
                        if !matches!(value, Value::Float(_)) {
                            quicken::unquicken_store_local(root, bci, slot);
                        }
                    }
                    _ => {}
                }
                frame.set_local(slot, value)?;
                Ok(Step::Next(len))
            }

            K::LoadLocalMaterialized => {
                let target = frame.pop()?;
                match target {
                    Value::Frame(mf) => {
                        frame.push(mf.get(imm(0) as usize));
                        Ok(Step::Next(len))
                    }
                    other => Err(Thrown::Guest(Value::str(format!(
                        "materialized frame expected, got {}",
                        other.type_name()
                    )))),
                }
            }

            K::StoreLocalMaterialized => {
                let value = frame.pop()?;
                let target = frame.pop()?;
                match target {
                    Value::Frame(mf) => {
                        mf.set(imm(0) as usize, value);
                        Ok(Step::Next(len))
                    }
                    other => Err(Thrown::Guest(Value::str(format!(
                        "materialized frame expected, got {}",
                        other.type_name()
                    )))),
                }
            }

            K::Pop => {
                frame.pop()?;
                Ok(Step::Next(len))
            }

            K::Dup => {
                let value = frame.peek()?.clone();
                frame.push(value);
                Ok(Step::Next(len))
            }

            K::StoreNull => {
                frame.push(Value::Null);
                Ok(Step::Next(len))
            }

            K::Return => {
                self.report_pending(pending);
                frame.result = frame.pop()?;
                Ok(Step::Exit(encode_exit(frame.sp(), EXIT_DONE)))
            }

            K::Throw => {
                let value = frame.pop()?;
                Err(Thrown::Guest(value))
            }

            K::Yield => {
                let location = match root.constant(imm(0)) {
                    Value::Continuation(loc) => **loc,
                    _ => {
                        return Err(Thrown::Internal(VmError::internal(
                            "yield without continuation constant",
                        )))
                    }
                };
                let value = frame.pop()?;
                frame.set_local(BCI_SLOT, Value::Int(location.bci as i64))?;
                frame.result = coroutine::suspend(frame, location, value);
                self.report_pending(pending);
                Ok(Step::Exit(encode_exit(frame.sp(), EXIT_DONE)))
            }

            K::MergeConditional => {
                let value = frame.pop()?;
                frame.pop()?;
                frame.push(value);
                Ok(Step::Next(len))
            }

            K::LoadVariadic => {
                let items = frame.pop_n(imm(0) as usize)?;
                frame.push(Value::List(Arc::from(items.into_vec())));
                Ok(Step::Next(len))
            }

            K::MergeVariadic => {
                let tail = frame.pop()?;
                let head = frame.pop()?;
                match (head, tail) {
                    (Value::List(head), Value::List(tail)) => {
                        let mut merged = head.to_vec();
                        merged.extend(tail.iter().cloned());
                        frame.push(Value::List(merged.into()));
                        Ok(Step::Next(len))
                    }
                    _ => Err(Thrown::Internal(VmError::internal(
                        "merge.variadic without list operands",
                    ))),
                }
            }

            K::InstrumentationEnter => {
                if tier == Tier::Instrumented {
                    self.hooks.on_instrument(ProbeEvent::Enter, imm(0), bci);
                }
                Ok(Step::Next(len))
            }

            K::InstrumentationExit => {
                if tier == Tier::Instrumented {
                    self.hooks.on_instrument(ProbeEvent::Exit, imm(0), bci);
                }
                Ok(Step::Next(len))
            }

            K::InstrumentationLeave => {
                if tier == Tier::Instrumented {
                    self.hooks.on_instrument(ProbeEvent::Leave, imm(0), bci);
                }
                Ok(Step::Next(len))
            }

            K::CustomShortCircuit => {
                let data = descr.short_circuit.as_ref().ok_or_else(|| {
                    Thrown::Internal(VmError::internal("short-circuit without converter"))
                })?;
                let value = frame.pop()?;
                let keep_going = (data.convert)(&value) == data.continue_when;
                if let Some(cached) = cached {
                    if let Some(profile) = cached.profiles.get(imm(1) as usize) {
                        if keep_going {
                            profile.not_taken.fetch_add(1, Ordering::Relaxed);
                        } else {
                            profile.taken.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                if keep_going {
                    Ok(Step::Next(len))
                } else {
                    frame.push(value);
                    Ok(Step::Jump(imm(0)))
                }
            }

            K::Custom => self.execute_custom(root, table, cached, frame, bci, tier, descr, opcode),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_custom(
        &self,
        root: &Arc<RootProgram>,
        table: &InstructionTable,
        cached: Option<&CachedData>,
        frame: &mut Frame,
        bci: u16,
        tier: Tier,
        descr: &InstructionDescr,
        opcode: u16,
    ) -> Result<Step, Thrown> {
        let custom = descr.custom.as_ref().ok_or_else(|| {
            Thrown::Internal(VmError::internal("custom instruction without execute"))
        })?;
        let operands = frame.pop_n(custom.arity.operand_count())?;

        let result = if tier == Tier::Uncached {
            // Keep the frame's bci slot current: uncached custom code
            // may trigger stack walks.
            frame.set_local(BCI_SLOT, Value::Int(bci as i64))?;
            (custom.execute_uncached)(&operands)
        } else if descr.quickening_base.is_some() {
            match (custom.execute)(&operands) {
                Err(OpError::UnexpectedOperand) => {
                    let node = self.node_at(cached, imm0(root, bci))?;
                    let base = quicken::respecialize_custom(root, table, bci, opcode, node);
                    let generic = table.get(base).custom.as_ref().ok_or_else(|| {
                        Thrown::Internal(VmError::internal("quickening base without execute"))
                    })?;
                    (generic.execute)(&operands)
                }
                other => other,
            }
        } else if !descr.quickened.is_empty() {
            let node = self.node_at(cached, imm0(root, bci))?;
            if node.state.load(Ordering::Relaxed) == CachedNode::UNINIT {
                let chosen = quicken::quicken_custom(root, table, bci, opcode, node, &operands);
                let exec = table.get(chosen).custom.as_ref().ok_or_else(|| {
                    Thrown::Internal(VmError::internal("quickened opcode without execute"))
                })?;
                (exec.execute)(&operands)
            } else {
                (custom.execute)(&operands)
            }
        } else {
            (custom.execute)(&operands)
        };

        let value = match result {
            Ok(v) => v,
            Err(OpError::Guest(v)) => return Err(Thrown::Guest(v)),
            Err(OpError::Internal(m)) => return Err(Thrown::Internal(VmError::Internal(m))),
            Err(OpError::UnexpectedOperand) => {
                return Err(Thrown::Internal(VmError::internal(
                    "unexpected-operand signal outside a quickened execute",
                )))
            }
        };

        match custom.local_args {
            LocalArgs::None => {
                if custom.returns_value {
                    frame.push(value);
                }
            }
            LocalArgs::Single => {
                frame.set_local(imm1(root, bci), value)?;
            }
            LocalArgs::Range => {
                let start = imm1(root, bci);
                let count = root.word_at(bci + 3);
                match value {
                    Value::List(items) => {
                        for i in 0..count {
                            let v = items.get(i as usize).cloned().unwrap_or(Value::Null);
                            frame.set_local(start + i, v)?;
                        }
                    }
                    other => {
                        return Err(Thrown::Guest(Value::str(format!(
                            "list expected for local range result, got {}",
                            other.type_name()
                        ))))
                    }
                }
            }
        }
        Ok(Step::Next(descr.length()))
    }

    fn node_at<'a>(
        &self,
        cached: Option<&'a CachedData>,
        node: u16,
    ) -> Result<&'a CachedNode, Thrown> {
        cached
            .and_then(|c| c.nodes.get(node as usize))
            .ok_or_else(|| Thrown::Internal(VmError::internal("cached node slot out of range")))
    }
}

/// First immediate (the `Node` slot of custom instructions).
#[inline]
fn imm0(root: &Arc<RootProgram>, bci: u16) -> u16 {
    root.word_at(bci + 1)
}

/// Second immediate (first local-setter slot of custom instructions).
#[inline]
fn imm1(root: &Arc<RootProgram>, bci: u16) -> u16 {
    root.word_at(bci + 2)
}
