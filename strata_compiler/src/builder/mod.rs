//! Builder facade.
//!
//! The `Builder` is the single entry point a guest front-end drives. It
//! exposes one `begin_*`/`end_*` pair per structured operation and one
//! `emit_*` per leaf, enforces child-count and value/void contracts,
//! simulates the operand stack, and drives the constant pool, the label
//! resolver, and the finally-handler machinery.
//!
//! The builder is single-threaded and builds one root at a time;
//! independent builders may run in parallel.

pub mod finally;
pub mod operation_stack;

use crate::builder::finally::FinallyTryContext;
use crate::builder::operation_stack::{FrameData, OperationFrame};
use crate::bytecode::buffer::BytecodeBuffer;
use crate::bytecode::constant_pool::ConstantPool;
use crate::bytecode::labels::{BranchRegistry, LabelArena, UnresolvedSite};
use crate::bytecode::root::RootProgram;
use smallvec::SmallVec;
use std::sync::Arc;
use strata_core::instruction::opcodes;
use strata_core::operation::operations;
use strata_core::{
    Arity, BuildResult, BuilderError, ContinuationLocation, CustomOp, InterpreterModel,
    LocalArgs, OperationKind, Source, SourceInfoEntry, Value, UNINIT_BCI, USER_LOCALS_START_IDX,
};

/// Variadic children collapsed per `load.variadic`, bounding stack
/// growth for long argument lists.
pub(crate) const VARIADIC_CHUNK: u32 = 8;

/// A local slot token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Local(pub(crate) u16);

impl Local {
    #[inline]
    pub fn index(self) -> u16 {
        self.0
    }
}

/// A label token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) u32);

impl Label {
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }
}

/// Build-time configuration of a root.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Emit the `Dup`/`merge.conditional` shape for `Conditional` and
    /// let the cached tier drive slot-kind transitions.
    pub boxing_elimination: bool,
    /// Emit instrumentation enter/exit/leave instructions.
    pub instrumentation: bool,
    /// Track basic-block boundaries alongside the code array.
    pub track_basic_blocks: bool,
    /// Uncached invocations/backedges before the cached tier takes
    /// over; `0` starts roots in the cached tier directly.
    pub uncached_threshold: i32,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            boxing_elimination: false,
            instrumentation: false,
            track_basic_blocks: false,
            uncached_threshold: 16,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct Builder {
    pub(crate) model: Arc<InterpreterModel>,
    pub(crate) config: BuilderConfig,
    pub(crate) language: Arc<str>,

    // Context-sensitive state, swapped wholesale by finally contexts.
    pub(crate) buffer: BytecodeBuffer,
    pub(crate) cur_stack: u16,
    pub(crate) max_stack: u16,
    pub(crate) unresolved: BranchRegistry,

    // Persistent per-root state.
    pub(crate) constants: ConstantPool,
    pub(crate) labels: LabelArena,
    pub(crate) op_stack: Vec<OperationFrame>,
    pub(crate) next_seq: u32,
    pub(crate) num_locals: u16,
    pub(crate) num_nodes: u16,
    pub(crate) num_profiles: u16,
    pub(crate) finally_ctxs: Vec<FinallyTryContext>,
    pub(crate) handler_stack: Vec<usize>,
    pub(crate) sources: Vec<Source>,
    pub(crate) source_stack: Vec<u16>,
    pub(crate) section_stack: Vec<(i32, i32)>,
}

impl Builder {
    pub fn new(model: Arc<InterpreterModel>, config: BuilderConfig) -> Self {
        let tracing = config.track_basic_blocks;
        Builder {
            model,
            config,
            language: "".into(),
            buffer: BytecodeBuffer::new(tracing),
            cur_stack: 0,
            max_stack: 0,
            unresolved: BranchRegistry::new(),
            constants: ConstantPool::new(),
            labels: LabelArena::new(),
            op_stack: Vec::new(),
            next_seq: 0,
            num_locals: USER_LOCALS_START_IDX,
            num_nodes: 0,
            num_profiles: 0,
            finally_ctxs: Vec::new(),
            handler_stack: Vec::new(),
            sources: Vec::new(),
            source_stack: Vec::new(),
            section_stack: Vec::new(),
        }
    }

    pub fn model(&self) -> &Arc<InterpreterModel> {
        &self.model
    }

    // =========================================================================
    // Stack Simulation
    // =========================================================================

    pub(crate) fn push_height(&mut self, n: u16) {
        self.cur_stack += n;
        self.max_stack = self.max_stack.max(self.cur_stack);
    }

    pub(crate) fn pop_height(&mut self, n: u16) -> BuildResult<()> {
        if self.cur_stack < n {
            return Err(BuilderError::UnbalancedStack {
                message: format!("pop of {} values at height {}", n, self.cur_stack),
            });
        }
        self.cur_stack -= n;
        Ok(())
    }

    fn apply_effect(&mut self, effect: i8) -> BuildResult<()> {
        if effect < 0 {
            self.pop_height((-effect) as u16)?;
        } else {
            self.push_height(effect as u16);
        }
        Ok(())
    }

    // =========================================================================
    // Emission Helpers
    // =========================================================================

    /// Append an instruction without touching the simulated stack.
    pub(crate) fn emit_raw(&mut self, opcode: u16, imms: &[u16]) -> BuildResult<u16> {
        self.buffer.push_instruction(opcode, imms)
    }

    /// Append an instruction with a statically known stack effect.
    pub(crate) fn emit_instr(&mut self, opcode: u16, imms: &[u16]) -> BuildResult<u16> {
        let effect = self
            .model
            .instructions
            .get(opcode)
            .stack_effect
            .unwrap_or_else(|| unreachable!("static emit of dynamic-effect opcode"));
        self.apply_effect(effect)?;
        self.buffer.push_instruction(opcode, imms)
    }

    fn emit_load_variadic(&mut self, count: u16) -> BuildResult<()> {
        self.pop_height(count)?;
        self.push_height(1);
        self.emit_raw(opcodes::LOAD_VARIADIC, &[count])?;
        Ok(())
    }

    pub(crate) fn alloc_node(&mut self) -> u16 {
        let idx = self.num_nodes;
        self.num_nodes += 1;
        idx
    }

    pub(crate) fn alloc_profile(&mut self) -> u16 {
        let idx = self.num_profiles;
        self.num_profiles += 1;
        idx
    }

    pub(crate) fn register_branch_site(&mut self, label: u32, imm_bci: u16, stack_height: u16) {
        self.unresolved.register(
            label,
            UnresolvedSite {
                imm_bci,
                stack_height,
            },
        );
    }

    /// Patch a branch immediate with a resolved in-buffer target.
    fn patch_branch_target(&mut self, imm: u16, target: u16) {
        self.buffer.patch(imm, target);
        self.buffer.mark_boundary(target);
        self.mark_relative_if_in_handler(imm);
    }

    fn require_root(&self) -> BuildResult<()> {
        if self.op_stack.is_empty() {
            return Err(BuilderError::MissingBeginRoot);
        }
        Ok(())
    }

    fn op_name(&self, op_id: u16) -> String {
        self.model.operations.get(op_id).name.to_string()
    }

    // =========================================================================
    // Child Bookkeeping
    // =========================================================================

    /// Whether values of non-required children are tolerated (popped or
    /// passed through) rather than rejected.
    fn is_aggregate(kind: OperationKind, child_index: u32) -> bool {
        match kind {
            OperationKind::Root
            | OperationKind::Block
            | OperationKind::Source
            | OperationKind::SourceSection
            | OperationKind::InstrumentTag => true,
            OperationKind::FinallyTry | OperationKind::FinallyTryNoExcept => child_index > 0,
            _ => false,
        }
    }

    /// Invoked before a child is parsed: transparent parents pop a
    /// discarded previous value; short-circuit parents test the
    /// previous child and conditionally branch to the end.
    fn before_child(&mut self) -> BuildResult<()> {
        self.require_root()?;
        let top = self.op_stack.len() - 1;
        let (op_id, child_index, prev_produced) = {
            let f = &self.op_stack[top];
            (f.op_id, f.child_count, f.prev_produced)
        };
        let kind = self.model.operations.get(op_id).kind;

        if Self::is_aggregate(kind, child_index) && child_index > 0 && prev_produced {
            self.emit_instr(opcodes::POP, &[])?;
            self.op_stack[top].prev_produced = false;
        }

        if kind == OperationKind::CustomShortCircuit && child_index > 0 {
            let (instruction, end_label) = match self.op_stack[top].data {
                FrameData::ShortCircuit {
                    instruction,
                    end_label,
                } => (instruction, end_label),
                _ => unreachable!("short-circuit frame without payload"),
            };
            let profile = self.alloc_profile();
            let taken_height = self.cur_stack;
            let bci = self.emit_instr(instruction, &[UNINIT_BCI, profile])?;
            self.register_branch_site(end_label, bci + 1, taken_height);
        }
        Ok(())
    }

    /// Invoked after a child completes: verifies the value contract and
    /// advances the parent's control-flow state machine.
    fn after_child(&mut self, produced: bool, child_bci: u16) -> BuildResult<()> {
        let top = self.op_stack.len() - 1;
        let (op_id, idx) = {
            let f = &self.op_stack[top];
            (f.op_id, f.child_count)
        };
        let descr = self.model.operations.get(op_id);
        let kind = descr.kind;
        let must_be_value = descr.child_must_be_value(idx);

        if must_be_value && !produced {
            return Err(BuilderError::ValueExpected {
                operation: self.op_name(op_id),
                child_index: idx,
            });
        }
        if !must_be_value && produced && !Self::is_aggregate(kind, idx) {
            return Err(BuilderError::VoidExpected {
                operation: self.op_name(op_id),
                child_index: idx,
            });
        }

        match kind {
            OperationKind::IfThen => self.after_child_if_then(top, idx)?,
            OperationKind::IfThenElse => self.after_child_if_then_else(top, idx)?,
            OperationKind::Conditional => self.after_child_conditional(top, idx, child_bci)?,
            OperationKind::While => self.after_child_while(top, idx)?,
            OperationKind::TryCatch => self.after_child_try_catch(top, idx)?,
            OperationKind::FinallyTry | OperationKind::FinallyTryNoExcept => {
                self.after_child_finally(top, idx)?
            }
            OperationKind::CustomSimple => self.after_child_custom(top, idx)?,
            _ => {}
        }

        let f = &mut self.op_stack[top];
        f.child_count = idx + 1;
        f.prev_produced = produced;
        Ok(())
    }

    fn after_child_if_then(&mut self, top: usize, idx: u32) -> BuildResult<()> {
        match idx {
            0 => {
                let profile = self.alloc_profile();
                let bci = self.emit_instr(opcodes::BRANCH_FALSE, &[UNINIT_BCI, profile])?;
                self.op_stack[top].data = FrameData::IfThen {
                    false_fixup: bci + 1,
                };
            }
            _ => {
                let false_fixup = match self.op_stack[top].data {
                    FrameData::IfThen { false_fixup } => false_fixup,
                    _ => unreachable!("if-then frame without payload"),
                };
                let target = self.buffer.len();
                self.patch_branch_target(false_fixup, target);
            }
        }
        Ok(())
    }

    fn after_child_if_then_else(&mut self, top: usize, idx: u32) -> BuildResult<()> {
        match idx {
            0 => {
                let profile = self.alloc_profile();
                let bci = self.emit_instr(opcodes::BRANCH_FALSE, &[UNINIT_BCI, profile])?;
                self.op_stack[top].data = FrameData::IfThenElse {
                    false_fixup: bci + 1,
                    end_fixup: UNINIT_BCI,
                };
            }
            1 => {
                let false_fixup = match self.op_stack[top].data {
                    FrameData::IfThenElse { false_fixup, .. } => false_fixup,
                    _ => unreachable!("if-then-else frame without payload"),
                };
                let bci = self.emit_instr(opcodes::BRANCH, &[UNINIT_BCI])?;
                let target = self.buffer.len();
                self.patch_branch_target(false_fixup, target);
                self.op_stack[top].data = FrameData::IfThenElse {
                    false_fixup,
                    end_fixup: bci + 1,
                };
            }
            _ => {
                let end_fixup = match self.op_stack[top].data {
                    FrameData::IfThenElse { end_fixup, .. } => end_fixup,
                    _ => unreachable!("if-then-else frame without payload"),
                };
                let target = self.buffer.len();
                self.patch_branch_target(end_fixup, target);
            }
        }
        Ok(())
    }

    fn after_child_conditional(&mut self, top: usize, idx: u32, child_bci: u16) -> BuildResult<()> {
        match idx {
            0 => {
                if self.config.boxing_elimination {
                    self.emit_instr(opcodes::DUP, &[])?;
                }
                let profile = self.alloc_profile();
                let bci = self.emit_instr(opcodes::BRANCH_FALSE, &[UNINIT_BCI, profile])?;
                self.op_stack[top].data = FrameData::Conditional {
                    false_fixup: bci + 1,
                    end_fixup: UNINIT_BCI,
                    then_bci: UNINIT_BCI,
                    else_bci: UNINIT_BCI,
                };
            }
            1 => {
                let false_fixup = match self.op_stack[top].data {
                    FrameData::Conditional { false_fixup, .. } => false_fixup,
                    _ => unreachable!("conditional frame without payload"),
                };
                let bci = self.emit_instr(opcodes::BRANCH, &[UNINIT_BCI])?;
                // The else arm starts at the height the then arm did.
                self.pop_height(1)?;
                let target = self.buffer.len();
                self.patch_branch_target(false_fixup, target);
                self.op_stack[top].data = FrameData::Conditional {
                    false_fixup,
                    end_fixup: bci + 1,
                    then_bci: child_bci,
                    else_bci: UNINIT_BCI,
                };
            }
            _ => {
                let (end_fixup, then_bci) = match self.op_stack[top].data {
                    FrameData::Conditional {
                        end_fixup,
                        then_bci,
                        ..
                    } => (end_fixup, then_bci),
                    _ => unreachable!("conditional frame without payload"),
                };
                let target = self.buffer.len();
                self.patch_branch_target(end_fixup, target);
                if self.config.boxing_elimination {
                    let bci =
                        self.emit_instr(opcodes::MERGE_CONDITIONAL, &[then_bci, child_bci])?;
                    self.mark_relative_if_in_handler(bci + 1);
                    self.mark_relative_if_in_handler(bci + 2);
                }
            }
        }
        Ok(())
    }

    fn after_child_while(&mut self, top: usize, idx: u32) -> BuildResult<()> {
        match idx {
            0 => {
                let profile = self.alloc_profile();
                let bci = self.emit_instr(opcodes::BRANCH_FALSE, &[UNINIT_BCI, profile])?;
                let start_bci = match self.op_stack[top].data {
                    FrameData::While { start_bci, .. } => start_bci,
                    _ => unreachable!("while frame without payload"),
                };
                self.op_stack[top].data = FrameData::While {
                    start_bci,
                    end_fixup: bci + 1,
                };
            }
            _ => {
                let (start_bci, end_fixup) = match self.op_stack[top].data {
                    FrameData::While {
                        start_bci,
                        end_fixup,
                    } => (start_bci, end_fixup),
                    _ => unreachable!("while frame without payload"),
                };
                let bci = self.emit_instr(opcodes::BRANCH_BACKWARD, &[start_bci])?;
                self.mark_relative_if_in_handler(bci + 1);
                let target = self.buffer.len();
                self.patch_branch_target(end_fixup, target);
            }
        }
        Ok(())
    }

    fn after_child_try_catch(&mut self, top: usize, idx: u32) -> BuildResult<()> {
        match idx {
            0 => {
                let bci = self.emit_instr(opcodes::BRANCH, &[UNINIT_BCI])?;
                let catch_start = self.buffer.len();
                self.buffer.mark_boundary(catch_start);
                match &mut self.op_stack[top].data {
                    FrameData::TryCatch {
                        end_fixup,
                        catch_start: cs,
                        ..
                    } => {
                        *end_fixup = bci + 1;
                        *cs = catch_start;
                    }
                    _ => unreachable!("try-catch frame without payload"),
                }
            }
            _ => {
                let (try_start, start_sp, exc_local, end_fixup, catch_start) =
                    match self.op_stack[top].data {
                        FrameData::TryCatch {
                            try_start,
                            start_sp,
                            exc_local,
                            end_fixup,
                            catch_start,
                        } => (try_start, start_sp, exc_local, end_fixup, catch_start),
                        _ => unreachable!("try-catch frame without payload"),
                    };
                let target = self.buffer.len();
                self.patch_branch_target(end_fixup, target);
                self.buffer
                    .push_handler(try_start, catch_start, catch_start, start_sp, exc_local);
            }
        }
        Ok(())
    }

    fn after_child_finally(&mut self, top: usize, idx: u32) -> BuildResult<()> {
        if idx == 0 {
            let ctx = match self.op_stack[top].data {
                FrameData::FinallyTry { ctx, .. } => ctx,
                _ => unreachable!("finally frame without payload"),
            };
            self.freeze_finally_handler(ctx)?;
            let body_start = self.buffer.len();
            let start_sp = self.cur_stack;
            self.buffer.mark_boundary(body_start);
            match &mut self.op_stack[top].data {
                FrameData::FinallyTry {
                    body_start: bs,
                    start_sp: sp,
                    ..
                } => {
                    *bs = body_start;
                    *sp = start_sp;
                }
                _ => unreachable!("finally frame without payload"),
            }
        }
        Ok(())
    }

    fn after_child_custom(&mut self, top: usize, idx: u32) -> BuildResult<()> {
        let instruction = match self.op_stack[top].data {
            FrameData::Custom { instruction, .. } => instruction,
            _ => unreachable!("custom frame without payload"),
        };
        let arity = match &self.model.instructions.get(instruction).custom {
            Some(c) => c.arity,
            None => return Ok(()),
        };
        if let Arity::Variadic(fixed) = arity {
            if idx >= fixed as u32 {
                let (variadic_count, chunks) = match &mut self.op_stack[top].data {
                    FrameData::Custom {
                        variadic_count,
                        chunks,
                        ..
                    } => {
                        *variadic_count += 1;
                        (*variadic_count, *chunks)
                    }
                    _ => unreachable!("custom frame without payload"),
                };
                if variadic_count % VARIADIC_CHUNK == 0 {
                    self.emit_load_variadic(VARIADIC_CHUNK as u16)?;
                    if chunks > 0 {
                        self.emit_instr(opcodes::MERGE_VARIADIC, &[])?;
                    }
                    match &mut self.op_stack[top].data {
                        FrameData::Custom { chunks, .. } => *chunks += 1,
                        _ => unreachable!("custom frame without payload"),
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Operation Begin/End Core
    // =========================================================================

    fn begin_operation(&mut self, op_id: u16, data: FrameData) -> BuildResult<usize> {
        self.before_child()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let start = self.buffer.len();
        self.op_stack
            .push(OperationFrame::new(op_id, seq, start, data));
        Ok(self.op_stack.len() - 1)
    }

    fn end_operation(&mut self, op_id: u16) -> BuildResult<()> {
        self.require_root()?;
        let top = self
            .op_stack
            .last()
            .unwrap_or_else(|| unreachable!("checked non-empty"));
        if top.op_id != op_id {
            return Err(BuilderError::UnexpectedOperationEnd {
                expected: self.op_name(top.op_id),
                actual: self.op_name(op_id),
            });
        }
        if self.op_stack.len() == 1 {
            // The root frame is closed by end_root only.
            return Err(BuilderError::UnexpectedOperationEnd {
                expected: "Root".to_string(),
                actual: self.op_name(op_id),
            });
        }
        let frame = self
            .op_stack
            .pop()
            .unwrap_or_else(|| unreachable!("checked non-empty"));

        let descr = self.model.operations.get(op_id);
        match descr.arity {
            strata_core::OperationArity::Fixed(n) => {
                if frame.child_count != n as u32 {
                    return Err(BuilderError::ArityMismatch {
                        operation: self.op_name(op_id),
                        expected: n.to_string(),
                        actual: frame.child_count,
                    });
                }
            }
            strata_core::OperationArity::Variadic(min) => {
                if frame.child_count < min as u32 {
                    return Err(BuilderError::ArityMismatch {
                        operation: self.op_name(op_id),
                        expected: format!("at least {}", min),
                        actual: frame.child_count,
                    });
                }
            }
        }

        self.finish_operation(&frame)?;

        for &label in &frame.declared_labels {
            if !self.labels.get(label).is_emitted() {
                return Err(BuilderError::UndefinedLabel { label });
            }
        }

        let descr = self.model.operations.get(op_id);
        let produced = if descr.is_transparent {
            frame.prev_produced
        } else {
            descr.produces_value
        };
        self.after_child(produced, frame.start_bci)
    }

    /// Kind-specific end-of-operation emission.
    fn finish_operation(&mut self, frame: &OperationFrame) -> BuildResult<()> {
        match frame.data {
            FrameData::Return => {
                self.do_emit_leaves(None)?;
                self.emit_instr(opcodes::RETURN, &[])?;
            }
            FrameData::Yield => {
                let resume = self.buffer.len() as u32 + 2;
                if resume >= UNINIT_BCI as u32 {
                    return Err(BuilderError::BytecodeOverflow);
                }
                let location = ContinuationLocation {
                    bci: resume as u16,
                    sp: self.cur_stack - 1,
                };
                let idx = self
                    .constants
                    .add(Value::Continuation(Arc::new(location)));
                self.emit_instr(opcodes::YIELD, &[idx])?;
            }
            FrameData::StoreLocal { local } => {
                self.emit_instr(opcodes::STORE_LOCAL, &[local])?;
            }
            FrameData::LoadLocalMaterialized { local } => {
                self.emit_instr(opcodes::LOAD_LOCAL_MAT, &[local])?;
            }
            FrameData::StoreLocalMaterialized { local } => {
                self.emit_instr(opcodes::STORE_LOCAL_MAT, &[local])?;
            }
            FrameData::Source => {
                self.source_stack.pop();
            }
            FrameData::SourceSection => {
                self.section_stack.pop();
                let bci = self.buffer.len();
                let entry = match (self.source_stack.last(), self.section_stack.last()) {
                    (Some(&src), Some(&(start, length))) => {
                        SourceInfoEntry::new(bci, src, start, length)
                    }
                    _ => SourceInfoEntry::none(bci),
                };
                self.buffer.push_source(entry);
            }
            FrameData::InstrumentTag { tag } => {
                if self.config.instrumentation {
                    self.emit_raw(opcodes::INSTRUMENTATION_EXIT, &[tag])?;
                }
            }
            FrameData::ShortCircuit { end_label, .. } => {
                self.resolve_label_internal(end_label)?;
            }
            FrameData::Custom {
                instruction,
                ref locals,
                variadic_count,
                chunks,
            } => {
                self.finish_custom(instruction, locals, variadic_count, chunks)?;
            }
            FrameData::FinallyTry {
                ctx,
                exc_local,
                body_start,
                start_sp,
            } => {
                // The guarded body is a void context; a trailing value
                // is discarded like in any aggregate.
                if frame.prev_produced {
                    self.emit_instr(opcodes::POP, &[])?;
                }
                self.finish_finally(ctx, exc_local, body_start, start_sp)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish_custom(
        &mut self,
        instruction: u16,
        locals: &SmallVec<[u16; 2]>,
        variadic_count: u32,
        chunks: u32,
    ) -> BuildResult<()> {
        let custom = self
            .model
            .instructions
            .get(instruction)
            .custom
            .clone()
            .unwrap_or_else(|| unreachable!("custom operation without custom data"));

        if let Arity::Variadic(_) = custom.arity {
            let rem = variadic_count % VARIADIC_CHUNK;
            if chunks == 0 {
                self.emit_load_variadic(rem as u16)?;
            } else if rem > 0 {
                self.emit_load_variadic(rem as u16)?;
                self.emit_instr(opcodes::MERGE_VARIADIC, &[])?;
            }
        }

        let node = self.alloc_node();
        let mut imms: SmallVec<[u16; 4]> = SmallVec::new();
        imms.push(node);
        match custom.local_args {
            LocalArgs::None => {}
            LocalArgs::Single => {
                let slot = locals.first().copied().ok_or_else(|| {
                    BuilderError::ArityMismatch {
                        operation: self.op_name_of_instr(instruction),
                        expected: "1 local argument".to_string(),
                        actual: 0,
                    }
                })?;
                imms.push(slot);
            }
            LocalArgs::Range => {
                let start = locals.first().copied().ok_or_else(|| {
                    BuilderError::ArityMismatch {
                        operation: self.op_name_of_instr(instruction),
                        expected: "a local range".to_string(),
                        actual: 0,
                    }
                })?;
                imms.push(start);
                imms.push(locals.len() as u16);
            }
        }

        self.pop_height(custom.arity.operand_count() as u16)?;
        if custom.returns_value {
            self.push_height(1);
        }
        self.emit_raw(instruction, &imms)?;
        Ok(())
    }

    fn finish_finally(
        &mut self,
        ctx: usize,
        exc_local: Option<u16>,
        body_start: u16,
        start_sp: u16,
    ) -> BuildResult<()> {
        let body_end = self.buffer.len();
        // Normal completion.
        self.emit_finally_handler(ctx)?;
        if let Some(exc) = exc_local {
            // Uncaught-exception path: run the handler, then rethrow.
            let bci = self.emit_instr(opcodes::BRANCH, &[UNINIT_BCI])?;
            let end_fixup = bci + 1;
            let catch = self.buffer.len();
            self.buffer.mark_boundary(catch);
            self.buffer
                .push_handler(body_start, body_end, catch, start_sp, exc);
            self.emit_finally_handler(ctx)?;
            self.emit_instr(opcodes::LOAD_LOCAL, &[exc])?;
            self.emit_instr(opcodes::THROW, &[])?;
            let target = self.buffer.len();
            self.patch_branch_target(end_fixup, target);
        }
        Ok(())
    }

    fn op_name_of_instr(&self, instruction: u16) -> String {
        self.model.instructions.get(instruction).name.to_string()
    }

    // =========================================================================
    // Leaves Emission
    // =========================================================================

    /// Walk the operation stack top-down, replaying finally handlers
    /// (and instrumentation leaves) for every frame crossed, stopping at
    /// the frame with `target_seq` (or the bottom for `None`).
    fn do_emit_leaves(&mut self, target_seq: Option<u32>) -> BuildResult<()> {
        let mut actions: Vec<LeaveAction> = Vec::new();
        for frame in self.op_stack.iter().rev() {
            if Some(frame.seq) == target_seq {
                break;
            }
            match frame.data {
                FrameData::FinallyTry { ctx, .. } => actions.push(LeaveAction::Finally(ctx)),
                FrameData::InstrumentTag { tag } if self.config.instrumentation => {
                    actions.push(LeaveAction::Tag(tag))
                }
                _ => {}
            }
        }
        for action in actions {
            match action {
                LeaveAction::Finally(ctx) => self.emit_finally_handler(ctx)?,
                LeaveAction::Tag(tag) => {
                    self.emit_raw(opcodes::INSTRUMENTATION_LEAVE, &[tag])?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Allocate an undefined label, declared by the innermost open
    /// operation.
    pub fn create_label(&mut self) -> BuildResult<Label> {
        self.require_root()?;
        let scope = self.current_handler_scope();
        let top = self.op_stack.len() - 1;
        let seq = self.op_stack[top].seq;
        let id = self.labels.create(seq, scope);
        self.op_stack[top].declared_labels.push(id);
        Ok(Label(id))
    }

    fn resolve_label_internal(&mut self, label: u32) -> BuildResult<()> {
        if self.labels.get(label).is_emitted() {
            return Err(BuilderError::LabelAlreadyEmitted { label });
        }
        let here = self.buffer.len();
        let height = self.cur_stack;
        {
            let info = self.labels.get_mut(label);
            info.bci = here;
            info.height = height;
        }
        self.buffer.mark_boundary(here);
        for site in self.unresolved.resolve(label) {
            if site.stack_height != height {
                return Err(BuilderError::UnbalancedBranch {
                    label,
                    site_height: site.stack_height,
                    label_height: height,
                });
            }
            self.buffer.patch(site.imm_bci, here);
            self.mark_relative_if_in_handler(site.imm_bci);
        }
        Ok(())
    }

    /// Emit `label` at the current position and resolve its pending
    /// branches.
    pub fn emit_label(&mut self, label: Label) -> BuildResult<()> {
        self.before_child()?;
        let top = self.op_stack.len() - 1;
        if self.labels.get(label.0).declaring_seq != self.op_stack[top].seq {
            return Err(BuilderError::LabelOutsideDeclaringOp { label: label.0 });
        }
        self.resolve_label_internal(label.0)?;
        self.after_child(false, self.buffer.len())
    }

    /// Branch to a label declared by an enclosing operation, replaying
    /// the finally handlers of every frame crossed.
    pub fn emit_branch(&mut self, label: Label) -> BuildResult<()> {
        self.before_child()?;
        let (emitted, declaring_seq, scope) = {
            let info = self.labels.get(label.0);
            (info.is_emitted(), info.declaring_seq, info.handler_scope)
        };
        if !self.op_stack.iter().any(|f| f.seq == declaring_seq) {
            return Err(BuilderError::InvalidBranchTarget { label: label.0 });
        }
        // Rejected before any leaves are emitted, keeping the builder
        // atomic on error.
        if emitted {
            return Err(BuilderError::BackwardBranchUnsupported { label: label.0 });
        }
        let current = self.current_handler_scope();
        match (scope, current) {
            (None, _) => {}
            (Some(s), Some(c)) if s == c => {}
            _ => return Err(BuilderError::CrossHandlerBranch { label: label.0 }),
        }
        self.do_emit_leaves(Some(declaring_seq))?;
        let taken_height = self.cur_stack;
        let bci = self.emit_instr(opcodes::BRANCH, &[UNINIT_BCI])?;
        self.register_branch_site(label.0, bci + 1, taken_height);
        self.after_child(false, bci)
    }

    // =========================================================================
    // Locals
    // =========================================================================

    /// Allocate a fresh local slot.
    pub fn create_local(&mut self) -> BuildResult<Local> {
        self.require_root()?;
        let slot = self.num_locals;
        self.num_locals += 1;
        Ok(Local(slot))
    }

    // =========================================================================
    // Root
    // =========================================================================

    pub fn begin_root(&mut self, language: impl Into<Arc<str>>) -> BuildResult<()> {
        if !self.op_stack.is_empty() {
            return Err(BuilderError::UnexpectedOperationEnd {
                expected: self.op_name(self.op_stack[self.op_stack.len() - 1].op_id),
                actual: "Root".to_string(),
            });
        }
        self.language = language.into();
        self.buffer = BytecodeBuffer::new(self.config.track_basic_blocks);
        self.cur_stack = 0;
        self.max_stack = 0;
        self.unresolved = BranchRegistry::new();
        self.constants = ConstantPool::new();
        self.labels = LabelArena::new();
        self.next_seq = 0;
        self.num_locals = USER_LOCALS_START_IDX;
        self.num_nodes = 0;
        self.num_profiles = 0;
        self.finally_ctxs.clear();
        self.handler_stack.clear();
        self.sources.clear();
        self.source_stack.clear();
        self.section_stack.clear();

        let seq = self.next_seq;
        self.next_seq += 1;
        self.op_stack
            .push(OperationFrame::new(operations::ROOT, seq, 0, FrameData::None));
        self.buffer.mark_boundary(0);
        Ok(())
    }

    /// Close the root and freeze it into an executable program.
    pub fn end_root(&mut self) -> BuildResult<Arc<RootProgram>> {
        self.require_root()?;
        if self.op_stack.len() != 1 {
            return Err(BuilderError::UnexpectedOperationEnd {
                expected: self.op_name(self.op_stack[self.op_stack.len() - 1].op_id),
                actual: "Root".to_string(),
            });
        }
        let frame = self
            .op_stack
            .pop()
            .unwrap_or_else(|| unreachable!("checked non-empty"));
        for &label in &frame.declared_labels {
            if !self.labels.get(label).is_emitted() {
                return Err(BuilderError::UndefinedLabel { label });
            }
        }

        let produced = frame.prev_produced;
        let expected = if produced { 1 } else { 0 };
        if self.cur_stack != expected {
            return Err(BuilderError::UnbalancedStack {
                message: format!(
                    "root ended at stack height {}, expected {}",
                    self.cur_stack, expected
                ),
            });
        }
        if !produced {
            self.emit_instr(opcodes::STORE_NULL, &[])?;
        }
        self.emit_instr(opcodes::RETURN, &[])?;

        self.buffer.sort_handlers();
        let tracing = self.buffer.is_tracing();
        let buffer = std::mem::replace(&mut self.buffer, BytecodeBuffer::new(tracing));
        let (code, source_info, handlers, boundaries) = buffer.into_parts();
        let constants = std::mem::take(&mut self.constants).into_constants();
        let sources = std::mem::take(&mut self.sources);

        Ok(RootProgram::new(
            self.model.clone(),
            std::mem::replace(&mut self.language, "".into()),
            code,
            constants,
            handlers,
            self.num_locals,
            self.num_nodes,
            self.num_profiles,
            self.max_stack,
            sources,
            source_info,
            if tracing { Some(boundaries) } else { None },
            self.config.uncached_threshold,
        ))
    }

    // =========================================================================
    // Structured Operations
    // =========================================================================

    pub fn begin_block(&mut self) -> BuildResult<()> {
        self.begin_operation(operations::BLOCK, FrameData::None)?;
        Ok(())
    }

    pub fn end_block(&mut self) -> BuildResult<()> {
        self.end_operation(operations::BLOCK)
    }

    pub fn begin_if_then(&mut self) -> BuildResult<()> {
        self.begin_operation(operations::IF_THEN, FrameData::IfThen { false_fixup: 0 })?;
        Ok(())
    }

    pub fn end_if_then(&mut self) -> BuildResult<()> {
        self.end_operation(operations::IF_THEN)
    }

    pub fn begin_if_then_else(&mut self) -> BuildResult<()> {
        self.begin_operation(
            operations::IF_THEN_ELSE,
            FrameData::IfThenElse {
                false_fixup: 0,
                end_fixup: 0,
            },
        )?;
        Ok(())
    }

    pub fn end_if_then_else(&mut self) -> BuildResult<()> {
        self.end_operation(operations::IF_THEN_ELSE)
    }

    pub fn begin_conditional(&mut self) -> BuildResult<()> {
        self.begin_operation(
            operations::CONDITIONAL,
            FrameData::Conditional {
                false_fixup: 0,
                end_fixup: 0,
                then_bci: 0,
                else_bci: 0,
            },
        )?;
        Ok(())
    }

    pub fn end_conditional(&mut self) -> BuildResult<()> {
        self.end_operation(operations::CONDITIONAL)
    }

    pub fn begin_while(&mut self) -> BuildResult<()> {
        self.before_child()?;
        let start = self.buffer.len();
        self.buffer.mark_boundary(start);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.op_stack.push(OperationFrame::new(
            operations::WHILE,
            seq,
            start,
            FrameData::While {
                start_bci: start,
                end_fixup: 0,
            },
        ));
        Ok(())
    }

    pub fn end_while(&mut self) -> BuildResult<()> {
        self.end_operation(operations::WHILE)
    }

    pub fn begin_try_catch(&mut self, exc: Local) -> BuildResult<()> {
        self.before_child()?;
        let start = self.buffer.len();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.op_stack.push(OperationFrame::new(
            operations::TRY_CATCH,
            seq,
            start,
            FrameData::TryCatch {
                try_start: start,
                start_sp: self.cur_stack,
                exc_local: exc.0,
                end_fixup: 0,
                catch_start: 0,
            },
        ));
        Ok(())
    }

    pub fn end_try_catch(&mut self) -> BuildResult<()> {
        self.end_operation(operations::TRY_CATCH)
    }

    fn begin_finally_impl(&mut self, op_id: u16, exc_local: Option<u16>) -> BuildResult<()> {
        self.before_child()?;
        let start = self.buffer.len();
        let seq = self.next_seq;
        self.next_seq += 1;
        let ctx = self.push_finally_context(seq);
        self.op_stack.push(OperationFrame::new(
            op_id,
            seq,
            start,
            FrameData::FinallyTry {
                ctx,
                exc_local,
                body_start: 0,
                start_sp: 0,
            },
        ));
        Ok(())
    }

    /// Begin a `FinallyTry`. The **first child is the handler**; the
    /// remaining children are the guarded body.
    pub fn begin_finally_try(&mut self, exc: Local) -> BuildResult<()> {
        self.begin_finally_impl(operations::FINALLY_TRY, Some(exc.0))
    }

    pub fn end_finally_try(&mut self) -> BuildResult<()> {
        self.end_operation(operations::FINALLY_TRY)
    }

    /// `FinallyTry` without the uncaught-exception path.
    pub fn begin_finally_try_no_except(&mut self) -> BuildResult<()> {
        self.begin_finally_impl(operations::FINALLY_TRY_NO_EXCEPT, None)
    }

    pub fn end_finally_try_no_except(&mut self) -> BuildResult<()> {
        self.end_operation(operations::FINALLY_TRY_NO_EXCEPT)
    }

    pub fn begin_return(&mut self) -> BuildResult<()> {
        self.begin_operation(operations::RETURN, FrameData::Return)?;
        Ok(())
    }

    pub fn end_return(&mut self) -> BuildResult<()> {
        self.end_operation(operations::RETURN)
    }

    /// Return without a value: runs enclosing finally handlers, then
    /// returns `Null`.
    pub fn emit_return(&mut self) -> BuildResult<()> {
        self.before_child()?;
        self.do_emit_leaves(None)?;
        let bci = self.emit_instr(opcodes::STORE_NULL, &[])?;
        self.emit_instr(opcodes::RETURN, &[])?;
        self.after_child(false, bci)
    }

    pub fn begin_yield(&mut self) -> BuildResult<()> {
        self.begin_operation(operations::YIELD, FrameData::Yield)?;
        Ok(())
    }

    pub fn end_yield(&mut self) -> BuildResult<()> {
        self.end_operation(operations::YIELD)
    }

    // =========================================================================
    // Leaf Operations
    // =========================================================================

    pub fn emit_load_constant(&mut self, value: Value) -> BuildResult<()> {
        self.before_child()?;
        let idx = self.constants.add(value);
        let bci = self.emit_instr(opcodes::LOAD_CONSTANT, &[idx])?;
        self.after_child(true, bci)
    }

    pub fn emit_load_argument(&mut self, index: u16) -> BuildResult<()> {
        self.before_child()?;
        let bci = self.emit_instr(opcodes::LOAD_ARGUMENT, &[index])?;
        self.after_child(true, bci)
    }

    pub fn emit_load_local(&mut self, local: Local) -> BuildResult<()> {
        self.before_child()?;
        let bci = self.emit_instr(opcodes::LOAD_LOCAL, &[local.0])?;
        self.after_child(true, bci)
    }

    pub fn begin_store_local(&mut self, local: Local) -> BuildResult<()> {
        self.begin_operation(operations::STORE_LOCAL, FrameData::StoreLocal { local: local.0 })?;
        Ok(())
    }

    pub fn end_store_local(&mut self) -> BuildResult<()> {
        self.end_operation(operations::STORE_LOCAL)
    }

    /// Load `local` from a materialized frame; the single child produces
    /// the frame.
    pub fn begin_load_local_materialized(&mut self, local: Local) -> BuildResult<()> {
        self.begin_operation(
            operations::LOAD_LOCAL_MAT,
            FrameData::LoadLocalMaterialized { local: local.0 },
        )?;
        Ok(())
    }

    pub fn end_load_local_materialized(&mut self) -> BuildResult<()> {
        self.end_operation(operations::LOAD_LOCAL_MAT)
    }

    /// Store into `local` of a materialized frame; children are the
    /// frame and the value.
    pub fn begin_store_local_materialized(&mut self, local: Local) -> BuildResult<()> {
        self.begin_operation(
            operations::STORE_LOCAL_MAT,
            FrameData::StoreLocalMaterialized { local: local.0 },
        )?;
        Ok(())
    }

    pub fn end_store_local_materialized(&mut self) -> BuildResult<()> {
        self.end_operation(operations::STORE_LOCAL_MAT)
    }

    // =========================================================================
    // Sources & Instrumentation
    // =========================================================================

    pub fn begin_source(&mut self, source: Source) -> BuildResult<()> {
        self.begin_operation(operations::SOURCE, FrameData::Source)?;
        let idx = match self.sources.iter().position(|s| *s == source) {
            Some(i) => i as u16,
            None => {
                self.sources.push(source);
                (self.sources.len() - 1) as u16
            }
        };
        self.source_stack.push(idx);
        Ok(())
    }

    pub fn end_source(&mut self) -> BuildResult<()> {
        self.end_operation(operations::SOURCE)
    }

    pub fn begin_source_section(&mut self, start: i32, length: i32) -> BuildResult<()> {
        let Some(&src) = self.source_stack.last() else {
            return Err(BuilderError::UnexpectedOperationEnd {
                expected: "Source".to_string(),
                actual: "SourceSection".to_string(),
            });
        };
        self.begin_operation(operations::SOURCE_SECTION, FrameData::SourceSection)?;
        let bci = self.buffer.len();
        self.buffer
            .push_source(SourceInfoEntry::new(bci, src, start, length));
        self.section_stack.push((start, length));
        Ok(())
    }

    pub fn end_source_section(&mut self) -> BuildResult<()> {
        self.end_operation(operations::SOURCE_SECTION)
    }

    pub fn begin_tag(&mut self, tag: u16) -> BuildResult<()> {
        if !self.model.has_tag(tag) {
            return Err(BuilderError::TagNotProvided { tag });
        }
        self.begin_operation(operations::INSTRUMENT_TAG, FrameData::InstrumentTag { tag })?;
        if self.config.instrumentation {
            self.emit_raw(opcodes::INSTRUMENTATION_ENTER, &[tag])?;
        }
        Ok(())
    }

    pub fn end_tag(&mut self) -> BuildResult<()> {
        self.end_operation(operations::INSTRUMENT_TAG)
    }

    // =========================================================================
    // Custom Operations
    // =========================================================================

    /// Begin a registered custom (or short-circuit) operation.
    pub fn begin_custom(&mut self, op: CustomOp) -> BuildResult<()> {
        self.begin_custom_with_locals(op, &[])
    }

    /// Begin a custom operation that routes its result into `locals`.
    pub fn begin_custom_with_locals(&mut self, op: CustomOp, locals: &[Local]) -> BuildResult<()> {
        let descr = self.model.operations.get(op.id());
        let kind = descr.kind;
        let instruction = descr
            .instruction
            .unwrap_or_else(|| unreachable!("custom operation without instruction"));
        match kind {
            OperationKind::CustomShortCircuit => {
                let idx = self.begin_operation(
                    op.id(),
                    FrameData::ShortCircuit {
                        instruction,
                        end_label: 0,
                    },
                )?;
                let seq = self.op_stack[idx].seq;
                let scope = self.current_handler_scope();
                let end_label = self.labels.create(seq, scope);
                let frame = &mut self.op_stack[idx];
                frame.declared_labels.push(end_label);
                frame.data = FrameData::ShortCircuit {
                    instruction,
                    end_label,
                };
            }
            _ => {
                self.begin_operation(
                    op.id(),
                    FrameData::Custom {
                        instruction,
                        locals: locals.iter().map(|l| l.0).collect(),
                        variadic_count: 0,
                        chunks: 0,
                    },
                )?;
            }
        }
        Ok(())
    }

    pub fn end_custom(&mut self, op: CustomOp) -> BuildResult<()> {
        self.end_operation(op.id())
    }

    /// Emit a zero-operand custom operation.
    pub fn emit_custom(&mut self, op: CustomOp) -> BuildResult<()> {
        self.begin_custom(op)?;
        self.end_custom(op)
    }
}

/// Deferred action while walking frames for `do_emit_leaves`.
enum LeaveAction {
    Finally(usize),
    Tag(u16),
}
