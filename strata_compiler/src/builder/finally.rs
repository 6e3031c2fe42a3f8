//! Finally-handler duplication.
//!
//! A `FinallyTry` parses its handler first. On entry, the builder's
//! context-sensitive state (buffer, stack heights, unresolved-branch
//! registry) is swapped out for a fresh one, so the handler body is
//! written into its own buffer starting at bci 0. When the handler
//! child ends, that buffer is frozen into a self-contained subprogram
//! and the saved state is restored.
//!
//! The frozen handler is then replayed inline at every exit path of the
//! guarded body: normal completion, the uncaught-exception rethrow path,
//! and every `Branch`/`Return` that crosses the `FinallyTry` boundary.
//! Replay relocates handler-relative branch targets by the copy offset,
//! re-registers branches to outer labels from the reverse map, and
//! allocates fresh node/profile slots and continuation constants so
//! copies never share per-site state.

use crate::builder::Builder;
use crate::bytecode::buffer::{BytecodeBuffer, HANDLER_ENTRY_WORDS};
use crate::bytecode::labels::{BranchRegistry, UnresolvedSite};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use strata_core::{
    BuildResult, BuilderError, ContinuationLocation, ImmediateKind, InstructionKind,
    SourceInfoEntry, Value, UNINIT_BCI,
};

/// Context-sensitive builder state captured on `begin_finally_try`.
#[derive(Debug)]
pub(crate) struct SavedBuilderState {
    pub buffer: BytecodeBuffer,
    pub cur_stack: u16,
    pub max_stack: u16,
    pub unresolved: BranchRegistry,
}

/// A frozen finally handler: a self-contained subprogram plus the
/// relocation metadata its replays need.
#[derive(Debug)]
pub(crate) struct FinallyHandler {
    pub bc: Vec<u16>,
    pub source_info: Vec<SourceInfoEntry>,
    pub ex_handlers: Vec<i32>,
    pub boundaries: Vec<bool>,
    /// Reverse map: branch immediates (relative to the handler) still
    /// waiting for outer labels, with the relative stack height at the
    /// branch site.
    pub unresolved: Vec<(u32, UnresolvedSite)>,
    /// Immediate positions whose targets are relative to the handler.
    pub relative: FxHashSet<u16>,
    pub max_stack: u16,
}

/// Lifecycle state of one `FinallyTry`.
#[derive(Debug)]
pub(crate) struct FinallyTryContext {
    /// Sequence number of the owning `FinallyTry` frame.
    pub seq: u32,
    /// Present while the handler body is under construction.
    pub saved: Option<SavedBuilderState>,
    /// Relative branch immediates collected during construction.
    pub relative: FxHashSet<u16>,
    /// Present once the handler child ended.
    pub handler: Option<Arc<FinallyHandler>>,
}

impl Builder {
    /// Sequence number of the innermost handler under construction.
    pub(crate) fn current_handler_scope(&self) -> Option<u32> {
        self.handler_stack
            .last()
            .map(|&idx| self.finally_ctxs[idx].seq)
    }

    /// Record that the immediate at `imm` holds a target relative to the
    /// handler currently under construction, if any.
    pub(crate) fn mark_relative_if_in_handler(&mut self, imm: u16) {
        if let Some(&idx) = self.handler_stack.last() {
            self.finally_ctxs[idx].relative.insert(imm);
        }
    }

    /// Swap in a fresh buffer and push a new context. Called by
    /// `begin_finally_try` after the frame is pushed.
    pub(crate) fn push_finally_context(&mut self, seq: u32) -> usize {
        let tracing = self.buffer.is_tracing();
        let saved = SavedBuilderState {
            buffer: std::mem::replace(&mut self.buffer, BytecodeBuffer::new(tracing)),
            cur_stack: std::mem::replace(&mut self.cur_stack, 0),
            max_stack: std::mem::replace(&mut self.max_stack, 0),
            unresolved: std::mem::take(&mut self.unresolved),
        };
        let idx = self.finally_ctxs.len();
        self.finally_ctxs.push(FinallyTryContext {
            seq,
            saved: Some(saved),
            relative: FxHashSet::default(),
            handler: None,
        });
        self.handler_stack.push(idx);
        idx
    }

    /// Freeze the handler buffer and restore the captured state. Called
    /// when the handler child (child 0) ends.
    pub(crate) fn freeze_finally_handler(&mut self, ctx_idx: usize) -> BuildResult<()> {
        if self.cur_stack != 0 {
            return Err(BuilderError::UnbalancedStack {
                message: format!(
                    "finally handler left {} values on the stack",
                    self.cur_stack
                ),
            });
        }
        self.handler_stack.pop();

        let unresolved = self.unresolved.drain_all();
        let relative = std::mem::take(&mut self.finally_ctxs[ctx_idx].relative);
        let handler_max = self.max_stack;

        let saved = self.finally_ctxs[ctx_idx]
            .saved
            .take()
            .unwrap_or_else(|| unreachable!("finally context frozen twice"));
        let handler_buffer = std::mem::replace(&mut self.buffer, saved.buffer);
        self.cur_stack = saved.cur_stack;
        self.max_stack = saved.max_stack;
        self.unresolved = saved.unresolved;

        let (bc, source_info, ex_handlers, boundaries) = handler_buffer.into_parts();
        self.finally_ctxs[ctx_idx].handler = Some(Arc::new(FinallyHandler {
            bc,
            source_info,
            ex_handlers,
            boundaries,
            unresolved,
            relative,
            max_stack: handler_max,
        }));
        Ok(())
    }

    /// Replay the frozen handler of `ctx_idx` inline at the current bci.
    pub(crate) fn emit_finally_handler(&mut self, ctx_idx: usize) -> BuildResult<()> {
        let Some(handler) = self.finally_ctxs[ctx_idx].handler.clone() else {
            // Handler still under construction: an exit from inside the
            // handler itself does not re-run it.
            return Ok(());
        };

        let off = self.buffer.len();
        let base = self.cur_stack;
        let add_off = |v: u16| -> BuildResult<u16> {
            (off as u32 + v as u32)
                .try_into()
                .ok()
                .filter(|&t: &u16| t != UNINIT_BCI)
                .ok_or(BuilderError::BytecodeOverflow)
        };

        let mut r = 0usize;
        while r < handler.bc.len() {
            let opcode = handler.bc[r];
            let descr = self.model.instructions.get(opcode);
            let kind = descr.kind;
            let immediates = descr.immediates.clone();
            self.buffer.push_word(opcode)?;
            for (k, imm_kind) in immediates.iter().enumerate() {
                let p = (r + 1 + k) as u16;
                let old = handler.bc[p as usize];
                let new = match imm_kind {
                    ImmediateKind::BytecodeIndex => {
                        if old == UNINIT_BCI {
                            // Outer-label branch; re-registered below
                            // from the reverse map.
                            old
                        } else if handler.relative.contains(&p) {
                            let target = add_off(old)?;
                            self.buffer.mark_boundary(target);
                            self.mark_relative_if_in_handler(add_off(p)?);
                            target
                        } else {
                            old
                        }
                    }
                    ImmediateKind::Constant if kind == InstructionKind::Yield => {
                        let loc = match self.constants.get(old) {
                            Value::Continuation(loc) => **loc,
                            _ => ContinuationLocation { bci: 0, sp: 0 },
                        };
                        let fresh = ContinuationLocation {
                            bci: add_off(loc.bci)?,
                            sp: base + loc.sp,
                        };
                        self.constants.add(Value::Continuation(Arc::new(fresh)))
                    }
                    ImmediateKind::Node => self.alloc_node(),
                    ImmediateKind::Profile => self.alloc_profile(),
                    _ => old,
                };
                self.buffer.push_word(new)?;
            }
            r += 1 + immediates.len();
        }

        // Branches to outer labels: one registration per copy. A label
        // that resolved since the freeze is patched directly.
        for (label, site) in &handler.unresolved {
            let imm = add_off(site.imm_bci)?;
            let height = base + site.stack_height;
            let info = self.labels.get(*label);
            if info.is_emitted() {
                if info.height != height {
                    return Err(BuilderError::UnbalancedBranch {
                        label: *label,
                        site_height: height,
                        label_height: info.height,
                    });
                }
                let target = info.bci;
                self.buffer.patch(imm, target);
            } else {
                self.register_branch_site(*label, imm, height);
            }
        }

        // Merge parallel arrays at the copy offset.
        for chunk in handler.ex_handlers.chunks(HANDLER_ENTRY_WORDS) {
            self.buffer.push_handler(
                add_off(chunk[0] as u16)?,
                add_off(chunk[1] as u16)?,
                add_off(chunk[2] as u16)?,
                base + chunk[3] as u16,
                chunk[4] as u16,
            );
        }
        for entry in &handler.source_info {
            let bci = add_off(entry.bci())?;
            self.buffer.push_source(entry.at_bci(bci));
        }
        for (i, flag) in handler.boundaries.iter().enumerate() {
            if *flag {
                self.buffer.mark_boundary(add_off(i as u16)?);
            }
        }

        self.max_stack = self.max_stack.max(base + handler.max_stack);
        Ok(())
    }
}
