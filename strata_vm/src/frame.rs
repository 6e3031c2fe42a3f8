//! Execution frame: arguments, locals, and the operand stack.

use smallvec::SmallVec;
use std::sync::Arc;
use strata_compiler::RootProgram;
use strata_core::{MaterializedFrame, Value, VmError, VmResult};

/// Maximum guest recursion depth before `StackOverflow`.
pub const MAX_RECURSION_DEPTH: usize = 1000;

/// One activation of a root program.
///
/// The operand stack is pre-sized to the builder's high-water mark, so
/// pushes on a well-formed program never reallocate.
pub struct Frame {
    pub args: Vec<Value>,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    /// Resume point when a dispatch loop exits for a tier change.
    pub bci: u16,
    /// Value delivered by `Return`/`Yield`.
    pub result: Value,
}

impl Frame {
    pub fn new(root: &Arc<RootProgram>, args: &[Value]) -> Self {
        Frame {
            args: args.to_vec(),
            locals: vec![Value::Null; root.num_locals() as usize],
            stack: Vec::with_capacity(root.max_stack() as usize),
            bci: 0,
            result: Value::Null,
        }
    }

    /// Rebuild a frame from coroutine state.
    pub fn resumed(locals: Vec<Value>, stack: Vec<Value>) -> Self {
        Frame {
            args: Vec::new(),
            locals,
            stack,
            bci: 0,
            result: Value::Null,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::internal("operand stack underflow"))
    }

    /// Pop `n` values, preserving push order.
    pub fn pop_n(&mut self, n: usize) -> VmResult<SmallVec<[Value; 8]>> {
        if self.stack.len() < n {
            return Err(VmError::internal("operand stack underflow"));
        }
        Ok(self.stack.drain(self.stack.len() - n..).collect())
    }

    #[inline]
    pub fn peek(&self) -> VmResult<&Value> {
        self.stack
            .last()
            .ok_or_else(|| VmError::internal("operand stack underflow"))
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn local(&self, slot: u16) -> VmResult<&Value> {
        self.locals
            .get(slot as usize)
            .ok_or_else(|| VmError::internal("local slot out of range"))
    }

    #[inline]
    pub fn set_local(&mut self, slot: u16, value: Value) -> VmResult<()> {
        match self.locals.get_mut(slot as usize) {
            Some(l) => {
                *l = value;
                Ok(())
            }
            None => Err(VmError::internal("local slot out of range")),
        }
    }

    /// Current value of each local, in creation order (slow path,
    /// frame introspection).
    pub fn get_locals(&self) -> &[Value] {
        &self.locals
    }

    /// Snapshot the locals into a heap frame usable by the materialized
    /// local operations.
    pub fn materialize(&self) -> MaterializedFrame {
        MaterializedFrame::from_locals(self.locals.clone())
    }
}
