//! Declarative interpreter definition.
//!
//! A guest language describes its interpreter once: custom operations
//! (with execute functions for the cached and uncached tiers),
//! quickened forms, short-circuit operators, and instrumentation tags.
//! `build` freezes the definition into an [`InterpreterModel`] holding
//! the finished instruction and operation tables.
//!
//! ```
//! use std::sync::Arc;
//! use strata_core::{Arity, CustomOpSpec, InterpreterDef, Value};
//!
//! let mut def = InterpreterDef::new("calc");
//! let add = def.register_operation(CustomOpSpec::value_op(
//!     "Add",
//!     Arity::Fixed(2),
//!     Arc::new(|ops: &[Value]| {
//!         match (&ops[0], &ops[1]) {
//!             (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
//!             _ => Err(strata_core::OpError::Internal("type error".into())),
//!         }
//!     }),
//! ));
//! let model = def.build();
//! assert!(model.operations.get(add.id()).produces_value);
//! ```

use crate::instruction::{
    Arity, BoolConverter, CustomData, CustomExec, InstructionTable, LocalArgs, OperandGuard,
    ShortCircuitData,
};
use crate::operation::{OperationArity, OperationTable};
use std::sync::Arc;

/// Declaration of a custom simple operation.
#[derive(Clone)]
pub struct CustomOpSpec {
    pub name: Arc<str>,
    pub arity: Arity,
    pub returns_value: bool,
    pub local_args: LocalArgs,
    pub execute: CustomExec,
    /// Fallback for the uncached tier; defaults to `execute`.
    pub execute_uncached: Option<CustomExec>,
}

impl CustomOpSpec {
    /// A value-producing operation with no local-setter immediates.
    pub fn value_op(name: impl Into<Arc<str>>, arity: Arity, execute: CustomExec) -> Self {
        CustomOpSpec {
            name: name.into(),
            arity,
            returns_value: true,
            local_args: LocalArgs::None,
            execute,
            execute_uncached: None,
        }
    }

    /// A void operation whose result is routed into locals.
    pub fn local_setter_op(
        name: impl Into<Arc<str>>,
        arity: Arity,
        local_args: LocalArgs,
        execute: CustomExec,
    ) -> Self {
        CustomOpSpec {
            name: name.into(),
            arity,
            returns_value: false,
            local_args,
            execute,
            execute_uncached: None,
        }
    }
}

/// Declaration of a quickened form of a custom operation.
#[derive(Clone)]
pub struct QuickeningSpec {
    pub name: Arc<str>,
    pub guard: OperandGuard,
    pub execute: CustomExec,
}

/// Declaration of a short-circuit operator.
#[derive(Clone)]
pub struct ShortCircuitSpec {
    pub name: Arc<str>,
    /// Keep evaluating children while the converter yields this value
    /// (`true` for AND-style operators, `false` for OR-style).
    pub continue_when: bool,
    /// Boolean converter; defaults to `Value::is_truthy`.
    pub convert: Option<BoolConverter>,
}

/// Token identifying a registered custom operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomOp(u16);

impl CustomOp {
    /// The operation id in the model's operation table.
    #[inline]
    pub fn id(self) -> u16 {
        self.0
    }

    /// Reconstruct a token from a raw operation id (deserialization).
    #[inline]
    pub fn from_id(id: u16) -> CustomOp {
        CustomOp(id)
    }
}

// =============================================================================
// Definition
// =============================================================================

/// Mutable interpreter definition; freeze with [`build`](Self::build).
pub struct InterpreterDef {
    name: Arc<str>,
    instructions: InstructionTable,
    operations: OperationTable,
    tags: Vec<Arc<str>>,
}

impl InterpreterDef {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        InterpreterDef {
            name: name.into(),
            instructions: InstructionTable::with_builtins(),
            operations: OperationTable::with_builtins(),
            tags: Vec::new(),
        }
    }

    /// Register a custom simple operation and its instruction.
    pub fn register_operation(&mut self, spec: CustomOpSpec) -> CustomOp {
        assert!(
            spec.local_args == LocalArgs::None || !spec.returns_value,
            "local-setter operations are void: their result is routed to locals"
        );
        let uncached = spec.execute_uncached.unwrap_or_else(|| spec.execute.clone());
        let instr = self.instructions.register_custom(
            spec.name.clone(),
            CustomData {
                arity: spec.arity,
                returns_value: spec.returns_value,
                local_args: spec.local_args,
                execute: spec.execute,
                execute_uncached: uncached,
            },
        );
        let arity = match spec.arity {
            Arity::Fixed(n) => OperationArity::Fixed(n),
            Arity::Variadic(n) => OperationArity::Variadic(n),
        };
        let op = self
            .operations
            .register_custom(spec.name, arity, spec.returns_value, instr);
        CustomOp(op)
    }

    /// Register a quickened form of `op`.
    pub fn register_quickening(&mut self, op: CustomOp, spec: QuickeningSpec) {
        let instr = self
            .operations
            .get(op.id())
            .instruction
            .unwrap_or_else(|| unreachable!("custom operation without instruction"));
        self.instructions
            .register_quickening(instr, spec.name, spec.guard, spec.execute);
    }

    /// Register a short-circuit operator.
    pub fn register_short_circuit(&mut self, spec: ShortCircuitSpec) -> CustomOp {
        let convert = spec
            .convert
            .unwrap_or_else(|| Arc::new(|v: &crate::Value| v.is_truthy()));
        let instr = self.instructions.register_short_circuit(
            spec.name.clone(),
            ShortCircuitData {
                continue_when: spec.continue_when,
                convert,
            },
        );
        let op = self.operations.register_short_circuit(spec.name, instr);
        CustomOp(op)
    }

    /// Register an instrumentation tag; returns its id.
    pub fn register_tag(&mut self, name: impl Into<Arc<str>>) -> u16 {
        let id = self.tags.len() as u16;
        self.tags.push(name.into());
        id
    }

    /// Freeze the definition.
    pub fn build(self) -> Arc<InterpreterModel> {
        Arc::new(InterpreterModel {
            name: self.name,
            instructions: self.instructions,
            operations: self.operations,
            tags: self.tags,
        })
    }
}

/// Frozen interpreter model shared by builders and roots.
pub struct InterpreterModel {
    pub name: Arc<str>,
    pub instructions: InstructionTable,
    pub operations: OperationTable,
    pub tags: Vec<Arc<str>>,
}

impl InterpreterModel {
    #[inline]
    pub fn has_tag(&self, tag: u16) -> bool {
        (tag as usize) < self.tags.len()
    }

    pub fn tag_name(&self, tag: u16) -> Option<&Arc<str>> {
        self.tags.get(tag as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn test_register_and_build() {
        let mut def = InterpreterDef::new("t");
        let exec: CustomExec = Arc::new(|_: &[Value]| Ok(Value::Null));
        let op = def.register_operation(CustomOpSpec::value_op("Nop", Arity::Fixed(0), exec));
        let tag = def.register_tag("statement");
        let model = def.build();
        assert_eq!(&*model.name, "t");
        assert!(model.has_tag(tag));
        assert!(!model.has_tag(tag + 1));
        assert!(model.operations.get(op.id()).instruction.is_some());
    }
}
