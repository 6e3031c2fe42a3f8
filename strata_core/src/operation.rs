//! Operation descriptors and the operation table.
//!
//! Operations are the user-visible constructs of the builder API
//! (`begin_*`/`end_*`/`emit_*`). Each descriptor records the child
//! grammar the builder enforces: arity, which children must produce
//! values, transparency (does the operation pass its last child's value
//! through), and the instruction a leaf or custom operation emits.

use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

/// Builtin operation ids. Custom operations are assigned ids starting
/// at [`FIRST_CUSTOM`](operations::FIRST_CUSTOM).
pub mod operations {
    pub const ROOT: u16 = 0;
    pub const BLOCK: u16 = 1;
    pub const IF_THEN: u16 = 2;
    pub const IF_THEN_ELSE: u16 = 3;
    pub const CONDITIONAL: u16 = 4;
    pub const WHILE: u16 = 5;
    pub const TRY_CATCH: u16 = 6;
    pub const FINALLY_TRY: u16 = 7;
    pub const FINALLY_TRY_NO_EXCEPT: u16 = 8;
    pub const RETURN: u16 = 9;
    pub const LABEL: u16 = 10;
    pub const BRANCH: u16 = 11;
    pub const LOAD_CONSTANT: u16 = 12;
    pub const LOAD_ARGUMENT: u16 = 13;
    pub const LOAD_LOCAL: u16 = 14;
    pub const STORE_LOCAL: u16 = 15;
    pub const LOAD_LOCAL_MAT: u16 = 16;
    pub const STORE_LOCAL_MAT: u16 = 17;
    pub const YIELD: u16 = 18;
    pub const SOURCE: u16 = 19;
    pub const SOURCE_SECTION: u16 = 20;
    pub const INSTRUMENT_TAG: u16 = 21;
    pub const FIRST_CUSTOM: u16 = 32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Root,
    Block,
    IfThen,
    IfThenElse,
    Conditional,
    While,
    TryCatch,
    FinallyTry,
    FinallyTryNoExcept,
    Return,
    Label,
    Branch,
    LoadConstant,
    LoadArgument,
    LoadLocal,
    StoreLocal,
    LoadLocalMaterialized,
    StoreLocalMaterialized,
    Yield,
    Source,
    SourceSection,
    InstrumentTag,
    CustomSimple,
    CustomShortCircuit,
}

/// Child-count contract of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationArity {
    Fixed(u8),
    /// At least `min` children.
    Variadic(u8),
}

/// Immutable descriptor of one operation.
#[derive(Debug, Clone)]
pub struct OperationDescr {
    pub id: u16,
    pub name: Arc<str>,
    pub kind: OperationKind,
    pub arity: OperationArity,
    /// Per fixed child index: must that child produce a value?
    pub value_children: SmallVec<[bool; 4]>,
    /// Value requirement for variadic tail children.
    pub variadic_values: bool,
    /// Transparent operations pass their last child's value through and
    /// pop the values of earlier children.
    pub is_transparent: bool,
    /// Does the operation itself push a value? (Ignored for transparent
    /// operations, whose result is dynamic.)
    pub produces_value: bool,
    /// Instruction emitted by custom operations.
    pub instruction: Option<u16>,
}

impl OperationDescr {
    /// Value requirement for child `index`.
    pub fn child_must_be_value(&self, index: u32) -> bool {
        match self.value_children.get(index as usize) {
            Some(&v) => v,
            None => self.variadic_values,
        }
    }
}

// =============================================================================
// Operation Table
// =============================================================================

/// Dense table of operation descriptors. Gap ids below `FIRST_CUSTOM`
/// hold inert `Block` placeholders so every id resolves.
pub struct OperationTable {
    ops: Vec<OperationDescr>,
}

fn op(
    id: u16,
    name: &str,
    kind: OperationKind,
    arity: OperationArity,
    value_children: SmallVec<[bool; 4]>,
    is_transparent: bool,
    produces_value: bool,
) -> OperationDescr {
    OperationDescr {
        id,
        name: name.into(),
        kind,
        arity,
        value_children,
        variadic_values: false,
        is_transparent,
        produces_value,
        instruction: None,
    }
}

impl OperationTable {
    pub fn with_builtins() -> Self {
        use operations::*;
        use OperationArity::{Fixed, Variadic};
        use OperationKind as K;

        let placeholder = op(0, "unused", K::Block, Fixed(0), smallvec![], false, false);
        let mut ops = vec![placeholder; FIRST_CUSTOM as usize];
        let mut set = |d: OperationDescr| {
            let idx = d.id as usize;
            ops[idx] = d;
        };

        set(op(ROOT, "Root", K::Root, Variadic(0), smallvec![], true, false));
        set(op(BLOCK, "Block", K::Block, Variadic(0), smallvec![], true, false));
        set(op(IF_THEN, "IfThen", K::IfThen, Fixed(2), smallvec![true, false], false, false));
        set(op(
            IF_THEN_ELSE,
            "IfThenElse",
            K::IfThenElse,
            Fixed(3),
            smallvec![true, false, false],
            false,
            false,
        ));
        set(op(
            CONDITIONAL,
            "Conditional",
            K::Conditional,
            Fixed(3),
            smallvec![true, true, true],
            false,
            true,
        ));
        set(op(WHILE, "While", K::While, Fixed(2), smallvec![true, false], false, false));
        set(op(
            TRY_CATCH,
            "TryCatch",
            K::TryCatch,
            Fixed(2),
            smallvec![false, false],
            false,
            false,
        ));
        // Child 0 is the handler; the remaining children are the guarded
        // body and behave like Block children.
        set(op(
            FINALLY_TRY,
            "FinallyTry",
            K::FinallyTry,
            Variadic(2),
            smallvec![false],
            false,
            false,
        ));
        set(op(
            FINALLY_TRY_NO_EXCEPT,
            "FinallyTryNoExcept",
            K::FinallyTryNoExcept,
            Variadic(2),
            smallvec![false],
            false,
            false,
        ));
        set(op(RETURN, "Return", K::Return, Fixed(1), smallvec![true], false, false));
        set(op(LABEL, "Label", K::Label, Fixed(0), smallvec![], false, false));
        set(op(BRANCH, "Branch", K::Branch, Fixed(0), smallvec![], false, false));
        set(op(
            LOAD_CONSTANT,
            "LoadConstant",
            K::LoadConstant,
            Fixed(0),
            smallvec![],
            false,
            true,
        ));
        set(op(
            LOAD_ARGUMENT,
            "LoadArgument",
            K::LoadArgument,
            Fixed(0),
            smallvec![],
            false,
            true,
        ));
        set(op(LOAD_LOCAL, "LoadLocal", K::LoadLocal, Fixed(0), smallvec![], false, true));
        set(op(
            STORE_LOCAL,
            "StoreLocal",
            K::StoreLocal,
            Fixed(1),
            smallvec![true],
            false,
            false,
        ));
        set(op(
            LOAD_LOCAL_MAT,
            "LoadLocalMaterialized",
            K::LoadLocalMaterialized,
            Fixed(1),
            smallvec![true],
            false,
            true,
        ));
        set(op(
            STORE_LOCAL_MAT,
            "StoreLocalMaterialized",
            K::StoreLocalMaterialized,
            Fixed(2),
            smallvec![true, true],
            false,
            false,
        ));
        set(op(YIELD, "Yield", K::Yield, Fixed(1), smallvec![true], false, true));
        set(op(SOURCE, "Source", K::Source, Variadic(0), smallvec![], true, false));
        set(op(
            SOURCE_SECTION,
            "SourceSection",
            K::SourceSection,
            Variadic(0),
            smallvec![],
            true,
            false,
        ));
        set(op(
            INSTRUMENT_TAG,
            "InstrumentTag",
            K::InstrumentTag,
            Variadic(0),
            smallvec![],
            true,
            false,
        ));

        OperationTable { ops }
    }

    /// Register a custom simple operation; returns its operation id.
    pub fn register_custom(
        &mut self,
        name: Arc<str>,
        arity: OperationArity,
        produces_value: bool,
        instruction: u16,
    ) -> u16 {
        let id = self.ops.len() as u16;
        self.ops.push(OperationDescr {
            id,
            name,
            kind: OperationKind::CustomSimple,
            arity,
            value_children: smallvec![],
            variadic_values: true,
            is_transparent: false,
            produces_value,
            instruction: Some(instruction),
        });
        id
    }

    /// Register a custom short-circuit operation; returns its id.
    pub fn register_short_circuit(&mut self, name: Arc<str>, instruction: u16) -> u16 {
        let id = self.ops.len() as u16;
        self.ops.push(OperationDescr {
            id,
            name,
            kind: OperationKind::CustomShortCircuit,
            arity: OperationArity::Variadic(1),
            value_children: smallvec![],
            variadic_values: true,
            is_transparent: false,
            produces_value: true,
            instruction: Some(instruction),
        });
        id
    }

    #[inline]
    pub fn get(&self, id: u16) -> &OperationDescr {
        &self.ops[id as usize]
    }

    #[inline]
    pub fn lookup(&self, id: u16) -> Option<&OperationDescr> {
        self.ops.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_contracts() {
        let table = OperationTable::with_builtins();
        let if_then = table.get(operations::IF_THEN);
        assert!(if_then.child_must_be_value(0));
        assert!(!if_then.child_must_be_value(1));
        assert_eq!(if_then.arity, OperationArity::Fixed(2));

        let root = table.get(operations::ROOT);
        assert!(root.is_transparent);
        assert!(!root.child_must_be_value(5));
    }

    #[test]
    fn test_custom_children_are_values() {
        let mut table = OperationTable::with_builtins();
        let id = table.register_custom("Add".into(), OperationArity::Fixed(2), true, 40);
        assert_eq!(id, operations::FIRST_CUSTOM);
        assert!(table.get(id).child_must_be_value(1));
    }
}
