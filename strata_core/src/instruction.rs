//! Instruction descriptors and the instruction table.
//!
//! An instruction is the unit of dispatch: one 16-bit opcode word
//! followed by its immediates, one word each. The table is immutable
//! once an [`InterpreterModel`](crate::InterpreterModel) is built and is
//! shared by the builder (which needs lengths, immediates, and stack
//! effects) and the dispatch loop (which needs execute functions and
//! quickening relations).
//!
//! Quickening is a pair of lookups keyed by opcode id, not virtual
//! calls: `apply_quickening` walks the base instruction's family for the
//! first member whose guard accepts the observed operands, and
//! `undo_quickening` maps any family member back to its base.

use crate::error::OpError;
use crate::value::Value;
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

/// Builtin opcode ids. Custom instructions are assigned ids starting at
/// [`FIRST_CUSTOM`](opcodes::FIRST_CUSTOM).
pub mod opcodes {
    /// Id 0 so that zeroed memory dispatches to a hard failure.
    pub const TRAP: u16 = 0;
    pub const BRANCH: u16 = 1;
    pub const BRANCH_BACKWARD: u16 = 2;
    pub const BRANCH_FALSE: u16 = 3;
    pub const LOAD_CONSTANT: u16 = 4;
    pub const LOAD_ARGUMENT: u16 = 5;
    pub const LOAD_LOCAL: u16 = 6;
    pub const STORE_LOCAL: u16 = 7;
    pub const STORE_LOCAL_INT: u16 = 8;
    pub const STORE_LOCAL_FLOAT: u16 = 9;
    pub const LOAD_LOCAL_MAT: u16 = 10;
    pub const STORE_LOCAL_MAT: u16 = 11;
    pub const POP: u16 = 12;
    pub const DUP: u16 = 13;
    pub const STORE_NULL: u16 = 14;
    pub const RETURN: u16 = 15;
    pub const THROW: u16 = 16;
    pub const YIELD: u16 = 17;
    pub const MERGE_CONDITIONAL: u16 = 18;
    pub const LOAD_VARIADIC: u16 = 19;
    pub const MERGE_VARIADIC: u16 = 20;
    pub const INSTRUMENTATION_ENTER: u16 = 21;
    pub const INSTRUMENTATION_EXIT: u16 = 22;
    pub const INSTRUMENTATION_LEAVE: u16 = 23;
    /// First id handed out to custom instructions.
    pub const FIRST_CUSTOM: u16 = 32;
}

/// Kind of an immediate word stored after an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateKind {
    /// Absolute bytecode index (branch target, merge operand bci).
    BytecodeIndex,
    /// Generic small integer (local slot, argument index, count, tag).
    Integer,
    /// Constant-pool index.
    Constant,
    /// Local slot that receives the instruction's result.
    LocalSetter,
    /// First slot of a contiguous result range.
    LocalSetterRangeStart,
    /// Length of a contiguous result range.
    LocalSetterRangeLength,
    /// Cached-data slot for per-site specialization state.
    Node,
    /// Branch-profile slot.
    Profile,
}

/// Structural kind of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Branch,
    BranchBackward,
    BranchFalse,
    LoadConstant,
    LoadLocal,
    StoreLocal,
    LoadLocalMaterialized,
    StoreLocalMaterialized,
    LoadArgument,
    Pop,
    Dup,
    Return,
    Throw,
    Yield,
    Trap,
    MergeConditional,
    StoreNull,
    LoadVariadic,
    MergeVariadic,
    Custom,
    CustomShortCircuit,
    InstrumentationEnter,
    InstrumentationExit,
    InstrumentationLeave,
}

impl InstructionKind {
    /// Whether the instruction's first immediate is a relocatable branch
    /// target. Used by the finally-handler replay.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            InstructionKind::Branch
                | InstructionKind::BranchBackward
                | InstructionKind::BranchFalse
                | InstructionKind::CustomShortCircuit
        )
    }
}

/// Execute function of a custom instruction: receives the popped
/// operands in child order, returns the produced value.
pub type CustomExec = Arc<dyn Fn(&[Value]) -> Result<Value, OpError> + Send + Sync>;

/// Quickening guard: accepts the operands iff the specialized execute
/// covers them.
pub type OperandGuard = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Boolean converter of a short-circuit operator.
pub type BoolConverter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Operand arity of a custom instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u8),
    /// Fixed prefix followed by a variadic tail, collapsed by
    /// `LoadVariadic`/`MergeVariadic` into a single list operand.
    Variadic(u8),
}

impl Arity {
    /// Number of operands popped at dispatch (the variadic tail counts
    /// as one list operand).
    pub fn operand_count(self) -> usize {
        match self {
            Arity::Fixed(n) => n as usize,
            Arity::Variadic(n) => n as usize + 1,
        }
    }
}

/// How a custom instruction routes its result into locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalArgs {
    None,
    /// One `LocalSetter` immediate; the result is stored to that slot.
    Single,
    /// `LocalSetterRangeStart`/`Length` immediates; the result list is
    /// distributed across the slots.
    Range,
}

/// Payload of a `Custom` instruction (shared by quickened members).
#[derive(Clone)]
pub struct CustomData {
    pub arity: Arity,
    pub returns_value: bool,
    pub local_args: LocalArgs,
    pub execute: CustomExec,
    pub execute_uncached: CustomExec,
}

/// Payload of a `CustomShortCircuit` instruction.
#[derive(Clone)]
pub struct ShortCircuitData {
    /// Keep evaluating children while the converter yields this value.
    pub continue_when: bool,
    pub convert: BoolConverter,
}

/// Immutable descriptor of one opcode.
#[derive(Clone)]
pub struct InstructionDescr {
    pub id: u16,
    pub name: Arc<str>,
    pub kind: InstructionKind,
    pub immediates: SmallVec<[ImmediateKind; 4]>,
    /// `None` for instructions whose effect depends on immediates or on
    /// the custom signature; the builder derives those.
    pub stack_effect: Option<i8>,
    /// Base opcode when this is a quickened form.
    pub quickening_base: Option<u16>,
    /// Family members when this is a base with quickenings.
    pub quickened: Vec<u16>,
    /// Guard admitting this quickened form, if any.
    pub guard: Option<OperandGuard>,
    pub custom: Option<CustomData>,
    pub short_circuit: Option<ShortCircuitData>,
}

impl std::fmt::Debug for InstructionDescr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionDescr")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("immediates", &self.immediates)
            .field("quickening_base", &self.quickening_base)
            .finish()
    }
}

impl InstructionDescr {
    /// Instruction length in 16-bit words.
    #[inline]
    pub fn length(&self) -> u16 {
        1 + self.immediates.len() as u16
    }
}

// =============================================================================
// Instruction Table
// =============================================================================

/// The dense opcode table. Ids below `FIRST_CUSTOM` are builtins (gaps
/// hold `Trap` descriptors so every id decodes); custom ids follow
/// contiguously in registration order.
pub struct InstructionTable {
    instrs: Vec<InstructionDescr>,
}

fn descr(
    id: u16,
    name: &str,
    kind: InstructionKind,
    immediates: SmallVec<[ImmediateKind; 4]>,
    stack_effect: Option<i8>,
) -> InstructionDescr {
    InstructionDescr {
        id,
        name: name.into(),
        kind,
        immediates,
        stack_effect,
        quickening_base: None,
        quickened: Vec::new(),
        guard: None,
        custom: None,
        short_circuit: None,
    }
}

impl InstructionTable {
    /// Build the builtin portion of the table.
    pub fn with_builtins() -> Self {
        use opcodes::*;
        use ImmediateKind::*;
        use InstructionKind as K;

        let trap = descr(TRAP, "trap", K::Trap, smallvec![], Some(0));
        let mut instrs = vec![trap; FIRST_CUSTOM as usize];

        let mut set = |d: InstructionDescr| {
            let idx = d.id as usize;
            instrs[idx] = d;
        };

        set(descr(BRANCH, "branch", K::Branch, smallvec![BytecodeIndex], Some(0)));
        set(descr(
            BRANCH_BACKWARD,
            "branch.backward",
            K::BranchBackward,
            smallvec![BytecodeIndex],
            Some(0),
        ));
        set(descr(
            BRANCH_FALSE,
            "branch.false",
            K::BranchFalse,
            smallvec![BytecodeIndex, Profile],
            Some(-1),
        ));
        set(descr(LOAD_CONSTANT, "load.constant", K::LoadConstant, smallvec![Constant], Some(1)));
        set(descr(LOAD_ARGUMENT, "load.argument", K::LoadArgument, smallvec![Integer], Some(1)));
        set(descr(LOAD_LOCAL, "load.local", K::LoadLocal, smallvec![Integer], Some(1)));

        let mut store_local =
            descr(STORE_LOCAL, "store.local", K::StoreLocal, smallvec![Integer], Some(-1));
        store_local.quickened = vec![STORE_LOCAL_INT, STORE_LOCAL_FLOAT];
        set(store_local);

        let mut store_int =
            descr(STORE_LOCAL_INT, "store.local.int", K::StoreLocal, smallvec![Integer], Some(-1));
        store_int.quickening_base = Some(STORE_LOCAL);
        store_int.guard = Some(Arc::new(|ops: &[Value]| {
            matches!(ops, [Value::Int(_)])
        }));
        set(store_int);

        let mut store_float = descr(
            STORE_LOCAL_FLOAT,
            "store.local.float",
            K::StoreLocal,
            smallvec![Integer],
            Some(-1),
        );
        store_float.quickening_base = Some(STORE_LOCAL);
        store_float.guard = Some(Arc::new(|ops: &[Value]| {
            matches!(ops, [Value::Float(_)])
        }));
        set(store_float);

        set(descr(
            LOAD_LOCAL_MAT,
            "load.local.mat",
            K::LoadLocalMaterialized,
            smallvec![Integer],
            Some(0),
        ));
        set(descr(
            STORE_LOCAL_MAT,
            "store.local.mat",
            K::StoreLocalMaterialized,
            smallvec![Integer],
            Some(-2),
        ));
        set(descr(POP, "pop", K::Pop, smallvec![], Some(-1)));
        set(descr(DUP, "dup", K::Dup, smallvec![], Some(1)));
        set(descr(STORE_NULL, "store.null", K::StoreNull, smallvec![], Some(1)));
        set(descr(RETURN, "return", K::Return, smallvec![], Some(-1)));
        set(descr(THROW, "throw", K::Throw, smallvec![], Some(-1)));
        // Pops the yielded value, pushes the resumed value.
        set(descr(YIELD, "yield", K::Yield, smallvec![Constant], Some(0)));
        set(descr(
            MERGE_CONDITIONAL,
            "merge.conditional",
            K::MergeConditional,
            smallvec![BytecodeIndex, BytecodeIndex],
            Some(-1),
        ));
        set(descr(
            LOAD_VARIADIC,
            "load.variadic",
            K::LoadVariadic,
            smallvec![Integer],
            None,
        ));
        set(descr(MERGE_VARIADIC, "merge.variadic", K::MergeVariadic, smallvec![], Some(-1)));
        set(descr(
            INSTRUMENTATION_ENTER,
            "instrument.enter",
            K::InstrumentationEnter,
            smallvec![Integer],
            Some(0),
        ));
        set(descr(
            INSTRUMENTATION_EXIT,
            "instrument.exit",
            K::InstrumentationExit,
            smallvec![Integer],
            Some(0),
        ));
        set(descr(
            INSTRUMENTATION_LEAVE,
            "instrument.leave",
            K::InstrumentationLeave,
            smallvec![Integer],
            Some(0),
        ));

        InstructionTable { instrs }
    }

    /// Register a custom instruction; returns its opcode id.
    pub fn register_custom(&mut self, name: Arc<str>, data: CustomData) -> u16 {
        let id = self.instrs.len() as u16;
        let mut immediates: SmallVec<[ImmediateKind; 4]> = smallvec![ImmediateKind::Node];
        match data.local_args {
            LocalArgs::None => {}
            LocalArgs::Single => immediates.push(ImmediateKind::LocalSetter),
            LocalArgs::Range => {
                immediates.push(ImmediateKind::LocalSetterRangeStart);
                immediates.push(ImmediateKind::LocalSetterRangeLength);
            }
        }
        self.instrs.push(InstructionDescr {
            id,
            name,
            kind: InstructionKind::Custom,
            immediates,
            stack_effect: None,
            quickening_base: None,
            quickened: Vec::new(),
            guard: None,
            custom: Some(data),
            short_circuit: None,
        });
        id
    }

    /// Register a quickened form of `base`; returns the new opcode id.
    pub fn register_quickening(
        &mut self,
        base: u16,
        name: Arc<str>,
        guard: OperandGuard,
        execute: CustomExec,
    ) -> u16 {
        let id = self.instrs.len() as u16;
        let base_descr = self.instrs[base as usize].clone();
        let mut custom = base_descr
            .custom
            .clone()
            .unwrap_or_else(|| unreachable!("quickening registered on non-custom opcode"));
        custom.execute = execute;
        self.instrs.push(InstructionDescr {
            id,
            name,
            kind: InstructionKind::Custom,
            immediates: base_descr.immediates.clone(),
            stack_effect: base_descr.stack_effect,
            quickening_base: Some(base),
            quickened: Vec::new(),
            guard: Some(guard),
            custom: Some(custom),
            short_circuit: None,
        });
        self.instrs[base as usize].quickened.push(id);
        id
    }

    /// Register a short-circuit instruction; returns its opcode id.
    pub fn register_short_circuit(&mut self, name: Arc<str>, data: ShortCircuitData) -> u16 {
        let id = self.instrs.len() as u16;
        self.instrs.push(InstructionDescr {
            id,
            name,
            kind: InstructionKind::CustomShortCircuit,
            immediates: smallvec![ImmediateKind::BytecodeIndex, ImmediateKind::Profile],
            stack_effect: Some(-1),
            quickening_base: None,
            quickened: Vec::new(),
            guard: None,
            custom: None,
            short_circuit: Some(data),
        });
        id
    }

    /// Descriptor for an opcode the table is known to contain.
    #[inline]
    pub fn get(&self, id: u16) -> &InstructionDescr {
        &self.instrs[id as usize]
    }

    /// Descriptor lookup for untrusted opcodes (decoded bytecode).
    #[inline]
    pub fn lookup(&self, id: u16) -> Option<&InstructionDescr> {
        self.instrs.get(id as usize)
    }

    /// Instruction length of `id` in words.
    #[inline]
    pub fn length_of(&self, id: u16) -> u16 {
        self.get(id).length()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    // =========================================================================
    // Quickening Relations
    // =========================================================================

    /// First quickened form of `base` whose guard accepts `operands`,
    /// or `None` if no quickening covers them.
    pub fn apply_quickening(&self, base: u16, operands: &[Value]) -> Option<u16> {
        let base_descr = self.get(base);
        for &q in &base_descr.quickened {
            if let Some(guard) = &self.get(q).guard {
                if guard(operands) {
                    return Some(q);
                }
            }
        }
        None
    }

    /// Base opcode of `id` (identity for non-quickened opcodes).
    #[inline]
    pub fn undo_quickening(&self, id: u16) -> u16 {
        self.get(id).quickening_base.unwrap_or(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lengths() {
        let table = InstructionTable::with_builtins();
        assert_eq!(table.length_of(opcodes::POP), 1);
        assert_eq!(table.length_of(opcodes::BRANCH), 2);
        assert_eq!(table.length_of(opcodes::BRANCH_FALSE), 3);
        assert_eq!(table.length_of(opcodes::MERGE_CONDITIONAL), 3);
    }

    #[test]
    fn test_store_local_quickening_family() {
        let table = InstructionTable::with_builtins();
        assert_eq!(
            table.apply_quickening(opcodes::STORE_LOCAL, &[Value::Int(1)]),
            Some(opcodes::STORE_LOCAL_INT)
        );
        assert_eq!(
            table.apply_quickening(opcodes::STORE_LOCAL, &[Value::Float(1.0)]),
            Some(opcodes::STORE_LOCAL_FLOAT)
        );
        assert_eq!(table.apply_quickening(opcodes::STORE_LOCAL, &[Value::Null]), None);
        assert_eq!(table.undo_quickening(opcodes::STORE_LOCAL_INT), opcodes::STORE_LOCAL);
        assert_eq!(table.undo_quickening(opcodes::STORE_LOCAL), opcodes::STORE_LOCAL);
    }

    #[test]
    fn test_unassigned_builtin_ids_trap() {
        let table = InstructionTable::with_builtins();
        assert_eq!(table.get(30).kind, InstructionKind::Trap);
    }

    #[test]
    fn test_custom_registration_assigns_dense_ids() {
        let mut table = InstructionTable::with_builtins();
        let exec: CustomExec = Arc::new(|_: &[Value]| Ok(Value::Null));
        let id = table.register_custom(
            "c.first".into(),
            CustomData {
                arity: Arity::Fixed(2),
                returns_value: true,
                local_args: LocalArgs::None,
                execute: exec.clone(),
                execute_uncached: exec,
            },
        );
        assert_eq!(id, opcodes::FIRST_CUSTOM);
        // Node immediate always present.
        assert_eq!(table.get(id).immediates[0], ImmediateKind::Node);
    }
}
