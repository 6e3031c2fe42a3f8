//! Quickening rewriter.
//!
//! Rewrites are single aligned 16-bit stores into the shared code array,
//! performed only on slow paths and serialized by the root's rewrite
//! lock; racing readers that observe the old opcode still execute a
//! sound refinement of the same instruction. The per-site node records
//! whether the site is uninitialized, quickened, or permanently generic,
//! so a site that has seen mixed operand types never oscillates.
//!
//! Boxing elimination rides the same transitions for local stores: the
//! slot-kind byte and the opcode are written under one lock acquisition.

use std::sync::Arc;
use strata_compiler::{local_kinds, CachedNode, RootProgram};
use strata_core::instruction::opcodes;
use strata_core::{InstructionTable, Value};

/// Slot kind observed for a stored value.
fn kind_of(value: &Value) -> u8 {
    match value {
        Value::Int(_) => local_kinds::INT,
        Value::Float(_) => local_kinds::FLOAT,
        _ => local_kinds::OBJECT,
    }
}

/// First execution of a generic custom instruction at `bci`: try to
/// install a quickened form covering `operands`. Returns the opcode
/// whose execute should run now.
pub fn quicken_custom(
    root: &Arc<RootProgram>,
    table: &InstructionTable,
    bci: u16,
    base: u16,
    node: &CachedNode,
    operands: &[Value],
) -> u16 {
    use std::sync::atomic::Ordering;
    let _guard = root.rewrite_lock().lock();
    match node.state.load(Ordering::Relaxed) {
        CachedNode::UNINIT => match table.apply_quickening(base, operands) {
            Some(q) => {
                root.store_opcode(bci, q);
                node.state.store(CachedNode::QUICKENED, Ordering::Relaxed);
                q
            }
            None => {
                node.state.store(CachedNode::GENERIC, Ordering::Relaxed);
                base
            }
        },
        // Another thread finished the transition; run the generic form,
        // which covers every operand.
        _ => base,
    }
}

/// A quickened custom instruction signalled `UnexpectedOperand`: undo
/// the rewrite and pin the site to the generic form.
pub fn respecialize_custom(
    root: &Arc<RootProgram>,
    table: &InstructionTable,
    bci: u16,
    current: u16,
    node: &CachedNode,
) -> u16 {
    use std::sync::atomic::Ordering;
    let _guard = root.rewrite_lock().lock();
    let base = table.undo_quickening(current);
    root.store_opcode(bci, base);
    node.state.store(CachedNode::GENERIC, Ordering::Relaxed);
    base
}

/// Generic `store.local` executed in the cached tier: on the first
/// store to a slot, adopt the value's kind and quicken the site; any
/// later disagreement pins the slot to the boxed kind.
pub fn quicken_store_local(root: &Arc<RootProgram>, table: &InstructionTable, bci: u16, slot: u16, value: &Value) {
    let _guard = root.rewrite_lock().lock();
    match root.local_kind(slot) {
        local_kinds::ILLEGAL => {
            root.store_local_kind(slot, kind_of(value));
            if let Some(q) =
                table.apply_quickening(opcodes::STORE_LOCAL, std::slice::from_ref(value))
            {
                root.store_opcode(bci, q);
            }
        }
        kind if kind != kind_of(value) => {
            root.store_local_kind(slot, local_kinds::OBJECT);
        }
        _ => {}
    }
}

/// A quickened local store observed a value of the wrong kind: box the
/// slot and fall back to the generic store, both under one transition.
pub fn unquicken_store_local(root: &Arc<RootProgram>, bci: u16, slot: u16) {
    let _guard = root.rewrite_lock().lock();
    root.store_local_kind(slot, local_kinds::OBJECT);
    root.store_opcode(bci, opcodes::STORE_LOCAL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_compiler::{Builder, BuilderConfig};
    use strata_core::InterpreterDef;

    #[test]
    fn test_store_local_quickening_round_trip() {
        let model = InterpreterDef::new("t").build();
        let mut b = Builder::new(model.clone(), BuilderConfig::default());
        b.begin_root("t").unwrap();
        let x = b.create_local().unwrap();
        b.begin_store_local(x).unwrap();
        b.emit_load_argument(0).unwrap();
        b.end_store_local().unwrap();
        let root = b.end_root().unwrap();

        let store_bci = root
            .instructions()
            .iter()
            .find(|i| &*i.name == "store.local")
            .map(|i| i.bci)
            .unwrap();

        quicken_store_local(
            &root,
            &model.instructions,
            store_bci,
            x.index(),
            &Value::Int(1),
        );
        assert_eq!(root.word_at(store_bci), opcodes::STORE_LOCAL_INT);
        assert_eq!(root.local_kind(x.index()), local_kinds::INT);

        unquicken_store_local(&root, store_bci, x.index());
        assert_eq!(root.word_at(store_bci), opcodes::STORE_LOCAL);
        assert_eq!(root.local_kind(x.index()), local_kinds::OBJECT);
    }
}
