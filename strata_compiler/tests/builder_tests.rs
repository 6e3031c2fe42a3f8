//! Structural tests for the builder: emitted bytecode shapes, fixup
//! patching, finally duplication counts, and contract violations.

use std::sync::Arc;
use strata_compiler::{Builder, BuilderConfig, RootProgram};
use strata_core::instruction::opcodes;
use strata_core::{
    Arity, BuilderError, CustomOpSpec, InterpreterDef, InterpreterModel, OpError, Source, Value,
};

fn plain_model() -> Arc<InterpreterModel> {
    InterpreterDef::new("test").build()
}

fn calc_model() -> Arc<InterpreterModel> {
    let mut def = InterpreterDef::new("calc");
    def.register_operation(CustomOpSpec::value_op(
        "Add",
        Arity::Fixed(2),
        Arc::new(|ops: &[Value]| match (&ops[0], &ops[1]) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            _ => Err(OpError::Guest(Value::str("unsupported operands"))),
        }),
    ));
    def.build()
}

fn builder(model: &Arc<InterpreterModel>) -> Builder {
    Builder::new(model.clone(), BuilderConfig::default())
}

fn opcode_names(root: &RootProgram) -> Vec<String> {
    root.instructions().iter().map(|i| i.name.to_string()).collect()
}

/// Count `store.local` instructions targeting `slot`.
fn count_stores_to(root: &RootProgram, slot: u16) -> usize {
    root.instructions()
        .iter()
        .filter(|i| i.opcode == opcodes::STORE_LOCAL && i.immediates[0].1 == slot)
        .count()
}

// =============================================================================
// Shapes
// =============================================================================

#[test]
fn test_simple_return_shape() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.emit_load_argument(0).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    assert_eq!(
        opcode_names(&root),
        vec!["load.argument", "return", "store.null", "return"]
    );
    let listing = root.disassemble();
    assert!(listing.contains("root demo"));
    assert!(listing.contains("load.argument 0"));
}

#[test]
fn test_conditional_emits_one_branch_false_and_one_branch() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_conditional().unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.emit_load_constant(Value::Int(2)).unwrap();
    b.end_conditional().unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    assert_eq!(root.count_instructions("branch.false"), 1);
    assert_eq!(root.count_instructions("branch"), 1);
    // Without boxing elimination no merge instruction appears.
    assert_eq!(root.count_instructions("merge.conditional"), 0);
    assert_eq!(root.count_instructions("dup"), 0);
}

#[test]
fn test_conditional_boxing_elimination_shape() {
    let model = plain_model();
    let config = BuilderConfig {
        boxing_elimination: true,
        ..BuilderConfig::default()
    };
    let mut b = Builder::new(model, config);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_conditional().unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.emit_load_constant(Value::Int(2)).unwrap();
    b.end_conditional().unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    assert_eq!(root.count_instructions("dup"), 1);
    assert_eq!(root.count_instructions("merge.conditional"), 1);
}

#[test]
fn test_while_shape() {
    let model = calc_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let i = b.create_local().unwrap();
    b.begin_while().unwrap();
    b.emit_load_local(i).unwrap();
    b.begin_store_local(i).unwrap();
    b.emit_load_constant(Value::Int(0)).unwrap();
    b.end_store_local().unwrap();
    b.end_while().unwrap();
    let root = b.end_root().unwrap();

    assert_eq!(root.count_instructions("branch.backward"), 1);
    assert_eq!(root.count_instructions("branch.false"), 1);
    let instrs = root.instructions();
    let backward = instrs
        .iter()
        .find(|i| &*i.name == "branch.backward")
        .unwrap();
    // The backedge targets the loop start (the condition).
    assert_eq!(backward.immediates[0].1, 0);
    let branch_false = instrs.iter().find(|i| &*i.name == "branch.false").unwrap();
    // The exit branch lands right after the backedge.
    assert_eq!(
        branch_false.immediates[0].1,
        backward.bci + 2
    );
}

#[test]
fn test_forward_branch_is_patched_to_label() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let label = b.create_label().unwrap();
    b.emit_branch(label).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.emit_label(label).unwrap();
    let root = b.end_root().unwrap();

    let instrs = root.instructions();
    let branch = instrs.iter().find(|i| &*i.name == "branch").unwrap();
    // The constant between branch and label is dead but present; the
    // label resolved past it.
    let pop_or_next = branch.immediates[0].1;
    assert!(pop_or_next > branch.bci);
    assert_eq!(root.count_instructions("branch"), 1);
}

#[test]
fn test_constant_pool_deduplicates() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_block().unwrap();
    b.emit_load_constant(Value::Int(42)).unwrap();
    b.emit_load_constant(Value::Int(42)).unwrap();
    b.emit_load_constant(Value::str("x")).unwrap();
    b.emit_load_constant(Value::str("x")).unwrap();
    b.end_block().unwrap();
    let root = b.end_root().unwrap();
    assert_eq!(root.constants().len(), 2);
}

// =============================================================================
// TryCatch
// =============================================================================

#[test]
fn test_try_catch_handler_entry() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let e = b.create_local().unwrap();
    let r = b.create_local().unwrap();
    b.begin_try_catch(e).unwrap();
    b.begin_block().unwrap();
    b.begin_store_local(r).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.end_store_local().unwrap();
    b.end_block().unwrap();
    b.begin_block().unwrap();
    b.begin_store_local(r).unwrap();
    b.emit_load_local(e).unwrap();
    b.end_store_local().unwrap();
    b.end_block().unwrap();
    b.end_try_catch().unwrap();
    let root = b.end_root().unwrap();

    let entries: Vec<_> = root.handler_entries().collect();
    assert_eq!(entries.len(), 1);
    let entry = entries[0];
    assert_eq!(entry.exc_local, e.index());
    assert_eq!(entry.start_sp, 0);
    // The catch starts right after the try's exit branch, which is also
    // where the guarded region ends.
    assert_eq!(entry.handler_bci, entry.end_bci);
    // The exit branch is the last instruction of the guarded region.
    let instrs = root.instructions();
    let exit_branch = instrs
        .iter()
        .find(|i| &*i.name == "branch" && i.bci < entry.end_bci)
        .unwrap();
    assert_eq!(exit_branch.bci + 2, entry.handler_bci);
}

// =============================================================================
// Finally Duplication
// =============================================================================

fn build_finally_root(with_except: bool) -> (Arc<RootProgram>, u16) {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let e = b.create_local().unwrap();
    let h = b.create_local().unwrap();
    if with_except {
        b.begin_finally_try(e).unwrap();
    } else {
        b.begin_finally_try_no_except().unwrap();
    }
    // Handler: one store to the handler-only local.
    b.begin_block().unwrap();
    b.begin_store_local(h).unwrap();
    b.emit_load_constant(Value::Int(10)).unwrap();
    b.end_store_local().unwrap();
    b.end_block().unwrap();
    // Guarded body.
    b.begin_block().unwrap();
    b.emit_load_constant(Value::Int(0)).unwrap();
    b.end_block().unwrap();
    if with_except {
        b.end_finally_try().unwrap();
    } else {
        b.end_finally_try_no_except().unwrap();
    }
    (b.end_root().unwrap(), h.index())
}

#[test]
fn test_finally_no_except_duplicates_handler_once_per_exit() {
    // Exits: normal completion only.
    let (root, h) = build_finally_root(false);
    assert_eq!(count_stores_to(&root, h), 1);
}

#[test]
fn test_finally_try_adds_rethrow_copy() {
    // Exits: normal completion + uncaught-exception rethrow.
    let (root, h) = build_finally_root(true);
    assert_eq!(count_stores_to(&root, h), 2);
    assert_eq!(root.count_instructions("throw"), 1);
    assert_eq!(root.handler_entries().count(), 1);
}

#[test]
fn test_finally_branch_exit_adds_copy() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let e = b.create_local().unwrap();
    let h = b.create_local().unwrap();
    let label = b.create_label().unwrap();
    b.begin_finally_try(e).unwrap();
    b.begin_block().unwrap();
    b.begin_store_local(h).unwrap();
    b.emit_load_constant(Value::Int(10)).unwrap();
    b.end_store_local().unwrap();
    b.end_block().unwrap();
    b.begin_block().unwrap();
    b.begin_if_then().unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_branch(label).unwrap();
    b.end_if_then().unwrap();
    b.end_block().unwrap();
    b.end_finally_try().unwrap();
    b.emit_label(label).unwrap();
    let root = b.end_root().unwrap();

    // Exits: branch + normal + rethrow.
    assert_eq!(count_stores_to(&root, h.index()), 3);
    // Each copy is internally consistent: every store was preceded by
    // its own constant load.
    assert!(root.count_instructions("load.constant") >= 3);
}

// =============================================================================
// Sources & Tracing
// =============================================================================

#[test]
fn test_source_sections_attribute_bytecode() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_source(Source::new("test.st")).unwrap();
    b.begin_source_section(4, 11).unwrap();
    b.emit_load_constant(Value::Int(5)).unwrap();
    b.end_source_section().unwrap();
    b.end_source().unwrap();
    let root = b.end_root().unwrap();

    let (source, start, length) = root.get_source_section_at_bci(0).unwrap();
    assert_eq!(&*source.name, "test.st");
    assert_eq!((start, length), (4, 11));
    // Past the section end there is a gap entry.
    let after = root.get_source_section_at_bci(root.bytecode_len() - 1);
    assert!(after.is_none());
}

#[test]
fn test_basic_block_boundaries_tracked() {
    let model = plain_model();
    let config = BuilderConfig {
        track_basic_blocks: true,
        ..BuilderConfig::default()
    };
    let mut b = Builder::new(model, config);
    b.begin_root("demo").unwrap();
    b.begin_while().unwrap();
    b.emit_load_argument(0).unwrap();
    b.begin_block().unwrap();
    b.end_block().unwrap();
    b.end_while().unwrap();
    let root = b.end_root().unwrap();

    let boundaries = root.basic_block_boundaries().unwrap();
    assert_eq!(boundaries.len(), root.bytecode_len() as usize + 1);
    // Loop start is a boundary.
    assert!(boundaries[0]);
    assert!(boundaries.iter().filter(|b| **b).count() >= 2);
}

// =============================================================================
// Contract Violations
// =============================================================================

#[test]
fn test_missing_begin_root() {
    let model = plain_model();
    let mut b = builder(&model);
    assert!(matches!(
        b.emit_load_constant(Value::Int(1)),
        Err(BuilderError::MissingBeginRoot)
    ));
}

#[test]
fn test_arity_mismatch() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_if_then().unwrap();
    b.emit_load_argument(0).unwrap();
    assert!(matches!(
        b.end_if_then(),
        Err(BuilderError::ArityMismatch { .. })
    ));
}

#[test]
fn test_value_expected() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_block().unwrap();
    // The block is void; closing it completes a child that was
    // required to produce the return value.
    assert!(matches!(
        b.end_block(),
        Err(BuilderError::ValueExpected { .. })
    ));
}

#[test]
fn test_void_expected() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_if_then().unwrap();
    b.emit_load_argument(0).unwrap();
    assert!(matches!(
        b.emit_load_constant(Value::Int(1)),
        Err(BuilderError::VoidExpected { .. })
    ));
}

#[test]
fn test_undefined_label() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_block().unwrap();
    let _label = b.create_label().unwrap();
    assert!(matches!(
        b.end_block(),
        Err(BuilderError::UndefinedLabel { .. })
    ));
}

#[test]
fn test_label_outside_declaring_op() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let label = b.create_label().unwrap();
    b.begin_block().unwrap();
    assert!(matches!(
        b.emit_label(label),
        Err(BuilderError::LabelOutsideDeclaringOp { .. })
    ));
}

#[test]
fn test_label_already_emitted() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let label = b.create_label().unwrap();
    b.emit_label(label).unwrap();
    assert!(matches!(
        b.emit_label(label),
        Err(BuilderError::LabelAlreadyEmitted { .. })
    ));
}

#[test]
fn test_backward_branch_rejected() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    let label = b.create_label().unwrap();
    b.emit_label(label).unwrap();
    assert!(matches!(
        b.emit_branch(label),
        Err(BuilderError::BackwardBranchUnsupported { .. })
    ));
}

#[test]
fn test_unexpected_operation_end() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_block().unwrap();
    assert!(matches!(
        b.end_if_then(),
        Err(BuilderError::UnexpectedOperationEnd { .. })
    ));
}

#[test]
fn test_tag_not_provided() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    assert!(matches!(
        b.begin_tag(0),
        Err(BuilderError::TagNotProvided { .. })
    ));
}

#[test]
fn test_cross_handler_branch_rejected() {
    let model = plain_model();
    let mut b = builder(&model);
    b.begin_root("demo").unwrap();
    b.begin_finally_try_no_except().unwrap();
    // Declared while the handler is under construction: scoped to it.
    let label = b.create_label().unwrap();
    b.begin_block().unwrap();
    b.end_block().unwrap();
    // Guarded body: the label belongs to the handler's scope.
    assert!(matches!(
        b.emit_branch(label),
        Err(BuilderError::CrossHandlerBranch { .. })
    ));
}
