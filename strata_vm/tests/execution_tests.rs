//! End-to-end execution tests for the builder + dispatch pipeline.

use std::sync::Arc;
use strata_compiler::{Builder, BuilderConfig, RootProgram};
use strata_core::instruction::opcodes;
use strata_core::{
    Arity, CustomOp, CustomOpSpec, InterpreterDef, InterpreterModel, LocalArgs, MaterializedFrame,
    OpError, ShortCircuitSpec, Value, VmError,
};
use strata_vm::{Machine, RuntimeHooks};

struct Calc {
    model: Arc<InterpreterModel>,
    add: CustomOp,
    less: CustomOp,
    raise: CustomOp,
    sum: CustomOp,
    divmod: CustomOp,
    and: CustomOp,
}

fn calc() -> Calc {
    let mut def = InterpreterDef::new("calc");
    let add = def.register_operation(CustomOpSpec::value_op(
        "Add",
        Arity::Fixed(2),
        Arc::new(|ops: &[Value]| match (&ops[0], &ops[1]) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
            _ => Err(OpError::Guest(Value::str("unsupported operands"))),
        }),
    ));
    let less = def.register_operation(CustomOpSpec::value_op(
        "Less",
        Arity::Fixed(2),
        Arc::new(|ops: &[Value]| match (&ops[0], &ops[1]) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a < b)),
            _ => Err(OpError::Guest(Value::str("unsupported operands"))),
        }),
    ));
    let raise = def.register_operation(CustomOpSpec {
        name: "Raise".into(),
        arity: Arity::Fixed(1),
        returns_value: false,
        local_args: LocalArgs::None,
        execute: Arc::new(|ops: &[Value]| Err(OpError::Guest(ops[0].clone()))),
        execute_uncached: None,
    });
    let sum = def.register_operation(CustomOpSpec::value_op(
        "Sum",
        Arity::Variadic(0),
        Arc::new(|ops: &[Value]| {
            let mut total = 0i64;
            if let Some(items) = ops[0].as_list() {
                for item in items {
                    match item {
                        Value::Int(i) => total += i,
                        _ => return Err(OpError::Guest(Value::str("int expected"))),
                    }
                }
            }
            Ok(Value::Int(total))
        }),
    ));
    let divmod = def.register_operation(CustomOpSpec::local_setter_op(
        "DivMod",
        Arity::Fixed(2),
        LocalArgs::Range,
        Arc::new(|ops: &[Value]| match (&ops[0], &ops[1]) {
            (Value::Int(_), Value::Int(0)) => Err(OpError::Guest(Value::str("division by zero"))),
            (Value::Int(a), Value::Int(b)) => {
                Ok(Value::List(vec![Value::Int(a / b), Value::Int(a % b)].into()))
            }
            _ => Err(OpError::Guest(Value::str("unsupported operands"))),
        }),
    ));
    let and = def.register_short_circuit(ShortCircuitSpec {
        name: "And".into(),
        continue_when: true,
        convert: None,
    });
    Calc {
        model: def.build(),
        add,
        less,
        raise,
        sum,
        divmod,
        and,
    }
}

fn builder(calc: &Calc) -> Builder {
    Builder::new(calc.model.clone(), BuilderConfig::default())
}

// =============================================================================
// Basics
// =============================================================================

#[test]
fn test_simple_return_argument() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.emit_load_argument(0).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    let result = Machine::new().execute(&root, &[Value::Int(42)]).unwrap();
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_root_without_return_yields_null() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    b.begin_block().unwrap();
    b.end_block().unwrap();
    let root = b.end_root().unwrap();
    assert_eq!(Machine::new().execute(&root, &[]).unwrap(), Value::Null);
}

fn conditional_root(calc: &Calc, boxing: bool) -> Arc<RootProgram> {
    let config = BuilderConfig {
        boxing_elimination: boxing,
        ..BuilderConfig::default()
    };
    let mut b = Builder::new(calc.model.clone(), config);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_conditional().unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.emit_load_constant(Value::Int(2)).unwrap();
    b.end_conditional().unwrap();
    b.end_return().unwrap();
    b.end_root().unwrap()
}

#[test]
fn test_conditional_both_modes_agree() {
    let calc = calc();
    for boxing in [false, true] {
        let root = conditional_root(&calc, boxing);
        let machine = Machine::new();
        assert_eq!(
            machine.execute(&root, &[Value::Bool(true)]).unwrap(),
            Value::Int(1),
            "boxing={}",
            boxing
        );
        assert_eq!(
            machine.execute(&root, &[Value::Bool(false)]).unwrap(),
            Value::Int(2),
            "boxing={}",
            boxing
        );
    }
}

#[test]
fn test_if_then_else_statement() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    let x = b.create_local().unwrap();
    b.begin_if_then_else().unwrap();
    b.emit_load_argument(0).unwrap();
    b.begin_store_local(x).unwrap();
    b.emit_load_constant(Value::Int(10)).unwrap();
    b.end_store_local().unwrap();
    b.begin_store_local(x).unwrap();
    b.emit_load_constant(Value::Int(20)).unwrap();
    b.end_store_local().unwrap();
    b.end_if_then_else().unwrap();
    b.begin_return().unwrap();
    b.emit_load_local(x).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    let machine = Machine::new();
    assert_eq!(
        machine.execute(&root, &[Value::Bool(true)]).unwrap(),
        Value::Int(10)
    );
    assert_eq!(
        machine.execute(&root, &[Value::Bool(false)]).unwrap(),
        Value::Int(20)
    );
}

#[test]
fn test_while_loop_counts() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    let i = b.create_local().unwrap();
    b.begin_store_local(i).unwrap();
    b.emit_load_constant(Value::Int(0)).unwrap();
    b.end_store_local().unwrap();
    b.begin_while().unwrap();
    b.begin_custom(calc.less).unwrap();
    b.emit_load_local(i).unwrap();
    b.emit_load_argument(0).unwrap();
    b.end_custom(calc.less).unwrap();
    b.begin_store_local(i).unwrap();
    b.begin_custom(calc.add).unwrap();
    b.emit_load_local(i).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.end_custom(calc.add).unwrap();
    b.end_store_local().unwrap();
    b.end_while().unwrap();
    b.begin_return().unwrap();
    b.emit_load_local(i).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    assert_eq!(
        Machine::new().execute(&root, &[Value::Int(10)]).unwrap(),
        Value::Int(10)
    );
}

// =============================================================================
// Short-Circuit & Variadic
// =============================================================================

#[test]
fn test_short_circuit_and() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_custom(calc.and).unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_load_constant(Value::Int(5)).unwrap();
    b.end_custom(calc.and).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    let machine = Machine::new();
    // Truthy first operand: the result is the last operand.
    assert_eq!(
        machine.execute(&root, &[Value::Int(1)]).unwrap(),
        Value::Int(5)
    );
    // Falsy first operand short-circuits and keeps the witness.
    assert_eq!(
        machine.execute(&root, &[Value::Int(0)]).unwrap(),
        Value::Int(0)
    );
}

#[test]
fn test_variadic_sum_uses_chunked_collection() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_custom(calc.sum).unwrap();
    for i in 1..=10i64 {
        b.emit_load_constant(Value::Int(i)).unwrap();
    }
    b.end_custom(calc.sum).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    // Ten variadic children collapse as one chunk of eight plus a tail
    // of two, merged.
    assert_eq!(root.count_instructions("load.variadic"), 2);
    assert_eq!(root.count_instructions("merge.variadic"), 1);
    assert_eq!(
        Machine::new().execute(&root, &[]).unwrap(),
        Value::Int(55)
    );
}

#[test]
fn test_local_setter_range_distributes_list() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    let q = b.create_local().unwrap();
    let r = b.create_local().unwrap();
    b.begin_custom_with_locals(calc.divmod, &[q, r]).unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_load_argument(1).unwrap();
    b.end_custom(calc.divmod).unwrap();
    b.begin_return().unwrap();
    b.begin_custom(calc.add).unwrap();
    b.emit_load_local(q).unwrap();
    b.emit_load_local(r).unwrap();
    b.end_custom(calc.add).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    // 17 / 5 -> quotient 3, remainder 2.
    assert_eq!(
        Machine::new()
            .execute(&root, &[Value::Int(17), Value::Int(5)])
            .unwrap(),
        Value::Int(5)
    );
}

// =============================================================================
// Materialized Frames
// =============================================================================

#[test]
fn test_materialized_local_store_and_load() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    let slot = b.create_local().unwrap();
    b.begin_store_local_materialized(slot).unwrap();
    b.emit_load_argument(0).unwrap();
    b.emit_load_constant(Value::Int(7)).unwrap();
    b.end_store_local_materialized().unwrap();
    b.begin_return().unwrap();
    b.begin_load_local_materialized(slot).unwrap();
    b.emit_load_argument(0).unwrap();
    b.end_load_local_materialized().unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();

    let frame = MaterializedFrame::new(4);
    let result = Machine::new()
        .execute(&root, &[Value::Frame(frame.clone())])
        .unwrap();
    assert_eq!(result, Value::Int(7));
    assert_eq!(frame.get(slot.index() as usize), Value::Int(7));
}

// =============================================================================
// Exceptions
// =============================================================================

fn try_catch_root(calc: &Calc) -> Arc<RootProgram> {
    let mut b = builder(calc);
    b.begin_root("demo").unwrap();
    let e = b.create_local().unwrap();
    let r = b.create_local().unwrap();
    b.begin_try_catch(e).unwrap();
    b.begin_block().unwrap();
    b.begin_custom(calc.raise).unwrap();
    b.emit_load_constant(Value::str("boom")).unwrap();
    b.end_custom(calc.raise).unwrap();
    b.end_block().unwrap();
    b.begin_block().unwrap();
    b.begin_store_local(r).unwrap();
    b.emit_load_local(e).unwrap();
    b.end_store_local().unwrap();
    b.end_block().unwrap();
    b.end_try_catch().unwrap();
    b.begin_return().unwrap();
    b.emit_load_local(r).unwrap();
    b.end_return().unwrap();
    b.end_root().unwrap()
}

#[test]
fn test_try_catch_delivers_thrown_value() {
    let calc = calc();
    let root = try_catch_root(&calc);
    assert_eq!(
        Machine::new().execute(&root, &[]).unwrap(),
        Value::str("boom")
    );
}

#[test]
fn test_uncaught_exception_propagates() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    b.begin_custom(calc.raise).unwrap();
    b.emit_load_constant(Value::str("unhandled")).unwrap();
    b.end_custom(calc.raise).unwrap();
    let root = b.end_root().unwrap();

    match Machine::new().execute(&root, &[]) {
        Err(VmError::Guest(v)) => assert_eq!(v, Value::str("unhandled")),
        other => panic!("expected an uncaught guest exception, got {:?}", other),
    }
}

#[test]
fn test_trap_surfaces_as_internal_error() {
    let calc = calc();
    let mut b = builder(&calc);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.emit_load_argument(0).unwrap();
    b.end_return().unwrap();
    let root = b.end_root().unwrap();
    root.store_opcode(0, opcodes::TRAP);

    match Machine::new().execute(&root, &[Value::Int(1)]) {
        Err(VmError::Internal(message)) => assert!(message.contains("trap")),
        other => panic!("expected an internal error, got {:?}", other),
    }
}

#[test]
fn test_internal_exception_hook_converts_to_guest() {
    struct Converter;
    impl RuntimeHooks for Converter {
        fn intercept_internal_exception(&self, _error: VmError, _bci: u16) -> VmError {
            VmError::Guest(Value::str("converted"))
        }
    }

    let calc = calc();
    let root = {
        let mut b = builder(&calc);
        b.begin_root("demo").unwrap();
        let e = b.create_local().unwrap();
        let r = b.create_local().unwrap();
        b.begin_try_catch(e).unwrap();
        b.begin_block().unwrap();
        b.begin_store_local(r).unwrap();
        b.emit_load_constant(Value::Int(0)).unwrap();
        b.end_store_local().unwrap();
        b.end_block().unwrap();
        b.begin_block().unwrap();
        b.begin_store_local(r).unwrap();
        b.emit_load_local(e).unwrap();
        b.end_store_local().unwrap();
        b.end_block().unwrap();
        b.end_try_catch().unwrap();
        b.begin_return().unwrap();
        b.emit_load_local(r).unwrap();
        b.end_return().unwrap();
        b.end_root().unwrap()
    };
    // Rewrite the constant load inside the try region into a trap; the
    // hook converts the failure, the handler catches it.
    let instrs = root.instructions();
    let load = instrs
        .iter()
        .find(|i| &*i.name == "load.constant")
        .unwrap();
    root.store_opcode(load.bci, opcodes::TRAP);

    let machine = Machine::with_hooks(Arc::new(Converter));
    assert_eq!(
        machine.execute(&root, &[]).unwrap(),
        Value::str("converted")
    );
}

// =============================================================================
// Coroutines
// =============================================================================

fn yield_root(calc: &Calc) -> Arc<RootProgram> {
    let mut b = builder(calc);
    b.begin_root("demo").unwrap();
    b.begin_return().unwrap();
    b.begin_custom(calc.add).unwrap();
    b.begin_yield().unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.end_yield().unwrap();
    b.emit_load_constant(Value::Int(2)).unwrap();
    b.end_custom(calc.add).unwrap();
    b.end_return().unwrap();
    b.end_root().unwrap()
}

#[test]
fn test_yield_and_resume() {
    let calc = calc();
    let root = yield_root(&calc);
    let machine = Machine::new();

    let suspended = machine.execute(&root, &[]).unwrap();
    let co = suspended.as_coroutine().expect("expected a coroutine").clone();
    assert_eq!(co.yielded, Value::Int(1));

    let result = machine.resume(&root, &co, Value::Int(40)).unwrap();
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_second_resume_fails() {
    let calc = calc();
    let root = yield_root(&calc);
    let machine = Machine::new();
    let suspended = machine.execute(&root, &[]).unwrap();
    let co = suspended.as_coroutine().unwrap().clone();
    machine.resume(&root, &co, Value::Int(0)).unwrap();
    assert!(matches!(
        machine.resume(&root, &co, Value::Int(0)),
        Err(VmError::Guest(_))
    ));
}

// =============================================================================
// Tier Determinism
// =============================================================================

fn mixed_program(calc: &Calc, threshold: i32) -> Arc<RootProgram> {
    let config = BuilderConfig {
        uncached_threshold: threshold,
        ..BuilderConfig::default()
    };
    let mut b = Builder::new(calc.model.clone(), config);
    b.begin_root("demo").unwrap();
    let i = b.create_local().unwrap();
    b.begin_store_local(i).unwrap();
    b.emit_load_constant(Value::Int(0)).unwrap();
    b.end_store_local().unwrap();
    b.begin_while().unwrap();
    b.begin_custom(calc.less).unwrap();
    b.emit_load_local(i).unwrap();
    b.emit_load_argument(0).unwrap();
    b.end_custom(calc.less).unwrap();
    b.begin_store_local(i).unwrap();
    b.begin_custom(calc.add).unwrap();
    b.emit_load_local(i).unwrap();
    b.emit_load_constant(Value::Int(1)).unwrap();
    b.end_custom(calc.add).unwrap();
    b.end_store_local().unwrap();
    b.end_while().unwrap();
    b.begin_return().unwrap();
    b.begin_custom(calc.add).unwrap();
    b.emit_load_local(i).unwrap();
    b.begin_conditional().unwrap();
    b.emit_load_argument(1).unwrap();
    b.emit_load_constant(Value::Int(100)).unwrap();
    b.emit_load_constant(Value::Int(200)).unwrap();
    b.end_conditional().unwrap();
    b.end_custom(calc.add).unwrap();
    b.end_return().unwrap();
    b.end_root().unwrap()
}

#[test]
fn test_tiers_agree_on_results() {
    let calc = calc();
    let args = [Value::Int(5), Value::Bool(true)];
    let machine = Machine::new();

    let uncached = mixed_program(&calc, 1000);
    let cached = mixed_program(&calc, 0);
    let instrumented = mixed_program(&calc, 0);
    instrumented.enable_instrumentation();

    let a = machine.execute(&uncached, &args).unwrap();
    let b = machine.execute(&cached, &args).unwrap();
    let c = machine.execute(&instrumented, &args).unwrap();
    assert_eq!(a, Value::Int(105));
    assert_eq!(a, b);
    assert_eq!(b, c);
}
