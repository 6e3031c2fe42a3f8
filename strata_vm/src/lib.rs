//! Execution engine for the Strata interpreter.
//!
//! Executes the frozen [`RootProgram`](strata_compiler::RootProgram)s a
//! builder produces, with three dispatch tiers sharing one bytecode:
//!
//! - **Uncached**: no per-site state, custom instructions run their
//!   uncached execute; an invocation/backedge budget triggers the
//!   transition to the cached tier
//! - **Cached**: lazily allocates per-root cached data (specialization
//!   nodes, branch profiles), runs quickening and boxing elimination
//! - **Instrumented**: the cached tier plus instrumentation probes
//!
//! # Example
//!
//! ```
//! use strata_compiler::{Builder, BuilderConfig};
//! use strata_core::{InterpreterDef, Value};
//! use strata_vm::Machine;
//!
//! let model = InterpreterDef::new("demo").build();
//! let mut b = Builder::new(model, BuilderConfig::default());
//! b.begin_root("demo").unwrap();
//! b.begin_return().unwrap();
//! b.emit_load_argument(0).unwrap();
//! b.end_return().unwrap();
//! let root = b.end_root().unwrap();
//!
//! let machine = Machine::new();
//! let result = machine.execute(&root, &[Value::Int(42)]).unwrap();
//! assert_eq!(result, Value::Int(42));
//! ```

pub mod coroutine;
pub mod dispatch;
pub mod exception;
pub mod frame;
pub mod hooks;
pub mod machine;
pub mod quicken;

pub use frame::{Frame, MAX_RECURSION_DEPTH};
pub use hooks::{NopHooks, ProbeEvent, RuntimeHooks};
pub use machine::Machine;

use std::sync::Arc;
use strata_compiler::RootProgram;
use strata_core::{Value, VmResult};

/// Convenience entry: execute `root` on a fresh machine.
pub fn run(root: &Arc<RootProgram>, args: &[Value]) -> VmResult<Value> {
    Machine::new().execute(root, args)
}
