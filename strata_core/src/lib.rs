//! Core model for the Strata self-optimizing bytecode interpreter.
//!
//! This crate holds everything shared between the builder side
//! (`strata_compiler`) and the execution side (`strata_vm`):
//!
//! - [`Value`] - the guest value representation used on the operand stack,
//!   in locals, and in the constant pool
//! - [`InstructionTable`] / [`OperationTable`] - immutable descriptor
//!   tables for instructions (dispatch units) and operations (builder
//!   constructs), including quickening relations
//! - [`InterpreterDef`] - the declarative entry point a guest language
//!   uses to register its custom operations, quickenings, short-circuit
//!   operators, and instrumentation tags
//! - Error types for both phases ([`BuilderError`], [`VmError`])
//!
//! The tables are ordinary data structures; there is no code synthesis.
//! A front-end describes its interpreter once with an [`InterpreterDef`],
//! builds the resulting [`InterpreterModel`], and hands it to a builder.

pub mod error;
pub mod instruction;
pub mod interp_def;
pub mod operation;
pub mod source;
pub mod value;

pub use error::{BuildResult, BuilderError, OpError, VmError, VmResult};
pub use instruction::{
    Arity, BoolConverter, CustomExec, ImmediateKind, InstructionDescr, InstructionKind,
    InstructionTable, LocalArgs, OperandGuard,
};
pub use interp_def::{
    CustomOp, CustomOpSpec, InterpreterDef, InterpreterModel, QuickeningSpec, ShortCircuitSpec,
};
pub use operation::{OperationArity, OperationDescr, OperationKind, OperationTable};
pub use source::{Source, SourceInfoEntry};
pub use value::{
    ContinuationLocation, CoroutineState, MaterializedFrame, SavedFrame, Value,
};

/// Sentinel bytecode index for a not-yet-patched branch immediate.
pub const UNINIT_BCI: u16 = 0xFFFF;

/// Local slot reserved for the frame's current bytecode index.
///
/// `Yield` writes the resume point here; the uncached tier keeps it
/// current so stack walks can locate the executing instruction.
pub const BCI_SLOT: u16 = 0;

/// First local slot handed out by `create_local`.
pub const USER_LOCALS_START_IDX: u16 = 1;
