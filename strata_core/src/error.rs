//! Error types for the building and execution phases.
//!
//! Building errors are programming errors in the front-end driving the
//! builder; they abort the current build. Execution errors are routed
//! through the exception-handler table first and only surface to the
//! host when no handler matches.

use crate::value::Value;
use std::fmt;

/// Result alias for builder operations.
pub type BuildResult<T> = Result<T, BuilderError>;

/// Result alias for execution.
pub type VmResult<T> = Result<T, VmError>;

// =============================================================================
// Building
// =============================================================================

/// A malformed builder call sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum BuilderError {
    /// The simulated operand stack went negative or ended unbalanced.
    UnbalancedStack { message: String },
    /// A branch site and its label were emitted at different stack heights.
    UnbalancedBranch { label: u32, site_height: u16, label_height: u16 },
    /// A branch targets a label that is already emitted behind the cursor.
    BackwardBranchUnsupported { label: u32 },
    /// The branch target is not declared by any enclosing operation.
    InvalidBranchTarget { label: u32 },
    /// An operation ended while a label it declared was never emitted.
    UndefinedLabel { label: u32 },
    /// The label was emitted twice.
    LabelAlreadyEmitted { label: u32 },
    /// The label was emitted outside the operation that declared it.
    LabelOutsideDeclaringOp { label: u32 },
    /// A branch inside a finally handler targets a different handler.
    CrossHandlerBranch { label: u32 },
    /// Wrong number of children for an operation.
    ArityMismatch { operation: String, expected: String, actual: u32 },
    /// A child that must produce a value did not.
    ValueExpected { operation: String, child_index: u32 },
    /// A child that must not produce a value did.
    VoidExpected { operation: String, child_index: u32 },
    /// `end` called for an operation that is not the innermost open one.
    UnexpectedOperationEnd { expected: String, actual: String },
    /// A builder call arrived before `begin_root`.
    MissingBeginRoot,
    /// An instrumentation tag id is not registered with the interpreter.
    TagNotProvided { tag: u16 },
    /// The bytecode outgrew the 16-bit index space.
    BytecodeOverflow,
}

impl fmt::Display for BuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderError::UnbalancedStack { message } => {
                write!(f, "unbalanced operand stack: {}", message)
            }
            BuilderError::UnbalancedBranch { label, site_height, label_height } => write!(
                f,
                "branch to label {} at stack height {} but label emitted at height {}",
                label, site_height, label_height
            ),
            BuilderError::BackwardBranchUnsupported { label } => write!(
                f,
                "backward branch to label {}; backward control flow must use While",
                label
            ),
            BuilderError::InvalidBranchTarget { label } => write!(
                f,
                "label {} is not declared by an enclosing operation",
                label
            ),
            BuilderError::UndefinedLabel { label } => {
                write!(f, "label {} declared but never emitted", label)
            }
            BuilderError::LabelAlreadyEmitted { label } => {
                write!(f, "label {} emitted more than once", label)
            }
            BuilderError::LabelOutsideDeclaringOp { label } => {
                write!(f, "label {} emitted outside its declaring operation", label)
            }
            BuilderError::CrossHandlerBranch { label } => write!(
                f,
                "branch to label {} crosses a finally handler boundary",
                label
            ),
            BuilderError::ArityMismatch { operation, expected, actual } => write!(
                f,
                "{} expects {} children, got {}",
                operation, expected, actual
            ),
            BuilderError::ValueExpected { operation, child_index } => write!(
                f,
                "child {} of {} must produce a value",
                child_index, operation
            ),
            BuilderError::VoidExpected { operation, child_index } => write!(
                f,
                "child {} of {} must not produce a value",
                child_index, operation
            ),
            BuilderError::UnexpectedOperationEnd { expected, actual } => write!(
                f,
                "end of {} while {} is the innermost open operation",
                actual, expected
            ),
            BuilderError::MissingBeginRoot => write!(f, "builder call before begin_root"),
            BuilderError::TagNotProvided { tag } => {
                write!(f, "instrumentation tag {} is not registered", tag)
            }
            BuilderError::BytecodeOverflow => {
                write!(f, "bytecode exceeds the 16-bit index space")
            }
        }
    }
}

impl std::error::Error for BuilderError {}

// =============================================================================
// Execution
// =============================================================================

/// An error surfacing from `execute`.
#[derive(Debug, Clone)]
pub enum VmError {
    /// A guest exception that no handler caught.
    Guest(Value),
    /// A host-level failure (malformed bytecode, trap, poisoned state).
    Internal(String),
    /// Guest recursion exceeded the host limit.
    StackOverflow,
}

impl VmError {
    pub fn internal(message: impl Into<String>) -> VmError {
        VmError::Internal(message.into())
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Guest(v) => write!(f, "uncaught guest exception: {:?}", v),
            VmError::Internal(m) => write!(f, "internal error: {}", m),
            VmError::StackOverflow => write!(f, "stack overflow"),
        }
    }
}

impl std::error::Error for VmError {}

/// Outcome signal of a custom instruction's `execute`.
///
/// `UnexpectedOperand` is only meaningful from a quickened execute: it
/// requests respecialization and never propagates to the host.
#[derive(Debug, Clone)]
pub enum OpError {
    UnexpectedOperand,
    Guest(Value),
    Internal(String),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::UnexpectedOperand => write!(f, "unexpected operand"),
            OpError::Guest(v) => write!(f, "guest exception: {:?}", v),
            OpError::Internal(m) => write!(f, "internal error: {}", m),
        }
    }
}
