//! Guest value representation.
//!
//! `Value` is a clonable tagged enum covering the primitives a guest
//! language computes with, plus the three runtime carriers the
//! interpreter itself needs: materialized frames (for the materialized
//! local operations), continuation locations (constant-pool entries
//! emitted by `Yield`), and suspended coroutines (returned to the caller
//! when a `Yield` executes).

use parking_lot::Mutex;
use std::sync::Arc;

/// A guest-language value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// The absent value. Also the content of uninitialized locals.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    /// Variadic argument list, built by `LoadVariadic`/`MergeVariadic`.
    List(Arc<[Value]>),
    /// A materialized frame, usable as the target of the materialized
    /// local load/store operations.
    Frame(MaterializedFrame),
    /// A continuation location constant (resume bci + stack height).
    Continuation(Arc<ContinuationLocation>),
    /// A suspended coroutine produced by `Yield`.
    Coroutine(Arc<CoroutineState>),
}

impl Value {
    #[inline]
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    #[inline]
    pub fn as_coroutine(&self) -> Option<&Arc<CoroutineState>> {
        match self {
            Value::Coroutine(c) => Some(c),
            _ => None,
        }
    }

    /// Truthiness used by `BranchFalse` and the short-circuit converters
    /// that opt into the default conversion.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Frame(_) | Value::Continuation(_) | Value::Coroutine(_) => true,
        }
    }

    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Frame(_) => "frame",
            Value::Continuation(_) => "continuation",
            Value::Coroutine(_) => "coroutine",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // Bit equality: constants must round-trip NaN and -0.0.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Frame(a), Value::Frame(b)) => a.ptr_eq(b),
            (Value::Continuation(a), Value::Continuation(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Coroutine(a), Value::Coroutine(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

// =============================================================================
// Materialized Frames
// =============================================================================

/// A heap-allocated frame of local slots that outlives its activation.
///
/// Materialized frames are shared: clones alias the same storage, and
/// mutations through any handle are visible through all of them.
#[derive(Debug, Clone)]
pub struct MaterializedFrame(Arc<Mutex<Vec<Value>>>);

impl MaterializedFrame {
    /// Create a frame with `len` slots, all `Null`.
    pub fn new(len: usize) -> Self {
        MaterializedFrame(Arc::new(Mutex::new(vec![Value::Null; len])))
    }

    /// Create a frame from a snapshot of local values.
    pub fn from_locals(locals: Vec<Value>) -> Self {
        MaterializedFrame(Arc::new(Mutex::new(locals)))
    }

    /// Read slot `idx`. Out-of-range reads yield `Null`.
    pub fn get(&self, idx: usize) -> Value {
        self.0.lock().get(idx).cloned().unwrap_or(Value::Null)
    }

    /// Write slot `idx`. Out-of-range writes are ignored.
    pub fn set(&self, idx: usize, value: Value) {
        let mut slots = self.0.lock();
        if let Some(slot) = slots.get_mut(idx) {
            *slot = value;
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &MaterializedFrame) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// =============================================================================
// Continuations
// =============================================================================

/// A constant-pool record identifying a suspendable point: the bytecode
/// index to resume at and the operand stack height at the suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationLocation {
    pub bci: u16,
    pub sp: u16,
}

/// Frame state captured when a coroutine suspends.
#[derive(Debug, Clone)]
pub struct SavedFrame {
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
}

/// A suspended coroutine.
///
/// Holds the yielded value for the caller and the saved frame for the
/// resume entry. The frame is single-shot: the first resume takes it and
/// a second resume fails with a guest error.
#[derive(Debug)]
pub struct CoroutineState {
    pub location: ContinuationLocation,
    pub yielded: Value,
    saved: Mutex<Option<SavedFrame>>,
}

impl CoroutineState {
    pub fn new(location: ContinuationLocation, yielded: Value, frame: SavedFrame) -> Self {
        CoroutineState {
            location,
            yielded,
            saved: Mutex::new(Some(frame)),
        }
    }

    /// Take the saved frame for resumption. Returns `None` if the
    /// coroutine was already resumed.
    pub fn take_frame(&self) -> Option<SavedFrame> {
        self.saved.lock().take()
    }

    pub fn is_resumable(&self) -> bool {
        self.saved.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(-3).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(Value::str("x").is_truthy());
    }

    #[test]
    fn test_float_bit_equality() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_materialized_frame_sharing() {
        let frame = MaterializedFrame::new(3);
        let alias = frame.clone();
        alias.set(1, Value::Int(7));
        assert_eq!(frame.get(1), Value::Int(7));
        assert_eq!(frame.get(2), Value::Null);
        // Out-of-range access is tolerated.
        frame.set(9, Value::Int(1));
        assert_eq!(frame.get(9), Value::Null);
    }

    #[test]
    fn test_coroutine_single_shot() {
        let state = CoroutineState::new(
            ContinuationLocation { bci: 4, sp: 0 },
            Value::Int(1),
            SavedFrame {
                locals: vec![],
                stack: vec![],
            },
        );
        assert!(state.is_resumable());
        assert!(state.take_frame().is_some());
        assert!(state.take_frame().is_none());
        assert!(!state.is_resumable());
    }
}
