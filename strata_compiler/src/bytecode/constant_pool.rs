//! Deduplicating constant pool.
//!
//! Insertion order defines index assignment. Only simple values
//! deduplicate; composite values (lists, frames, continuations) always
//! get a fresh index. Floats deduplicate by bit pattern so `NaN` and
//! `-0.0` round-trip exactly.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use strata_core::Value;

/// Key type for constant deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
}

impl ConstantKey {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(ConstantKey::Null),
            Value::Bool(b) => Some(ConstantKey::Bool(*b)),
            Value::Int(i) => Some(ConstantKey::Int(*i)),
            Value::Float(f) => Some(ConstantKey::Float(f.to_bits())),
            Value::Str(s) => Some(ConstantKey::Str(s.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    constants: Vec<Value>,
    dedup: FxHashMap<ConstantKey, u16>,
}

impl ConstantPool {
    pub fn new() -> Self {
        ConstantPool::default()
    }

    /// Add a constant and return its index. Equal simple values return
    /// the same index.
    pub fn add(&mut self, value: Value) -> u16 {
        if let Some(key) = ConstantKey::from_value(&value) {
            if let Some(&idx) = self.dedup.get(&key) {
                return idx;
            }
            let idx = self.constants.len() as u16;
            self.constants.push(value);
            self.dedup.insert(key, idx);
            idx
        } else {
            let idx = self.constants.len() as u16;
            self.constants.push(value);
            idx
        }
    }

    #[inline]
    pub fn get(&self, idx: u16) -> &Value {
        &self.constants[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn into_constants(self) -> Vec<Value> {
        self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_simple() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Value::Int(42));
        let b = pool.add(Value::Int(42));
        let c = pool.add(Value::Int(100));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_no_dedup_composite() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Value::List(Arc::from(vec![Value::Int(1)])));
        let b = pool.add(Value::List(Arc::from(vec![Value::Int(1)])));
        assert_ne!(a, b);
    }

    #[test]
    fn test_float_bits() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Value::Float(0.0));
        let b = pool.add(Value::Float(-0.0));
        assert_ne!(a, b);
        let c = pool.add(Value::Float(f64::NAN));
        let d = pool.add(Value::Float(f64::NAN));
        assert_eq!(c, d);
    }
}
