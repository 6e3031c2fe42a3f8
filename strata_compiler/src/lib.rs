//! Bytecode construction for the Strata interpreter.
//!
//! This crate turns structured `begin_*`/`end_*`/`emit_*` calls into a
//! frozen, executable [`RootProgram`]:
//!
//! - [`Builder`] - the facade a guest front-end drives; it owns the
//!   operation stack, the label resolver, and the finally-handler
//!   duplication machinery
//! - [`bytecode`] - the growable 16-bit code buffer with its parallel
//!   source-info, exception-handler, and basic-block arrays, the
//!   deduplicating constant pool, and the frozen root program
//! - [`serialize`] - a builder-trace serializer and the matching
//!   deserializer
//!
//! # Example
//!
//! ```
//! use strata_compiler::{Builder, BuilderConfig};
//! use strata_core::InterpreterDef;
//!
//! let model = InterpreterDef::new("demo").build();
//! let mut b = Builder::new(model, BuilderConfig::default());
//! b.begin_root("demo").unwrap();
//! b.begin_return().unwrap();
//! b.emit_load_argument(0).unwrap();
//! b.end_return().unwrap();
//! let root = b.end_root().unwrap();
//! assert!(root.bytecode_len() > 0);
//! ```

pub mod builder;
pub mod bytecode;
pub mod serialize;

pub use builder::{Builder, BuilderConfig, Label, Local};
pub use bytecode::root::{
    local_kinds, BranchProfile, CachedData, CachedNode, DecodedInstruction, HandlerEntry,
    RootProgram, Tier,
};
pub use serialize::{deserialize, SerializingBuilder, ValueCodec};
