//! Bytecode representation: the growable build-time buffer, the
//! deduplicating constant pool, the label/branch resolver, and the
//! frozen [`RootProgram`](root::RootProgram).

pub mod buffer;
pub mod constant_pool;
pub mod labels;
pub mod root;

pub use buffer::BytecodeBuffer;
pub use constant_pool::ConstantPool;
pub use labels::{BranchRegistry, LabelArena, LabelInfo, UnresolvedSite};
