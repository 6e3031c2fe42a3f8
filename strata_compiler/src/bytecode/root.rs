//! Frozen root program.
//!
//! A `RootProgram` is the immutable output of `end_root`. Everything a
//! concurrent executor reads is either frozen (`constants`, `handlers`,
//! counts) or published through atomics: the code array is `AtomicU16`
//! words so the quickening rewriter can retarget opcodes in place, the
//! tier flag and uncached budget are plain atomics, and the lazily
//! built cached data (specialization nodes and branch profiles) is
//! published through a `OnceLock`, whose initialize-once semantics are a
//! strictly stronger guarantee than the release-fence/last-writer-wins
//! publication the design permits.

use crate::bytecode::buffer::HANDLER_ENTRY_WORDS;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use strata_core::{ImmediateKind, InterpreterModel, Source, SourceInfoEntry, Value};

/// Execution tier of a root program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tier {
    Uncached = 0,
    Cached = 1,
    Instrumented = 2,
}

impl Tier {
    pub fn from_u8(v: u8) -> Tier {
        match v {
            0 => Tier::Uncached,
            1 => Tier::Cached,
            _ => Tier::Instrumented,
        }
    }
}

/// Frame slot kinds for boxing elimination.
pub mod local_kinds {
    /// No store observed yet.
    pub const ILLEGAL: u8 = 0;
    /// Generic boxed slot.
    pub const OBJECT: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
}

/// Per-site specialization state slot.
#[derive(Debug)]
pub struct CachedNode {
    /// 0 = uninitialized, 1 = quickened, 2 = generic.
    pub state: AtomicU8,
}

impl CachedNode {
    pub const UNINIT: u8 = 0;
    pub const QUICKENED: u8 = 1;
    pub const GENERIC: u8 = 2;
}

/// Taken/not-taken counters of one conditional branch site.
#[derive(Debug)]
pub struct BranchProfile {
    pub taken: AtomicU32,
    pub not_taken: AtomicU32,
}

/// Lazily allocated mutable execution state of a root.
#[derive(Debug)]
pub struct CachedData {
    pub nodes: Box<[CachedNode]>,
    pub profiles: Box<[BranchProfile]>,
}

impl CachedData {
    fn new(num_nodes: u16, num_profiles: u16) -> Self {
        CachedData {
            nodes: (0..num_nodes)
                .map(|_| CachedNode {
                    state: AtomicU8::new(CachedNode::UNINIT),
                })
                .collect(),
            profiles: (0..num_profiles)
                .map(|_| BranchProfile {
                    taken: AtomicU32::new(0),
                    not_taken: AtomicU32::new(0),
                })
                .collect(),
        }
    }
}

/// One exception-handler table entry, unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    pub start_bci: u16,
    pub end_bci: u16,
    pub handler_bci: u16,
    pub start_sp: u16,
    pub exc_local: u16,
}

/// A decoded instruction, for introspection and tests.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub bci: u16,
    pub opcode: u16,
    pub name: Arc<str>,
    pub immediates: SmallVec<[(ImmediateKind, u16); 4]>,
}

// =============================================================================
// Root Program
// =============================================================================

/// An executable root, immutable after `end_root` except for in-place
/// opcode rewriting.
pub struct RootProgram {
    model: Arc<InterpreterModel>,
    language: Arc<str>,
    bc: Box<[AtomicU16]>,
    constants: Box<[Value]>,
    handlers: Box<[i32]>,
    num_locals: u16,
    num_nodes: u16,
    num_profiles: u16,
    max_stack: u16,
    sources: Box<[Source]>,
    source_info: Box<[SourceInfoEntry]>,
    boundaries: Option<Box<[bool]>>,

    tier: AtomicU8,
    uncached_budget: AtomicI32,
    initial_budget: i32,
    cached: OnceLock<CachedData>,
    /// Serializes quickening transitions: the opcode store and the
    /// slot-kind store of one transition happen under this lock.
    rewrite_lock: Mutex<()>,
    local_kinds: Box<[AtomicU8]>,
}

#[allow(clippy::too_many_arguments)]
impl RootProgram {
    pub(crate) fn new(
        model: Arc<InterpreterModel>,
        language: Arc<str>,
        code: Vec<u16>,
        constants: Vec<Value>,
        handlers: Vec<i32>,
        num_locals: u16,
        num_nodes: u16,
        num_profiles: u16,
        max_stack: u16,
        sources: Vec<Source>,
        source_info: Vec<SourceInfoEntry>,
        boundaries: Option<Vec<bool>>,
        uncached_threshold: i32,
    ) -> Arc<RootProgram> {
        let tier = if uncached_threshold > 0 {
            Tier::Uncached
        } else {
            Tier::Cached
        };
        Arc::new(RootProgram {
            model,
            language,
            bc: code.into_iter().map(AtomicU16::new).collect(),
            constants: constants.into_boxed_slice(),
            handlers: handlers.into_boxed_slice(),
            num_locals,
            num_nodes,
            num_profiles,
            max_stack,
            sources: sources.into_boxed_slice(),
            source_info: source_info.into_boxed_slice(),
            boundaries: boundaries.map(Vec::into_boxed_slice),
            tier: AtomicU8::new(tier as u8),
            uncached_budget: AtomicI32::new(uncached_threshold),
            initial_budget: uncached_threshold,
            cached: OnceLock::new(),
            rewrite_lock: Mutex::new(()),
            local_kinds: (0..num_locals)
                .map(|_| AtomicU8::new(local_kinds::ILLEGAL))
                .collect(),
        })
    }

    // =========================================================================
    // Code Access
    // =========================================================================

    /// Word at `at`. Opcode slots may be concurrently rewritten; any
    /// value read is a sound refinement of the base instruction.
    #[inline]
    pub fn word_at(&self, at: u16) -> u16 {
        self.bc[at as usize].load(Ordering::Relaxed)
    }

    /// Aligned 16-bit opcode store (quickening slow path only).
    #[inline]
    pub fn store_opcode(&self, bci: u16, opcode: u16) {
        self.bc[bci as usize].store(opcode, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytecode_len(&self) -> u16 {
        self.bc.len() as u16
    }

    pub fn bytecode_snapshot(&self) -> Vec<u16> {
        self.bc.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    #[inline]
    pub fn constant(&self, idx: u16) -> &Value {
        &self.constants[idx as usize]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn model(&self) -> &Arc<InterpreterModel> {
        &self.model
    }

    pub fn language(&self) -> &Arc<str> {
        &self.language
    }

    #[inline]
    pub fn num_locals(&self) -> u16 {
        self.num_locals
    }

    #[inline]
    pub fn num_nodes(&self) -> u16 {
        self.num_nodes
    }

    #[inline]
    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub fn basic_block_boundaries(&self) -> Option<&[bool]> {
        self.boundaries.as_deref()
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    pub fn handlers_flat(&self) -> &[i32] {
        &self.handlers
    }

    pub fn handler_entries(&self) -> impl Iterator<Item = HandlerEntry> + '_ {
        self.handlers.chunks(HANDLER_ENTRY_WORDS).map(|c| HandlerEntry {
            start_bci: c[0] as u16,
            end_bci: c[1] as u16,
            handler_bci: c[2] as u16,
            start_sp: c[3] as u16,
            exc_local: c[4] as u16,
        })
    }

    // =========================================================================
    // Tier & Cached Data
    // =========================================================================

    #[inline]
    pub fn tier(&self) -> Tier {
        Tier::from_u8(self.tier.load(Ordering::Acquire))
    }

    pub fn set_tier(&self, tier: Tier) {
        self.tier.store(tier as u8, Ordering::Release);
    }

    /// Decrement the uncached budget; returns `true` when it crossed
    /// zero and the root should transition to the cached tier.
    #[inline]
    pub fn decrement_uncached_budget(&self) -> bool {
        self.uncached_budget.fetch_sub(1, Ordering::Relaxed) <= 1
    }

    /// Set the number of uncached invocations/backedges before the root
    /// switches to the cached tier. Has no effect once the root already
    /// switched.
    pub fn set_uncached_interpreter_threshold(&self, threshold: i32) {
        self.uncached_budget.store(threshold, Ordering::Relaxed);
        if threshold <= 0 && self.tier() == Tier::Uncached {
            self.set_tier(Tier::Cached);
        }
    }

    pub fn enable_instrumentation(&self) {
        self.set_tier(Tier::Instrumented);
    }

    /// The per-root cached data, built lazily by the first cached-tier
    /// entry. Initialization is pure, so racing initializers are benign;
    /// `OnceLock` picks one winner.
    pub fn cached_data(&self) -> &CachedData {
        self.cached
            .get_or_init(|| CachedData::new(self.num_nodes, self.num_profiles))
    }

    pub fn rewrite_lock(&self) -> &Mutex<()> {
        &self.rewrite_lock
    }

    #[inline]
    pub fn local_kind(&self, slot: u16) -> u8 {
        self.local_kinds[slot as usize].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_local_kind(&self, slot: u16, kind: u8) {
        self.local_kinds[slot as usize].store(kind, Ordering::Relaxed);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Decode the bytecode into instruction tuples.
    pub fn instructions(&self) -> Vec<DecodedInstruction> {
        let mut out = Vec::new();
        let len = self.bytecode_len();
        let mut bci = 0u16;
        while bci < len {
            let opcode = self.word_at(bci);
            let Some(descr) = self.model.instructions.lookup(opcode) else {
                break;
            };
            let mut immediates = SmallVec::new();
            for (k, &kind) in descr.immediates.iter().enumerate() {
                immediates.push((kind, self.word_at(bci + 1 + k as u16)));
            }
            out.push(DecodedInstruction {
                bci,
                opcode,
                name: descr.name.clone(),
                immediates,
            });
            bci += descr.length();
        }
        out
    }

    /// Count instructions whose descriptor name equals `name`.
    pub fn count_instructions(&self, name: &str) -> usize {
        self.instructions().iter().filter(|i| &*i.name == name).count()
    }

    /// The bci of the instruction owning cached-data slot `node`.
    pub fn find_bci_of_node(&self, node: u16) -> Option<u16> {
        for instr in self.instructions() {
            for (kind, value) in &instr.immediates {
                if *kind == ImmediateKind::Node && *value == node {
                    return Some(instr.bci);
                }
            }
        }
        None
    }

    /// Source attribution at `bci`: `(source, start, length)`.
    pub fn get_source_section_at_bci(&self, bci: u16) -> Option<(&Source, i32, i32)> {
        let mut found: Option<&SourceInfoEntry> = None;
        for entry in self.source_info.iter() {
            if entry.bci() <= bci {
                found = Some(entry);
            } else {
                break;
            }
        }
        let entry = found?;
        if entry.is_gap() {
            return None;
        }
        let source = self.sources.get(entry.source_index() as usize)?;
        Some((source, entry.start, entry.length))
    }

    pub fn source_info(&self) -> &[SourceInfoEntry] {
        &self.source_info
    }

    /// Render the bytecode for debugging.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "root {} ({} words, {} locals, max stack {})",
            self.language,
            self.bytecode_len(),
            self.num_locals,
            self.max_stack
        );
        for instr in self.instructions() {
            let imms: Vec<String> = instr
                .immediates
                .iter()
                .map(|(_, v)| format!("{}", v))
                .collect();
            let _ = writeln!(out, "  {:04}: {} {}", instr.bci, instr.name, imms.join(" "));
        }
        let entries: Vec<HandlerEntry> = self.handler_entries().collect();
        if !entries.is_empty() {
            let _ = writeln!(out, "exception handlers:");
            for e in entries {
                let _ = writeln!(
                    out,
                    "  [{:04}..{:04}) -> {:04} sp={} local={}",
                    e.start_bci, e.end_bci, e.handler_bci, e.start_sp, e.exc_local
                );
            }
        }
        out
    }

    /// A fresh copy with every opcode mapped back to its generic form
    /// and pristine tier, budget, cached data, and slot kinds.
    pub fn clone_uninitialized(&self) -> Arc<RootProgram> {
        let mut code = self.bytecode_snapshot();
        // Walk instruction-wise so immediate words are never touched.
        let mut bci = 0usize;
        while bci < code.len() {
            let opcode = code[bci];
            let Some(descr) = self.model.instructions.lookup(opcode) else {
                break;
            };
            code[bci] = self.model.instructions.undo_quickening(opcode);
            bci += descr.length() as usize;
        }
        RootProgram::new(
            self.model.clone(),
            self.language.clone(),
            code,
            self.constants.to_vec(),
            self.handlers.to_vec(),
            self.num_locals,
            self.num_nodes,
            self.num_profiles,
            self.max_stack,
            self.sources.to_vec(),
            self.source_info.to_vec(),
            self.boundaries.as_deref().map(|b| b.to_vec()),
            self.initial_budget,
        )
    }
}

impl std::fmt::Debug for RootProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootProgram")
            .field("language", &self.language)
            .field("words", &self.bytecode_len())
            .field("locals", &self.num_locals)
            .field("nodes", &self.num_nodes)
            .field("tier", &self.tier())
            .finish()
    }
}
