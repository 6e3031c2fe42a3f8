//! Growable 16-bit bytecode buffer with parallel arrays.
//!
//! The buffer is append-only and addressed by bytecode index (bci), the
//! offset of an instruction's opcode word. Alongside the code array it
//! owns the source-info triples, the flat exception-handler table (five
//! i32 words per entry), and, when basic-block tracing is enabled, a
//! boundary flag per word plus one trailing flag so a boundary can be
//! marked before any instruction exists.

use strata_core::{BuildResult, BuilderError, SourceInfoEntry};

/// Words in an exception-handler entry:
/// `(start_bci, end_bci, handler_bci, start_sp, exc_local)`.
pub const HANDLER_ENTRY_WORDS: usize = 5;

/// Highest addressable bci (`0xFFFF` is the unresolved sentinel).
pub const MAX_BCI: usize = 0xFFFE;

#[derive(Debug, Clone)]
pub struct BytecodeBuffer {
    bc: Vec<u16>,
    source_info: Vec<SourceInfoEntry>,
    ex_handlers: Vec<i32>,
    /// `bc.len() + 1` flags when tracing; empty otherwise.
    boundaries: Vec<bool>,
    tracing: bool,
}

impl BytecodeBuffer {
    pub fn new(tracing: bool) -> Self {
        BytecodeBuffer {
            bc: Vec::new(),
            source_info: Vec::new(),
            ex_handlers: Vec::new(),
            boundaries: if tracing { vec![false] } else { Vec::new() },
            tracing,
        }
    }

    /// Current length in words; the bci the next instruction gets.
    #[inline]
    pub fn len(&self) -> u16 {
        self.bc.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.bc.is_empty()
    }

    /// Append one word.
    pub fn push_word(&mut self, word: u16) -> BuildResult<()> {
        if self.bc.len() >= MAX_BCI {
            return Err(BuilderError::BytecodeOverflow);
        }
        self.bc.push(word);
        if self.tracing {
            self.boundaries.push(false);
        }
        Ok(())
    }

    /// Append an opcode and its immediates; returns the instruction's bci.
    pub fn push_instruction(&mut self, opcode: u16, immediates: &[u16]) -> BuildResult<u16> {
        let bci = self.len();
        self.push_word(opcode)?;
        for &imm in immediates {
            self.push_word(imm)?;
        }
        Ok(bci)
    }

    #[inline]
    pub fn read(&self, at: u16) -> u16 {
        self.bc[at as usize]
    }

    /// Overwrite the word at `at` (branch fixups).
    #[inline]
    pub fn patch(&mut self, at: u16, value: u16) {
        self.bc[at as usize] = value;
    }

    /// Mark `bci` as a basic-block boundary. `bci` may equal `len()`.
    pub fn mark_boundary(&mut self, bci: u16) {
        if self.tracing {
            if let Some(flag) = self.boundaries.get_mut(bci as usize) {
                *flag = true;
            }
        }
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing
    }

    // =========================================================================
    // Parallel Arrays
    // =========================================================================

    pub fn push_handler(
        &mut self,
        start: u16,
        end: u16,
        handler: u16,
        start_sp: u16,
        exc_local: u16,
    ) {
        self.ex_handlers.extend_from_slice(&[
            start as i32,
            end as i32,
            handler as i32,
            start_sp as i32,
            exc_local as i32,
        ]);
    }

    pub fn push_source(&mut self, entry: SourceInfoEntry) {
        self.source_info.push(entry);
    }

    pub fn handlers(&self) -> &[i32] {
        &self.ex_handlers
    }

    pub fn source_info(&self) -> &[SourceInfoEntry] {
        &self.source_info
    }

    pub fn boundaries(&self) -> &[bool] {
        &self.boundaries
    }

    pub fn code(&self) -> &[u16] {
        &self.bc
    }

    /// Sort handler entries so a linear first-match scan is
    /// innermost-first: by end ascending, then start descending.
    /// The sort is stable, preserving emission order for disjoint
    /// regions.
    pub fn sort_handlers(&mut self) {
        let mut entries: Vec<[i32; HANDLER_ENTRY_WORDS]> = self
            .ex_handlers
            .chunks(HANDLER_ENTRY_WORDS)
            .map(|c| [c[0], c[1], c[2], c[3], c[4]])
            .collect();
        entries.sort_by(|a, b| a[1].cmp(&b[1]).then(b[0].cmp(&a[0])));
        self.ex_handlers.clear();
        for e in entries {
            self.ex_handlers.extend_from_slice(&e);
        }
    }

    /// Tear the buffer apart for freezing.
    pub fn into_parts(self) -> (Vec<u16>, Vec<SourceInfoEntry>, Vec<i32>, Vec<bool>) {
        (self.bc, self.source_info, self.ex_handlers, self.boundaries)
    }
}
