//! Label arena and unresolved-branch registry.
//!
//! Labels are tokens into an arena owned by the builder. A label is
//! declared by an operation frame (identified by sequence number),
//! optionally scoped to the finally handler under construction when it
//! was created, and emitted at most once.
//!
//! The registry holds branch sites waiting for a label. It is part of
//! the context-sensitive builder state: entering a finally handler swaps
//! it for an empty one, and the sites left at handler freeze become the
//! handler's reverse map (re-registered at every replay).

use rustc_hash::FxHashMap;
use strata_core::UNINIT_BCI;

/// Arena slot for one label.
#[derive(Debug, Clone)]
pub struct LabelInfo {
    /// `UNINIT_BCI` until emitted; immutable afterwards.
    pub bci: u16,
    /// Stack height at the emission site (valid once emitted).
    pub height: u16,
    /// Sequence number of the declaring operation frame.
    pub declaring_seq: u32,
    /// Sequence number of the finally handler under construction when
    /// the label was created, if any.
    pub handler_scope: Option<u32>,
}

impl LabelInfo {
    #[inline]
    pub fn is_emitted(&self) -> bool {
        self.bci != UNINIT_BCI
    }
}

#[derive(Debug, Default)]
pub struct LabelArena {
    labels: Vec<LabelInfo>,
}

impl LabelArena {
    pub fn new() -> Self {
        LabelArena::default()
    }

    pub fn create(&mut self, declaring_seq: u32, handler_scope: Option<u32>) -> u32 {
        let id = self.labels.len() as u32;
        self.labels.push(LabelInfo {
            bci: UNINIT_BCI,
            height: 0,
            declaring_seq,
            handler_scope,
        });
        id
    }

    #[inline]
    pub fn get(&self, id: u32) -> &LabelInfo {
        &self.labels[id as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: u32) -> &mut LabelInfo {
        &mut self.labels[id as usize]
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A branch immediate waiting for its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedSite {
    /// Position of the immediate word, not of the opcode.
    pub imm_bci: u16,
    /// Operand stack height on the taken edge.
    pub stack_height: u16,
}

/// Pending fixups per label for the current buffer.
#[derive(Debug, Default)]
pub struct BranchRegistry {
    pending: FxHashMap<u32, Vec<UnresolvedSite>>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        BranchRegistry::default()
    }

    pub fn register(&mut self, label: u32, site: UnresolvedSite) {
        self.pending.entry(label).or_default().push(site);
    }

    /// Take all sites waiting for `label`.
    pub fn resolve(&mut self, label: u32) -> Vec<UnresolvedSite> {
        self.pending.remove(&label).unwrap_or_default()
    }

    /// Drain every pending site as `(label, site)` pairs (handler
    /// freeze).
    pub fn drain_all(&mut self) -> Vec<(u32, UnresolvedSite)> {
        let mut out = Vec::new();
        for (label, sites) in self.pending.drain() {
            for site in sites {
                out.push((label, site));
            }
        }
        out.sort_by_key(|(_, s)| s.imm_bci);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_scoping() {
        let mut arena = LabelArena::new();
        let a = arena.create(3, None);
        let b = arena.create(4, Some(7));
        assert!(!arena.get(a).is_emitted());
        assert_eq!(arena.get(b).handler_scope, Some(7));
        arena.get_mut(a).bci = 10;
        assert!(arena.get(a).is_emitted());
    }

    #[test]
    fn test_registry_drain_is_ordered() {
        let mut reg = BranchRegistry::new();
        reg.register(1, UnresolvedSite { imm_bci: 9, stack_height: 0 });
        reg.register(0, UnresolvedSite { imm_bci: 3, stack_height: 1 });
        reg.register(1, UnresolvedSite { imm_bci: 5, stack_height: 0 });
        let drained = reg.drain_all();
        let imms: Vec<u16> = drained.iter().map(|(_, s)| s.imm_bci).collect();
        assert_eq!(imms, vec![3, 5, 9]);
        assert!(reg.is_empty());
    }
}
