//! Typed stack of in-flight operations.
//!
//! Every `begin_*` pushes a frame carrying the operation's id, a
//! strictly increasing sequence number, its child count, the labels it
//! declared, and a kind-specific payload holding fixup positions for the
//! operation's control-flow state machine.

use smallvec::SmallVec;

/// Kind-specific payload of an operation frame.
#[derive(Debug, Clone)]
pub(crate) enum FrameData {
    None,
    IfThen {
        /// Immediate position of the condition's `branch.false`.
        false_fixup: u16,
    },
    IfThenElse {
        false_fixup: u16,
        end_fixup: u16,
    },
    Conditional {
        false_fixup: u16,
        end_fixup: u16,
        then_bci: u16,
        else_bci: u16,
    },
    While {
        start_bci: u16,
        end_fixup: u16,
    },
    TryCatch {
        try_start: u16,
        start_sp: u16,
        exc_local: u16,
        end_fixup: u16,
        /// Also the end of the guarded region (set after child 0).
        catch_start: u16,
    },
    FinallyTry {
        /// Index into the builder's finally-context arena.
        ctx: usize,
        /// Exception local for the rethrow path; `None` for
        /// `FinallyTryNoExcept`.
        exc_local: Option<u16>,
        body_start: u16,
        start_sp: u16,
    },
    Custom {
        instruction: u16,
        locals: SmallVec<[u16; 2]>,
        /// Variadic tail children seen so far.
        variadic_count: u32,
        /// Chunks already collapsed by `load.variadic`.
        chunks: u32,
    },
    ShortCircuit {
        instruction: u16,
        end_label: u32,
    },
    Source,
    SourceSection,
    InstrumentTag {
        tag: u16,
    },
    Return,
    Yield,
    StoreLocal {
        local: u16,
    },
    LoadLocalMaterialized {
        local: u16,
    },
    StoreLocalMaterialized {
        local: u16,
    },
}

/// One in-flight `begin_*` operation.
#[derive(Debug, Clone)]
pub(crate) struct OperationFrame {
    pub op_id: u16,
    /// Strictly increasing per root; identifies this frame without a
    /// reference (labels and finally contexts store it).
    pub seq: u32,
    pub child_count: u32,
    pub declared_labels: SmallVec<[u32; 2]>,
    /// Did the most recently completed child produce a value?
    pub prev_produced: bool,
    /// Bci at which this operation's code began.
    pub start_bci: u16,
    pub data: FrameData,
}

impl OperationFrame {
    pub fn new(op_id: u16, seq: u32, start_bci: u16, data: FrameData) -> Self {
        OperationFrame {
            op_id,
            seq,
            child_count: 0,
            declared_labels: SmallVec::new(),
            prev_produced: false,
            start_bci,
            data,
        }
    }
}
