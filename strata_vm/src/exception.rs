//! Exception dispatch.
//!
//! The handler table is scanned linearly; entries were sorted at
//! `end_root` so the first match is the innermost enclosing handler.
//! Unwinding truncates the operand stack to the handler's entry height
//! and writes the exception value into the handler's designated local.

use crate::frame::Frame;
use std::sync::Arc;
use strata_compiler::{HandlerEntry, RootProgram};
use strata_core::{Value, VmResult};

/// First handler covering `bci`.
pub fn find_handler(root: &Arc<RootProgram>, bci: u16) -> Option<HandlerEntry> {
    root.handler_entries()
        .find(|e| e.start_bci <= bci && bci < e.end_bci)
}

/// Unwind `frame` into `entry` with the thrown `value`; returns the
/// handler's entry bci.
pub fn enter_handler(frame: &mut Frame, entry: &HandlerEntry, value: Value) -> VmResult<u16> {
    frame.stack.truncate(entry.start_sp as usize);
    frame.set_local(entry.exc_local, value)?;
    Ok(entry.handler_bci)
}
