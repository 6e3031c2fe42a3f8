//! Coroutine suspension.
//!
//! `Yield` is an ordinary instruction: it stores the resume bci into
//! the reserved bci slot, copies the live operand stack into a saved
//! frame, and returns a coroutine value to the caller. Resumption is a
//! separate entry on [`Machine`](crate::Machine) that rebuilds a frame
//! from the saved state, pushes the sent value, and continues at the
//! recorded bci.

use crate::frame::Frame;
use std::sync::Arc;
use strata_core::{ContinuationLocation, CoroutineState, SavedFrame, Value, BCI_SLOT};

/// Capture `frame` at a yield point into a coroutine value.
pub fn suspend(frame: &Frame, location: ContinuationLocation, yielded: Value) -> Value {
    let mut locals = frame.locals.clone();
    if let Some(slot) = locals.get_mut(BCI_SLOT as usize) {
        *slot = Value::Int(location.bci as i64);
    }
    let keep = (location.sp as usize).min(frame.stack.len());
    let stack = frame.stack[..keep].to_vec();
    Value::Coroutine(Arc::new(CoroutineState::new(
        location,
        yielded,
        SavedFrame { locals, stack },
    )))
}

/// Rebuild the suspended frame with `sent` as the yield's value.
pub fn resume_frame(saved: SavedFrame, sent: Value) -> Frame {
    let mut frame = Frame::resumed(saved.locals, saved.stack);
    frame.push(sent);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspend_records_bci_and_trims_stack() {
        let mut frame = Frame::resumed(vec![Value::Null, Value::Int(5)], vec![]);
        frame.push(Value::Int(10));
        frame.push(Value::Int(20));
        let location = ContinuationLocation { bci: 9, sp: 1 };
        let suspended = suspend(&frame, location, Value::Int(99));
        let Value::Coroutine(state) = suspended else {
            panic!("expected a coroutine");
        };
        assert_eq!(state.yielded, Value::Int(99));
        assert_eq!(state.location.bci, 9);
        let saved = state.take_frame().unwrap();
        assert_eq!(saved.locals[BCI_SLOT as usize], Value::Int(9));
        assert_eq!(saved.stack, vec![Value::Int(10)]);
    }
}
