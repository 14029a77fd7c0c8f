//! Continuation overlay interface.
//!
//! Lightweight continuations keep suspended frames in heap-allocated stack
//! chunks. When a mounted continuation returns to its bottom frame, control
//! passes through a return barrier instead of a real caller, so the native
//! stack at that point does not describe the logical sender. The freeze/thaw
//! engine that owns the chunks implements [`ContinuationOverlay`]; the walker
//! asks it whether a pc is a barrier and lets it supply senders across the
//! boundary.

use crate::address::{CodeAddr, StackAddr};
use crate::frame::Frame;
use crate::register_map::RegisterMap;
use crate::runtime::ManagedThread;

/// Hooks into the continuation (stack-chunk) engine.
pub trait ContinuationOverlay: Send + Sync {
    /// Check if `pc` is the continuation return barrier entry.
    fn is_return_barrier_entry(&self, pc: CodeAddr) -> bool;

    /// Produce the top frame of the continuation that `callee` returns into.
    ///
    /// Called when a sender computation lands on the return barrier and the
    /// register map allows walking into continuations.
    fn top_frame(&self, callee: &Frame, map: &mut RegisterMap<'_>) -> Frame;

    /// Patch the sender pc and sp of the continuation's bottom frame so they
    /// describe the continuation's real caller.
    fn fix_bottom_sender(
        &self,
        thread: Option<&ManagedThread>,
        callee: &Frame,
        sender_pc: &mut CodeAddr,
        sender_sp: &mut StackAddr,
    );

    /// Sender of `frame` when the walk is already inside a stack chunk.
    fn chunk_sender(&self, frame: &Frame, map: &mut RegisterMap<'_>) -> Frame;
}

/// Overlay for runtimes without continuations.
///
/// No pc is ever a return barrier, so the delegating hooks are unreachable
/// from a correct walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContinuations;

impl ContinuationOverlay for NoContinuations {
    #[inline]
    fn is_return_barrier_entry(&self, _pc: CodeAddr) -> bool {
        false
    }

    fn top_frame(&self, callee: &Frame, _map: &mut RegisterMap<'_>) -> Frame {
        panic!("walked into a continuation without a continuation engine (callee {callee})");
    }

    fn fix_bottom_sender(
        &self,
        _thread: Option<&ManagedThread>,
        callee: &Frame,
        _sender_pc: &mut CodeAddr,
        _sender_sp: &mut StackAddr,
    ) {
        panic!("continuation bottom fix-up without a continuation engine (callee {callee})");
    }

    fn chunk_sender(&self, frame: &Frame, _map: &mut RegisterMap<'_>) -> Frame {
        panic!("register map is inside a continuation but no engine is installed (frame {frame})");
    }
}
