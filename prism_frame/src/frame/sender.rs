//! Sender resolution.
//!
//! Each frame kind has its own way of finding the caller:
//!
//! | Kind            | Caller found through                                  |
//! |-----------------|-------------------------------------------------------|
//! | entry           | frame anchor in the call wrapper                      |
//! | optimized entry | frame anchor in the adapter's frame data              |
//! | interpreted     | fp-relative slots (saved sender sp, link, return pc)  |
//! | compiled / stub | unextended sp + blob frame size                       |
//! | native          | fp chain                                              |
//!
//! Compiled and interpreted transitions may land on the continuation return
//! barrier; the overlay then either supplies the sender or patches it.

use std::sync::Arc;

use tracing::trace;

use super::{Frame, FrameKind};
use crate::address::{CodeAddr, StackAddr};
use crate::code::CodeBlob;
use crate::register_map::RegisterMap;
use crate::runtime::FrameAnchor;

impl Frame {
    /// The caller of this frame.
    ///
    /// Updates `map` as the transition requires and, for processing walks
    /// outside continuations, reports the sender to the stack watermark.
    pub fn sender(&self, map: &mut RegisterMap<'_>) -> Frame {
        let sender = self.sender_raw(map);
        if map.process_frames() && !map.in_continuation() {
            if let Some(watermark) = map.runtime().stack_watermark() {
                watermark.on_iteration(map.thread(), &sender);
            }
        }
        sender
    }

    /// The caller of this frame, without stack watermark processing.
    pub fn sender_raw(&self, map: &mut RegisterMap<'_>) -> Frame {
        // Only a stub transition turns argument scanning back on.
        map.set_include_argument_oops(false);

        let rt = map.runtime();
        if map.in_continuation() {
            trace!(frame = %self, "sender inside continuation chunk");
            return rt.continuations().chunk_sender(self, map);
        }

        trace!(kind = %self.kind, pc = %self.pc, usp = %self.unextended_sp, "computing sender");
        match self.kind {
            FrameKind::Entry => self.sender_for_entry_frame(map),
            FrameKind::OptimizedEntry => self.sender_for_optimized_entry_frame(map),
            FrameKind::Interpreted => self.sender_for_interpreter_frame(map),
            FrameKind::Compiled => match self.cb.as_ref() {
                Some(cb) => self.sender_for_compiled_frame(map, cb),
                None => unreachable!("compiled frame without a code blob"),
            },
            FrameKind::Native => self.sender_for_native_frame(map),
        }
    }

    fn sender_for_entry_frame(&self, map: &mut RegisterMap<'_>) -> Frame {
        let anchor = *self.entry_frame_call_wrapper().anchor();
        self.sender_from_anchor(map, anchor)
    }

    fn sender_for_optimized_entry_frame(&self, map: &mut RegisterMap<'_>) -> Frame {
        let anchor = self.optimized_entry_frame_anchor();
        self.sender_from_anchor(map, anchor)
    }

    /// Skip the native frames between an entry frame and the managed frame
    /// recorded in `anchor`.
    fn sender_from_anchor(&self, map: &mut RegisterMap<'_>, anchor: FrameAnchor) -> Frame {
        assert!(!anchor.is_empty(), "next managed fp must be non zero ({self})");
        assert!(
            anchor.last_sp > self.sp,
            "anchor sp {} must be above this frame on stack ({self})",
            anchor.last_sp
        );
        map.clear();
        debug_assert!(map.include_argument_oops(), "should be set by clear");

        let rt = map.runtime();
        // SAFETY: a non-empty anchor describes a walkable frame on the same
        // stack (frame contract).
        unsafe {
            let pc = anchor.walkable_pc(rt.layout());
            Frame::new(rt, anchor.last_sp, anchor.last_fp, pc)
        }
    }

    fn sender_for_interpreter_frame(&self, map: &mut RegisterMap<'_>) -> Frame {
        let rt = map.runtime();
        // Raw sp of the sender, after any adapter or locals extension.
        let mut sender_sp = self.sender_sp();
        // Sender sp before the extension.
        let unextended_sp = self.interpreter_frame_sender_sp();
        let sender_fp = self.link();

        if map.update_map() {
            Frame::update_map_with_saved_link(map, self.addr_at(self.layout.link_offset));
        }

        let mut sender_pc = self.sender_pc();
        if let Some(frame) = self.cross_return_barrier(map, &mut sender_pc, &mut sender_sp) {
            return frame;
        }

        // SAFETY: the saved slots of this frame describe its caller on the
        // same stack (frame contract).
        unsafe { Frame::with_unextended_sp(rt, sender_sp, unextended_sp, sender_fp, sender_pc) }
    }

    fn sender_for_compiled_frame(&self, map: &mut RegisterMap<'_>, cb: &Arc<CodeBlob>) -> Frame {
        let rt = map.runtime();
        let layout = self.layout;

        // Compiled code may use fp as a general register, so the caller is
        // found from the unextended sp and the declared frame size.
        let frame_size = cb.frame_size();
        assert!(
            frame_size >= 0,
            "code blob `{}` has unknown frame size {frame_size}",
            cb.name()
        );
        let mut sender_sp = self.unextended_sp.offset(frame_size as isize);
        debug_assert!(frame_size == 0 || sender_sp == self.real_fp());

        // SAFETY: the return address is the word below the sender sp.
        let mut sender_pc = layout
            .pointer_auth
            .strip(unsafe { sender_sp.offset(-1).read_word() });
        let saved_fp_addr = sender_sp.offset(-layout.sender_sp_offset);

        if map.update_map() {
            if cb.is_compiled() {
                // Compiled methods save no callee-saved registers.
                debug_assert!(!cb.caller_must_gc_arguments(map.thread()));
                debug_assert!(!map.include_argument_oops());
                debug_assert!(
                    self.oop_map().map_or(true, |m| !m.has_callee_saved()),
                    "callee-saved value in compiled frame"
                );
            } else {
                map.set_include_argument_oops(cb.caller_must_gc_arguments(map.thread()));
                if let Some(oop_map) = self.oop_map() {
                    oop_map.update_register_map(self, map);
                }
            }
            // The prologue saves fp without an oop-map entry.
            Frame::update_map_with_saved_link(map, saved_fp_addr);
        }

        if let Some(frame) = self.cross_return_barrier(map, &mut sender_pc, &mut sender_sp) {
            return frame;
        }

        // SAFETY: saved_fp_addr lies in this frame.
        let sender_fp = unsafe { saved_fp_addr.read_addr() };
        let unextended_sp = sender_sp;
        let sender_cb = rt.code().find_blob_fast(sender_pc);
        // SAFETY: the sender occupies the stack above this frame (frame
        // contract).
        unsafe {
            match sender_cb {
                Some(sender_cb) => {
                    Frame::with_blob(rt, sender_sp, unextended_sp, sender_fp, sender_pc, sender_cb)
                }
                // Foreign code: no metadata, not an error.
                None => Frame::build_checked(rt, sender_sp, unextended_sp, sender_fp, sender_pc, None),
            }
        }
    }

    fn sender_for_native_frame(&self, map: &mut RegisterMap<'_>) -> Frame {
        let rt = map.runtime();
        // SAFETY: native frames keep a standard fp chain (frame contract).
        unsafe { Frame::new(rt, self.sender_sp(), self.link(), self.sender_pc()) }
    }

    /// Handle a sender pc that is the continuation return barrier.
    ///
    /// Returns the sender when the overlay supplies it; otherwise lets the
    /// overlay patch `sender_pc` and `sender_sp` and returns `None`.
    fn cross_return_barrier(
        &self,
        map: &mut RegisterMap<'_>,
        sender_pc: &mut CodeAddr,
        sender_sp: &mut StackAddr,
    ) -> Option<Frame> {
        let overlay = map.runtime().continuations();
        if !overlay.is_return_barrier_entry(*sender_pc) {
            return None;
        }
        if map.walk_continuations() {
            trace!(callee = %self, "walking into continuation");
            return Some(overlay.top_frame(self, map));
        }
        overlay.fix_bottom_sender(map.thread(), self, sender_pc, sender_sp);
        trace!(pc = %sender_pc, sp = %sender_sp, "patched continuation bottom sender");
        None
    }
}
