//! GC root enumeration.
//!
//! The walker never reads or moves references itself here; it hands every
//! reference-bearing stack location to an [`OopClosure`] supplied by the
//! collector.

use super::{Frame, FrameKind};
use crate::address::StackAddr;
use crate::register_map::RegisterMap;

/// Visitor for reference locations.
pub trait OopClosure {
    /// `slot` holds a full-width reference.
    fn do_oop(&mut self, slot: StackAddr);

    /// `slot` holds a compressed reference.
    fn do_narrow_oop(&mut self, slot: StackAddr) {
        self.do_oop(slot);
    }

    /// `derived` holds an interior pointer into the object referenced from
    /// `base`. Collectors that move objects must rebase it after `base`.
    fn do_derived_oop(&mut self, base: StackAddr, derived: StackAddr) {
        let _ = (base, derived);
    }
}

impl Frame {
    /// Report every reference location of this frame.
    ///
    /// `map` must be the register map that produced this frame, so register
    /// entries of the oop map resolve to their save locations.
    pub fn oops_do(&self, map: &RegisterMap<'_>, closure: &mut dyn OopClosure) {
        match self.kind {
            FrameKind::Interpreted => self.oops_interpreted_do(closure),
            FrameKind::Compiled => {
                if let Some(oop_map) = self.oop_map() {
                    oop_map.oops_do(self, map, closure);
                }
            }
            // Entry frames and upcall adapters keep their arguments in
            // handles owned by the native caller; native frames have none.
            FrameKind::Entry | FrameKind::OptimizedEntry | FrameKind::Native => {}
        }
    }

    fn oops_interpreted_do(&self, closure: &mut dyn OopClosure) {
        for monitor in self.interpreter_frame_monitors() {
            closure.do_oop(Frame::interpreter_frame_monitor_obj_addr(monitor));
        }

        let method = self.interpreter_frame_method();
        if method.is_native() {
            closure.do_oop(self.interpreter_frame_temp_oop_addr());
        }

        // The method slot is the only path to the holder class, so its mirror
        // is a root.
        closure.do_oop(self.interpreter_frame_mirror_addr());

        let Some(mask) = method.mask_for(self.interpreter_frame_bci()) else {
            return;
        };
        let max_locals = method.max_locals();
        let tos = self.interpreter_frame_tos_address();
        for index in mask.oops() {
            if index < max_locals {
                closure.do_oop(self.interpreter_frame_local_at(index));
            } else {
                let slot = self.interpreter_frame_expression_stack_at(index - max_locals);
                // Entries above the current tos are dead.
                if slot >= tos {
                    closure.do_oop(slot);
                }
            }
        }
    }
}
