//! Interpreter metadata and interpreted-frame accessors.
//!
//! An interpreted frame keeps its state in fixed slots below the frame
//! pointer (see [`crate::arch`]). The method slot points at a [`Method`],
//! whose per-bytecode [`InterpreterOopMask`]s say which locals and
//! expression-stack entries hold references at each bytecode index.
//!
//! Monitors sit between the fixed slots and the expression stack. The block
//! bottom is a fixed address; its top moves down as locks are taken and is
//! stored in the `monitor_block_top` slot:
//!
//! ```text
//! fp - 9  ← monitor_begin (fixed)
//!         │ monitor n-1  [displaced header, object]
//!         │ ...
//!         │ monitor 0
//!         ← monitor_end (value of the monitor_block_top slot)
//! expression stack (entry 0 at monitor_end - 1, growing down to tos)
//! ```

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::address::StackAddr;
use crate::frame::Frame;

// =============================================================================
// InterpreterOopMask
// =============================================================================

/// Reference bitmap over locals followed by expression-stack entries.
///
/// Bit `i < max_locals` describes local `i`; bit `max_locals + j` describes
/// expression-stack entry `j`, counted from the bottom of the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpreterOopMask {
    bits: SmallVec<[u64; 2]>,
    size: usize,
}

impl InterpreterOopMask {
    /// Mask of `size` entries, none of them references.
    pub fn new(size: usize) -> Self {
        Self {
            bits: SmallVec::from_elem(0, size.div_ceil(64)),
            size,
        }
    }

    /// Mark entry `index` as a reference.
    pub fn with_oop(mut self, index: usize) -> Self {
        self.set_oop(index);
        self
    }

    /// Mark entry `index` as a reference.
    pub fn set_oop(&mut self, index: usize) {
        assert!(index < self.size, "mask index {index} out of range {}", self.size);
        self.bits[index / 64] |= 1u64 << (index % 64);
    }

    /// Check if entry `index` holds a reference.
    #[inline]
    pub fn is_oop(&self, index: usize) -> bool {
        index < self.size && self.bits[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of entries covered.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of reference entries.
    #[inline]
    pub fn num_oops(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of reference entries, ascending.
    pub fn oops(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |&i| self.is_oop(i))
    }
}

// =============================================================================
// Method
// =============================================================================

/// Interpreter view of a method.
#[derive(Debug, Clone)]
pub struct Method {
    name: String,
    bytecode: Box<[u8]>,
    max_locals: u16,
    is_native: bool,
    oop_masks: FxHashMap<u32, InterpreterOopMask>,
}

impl Method {
    /// A bytecode method.
    pub fn new(name: impl Into<String>, bytecode: impl Into<Box<[u8]>>, max_locals: u16) -> Self {
        Self {
            name: name.into(),
            bytecode: bytecode.into(),
            max_locals,
            is_native: false,
            oop_masks: FxHashMap::default(),
        }
    }

    /// A native method taking `parameter_slots` argument slots.
    ///
    /// Native methods have no bytecode; their locals are the parameters.
    pub fn native(name: impl Into<String>, parameter_slots: u16) -> Self {
        Self {
            name: name.into(),
            bytecode: Box::default(),
            max_locals: parameter_slots,
            is_native: true,
            oop_masks: FxHashMap::default(),
        }
    }

    /// Attach the reference mask for `bci`.
    pub fn with_oop_mask(mut self, bci: u32, mask: InterpreterOopMask) -> Self {
        self.oop_masks.insert(bci, mask);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Number of local slots (parameter slots for native methods).
    #[inline]
    pub fn max_locals(&self) -> usize {
        self.max_locals as usize
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.is_native
    }

    /// Address of bytecode index 0.
    #[inline]
    pub fn code_base(&self) -> usize {
        self.bytecode.as_ptr() as usize
    }

    /// Bytecode pointer for `bci`.
    #[inline]
    pub fn bcp_at(&self, bci: u32) -> usize {
        debug_assert!((bci as usize) <= self.bytecode.len());
        self.code_base() + bci as usize
    }

    /// Bytecode index of a bytecode pointer into this method.
    ///
    /// Native methods always report bci 0.
    pub fn bci_from(&self, bcp: usize) -> u32 {
        if self.is_native {
            return 0;
        }
        let bci = bcp.wrapping_sub(self.code_base());
        assert!(
            bci <= self.bytecode.len(),
            "bcp {bcp:#x} is outside method `{}`",
            self.name
        );
        bci as u32
    }

    /// Reference mask at `bci`, if one was computed.
    #[inline]
    pub fn mask_for(&self, bci: u32) -> Option<&InterpreterOopMask> {
        self.oop_masks.get(&bci)
    }
}

// =============================================================================
// Interpreted-frame accessors
// =============================================================================

impl Frame {
    #[inline]
    fn assert_interpreted(&self) {
        debug_assert!(self.is_interpreted_frame(), "not an interpreted frame: {self}");
    }

    #[inline]
    fn interpreter_slot(&self, offset: isize) -> usize {
        self.assert_interpreted();
        self.at(offset)
    }

    /// Unextended sp of the caller, saved on entry to the interpreter.
    pub fn interpreter_frame_sender_sp(&self) -> StackAddr {
        StackAddr::new(self.interpreter_slot(self.layout().interpreter_frame_sender_sp_offset))
    }

    /// Saved top of the expression stack, or `None` if no call is in progress.
    pub fn interpreter_frame_last_sp(&self) -> Option<StackAddr> {
        let last_sp = StackAddr::new(self.interpreter_slot(self.layout().interpreter_frame_last_sp_offset));
        (!last_sp.is_null()).then_some(last_sp)
    }

    /// Address of the method slot.
    pub fn interpreter_frame_method_addr(&self) -> StackAddr {
        self.addr_at(self.layout().interpreter_frame_method_offset)
    }

    /// The executing method.
    pub fn interpreter_frame_method(&self) -> &Method {
        let ptr = self.interpreter_slot(self.layout().interpreter_frame_method_offset) as *const Method;
        assert!(!ptr.is_null(), "interpreted frame without a method: {self}");
        // SAFETY: method slots of interpreted frames point at methods that
        // outlive the frame (see the `Frame` contract).
        unsafe { &*ptr }
    }

    /// Slot holding the mirror of the method's holder class.
    pub fn interpreter_frame_mirror_addr(&self) -> StackAddr {
        self.assert_interpreted();
        self.addr_at(self.layout().interpreter_frame_mirror_offset)
    }

    /// Method data pointer (0 when not profiling).
    pub fn interpreter_frame_mdp(&self) -> usize {
        self.interpreter_slot(self.layout().interpreter_frame_mdp_offset)
    }

    /// Constant-pool cache pointer.
    pub fn interpreter_frame_cache(&self) -> usize {
        self.interpreter_slot(self.layout().interpreter_frame_cache_offset)
    }

    /// Address of local 0.
    pub fn interpreter_frame_locals(&self) -> StackAddr {
        StackAddr::new(self.interpreter_slot(self.layout().interpreter_frame_locals_offset))
    }

    /// Address of local `index`; locals grow toward lower addresses.
    #[inline]
    pub fn interpreter_frame_local_at(&self, index: usize) -> StackAddr {
        self.interpreter_frame_locals().offset(-(index as isize))
    }

    /// Current bytecode pointer.
    pub fn interpreter_frame_bcp(&self) -> usize {
        self.interpreter_slot(self.layout().interpreter_frame_bcp_offset)
    }

    /// Current bytecode index.
    pub fn interpreter_frame_bci(&self) -> u32 {
        self.interpreter_frame_method()
            .bci_from(self.interpreter_frame_bcp())
    }

    /// Slot that keeps a native call's reference result alive.
    pub fn interpreter_frame_temp_oop_addr(&self) -> StackAddr {
        self.assert_interpreted();
        self.addr_at(self.layout().interpreter_frame_oop_temp_offset)
    }

    /// Top of the expression stack: the saved last sp, else the frame's sp.
    pub fn interpreter_frame_tos_address(&self) -> StackAddr {
        match self.interpreter_frame_last_sp() {
            Some(last_sp) => {
                debug_assert!(
                    last_sp <= self.interpreter_frame_monitor_end(),
                    "bad tos"
                );
                last_sp
            }
            None => self.sp(),
        }
    }

    /// Fixed high end of the monitor block.
    pub fn interpreter_frame_monitor_begin(&self) -> StackAddr {
        self.assert_interpreted();
        self.addr_at(self.layout().interpreter_frame_monitor_block_bottom_offset)
    }

    /// Moving low end of the monitor block.
    pub fn interpreter_frame_monitor_end(&self) -> StackAddr {
        StackAddr::new(self.interpreter_slot(self.layout().interpreter_frame_monitor_block_top_offset))
    }

    /// Number of monitors currently held.
    pub fn interpreter_frame_monitor_count(&self) -> usize {
        let words = self
            .interpreter_frame_monitor_begin()
            .words_since(self.interpreter_frame_monitor_end());
        assert!(words >= 0, "monitor block top above its bottom in {self}");
        words as usize / self.layout().monitor_size()
    }

    /// Monitor addresses, from the most recently acquired upward.
    pub fn interpreter_frame_monitors(&self) -> impl Iterator<Item = StackAddr> {
        let end = self.interpreter_frame_monitor_end();
        let size = self.layout().monitor_size() as isize;
        (0..self.interpreter_frame_monitor_count()).map(move |i| end.offset(i as isize * size))
    }

    /// Slot holding the object locked by the monitor at `monitor`.
    #[inline]
    pub fn interpreter_frame_monitor_obj_addr(monitor: StackAddr) -> StackAddr {
        monitor.offset(1)
    }

    /// Expression-stack entry 0.
    pub fn interpreter_frame_expression_stack(&self) -> StackAddr {
        self.interpreter_frame_monitor_end().offset(-1)
    }

    /// Expression-stack entry `offset`, counted from the bottom.
    #[inline]
    pub fn interpreter_frame_expression_stack_at(&self, offset: usize) -> StackAddr {
        self.interpreter_frame_expression_stack()
            .offset(-(offset as isize))
    }

    /// Number of live expression-stack entries.
    pub fn interpreter_frame_expression_stack_size(&self) -> usize {
        let size = self
            .interpreter_frame_monitor_end()
            .words_since(self.interpreter_frame_tos_address());
        size.max(0) as usize
    }

    /// Reference count of this frame: mask entries at the current bci, the
    /// holder mirror, and one per held monitor.
    pub fn interpreter_frame_num_oops(&self) -> usize {
        let method = self.interpreter_frame_method();
        let mask_oops = method
            .mask_for(self.interpreter_frame_bci())
            .map_or(0, InterpreterOopMask::num_oops);
        mask_oops + 1 + self.interpreter_frame_monitor_count()
    }
}

// =============================================================================
// Tests
// =============================================================================
