//! The frame model.
//!
//! A [`Frame`] describes one activation record on a native stack at a point
//! in time: its stack pointers, frame pointer, pc and the code blob covering
//! that pc. Frames are cheap values, rebuilt at each step of a walk.
//!
//! # Frame contract
//!
//! Frame constructors are `unsafe`: the caller promises that the stack the
//! frame describes is readable, is not being pushed onto concurrently (the
//! owning thread is stopped or is the walking thread) and stays that way for
//! as long as the frame, or any frame derived from it through
//! [`Frame::sender`], is used. The method slot of an interpreted frame and
//! the call-wrapper slot of an entry frame must point at live objects.
//! Under that contract the accessors below are safe.
//!
//! # Classification
//!
//! Every frame has exactly one [`FrameKind`], decided at construction in a
//! fixed priority order:
//!
//! 1. `Entry`: the pc is a return address into the call stub.
//! 2. `OptimizedEntry`: the blob is a foreign-call upcall adapter.
//! 3. `Interpreted`: the pc lies in the interpreter.
//! 4. `Compiled`: some code blob covers the pc (compiled method or stub).
//! 5. `Native`: nothing is known about the pc.

mod oops;
mod sender;

pub use oops::OopClosure;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::address::{CodeAddr, StackAddr, WORD_SIZE};
use crate::arch::FrameLayout;
use crate::barrier::Oop;
use crate::code::{CodeBlob, ImmutableOopMap, OopMapHandle};
use crate::register_map::RegisterMap;
use crate::runtime::{CallWrapper, FrameAnchor, FrameRuntime};
use crate::vmreg::{VmReg, STACK_SLOT_SIZE};

// =============================================================================
// DeoptState / FrameKind
// =============================================================================

/// Whether a frame's pc was redirected to a deoptimization handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptState {
    /// Not yet determined.
    Unknown,
    /// The pc is the frame's real pc.
    NotDeoptimized,
    /// The frame was deoptimized; its pc is the recovered original pc.
    Deoptimized,
}

/// Frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Native code called into managed code through the call stub.
    Entry,
    /// Managed code entered through a foreign calling convention.
    OptimizedEntry,
    /// Interpreted method.
    Interpreted,
    /// Generated code described by a blob: compiled method or runtime stub.
    Compiled,
    /// Code with no metadata.
    Native,
}

impl FrameKind {
    fn classify(rt: &FrameRuntime, pc: CodeAddr, cb: Option<&CodeBlob>) -> Self {
        if rt.returns_to_call_stub(pc) {
            FrameKind::Entry
        } else if cb.is_some_and(CodeBlob::is_optimized_entry_blob) {
            FrameKind::OptimizedEntry
        } else if rt.is_interpreter_pc(pc) {
            FrameKind::Interpreted
        } else if cb.is_some() {
            FrameKind::Compiled
        } else {
            FrameKind::Native
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameKind::Entry => "entry",
            FrameKind::OptimizedEntry => "optimized entry",
            FrameKind::Interpreted => "interpreted",
            FrameKind::Compiled => "compiled",
            FrameKind::Native => "native",
        })
    }
}

// =============================================================================
// Frame
// =============================================================================

/// One activation record.
#[derive(Clone)]
pub struct Frame {
    sp: StackAddr,
    /// `sp` before adapter extension; the frame's identity.
    unextended_sp: StackAddr,
    fp: StackAddr,
    pc: CodeAddr,
    cb: Option<Arc<CodeBlob>>,
    oop_map: Option<OopMapHandle>,
    deopt_state: DeoptState,
    kind: FrameKind,
    layout: &'static FrameLayout,
}

// =============================================================================
// Construction
// =============================================================================

impl Frame {
    /// Frame for `(sp, fp, pc)`, resolving the blob with the general lookup.
    ///
    /// # Safety
    ///
    /// See the module-level frame contract.
    ///
    /// # Panics
    ///
    /// Panics if `pc` is null or signed.
    pub unsafe fn new(rt: &FrameRuntime, sp: StackAddr, fp: StackAddr, pc: CodeAddr) -> Frame {
        let cb = rt.code().find_blob(pc);
        // SAFETY: upheld by the caller.
        unsafe { Self::build_checked(rt, sp, sp, fp, pc, cb) }
    }

    /// Frame whose blob is already known.
    ///
    /// # Safety
    ///
    /// See the module-level frame contract; `cb` must cover `pc`.
    pub unsafe fn with_blob(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
        cb: Arc<CodeBlob>,
    ) -> Frame {
        // SAFETY: upheld by the caller.
        unsafe { Self::build_checked(rt, sp, unextended_sp, fp, pc, Some(cb)) }
    }

    /// Frame whose blob and oop map are already known.
    ///
    /// # Safety
    ///
    /// See the module-level frame contract; `cb` must cover `pc` and
    /// `oop_map` must come from `cb`'s oop map set.
    pub unsafe fn with_oop_map(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
        cb: Arc<CodeBlob>,
        oop_map: Option<OopMapHandle>,
    ) -> Frame {
        assert!(!pc.is_null(), "no pc?");
        // SAFETY: upheld by the caller.
        unsafe { Self::build(rt, sp, unextended_sp, fp, pc, Some(cb), oop_map) }
    }

    /// Frame known not to be deoptimized, skipping original-pc recovery.
    ///
    /// Used by code that builds frames it just laid out itself (continuation
    /// thaw). Debug builds re-run the recovery and check that it agrees.
    ///
    /// # Safety
    ///
    /// See the module-level frame contract. The caller must guarantee that
    /// `pc` is not a deoptimization handler entry.
    pub unsafe fn new_not_deoptimized(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
        cb: Option<Arc<CodeBlob>>,
        oop_map: Option<OopMapHandle>,
    ) -> Frame {
        let mut frame = Self::assemble(rt, sp, unextended_sp, fp, pc, cb, oop_map);
        frame.deopt_state = DeoptState::NotDeoptimized;
        if cfg!(debug_assertions) && frame.cb.is_some() {
            let mut check = frame.clone();
            // SAFETY: upheld by the caller.
            unsafe { check.setup() };
            assert!(
                check.pc == pc && check.deopt_state == DeoptState::NotDeoptimized,
                "frame assumed not deoptimized is deoptimized: {check}"
            );
        }
        frame
    }

    /// Frame with an explicit unextended sp, resolving the blob with the fast
    /// lookup. A pc with no blob yields a native frame.
    ///
    /// # Safety
    ///
    /// See the module-level frame contract.
    ///
    /// # Panics
    ///
    /// Panics if `pc` is null or signed.
    pub unsafe fn with_unextended_sp(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
    ) -> Frame {
        let cb = rt.code().find_blob_fast(pc);
        // SAFETY: upheld by the caller.
        unsafe { Self::build_checked(rt, sp, unextended_sp, fp, pc, cb) }
    }

    /// Frame whose caller pushed a return address and saved fp just below
    /// `sp`, as a callee sees it right after the call.
    ///
    /// # Safety
    ///
    /// See the module-level frame contract; the words below `sp` must be a
    /// return address and a saved fp.
    pub unsafe fn from_sp(rt: &FrameRuntime, sp: StackAddr) -> Frame {
        let layout = rt.layout();
        // SAFETY: upheld by the caller.
        let (fp, raw_pc) = unsafe {
            (
                sp.offset(-layout.sender_sp_offset).read_addr(),
                sp.offset(-1).read_word(),
            )
        };
        // SAFETY: upheld by the caller.
        unsafe { Self::with_unextended_sp(rt, sp, sp, fp, layout.pointer_auth.strip(raw_pc)) }
    }

    /// Best-effort frame for a thread interrupted at an arbitrary instruction.
    ///
    /// The pc is read from the word below `sp` and may be junk: nothing about
    /// it is asserted. A junk pc resolves to no blob and classifies as
    /// [`FrameKind::Native`].
    ///
    /// # Safety
    ///
    /// `sp` and the word below it must be readable.
    pub unsafe fn for_signal_handler(rt: &FrameRuntime, sp: StackAddr, fp: StackAddr) -> Frame {
        let layout = rt.layout();
        // SAFETY: upheld by the caller.
        let pc = layout.pointer_auth.strip(unsafe { sp.offset(-1).read_word() });
        let cb = rt.code().find_blob(pc);
        let mut frame = Self::assemble(rt, sp, sp, fp, pc, cb, None);
        frame.adjust_unextended_sp();
        // SAFETY: upheld by the caller; recovery only reads the frame when
        // the pc is exactly a deoptimization handler entry.
        match unsafe { frame.deopt_original_pc() } {
            Some(original) => {
                frame.pc = original;
                frame.deopt_state = DeoptState::Deoptimized;
            }
            None => frame.deopt_state = DeoptState::NotDeoptimized,
        }
        frame
    }

    #[inline]
    fn check_pc(layout: &FrameLayout, pc: CodeAddr) {
        assert!(!pc.is_null(), "no pc?");
        assert!(
            layout.pointer_auth.is_raw(pc.addr()),
            "pc {pc} cannot be signed"
        );
    }

    fn assemble(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
        cb: Option<Arc<CodeBlob>>,
        oop_map: Option<OopMapHandle>,
    ) -> Frame {
        let kind = FrameKind::classify(rt, pc, cb.as_deref());
        Frame {
            sp,
            unextended_sp,
            fp,
            pc,
            cb,
            oop_map,
            deopt_state: DeoptState::Unknown,
            kind,
            layout: rt.layout(),
        }
    }

    unsafe fn build_checked(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
        cb: Option<Arc<CodeBlob>>,
    ) -> Frame {
        Self::check_pc(rt.layout(), pc);
        // SAFETY: upheld by the caller.
        unsafe { Self::build(rt, sp, unextended_sp, fp, pc, cb, None) }
    }

    unsafe fn build(
        rt: &FrameRuntime,
        sp: StackAddr,
        unextended_sp: StackAddr,
        fp: StackAddr,
        pc: CodeAddr,
        cb: Option<Arc<CodeBlob>>,
        oop_map: Option<OopMapHandle>,
    ) -> Frame {
        let mut frame = Self::assemble(rt, sp, unextended_sp, fp, pc, cb, oop_map);
        // SAFETY: upheld by the caller.
        unsafe { frame.setup() };
        frame
    }

    /// Normalize the unextended sp, then recover the original pc of a
    /// deoptimized frame.
    unsafe fn setup(&mut self) {
        self.adjust_unextended_sp();

        // SAFETY: upheld by the caller.
        if let Some(original) = unsafe { self.deopt_original_pc() } {
            debug!(
                from = %self.pc,
                to = %original,
                usp = %self.unextended_sp,
                "recovered original pc of deoptimized frame"
            );
            self.pc = original;
            self.deopt_state = DeoptState::Deoptimized;
            debug_assert!(
                self.cb
                    .as_deref()
                    .map_or(true, |cb| cb.insts().contains_inclusive(original)),
                "original pc must be in the main code section of the compiled method"
            );
        } else if self.cb.as_deref().is_some_and(CodeBlob::is_deoptimization_stub) {
            self.deopt_state = DeoptState::Deoptimized;
        } else {
            self.deopt_state = DeoptState::NotDeoptimized;
        }
    }

    /// Callers returning from a method-handle invoke run on an extended
    /// stack; their identity is the frame pointer.
    fn adjust_unextended_sp(&mut self) {
        if let Some(cb) = self.cb.as_deref() {
            if cb.is_method_handle_return(self.pc) {
                self.unextended_sp = self.fp;
            }
        }
    }

    /// The pre-deoptimization pc saved in the frame, if the pc is a
    /// deoptimization handler entry of a compiled method.
    unsafe fn deopt_original_pc(&self) -> Option<CodeAddr> {
        let cb = self.cb.as_deref()?;
        let info = cb.as_compiled_method()?;
        if !cb.is_deopt_pc(self.pc) {
            return None;
        }
        let slot = self.unextended_sp.byte_offset(info.orig_pc_offset as isize);
        // SAFETY: upheld by the caller.
        Some(CodeAddr::new(unsafe { slot.read_word() }))
    }
}

// =============================================================================
// Accessors
// =============================================================================

impl Frame {
    #[inline]
    pub fn sp(&self) -> StackAddr {
        self.sp
    }

    #[inline]
    pub fn unextended_sp(&self) -> StackAddr {
        self.unextended_sp
    }

    #[inline]
    pub fn fp(&self) -> StackAddr {
        self.fp
    }

    #[inline]
    pub fn pc(&self) -> CodeAddr {
        self.pc
    }

    /// Code blob covering the pc.
    #[inline]
    pub fn cb(&self) -> Option<&Arc<CodeBlob>> {
        self.cb.as_ref()
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    #[inline]
    pub fn deopt_state(&self) -> DeoptState {
        self.deopt_state
    }

    /// Architecture table the frame was built with.
    #[inline]
    pub fn layout(&self) -> &'static FrameLayout {
        self.layout
    }

    #[inline]
    pub fn is_entry_frame(&self) -> bool {
        self.kind == FrameKind::Entry
    }

    #[inline]
    pub fn is_optimized_entry_frame(&self) -> bool {
        self.kind == FrameKind::OptimizedEntry
    }

    #[inline]
    pub fn is_interpreted_frame(&self) -> bool {
        self.kind == FrameKind::Interpreted
    }

    #[inline]
    pub fn is_compiled_frame(&self) -> bool {
        self.kind == FrameKind::Compiled
    }

    #[inline]
    pub fn is_native_frame(&self) -> bool {
        self.kind == FrameKind::Native
    }

    #[inline]
    pub fn is_deoptimized_frame(&self) -> bool {
        self.deopt_state == DeoptState::Deoptimized
    }

    /// Frame identity. Larger ids are older frames.
    #[inline]
    pub fn id(&self) -> StackAddr {
        self.unextended_sp
    }

    /// Check if this frame is older than the frame identified by `id`.
    #[inline]
    pub fn is_older(&self, id: StackAddr) -> bool {
        assert!(!self.id().is_null() && !id.is_null(), "null frame id");
        self.id() > id
    }

    /// Address `offset` words from the frame pointer.
    #[inline]
    pub fn addr_at(&self, offset: isize) -> StackAddr {
        self.fp.offset(offset)
    }

    /// Word `offset` words from the frame pointer.
    #[inline]
    pub fn at(&self, offset: isize) -> usize {
        // SAFETY: fp-relative slots of a frame are readable (frame contract).
        unsafe { self.addr_at(offset).read_word() }
    }

    /// The caller's saved frame pointer.
    #[inline]
    pub fn link(&self) -> StackAddr {
        StackAddr::new(self.at(self.layout.link_offset))
    }

    /// Caller's sp, as seen through the frame pointer.
    #[inline]
    pub fn sender_sp(&self) -> StackAddr {
        self.addr_at(self.layout.sender_sp_offset)
    }

    /// Slot holding the return address.
    #[inline]
    pub fn sender_pc_addr(&self) -> StackAddr {
        self.addr_at(self.layout.return_addr_offset)
    }

    /// Return address, with any signature stripped.
    #[inline]
    pub fn sender_pc(&self) -> CodeAddr {
        self.layout
            .pointer_auth
            .strip(self.at(self.layout.return_addr_offset))
    }

    /// Frame pointer derived from the frame size when the blob declares one.
    pub fn real_fp(&self) -> StackAddr {
        if let Some(cb) = self.cb.as_deref() {
            let size = cb.frame_size();
            if size > 0 {
                return self.unextended_sp.offset(size as isize);
            }
        }
        debug_assert!(
            !self.cb.as_deref().is_some_and(CodeBlob::is_compiled),
            "unknown compiled frame size"
        );
        self.fp
    }

    /// Frame size in words.
    ///
    /// # Panics
    ///
    /// Panics for frames that are neither interpreted nor blob-backed.
    pub fn frame_size(&self) -> isize {
        if self.is_interpreted_frame() {
            return self.sender_sp().words_since(self.sp);
        }
        match self.cb.as_deref() {
            Some(cb) => cb.frame_size() as isize,
            None => panic!("frame size of a frame without code metadata: {self}"),
        }
    }

    /// Oop map at this frame's pc, if the pc is a GC-safe point.
    pub fn oop_map(&self) -> Option<&ImmutableOopMap> {
        let cb = self.cb.as_deref()?;
        let maps = cb.oop_maps()?;
        let handle = match self.oop_map {
            Some(handle) => handle,
            None => maps.find_map_at_offset(cb.pc_offset(self.pc)?)?,
        };
        maps.get(handle)
    }

    /// Number of references described by the oop map of a compiled frame.
    ///
    /// # Panics
    ///
    /// Panics for interpreted frames (use
    /// [`Frame::interpreter_frame_num_oops`]) and frames without an oop map.
    pub fn num_oops(&self) -> usize {
        assert!(!self.is_interpreted_frame(), "interpreted");
        match self.oop_map() {
            Some(map) => map.num_oops(),
            None => panic!("no oop map at {self}"),
        }
    }

    /// Size in words of the incoming stack arguments of a compiled method.
    pub fn compiled_frame_stack_argsize(&self) -> usize {
        let info = self
            .cb
            .as_deref()
            .and_then(CodeBlob::as_compiled_method)
            .unwrap_or_else(|| panic!("not a compiled method frame: {self}"));
        (info.stack_arg_slots as usize * STACK_SLOT_SIZE) / WORD_SIZE
    }

    /// Location of an oop-map register or stack slot in this frame.
    ///
    /// Stack slots are relative to the unextended sp; registers come from
    /// the save locations recorded in `map`.
    pub fn oopmapreg_to_location(&self, reg: VmReg, map: &RegisterMap<'_>) -> Option<StackAddr> {
        if reg.is_stack() {
            Some(self.unextended_sp.byte_offset(reg.stack_offset_bytes()))
        } else {
            map.location(reg, self.sp)
        }
    }

    /// Recorded save location of the frame-pointer register.
    pub fn saved_link_address(map: &RegisterMap<'_>) -> Option<StackAddr> {
        let link = map.runtime().layout().link_register;
        map.location(link, StackAddr::NULL)
    }

    /// Record that the caller's frame pointer is saved at `link_addr`.
    ///
    /// Frames save the link in their prologue without an oop-map entry, so
    /// every transition records it explicitly. Both half-slots of the
    /// register map to the same address.
    pub fn update_map_with_saved_link(map: &mut RegisterMap<'_>, link_addr: StackAddr) {
        let link = map.runtime().layout().link_register;
        map.set_location(link, link_addr);
        map.set_location(link.next(), link_addr);
    }

    fn saved_oop_result_addr(&self, map: &RegisterMap<'_>) -> StackAddr {
        let reg = self.layout.return_value_register;
        match map.location(reg, self.sp) {
            Some(addr) => addr,
            None => panic!("bad register save location for {reg:?} in {self}"),
        }
    }

    /// Reference returned by a call out of this frame, read through the
    /// collector's load barrier.
    ///
    /// # Panics
    ///
    /// Panics if the walk did not record where the return-value register
    /// was saved.
    pub fn saved_oop_result(&self, map: &RegisterMap<'_>) -> Oop {
        let slot = self.saved_oop_result_addr(map);
        // SAFETY: recorded save locations are stack slots of frames younger
        // than this one (frame contract).
        unsafe { map.runtime().load_barrier().load_oop(slot) }
    }

    /// Replace the saved return-value reference.
    pub fn set_saved_oop_result(&self, map: &RegisterMap<'_>, obj: Oop) {
        let slot = self.saved_oop_result_addr(map);
        // SAFETY: as for `saved_oop_result`.
        unsafe { map.runtime().load_barrier().store_oop(slot, obj) }
    }

    // -------------------------------------------------------------------------
    // Entry frames
    // -------------------------------------------------------------------------

    /// Slot holding the call wrapper pointer.
    #[inline]
    pub fn entry_frame_call_wrapper_addr(&self) -> StackAddr {
        self.addr_at(self.layout.entry_frame_call_wrapper_offset)
    }

    /// The call wrapper saved by the call stub.
    pub fn entry_frame_call_wrapper(&self) -> CallWrapper {
        assert!(self.is_entry_frame(), "not an entry frame: {self}");
        let wrapper = StackAddr::new(self.at(self.layout.entry_frame_call_wrapper_offset));
        assert!(!wrapper.is_null(), "entry frame without a call wrapper: {self}");
        // SAFETY: the call-wrapper slot of an entry frame points at a live
        // wrapper (frame contract).
        unsafe { wrapper.read::<CallWrapper>() }
    }

    /// Anchor saved by an upcall adapter.
    pub fn optimized_entry_frame_anchor(&self) -> FrameAnchor {
        let info = self
            .cb
            .as_deref()
            .and_then(CodeBlob::as_optimized_entry)
            .unwrap_or_else(|| panic!("not an optimized entry frame: {self}"));
        let slot = self
            .unextended_sp
            .byte_offset(info.frame_data_offset as isize);
        // SAFETY: the adapter's frame data lies inside this frame.
        unsafe { slot.read::<FrameAnchor>() }
    }

    /// Check if this entry frame has no managed caller.
    pub fn is_first_frame(&self) -> bool {
        match self.kind {
            FrameKind::Entry => self.entry_frame_call_wrapper().anchor().is_empty(),
            FrameKind::OptimizedEntry => self.optimized_entry_frame_anchor().is_empty(),
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Relocation bookkeeping
    // -------------------------------------------------------------------------

    /// Overwrite the unextended sp (the frame was moved).
    #[inline]
    pub fn set_unextended_sp(&mut self, value: StackAddr) {
        self.unextended_sp = value;
    }

    /// Unextended sp as a word offset from sp, for frames copied off-stack.
    #[inline]
    pub fn offset_unextended_sp(&self) -> isize {
        self.unextended_sp.words_since(self.sp)
    }

    /// Set the unextended sp from a word offset relative to sp.
    #[inline]
    pub fn set_offset_unextended_sp(&mut self, words: isize) {
        self.unextended_sp = self.sp.offset(words);
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Frame) -> bool {
        let same = self.sp == other.sp
            && self.unextended_sp == other.unextended_sp
            && self.fp == other.fp
            && self.pc == other.pc;
        if same {
            let same_cb = match (&self.cb, &other.cb) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            assert!(
                same_cb && self.deopt_state == other.deopt_state,
                "inconsistent construction: {self} vs {other}"
            );
        }
        same
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("sp", &self.sp)
            .field("unextended_sp", &self.unextended_sp)
            .field("fp", &self.fp)
            .field("pc", &self.pc)
            .field("cb", &self.cb.as_deref().map(CodeBlob::name))
            .field("deopt_state", &self.deopt_state)
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frame (sp={}, usp={}, fp={}, pc={}",
            self.kind, self.sp, self.unextended_sp, self.fp, self.pc
        )?;
        if let Some(cb) = self.cb.as_deref() {
            write!(f, " in {}", cb.name())?;
        }
        if self.is_deoptimized_frame() {
            f.write_str(", deoptimized")?;
        }
        f.write_str(")")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::CodeRange;
    use crate::arch;
    use crate::code::{BlobKind, CodeCache, CompiledMethodInfo};
    use crate::config::WalkConfig;

    const METHOD_START: usize = 0x40_0000;

    fn runtime_with(blobs: Vec<CodeBlob>) -> FrameRuntime {
        let cache = CodeCache::new();
        for blob in blobs {
            cache.install(blob).unwrap();
        }
        FrameRuntime::builder(Arc::new(cache))
            .config(WalkConfig::for_testing().with_layout(&arch::aarch64::LAYOUT))
            .interpreter(CodeRange::new(CodeAddr::new(0x10_0000), 0x1000))
            .call_stub_return(CodeAddr::new(0x20_0040))
            .build()
    }

    fn compiled(info: CompiledMethodInfo) -> CodeBlob {
        CodeBlob::new(
            "m",
            BlobKind::CompiledMethod(info),
            CodeRange::new(CodeAddr::new(METHOD_START), 0x200),
            4,
        )
    }

    #[test]
    fn test_classification_order() {
        let adapter = CodeBlob::new(
            "upcall",
            BlobKind::OptimizedEntry(crate::code::OptimizedEntryInfo { frame_data_offset: 0 }),
            CodeRange::new(CodeAddr::new(0x30_0000), 0x100),
            8,
        );
        let rt = runtime_with(vec![compiled(CompiledMethodInfo::new(0x100, 0)), adapter]);
        let mut stack = [0usize; 4];
        let sp = StackAddr::from_ptr(stack.as_mut_ptr());

        let kind = |pc: usize| unsafe { Frame::new(&rt, sp, sp, CodeAddr::new(pc)) }.kind();
        assert_eq!(kind(0x20_0040), FrameKind::Entry);
        assert_eq!(kind(0x30_0010), FrameKind::OptimizedEntry);
        assert_eq!(kind(0x10_0010), FrameKind::Interpreted);
        assert_eq!(kind(METHOD_START + 0x10), FrameKind::Compiled);
        assert_eq!(kind(0x90_0000), FrameKind::Native);
    }

    #[test]
    #[should_panic(expected = "no pc?")]
    fn test_null_pc_is_fatal() {
        let rt = runtime_with(vec![]);
        let sp = StackAddr::new(0x1000);
        unsafe { Frame::new(&rt, sp, sp, CodeAddr::NULL) };
    }

    #[test]
    #[should_panic(expected = "cannot be signed")]
    fn test_signed_pc_is_fatal() {
        let rt = runtime_with(vec![]);
        let sp = StackAddr::new(0x1000);
        unsafe { Frame::new(&rt, sp, sp, CodeAddr::new(0x0055_0000_0040_0010)) };
    }

    #[test]
    fn test_deopt_stub_marks_frame() {
        let deopt = CodeBlob::new(
            "deopt",
            BlobKind::Deoptimization,
            CodeRange::new(CodeAddr::new(0x50_0000), 0x100),
            6,
        );
        let rt = runtime_with(vec![deopt]);
        let sp = StackAddr::new(0x1000);
        let frame = unsafe { Frame::new(&rt, sp, sp, CodeAddr::new(0x50_0010)) };
        assert!(frame.is_deoptimized_frame());
        assert_eq!(frame.pc(), CodeAddr::new(0x50_0010));
    }

    #[test]
    fn test_method_handle_return_uses_fp_as_identity() {
        let rt = runtime_with(vec![compiled(
            CompiledMethodInfo::new(0x100, 0).with_method_handle_return(0x24),
        )]);
        let sp = StackAddr::new(0x1000);
        let fp = StackAddr::new(0x1040);
        let frame = unsafe { Frame::new(&rt, sp, fp, CodeAddr::new(METHOD_START + 0x24)) };
        assert_eq!(frame.unextended_sp(), fp);
        assert_eq!(frame.sp(), sp);

        let plain = unsafe { Frame::new(&rt, sp, fp, CodeAddr::new(METHOD_START + 0x20)) };
        assert_eq!(plain.unextended_sp(), sp);
    }

    #[test]
    fn test_equality_and_age() {
        let rt = runtime_with(vec![compiled(CompiledMethodInfo::new(0x100, 0))]);
        let pc = CodeAddr::new(METHOD_START + 0x10);
        let young = unsafe { Frame::new(&rt, StackAddr::new(0x1000), StackAddr::NULL, pc) };
        let again = unsafe { Frame::new(&rt, StackAddr::new(0x1000), StackAddr::NULL, pc) };
        let old = unsafe { Frame::new(&rt, StackAddr::new(0x1040), StackAddr::NULL, pc) };

        assert_eq!(young, again);
        assert_ne!(young, old);
        assert!(old.is_older(young.id()));
        assert!(!young.is_older(old.id()));
    }

    #[test]
    fn test_real_fp_and_frame_size() {
        let rt = runtime_with(vec![compiled(
            CompiledMethodInfo::new(0x100, 0).with_stack_arg_slots(4),
        )]);
        let sp = StackAddr::new(0x1000);
        let frame = unsafe { Frame::new(&rt, sp, StackAddr::NULL, CodeAddr::new(METHOD_START)) };
        assert_eq!(frame.real_fp(), sp.offset(4));
        assert_eq!(frame.frame_size(), 4);
        assert_eq!(frame.compiled_frame_stack_argsize(), 16 / WORD_SIZE);
    }

    #[test]
    fn test_fp_relative_accessors() {
        let rt = runtime_with(vec![]);
        let mut stack = [0usize; 8];
        let fp = StackAddr::from_ptr(stack.as_mut_ptr()).offset(2);
        stack[2] = 0xabc0;
        stack[3] = 0x0077_0000_0040_0010;

        let frame = unsafe { Frame::new(&rt, fp.offset(-2), fp, CodeAddr::new(0x90_0000)) };
        assert_eq!(frame.link(), StackAddr::new(0xabc0));
        assert_eq!(frame.sender_pc_addr(), fp.offset(1));
        assert_eq!(frame.sender_pc(), CodeAddr::new(0x40_0010));
        assert_eq!(frame.sender_sp(), fp.offset(2));
    }

    #[test]
    fn test_offset_unextended_sp() {
        let rt = runtime_with(vec![]);
        let sp = StackAddr::new(0x1000);
        let mut frame = unsafe { Frame::new(&rt, sp, StackAddr::NULL, CodeAddr::new(0x90_0000)) };
        assert_eq!(frame.offset_unextended_sp(), 0);
        frame.set_offset_unextended_sp(3);
        assert_eq!(frame.unextended_sp(), sp.offset(3));
        frame.set_unextended_sp(sp);
        assert_eq!(frame.offset_unextended_sp(), 0);
    }

    #[test]
    fn test_display() {
        let rt = runtime_with(vec![compiled(CompiledMethodInfo::new(0x100, 0))]);
        let frame = unsafe {
            Frame::new(
                &rt,
                StackAddr::new(0x1000),
                StackAddr::NULL,
                CodeAddr::new(METHOD_START + 8),
            )
        };
        assert_eq!(
            frame.to_string(),
            "compiled frame (sp=0x1000, usp=0x1000, fp=0x0, pc=0x400008 in m)"
        );
    }
}
