//! Per-walk register save locations.
//!
//! A callee that saves a caller's register records where it put it, either in
//! its oop map (stubs) or implicitly (the frame-pointer link every frame
//! pushes). As the walk moves outward those locations accumulate in a
//! [`RegisterMap`], so that when a caller's oop map says "register r19 holds
//! a reference" the walker can find the stack slot holding r19's value.

use std::fmt;

use crate::address::StackAddr;
use crate::runtime::{FrameRuntime, ManagedThread};
use crate::vmreg::{VmReg, REG_COUNT};

/// Saved-register table plus the flags steering one stack walk.
///
/// Created once per walk and threaded through successive
/// [`crate::Frame::sender`] calls.
pub struct RegisterMap<'a> {
    runtime: &'a FrameRuntime,
    thread: Option<&'a ManagedThread>,
    locations: [StackAddr; REG_COUNT],
    /// Bit `i` set when `locations[i]` is meaningful.
    valid: u64,
    include_argument_oops: bool,
    update_map: bool,
    process_frames: bool,
    walk_cont: bool,
    in_cont: bool,
}

const _: () = assert!(REG_COUNT <= u64::BITS as usize);

impl<'a> RegisterMap<'a> {
    /// Map for a walk that records register locations and notifies the stack
    /// watermark.
    pub fn new(runtime: &'a FrameRuntime) -> Self {
        Self {
            runtime,
            thread: None,
            locations: [StackAddr::NULL; REG_COUNT],
            valid: 0,
            include_argument_oops: true,
            update_map: true,
            process_frames: true,
            walk_cont: false,
            in_cont: false,
        }
    }

    /// Walk the stack of `thread`.
    pub fn with_thread(mut self, thread: &'a ManagedThread) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Skip all bookkeeping; only sender frames are wanted.
    pub fn without_updates(mut self) -> Self {
        self.update_map = false;
        self
    }

    /// Do not notify the stack watermark.
    pub fn without_processing(mut self) -> Self {
        self.process_frames = false;
        self
    }

    /// Allow the walk to cross return barriers into continuation chunks.
    pub fn walking_continuations(mut self) -> Self {
        self.walk_cont = true;
        self
    }

    /// The runtime this walk consults.
    #[inline]
    pub fn runtime(&self) -> &'a FrameRuntime {
        self.runtime
    }

    /// Thread being walked, if known.
    #[inline]
    pub fn thread(&self) -> Option<&'a ManagedThread> {
        self.thread
    }

    #[inline]
    pub fn update_map(&self) -> bool {
        self.update_map
    }

    #[inline]
    pub fn process_frames(&self) -> bool {
        self.process_frames
    }

    #[inline]
    pub fn walk_continuations(&self) -> bool {
        self.walk_cont
    }

    #[inline]
    pub fn in_continuation(&self) -> bool {
        self.in_cont
    }

    /// Set by the continuation engine when the walk enters a stack chunk.
    #[inline]
    pub fn set_in_continuation(&mut self, value: bool) {
        self.in_cont = value;
    }

    /// Whether outgoing argument slots of the last transition must be scanned.
    #[inline]
    pub fn include_argument_oops(&self) -> bool {
        self.include_argument_oops
    }

    #[inline]
    pub fn set_include_argument_oops(&mut self, value: bool) {
        self.include_argument_oops = value;
    }

    /// Where the value of `reg` lives.
    ///
    /// Stack slots resolve relative to `sp`; registers resolve to the save
    /// location recorded by a callee, or `None` if no transition recorded one.
    pub fn location(&self, reg: VmReg, sp: StackAddr) -> Option<StackAddr> {
        if reg.is_stack() {
            return Some(sp.byte_offset(reg.stack_offset_bytes()));
        }
        let idx = reg.reg_index();
        (self.valid & (1u64 << idx) != 0).then(|| self.locations[idx])
    }

    /// Record that the caller's value of `reg` is saved at `location`.
    pub fn set_location(&mut self, reg: VmReg, location: StackAddr) {
        assert!(reg.is_reg(), "{reg:?} is not a register");
        debug_assert!(self.update_map, "register map is not updating");
        let idx = reg.reg_index();
        self.locations[idx] = location;
        self.valid |= 1u64 << idx;
    }

    /// Forget every location (crossing into an older stack segment).
    pub fn clear(&mut self) {
        self.include_argument_oops = true;
        if self.update_map {
            self.valid = 0;
        }
    }

    /// Recorded `(register, location)` pairs in register order.
    pub fn locations(&self) -> impl Iterator<Item = (VmReg, StackAddr)> + '_ {
        (0..REG_COUNT)
            .filter(move |&idx| self.valid & (1u64 << idx) != 0)
            .map(move |idx| (VmReg::from_raw(idx as u16), self.locations[idx]))
    }

    /// Number of recorded locations.
    #[inline]
    pub fn len(&self) -> usize {
        self.valid.count_ones() as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }
}

impl fmt::Debug for RegisterMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterMap")
            .field("thread", &self.thread.map(ManagedThread::id))
            .field("update_map", &self.update_map)
            .field("include_argument_oops", &self.include_argument_oops)
            .field("process_frames", &self.process_frames)
            .field("walk_cont", &self.walk_cont)
            .field("in_cont", &self.in_cont)
            .field("locations", &DebugLocations(self))
            .finish()
    }
}

struct DebugLocations<'m, 'a>(&'m RegisterMap<'a>);

impl fmt::Debug for DebugLocations<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.locations()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
