//! Process-wide collaborators consulted while walking, and per-thread anchors.
//!
//! Classifying a frame needs to know where the interpreter lives and which
//! return addresses belong to the call stub; computing senders needs the code
//! registry, the continuation engine and the collector's barriers. A
//! [`FrameRuntime`] bundles all of them so a walk can be handed one reference.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::address::{CodeAddr, CodeRange, StackAddr};
use crate::arch::FrameLayout;
use crate::barrier::{LoadBarrier, RawAccess, StackWatermark};
use crate::code::CodeLookup;
use crate::config::WalkConfig;
use crate::continuation::{ContinuationOverlay, NoContinuations};
use crate::error::WalkError;
use crate::frame::Frame;

// =============================================================================
// FrameAnchor / CallWrapper
// =============================================================================

/// Last managed frame of a stack segment, recorded when managed code calls
/// out to native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct FrameAnchor {
    /// Stack pointer of the last managed frame; null when there is none.
    pub last_sp: StackAddr,
    /// Frame pointer of the last managed frame.
    pub last_fp: StackAddr,
    /// Pc of the last managed frame; null means "read it below `last_sp`".
    pub last_pc: CodeAddr,
}

impl FrameAnchor {
    /// An anchor that records no frame.
    pub const EMPTY: FrameAnchor = FrameAnchor {
        last_sp: StackAddr::NULL,
        last_fp: StackAddr::NULL,
        last_pc: CodeAddr::NULL,
    };

    /// Anchor for the frame `(sp, fp, pc)`.
    #[inline]
    pub const fn new(last_sp: StackAddr, last_fp: StackAddr, last_pc: CodeAddr) -> Self {
        Self {
            last_sp,
            last_fp,
            last_pc,
        }
    }

    /// Check if no frame is recorded.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.last_sp.is_null()
    }

    /// Pc of the anchored frame, reading the return address pushed just below
    /// `last_sp` when the pc was not recorded.
    ///
    /// # Safety
    ///
    /// The anchor must be non-empty and `last_sp` must point into a readable
    /// stack.
    pub unsafe fn walkable_pc(&self, layout: &FrameLayout) -> CodeAddr {
        if !self.last_pc.is_null() {
            return self.last_pc;
        }
        // SAFETY: upheld by the caller.
        layout
            .pointer_auth
            .strip(unsafe { self.last_sp.offset(-1).read_word() })
    }
}

/// Saved by the call stub when native code enters managed code; points back
/// to the managed segment that was active before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CallWrapper {
    /// Anchor of the previous managed segment.
    pub anchor: FrameAnchor,
}

impl CallWrapper {
    /// Wrap an anchor.
    #[inline]
    pub const fn new(anchor: FrameAnchor) -> Self {
        Self { anchor }
    }

    /// The saved anchor.
    #[inline]
    pub const fn anchor(&self) -> &FrameAnchor {
        &self.anchor
    }
}

// =============================================================================
// ManagedThread
// =============================================================================

/// The parts of a VM thread the walker needs.
#[derive(Debug, Clone, Default)]
pub struct ManagedThread {
    id: u64,
    anchor: FrameAnchor,
}

impl ManagedThread {
    /// A thread with no managed frames.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            anchor: FrameAnchor::EMPTY,
        }
    }

    /// Set the last managed frame.
    pub fn with_anchor(mut self, anchor: FrameAnchor) -> Self {
        self.anchor = anchor;
        self
    }

    /// Thread id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The thread's frame anchor.
    #[inline]
    pub fn anchor(&self) -> &FrameAnchor {
        &self.anchor
    }

    /// Check if a walk can start on this thread.
    #[inline]
    pub fn has_last_frame(&self) -> bool {
        !self.anchor.is_empty()
    }

    /// Top managed frame of this thread.
    ///
    /// # Safety
    ///
    /// The thread must be stopped (or be the current thread) and its anchor
    /// must describe a readable stack; see [`Frame`] for the full contract.
    pub unsafe fn last_frame(&self, rt: &FrameRuntime) -> Result<Frame, WalkError> {
        if !self.has_last_frame() {
            return Err(WalkError::NoLastFrame(self.id));
        }
        // SAFETY: upheld by the caller.
        unsafe {
            let pc = self.anchor.walkable_pc(rt.layout());
            Ok(Frame::new(rt, self.anchor.last_sp, self.anchor.last_fp, pc))
        }
    }
}

// =============================================================================
// FrameRuntime
// =============================================================================

/// Collaborators and configuration shared by every walk.
pub struct FrameRuntime {
    config: WalkConfig,
    code: Arc<dyn CodeLookup>,
    interpreter: CodeRange,
    call_stub_returns: SmallVec<[CodeAddr; 2]>,
    continuations: Arc<dyn ContinuationOverlay>,
    barrier: Arc<dyn LoadBarrier>,
    watermark: Option<Arc<dyn StackWatermark>>,
}

impl FrameRuntime {
    /// Start building a runtime around a code registry.
    pub fn builder(code: Arc<dyn CodeLookup>) -> FrameRuntimeBuilder {
        FrameRuntimeBuilder {
            config: WalkConfig::default(),
            code,
            interpreter: CodeRange::EMPTY,
            call_stub_returns: SmallVec::new(),
            continuations: Arc::new(NoContinuations),
            barrier: Arc::new(RawAccess),
            watermark: None,
        }
    }

    /// Configuration.
    #[inline]
    pub fn config(&self) -> &WalkConfig {
        &self.config
    }

    /// Architecture constant table.
    #[inline]
    pub fn layout(&self) -> &'static FrameLayout {
        self.config.layout
    }

    /// Code registry.
    #[inline]
    pub fn code(&self) -> &dyn CodeLookup {
        &*self.code
    }

    /// Interpreter code region.
    #[inline]
    pub fn interpreter_range(&self) -> CodeRange {
        self.interpreter
    }

    /// Check if `pc` is interpreter code.
    #[inline]
    pub fn is_interpreter_pc(&self, pc: CodeAddr) -> bool {
        self.interpreter.contains(pc)
    }

    /// Check if `pc` is a return address into the call stub.
    #[inline]
    pub fn returns_to_call_stub(&self, pc: CodeAddr) -> bool {
        self.call_stub_returns.contains(&pc)
    }

    /// Continuation engine.
    #[inline]
    pub fn continuations(&self) -> &dyn ContinuationOverlay {
        &*self.continuations
    }

    /// Collector load barrier.
    #[inline]
    pub fn load_barrier(&self) -> &dyn LoadBarrier {
        &*self.barrier
    }

    /// Stack watermark, if the collector installed one.
    #[inline]
    pub fn stack_watermark(&self) -> Option<&dyn StackWatermark> {
        self.watermark.as_deref()
    }
}

impl fmt::Debug for FrameRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRuntime")
            .field("config", &self.config)
            .field("interpreter", &self.interpreter)
            .field("call_stub_returns", &self.call_stub_returns)
            .field("watermark", &self.watermark.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`FrameRuntime`].
pub struct FrameRuntimeBuilder {
    config: WalkConfig,
    code: Arc<dyn CodeLookup>,
    interpreter: CodeRange,
    call_stub_returns: SmallVec<[CodeAddr; 2]>,
    continuations: Arc<dyn ContinuationOverlay>,
    barrier: Arc<dyn LoadBarrier>,
    watermark: Option<Arc<dyn StackWatermark>>,
}

impl FrameRuntimeBuilder {
    /// Use `config`.
    pub fn config(mut self, config: WalkConfig) -> Self {
        self.config = config;
        self
    }

    /// Interpreter code region.
    pub fn interpreter(mut self, range: CodeRange) -> Self {
        self.interpreter = range;
        self
    }

    /// Register a return address into the call stub.
    pub fn call_stub_return(mut self, pc: CodeAddr) -> Self {
        self.call_stub_returns.push(pc);
        self
    }

    /// Continuation engine.
    pub fn continuations(mut self, overlay: Arc<dyn ContinuationOverlay>) -> Self {
        self.continuations = overlay;
        self
    }

    /// Collector load barrier.
    pub fn load_barrier(mut self, barrier: Arc<dyn LoadBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    /// Stack watermark observer.
    pub fn stack_watermark(mut self, watermark: Arc<dyn StackWatermark>) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Finish building.
    pub fn build(self) -> FrameRuntime {
        FrameRuntime {
            config: self.config,
            code: self.code,
            interpreter: self.interpreter,
            call_stub_returns: self.call_stub_returns,
            continuations: self.continuations,
            barrier: self.barrier,
            watermark: self.watermark,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
