//! Code metadata consumed by the walker.
//!
//! A [`CodeBlob`] describes one contiguous region of generated code: its frame
//! size, its oop maps and, for compiled methods, the deoptimization bookkeeping
//! needed to recover a frame's original pc. Blobs are registered in a
//! [`CodeCache`] and looked up by pc through the [`CodeLookup`] trait.

pub mod cache;
pub mod oopmap;

pub use cache::{CodeCache, CodeCacheStats, CodeLookup};
pub use oopmap::{
    ImmutableOopMap, OopKind, OopMapBuilder, OopMapHandle, OopMapSet, OopMapValue,
};

use smallvec::SmallVec;

use crate::address::{CodeAddr, CodeRange};
use crate::runtime::ManagedThread;

// =============================================================================
// Blob Kinds
// =============================================================================

/// Deoptimization and calling-convention metadata of a compiled method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMethodInfo {
    /// Offset of the deoptimization handler entry.
    pub deopt_handler_offset: u32,
    /// Offset of the method-handle deoptimization handler entry, if any.
    pub deopt_mh_handler_offset: Option<u32>,
    /// Byte offset from the unextended sp of the slot that holds the original
    /// pc of a deoptimized frame.
    pub orig_pc_offset: i32,
    /// Return sites of method-handle invokes, whose callers run on an
    /// extended stack.
    pub method_handle_returns: SmallVec<[u32; 4]>,
    /// Incoming stack argument slots (4-byte units).
    pub stack_arg_slots: u32,
}

impl CompiledMethodInfo {
    /// Metadata with the given deopt handler and original-pc slot.
    pub fn new(deopt_handler_offset: u32, orig_pc_offset: i32) -> Self {
        Self {
            deopt_handler_offset,
            deopt_mh_handler_offset: None,
            orig_pc_offset,
            method_handle_returns: SmallVec::new(),
            stack_arg_slots: 0,
        }
    }

    /// Set the method-handle deopt handler.
    pub fn with_mh_deopt_handler(mut self, offset: u32) -> Self {
        self.deopt_mh_handler_offset = Some(offset);
        self
    }

    /// Add a method-handle return site.
    pub fn with_method_handle_return(mut self, offset: u32) -> Self {
        self.method_handle_returns.push(offset);
        self
    }

    /// Set the number of incoming stack argument slots.
    pub fn with_stack_arg_slots(mut self, slots: u32) -> Self {
        self.stack_arg_slots = slots;
        self
    }
}

/// Metadata of a foreign-to-managed upcall adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizedEntryInfo {
    /// Byte offset from the unextended sp to the saved [`crate::FrameAnchor`].
    pub frame_data_offset: i32,
}

/// Kind of generated code a blob holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobKind {
    /// JIT-compiled method.
    CompiledMethod(CompiledMethodInfo),
    /// Runtime stub called from compiled code (may save callee-saved registers).
    RuntimeStub,
    /// The shared deoptimization trampoline.
    Deoptimization,
    /// Upcall adapter entered through a foreign calling convention.
    OptimizedEntry(OptimizedEntryInfo),
    /// Stub routines and other buffers (call stub, adapters).
    Buffer,
}

// =============================================================================
// CodeBlob
// =============================================================================

/// Metadata for one region of generated code.
#[derive(Debug, Clone)]
pub struct CodeBlob {
    name: String,
    kind: BlobKind,
    code: CodeRange,
    insts: CodeRange,
    /// Frame size in words; negative means unknown.
    frame_size: i32,
    caller_must_gc_arguments: bool,
    oop_maps: Option<OopMapSet>,
}

impl CodeBlob {
    /// Create a blob covering `code` with a frame of `frame_size` words.
    pub fn new(name: impl Into<String>, kind: BlobKind, code: CodeRange, frame_size: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            code,
            insts: code,
            frame_size,
            caller_must_gc_arguments: false,
            oop_maps: None,
        }
    }

    /// Restrict the main instruction section.
    pub fn with_insts(mut self, insts: CodeRange) -> Self {
        debug_assert!(insts.start >= self.code.start && insts.end <= self.code.end);
        self.insts = insts;
        self
    }

    /// Attach oop maps.
    pub fn with_oop_maps(mut self, oop_maps: OopMapSet) -> Self {
        self.oop_maps = Some(oop_maps);
        self
    }

    /// Require callers to keep outgoing argument references alive.
    pub fn with_caller_must_gc_arguments(mut self, value: bool) -> Self {
        self.caller_must_gc_arguments = value;
        self
    }

    /// Blob name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blob kind.
    #[inline]
    pub fn kind(&self) -> &BlobKind {
        &self.kind
    }

    /// Whole code range.
    #[inline]
    pub fn code(&self) -> CodeRange {
        self.code
    }

    /// First code address.
    #[inline]
    pub fn code_begin(&self) -> CodeAddr {
        self.code.start
    }

    /// Main instruction section.
    #[inline]
    pub fn insts(&self) -> CodeRange {
        self.insts
    }

    /// Frame size in words (negative when unknown).
    #[inline]
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    /// Check if `pc` lies in this blob.
    #[inline]
    pub fn contains(&self, pc: CodeAddr) -> bool {
        self.code.contains(pc)
    }

    /// Offset of `pc` from the blob start.
    #[inline]
    pub fn pc_offset(&self, pc: CodeAddr) -> Option<u32> {
        pc.offset_from(self.code.start)
    }

    /// Oop maps, if the blob has any.
    #[inline]
    pub fn oop_maps(&self) -> Option<&OopMapSet> {
        self.oop_maps.as_ref()
    }

    /// Whether the caller of this code must scan outgoing argument slots.
    #[inline]
    pub fn caller_must_gc_arguments(&self, _thread: Option<&ManagedThread>) -> bool {
        self.caller_must_gc_arguments
    }

    /// Check for a compiled method.
    #[inline]
    pub fn is_compiled(&self) -> bool {
        matches!(self.kind, BlobKind::CompiledMethod(_))
    }

    /// Check for a runtime stub.
    #[inline]
    pub fn is_runtime_stub(&self) -> bool {
        matches!(self.kind, BlobKind::RuntimeStub)
    }

    /// Check for the deoptimization trampoline.
    #[inline]
    pub fn is_deoptimization_stub(&self) -> bool {
        matches!(self.kind, BlobKind::Deoptimization)
    }

    /// Check for an upcall adapter.
    #[inline]
    pub fn is_optimized_entry_blob(&self) -> bool {
        matches!(self.kind, BlobKind::OptimizedEntry(_))
    }

    /// Compiled-method metadata.
    #[inline]
    pub fn as_compiled_method(&self) -> Option<&CompiledMethodInfo> {
        match &self.kind {
            BlobKind::CompiledMethod(info) => Some(info),
            _ => None,
        }
    }

    /// Upcall adapter metadata.
    #[inline]
    pub fn as_optimized_entry(&self) -> Option<&OptimizedEntryInfo> {
        match &self.kind {
            BlobKind::OptimizedEntry(info) => Some(info),
            _ => None,
        }
    }

    /// Check if `pc` is one of this method's deoptimization handler entries.
    pub fn is_deopt_pc(&self, pc: CodeAddr) -> bool {
        let Some(info) = self.as_compiled_method() else {
            return false;
        };
        let entry = |offset: u32| self.code.start.add(offset as usize);
        pc == entry(info.deopt_handler_offset)
            || info.deopt_mh_handler_offset.map(entry) == Some(pc)
    }

    /// Check if `pc` is the return site of a method-handle invoke.
    pub fn is_method_handle_return(&self, pc: CodeAddr) -> bool {
        match (self.as_compiled_method(), self.pc_offset(pc)) {
            (Some(info), Some(offset)) => info.method_handle_returns.contains(&offset),
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
