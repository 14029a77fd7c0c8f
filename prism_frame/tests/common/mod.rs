//! Synthetic stacks for walker tests.
//!
//! A [`SyntheticStack`] is a heap buffer standing in for a native stack;
//! code addresses are fake but registered in a real [`CodeCache`], so the
//! walker resolves them exactly as it would resolve generated code.

#![allow(dead_code)]

use std::ptr;
use std::sync::Arc;

use prism_frame::arch::{self, FrameLayout};
use prism_frame::{
    BlobKind, CodeAddr, CodeBlob, CodeCache, CodeRange, CompiledMethodInfo, FrameAnchor,
    FrameRuntime, FrameRuntimeBuilder, StackAddr, WalkConfig,
};
use tracing_subscriber::EnvFilter;

pub const LAYOUT: &FrameLayout = &arch::aarch64::LAYOUT;

pub const INTERPRETER: CodeRange = CodeRange {
    start: CodeAddr::new(0x10_0000),
    end: CodeAddr::new(0x11_0000),
};
pub const CALL_STUB: CodeAddr = CodeAddr::new(0x20_0000);
pub const CALL_STUB_RETURN: CodeAddr = CodeAddr::new(0x20_0040);
pub const CODE_BASE: usize = 0x40_0000;
pub const BLOB_SPACING: usize = 0x1000;
pub const DEOPT_HANDLER: u32 = 0x800;
pub const NATIVE_PC: CodeAddr = CodeAddr::new(0x90_0000);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// SyntheticStack
// =============================================================================

/// Word buffer addressed like a stack: index 0 is the lowest address.
pub struct SyntheticStack {
    ptr: *mut usize,
    len: usize,
}

impl SyntheticStack {
    pub fn new(len: usize) -> Self {
        let words = vec![0usize; len].into_boxed_slice();
        Self {
            ptr: Box::into_raw(words) as *mut usize,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Address of word `index` (one past the end is allowed).
    pub fn addr(&self, index: usize) -> StackAddr {
        assert!(index <= self.len, "index {index} beyond stack of {}", self.len);
        StackAddr::from_ptr(self.ptr.wrapping_add(index))
    }

    /// Index of a word address inside this stack.
    pub fn index_of(&self, addr: StackAddr) -> usize {
        let index = addr.words_since(self.addr(0));
        assert!(index >= 0 && (index as usize) <= self.len, "{addr} is not in this stack");
        index as usize
    }

    pub fn set(&self, index: usize, value: usize) {
        assert!(index < self.len, "index {index} beyond stack of {}", self.len);
        // SAFETY: in bounds of the owned buffer.
        unsafe { ptr::write(self.ptr.add(index), value) }
    }

    pub fn set_addr(&self, index: usize, value: StackAddr) {
        self.set(index, value.addr());
    }

    pub fn get(&self, index: usize) -> usize {
        assert!(index < self.len, "index {index} beyond stack of {}", self.len);
        // SAFETY: in bounds of the owned buffer.
        unsafe { ptr::read(self.ptr.add(index)) }
    }

    /// Set the word at `fp_index + offset`.
    pub fn set_fp_slot(&self, fp_index: usize, offset: isize, value: usize) {
        self.set((fp_index as isize + offset) as usize, value);
    }

    /// Write an entry frame at `fp_index` whose call wrapper, stored at
    /// `wrapper_index`, holds `anchor`.
    pub fn write_entry_frame(&self, fp_index: usize, wrapper_index: usize, anchor: FrameAnchor) {
        self.set_addr(wrapper_index, anchor.last_sp);
        self.set_addr(wrapper_index + 1, anchor.last_fp);
        self.set(wrapper_index + 2, anchor.last_pc.addr());
        self.set_fp_slot(
            fp_index,
            LAYOUT.entry_frame_call_wrapper_offset,
            self.addr(wrapper_index).addr(),
        );
    }
}

impl Drop for SyntheticStack {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from `Box::into_raw` in `new`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr, self.len)));
        }
    }
}

// =============================================================================
// Code
// =============================================================================

/// Runtime over `cache` with the AArch64 layout and test configuration.
pub fn runtime(cache: Arc<CodeCache>) -> FrameRuntimeBuilder {
    FrameRuntime::builder(cache)
        .config(WalkConfig::for_testing().with_layout(LAYOUT))
        .interpreter(INTERPRETER)
        .call_stub_return(CALL_STUB_RETURN)
}

pub fn call_stub() -> CodeBlob {
    CodeBlob::new("call_stub", BlobKind::Buffer, CodeRange::new(CALL_STUB, 0x100), 0)
}

/// Start of the code slot `index`.
pub fn code_start(index: usize) -> CodeAddr {
    CodeAddr::new(CODE_BASE + index * BLOB_SPACING)
}

/// Pc `offset` bytes into code slot `index`.
pub fn code_pc(index: usize, offset: u32) -> CodeAddr {
    code_start(index).add(offset as usize)
}

/// Compiled method occupying code slot `index`; its original-pc save slot
/// is the word at the unextended sp + 2.
pub fn compiled_info() -> CompiledMethodInfo {
    CompiledMethodInfo::new(DEOPT_HANDLER, 2 * prism_frame::WORD_SIZE as i32)
}

pub fn compiled_method(index: usize, frame_size_words: i32) -> CodeBlob {
    CodeBlob::new(
        format!("method{index}"),
        BlobKind::CompiledMethod(compiled_info()),
        CodeRange::new(code_start(index), BLOB_SPACING),
        frame_size_words,
    )
}

// =============================================================================
// Compiled call chains
// =============================================================================

/// Registers of one frame as observed at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRegs {
    pub sp: StackAddr,
    pub fp: StackAddr,
    pub pc: CodeAddr,
}

/// Chain of compiled frames, youngest first, called from an entry frame
/// that has no managed caller.
pub struct CompiledChain {
    pub stack: SyntheticStack,
    pub cache: Arc<CodeCache>,
    pub frames: Vec<FrameRegs>,
    pub entry: FrameRegs,
}

impl CompiledChain {
    /// Frames pc offset into each method.
    pub const PC_OFFSET: u32 = 0x10;

    /// Lay out compiled frames of the given sizes (in words, each at least 2).
    pub fn new(sizes: &[usize]) -> Self {
        const BELOW: usize = 4;
        const ENTRY_WORDS: usize = 16;
        assert!(sizes.iter().all(|&s| s >= 2), "frames need a frame record");

        let total: usize = sizes.iter().sum();
        let stack = SyntheticStack::new(BELOW + total + ENTRY_WORDS);
        let cache = CodeCache::new();
        cache.install(call_stub()).unwrap();

        let mut sp_index = BELOW;
        let mut frames = Vec::with_capacity(sizes.len());
        for (i, &size) in sizes.iter().enumerate() {
            cache.install(compiled_method(i, size as i32)).unwrap();
            frames.push(FrameRegs {
                sp: stack.addr(sp_index),
                fp: stack.addr(sp_index + size - 2),
                pc: code_pc(i, Self::PC_OFFSET),
            });
            sp_index += size;
        }

        let entry_fp = sp_index + 10;
        let entry = FrameRegs {
            sp: stack.addr(sp_index),
            fp: stack.addr(entry_fp),
            pc: CALL_STUB_RETURN,
        };
        stack.write_entry_frame(entry_fp, entry_fp + 2, FrameAnchor::EMPTY);

        // Each frame's record holds its caller's fp and return pc.
        for (i, frame) in frames.iter().enumerate() {
            let caller = frames.get(i + 1).copied().unwrap_or(entry);
            let sender_sp = stack.index_of(frame.fp) + 2;
            stack.set_addr(sender_sp - 2, caller.fp);
            stack.set(sender_sp - 1, caller.pc.addr());
        }

        Self {
            stack,
            cache: Arc::new(cache),
            frames,
            entry,
        }
    }
}
