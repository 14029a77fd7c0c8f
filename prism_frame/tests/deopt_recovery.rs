//! Original-pc recovery for deoptimized frames.

mod common;

use std::sync::Arc;

use common::{CompiledChain, SyntheticStack, DEOPT_HANDLER};
use prism_frame::{
    BlobKind, CodeBlob, CodeCache, CodeRange, DeoptState, Frame, FrameKind, FrameRuntime,
    RegisterMap,
};

const MH_DEOPT_HANDLER: u32 = 0x900;

struct Fixture {
    stack: SyntheticStack,
    rt: FrameRuntime,
}

/// One compiled frame at word 4 with its original-pc slot (word 6) filled.
fn fixture() -> Fixture {
    let stack = SyntheticStack::new(16);
    let cache = CodeCache::new();
    let info = common::compiled_info().with_mh_deopt_handler(MH_DEOPT_HANDLER);
    cache
        .install(CodeBlob::new(
            "deoptee",
            BlobKind::CompiledMethod(info),
            CodeRange::new(common::code_start(0), common::BLOB_SPACING),
            4,
        ))
        .unwrap();
    cache
        .install(CodeBlob::new(
            "deopt_blob",
            BlobKind::Deoptimization,
            CodeRange::new(common::code_start(1), 0x100),
            2,
        ))
        .unwrap();
    stack.set(6, common::code_pc(0, 0x24).addr());
    let rt = common::runtime(Arc::new(cache)).build();
    Fixture { stack, rt }
}

#[test]
fn test_deopt_handler_pc_is_replaced() {
    common::init_tracing();
    let f = fixture();
    let sp = f.stack.addr(4);
    let frame = unsafe { Frame::new(&f.rt, sp, sp.offset(2), common::code_pc(0, DEOPT_HANDLER)) };

    assert_eq!(frame.kind(), FrameKind::Compiled);
    assert_eq!(frame.deopt_state(), DeoptState::Deoptimized);
    assert!(frame.is_deoptimized_frame());
    assert_eq!(frame.pc(), common::code_pc(0, 0x24));
}

#[test]
fn test_method_handle_deopt_handler_is_recognized() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let frame = unsafe { Frame::new(&f.rt, sp, sp.offset(2), common::code_pc(0, MH_DEOPT_HANDLER)) };
    assert!(frame.is_deoptimized_frame());
    assert_eq!(frame.pc(), common::code_pc(0, 0x24));
}

#[test]
fn test_ordinary_pc_is_kept() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let pc = common::code_pc(0, 0x30);
    let frame = unsafe { Frame::new(&f.rt, sp, sp.offset(2), pc) };
    assert_eq!(frame.deopt_state(), DeoptState::NotDeoptimized);
    assert_eq!(frame.pc(), pc);
}

#[test]
fn test_deopt_stub_frame_counts_as_deoptimized() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let pc = common::code_pc(1, 0x8);
    let frame = unsafe { Frame::new(&f.rt, sp, sp, pc) };
    assert_eq!(frame.kind(), FrameKind::Compiled);
    assert!(frame.is_deoptimized_frame());
    // The stub has no original pc to recover.
    assert_eq!(frame.pc(), pc);
}

#[test]
fn test_sender_returning_to_deopt_handler() {
    let chain = CompiledChain::new(&[4, 6]);
    let mid = chain.frames[1];
    // The leaf returns into mid's deopt handler; mid saved its real pc.
    let leaf_sender_sp = chain.stack.index_of(chain.frames[0].fp) + 2;
    chain
        .stack
        .set(leaf_sender_sp - 1, common::code_pc(1, DEOPT_HANDLER).addr());
    chain.stack.set(chain.stack.index_of(mid.sp) + 2, mid.pc.addr());
    let rt = common::runtime(chain.cache.clone()).build();

    let mut map = RegisterMap::new(&rt);
    let leaf = unsafe { Frame::new(&rt, chain.frames[0].sp, chain.frames[0].fp, chain.frames[0].pc) };
    let sender = leaf.sender(&mut map);
    assert!(sender.is_deoptimized_frame());
    assert_eq!(sender.pc(), mid.pc);
    assert_eq!(sender.sp(), mid.sp);

    // The recovered frame walks on normally.
    let entry = sender.sender(&mut map);
    assert!(entry.is_entry_frame());
    assert!(entry.is_first_frame());
}

#[test]
fn test_not_deoptimized_constructor() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let pc = common::code_pc(0, 0x30);
    let cb = f.rt.code().find_blob(pc);
    let frame = unsafe { Frame::new_not_deoptimized(&f.rt, sp, sp, sp.offset(2), pc, cb, None) };
    assert_eq!(frame.deopt_state(), DeoptState::NotDeoptimized);
    assert_eq!(frame.pc(), pc);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "assumed not deoptimized")]
fn test_not_deoptimized_constructor_checks_in_debug() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let pc = common::code_pc(0, DEOPT_HANDLER);
    let cb = f.rt.code().find_blob(pc);
    let _ = unsafe { Frame::new_not_deoptimized(&f.rt, sp, sp, sp.offset(2), pc, cb, None) };
}

// =============================================================================
// Signal handler frames
// =============================================================================

#[test]
fn test_signal_handler_tolerates_junk_pc() {
    let f = fixture();
    f.stack.set(3, 0xdead_beef);
    let sp = f.stack.addr(4);

    let frame = unsafe { Frame::for_signal_handler(&f.rt, sp, sp.offset(2)) };
    assert_eq!(frame.kind(), FrameKind::Native);
    assert_eq!(frame.deopt_state(), DeoptState::NotDeoptimized);
    assert_eq!(frame.pc().addr(), 0xdead_beef);
}

#[test]
fn test_signal_handler_tolerates_null_pc() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let frame = unsafe { Frame::for_signal_handler(&f.rt, sp, sp.offset(2)) };
    assert!(frame.pc().is_null());
    assert!(frame.is_native_frame());
}

#[test]
fn test_signal_handler_recovers_deopt_pc() {
    let f = fixture();
    f.stack.set(3, common::code_pc(0, DEOPT_HANDLER).addr());
    let sp = f.stack.addr(4);

    let frame = unsafe { Frame::for_signal_handler(&f.rt, sp, sp.offset(2)) };
    assert!(frame.is_deoptimized_frame());
    assert_eq!(frame.pc(), common::code_pc(0, 0x24));
}

#[test]
#[should_panic(expected = "no pc?")]
fn test_regular_constructor_rejects_null_pc() {
    let f = fixture();
    let sp = f.stack.addr(4);
    let _ = unsafe { Frame::new(&f.rt, sp, sp, prism_frame::CodeAddr::NULL) };
}
