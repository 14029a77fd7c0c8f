//! AArch64 frame layout.

use super::{FrameLayout, PointerAuth};
use crate::vmreg::VmReg;

/// Frame-pointer register (x29).
pub const RFP: VmReg = VmReg::gpr(29);

/// First return-value register (x0).
pub const R0: VmReg = VmReg::gpr(0);

/// AArch64 constant table.
pub const LAYOUT: FrameLayout = FrameLayout {
    name: "aarch64",

    link_offset: 0,
    return_addr_offset: 1,
    sender_sp_offset: 2,

    interpreter_frame_oop_temp_offset: 3,
    interpreter_frame_sender_sp_offset: -1,
    interpreter_frame_last_sp_offset: -2,
    interpreter_frame_method_offset: -3,
    interpreter_frame_mirror_offset: -4,
    interpreter_frame_mdp_offset: -5,
    interpreter_frame_cache_offset: -6,
    interpreter_frame_locals_offset: -7,
    interpreter_frame_bcp_offset: -8,
    interpreter_frame_initial_sp_offset: -9,
    interpreter_frame_monitor_block_top_offset: -9,
    interpreter_frame_monitor_block_bottom_offset: -9,

    entry_frame_call_wrapper_offset: -8,

    monitor_size_words: 2,

    link_register: RFP,
    return_value_register: R0,

    pointer_auth: PointerAuth::Strip { va_bits: 48 },
};
