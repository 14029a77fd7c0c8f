//! Architecture constant tables.
//!
//! Every fixed slot offset the walker uses comes from a [`FrameLayout`]. One
//! table exists per supported architecture and [`HOST`] picks the one for the
//! build target. Tables are plain data, so tests can walk synthetic stacks
//! laid out for any architecture on any host.
//!
//! # Frame Layout (word offsets from fp, stack grows down)
//!
//! ```text
//! ┌────────────────────────────┐  High addresses
//! │  caller's outgoing args    │  fp + sender_sp_offset  (= sender sp)
//! ├────────────────────────────┤
//! │  return address            │  fp + return_addr_offset
//! ├────────────────────────────┤
//! │  saved fp (link)           │  fp + link_offset        ← fp
//! ├────────────────────────────┤
//! │  interpreter sender sp     │  fp - 1
//! │  last sp                   │  fp - 2
//! │  method                    │  fp - 3
//! │  mirror                    │  fp - 4
//! │  mdp / cache / locals      │  fp - 5 .. fp - 7
//! │  bcp                       │  fp - 8
//! │  initial sp / monitor top  │  fp - 9
//! ├────────────────────────────┤
//! │  monitors, expression stack│
//! └────────────────────────────┘  Low addresses
//! ```

pub mod aarch64;
pub mod x86_64;

use crate::address::CodeAddr;
use crate::vmreg::VmReg;

// =============================================================================
// Pointer Authentication
// =============================================================================

/// Return-address signing capability of an architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerAuth {
    /// Return addresses are never signed.
    Unsupported,
    /// Signature bits live above the virtual-address width and are stripped.
    Strip {
        /// Number of meaningful virtual-address bits.
        va_bits: u8,
    },
}

impl PointerAuth {
    /// Decode a possibly-signed return address into a raw code address.
    #[inline]
    pub const fn strip(self, raw: usize) -> CodeAddr {
        match self {
            PointerAuth::Unsupported => CodeAddr::new(raw),
            PointerAuth::Strip { va_bits } => CodeAddr::new(raw & Self::va_mask(va_bits)),
        }
    }

    /// Check that a value carries no signature bits.
    #[inline]
    pub const fn is_raw(self, raw: usize) -> bool {
        match self {
            PointerAuth::Unsupported => true,
            PointerAuth::Strip { va_bits } => raw & !Self::va_mask(va_bits) == 0,
        }
    }

    #[inline]
    const fn va_mask(va_bits: u8) -> usize {
        if va_bits as u32 >= usize::BITS {
            usize::MAX
        } else {
            (1usize << va_bits) - 1
        }
    }
}

// =============================================================================
// FrameLayout
// =============================================================================

/// Fixed frame offsets (in words, relative to fp unless noted) and register
/// conventions for one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Architecture name.
    pub name: &'static str,

    /// Saved caller fp.
    pub link_offset: isize,
    /// Return address into the caller.
    pub return_addr_offset: isize,
    /// Caller's stack pointer at the call.
    pub sender_sp_offset: isize,

    /// Temporary reference slot used by native method wrappers.
    pub interpreter_frame_oop_temp_offset: isize,
    /// Caller's unextended sp, saved by the interpreter.
    pub interpreter_frame_sender_sp_offset: isize,
    /// Top of the expression stack during a call, or null.
    pub interpreter_frame_last_sp_offset: isize,
    /// Executing method.
    pub interpreter_frame_method_offset: isize,
    /// Mirror of the method's holder class.
    pub interpreter_frame_mirror_offset: isize,
    /// Method data pointer.
    pub interpreter_frame_mdp_offset: isize,
    /// Constant-pool cache.
    pub interpreter_frame_cache_offset: isize,
    /// Pointer to local 0.
    pub interpreter_frame_locals_offset: isize,
    /// Bytecode pointer.
    pub interpreter_frame_bcp_offset: isize,
    /// Initial expression-stack pointer.
    pub interpreter_frame_initial_sp_offset: isize,
    /// Slot holding the (moving) low end of the monitor block.
    pub interpreter_frame_monitor_block_top_offset: isize,
    /// Fixed high end of the monitor block.
    pub interpreter_frame_monitor_block_bottom_offset: isize,

    /// Call wrapper pointer in an entry frame.
    pub entry_frame_call_wrapper_offset: isize,

    /// Words per monitor (displaced header + object).
    pub monitor_size_words: usize,

    /// Frame-pointer ("link") register.
    pub link_register: VmReg,
    /// Register holding a call's return value.
    pub return_value_register: VmReg,

    /// Return-address signing.
    pub pointer_auth: PointerAuth,
}

impl FrameLayout {
    /// Words per monitor.
    #[inline]
    pub const fn monitor_size(&self) -> usize {
        self.monitor_size_words
    }
}

/// Constant table for the build target.
#[cfg(target_arch = "aarch64")]
pub const HOST: &FrameLayout = &aarch64::LAYOUT;

/// Constant table for the build target.
#[cfg(target_arch = "x86_64")]
pub const HOST: &FrameLayout = &x86_64::LAYOUT;

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("prism_frame has frame layouts for aarch64 and x86_64 only");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_removes_signature_bits() {
        let pauth = PointerAuth::Strip { va_bits: 48 };
        let signed = 0x002a_0000_0040_1000usize;
        assert!(!pauth.is_raw(signed));
        assert_eq!(pauth.strip(signed), CodeAddr::new(0x40_1000));
        assert!(pauth.is_raw(0x40_1000));
    }

    #[test]
    fn test_unsupported_is_identity() {
        let pauth = PointerAuth::Unsupported;
        assert!(pauth.is_raw(usize::MAX));
        assert_eq!(pauth.strip(0x1234), CodeAddr::new(0x1234));
    }

    #[test]
    fn test_host_matches_build_target() {
        assert_eq!(HOST.name, std::env::consts::ARCH);
    }

    #[test]
    fn test_host_layout_shape() {
        assert_eq!(HOST.link_offset, 0);
        assert_eq!(HOST.return_addr_offset, 1);
        assert_eq!(HOST.sender_sp_offset, 2);
        assert_eq!(HOST.monitor_size(), 2);
        assert!(HOST.link_register.is_reg());
    }
}
