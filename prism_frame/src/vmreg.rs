//! Abstract register and stack-slot identifiers used by oop maps and
//! register maps.
//!
//! Each general-purpose register occupies two consecutive half-slots (the low
//! and high 32 bits), so `gpr(n)` and `gpr(n).next()` both name register `n`.
//! Identifiers at or above [`REG_COUNT`] name 4-byte stack slots relative to a
//! frame's unextended stack pointer.

use std::fmt;

/// Number of general-purpose registers tracked per frame.
pub const GPR_COUNT: usize = 32;

/// Half-slots per general-purpose register.
pub const SLOTS_PER_GPR: usize = 2;

/// Number of register identifiers a [`crate::RegisterMap`] can hold.
pub const REG_COUNT: usize = GPR_COUNT * SLOTS_PER_GPR;

/// Size in bytes of one oop-map stack slot.
pub const STACK_SLOT_SIZE: usize = 4;

/// Register or stack-slot identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmReg(u16);

impl VmReg {
    /// Identifier for general-purpose register `n` (its low half).
    #[inline]
    pub const fn gpr(n: u8) -> Self {
        debug_assert!((n as usize) < GPR_COUNT);
        Self(n as u16 * SLOTS_PER_GPR as u16)
    }

    /// Identifier for the stack slot `slot` (4-byte units from unextended sp).
    #[inline]
    pub const fn stack_slot(slot: u16) -> Self {
        Self(REG_COUNT as u16 + slot)
    }

    /// Reconstruct from a raw value.
    #[inline]
    pub const fn from_raw(value: u16) -> Self {
        Self(value)
    }

    /// Raw value.
    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// The next half-slot.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this names a register.
    #[inline]
    pub const fn is_reg(self) -> bool {
        (self.0 as usize) < REG_COUNT
    }

    /// Check if this names a stack slot.
    #[inline]
    pub const fn is_stack(self) -> bool {
        !self.is_reg()
    }

    /// Index into a register map's location table.
    #[inline]
    pub const fn reg_index(self) -> usize {
        debug_assert!(self.is_reg());
        self.0 as usize
    }

    /// Byte offset of a stack slot from the unextended stack pointer.
    #[inline]
    pub const fn stack_offset_bytes(self) -> isize {
        debug_assert!(self.is_stack());
        ((self.0 as usize - REG_COUNT) * STACK_SLOT_SIZE) as isize
    }
}

impl fmt::Debug for VmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_reg() {
            let half = if self.0 as usize % SLOTS_PER_GPR == 0 { "" } else { ".H" };
            write!(f, "r{}{}", self.0 as usize / SLOTS_PER_GPR, half)
        } else {
            write!(f, "[sp+{}]", self.stack_offset_bytes())
        }
    }
}
