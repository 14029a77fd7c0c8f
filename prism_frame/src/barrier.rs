//! Collector hooks used while walking.
//!
//! A concurrent collector may relocate objects while a stack is being walked.
//! The walker therefore never dereferences a reference slot itself: it goes
//! through a [`LoadBarrier`] supplied by the collector. [`StackWatermark`]
//! lets a collector that processes stacks lazily observe every frame a walk
//! produces.

use std::fmt;

use crate::address::StackAddr;
use crate::frame::Frame;
use crate::runtime::ManagedThread;

// =============================================================================
// Oop
// =============================================================================

/// A heap reference word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Oop(usize);

impl Oop {
    /// The null reference.
    pub const NULL: Oop = Oop(0);

    /// Wrap raw reference bits.
    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    /// Raw reference bits.
    #[inline]
    pub const fn to_bits(self) -> usize {
        self.0
    }

    /// Check for null.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oop({:#x})", self.0)
    }
}

// =============================================================================
// LoadBarrier
// =============================================================================

/// Relocation-aware access to reference slots on a stack.
pub trait LoadBarrier: Send + Sync {
    /// Load the reference stored in `slot`, healing it if the referent moved.
    ///
    /// # Safety
    ///
    /// `slot` must be a readable, word-aligned reference slot.
    unsafe fn load_oop(&self, slot: StackAddr) -> Oop;

    /// Store `value` into `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be a writable, word-aligned reference slot.
    unsafe fn store_oop(&self, slot: StackAddr, value: Oop) {
        // SAFETY: upheld by the caller.
        unsafe { slot.write(value) }
    }
}

/// Plain loads and stores, for collectors that never move objects concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawAccess;

impl LoadBarrier for RawAccess {
    #[inline]
    unsafe fn load_oop(&self, slot: StackAddr) -> Oop {
        // SAFETY: upheld by the caller.
        unsafe { slot.read::<Oop>() }
    }
}

// =============================================================================
// StackWatermark
// =============================================================================

/// Observer notified of every sender frame a processing walk produces.
pub trait StackWatermark: Send + Sync {
    /// Called with each frame returned by [`Frame::sender`].
    fn on_iteration(&self, thread: Option<&ManagedThread>, frame: &Frame);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oop_bits() {
        let oop = Oop::from_bits(0xcafe_0000);
        assert_eq!(oop.to_bits(), 0xcafe_0000);
        assert!(!oop.is_null());
        assert!(Oop::NULL.is_null());
    }

    #[test]
    fn test_raw_access_round_trip() {
        let mut slot = [0usize; 1];
        let addr = StackAddr::from_ptr(slot.as_mut_ptr());
        unsafe {
            RawAccess.store_oop(addr, Oop::from_bits(0x1000));
            assert_eq!(RawAccess.load_oop(addr), Oop::from_bits(0x1000));
        }
        assert_eq!(slot[0], 0x1000);
    }
}
