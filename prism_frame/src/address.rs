//! Typed stack and code addresses.
//!
//! Frame walking is pointer arithmetic on a native stack. Rather than pass
//! bare `usize`s around, stack locations are [`StackAddr`] (word-granular,
//! readable) and instruction addresses are [`CodeAddr`] (never dereferenced).
//! Mixing the two is a type error, and the only arithmetic offered is what the
//! walker actually needs: offset-by-word, offset-by-byte and distance.

use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = size_of::<usize>();

// =============================================================================
// StackAddr
// =============================================================================

/// Address of a word on a native stack.
///
/// Ordering follows address order, so on a downward-growing stack a larger
/// `StackAddr` belongs to an older frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct StackAddr(usize);

impl StackAddr {
    /// The null stack address.
    pub const NULL: StackAddr = StackAddr(0);

    /// Wrap a raw address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Wrap a raw pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw address value.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Check for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check word alignment.
    #[inline]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }

    /// Address `words` machine words away (negative moves toward younger frames).
    #[inline]
    pub const fn offset(self, words: isize) -> Self {
        Self(self.0.wrapping_add_signed(words.wrapping_mul(WORD_SIZE as isize)))
    }

    /// Address `bytes` bytes away.
    #[inline]
    pub const fn byte_offset(self, bytes: isize) -> Self {
        Self(self.0.wrapping_add_signed(bytes))
    }

    /// Signed distance in words from `lower` up to `self`.
    #[inline]
    pub const fn words_since(self, lower: StackAddr) -> isize {
        (self.0 as isize).wrapping_sub(lower.0 as isize) / WORD_SIZE as isize
    }

    /// Raw pointer view.
    #[inline]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Read a value of type `T` stored at this address.
    ///
    /// # Safety
    ///
    /// The address must be valid for reads of `T` and must not be concurrently
    /// written (the walked thread is stopped or is the current thread).
    #[inline]
    pub unsafe fn read<T: Copy>(self) -> T {
        debug_assert!(!self.is_null(), "read through null stack address");
        debug_assert!(
            self.0 % align_of::<T>() == 0,
            "misaligned stack read at {:#x}",
            self.0
        );
        // SAFETY: upheld by the caller.
        unsafe { ptr::read(self.0 as *const T) }
    }

    /// Read the machine word stored at this address.
    ///
    /// # Safety
    ///
    /// Same requirements as [`StackAddr::read`].
    #[inline]
    pub unsafe fn read_word(self) -> usize {
        // SAFETY: upheld by the caller.
        unsafe { self.read::<usize>() }
    }

    /// Read a stack address stored at this address (saved links, anchors).
    ///
    /// # Safety
    ///
    /// Same requirements as [`StackAddr::read`].
    #[inline]
    pub unsafe fn read_addr(self) -> StackAddr {
        // SAFETY: upheld by the caller.
        StackAddr(unsafe { self.read_word() })
    }

    /// Write a value of type `T` at this address.
    ///
    /// # Safety
    ///
    /// The address must be valid for writes of `T` and nothing else may access
    /// it concurrently.
    #[inline]
    pub unsafe fn write<T: Copy>(self, value: T) {
        debug_assert!(!self.is_null(), "write through null stack address");
        debug_assert!(
            self.0 % align_of::<T>() == 0,
            "misaligned stack write at {:#x}",
            self.0
        );
        // SAFETY: upheld by the caller.
        unsafe { ptr::write(self.0 as *mut T, value) }
    }
}

impl fmt::Debug for StackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackAddr({:#x})", self.0)
    }
}

impl fmt::Display for StackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for StackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// =============================================================================
// CodeAddr
// =============================================================================

/// Address of a machine instruction.
///
/// Always raw: pointer-authentication signatures are stripped before a value
/// becomes a `CodeAddr` held by a frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CodeAddr(usize);

impl CodeAddr {
    /// The null code address.
    pub const NULL: CodeAddr = CodeAddr(0);

    /// Wrap a raw address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Raw address value.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Check for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Byte offset from `base`, if `self` is at or above it and fits in 32 bits.
    #[inline]
    pub fn offset_from(self, base: CodeAddr) -> Option<u32> {
        self.0
            .checked_sub(base.0)
            .and_then(|delta| u32::try_from(delta).ok())
    }
}

impl fmt::Debug for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddr({:#x})", self.0)
    }
}

impl fmt::Display for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// CodeRange
// =============================================================================

/// Half-open range of code addresses `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRange {
    /// First address in the range.
    pub start: CodeAddr,
    /// One past the last address.
    pub end: CodeAddr,
}

impl CodeRange {
    /// An empty range that contains nothing.
    pub const EMPTY: CodeRange = CodeRange {
        start: CodeAddr::NULL,
        end: CodeAddr::NULL,
    };

    /// Create a range from a start address and a size in bytes.
    #[inline]
    pub const fn new(start: CodeAddr, size: usize) -> Self {
        Self {
            start,
            end: start.add(size),
        }
    }

    /// Size in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.end.addr().saturating_sub(self.start.addr())
    }

    /// Check if the range is empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end.addr() <= self.start.addr()
    }

    /// Check if `pc` falls inside the range.
    #[inline]
    pub fn contains(&self, pc: CodeAddr) -> bool {
        pc >= self.start && pc < self.end
    }

    /// Like [`CodeRange::contains`] but also accepts the end address, which is
    /// where a return address lands after a call in the last instruction.
    #[inline]
    pub fn contains_inclusive(&self, pc: CodeAddr) -> bool {
        pc >= self.start && pc <= self.end
    }

    /// Check whether two ranges share any address.
    #[inline]
    pub fn overlaps(&self, other: &CodeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_addr_offsets() {
        let base = StackAddr::new(0x1000);
        assert_eq!(base.offset(2).addr(), 0x1000 + 2 * WORD_SIZE);
        assert_eq!(base.offset(-1).addr(), 0x1000 - WORD_SIZE);
        assert_eq!(base.byte_offset(4).addr(), 0x1004);
        assert_eq!(base.offset(6).words_since(base), 6);
        assert_eq!(base.words_since(base.offset(3)), -3);
    }

    #[test]
    fn test_stack_addr_ordering() {
        let young = StackAddr::new(0x1000);
        let old = young.offset(4);
        assert!(old > young);
        assert!(StackAddr::NULL.is_null());
        assert!(young.is_word_aligned());
        assert!(!young.byte_offset(1).is_word_aligned());
    }

    #[test]
    fn test_stack_addr_read_write() {
        let mut words = [0usize; 4];
        let base = StackAddr::from_ptr(words.as_mut_ptr());
        unsafe {
            base.offset(1).write(0xdead_usize);
            base.offset(2).write(base.addr());
            assert_eq!(base.offset(1).read_word(), 0xdead);
            assert_eq!(base.offset(2).read_addr(), base);
        }
        assert_eq!(words[1], 0xdead);
    }

    #[test]
    fn test_code_addr_offset_from() {
        let base = CodeAddr::new(0x4000);
        assert_eq!(CodeAddr::new(0x4010).offset_from(base), Some(0x10));
        assert_eq!(CodeAddr::new(0x3ff0).offset_from(base), None);
        assert_eq!(base.add(0x20), CodeAddr::new(0x4020));
    }

    #[test]
    fn test_code_range_contains() {
        let range = CodeRange::new(CodeAddr::new(0x1000), 0x100);
        assert!(range.contains(CodeAddr::new(0x1000)));
        assert!(range.contains(CodeAddr::new(0x10ff)));
        assert!(!range.contains(CodeAddr::new(0x1100)));
        assert!(range.contains_inclusive(CodeAddr::new(0x1100)));
        assert_eq!(range.size(), 0x100);
        assert!(CodeRange::EMPTY.is_empty());
    }

    #[test]
    fn test_code_range_overlaps() {
        let a = CodeRange::new(CodeAddr::new(0x1000), 0x100);
        let b = CodeRange::new(CodeAddr::new(0x10f0), 0x100);
        let c = CodeRange::new(CodeAddr::new(0x1100), 0x100);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
