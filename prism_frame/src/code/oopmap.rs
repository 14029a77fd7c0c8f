//! Oop maps: which registers and stack slots hold heap references at a
//! program point of compiled code.
//!
//! Each code blob carries an [`OopMapSet`] with one [`ImmutableOopMap`] per
//! GC-safe pc offset. Besides reference locations, a map records where the
//! blob saved callee-saved registers, which is how a [`RegisterMap`] learns
//! register save locations while the walk moves outward.
//!
//! # Example
//!
//! ```ignore
//! use prism_frame::code::{OopMapBuilder, OopMapValue};
//! use prism_frame::VmReg;
//!
//! let mut builder = OopMapBuilder::new();
//! builder.add(0x40, [OopMapValue::oop(VmReg::stack_slot(0))]);
//! builder.add(0x20, [OopMapValue::callee_saved(VmReg::stack_slot(2), VmReg::gpr(19))]);
//! let set = builder.finish();
//!
//! let handle = set.find_map_at_offset(0x40).unwrap();
//! assert_eq!(set.get(handle).unwrap().num_oops(), 1);
//! ```

use smallvec::SmallVec;

use crate::frame::{Frame, OopClosure};
use crate::register_map::RegisterMap;
use crate::vmreg::VmReg;

// =============================================================================
// OopMapValue
// =============================================================================

/// What an oop-map entry says about its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OopKind {
    /// Full-width heap reference.
    Oop,
    /// Compressed heap reference.
    NarrowOop,
    /// The location holds the caller's value of register `content`.
    CalleeSaved {
        /// Register whose value was saved here.
        content: VmReg,
    },
    /// Interior pointer derived from the reference in `base`.
    Derived {
        /// Location of the base reference.
        base: VmReg,
    },
}

/// One entry of an oop map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OopMapValue {
    /// Register or stack slot described.
    pub reg: VmReg,
    /// Meaning of the location.
    pub kind: OopKind,
}

impl OopMapValue {
    /// A full-width reference at `reg`.
    #[inline]
    pub const fn oop(reg: VmReg) -> Self {
        Self {
            reg,
            kind: OopKind::Oop,
        }
    }

    /// A compressed reference at `reg`.
    #[inline]
    pub const fn narrow_oop(reg: VmReg) -> Self {
        Self {
            reg,
            kind: OopKind::NarrowOop,
        }
    }

    /// `reg` holds the saved value of register `content`.
    #[inline]
    pub const fn callee_saved(reg: VmReg, content: VmReg) -> Self {
        Self {
            reg,
            kind: OopKind::CalleeSaved { content },
        }
    }

    /// `reg` holds a pointer derived from the reference at `base`.
    #[inline]
    pub const fn derived(reg: VmReg, base: VmReg) -> Self {
        Self {
            reg,
            kind: OopKind::Derived { base },
        }
    }

    /// Check if this entry is a (full or narrow) reference.
    #[inline]
    pub const fn is_oop(&self) -> bool {
        matches!(self.kind, OopKind::Oop | OopKind::NarrowOop)
    }
}

// =============================================================================
// ImmutableOopMap
// =============================================================================

/// Oop map for one pc offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableOopMap {
    pc_offset: u32,
    values: SmallVec<[OopMapValue; 8]>,
}

impl ImmutableOopMap {
    /// Create a map for `pc_offset`.
    pub fn new(pc_offset: u32, values: impl IntoIterator<Item = OopMapValue>) -> Self {
        Self {
            pc_offset,
            values: values.into_iter().collect(),
        }
    }

    /// Pc offset within the owning blob.
    #[inline]
    pub fn pc_offset(&self) -> u32 {
        self.pc_offset
    }

    /// All entries.
    #[inline]
    pub fn values(&self) -> &[OopMapValue] {
        &self.values
    }

    /// Number of reference-bearing locations.
    #[inline]
    pub fn num_oops(&self) -> usize {
        self.values.iter().filter(|v| v.is_oop()).count()
    }

    /// Check for callee-saved register entries.
    #[inline]
    pub fn has_callee_saved(&self) -> bool {
        self.values
            .iter()
            .any(|v| matches!(v.kind, OopKind::CalleeSaved { .. }))
    }

    /// Record every callee-saved register this map knows about in `map`.
    pub fn update_register_map(&self, frame: &Frame, map: &mut RegisterMap<'_>) {
        for value in &self.values {
            if let OopKind::CalleeSaved { content } = value.kind {
                if let Some(location) = frame.oopmapreg_to_location(value.reg, map) {
                    map.set_location(content, location);
                }
            }
        }
    }

    /// Report every reference location of `frame` to `closure`.
    ///
    /// # Panics
    ///
    /// Panics if a live reference sits in a register whose save location is
    /// unknown: the walk did not pass through the frame that saved it.
    pub fn oops_do(&self, frame: &Frame, map: &RegisterMap<'_>, closure: &mut dyn OopClosure) {
        for value in &self.values {
            let location = || {
                frame
                    .oopmapreg_to_location(value.reg, map)
                    .unwrap_or_else(|| panic!("no saved location for live register {:?}", value.reg))
            };
            match value.kind {
                OopKind::Oop => closure.do_oop(location()),
                OopKind::NarrowOop => closure.do_narrow_oop(location()),
                OopKind::Derived { base } => {
                    let base_location = frame
                        .oopmapreg_to_location(base, map)
                        .unwrap_or_else(|| panic!("no saved location for base register {:?}", base));
                    closure.do_derived_oop(base_location, location());
                }
                OopKind::CalleeSaved { .. } => {}
            }
        }
    }
}

// =============================================================================
// OopMapSet
// =============================================================================

/// Cacheable reference to one map of an [`OopMapSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OopMapHandle(u32);

impl OopMapHandle {
    /// Index within the set.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// All oop maps of a code blob, sorted by pc offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OopMapSet {
    maps: Box<[ImmutableOopMap]>,
}

impl OopMapSet {
    /// Create a set; maps are sorted by pc offset.
    pub fn new(mut maps: Vec<ImmutableOopMap>) -> Self {
        maps.sort_by_key(|m| m.pc_offset);
        debug_assert!(
            maps.windows(2).all(|w| w[0].pc_offset < w[1].pc_offset),
            "duplicate oop map pc offset"
        );
        Self {
            maps: maps.into_boxed_slice(),
        }
    }

    /// Find the map recorded exactly at `pc_offset`.
    ///
    /// Only GC-safe points have maps, so there is no predecessor fallback.
    #[inline]
    pub fn find_map_at_offset(&self, pc_offset: u32) -> Option<OopMapHandle> {
        self.maps
            .binary_search_by_key(&pc_offset, |m| m.pc_offset)
            .ok()
            .map(|idx| OopMapHandle(idx as u32))
    }

    /// Resolve a handle.
    #[inline]
    pub fn get(&self, handle: OopMapHandle) -> Option<&ImmutableOopMap> {
        self.maps.get(handle.index())
    }

    /// Number of maps.
    #[inline]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Iterate over maps in pc order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ImmutableOopMap> {
        self.maps.iter()
    }
}

// =============================================================================
// OopMapBuilder
// =============================================================================

/// Collects oop maps while code is emitted.
#[derive(Debug, Default)]
pub struct OopMapBuilder {
    maps: Vec<ImmutableOopMap>,
}

impl OopMapBuilder {
    /// Create an empty builder.
    #[inline]
    pub fn new() -> Self {
        Self {
            maps: Vec::with_capacity(8),
        }
    }

    /// Record the map for `pc_offset`.
    #[inline]
    pub fn add(&mut self, pc_offset: u32, values: impl IntoIterator<Item = OopMapValue>) {
        self.maps.push(ImmutableOopMap::new(pc_offset, values));
    }

    /// Number of maps recorded.
    #[inline]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Build the sorted set.
    #[inline]
    pub fn finish(self) -> OopMapSet {
        OopMapSet::new(self.maps)
    }
}

// =============================================================================
// Tests
// =============================================================================
