//! Registry of installed code, indexed by address.
//!
//! Code is installed and retired by compiler threads while other threads walk
//! stacks, so lookups come in two flavours:
//!
//! - [`CodeLookup::find_blob_fast`] consults committed code only. It is meant
//!   for walks where every return address is known to point at installed code
//!   (for example during a GC pause).
//! - [`CodeLookup::find_blob`] also matches blobs that are still being
//!   installed, and is the safe choice for arbitrary pcs.
//!
//! Both take the registry's read lock; installation takes the write lock.
//! Committed and pending blobs share one lock, so a blob moving from pending
//! to committed is visible to [`CodeLookup::find_blob`] throughout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::CodeBlob;
use crate::address::CodeAddr;
use crate::error::WalkError;

// =============================================================================
// CodeLookup
// =============================================================================

/// Pc-to-metadata lookup used by the walker.
pub trait CodeLookup: Send + Sync {
    /// General lookup, including code that is not yet committed.
    fn find_blob(&self, pc: CodeAddr) -> Option<Arc<CodeBlob>>;

    /// Lookup restricted to committed code.
    fn find_blob_fast(&self, pc: CodeAddr) -> Option<Arc<CodeBlob>> {
        self.find_blob(pc)
    }
}

// =============================================================================
// CodeCache
// =============================================================================

/// Lookup statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    /// Lookups that found a blob.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Blobs committed.
    pub installs: u64,
    /// Blobs retired.
    pub retirements: u64,
}

type BlobMap = BTreeMap<usize, Arc<CodeBlob>>;

#[derive(Debug, Default)]
struct Blobs {
    /// Committed blobs keyed by start address.
    committed: BlobMap,
    /// Blobs whose installation has begun but not finished.
    pending: BlobMap,
}

impl Blobs {
    /// Reject empty ranges and ranges overlapping any known blob.
    fn check_insertable(&self, blob: &CodeBlob) -> Result<(), WalkError> {
        let range = blob.code();
        if range.is_empty() {
            return Err(WalkError::EmptyCodeRange(blob.name().to_owned()));
        }
        for map in [&self.committed, &self.pending] {
            let before = map.range(..range.end.addr()).next_back();
            if let Some((_, existing)) = before {
                if existing.code().overlaps(&range) {
                    return Err(WalkError::OverlappingCode {
                        start: range.start,
                        end: range.end,
                        existing: existing.name().to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Address-ordered registry of code blobs.
#[derive(Debug, Default)]
pub struct CodeCache {
    blobs: RwLock<Blobs>,
    hits: AtomicU64,
    misses: AtomicU64,
    installs: AtomicU64,
    retirements: AtomicU64,
}

impl CodeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install and commit a blob in one step.
    pub fn install(&self, blob: CodeBlob) -> Result<Arc<CodeBlob>, WalkError> {
        let mut blobs = self.blobs.write();
        blobs.check_insertable(&blob)?;
        let blob = Arc::new(blob);
        blobs
            .committed
            .insert(blob.code_begin().addr(), Arc::clone(&blob));
        drop(blobs);
        self.installs.fetch_add(1, Ordering::Relaxed);
        debug!(name = blob.name(), start = %blob.code_begin(), size = blob.code().size(), "installed code blob");
        Ok(blob)
    }

    /// Register a blob that is still being installed.
    ///
    /// Only [`CodeLookup::find_blob`] sees it until [`CodeCache::commit`].
    pub fn begin_install(&self, blob: CodeBlob) -> Result<Arc<CodeBlob>, WalkError> {
        let mut blobs = self.blobs.write();
        blobs.check_insertable(&blob)?;
        let blob = Arc::new(blob);
        blobs
            .pending
            .insert(blob.code_begin().addr(), Arc::clone(&blob));
        drop(blobs);
        debug!(name = blob.name(), start = %blob.code_begin(), "began code installation");
        Ok(blob)
    }

    /// Publish a pending blob to fast lookups.
    pub fn commit(&self, start: CodeAddr) -> Result<Arc<CodeBlob>, WalkError> {
        let mut blobs = self.blobs.write();
        let blob = blobs
            .pending
            .remove(&start.addr())
            .ok_or(WalkError::NotPending(start))?;
        blobs.committed.insert(start.addr(), Arc::clone(&blob));
        drop(blobs);
        self.installs.fetch_add(1, Ordering::Relaxed);
        debug!(name = blob.name(), start = %start, "committed code blob");
        Ok(blob)
    }

    /// Remove a committed blob.
    ///
    /// Frames already holding the blob keep it alive.
    pub fn retire(&self, start: CodeAddr) -> Option<Arc<CodeBlob>> {
        let removed = self.blobs.write().committed.remove(&start.addr());
        if let Some(blob) = &removed {
            self.retirements.fetch_add(1, Ordering::Relaxed);
            debug!(name = blob.name(), start = %start, "retired code blob");
        }
        removed
    }

    /// Number of committed blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().committed.len()
    }

    /// Check if no blob is committed.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().committed.is_empty()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            retirements: self.retirements.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn lookup_in(map: &BlobMap, pc: CodeAddr) -> Option<Arc<CodeBlob>> {
        // Largest start <= pc.
        map.range(..=pc.addr())
            .next_back()
            .filter(|(_, blob)| blob.contains(pc))
            .map(|(_, blob)| Arc::clone(blob))
    }

    #[inline]
    fn record(&self, result: Option<Arc<CodeBlob>>) -> Option<Arc<CodeBlob>> {
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl CodeLookup for CodeCache {
    fn find_blob(&self, pc: CodeAddr) -> Option<Arc<CodeBlob>> {
        if pc.is_null() {
            return self.record(None);
        }
        let blobs = self.blobs.read();
        let found =
            Self::lookup_in(&blobs.committed, pc).or_else(|| Self::lookup_in(&blobs.pending, pc));
        drop(blobs);
        self.record(found)
    }

    fn find_blob_fast(&self, pc: CodeAddr) -> Option<Arc<CodeBlob>> {
        if pc.is_null() {
            return self.record(None);
        }
        let found = Self::lookup_in(&self.blobs.read().committed, pc);
        self.record(found)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::CodeRange;
    use crate::code::BlobKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn stub(name: &str, start: usize, size: usize) -> CodeBlob {
        CodeBlob::new(
            name,
            BlobKind::RuntimeStub,
            CodeRange::new(CodeAddr::new(start), size),
            2,
        )
    }

    #[test]
    fn test_install_and_lookup() {
        let cache = CodeCache::new();
        cache.install(stub("a", 0x1000, 0x100)).unwrap();
        cache.install(stub("b", 0x2000, 0x200)).unwrap();
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.find_blob(CodeAddr::new(0x1010)).unwrap().name(), "a");
        assert_eq!(cache.find_blob_fast(CodeAddr::new(0x21ff)).unwrap().name(), "b");
        assert!(cache.find_blob(CodeAddr::new(0x1100)).is_none());
        assert!(cache.find_blob(CodeAddr::NULL).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.installs, 2);
    }

    #[test]
    fn test_overlap_rejected() {
        let cache = CodeCache::new();
        cache.install(stub("a", 0x1000, 0x100)).unwrap();
        let err = cache.install(stub("b", 0x10f0, 0x100)).unwrap_err();
        assert!(matches!(err, WalkError::OverlappingCode { ref existing, .. } if existing == "a"));

        // Adjacent is fine.
        cache.install(stub("c", 0x1100, 0x100)).unwrap();
    }

    #[test]
    fn test_empty_range_rejected() {
        let cache = CodeCache::new();
        let err = cache.install(stub("empty", 0x1000, 0)).unwrap_err();
        assert_eq!(err, WalkError::EmptyCodeRange("empty".into()));
    }

    #[test]
    fn test_pending_visible_to_general_lookup_only() {
        let cache = CodeCache::new();
        cache.begin_install(stub("new", 0x3000, 0x80)).unwrap();
        let pc = CodeAddr::new(0x3010);

        assert!(cache.find_blob(pc).is_some());
        assert!(cache.find_blob_fast(pc).is_none());

        cache.commit(CodeAddr::new(0x3000)).unwrap();
        assert!(cache.find_blob_fast(pc).is_some());
        assert_eq!(
            cache.commit(CodeAddr::new(0x3000)).unwrap_err(),
            WalkError::NotPending(CodeAddr::new(0x3000))
        );
    }

    #[test]
    fn test_pending_blob_blocks_overlapping_install() {
        let cache = CodeCache::new();
        cache.begin_install(stub("pending", 0x4000, 0x100)).unwrap();
        let err = cache.install(stub("late", 0x4080, 0x100)).unwrap_err();
        assert!(matches!(err, WalkError::OverlappingCode { ref existing, .. } if existing == "pending"));
    }

    #[test]
    fn test_general_lookup_never_misses_during_commit() {
        const BLOBS: usize = 5_000;
        const SIZE: usize = 0x40;

        let cache = Arc::new(CodeCache::new());
        // Index of the newest blob that has begun installation.
        let latest = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        cache.begin_install(stub("blob0", 0x10_0000, SIZE)).unwrap();

        let reader = {
            let cache = Arc::clone(&cache);
            let latest = Arc::clone(&latest);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut misses = 0;
                while !done.load(Ordering::Acquire) {
                    let i = latest.load(Ordering::Acquire);
                    let pc = CodeAddr::new(0x10_0000 + i * SIZE + 8);
                    if cache.find_blob(pc).is_none() {
                        misses += 1;
                    }
                }
                misses
            })
        };

        for i in 0..BLOBS {
            let start = 0x10_0000 + i * SIZE;
            if i > 0 {
                cache.begin_install(stub("blob", start, SIZE)).unwrap();
                latest.store(i, Ordering::Release);
            }
            cache.commit(CodeAddr::new(start)).unwrap();
        }
        done.store(true, Ordering::Release);

        assert_eq!(reader.join().unwrap(), 0);
        assert_eq!(cache.len(), BLOBS);
    }

    #[test]
    fn test_concurrent_overlapping_installs_admit_one() {
        let cache = Arc::new(CodeCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.install(stub("racer", 0x8000 + i * 0x10, 0x100)).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_retire() {
        let cache = CodeCache::new();
        let blob = cache.install(stub("a", 0x1000, 0x100)).unwrap();
        let retired = cache.retire(CodeAddr::new(0x1000)).unwrap();
        assert!(Arc::ptr_eq(&blob, &retired));
        assert!(cache.is_empty());
        assert!(cache.find_blob(CodeAddr::new(0x1010)).is_none());
        assert!(cache.retire(CodeAddr::new(0x1000)).is_none());
        assert_eq!(cache.stats().retirements, 1);
    }
}
