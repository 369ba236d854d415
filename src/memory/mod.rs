//! Memory budget allocator
//!
//! Every buffer a worker holds comes from a shared [`MemoryBudget`]. The budget
//! charges the requested size before touching the system allocator and rolls
//! the charge back if the allocation fails, so `in_use` never exceeds the
//! ceiling even while many threads allocate concurrently.
//!
//! A [`Block`] records the exact amount it was charged and gives it back when
//! it is freed or dropped. Blocks are page aligned, which keeps them usable
//! for `O_DIRECT` style I/O on the shared data file.
//!
//! # Example
//!
//! ```
//! use threadstress::memory::MemoryBudget;
//!
//! let budget = MemoryBudget::new(1024 * 1024);
//! let block = budget.alloc(4096).unwrap();
//! assert_eq!(budget.in_use(), 4096);
//! budget.free(block);
//! assert_eq!(budget.in_use(), 0);
//! ```

use crate::error::MemoryError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Alignment of every block handed out by the budget
pub const BLOCK_ALIGNMENT: usize = 4096;

/// Process-wide counting allocator with an optional byte ceiling
#[derive(Debug)]
pub struct MemoryBudget {
    /// Maximum bytes in use at once (0 = unlimited)
    ceiling: u64,
    in_use: AtomicU64,
    peak: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl MemoryBudget {
    /// Create a budget; a ceiling of 0 means unlimited
    pub fn new(ceiling: u64) -> Arc<Self> {
        Arc::new(Self {
            ceiling,
            in_use: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Allocate a zeroed block of `size` bytes
    ///
    /// The charge is taken first with a compare-and-swap so two threads can
    /// never both squeeze under the ceiling with a combined overshoot.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<Block, MemoryError> {
        let charge = size as u64;
        let ceiling = self.ceiling;

        let charged = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(charge)?;
                if ceiling != 0 && next > ceiling {
                    None
                } else {
                    Some(next)
                }
            });

        let previous = match charged {
            Ok(previous) => previous,
            Err(current) => {
                return Err(MemoryError::OutOfBudget {
                    requested: size,
                    in_use: current,
                    ceiling,
                })
            }
        };
        self.peak.fetch_max(previous + charge, Ordering::Relaxed);

        let layout = match Layout::from_size_align(size.max(1), BLOCK_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => {
                self.uncharge(charge);
                return Err(MemoryError::AllocationFailed { requested: size });
            }
        };

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            self.uncharge(charge);
            return Err(MemoryError::AllocationFailed { requested: size });
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);

        Ok(Block {
            ptr,
            size,
            layout,
            budget: Arc::clone(self),
        })
    }

    /// Return a block to the budget (same as dropping it)
    pub fn free(&self, block: Block) {
        drop(block);
    }

    fn uncharge(&self, amount: u64) {
        self.in_use.fetch_sub(amount, Ordering::AcqRel);
    }

    /// Bytes currently charged
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest value `in_use` has reached
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Configured ceiling (0 = unlimited)
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Bytes still available under the ceiling, or `None` when unlimited
    pub fn available(&self) -> Option<u64> {
        if self.ceiling == 0 {
            None
        } else {
            Some(self.ceiling.saturating_sub(self.in_use()))
        }
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }
}

/// Zeroed, page aligned buffer charged against a [`MemoryBudget`]
///
/// The block owns its memory; handing it to another thread moves the unique
/// access along with it.
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
    budget: Arc<MemoryBudget>,
}

// SAFETY: Block owns its allocation exclusively and exposes it only through
// &self / &mut self.
unsafe impl Send for Block {}

impl Block {
    /// Size that was charged for this block
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and uniquely borrowed
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Zero the block, returning the number of bytes written
    pub fn zero(&mut self) -> usize {
        self.as_mut_slice().fill(0);
        self.size
    }

    /// Sum the block as native-endian 64-bit words
    ///
    /// Returns the sum and the number of bytes read. A trailing partial word is
    /// not read.
    pub fn checksum(&self) -> (u64, usize) {
        let words = self.as_slice().chunks_exact(8);
        let bytes = words.len() * 8;
        let sum = words.fold(0u64, |acc, word| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(word);
            acc.wrapping_add(u64::from_ne_bytes(raw))
        });
        (sum, bytes)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
        self.budget.uncharge(self.size as u64);
        self.budget.frees.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_alloc_charges_and_free_uncharges() {
        let budget = MemoryBudget::new(0);
        let block = budget.alloc(10_000).unwrap();
        assert_eq!(block.len(), 10_000);
        assert_eq!(budget.in_use(), 10_000);
        assert_eq!(block.as_slice().as_ptr() as usize % BLOCK_ALIGNMENT, 0);

        budget.free(block);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.allocations(), 1);
        assert_eq!(budget.frees(), 1);
    }

    #[test]
    fn test_out_of_budget() {
        let budget = MemoryBudget::new(8192);
        let first = budget.alloc(6000).unwrap();

        let err = budget.alloc(4096).unwrap_err();
        assert_eq!(
            err,
            MemoryError::OutOfBudget {
                requested: 4096,
                in_use: 6000,
                ceiling: 8192
            }
        );
        // The failed attempt must not leave a charge behind
        assert_eq!(budget.in_use(), 6000);

        drop(first);
        assert!(budget.alloc(8192).is_ok());
    }

    #[test]
    fn test_exact_ceiling_is_allowed() {
        let budget = MemoryBudget::new(4096);
        let block = budget.alloc(4096).unwrap();
        assert_eq!(budget.available(), Some(0));
        drop(block);
        assert_eq!(budget.available(), Some(4096));
    }

    #[test]
    fn test_round_trip_leaves_usage_unchanged() {
        let budget = MemoryBudget::new(1 << 20);
        let _held = budget.alloc(12_345).unwrap();
        let before = budget.in_use();

        for size in [1usize, 7, 4096, 65_536] {
            let block = budget.alloc(size).unwrap();
            budget.free(block);
            assert_eq!(budget.in_use(), before);
        }
    }

    #[test]
    fn test_unlimited_budget_reports_no_availability_limit() {
        let budget = MemoryBudget::new(0);
        assert_eq!(budget.available(), None);
        let _block = budget.alloc(1 << 20).unwrap();
        assert_eq!(budget.peak(), 1 << 20);
    }

    #[test]
    fn test_concurrent_allocations_never_exceed_ceiling() {
        let ceiling = 64 * 1024;
        let budget = MemoryBudget::new(ceiling);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                thread::spawn(move || {
                    for i in 0..500 {
                        if let Ok(block) = budget.alloc(4096 + (i % 5) * 1024) {
                            assert!(budget.in_use() <= ceiling);
                            drop(block);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(budget.peak() <= ceiling);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn test_zero_and_checksum() {
        let budget = MemoryBudget::new(0);
        let mut block = budget.alloc(20).unwrap();
        block.as_mut_slice()[0] = 1;
        block.as_mut_slice()[8] = 2;

        let (sum, bytes) = block.checksum();
        assert_eq!(bytes, 16);
        let expected = u64::from_ne_bytes([1, 0, 0, 0, 0, 0, 0, 0])
            + u64::from_ne_bytes([2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(sum, expected);

        assert_eq!(block.zero(), 20);
        assert_eq!(block.checksum(), (0, 16));
    }
}
