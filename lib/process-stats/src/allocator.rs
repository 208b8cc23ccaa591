use std::{
    alloc::{GlobalAlloc, Layout},
    sync::atomic::{
        AtomicBool, AtomicU64,
        Ordering::{Relaxed, Release},
    },
};

static GLOBAL_STATS: AllocatorStats = AllocatorStats::new();

/// A global allocator that counts live heap bytes.
///
/// Wraps another allocator, which does the actual work, and keeps running totals of allocated and deallocated bytes
/// so that the number of live heap bytes can be reported at any time. Install it with `#[global_allocator]`:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: process_stats::CountingAllocator<std::alloc::System> =
///     process_stats::CountingAllocator::new(std::alloc::System);
/// ```
pub struct CountingAllocator<A> {
    allocator: A,
}

impl<A> CountingAllocator<A> {
    /// Creates a new `CountingAllocator` that wraps another allocator.
    pub const fn new(allocator: A) -> Self {
        Self { allocator }
    }
}

unsafe impl<A> GlobalAlloc for CountingAllocator<A>
where
    A: GlobalAlloc,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.allocator.alloc(layout);
        if !ptr.is_null() {
            GLOBAL_STATS.track_allocation(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.allocator.alloc_zeroed(layout);
        if !ptr.is_null() {
            GLOBAL_STATS.track_allocation(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        GLOBAL_STATS.track_deallocation(layout.size());
        self.allocator.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.allocator.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            GLOBAL_STATS.track_deallocation(layout.size());
            GLOBAL_STATS.track_allocation(new_size);
        }
        new_ptr
    }
}

/// Allocation totals maintained by [`CountingAllocator`].
pub struct AllocatorStats {
    installed: AtomicBool,
    allocated_bytes: AtomicU64,
    deallocated_bytes: AtomicU64,
}

impl AllocatorStats {
    const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            allocated_bytes: AtomicU64::new(0),
            deallocated_bytes: AtomicU64::new(0),
        }
    }

    /// Gets the process-wide statistics.
    pub fn global() -> &'static Self {
        &GLOBAL_STATS
    }

    /// Returns `true` if [`CountingAllocator`] has serviced at least one allocation.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Relaxed)
    }

    /// Total bytes ever allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Relaxed)
    }

    /// Total bytes ever deallocated.
    pub fn deallocated_bytes(&self) -> u64 {
        self.deallocated_bytes.load(Relaxed)
    }

    /// Bytes allocated and not yet deallocated.
    pub fn live_bytes(&self) -> u64 {
        // The two loads aren't atomic together, so a concurrent free can briefly make deallocations look larger.
        self.allocated_bytes().saturating_sub(self.deallocated_bytes())
    }

    #[inline]
    fn track_allocation(&self, size: usize) {
        self.allocated_bytes.fetch_add(size as u64, Relaxed);
        if !self.installed.load(Relaxed) {
            self.installed.store(true, Release);
        }
    }

    #[inline]
    fn track_deallocation(&self, size: usize) {
        self.deallocated_bytes.fetch_add(size as u64, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::System;

    use super::*;

    #[test]
    fn counts_through_wrapped_allocator() {
        let allocator = CountingAllocator::new(System);
        let layout = Layout::from_size_align(1024, 8).unwrap();

        let allocated_before = GLOBAL_STATS.allocated_bytes();
        let deallocated_before = GLOBAL_STATS.deallocated_bytes();

        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            let ptr = allocator.realloc(ptr, layout, 2048);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, Layout::from_size_align(2048, 8).unwrap());
        }

        assert!(GLOBAL_STATS.is_installed());
        assert_eq!(GLOBAL_STATS.allocated_bytes() - allocated_before, 1024 + 2048);
        assert_eq!(GLOBAL_STATS.deallocated_bytes() - deallocated_before, 1024 + 2048);
    }
}
