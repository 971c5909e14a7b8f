//! Allocator plumbing.
//!
//! Buffers are allocated through the stable `Allocator` trait from `allocator-api2`.
//! [`TrackingAllocator`] wraps another allocator to count allocations, record memory
//! usage and optionally refuse requests past a byte budget.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

pub use allocator_api2::alloc::{AllocError, Allocator, Global};

const UNLIMITED: usize = usize::MAX;

/// A snapshot of the counters of a [`TrackingAllocator`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of allocations that have not been deallocated yet.
    pub live_allocations: usize,
    /// Number of successful calls to `allocate` since creation.
    pub total_allocations: usize,
    /// Number of successful calls to `grow` and `shrink` since creation.
    pub reallocations: usize,
    /// Number of requests that were refused, by the budget or by the inner allocator.
    pub failed_allocations: usize,
    /// Sum of the sizes of the live allocations.
    pub bytes_in_use: usize,
    /// Highest value `bytes_in_use` has reached.
    pub peak_bytes: usize,
}

/// An allocator that keeps track of what goes through it.
///
/// Sizes are accounted from the requested layouts, not from what the inner allocator
/// actually hands out.
///
/// ```
/// use cow_buffer::CowBuffer;
/// use cow_buffer::allocator::TrackingAllocator;
///
/// let tracker = TrackingAllocator::new().with_limit(256);
/// let mut v: CowBuffer<u64, _> = CowBuffer::new_in(&tracker);
///
/// v.resize(8).unwrap();
/// assert_eq!(tracker.stats().live_allocations, 1);
///
/// // 1024 items do not fit in the budget.
/// assert!(v.resize(1024).unwrap_err().is_out_of_memory());
/// assert_eq!(v.len(), 8);
/// ```
pub struct TrackingAllocator<A: Allocator = Global> {
    inner: A,
    limit: AtomicUsize,
    live: AtomicUsize,
    total: AtomicUsize,
    reallocations: AtomicUsize,
    failed: AtomicUsize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl TrackingAllocator<Global> {
    pub const fn new() -> Self {
        Self::new_in(Global)
    }
}

impl Default for TrackingAllocator<Global> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Allocator> TrackingAllocator<A> {
    pub const fn new_in(inner: A) -> Self {
        TrackingAllocator {
            inner,
            limit: AtomicUsize::new(UNLIMITED),
            live: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            reallocations: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Refuses requests that would bring the memory in use above `bytes`.
    pub fn with_limit(self, bytes: usize) -> Self {
        self.set_limit(Some(bytes));
        self
    }

    /// Sets or removes the byte budget.
    ///
    /// Lowering the budget below the current usage does not free anything, it only
    /// makes subsequent growing requests fail.
    pub fn set_limit(&self, bytes: Option<usize>) {
        self.limit.store(bytes.unwrap_or(UNLIMITED), Ordering::SeqCst);
    }

    pub fn limit(&self) -> Option<usize> {
        match self.limit.load(Ordering::SeqCst) {
            UNLIMITED => None,
            limit => Some(limit),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            live_allocations: self.live.load(Ordering::SeqCst),
            total_allocations: self.total.load(Ordering::SeqCst),
            reallocations: self.reallocations.load(Ordering::SeqCst),
            failed_allocations: self.failed.load(Ordering::SeqCst),
            bytes_in_use: self.in_use.load(Ordering::SeqCst),
            peak_bytes: self.peak.load(Ordering::SeqCst),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn reserve(&self, bytes: usize) -> Result<(), AllocError> {
        let limit = self.limit.load(Ordering::SeqCst);
        let reserved = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_use| {
                in_use.checked_add(bytes).filter(|total| *total <= limit)
            });

        match reserved {
            Ok(prev) => {
                self.peak.fetch_max(prev + bytes, Ordering::SeqCst);
                Ok(())
            }
            Err(in_use) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                log::debug!("refusing allocation of {bytes} bytes ({in_use} in use, budget {limit})");
                Err(AllocError)
            }
        }
    }

    fn unreserve(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn inner_failed(&self, bytes: usize) -> AllocError {
        self.unreserve(bytes);
        self.failed.fetch_add(1, Ordering::SeqCst);
        AllocError
    }
}

unsafe impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.reserve(layout.size())?;
        let alloc = self
            .inner
            .allocate(layout)
            .map_err(|_| self.inner_failed(layout.size()))?;

        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);

        Ok(alloc)
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.reserve(layout.size())?;
        let alloc = self
            .inner
            .allocate_zeroed(layout)
            .map_err(|_| self.inner_failed(layout.size()))?;

        self.live.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);

        Ok(alloc)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.unreserve(layout.size());
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let additional = new_layout.size() - old_layout.size();
        self.reserve(additional)?;
        let alloc = self
            .inner
            .grow(ptr, old_layout, new_layout)
            .map_err(|_| self.inner_failed(additional))?;

        self.reallocations.fetch_add(1, Ordering::SeqCst);

        Ok(alloc)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let additional = new_layout.size() - old_layout.size();
        self.reserve(additional)?;
        let alloc = self
            .inner
            .grow_zeroed(ptr, old_layout, new_layout)
            .map_err(|_| self.inner_failed(additional))?;

        self.reallocations.fetch_add(1, Ordering::SeqCst);

        Ok(alloc)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let alloc = self.inner.shrink(ptr, old_layout, new_layout).map_err(|err| {
            self.failed.fetch_add(1, Ordering::SeqCst);
            err
        })?;

        self.reallocations.fetch_add(1, Ordering::SeqCst);
        self.unreserve(old_layout.size() - new_layout.size());

        Ok(alloc)
    }
}

#[test]
fn tracking_counts() {
    let tracker = TrackingAllocator::new();
    let small = Layout::from_size_align(32, 8).unwrap();
    let big = Layout::from_size_align(128, 8).unwrap();

    unsafe {
        let a = tracker.allocate(small).unwrap();
        let b = tracker.allocate(small).unwrap();
        assert_eq!(tracker.stats().bytes_in_use, 64);

        let b = tracker.grow(b.cast(), small, big).unwrap();
        assert_eq!(tracker.stats().bytes_in_use, 160);

        let b = tracker.shrink(b.cast(), big, small).unwrap();
        tracker.deallocate(a.cast(), small);
        tracker.deallocate(b.cast(), small);
    }

    assert_eq!(
        tracker.stats(),
        MemoryStats {
            live_allocations: 0,
            total_allocations: 2,
            reallocations: 2,
            failed_allocations: 0,
            bytes_in_use: 0,
            peak_bytes: 160,
        }
    );
}

#[test]
fn tracking_limit() {
    let tracker = TrackingAllocator::new().with_limit(100);
    assert_eq!(tracker.limit(), Some(100));

    let layout = Layout::from_size_align(64, 8).unwrap();
    let a = tracker.allocate(layout).unwrap();
    assert!(tracker.allocate(layout).is_err());
    assert_eq!(tracker.stats().failed_allocations, 1);
    assert_eq!(tracker.stats().bytes_in_use, 64);

    tracker.set_limit(None);
    let b = tracker.allocate(layout).unwrap();

    unsafe {
        tracker.deallocate(a.cast(), layout);
        tracker.deallocate(b.cast(), layout);
    }

    assert_eq!(tracker.stats().live_allocations, 0);
}
