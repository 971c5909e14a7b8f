//! Layout and lifetime of the underlying allocation.
//!
//! ```text
//! +-----------+-----+--------+--------+-----+------------+
//! | ref_count | len | item 0 | item 1 | ... | (reserved) |
//! +-----------+-----+--------+--------+-----+------------+
//!                   ^
//!                   data pointer held by the handle
//! ```
//!
//! The capacity is not stored. The allocation size is always
//! `buffer_layout::<T>(len)`, so every change of `len` that crosses a size class
//! must be paired with a reallocation.

use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

use crate::allocator::Allocator;
use crate::element::Element;
use crate::error::Error;
use crate::refcount::AtomicRefCount;
use crate::util::{self, nnptr};

pub type BufferSize = u32;

/// Maximum number of items in a buffer.
pub const MAX_LEN: usize = BufferSize::MAX as usize;

/// Some information stored at the beginning of every buffer.
#[repr(C)]
pub struct Header {
    pub ref_count: AtomicRefCount,
    pub len: BufferSize,
}

#[inline(always)]
pub(crate) unsafe fn header<'l, T>(data: NonNull<T>) -> &'l Header {
    util::header_ptr(data).as_ref()
}

#[inline(always)]
pub(crate) unsafe fn len<T>(data: NonNull<T>) -> usize {
    header(data).len as usize
}

/// # Safety
///
/// The buffer must be uniquely owned by the caller.
#[inline(always)]
pub(crate) unsafe fn set_len<T>(data: NonNull<T>, len: usize) {
    debug_assert!(len <= MAX_LEN);
    (*util::header_ptr(data).as_ptr()).len = len as BufferSize;
}

#[cold]
fn alloc_failed(layout: Layout) -> Error {
    Error::AllocFailed { layout }
}

/// Allocates a buffer with a reference count of one and no items.
pub(crate) fn allocate<T, A: Allocator>(layout: Layout, allocator: &A) -> Result<NonNull<T>, Error> {
    let alloc = allocator
        .allocate(layout)
        .map_err(|_| alloc_failed(layout))?;

    unsafe {
        nnptr::write(
            alloc.cast::<Header>(),
            Header {
                ref_count: AtomicRefCount::new(1),
                len: 0,
            },
        );

        Ok(util::data_ptr::<T>(alloc.cast::<u8>()))
    }
}

/// Frees the allocation without touching the items.
///
/// # Safety
///
/// The buffer must be uniquely owned and `layout` must be its current layout.
pub(crate) unsafe fn deallocate<T, A: Allocator>(data: NonNull<T>, layout: Layout, allocator: &A) {
    allocator.deallocate(util::header_ptr(data).cast::<u8>(), layout);
}

/// Moves the allocation to `new_layout`. Header and items are carried over.
///
/// If the sizes are the same nothing happens. On failure the buffer is left as it was.
///
/// # Safety
///
/// The buffer must be uniquely owned, `old_layout` must be its current layout and the
/// items must fit in `new_layout`.
pub(crate) unsafe fn reallocate<T, A: Allocator>(
    data: NonNull<T>,
    old_layout: Layout,
    new_layout: Layout,
    allocator: &A,
) -> Result<NonNull<T>, Error> {
    if old_layout.size() == new_layout.size() {
        return Ok(data);
    }

    let old_alloc = util::header_ptr(data).cast::<u8>();
    let new_alloc = if new_layout.size() > old_layout.size() {
        allocator.grow(old_alloc, old_layout, new_layout)
    } else {
        allocator.shrink(old_alloc, old_layout, new_layout)
    }
    .map_err(|_| alloc_failed(new_layout))?;

    let data = util::data_ptr::<T>(new_alloc.cast::<u8>());
    log::trace!(
        "reallocated buffer of {} items: {} -> {} bytes",
        len(data),
        old_layout.size(),
        new_layout.size(),
    );

    Ok(data)
}

/// Drops the items in `start..end`.
///
/// # Safety
///
/// The items in the range must be initialized and must not be used afterwards.
#[inline]
pub(crate) unsafe fn drop_range<T>(data: NonNull<T>, start: usize, end: usize) {
    if mem::needs_drop::<T>() && start < end {
        let items = ptr::slice_from_raw_parts_mut(nnptr::add(data, start).as_ptr(), end - start);
        ptr::drop_in_place(items);
    }
}

/// Removes a reference, destroying the buffer if it was the last one.
///
/// Returns true if the buffer was destroyed.
///
/// # Safety
///
/// The caller gives up its reference: `data` must not be used afterwards.
pub(crate) unsafe fn release<T, A: Allocator>(data: NonNull<T>, allocator: &A) -> bool {
    if header(data).ref_count.decrement() > 0 {
        return false;
    }

    // See the implementation of std's Arc for the need of this fence.
    fence(Ordering::Acquire);

    let len = len(data);
    drop_range(data, 0, len);
    deallocate(data, util::existing_layout::<T>(len), allocator);

    true
}

/// Frees a partially constructed copy if cloning an item panics.
struct PartialCopy<'l, T, A: Allocator> {
    data: NonNull<T>,
    layout: Layout,
    allocator: &'l A,
}

impl<'l, T, A: Allocator> Drop for PartialCopy<'l, T, A> {
    fn drop(&mut self) {
        unsafe {
            drop_range(self.data, 0, len(self.data));
            deallocate(self.data, self.layout, self.allocator);
        }
    }
}

/// Allocates a uniquely owned copy of the buffer with the given layout.
///
/// The source buffer is not modified, including when the allocation fails.
///
/// # Safety
///
/// `src` must point to a live buffer and `layout` must have room for its items.
pub(crate) unsafe fn fork<T: Element, A: Allocator>(
    src: NonNull<T>,
    layout: Layout,
    allocator: &A,
) -> Result<NonNull<T>, Error> {
    let len = len(src);
    debug_assert!(layout.size() >= util::existing_layout::<T>(len).size());
    let dst = allocate::<T, A>(layout, allocator)?;

    if T::TRIVIALLY_COPYABLE {
        nnptr::copy_nonoverlapping(src, dst, len);
        set_len(dst, len);
    } else {
        let guard = PartialCopy { data: dst, layout, allocator };
        for i in 0..len {
            let item = nnptr::add(src, i).as_ref().clone();
            nnptr::write(nnptr::add(dst, i), item);
            set_len(dst, i + 1);
        }
        mem::forget(guard);
    }

    Ok(dst)
}

/// Writes default values in `start..end`, bumping the length after each one.
///
/// # Safety
///
/// The buffer must be uniquely owned, its length must be `start` and its allocation
/// must have room for `end` items.
pub(crate) unsafe fn construct_range<T: Element>(data: NonNull<T>, start: usize, end: usize) {
    debug_assert_eq!(len(data), start);

    if T::ZEROED_DEFAULT {
        ptr::write_bytes(nnptr::add(data, start).as_ptr(), 0, end - start);
        set_len(data, end);
        return;
    }

    for i in start..end {
        nnptr::write(nnptr::add(data, i), T::default());
        set_len(data, i + 1);
    }
}

/// Clones `items` after the existing ones, bumping the length after each one.
///
/// # Safety
///
/// The buffer must be uniquely owned and its allocation must have room for the items.
pub(crate) unsafe fn extend_from_slice<T: Element>(data: NonNull<T>, items: &[T]) {
    let start = len(data);

    if T::TRIVIALLY_COPYABLE {
        let src = NonNull::new_unchecked(items.as_ptr() as *mut T);
        nnptr::copy_nonoverlapping(src, nnptr::add(data, start), items.len());
        set_len(data, start + items.len());
        return;
    }

    for (i, item) in items.iter().enumerate() {
        nnptr::write(nnptr::add(data, start + i), item.clone());
        set_len(data, start + i + 1);
    }
}

#[test]
fn header_layout() {
    assert_eq!(mem::size_of::<Header>(), 8);
    assert_eq!(mem::align_of::<Header>(), 4);
}

#[test]
fn allocate_fork_release() {
    use crate::allocator::TrackingAllocator;

    let tracker = TrackingAllocator::new();
    unsafe {
        let layout = util::buffer_layout::<String>(3).unwrap();
        let a = allocate::<String, _>(layout, &tracker).unwrap();
        extend_from_slice(a, &["a".to_string(), "b".to_string(), "c".to_string()]);
        assert_eq!(len(a), 3);
        assert_eq!(header(a).ref_count.get(), 1);

        let b = fork(a, layout, &tracker).unwrap();
        assert_eq!(len(b), 3);
        assert_eq!(nnptr::add(b, 2).as_ref(), "c");
        assert_eq!(tracker.stats().live_allocations, 2);

        // A fork can be larger than its source.
        let big = util::buffer_layout::<String>(40).unwrap();
        let c = fork(a, big, &tracker).unwrap();
        assert_eq!(len(c), 3);
        assert_eq!(tracker.stats().bytes_in_use, 2 * layout.size() + big.size());
        assert!(release(c, &tracker));

        assert!(release(a, &tracker));
        assert!(release(b, &tracker));
    }

    assert_eq!(tracker.stats().live_allocations, 0);
    assert_eq!(tracker.stats().bytes_in_use, 0);
}

#[test]
fn panicking_clone_during_fork() {
    use crate::allocator::TrackingAllocator;
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

    static CLONES: AtomicU32 = AtomicU32::new(0);
    static DROPS: AtomicU32 = AtomicU32::new(0);

    #[derive(Default)]
    struct Fragile;
    impl Clone for Fragile {
        fn clone(&self) -> Self {
            if CLONES.fetch_add(1, SeqCst) == 2 {
                panic!("clone failed");
            }
            Fragile
        }
    }
    impl Drop for Fragile {
        fn drop(&mut self) {
            DROPS.fetch_add(1, SeqCst);
        }
    }
    unsafe impl Element for Fragile {}

    let tracker = TrackingAllocator::new();
    unsafe {
        let layout = util::buffer_layout::<Fragile>(4).unwrap();
        let src = allocate::<Fragile, _>(layout, &tracker).unwrap();
        construct_range(src, 0, 4);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fork(src, layout, &tracker)));
        assert!(result.is_err());

        // The two clones that succeeded were dropped along with the partial copy.
        assert_eq!(DROPS.load(SeqCst), 2);
        assert_eq!(tracker.stats().live_allocations, 1);

        release(src, &tracker);
    }

    assert_eq!(DROPS.load(SeqCst), 6);
    assert_eq!(tracker.stats().live_allocations, 0);
}
