use core::alloc::Layout;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};
use core::ptr::NonNull;

use crate::allocator::{Allocator, Global};
use crate::element::Element;
use crate::error::{handle_error, invalid_parameter, Error};
use crate::raw::{self, MAX_LEN};
use crate::util::{self, nnptr};

/// A reference counted, copy-on-write growable buffer containing items of type `T`.
///
/// Similar in principle to `Arc<[T]>` with `Vec`-like mutable methods. An empty buffer
/// holds no allocation. A non-empty one points at a single allocation holding the
/// reference count, the length and the items.
///
/// # Copy-on-write
///
/// `Clone` does not copy the items, it adds a reference to the same allocation. Methods
/// that modify the buffer first call [`ensure_exclusive`](CowBuffer::ensure_exclusive),
/// which copies the items into a new allocation if other handles still refer to the
/// current one. Reading through a shared handle is therefore always safe, including
/// from other threads, and a modification through one handle is never visible through
/// another.
///
/// # Capacity
///
/// There is no explicit capacity. Allocations are sized for the current length rounded
/// up to a power of two bytes, and they are resized whenever the length crosses into a
/// different size class. Resizing to zero items frees the allocation.
pub struct CowBuffer<T, A: Allocator = Global> {
    ptr: Option<NonNull<T>>,
    allocator: A,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync, A: Allocator + Send> Send for CowBuffer<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Sync> Sync for CowBuffer<T, A> {}

impl<T> CowBuffer<T, Global> {
    /// Creates an empty buffer without allocating memory.
    #[inline]
    pub const fn new() -> Self {
        Self::new_in(Global)
    }

    /// Clones the contents of a slice into a new buffer.
    ///
    /// # Panics
    ///
    /// Panics if the slice is longer than [`MAX_LEN`] and aborts if the allocation fails.
    pub fn from_slice(items: &[T]) -> Self
    where
        T: Element,
    {
        Self::from_slice_in(items, Global).unwrap_or_else(|err| handle_error(err))
    }
}

impl<T, A: Allocator> CowBuffer<T, A> {
    /// Creates an empty buffer that will allocate from `allocator`.
    #[inline]
    pub const fn new_in(allocator: A) -> Self {
        CowBuffer {
            ptr: None,
            allocator,
            _marker: PhantomData,
        }
    }

    /// Returns the number of items in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        match self.ptr {
            Some(data) => unsafe { raw::len(data) },
            None => 0,
        }
    }

    /// Returns `true` if the buffer contains no items.
    ///
    /// An empty buffer never holds an allocation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        match self.ptr {
            Some(data) => unsafe { core::slice::from_raw_parts(data.as_ptr(), raw::len(data)) },
            None => &[],
        }
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Returns a reference to the item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[inline]
    #[track_caller]
    pub fn get(&self, index: usize) -> &T {
        let len = self.len();
        if index >= len {
            index_out_of_bounds(index, len);
        }

        unsafe { nnptr::add(self.data(), index).as_ref() }
    }

    #[inline]
    pub fn first(&self) -> Option<&T> {
        self.as_slice().first()
    }

    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.as_slice().last()
    }

    /// Returns the index of the first item equal to `value`, starting the search at
    /// index `from`.
    pub fn find(&self, value: &T, from: usize) -> Option<usize>
    where
        T: PartialEq,
    {
        let items = self.as_slice();
        if from >= items.len() {
            return None;
        }

        items[from..]
            .iter()
            .position(|item| item == value)
            .map(|idx| idx + from)
    }

    #[inline]
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.find(value, 0).is_some()
    }

    /// Returns the number of handles sharing this buffer's allocation, or zero if the
    /// buffer is empty.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        match self.ptr {
            Some(data) => unsafe { raw::header(data).ref_count.get() },
            None => 0,
        }
    }

    /// Returns true if this is the only handle to its allocation.
    ///
    /// Empty buffers are considered unique.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.ref_count() <= 1
    }

    /// Returns true if the two buffers share the same allocation (or are both empty).
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Creates a new handle to the same allocation without copying the items.
    ///
    /// Equivalent to `Clone::clone`.
    pub fn share(&self) -> Self
    where
        A: Clone,
    {
        // The count can only be zero here if the allocation is being destroyed by
        // another thread, in which case we end up empty rather than reviving it.
        let ptr = self
            .ptr
            .filter(|data| unsafe { raw::header(*data).ref_count.conditional_increment() } > 0);

        CowBuffer {
            ptr,
            allocator: self.allocator.clone(),
            _marker: PhantomData,
        }
    }

    /// Makes this handle refer to the same allocation as `other`, releasing its
    /// previous allocation.
    ///
    /// Does nothing if both handles already share the same allocation.
    pub fn share_from(&mut self, other: &Self)
    where
        A: Clone,
    {
        if self.ptr == other.ptr {
            return;
        }

        *self = other.share();
    }

    /// Removes all items, releasing this handle's reference to its allocation.
    pub fn clear(&mut self) {
        if let Some(data) = self.ptr.take() {
            unsafe {
                raw::release::<T, A>(data, &self.allocator);
            }
        }
    }

    #[inline(always)]
    fn data(&self) -> NonNull<T> {
        unsafe { util::assume(self.ptr.is_some()) };
        match self.ptr {
            Some(data) => data,
            None => NonNull::dangling(),
        }
    }
}

impl<T: Element, A: Allocator> CowBuffer<T, A> {
    /// Clones the contents of a slice into a new buffer allocated from `allocator`.
    pub fn from_slice_in(items: &[T], allocator: A) -> Result<Self, Error> {
        let mut buffer = Self::new_in(allocator);
        if items.is_empty() {
            return Ok(buffer);
        }

        if items.len() > MAX_LEN {
            return Err(invalid_parameter("length", items.len(), MAX_LEN));
        }

        let data = buffer.grow_storage(items.len())?;
        let fit = FitStorage {
            buffer: &mut buffer,
            allocated_len: items.len(),
        };
        unsafe {
            raw::extend_from_slice(data, items);
        }
        drop(fit);

        Ok(buffer)
    }

    /// Makes sure this handle is the only one referring to its allocation, copying the
    /// items into a new allocation if needed.
    ///
    /// Returns the reference count observed before copying (zero for an empty buffer).
    /// A value above one means the items were copied. On failure nothing is modified.
    pub fn ensure_exclusive(&mut self) -> Result<u32, Error> {
        let Some(data) = self.ptr else {
            return Ok(0);
        };

        let ref_count = unsafe { raw::header(data).ref_count.get() };
        if ref_count > 1 {
            unsafe {
                let layout = util::existing_layout::<T>(raw::len(data));
                self.fork_into(data, ref_count, layout)?;
            }
        }

        Ok(ref_count)
    }

    /// Replaces the shared allocation with an exclusive copy allocated with `layout`.
    ///
    /// The shared reference is only released once the copy exists, so on failure the
    /// handle still refers to `data`.
    ///
    /// # Safety
    ///
    /// `data` must be this handle's allocation and `layout` must have room for its items.
    unsafe fn fork_into(
        &mut self,
        data: NonNull<T>,
        ref_count: u32,
        layout: Layout,
    ) -> Result<NonNull<T>, Error> {
        let copy = raw::fork::<T, A>(data, layout, &self.allocator)?;
        log::trace!(
            "forked buffer of {} items shared by {ref_count} handles ({} bytes)",
            raw::len(copy),
            layout.size(),
        );

        raw::release::<T, A>(data, &self.allocator);
        self.ptr = Some(copy);

        Ok(copy)
    }

    /// Resizes the buffer to `new_len` items.
    ///
    /// New items are default-constructed. Removed items are dropped. Resizing to zero
    /// releases the allocation.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `new_len` is greater than [`MAX_LEN`].
    /// - [`Error::CapacityOverflow`] or [`Error::AllocFailed`] if memory can't be
    ///   provided for `new_len` items.
    ///
    /// The buffer's contents are unchanged when an error is returned.
    pub fn resize(&mut self, new_len: usize) -> Result<(), Error> {
        if new_len > MAX_LEN {
            return Err(invalid_parameter("length", new_len, MAX_LEN));
        }

        let len = self.len();
        if new_len == len {
            return Ok(());
        }

        if new_len == 0 {
            self.clear();
            return Ok(());
        }

        if new_len > len {
            let data = self.grow_storage(new_len)?;
            // If a default constructor panics, the items built so far are kept.
            let fit = FitStorage {
                buffer: self,
                allocated_len: new_len,
            };
            unsafe {
                raw::construct_range(data, len, new_len);
            }
            drop(fit);
        } else {
            self.ensure_exclusive()?;
            let data = self.data();
            unsafe {
                raw::set_len(data, new_len);
            }
            // Shrink the allocation even if a destructor panics.
            let _fit = FitStorage {
                buffer: self,
                allocated_len: len,
            };
            unsafe {
                raw::drop_range(data, new_len, len);
            }
        }

        Ok(())
    }

    /// Returns a mutable reference to the item at `index`, copying the items first if
    /// the allocation is shared.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[track_caller]
    pub fn get_mut(&mut self, index: usize) -> &mut T {
        let len = self.len();
        if index >= len {
            index_out_of_bounds(index, len);
        }

        unsafe { nnptr::add(self.exclusive_data(), index).as_mut() }
    }

    /// Replaces the item at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[track_caller]
    pub fn set(&mut self, index: usize, value: T) {
        *self.get_mut(index) = value;
    }

    /// Returns the items as a mutable slice, copying them first if the allocation is
    /// shared.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.ptr.is_none() {
            return &mut [];
        }

        let data = self.exclusive_data();
        unsafe { core::slice::from_raw_parts_mut(data.as_ptr(), raw::len(data)) }
    }

    /// Inserts an item at position `index`, shifting all items after it to the right.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `index > len`.
    /// - [`Error::CapacityOverflow`] or [`Error::AllocFailed`] if memory can't be
    ///   provided for the extra item.
    pub fn insert(&mut self, index: usize, value: T) -> Result<(), Error> {
        let len = self.len();
        if index > len {
            return Err(invalid_parameter("position", index, len));
        }

        if len == MAX_LEN {
            return Err(invalid_parameter("length", len + 1, MAX_LEN));
        }

        let data = self.grow_storage(len + 1)?;
        unsafe {
            let p = nnptr::add(data, index);
            // Shift everything over to make space. (Duplicating the `index`th item
            // into two consecutive places.)
            nnptr::copy(p, nnptr::add(p, 1), len - index);
            // Write it in, overwriting the first copy of the `index`th item.
            nnptr::write(p, value);
            raw::set_len(data, len + 1);
        }

        Ok(())
    }

    /// Appends an item to the back of the buffer.
    pub fn push(&mut self, value: T) -> Result<(), Error> {
        self.insert(self.len(), value)
    }

    /// Removes and returns the item at position `index`, shifting all items after it
    /// to the left.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[track_caller]
    pub fn remove(&mut self, index: usize) -> T {
        let len = self.len();
        if index >= len {
            index_out_of_bounds(index, len);
        }

        let data = self.exclusive_data();
        let item = unsafe {
            let p = nnptr::add(data, index);
            let item = nnptr::read(p);
            nnptr::copy(nnptr::add(p, 1), p, len - index - 1);
            raw::set_len(data, len - 1);

            item
        };

        self.fit_storage(len);

        item
    }

    /// Removes the last item and returns it, or `None` if the buffer is empty.
    pub fn pop(&mut self) -> Option<T> {
        match self.len() {
            0 => None,
            len => Some(self.remove(len - 1)),
        }
    }

    #[track_caller]
    fn exclusive_data(&mut self) -> NonNull<T> {
        if let Err(err) = self.ensure_exclusive() {
            handle_error(err);
        }

        self.data()
    }

    /// Makes the buffer exclusive with room for `new_len` items.
    ///
    /// Neither the length nor the items are modified. On failure the handle is left as
    /// it was, still sharing its allocation if it did.
    fn grow_storage(&mut self, new_len: usize) -> Result<NonNull<T>, Error> {
        let len = self.len();
        debug_assert!(new_len > len);

        // Check the size before doing anything.
        let new_layout = util::buffer_layout::<T>(new_len)?;

        let data = match self.ptr {
            None => raw::allocate::<T, A>(new_layout, &self.allocator)?,
            Some(data) => unsafe {
                let ref_count = raw::header(data).ref_count.get();
                if ref_count > 1 {
                    // Copy straight into the larger allocation.
                    self.fork_into(data, ref_count, new_layout)?
                } else {
                    let old_layout = util::existing_layout::<T>(len);
                    raw::reallocate(data, old_layout, new_layout, &self.allocator)?
                }
            },
        };

        debug_assert_eq!(unsafe { raw::header(data).ref_count.get() }, 1);
        self.ptr = Some(data);

        Ok(data)
    }

    /// Reallocates to match the length in the header, given the length the current
    /// allocation was sized for.
    fn fit_storage(&mut self, allocated_len: usize) {
        let Some(data) = self.ptr else {
            return;
        };

        unsafe {
            let len = raw::len(data);
            if len == allocated_len {
                return;
            }

            let old_layout = util::existing_layout::<T>(allocated_len);
            if len == 0 {
                raw::deallocate(data, old_layout, &self.allocator);
                self.ptr = None;
                return;
            }

            let new_layout = util::existing_layout::<T>(len);
            match raw::reallocate(data, old_layout, new_layout, &self.allocator) {
                Ok(data) => self.ptr = Some(data),
                Err(err) => handle_error(err),
            }
        }
    }
}

/// Brings the allocation back in line with the length stored in the header when
/// dropped, including during unwinding.
///
/// `allocated_len` is the length the allocation is currently sized for. The buffer
/// must be exclusive.
struct FitStorage<'l, T: Element, A: Allocator> {
    buffer: &'l mut CowBuffer<T, A>,
    allocated_len: usize,
}

impl<'l, T: Element, A: Allocator> Drop for FitStorage<'l, T, A> {
    fn drop(&mut self) {
        self.buffer.fit_storage(self.allocated_len);
    }
}

#[cold]
#[inline(never)]
#[track_caller]
fn index_out_of_bounds(index: usize, len: usize) -> ! {
    panic!("index out of bounds: the len is {len} but the index is {index}");
}

impl<T, A: Allocator> Drop for CowBuffer<T, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T, A: Allocator + Clone> Clone for CowBuffer<T, A> {
    fn clone(&self) -> Self {
        self.share()
    }

    fn clone_from(&mut self, source: &Self) {
        self.share_from(source);
    }
}

impl<T, A: Allocator + Default> Default for CowBuffer<T, A> {
    fn default() -> Self {
        Self::new_in(A::default())
    }
}

impl<T: fmt::Debug, A: Allocator> fmt::Debug for CowBuffer<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: PartialEq<T>, A: Allocator> PartialEq<CowBuffer<T, A>> for CowBuffer<T, A> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.as_slice() == other.as_slice()
    }
}

impl<T: Eq, A: Allocator> Eq for CowBuffer<T, A> {}

impl<T: PartialEq<T>, A: Allocator> PartialEq<[T]> for CowBuffer<T, A> {
    fn eq(&self, other: &[T]) -> bool {
        self.as_slice() == other
    }
}

impl<T: PartialEq<T>, A: Allocator> PartialEq<&[T]> for CowBuffer<T, A> {
    fn eq(&self, other: &&[T]) -> bool {
        self.as_slice() == *other
    }
}

impl<T: Hash, A: Allocator> Hash for CowBuffer<T, A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state)
    }
}

impl<T, A: Allocator> AsRef<[T]> for CowBuffer<T, A> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<'a, T, A: Allocator> IntoIterator for &'a CowBuffer<T, A> {
    type Item = &'a T;
    type IntoIter = core::slice::Iter<'a, T>;
    fn into_iter(self) -> core::slice::Iter<'a, T> {
        self.as_slice().iter()
    }
}

impl<T, A, I> Index<I> for CowBuffer<T, A>
where
    A: Allocator,
    I: core::slice::SliceIndex<[T]>,
{
    type Output = <I as core::slice::SliceIndex<[T]>>::Output;
    fn index(&self, index: I) -> &Self::Output {
        self.as_slice().index(index)
    }
}

impl<T, A, I> IndexMut<I> for CowBuffer<T, A>
where
    T: Element,
    A: Allocator,
    I: core::slice::SliceIndex<[T]>,
{
    fn index_mut(&mut self, index: I) -> &mut Self::Output {
        self.as_mut_slice().index_mut(index)
    }
}

impl<T: Element, A: Allocator> Extend<T> for CowBuffer<T, A> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            if let Err(err) = self.push(item) {
                handle_error(err);
            }
        }
    }
}

impl<T: Element, A: Allocator + Default> FromIterator<T> for CowBuffer<T, A> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut buffer = CowBuffer::new_in(A::default());
        buffer.extend(iter);

        buffer
    }
}

impl<T: Element, A: Allocator + Default> From<&[T]> for CowBuffer<T, A> {
    fn from(items: &[T]) -> Self {
        Self::from_slice_in(items, A::default()).unwrap_or_else(|err| handle_error(err))
    }
}

impl<T: Element, A: Allocator + Default> From<Vec<T>> for CowBuffer<T, A> {
    fn from(items: Vec<T>) -> Self {
        Self::from(&items[..])
    }
}

#[cfg(test)]
use crate::allocator::TrackingAllocator;

#[test]
fn resize_insert_share_mutate() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut h: CowBuffer<String> = CowBuffer::new();
    assert!(h.is_empty());
    assert_eq!(h.ref_count(), 0);

    h.resize(3).unwrap();
    assert_eq!(h.len(), 3);
    assert!(h.iter().all(String::is_empty));

    h.insert(1, "x".to_string()).unwrap();
    assert_eq!(h.as_slice(), &["", "x", "", ""]);

    let mut h2 = h.share();
    assert!(h.ptr_eq(&h2));
    assert_eq!(h.ref_count(), 2);

    *h2.get_mut(0) = "y".to_string();
    assert!(!h.ptr_eq(&h2));
    assert_eq!(h.get(0), "");
    assert_eq!(h2.as_slice(), &["y", "x", "", ""]);
    assert_eq!(h.ref_count(), 1);
    assert_eq!(h2.ref_count(), 1);

    h.resize(0).unwrap();
    assert!(h.is_empty());
    assert_eq!(h2.len(), 4);
    assert_eq!(h2[1], "x");
}

#[test]
fn invalid_length() {
    let mut h: CowBuffer<u32> = CowBuffer::from_slice(&[1, 2, 3]);
    let other = h.clone();

    assert_eq!(
        h.resize(usize::MAX),
        Err(Error::InvalidParameter {
            name: "length",
            value: usize::MAX,
            max: MAX_LEN,
        })
    );
    assert_eq!(h.as_slice(), &[1, 2, 3]);
    assert!(h.ptr_eq(&other));

    assert_eq!(
        h.insert(4, 0),
        Err(Error::InvalidParameter {
            name: "position",
            value: 4,
            max: 3,
        })
    );
    assert_eq!(h.len(), 3);
}

#[test]
fn failed_growth_leaves_buffer_unchanged() {
    let tracker = TrackingAllocator::new();
    let mut a = CowBuffer::from_slice_in(&[1u32, 2, 3], &tracker).unwrap();
    let mut b = a.clone();

    tracker.set_limit(Some(tracker.stats().bytes_in_use));

    // Shared: the fork is refused.
    let err = b.resize(100).unwrap_err();
    assert!(err.is_out_of_memory());
    assert!(b.ptr_eq(&a));
    assert!(b.insert(0, 9).unwrap_err().is_out_of_memory());
    assert_eq!(b.as_slice(), &[1, 2, 3]);

    // Exclusive: the reallocation is refused.
    drop(b);
    let err = a.resize(100).unwrap_err();
    assert!(matches!(err, Error::AllocFailed { .. }));
    assert_eq!(a.as_slice(), &[1, 2, 3]);

    // Growing within the same size class does not allocate.
    a.push(4).unwrap();
    assert_eq!(a.as_slice(), &[1, 2, 3, 4]);

    tracker.set_limit(None);
    a.resize(100).unwrap();
    assert_eq!(a.len(), 100);
    assert_eq!(tracker.stats().failed_allocations, 3);
}

#[test]
fn shared_growth_copies_into_the_new_size_class() {
    let tracker = TrackingAllocator::new();
    let a = CowBuffer::from_slice_in(&[1u32, 2, 3], &tracker).unwrap();
    let mut b = a.clone();
    let in_use = tracker.stats().bytes_in_use;

    // Room for a copy of the current size, but not for the grown one.
    tracker.set_limit(Some(in_use * 2 + 8));
    let err = b.resize(100).unwrap_err();
    assert!(matches!(err, Error::AllocFailed { .. }));
    assert!(b.ptr_eq(&a));
    assert_eq!(a.ref_count(), 2);
    assert_eq!(tracker.stats().live_allocations, 1);
    assert_eq!(tracker.stats().bytes_in_use, in_use);
    assert_eq!(b.as_slice(), &[1, 2, 3]);

    // Forking allocates the final size directly, without reallocating afterwards.
    b.push(4).unwrap();
    assert_eq!(a.ref_count(), 1);
    assert_eq!(tracker.stats().total_allocations, 2);

    tracker.set_limit(None);
    let mut c = a.clone();
    c.resize(100).unwrap();
    assert_eq!(c[..3], [1, 2, 3]);
    assert_eq!(c[99], 0);
    assert_eq!(a.as_slice(), &[1, 2, 3]);
    assert_eq!(a.ref_count(), 1);

    let stats = tracker.stats();
    assert_eq!(stats.reallocations, 0);
    assert_eq!(stats.total_allocations, 3);
    assert_eq!(
        stats.bytes_in_use,
        2 * in_use + util::buffer_layout::<u32>(100).unwrap().size()
    );
}

#[test]
fn constructors_with_default_allocator() {
    let v: CowBuffer<u32, TrackingAllocator> = (0..10).collect();
    assert_eq!(v.len(), 10);
    assert_eq!(v.allocator().stats().live_allocations, 1);

    let w: CowBuffer<u32, TrackingAllocator> = CowBuffer::from(&[1, 2, 3][..]);
    assert_eq!(w.as_slice(), &[1, 2, 3]);
    assert_eq!(w.allocator().stats().total_allocations, 1);

    let x: CowBuffer<String, TrackingAllocator> = vec!["a".to_string()].into();
    assert_eq!(x[0], "a");
    assert_eq!(x.allocator().stats().live_allocations, 1);
}

#[test]
fn shrink_to_zero_frees() {
    let tracker = TrackingAllocator::new();
    let mut a: CowBuffer<u64, _> = CowBuffer::new_in(&tracker);
    a.resize(10).unwrap();
    assert_eq!(tracker.stats().live_allocations, 1);

    a.resize(0).unwrap();
    assert!(a.is_empty());
    assert_eq!(tracker.stats().live_allocations, 0);
    assert_eq!(tracker.stats().bytes_in_use, 0);

    let b = a.share();
    assert!(b.is_empty());
    assert_eq!(b.ref_count(), 0);

    let mut c = CowBuffer::from_slice_in(&[1u64], &tracker).unwrap();
    assert_eq!(c.remove(0), 1);
    assert!(c.is_empty());
    assert_eq!(c.pop(), None);
    assert_eq!(tracker.stats().live_allocations, 0);
}

#[test]
fn allocation_follows_size_class() {
    let tracker = TrackingAllocator::new();
    let mut v: CowBuffer<u32, _> = CowBuffer::new_in(&tracker);

    v.resize(5).unwrap();
    let class = |len| util::buffer_layout::<u32>(len).unwrap().size();
    assert_eq!(tracker.stats().bytes_in_use, class(5));

    // 5 to 8 items stay within 32 bytes of payload.
    v.resize(8).unwrap();
    assert_eq!(tracker.stats().reallocations, 0);

    v.push(9).unwrap();
    assert_eq!(tracker.stats().reallocations, 1);
    assert_eq!(tracker.stats().bytes_in_use, class(9));

    v.remove(0);
    assert_eq!(tracker.stats().reallocations, 2);
    assert_eq!(tracker.stats().bytes_in_use, class(8));

    v.resize(2).unwrap();
    assert_eq!(tracker.stats().bytes_in_use, class(2));
    assert_eq!(tracker.stats().live_allocations, 1);
    assert_eq!(tracker.stats().total_allocations, 1);
}

#[test]
fn insert_remove_find() {
    let mut v: CowBuffer<u32> = CowBuffer::new();
    for i in 0..10 {
        v.push(i % 4).unwrap();
    }
    v.insert(0, 7).unwrap();
    v.insert(11, 7).unwrap();
    assert_eq!(v.as_slice(), &[7, 0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 7]);

    assert_eq!(v.find(&7, 0), Some(0));
    assert_eq!(v.find(&7, 1), Some(11));
    assert_eq!(v.find(&2, 4), Some(7));
    assert_eq!(v.find(&5, 0), None);
    assert_eq!(v.find(&0, 12), None);
    assert_eq!(v.find(&0, usize::MAX), None);
    assert!(v.contains(&3));

    assert_eq!(v.remove(11), 7);
    assert_eq!(v.remove(0), 7);
    assert_eq!(v.pop(), Some(1));
    assert_eq!(v.as_slice(), &[0, 1, 2, 3, 0, 1, 2, 3, 0]);
    assert_eq!(v.first(), Some(&0));
    assert_eq!(v.last(), Some(&0));

    v.set(8, 42);
    v[0] = 10;
    assert_eq!(v[..2], [10, 1]);
    assert_eq!(v[8], 42);
}

#[test]
#[should_panic(expected = "index out of bounds")]
fn get_out_of_bounds() {
    let v: CowBuffer<u32> = CowBuffer::from_slice(&[1, 2]);
    v.get(2);
}

#[test]
#[should_panic(expected = "index out of bounds")]
fn remove_out_of_bounds() {
    let mut v: CowBuffer<u32> = CowBuffer::new();
    v.remove(0);
}

#[test]
fn shared_handle_equality() {
    let a: CowBuffer<u32> = CowBuffer::from_slice(&[1, 2, 3]);
    let mut b = CowBuffer::from_slice(&[1, 2, 3]);
    assert_eq!(a, b);
    assert!(!a.ptr_eq(&b));

    b.clone_from(&a);
    assert!(a.ptr_eq(&b));
    assert_eq!(a.ref_count(), 2);

    b.share_from(&a);
    assert_eq!(a.ref_count(), 2);

    // Assigning from a handle to the same allocation keeps the reference as is.
    let alias = b.share();
    assert_eq!(b.ref_count(), 3);
    b.share_from(&alias);
    assert!(b.ptr_eq(&a));
    assert_eq!(b.ref_count(), 3);
    b.clone_from(&alias);
    assert_eq!(b.ref_count(), 3);
    drop(alias);

    let tracker = TrackingAllocator::new();
    let mut t = CowBuffer::from_slice_in(&[1u8], &tracker).unwrap();
    let t2 = t.share();
    let before = tracker.stats();
    t.share_from(&t2);
    t.clone_from(&t2);
    assert_eq!(tracker.stats(), before);
    assert_eq!(t.ref_count(), 2);

    assert_eq!(b.ensure_exclusive(), Ok(2));
    assert_eq!(b.ensure_exclusive(), Ok(1));
    assert_eq!(CowBuffer::<u32>::new().ensure_exclusive(), Ok(0));
    assert_eq!(a, b);
    assert_eq!(format!("{b:?}"), "[1, 2, 3]");
}

#[test]
fn zero_sized_items() {
    let mut v: CowBuffer<()> = CowBuffer::new();
    v.resize(1000).unwrap();
    assert_eq!(v.len(), 1000);
    let w = v.clone();
    v.push(()).unwrap();
    assert_eq!(v.len(), 1001);
    assert_eq!(w.len(), 1000);
}

#[test]
fn drop_items() {
    use std::sync::atomic::{AtomicI32, Ordering::SeqCst};
    static DROPS: AtomicI32 = AtomicI32::new(0);

    #[derive(Clone, Default)]
    struct Counted(#[allow(dead_code)] u32);
    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.fetch_add(1, SeqCst);
        }
    }
    unsafe impl Element for Counted {}

    let mut a: CowBuffer<Counted> = CowBuffer::new();
    a.resize(4).unwrap();
    let b = a.clone();
    assert_eq!(DROPS.load(SeqCst), 0);

    a.set(0, Counted(1));
    assert_eq!(DROPS.load(SeqCst), 1);

    drop(b);
    assert_eq!(DROPS.load(SeqCst), 5);

    a.resize(2).unwrap();
    assert_eq!(DROPS.load(SeqCst), 7);

    let _ = a.remove(0);
    assert_eq!(DROPS.load(SeqCst), 8);

    drop(a);
    assert_eq!(DROPS.load(SeqCst), 9);
}

#[test]
fn panicking_default_keeps_constructed_items() {
    use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
    static DEFAULTS: AtomicU32 = AtomicU32::new(0);

    #[derive(Clone, Debug, PartialEq)]
    struct Picky(u32);
    impl Default for Picky {
        fn default() -> Self {
            let n = DEFAULTS.fetch_add(1, SeqCst);
            if n == 2 {
                panic!("no more defaults");
            }
            Picky(100 + n)
        }
    }
    unsafe impl Element for Picky {}

    let tracker = TrackingAllocator::new();
    let mut v = CowBuffer::from_slice_in(&[Picky(1), Picky(2)], &tracker).unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| v.resize(10)));
    assert!(result.is_err());

    assert_eq!(v.as_slice(), &[Picky(1), Picky(2), Picky(100), Picky(101)]);
    assert_eq!(
        tracker.stats().bytes_in_use,
        util::buffer_layout::<Picky>(4).unwrap().size()
    );

    drop(v);
    assert_eq!(tracker.stats().live_allocations, 0);
}

#[test]
fn nested_buffers() {
    let inner: CowBuffer<u32> = CowBuffer::from_slice(&[1, 2, 3]);
    let mut outer: CowBuffer<CowBuffer<u32>> = CowBuffer::new();
    outer.push(inner.clone()).unwrap();
    outer.push(inner.clone()).unwrap();
    assert_eq!(inner.ref_count(), 3);

    let copy = outer.clone();
    outer.get_mut(1).push(4).unwrap();
    assert_eq!(inner.ref_count(), 4);
    assert_eq!(copy[1], [1, 2, 3][..]);
    assert_eq!(outer[1], [1, 2, 3, 4][..]);

    drop(copy);
    assert_eq!(inner.ref_count(), 2);
}

#[test]
fn share_across_threads() {
    let base: CowBuffer<u32> = (0..100).collect();

    std::thread::scope(|s| {
        for t in 0..8u32 {
            let shared = base.clone();
            s.spawn(move || {
                let mut local = shared.clone();
                for i in 0..100 {
                    assert_eq!(*shared.get(i), i as u32);
                }

                *local.get_mut(t as usize) = 1000 + t;
                assert_eq!(*local.get(t as usize), 1000 + t);
                assert_eq!(*shared.get(t as usize), t);
            });
        }

        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..1000 {
                    let handle = base.share();
                    assert_eq!(handle.len(), 100);
                }
            });
        }
    });

    assert_eq!(base.ref_count(), 1);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sharing_is_transparent(items in vec(any::<u32>(), 0..64)) {
            let a = CowBuffer::from_slice(&items);
            let b = a.share();
            prop_assert!(a.ptr_eq(&b));
            prop_assert_eq!(a.as_slice(), b.as_slice());
            prop_assert_eq!(b.as_slice(), &items[..]);
        }

        #[test]
        fn mutation_is_isolated(
            items in vec(".{0,8}", 1..32),
            idx in any::<prop::sample::Index>(),
            value in ".{0,8}",
        ) {
            let a: CowBuffer<String> = CowBuffer::from_slice(&items);
            let mut b = a.clone();
            let i = idx.index(items.len());

            *b.get_mut(i) = value.clone();
            prop_assert_eq!(a.as_slice(), &items[..]);
            prop_assert_eq!(b.get(i), &value);
            prop_assert!(a.is_unique());
            prop_assert!(b.is_unique());
        }

        #[test]
        fn insert_then_remove_restores(
            items in vec(".{0,8}", 0..32),
            idx in any::<prop::sample::Index>(),
        ) {
            let mut v: CowBuffer<String> = CowBuffer::from_slice(&items);
            let snapshot = v.clone();
            let pos = idx.index(items.len() + 1);

            v.insert(pos, "inserted".to_string()).unwrap();
            prop_assert_eq!(v.len(), items.len() + 1);
            prop_assert_eq!(v.get(pos), "inserted");

            prop_assert_eq!(v.remove(pos), "inserted");
            prop_assert_eq!(v.as_slice(), &items[..]);
            prop_assert_eq!(snapshot.as_slice(), &items[..]);
        }

        #[test]
        fn find_returns_first_match(
            items in vec(0u8..4, 0..64),
            value in 0u8..4,
            from in 0usize..70,
        ) {
            let v = CowBuffer::from_slice(&items);
            let expected = items
                .iter()
                .enumerate()
                .skip(from)
                .find(|(_, item)| **item == value)
                .map(|(idx, _)| idx);

            prop_assert_eq!(v.find(&value, from), expected);
        }

        #[test]
        fn resize_to_same_length_does_not_allocate(items in vec(any::<u64>(), 0..64)) {
            let tracker = TrackingAllocator::new();
            let mut v = CowBuffer::from_slice_in(&items, &tracker).unwrap();
            let other = v.clone();
            let before = tracker.stats();

            v.resize(items.len()).unwrap();
            prop_assert_eq!(tracker.stats(), before);
            prop_assert!(v.ptr_eq(&other));
        }

        #[test]
        fn resize_matches_vec(lengths in vec(0usize..200, 1..16)) {
            let tracker = TrackingAllocator::new();
            let mut v: CowBuffer<u16, _> = CowBuffer::new_in(&tracker);
            let mut model: Vec<u16> = Vec::new();
            let mut snapshots = Vec::new();

            for (i, len) in lengths.into_iter().enumerate() {
                snapshots.push((v.clone(), model.clone()));
                v.resize(len).unwrap();
                model.resize(len, 0);
                if len > 0 {
                    v.set(len - 1, i as u16);
                    model[len - 1] = i as u16;
                }
                prop_assert_eq!(v.as_slice(), &model[..]);
            }

            for (snapshot, expected) in &snapshots {
                prop_assert_eq!(snapshot.as_slice(), &expected[..]);
            }

            drop(snapshots);
            drop(v);
            prop_assert_eq!(tracker.stats().live_allocations, 0);
        }
    }
}
