use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use crate::error::{capacity_error, Error};
use crate::raw::Header;

#[track_caller]
#[inline(always)]
#[cfg(debug_assertions)]
pub unsafe fn assume(v: bool) {
    if !v {
        core::unreachable!()
    }
}

#[track_caller]
#[inline(always)]
#[cfg(not(debug_assertions))]
pub unsafe fn assume(v: bool) {
    if !v {
        unsafe {
            core::hint::unreachable_unchecked();
        }
    }
}

/// Distance in bytes between the start of the allocation and the first item.
pub(crate) const fn header_size<T>() -> usize {
    let align = mem::align_of::<T>();
    let size = mem::size_of::<Header>();

    ((size + align - 1) / align) * align
}

pub(crate) const fn buffer_align<T>() -> usize {
    let a = mem::align_of::<Header>();
    let b = mem::align_of::<T>();

    if a > b {
        a
    } else {
        b
    }
}

/// Number of bytes reserved for the items of a buffer of `len` items.
///
/// Rounded up to the next power of two so that small changes in length usually stay
/// within the same allocation.
pub(crate) fn payload_size_class<T>(len: usize) -> Result<usize, Error> {
    let bytes = mem::size_of::<T>()
        .checked_mul(len)
        .ok_or_else(capacity_error)?;

    if bytes == 0 {
        return Ok(0);
    }

    bytes.checked_next_power_of_two().ok_or_else(capacity_error)
}

pub(crate) fn buffer_layout<T>(len: usize) -> Result<Layout, Error> {
    let size = header_size::<T>()
        .checked_add(payload_size_class::<T>(len)?)
        .ok_or_else(capacity_error)?;

    Layout::from_size_align(size, buffer_align::<T>()).map_err(|_| capacity_error())
}

/// Layout of a buffer that is already allocated with `len` items.
///
/// # Safety
///
/// `buffer_layout::<T>(len)` must have succeeded before.
#[inline]
pub(crate) unsafe fn existing_layout<T>(len: usize) -> Layout {
    let layout = buffer_layout::<T>(len);
    assume(layout.is_ok());

    layout.unwrap_unchecked()
}

#[inline(always)]
pub(crate) unsafe fn header_ptr<T>(data: NonNull<T>) -> NonNull<Header> {
    nnptr::byte_sub(data, header_size::<T>()).cast::<Header>()
}

#[inline(always)]
pub(crate) unsafe fn data_ptr<T>(alloc: NonNull<u8>) -> NonNull<T> {
    nnptr::byte_add(alloc, header_size::<T>()).cast::<T>()
}

// Waiting for `non_null_convenience` to be available on our minimum rust version.
pub mod nnptr {
    use core::ptr::{self, NonNull};

    #[inline(always)]
    pub unsafe fn read<T>(src: NonNull<T>) -> T {
        ptr::read(src.as_ptr())
    }

    #[inline(always)]
    pub unsafe fn write<T>(dst: NonNull<T>, val: T) {
        ptr::write(dst.as_ptr(), val)
    }

    #[inline(always)]
    pub unsafe fn copy<T>(src: NonNull<T>, dst: NonNull<T>, count: usize) {
        ptr::copy(src.as_ptr(), dst.as_ptr(), count)
    }

    #[inline(always)]
    pub unsafe fn copy_nonoverlapping<T>(src: NonNull<T>, dst: NonNull<T>, count: usize) {
        ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), count)
    }

    #[inline(always)]
    pub unsafe fn add<T>(p: NonNull<T>, count: usize) -> NonNull<T> {
        NonNull::new_unchecked(p.as_ptr().add(count))
    }

    #[inline(always)]
    pub unsafe fn byte_add<T>(p: NonNull<T>, count: usize) -> NonNull<T> {
        let u8_ptr = p.as_ptr() as *mut u8;
        let offset_u8_ptr = u8_ptr.add(count) as *mut T;
        NonNull::new_unchecked(offset_u8_ptr)
    }

    #[inline(always)]
    pub unsafe fn byte_sub<T>(p: NonNull<T>, count: usize) -> NonNull<T> {
        let u8_ptr = p.as_ptr() as *mut u8;
        let offset_u8_ptr = u8_ptr.sub(count) as *mut T;
        NonNull::new_unchecked(offset_u8_ptr)
    }
}

#[test]
fn size_classes() {
    assert_eq!(payload_size_class::<u32>(0).unwrap(), 0);
    assert_eq!(payload_size_class::<u32>(1).unwrap(), 4);
    assert_eq!(payload_size_class::<u32>(3).unwrap(), 16);
    assert_eq!(payload_size_class::<u32>(4).unwrap(), 16);
    assert_eq!(payload_size_class::<u32>(5).unwrap(), 32);
    assert_eq!(payload_size_class::<[u8; 3]>(3).unwrap(), 16);
    assert_eq!(payload_size_class::<()>(1000).unwrap(), 0);
}

#[test]
fn size_class_overflow() {
    assert_eq!(payload_size_class::<u64>(usize::MAX / 4), Err(Error::CapacityOverflow));
    assert_eq!(payload_size_class::<u8>(usize::MAX), Err(Error::CapacityOverflow));
    assert_eq!(buffer_layout::<u8>(isize::MAX as usize), Err(Error::CapacityOverflow));
}

#[test]
fn buffer_layout_alignment() {
    type B = Box<u32>;
    let layout = buffer_layout::<B>(2).unwrap();
    assert_eq!(layout.align(), mem::align_of::<B>());
    assert_eq!(header_size::<B>() % mem::align_of::<B>(), 0);

    #[repr(align(32))]
    struct Aligned(#[allow(dead_code)] u8);
    assert_eq!(header_size::<Aligned>(), 32);
    assert_eq!(buffer_layout::<Aligned>(1).unwrap().align(), 32);

    assert_eq!(header_size::<u8>(), mem::size_of::<Header>());
    assert_eq!(buffer_layout::<u8>(5).unwrap().size(), mem::size_of::<Header>() + 8);
}
