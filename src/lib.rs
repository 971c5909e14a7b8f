//! Reference counted, copy-on-write growable buffers.
//!
//! A [`CowBuffer`] is a handle to a single allocation that stores a small header
//! (reference count and length) immediately followed by the items. Cloning a handle
//! only bumps the reference count. The first mutation through a handle that shares
//! its allocation with others copies the items into a fresh allocation ("fork") and
//! leaves the other handles untouched.
//!
//! ```
//! use cow_buffer::CowBuffer;
//!
//! let mut a: CowBuffer<u32> = CowBuffer::new();
//! a.resize(3).unwrap();
//! a.insert(1, 7).unwrap();
//!
//! let mut b = a.clone();
//! assert!(a.ptr_eq(&b));
//!
//! *b.get_mut(0) = 42;
//! assert_eq!(a.as_slice(), &[0, 7, 0, 0]);
//! assert_eq!(b.as_slice(), &[42, 7, 0, 0]);
//! ```

mod raw;
mod util;

pub mod allocator;
pub mod buffer;
pub mod element;
pub mod error;
pub mod refcount;

#[cfg(feature = "serialization")]
mod serialization;

pub use crate::buffer::CowBuffer;
pub use crate::element::Element;
pub use crate::error::{Error, ErrorKind};
pub use crate::raw::{BufferSize, MAX_LEN};
