//! Capabilities of the items stored in a [`CowBuffer`](crate::CowBuffer).

use crate::allocator::Allocator;
use crate::CowBuffer;

/// Types that can be stored in a mutable [`CowBuffer`](crate::CowBuffer).
///
/// Forking a shared buffer clones its items and growing it default-constructs the new
/// ones. The two associated constants let cheap types skip the per-item work. They are
/// resolved at compile time, so the unused path is removed entirely.
///
/// Whether items need to be dropped is taken from [`core::mem::needs_drop`].
///
/// # Safety
///
/// - `TRIVIALLY_COPYABLE` may only be `true` if a bitwise copy of a value is equivalent
///   to cloning it (in practice: the type is `Copy`).
/// - `ZEROED_DEFAULT` may only be `true` if a value made of zero bytes is valid and
///   equal to `Default::default()`.
///
/// Leaving both constants to their default value of `false` is always sound.
pub unsafe trait Element: Clone + Default {
    const TRIVIALLY_COPYABLE: bool = false;
    const ZEROED_DEFAULT: bool = false;
}

/// Implements [`Element`] for `Copy` types.
///
/// ```
/// use cow_buffer::{trivial_element, CowBuffer};
///
/// #[derive(Copy, Clone, Default, Debug, PartialEq)]
/// struct Vertex { x: f32, y: f32 }
///
/// // Clones are bitwise copies and the default value is all zeroes.
/// trivial_element!(Vertex, zeroed);
///
/// let mut v: CowBuffer<Vertex> = CowBuffer::new();
/// v.resize(4).unwrap();
/// assert_eq!(v[3], Vertex::default());
/// ```
#[macro_export]
macro_rules! trivial_element {
    (@impl $ty:ty, $zeroed:expr) => {
        const _: () = {
            fn assert_copy<T: Copy>() {}
            #[allow(dead_code)]
            fn check() {
                assert_copy::<$ty>();
            }
        };

        unsafe impl $crate::Element for $ty {
            const TRIVIALLY_COPYABLE: bool = true;
            const ZEROED_DEFAULT: bool = $zeroed;
        }
    };
    ($ty:ty, zeroed) => {
        $crate::trivial_element!(@impl $ty, true);
    };
    ($ty:ty) => {
        $crate::trivial_element!(@impl $ty, false);
    };
}

trivial_element!(u8, zeroed);
trivial_element!(u16, zeroed);
trivial_element!(u32, zeroed);
trivial_element!(u64, zeroed);
trivial_element!(u128, zeroed);
trivial_element!(usize, zeroed);
trivial_element!(i8, zeroed);
trivial_element!(i16, zeroed);
trivial_element!(i32, zeroed);
trivial_element!(i64, zeroed);
trivial_element!(i128, zeroed);
trivial_element!(isize, zeroed);
trivial_element!(f32, zeroed);
trivial_element!(f64, zeroed);
trivial_element!(bool, zeroed);
trivial_element!(char, zeroed);
trivial_element!((), zeroed);

unsafe impl Element for String {}
unsafe impl<T: Clone> Element for Vec<T> {}
unsafe impl<T: Clone> Element for Option<T> {}
unsafe impl<T: Clone + Default> Element for Box<T> {}
unsafe impl<T, A: Allocator + Clone + Default> Element for CowBuffer<T, A> {}

#[test]
fn zeroed_defaults_are_zero() {
    fn check<T: Element + PartialEq + core::fmt::Debug>() {
        assert!(T::ZEROED_DEFAULT);
        let zeroed: T = unsafe { core::mem::zeroed() };
        assert_eq!(zeroed, T::default());
    }

    check::<u8>();
    check::<i64>();
    check::<f32>();
    check::<bool>();
    check::<char>();
    check::<usize>();
}

#[test]
fn non_trivial_elements() {
    assert!(!String::TRIVIALLY_COPYABLE);
    assert!(!String::ZEROED_DEFAULT);
    assert!(!<Box<u32>>::TRIVIALLY_COPYABLE);
    assert!(!<CowBuffer<u32>>::TRIVIALLY_COPYABLE);
    assert!(u16::TRIVIALLY_COPYABLE);
}
