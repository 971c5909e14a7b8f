//! The atomic reference count stored in every buffer header.

use core::sync::atomic::{AtomicU32, Ordering};

/// Past this point we assume something leaks handles in a loop and abort, like `std::sync::Arc`.
const MAX_REF_COUNT: u32 = i32::MAX as u32;

/// An atomic reference count.
///
/// A count of zero is terminal: the owner of the last reference is destroying the
/// buffer, and [`conditional_increment`](AtomicRefCount::conditional_increment) refuses
/// to revive it.
#[repr(transparent)]
pub struct AtomicRefCount {
    count: AtomicU32,
}

impl AtomicRefCount {
    #[inline]
    pub const fn new(count: u32) -> Self {
        AtomicRefCount {
            count: AtomicU32::new(count),
        }
    }

    /// Returns the current count.
    ///
    /// Pairs with the release ordering of [`decrement`](AtomicRefCount::decrement) so
    /// that a handle observing a count of 1 also observes the other handles being done
    /// with the buffer.
    #[inline]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Adds a reference and returns the new count.
    #[inline]
    pub fn increment(&self) -> u32 {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        if prev > MAX_REF_COUNT {
            std::process::abort();
        }

        prev + 1
    }

    /// Removes a reference and returns the new count.
    ///
    /// When this returns zero the caller must issue an acquire fence before touching
    /// the buffer's contents.
    #[inline]
    pub fn decrement(&self) -> u32 {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "reference count underflow");

        prev - 1
    }

    /// Adds a reference only if the count has not reached zero.
    ///
    /// Returns the new count, or zero (without modifying anything) if the count was
    /// already zero.
    #[inline]
    pub fn conditional_increment(&self) -> u32 {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return 0;
            }

            if current > MAX_REF_COUNT {
                std::process::abort();
            }

            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current + 1,
                Err(actual) => current = actual,
            }
        }
    }
}

impl core::fmt::Debug for AtomicRefCount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicRefCount").field(&self.get()).finish()
    }
}

#[test]
fn ref_count_transitions() {
    let rc = AtomicRefCount::new(1);
    assert_eq!(rc.get(), 1);
    assert_eq!(rc.increment(), 2);
    assert_eq!(rc.conditional_increment(), 3);
    assert_eq!(rc.decrement(), 2);
    assert_eq!(rc.decrement(), 1);
    assert_eq!(rc.decrement(), 0);

    // Zero is terminal.
    assert_eq!(rc.conditional_increment(), 0);
    assert_eq!(rc.get(), 0);
}

#[test]
fn conditional_increment_contended() {
    use std::sync::Arc;

    let rc = Arc::new(AtomicRefCount::new(1));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let rc = rc.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    assert!(rc.conditional_increment() > 1);
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(rc.get(), 8001);
}
