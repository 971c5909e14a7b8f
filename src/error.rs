use core::alloc::Layout;

/// Error type for the fallible operations of [`CowBuffer`](crate::CowBuffer).
///
/// When an operation returns an error, the buffer it was called on still holds the
/// same items as before the call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A length or position supplied by the caller is out of range.
    #[error("invalid {name}: {value} (must be at most {max})")]
    InvalidParameter {
        name: &'static str,
        value: usize,
        max: usize,
    },
    /// Overflow of `usize` or `isize::MAX` while computing the size of an allocation.
    #[error("capacity overflow")]
    CapacityOverflow,
    /// The allocator could not provide the requested memory.
    #[error("memory allocation of {} bytes failed", .layout.size())]
    AllocFailed {
        /// The layout that was passed to the allocator.
        layout: Layout,
    },
}

/// Coarse classification of [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller could have checked the precondition. Nothing was modified.
    InvalidParameter,
    /// Size computation or allocation failed. Nothing was modified.
    OutOfMemory,
}

impl Error {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Error::CapacityOverflow | Error::AllocFailed { .. } => ErrorKind::OutOfMemory,
        }
    }

    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        self.kind() == ErrorKind::OutOfMemory
    }
}

#[cold]
pub(crate) fn invalid_parameter(name: &'static str, value: usize, max: usize) -> Error {
    Error::InvalidParameter { name, value, max }
}

#[cold]
pub(crate) fn capacity_error() -> Error {
    Error::CapacityOverflow
}

/// Diverges on an error that the calling operation has no way to report.
///
/// Allocation failures go through `handle_alloc_error` like the standard collections.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn handle_error(err: Error) -> ! {
    match err {
        Error::AllocFailed { layout } => std::alloc::handle_alloc_error(layout),
        _ => panic!("{err}"),
    }
}

#[test]
fn error_kinds() {
    let layout = Layout::from_size_align(64, 8).unwrap();
    assert_eq!(Error::CapacityOverflow.kind(), ErrorKind::OutOfMemory);
    assert_eq!(Error::AllocFailed { layout }.kind(), ErrorKind::OutOfMemory);
    assert_eq!(invalid_parameter("length", 5, 4).kind(), ErrorKind::InvalidParameter);
    assert!(!invalid_parameter("length", 5, 4).is_out_of_memory());

    assert_eq!(
        Error::AllocFailed { layout }.to_string(),
        "memory allocation of 64 bytes failed"
    );
    assert_eq!(
        invalid_parameter("position", 5, 4).to_string(),
        "invalid position: 5 (must be at most 4)"
    );
}
