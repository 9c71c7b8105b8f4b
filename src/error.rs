use crate::kmd::KmdError;
use crate::memory::partition::HeapIndex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GfxError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("GPU address space exhausted in {heap:?} heap (requested 0x{size:x} bytes)")]
    AddressSpaceExhausted { heap: HeapIndex, size: u64 },

    #[error("Invalid host pointer 0x{address:x} (size 0x{size:x})")]
    InvalidHostPointer { address: usize, size: usize },

    #[error("Kernel driver error: {0}")]
    Driver(KmdError),

    #[error("Operation timed out")]
    WaitTimeout,
}

impl From<KmdError> for GfxError {
    fn from(err: KmdError) -> Self {
        match err {
            KmdError::OutOfMemory => Self::OutOfMemory,
            KmdError::InvalidHostPointer => Self::InvalidHostPointer {
                address: 0,
                size: 0,
            },
            other => Self::Driver(other),
        }
    }
}

impl GfxError {
    /// Whether the caller may trim, retry or report the failure to the application.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory
                | Self::AddressSpaceExhausted { .. }
                | Self::InvalidHostPointer { .. }
                | Self::WaitTimeout
        )
    }
}

// A convenient alias
pub type GfxResult<T> = Result<T, GfxError>;

/// Terminates the process after an invariant violation that cannot be unwound.
///
/// Used when continuing would let the GPU run against memory that is not
/// guaranteed to be present.
#[cold]
pub fn unrecoverable(reason: &str) -> ! {
    tracing::error!(reason, "unrecoverable memory manager state");
    std::process::abort()
}
