use thiserror::Error;

// NTSTATUS values reported by residency-managed (WDDM-style) kernel drivers.
pub const STATUS_SUCCESS: u32 = 0x0000_0000;
pub const STATUS_PENDING: u32 = 0x0000_0103;
pub const STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;
pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
pub const STATUS_NO_MEMORY: u32 = 0xC000_0017;
pub const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const STATUS_GRAPHICS_NO_VIDEO_MEMORY: u32 = 0xC01E_0100;
pub const STATUS_GRAPHICS_INVALID_ALLOCATION_HANDLE: u32 = 0xC01E_0111;

/// Classified kernel-driver failure.
///
/// Raw status codes are OS specific; the memory layer only ever sees this enum.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmdError {
    #[error("kernel driver is out of memory")]
    OutOfMemory,

    #[error("host memory failed kernel validation")]
    InvalidHostPointer,

    #[error("unexpected kernel driver status {0:#x}")]
    Protocol(i64),
}

pub type KmdResult<T> = Result<T, KmdError>;

impl KmdError {
    /// Classify a Linux errno returned by a DRM ioctl.
    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOMEM | libc::ENOSPC => Self::OutOfMemory,
            libc::EFAULT => Self::InvalidHostPointer,
            other => Self::Protocol(other as i64),
        }
    }

    /// Classify an NTSTATUS. Success and pending codes are not errors and must be
    /// filtered by the caller.
    #[must_use]
    pub const fn from_ntstatus(status: u32) -> Self {
        match status {
            STATUS_NO_MEMORY | STATUS_GRAPHICS_NO_VIDEO_MEMORY => Self::OutOfMemory,
            STATUS_ACCESS_VIOLATION => Self::InvalidHostPointer,
            other => Self::Protocol(other as i64),
        }
    }

    pub(crate) fn last_os_error() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification() {
        assert_eq!(KmdError::from_errno(libc::ENOMEM), KmdError::OutOfMemory);
        assert_eq!(KmdError::from_errno(libc::EFAULT), KmdError::InvalidHostPointer);
        assert_eq!(
            KmdError::from_errno(libc::EINVAL),
            KmdError::Protocol(i64::from(libc::EINVAL))
        );
    }

    #[test]
    fn ntstatus_classification() {
        assert_eq!(
            KmdError::from_ntstatus(STATUS_GRAPHICS_NO_VIDEO_MEMORY),
            KmdError::OutOfMemory
        );
        assert_eq!(
            KmdError::from_ntstatus(STATUS_ACCESS_VIOLATION),
            KmdError::InvalidHostPointer
        );
        assert!(matches!(
            KmdError::from_ntstatus(STATUS_UNSUCCESSFUL),
            KmdError::Protocol(_)
        ));
    }
}
