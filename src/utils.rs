#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

// ===============================================================================================
// IOCTL request encoding (asm-generic/ioctl.h)
// ===============================================================================================

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

// ===============================================================================================
// Memory constants and alignment helpers
// ===============================================================================================

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_64K: usize = 64 * 1024;
/// Minimum alignment and granularity of driver-allocated CPU backing store.
pub const ALLOCATION_ALIGNMENT: usize = PAGE_SIZE;
/// Alignment of SVM CPU allocations, so CPU and GPU views can share 2MB pages.
pub const PAGE_SIZE_2M: usize = 2 * 1024 * 1024;

pub const MAX_32BIT_ADDRESS: u64 = (1 << 32) - 1;
pub const MAX_36BIT_ADDRESS: u64 = (1 << 36) - 1;
pub const MAX_47BIT_ADDRESS: u64 = (1 << 47) - 1;
pub const MAX_48BIT_ADDRESS: u64 = (1 << 48) - 1;

/// `align` must be a power of two.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn align_up_usize(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down_usize(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Size of the whole pages touched by `[ptr, ptr + size)`.
#[must_use]
pub const fn align_size_whole_page(ptr: usize, size: usize) -> usize {
    let start = align_down_usize(ptr, PAGE_SIZE);
    let end = align_up_usize(ptr + size, PAGE_SIZE);
    end - start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_page_size_covers_unaligned_ranges() {
        assert_eq!(align_size_whole_page(0x1000 + 37, 4000), PAGE_SIZE);
        assert_eq!(align_size_whole_page(0x1000 + 37, 4096), 2 * PAGE_SIZE);
        assert_eq!(align_size_whole_page(0x1000, 4096), PAGE_SIZE);
        assert_eq!(align_size_whole_page(0x1fff, 2), 2 * PAGE_SIZE);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(8191, 4096), 4096);
        assert!(is_aligned(0x20_0000, PAGE_SIZE_2M as u64));
        assert!(!is_aligned(0x20_1000, PAGE_SIZE_2M as u64));
    }
}
