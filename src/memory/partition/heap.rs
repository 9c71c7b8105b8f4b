use crate::memory::partition::RangeAllocator;
use crate::utils::{align_down, align_up};
use std::collections::BTreeMap;

/// Requests at or above this size are carved from the top of the heap so large
/// and small allocations do not interleave.
const LARGE_ALLOCATION_THRESHOLD: u64 = 1024 * 1024;

/// A contiguous range of GPU virtual address space with a best-fit/bump allocator.
///
/// Never-used space is handed out by two bump pointers, small requests from the
/// bottom and large ones from the top. Freed ranges go to a coalescing free
/// list which is searched best-fit before the bump pointers move; freed ranges
/// adjacent to a bump pointer give the space straight back to it.
#[derive(Debug)]
pub struct Heap {
    base: u64,
    limit: u64,
    granularity: u64,

    bottom: u64,
    top: u64,

    // Start Address -> Size
    free_chunks: BTreeMap<u64, u64>,
    allocations: BTreeMap<u64, u64>,
}

impl Heap {
    /// `limit` is inclusive. `granularity` must be a power of two.
    #[must_use]
    pub fn new(base: u64, limit: u64, granularity: u64) -> Self {
        Self {
            base,
            limit,
            granularity,
            bottom: base,
            top: limit.saturating_add(1),
            free_chunks: BTreeMap::new(),
            allocations: BTreeMap::new(),
        }
    }

    /// A heap that cannot satisfy any request.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            base: 0,
            limit: 0,
            granularity: 1,
            bottom: 0,
            top: 0,
            free_chunks: BTreeMap::new(),
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn granularity(&self) -> u64 {
        self.granularity
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.top > self.base
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        self.is_initialized() && addr >= self.base && addr <= self.limit
    }

    /// Bytes not currently handed out.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.top - self.bottom + self.free_chunks.values().sum::<u64>()
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    fn allocate_from_free_list(&mut self, size: u64, align: u64) -> Option<u64> {
        let (&start, &len) = self
            .free_chunks
            .iter()
            .filter(|&(&start, &len)| align_up(start, align) + size <= start + len)
            .min_by_key(|&(_, &len)| len)?;

        self.free_chunks.remove(&start);
        let addr = align_up(start, align);
        if addr > start {
            self.free_chunks.insert(start, addr - start);
        }
        let end = addr + size;
        if end < start + len {
            self.free_chunks.insert(end, start + len - end);
        }
        Some(addr)
    }

    fn allocate_from_bottom(&mut self, size: u64, align: u64) -> Option<u64> {
        let addr = align_up(self.bottom, align);
        if addr.checked_add(size)? > self.top {
            return None;
        }
        if addr > self.bottom {
            self.free_chunks.insert(self.bottom, addr - self.bottom);
        }
        self.bottom = addr + size;
        Some(addr)
    }

    fn allocate_from_top(&mut self, size: u64, align: u64) -> Option<u64> {
        let addr = align_down(self.top.checked_sub(size)?, align);
        if addr < self.bottom {
            return None;
        }
        let end = addr + size;
        if end < self.top {
            self.free_chunks.insert(end, self.top - end);
        }
        self.top = addr;
        Some(addr)
    }

    fn release_chunk(&mut self, mut start: u64, mut size: u64) {
        // Coalesce with the free neighbour below.
        if let Some((&prev, &prev_len)) = self.free_chunks.range(..start).next_back() {
            if prev + prev_len == start {
                self.free_chunks.remove(&prev);
                start = prev;
                size += prev_len;
            }
        }
        // And the one above.
        if let Some(next_len) = self.free_chunks.remove(&(start + size)) {
            size += next_len;
        }

        if start + size == self.bottom {
            self.bottom = start;
        } else if start == self.top {
            self.top = start + size;
        } else {
            self.free_chunks.insert(start, size);
            return;
        }

        // The bump pointers may now touch, or touch another free chunk.
        if self.bottom == self.top {
            return;
        }
        if let Some((&prev, &prev_len)) = self.free_chunks.range(..self.bottom).next_back() {
            if prev + prev_len == self.bottom {
                self.free_chunks.remove(&prev);
                self.bottom = prev;
            }
        }
        if let Some(next_len) = self.free_chunks.remove(&self.top) {
            self.top += next_len;
        }
    }
}

impl RangeAllocator for Heap {
    /// Reserves `size` bytes aligned to `align`, rounding both up to the heap
    /// granularity. Returns the size actually reserved alongside the address.
    fn allocate_range(&mut self, size: u64, align: u64) -> Option<(u64, u64)> {
        if size == 0 || !self.is_initialized() {
            return None;
        }
        let size = align_up(size, self.granularity);
        let align = align.max(self.granularity).next_power_of_two();

        let addr = self
            .allocate_from_free_list(size, align)
            .or_else(|| {
                if size >= LARGE_ALLOCATION_THRESHOLD {
                    self.allocate_from_top(size, align)
                } else {
                    self.allocate_from_bottom(size, align)
                }
            })?;

        self.allocations.insert(addr, size);
        Some((addr, size))
    }

    /// Returns a range to the heap. Untracked addresses are reported and ignored.
    fn free_range(&mut self, addr: u64, size: u64) -> bool {
        let Some(tracked_size) = self.allocations.remove(&addr) else {
            tracing::warn!(addr = format_args!("{addr:#x}"), size, "freeing untracked GPU range");
            return false;
        };
        if align_up(size, self.granularity) > tracked_size {
            tracing::warn!(
                addr = format_args!("{addr:#x}"),
                size,
                tracked_size,
                "GPU range freed with a larger size than reserved"
            );
        }

        self.release_chunk(addr, tracked_size);
        true
    }

    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }
}
