//! GPU virtual address space partitioning.
//!
//! The address space is split once at manager initialization into named heaps,
//! each an independent, independently locked range allocator. Addresses leave
//! the partition in canonical form and must be decanonized before coming back.

pub mod heap;

use crate::error::{GfxError, GfxResult};
use crate::kmd::{AddressSpaceInfo, HeapRange};
use crate::utils::{
    GB, MAX_36BIT_ADDRESS, MAX_47BIT_ADDRESS, MAX_48BIT_ADDRESS, PAGE_SIZE,
    PAGE_SIZE_64K, align_down, align_up,
};
use heap::Heap;
use parking_lot::Mutex;

/// Range allocation strategy behind one heap.
pub trait RangeAllocator {
    /// Reserve an aligned range. Returns the address and the size actually reserved.
    fn allocate_range(&mut self, size: u64, align: u64) -> Option<(u64, u64)>;

    /// Release a previously reserved range.
    fn free_range(&mut self, addr: u64, size: u64) -> bool;

    /// The heap's base and inclusive limit.
    fn bounds(&self) -> (u64, u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapIndex {
    /// Kernel ISA and internal driver heaps; 32-bit addressable.
    Internal,
    /// User allocations that must stay 32-bit addressable.
    External,
    Standard,
    Standard64Kb,
    /// CPU-sharable lower half of a 48-bit space.
    Svm,
}

impl HeapIndex {
    pub const ALL: [Self; 5] = [
        Self::Internal,
        Self::External,
        Self::Standard,
        Self::Standard64Kb,
        Self::Svm,
    ];

    const fn slot(self) -> usize {
        self as usize
    }

    const fn granularity(self) -> u64 {
        match self {
            Self::Standard64Kb => PAGE_SIZE_64K as u64,
            _ => PAGE_SIZE as u64,
        }
    }
}

const HEAP32_SIZE: u64 = 4 * GB;

/// Sign-extends bit 47 into the upper 16 bits.
#[must_use]
pub const fn canonize(address: u64) -> u64 {
    (((address << 16) as i64) >> 16) as u64
}

#[must_use]
pub const fn decanonize(address: u64) -> u64 {
    address & MAX_48BIT_ADDRESS
}

#[derive(Debug)]
pub struct GfxPartition {
    heaps: [Mutex<Heap>; 5],
    gpu_address_bits: u32,
}

impl GfxPartition {
    /// Lays out the address space for a device with `gpu_address_bits` of virtual
    /// address. A driver-supplied layout takes precedence.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for address widths other than 36, 47 or 48 bits.
    pub fn init(gpu_address_bits: u32, layout: Option<AddressSpaceInfo>) -> GfxResult<Self> {
        let partition = Self {
            heaps: std::array::from_fn(|_| Mutex::new(Heap::empty())),
            gpu_address_bits,
        };

        if let Some(info) = layout {
            partition.init_from_driver(&info);
            return Ok(partition);
        }

        let (gfx_top, gfx_base) = match gpu_address_bits {
            48 => {
                // The lower half is shared with the CPU.
                partition.init_heap(HeapIndex::Svm, 0, MAX_47BIT_ADDRESS);
                (MAX_48BIT_ADDRESS, MAX_47BIT_ADDRESS + 1)
            }
            47 => (MAX_47BIT_ADDRESS, 0),
            36 => (MAX_36BIT_ADDRESS, 0),
            bits => {
                return Err(GfxError::InvalidArgument(format!(
                    "unsupported GPU address width: {bits} bits"
                )));
            }
        };

        partition.init_heap(HeapIndex::Internal, gfx_base, gfx_base + HEAP32_SIZE - 1);
        partition.init_heap(
            HeapIndex::External,
            gfx_base + HEAP32_SIZE,
            gfx_base + 2 * HEAP32_SIZE - 1,
        );

        let standard_base = gfx_base + 2 * HEAP32_SIZE;
        let half = align_down((gfx_top + 1 - standard_base) / 2, PAGE_SIZE_64K as u64);
        partition.init_heap(HeapIndex::Standard, standard_base, standard_base + half - 1);
        partition.init_heap(
            HeapIndex::Standard64Kb,
            standard_base + half,
            standard_base + 2 * half - 1,
        );

        tracing::debug!(gpu_address_bits, "GPU address space partitioned");
        Ok(partition)
    }

    fn init_from_driver(&self, info: &AddressSpaceInfo) {
        if let Some(svm) = info.svm {
            self.init_heap(HeapIndex::Svm, svm.base, svm.limit);
        }
        self.init_heap(
            HeapIndex::Internal,
            info.heap32_base,
            info.heap32_base + HEAP32_SIZE - 1,
        );
        self.init_heap(
            HeapIndex::External,
            info.heap32_base + HEAP32_SIZE,
            info.heap32_base + 2 * HEAP32_SIZE - 1,
        );
        let HeapRange { base, limit } = info.standard;
        self.init_heap(HeapIndex::Standard, base, limit);
        let HeapRange { base, limit } = info.standard64kb;
        self.init_heap(HeapIndex::Standard64Kb, base, limit);
        tracing::debug!(?info, "GPU address space layout supplied by the driver");
    }

    fn init_heap(&self, index: HeapIndex, base: u64, limit: u64) {
        let granularity = index.granularity();
        // Address zero is never handed out.
        let base = align_up(base.max(1), granularity);
        *self.heaps[index.slot()].lock() = Heap::new(base, limit, granularity);
    }

    #[must_use]
    pub const fn gpu_address_bits(&self) -> u32 {
        self.gpu_address_bits
    }

    #[must_use]
    pub fn is_heap_initialized(&self, index: HeapIndex) -> bool {
        self.heaps[index.slot()].lock().is_initialized()
    }

    #[must_use]
    pub fn heap_base(&self, index: HeapIndex) -> u64 {
        self.heaps[index.slot()].lock().bounds().0
    }

    #[must_use]
    pub fn heap_limit(&self, index: HeapIndex) -> u64 {
        self.heaps[index.slot()].lock().bounds().1
    }

    #[must_use]
    pub fn heap_size(&self, index: HeapIndex) -> u64 {
        let heap = self.heaps[index.slot()].lock();
        if !heap.is_initialized() {
            return 0;
        }
        let (base, limit) = heap.bounds();
        limit - base + 1
    }

    #[must_use]
    pub fn heap_available(&self, index: HeapIndex) -> u64 {
        self.heaps[index.slot()].lock().available()
    }

    #[must_use]
    pub fn heap_allocation_count(&self, index: HeapIndex) -> usize {
        self.heaps[index.slot()].lock().allocation_count()
    }

    /// Reserves a range in `index`. The returned address is decanonized.
    ///
    /// # Errors
    /// `AddressSpaceExhausted` when the heap cannot fit the request.
    pub fn heap_allocate(&self, index: HeapIndex, size: u64, align: u64) -> GfxResult<(u64, u64)> {
        let result = self.heaps[index.slot()].lock().allocate_range(size, align);
        result.ok_or_else(|| {
            tracing::debug!(heap = ?index, size, align, "GPU heap exhausted");
            GfxError::AddressSpaceExhausted { heap: index, size }
        })
    }

    pub fn heap_free(&self, index: HeapIndex, address: u64, size: u64) {
        self.heaps[index.slot()].lock().free_range(address, size);
    }

    /// Returns a decanonized range to whichever heap it came from.
    pub fn free_gpu_address_range(&self, address: u64, size: u64) {
        for index in HeapIndex::ALL {
            let mut heap = self.heaps[index.slot()].lock();
            if heap.contains(address) {
                heap.free_range(address, size);
                return;
            }
        }
        tracing::warn!(
            gpu_va = format_args!("{address:#x}"),
            size,
            "GPU range does not belong to any heap"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonization_sign_extends_bit_47() {
        assert_eq!(canonize(0x0000_7fff_ffff_f000), 0x0000_7fff_ffff_f000);
        assert_eq!(canonize(0x0000_8000_0000_0000), 0xffff_8000_0000_0000);
        assert_eq!(decanonize(0xffff_8000_0000_1000), 0x0000_8000_0000_1000);
        assert_eq!(decanonize(canonize(0x0000_ffff_0000_0000)), 0x0000_ffff_0000_0000);
    }

    #[test]
    fn full_48bit_layout() {
        let partition = GfxPartition::init(48, None).unwrap();
        assert!(partition.is_heap_initialized(HeapIndex::Svm));
        assert_eq!(partition.heap_limit(HeapIndex::Svm), MAX_47BIT_ADDRESS);
        assert_eq!(partition.heap_base(HeapIndex::Internal), 1 << 47);
        assert_eq!(partition.heap_size(HeapIndex::Internal), 4 * GB);
        assert_eq!(partition.heap_base(HeapIndex::External), (1 << 47) + 4 * GB);
        assert_eq!(
            partition.heap_size(HeapIndex::Standard),
            partition.heap_size(HeapIndex::Standard64Kb)
        );
        assert!(partition.heap_limit(HeapIndex::Standard64Kb) <= MAX_48BIT_ADDRESS);
    }

    #[test]
    fn reduced_layouts_have_no_svm_heap() {
        for bits in [36, 47] {
            let partition = GfxPartition::init(bits, None).unwrap();
            assert!(!partition.is_heap_initialized(HeapIndex::Svm));
            assert_eq!(partition.heap_size(HeapIndex::Svm), 0);
            assert_eq!(partition.heap_base(HeapIndex::Internal), PAGE_SIZE as u64);
            assert_eq!(partition.heap_base(HeapIndex::External), 4 * GB);
        }
        assert!(GfxPartition::init(32, None).is_err());
    }

    #[test]
    fn driver_layout_overrides_default() {
        let info = AddressSpaceInfo {
            svm: None,
            heap32_base: 0x1_0000_0000,
            standard: HeapRange {
                base: 0x10_0000_0000,
                limit: 0x1f_ffff_ffff,
            },
            standard64kb: HeapRange {
                base: 0x20_0000_0000,
                limit: 0x2f_ffff_ffff,
            },
        };
        let partition = GfxPartition::init(48, Some(info)).unwrap();
        assert!(!partition.is_heap_initialized(HeapIndex::Svm));
        assert_eq!(partition.heap_base(HeapIndex::Internal), 0x1_0000_0000);
        assert_eq!(partition.heap_base(HeapIndex::Standard), 0x10_0000_0000);
    }

    #[test]
    fn ranges_return_to_their_owning_heap() {
        let partition = GfxPartition::init(48, None).unwrap();
        let (addr, size) = partition
            .heap_allocate(HeapIndex::External, 0x1000, 0)
            .unwrap();
        assert_eq!(partition.heap_allocation_count(HeapIndex::External), 1);

        partition.free_gpu_address_range(decanonize(canonize(addr)), size);
        assert_eq!(partition.heap_allocation_count(HeapIndex::External), 0);
        assert!(addr - partition.heap_base(HeapIndex::External) <= u64::from(u32::MAX));
    }

    #[test]
    fn exhausted_heap_is_recoverable() {
        let info = AddressSpaceInfo {
            svm: None,
            heap32_base: 0x1_0000_0000,
            standard: HeapRange {
                base: 0x10_0000_0000,
                limit: 0x10_0000_1fff,
            },
            standard64kb: HeapRange {
                base: 0x20_0000_0000,
                limit: 0x2f_ffff_ffff,
            },
        };
        let partition = GfxPartition::init(48, Some(info)).unwrap();
        partition.heap_allocate(HeapIndex::Standard, 0x2000, 0).unwrap();
        let err = partition
            .heap_allocate(HeapIndex::Standard, 0x1000, 0)
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(
            err,
            GfxError::AddressSpaceExhausted {
                heap: HeapIndex::Standard,
                ..
            }
        ));
    }
}
