use crate::error::{GfxError, GfxResult};
use crate::kmd::{BackingHandle, ExternalHandle};
use crate::memory::buffer_object::BufferObject;
use crate::memory::gmm::{ImageDescriptor, ImageLayout};
use crate::memory::host_ptr::OsHandleStorage;
use crate::memory::residency::{ResidencyData, ResidencyUnit};
use crate::utils::PAGE_SIZE_2M;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Largest size whose page- and 2MB-rounded forms still fit a `Layout`.
pub const MAX_ALLOCATION_SIZE: usize = isize::MAX as usize - PAGE_SIZE_2M;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationType {
    #[default]
    Unknown,
    Buffer,
    /// Driver-owned memory the application may later pass back as a host pointer.
    BufferHostMemory,
    ExternalHostPtr,
    Image,
    SharedImage,
    SharedBuffer,
    SvmCpu,
    SvmGpu,
    KernelIsa,
    InternalHeap,
    LinearStream,
    FillPattern,
}

impl AllocationType {
    /// Types the device addresses through 32-bit base-relative offsets.
    #[must_use]
    pub const fn is_internal_32bit(self) -> bool {
        matches!(self, Self::KernelIsa | Self::InternalHeap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPool {
    #[default]
    MemoryNull,
    System4KBPages,
    System64KBPages,
    System4KBPagesWith32BitGpuAddressing,
    SystemCpuInaccessible,
    LocalMemory,
}

/// One allocation request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationData {
    pub allocation_type: AllocationType,
    pub size: usize,
    /// Zero means no constraint beyond the page size.
    pub alignment: usize,
    /// Existing CPU memory to wrap instead of allocating.
    pub host_ptr: Option<usize>,
    pub image: Option<ImageDescriptor>,
    /// Keep the GPU address inside a 32-bit heap.
    pub require_32bit: bool,
}

impl AllocationData {
    #[must_use]
    pub fn new(allocation_type: AllocationType, size: usize) -> Self {
        Self {
            allocation_type,
            size,
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn host_ptr(mut self, host_ptr: usize) -> Self {
        self.host_ptr = Some(host_ptr);
        self
    }

    #[must_use]
    pub const fn image(mut self, desc: ImageDescriptor) -> Self {
        self.image = Some(desc);
        self
    }

    #[must_use]
    pub const fn require_32bit(mut self) -> Self {
        self.require_32bit = true;
        self
    }

    /// # Errors
    /// `InvalidArgument` for zero or oversized sizes, null or wrapping host
    /// pointers and alignments that are not powers of two.
    pub fn validate(&self) -> GfxResult<()> {
        if self.size == 0 && self.image.is_none() {
            return Err(GfxError::InvalidArgument("allocation size is zero".into()));
        }
        if self.size > MAX_ALLOCATION_SIZE {
            return Err(GfxError::InvalidArgument(format!(
                "allocation size {:#x} is too large",
                self.size
            )));
        }
        if let Some(host_ptr) = self.host_ptr {
            // Room for the page-rounded end of the range.
            let end = host_ptr
                .checked_add(self.size)
                .and_then(|end| end.checked_add(PAGE_SIZE_2M));
            if end.is_none() {
                return Err(GfxError::InvalidArgument(format!(
                    "host range {host_ptr:#x} + {:#x} wraps the address space",
                    self.size
                )));
            }
        }
        if self.host_ptr == Some(0) {
            return Err(GfxError::InvalidArgument("host pointer is null".into()));
        }
        if self.alignment != 0 && !self.alignment.is_power_of_two() {
            return Err(GfxError::InvalidArgument(format!(
                "alignment {:#x} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Describes how an imported object is going to be used.
#[derive(Debug, Clone, Copy)]
pub struct AllocationProperties {
    pub allocation_type: AllocationType,
    pub image: Option<ImageDescriptor>,
}

impl AllocationProperties {
    #[must_use]
    pub const fn buffer() -> Self {
        Self {
            allocation_type: AllocationType::SharedBuffer,
            image: None,
        }
    }

    #[must_use]
    pub const fn image(desc: ImageDescriptor) -> Self {
        Self {
            allocation_type: AllocationType::SharedImage,
            image: Some(desc),
        }
    }
}

/// A GPU virtual address range carved from the partition, decanonized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRange {
    pub base: u64,
    pub size: u64,
}

/// CPU memory the manager allocated itself to back an allocation.
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain memory owned exclusively by this value.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates zeroed memory.
    ///
    /// # Errors
    /// `InvalidArgument` for an impossible layout, `OutOfMemory` when the
    /// allocator fails.
    pub fn new(size: usize, alignment: usize) -> GfxResult<Self> {
        let layout = Layout::from_size_align(size.max(1), alignment)
            .map_err(|e| GfxError::InvalidArgument(e.to_string()))?;
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(GfxError::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }

    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// The handle upper layers hold for one piece of GPU-accessible memory.
///
/// It is created by exactly one [`MemoryManager`](crate::memory::MemoryManager)
/// entry point and must be returned through
/// [`MemoryManager::free_graphics_memory`](crate::memory::MemoryManager::free_graphics_memory),
/// which releases everything it accumulated.
#[derive(Debug)]
pub struct GraphicsAllocation {
    pub(crate) allocation_type: AllocationType,
    pub(crate) memory_pool: MemoryPool,
    pub(crate) bos: Vec<Arc<BufferObject>>,
    pub(crate) fragments: OsHandleStorage,
    pub(crate) cpu_ptr: usize,
    pub(crate) size: usize,
    pub(crate) gpu_address: u64,
    pub(crate) gpu_base_address: u64,
    pub(crate) allocation_offset: usize,
    pub(crate) reserved: Option<ReservedRange>,
    pub(crate) driver_allocated: Option<AlignedBuffer>,
    pub(crate) shared_handle: Option<ExternalHandle>,
    pub(crate) gmm: Option<ImageLayout>,
    pub(crate) residency: Arc<ResidencyData>,
}

impl GraphicsAllocation {
    pub(crate) fn new(allocation_type: AllocationType, memory_pool: MemoryPool, size: usize) -> Self {
        Self {
            allocation_type,
            memory_pool,
            bos: Vec::new(),
            fragments: OsHandleStorage::default(),
            cpu_ptr: 0,
            size,
            gpu_address: 0,
            gpu_base_address: 0,
            allocation_offset: 0,
            reserved: None,
            driver_allocated: None,
            shared_handle: None,
            gmm: None,
            residency: Arc::default(),
        }
    }

    #[must_use]
    pub const fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    #[must_use]
    pub const fn memory_pool(&self) -> MemoryPool {
        self.memory_pool
    }

    /// CPU address of the data, or null when the memory is CPU-inaccessible.
    #[must_use]
    pub const fn cpu_ptr(&self) -> *mut u8 {
        self.cpu_ptr as *mut u8
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Canonical GPU virtual address of the data.
    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// Base the device adds to 32-bit offsets; zero outside the 32-bit heaps.
    #[must_use]
    pub const fn gpu_base_address(&self) -> u64 {
        self.gpu_base_address
    }

    /// GPU address relative to `gpu_base_address`.
    #[must_use]
    pub const fn gpu_address_to_patch(&self) -> u64 {
        self.gpu_address - self.gpu_base_address
    }

    /// Offset of the data inside its first page.
    #[must_use]
    pub const fn allocation_offset(&self) -> usize {
        self.allocation_offset
    }

    #[must_use]
    pub const fn reserved_range(&self) -> Option<ReservedRange> {
        self.reserved
    }

    #[must_use]
    pub const fn shared_handle(&self) -> Option<ExternalHandle> {
        self.shared_handle
    }

    #[must_use]
    pub fn is_driver_allocated(&self) -> bool {
        self.driver_allocated.is_some()
    }

    #[must_use]
    pub const fn gmm(&self) -> Option<&ImageLayout> {
        self.gmm.as_ref()
    }

    /// The backing object of a single-object allocation.
    #[must_use]
    pub fn bo(&self) -> Option<&Arc<BufferObject>> {
        self.bos.first()
    }

    #[must_use]
    pub fn bos(&self) -> &[Arc<BufferObject>] {
        &self.bos
    }

    #[must_use]
    pub const fn fragments(&self) -> &OsHandleStorage {
        &self.fragments
    }

    #[must_use]
    pub fn residency(&self) -> &Arc<ResidencyData> {
        &self.residency
    }

    /// Every backing object, including host-pointer fragments.
    pub fn all_bos(&self) -> impl Iterator<Item = &Arc<BufferObject>> {
        self.bos
            .iter()
            .chain(self.fragments.fragments.iter().filter_map(|f| f.bo.as_ref()))
    }

    #[must_use]
    pub fn backing_handles(&self) -> Vec<BackingHandle> {
        self.all_bos().map(|bo| bo.handle()).collect()
    }

    /// Fragments carry their own residency record since other allocations may
    /// share them.
    #[must_use]
    pub fn residency_units(&self) -> Vec<ResidencyUnit> {
        if !self.fragments.is_empty() {
            return self
                .fragments
                .fragments
                .iter()
                .filter_map(|f| {
                    let bo = f.bo.as_ref()?;
                    Some(ResidencyUnit {
                        handles: vec![bo.handle()],
                        size: f.size as u64,
                        data: Arc::clone(&f.residency),
                    })
                })
                .collect();
        }
        if self.bos.is_empty() {
            return Vec::new();
        }
        vec![ResidencyUnit {
            handles: self.backing_handles(),
            size: self.bos.iter().map(|bo| bo.size() as u64).sum(),
            data: Arc::clone(&self.residency),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_validation() {
        assert!(AllocationData::new(AllocationType::Buffer, 4096).validate().is_ok());
        assert!(AllocationData::new(AllocationType::Buffer, 0).validate().is_err());
        assert!(
            AllocationData::new(AllocationType::Buffer, 64)
                .alignment(48)
                .validate()
                .is_err()
        );
        assert!(
            AllocationData::new(AllocationType::ExternalHostPtr, 64)
                .host_ptr(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let err = AllocationData::new(AllocationType::Buffer, usize::MAX - 100)
            .validate()
            .unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
        assert!(
            AllocationData::new(AllocationType::Buffer, MAX_ALLOCATION_SIZE)
                .validate()
                .is_ok()
        );

        let err = AllocationData::new(AllocationType::ExternalHostPtr, 8192)
            .host_ptr(usize::MAX - 100)
            .validate()
            .unwrap_err();
        assert!(matches!(err, GfxError::InvalidArgument(_)));
    }

    #[test]
    fn aligned_buffer_is_aligned_and_zeroed() {
        let buffer = AlignedBuffer::new(8192, 2 * 1024 * 1024).unwrap();
        assert_eq!(buffer.address() % (2 * 1024 * 1024), 0);
        assert_eq!(buffer.size(), 8192);
        // SAFETY: the buffer owns 8192 readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(buffer.address() as *const u8, 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn internal_32bit_types() {
        assert!(AllocationType::KernelIsa.is_internal_32bit());
        assert!(AllocationType::InternalHeap.is_internal_32bit());
        assert!(!AllocationType::Buffer.is_internal_32bit());
    }
}
