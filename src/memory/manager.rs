#![allow(clippy::cast_possible_truncation)]

use crate::error::{GfxError, GfxResult};
use crate::kmd::{
    BackingDescriptor, Completion, ExternalHandle, GpuRange, KernelDriver, KmdError,
    SharedBacking, TilingMode,
};
use crate::memory::allocation::{
    AlignedBuffer, AllocationData, AllocationProperties, AllocationType, GraphicsAllocation,
    MemoryPool, ReservedRange,
};
use crate::memory::buffer_object::BufferObject;
use crate::memory::close_worker::{CloseWorker, CloseWorkerMode};
use crate::memory::config::MemoryManagerConfig;
use crate::memory::gmm::{DefaultDescriber, ResourceDescriber};
use crate::memory::host_ptr::{FragmentMap, FragmentStorage, HostPtrManager, OsHandleStorage};
use crate::memory::partition::{GfxPartition, HeapIndex, canonize, decanonize};
use crate::memory::registry::SharedHandleRegistry;
use crate::memory::residency::{PagingFenceTracker, ResidencyController, ResidencyState};
use crate::utils::{
    ALLOCATION_ALIGNMENT, PAGE_SIZE, PAGE_SIZE_2M, align_down_usize, align_size_whole_page,
    align_up, align_up_usize,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Turns allocation requests into kernel-backed memory with GPU addresses.
///
/// Every allocation handed out must come back through
/// [`MemoryManager::free_graphics_memory`]. The manager is `Sync`; all entry
/// points may be called from any thread.
#[derive(Debug)]
pub struct MemoryManager {
    driver: Arc<dyn KernelDriver>,
    config: MemoryManagerConfig,
    partition: Arc<GfxPartition>,
    registry: Arc<SharedHandleRegistry>,
    host_ptr_manager: HostPtrManager,
    paging: Arc<PagingFenceTracker>,
    describer: Arc<dyn ResourceDescriber>,
    close_worker: Option<CloseWorker>,
}

impl MemoryManager {
    /// Partitions the address space and starts the close worker if configured.
    ///
    /// # Errors
    /// `InvalidArgument` for an unsupported address width, `Io` if the worker
    /// thread cannot be started.
    pub fn new(driver: Arc<dyn KernelDriver>, config: MemoryManagerConfig) -> GfxResult<Self> {
        let partition = Arc::new(GfxPartition::init(
            config.gpu_address_bits,
            driver.address_space(),
        )?);
        let registry = Arc::new(SharedHandleRegistry::new(Arc::clone(&partition)));
        let close_worker = match config.close_worker {
            CloseWorkerMode::Active => Some(CloseWorker::new(Arc::clone(&registry))?),
            CloseWorkerMode::Inactive => None,
        };
        let paging = Arc::new(PagingFenceTracker::new(driver.paging_fence()));

        tracing::debug!(
            gpu_address_bits = config.gpu_address_bits,
            close_worker = ?config.close_worker,
            "memory manager initialized"
        );

        Ok(Self {
            driver,
            config,
            partition,
            registry,
            host_ptr_manager: HostPtrManager::new(),
            paging,
            describer: Arc::new(DefaultDescriber),
            close_worker,
        })
    }

    #[must_use]
    pub fn with_describer(mut self, describer: Arc<dyn ResourceDescriber>) -> Self {
        self.describer = describer;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn partition(&self) -> &GfxPartition {
        &self.partition
    }

    #[must_use]
    pub fn registry(&self) -> &SharedHandleRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn host_ptr_manager(&self) -> &HostPtrManager {
        &self.host_ptr_manager
    }

    #[must_use]
    pub fn paging_fence_tracker(&self) -> &PagingFenceTracker {
        &self.paging
    }

    #[must_use]
    pub const fn close_worker(&self) -> Option<&CloseWorker> {
        self.close_worker.as_ref()
    }

    #[must_use]
    pub fn system_shared_memory(&self) -> u64 {
        self.driver.system_shared_memory()
    }

    /// Residency tracking for one device context.
    ///
    /// # Errors
    /// Propagates the driver's failure to create the monitored fence.
    pub fn create_residency_controller(&self) -> GfxResult<ResidencyController> {
        let fence = self.driver.create_monitored_fence()?;
        Ok(ResidencyController::new(
            Arc::clone(&self.driver),
            fence,
            Arc::clone(&self.paging),
            self.config.fence_spin_duration,
        ))
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates memory according to the request's type and inputs.
    ///
    /// # Errors
    /// `InvalidArgument` for malformed requests. `OutOfMemory`,
    /// `AddressSpaceExhausted` and `InvalidHostPointer` are recoverable; every
    /// resource acquired before the failure has been released.
    pub fn allocate_graphics_memory(&self, data: &AllocationData) -> GfxResult<GraphicsAllocation> {
        data.validate()?;

        if data.image.is_some() {
            return self.allocate_image(data);
        }
        match (data.host_ptr, self.heap32_for(data)) {
            (_, Some(heap)) => self.allocate_32bit(data, heap),
            (Some(host_ptr), None) if self.cpu_addresses_are_gpu_addresses() => {
                self.allocate_for_host_ptr(data, host_ptr)
            }
            (Some(host_ptr), None) => self.allocate_for_non_svm_host_ptr(data, host_ptr),
            (None, None) => self.allocate_with_alignment(data),
        }
    }

    fn heap32_for(&self, data: &AllocationData) -> Option<HeapIndex> {
        if data.allocation_type.is_internal_32bit() {
            return Some(HeapIndex::Internal);
        }
        let forced = self.config.force_32bit_allocations
            && matches!(
                data.allocation_type,
                AllocationType::Buffer
                    | AllocationType::BufferHostMemory
                    | AllocationType::ExternalHostPtr
            );
        (data.require_32bit || forced).then_some(HeapIndex::External)
    }

    /// At least a page, rounded to whole pages.
    fn requested_alignment(data: &AllocationData) -> usize {
        align_up_usize(data.alignment.max(ALLOCATION_ALIGNMENT), ALLOCATION_ALIGNMENT)
    }

    fn cpu_addresses_are_gpu_addresses(&self) -> bool {
        !self.config.uses_limited_range() && self.partition.is_heap_initialized(HeapIndex::Svm)
    }

    /// Driver-allocated CPU memory wrapped in a buffer object.
    ///
    /// SVM CPU allocations reserve one extra alignment unit and place the GPU
    /// address at the first aligned boundary inside it.
    fn allocate_with_alignment(&self, data: &AllocationData) -> GfxResult<GraphicsAllocation> {
        let svm_cpu = data.allocation_type == AllocationType::SvmCpu;
        let mut alignment = Self::requested_alignment(data);
        if svm_cpu {
            alignment = alignment.max(PAGE_SIZE_2M);
        }
        let size = align_up_usize(data.size, ALLOCATION_ALIGNMENT).max(ALLOCATION_ALIGNMENT);

        let buffer = AlignedBuffer::new(size, alignment)?;
        let cpu_ptr = buffer.address();

        let mut allocation =
            GraphicsAllocation::new(data.allocation_type, MemoryPool::System4KBPages, data.size);
        allocation.cpu_ptr = cpu_ptr;
        allocation.driver_allocated = Some(buffer);

        let needs_range = svm_cpu || !self.cpu_addresses_are_gpu_addresses();
        self.build(allocation, |allocation| {
            let gpu_va = if needs_range {
                let (reserve_size, reserve_align) = if svm_cpu {
                    (align_up_usize(size, alignment) + alignment, 0)
                } else {
                    (size, alignment)
                };
                let base = self.reserve(
                    allocation,
                    HeapIndex::Standard,
                    reserve_size as u64,
                    reserve_align as u64,
                )?;
                align_up(base, alignment as u64)
            } else {
                cpu_ptr as u64
            };

            let bo = self.create_userptr_bo(cpu_ptr, size, canonize(gpu_va), false)?;
            allocation.gpu_address = bo.gpu_address();
            allocation.bos.push(bo);

            if allocation.allocation_type == AllocationType::BufferHostMemory {
                self.add_allocation_to_host_ptr_manager(allocation);
            }
            Ok(())
        })
    }

    /// Wraps caller memory without copying, one buffer object per fragment.
    /// The GPU sees the memory at its CPU address.
    fn allocate_for_host_ptr(
        &self,
        data: &AllocationData,
        host_ptr: usize,
    ) -> GfxResult<GraphicsAllocation> {
        let mut allocation =
            GraphicsAllocation::new(data.allocation_type, MemoryPool::System4KBPages, data.size);
        allocation.cpu_ptr = host_ptr;
        allocation.gpu_address = canonize(host_ptr as u64);
        allocation.allocation_offset = host_ptr - align_down_usize(host_ptr, PAGE_SIZE);

        self.build(allocation, |allocation| {
            let mut map = self.host_ptr_manager.lock();
            allocation.fragments = map.prepare_os_storage(host_ptr, data.size)?;
            // Every claim on a fragment holds a reference on its buffer object.
            for bo in allocation
                .fragments
                .fragments
                .iter()
                .filter(|f| f.reused)
                .filter_map(|f| f.bo.as_ref())
            {
                bo.reference();
            }
            self.populate_os_handles(&mut map, &mut allocation.fragments)
        })
    }

    /// Creates and registers buffer objects for the fragments nobody backs yet.
    fn populate_os_handles(&self, map: &mut FragmentMap, storage: &mut OsHandleStorage) -> GfxResult<()> {
        for fragment in storage.fragments.iter_mut().filter(|f| !f.reused) {
            let bo = self.create_userptr_bo(
                fragment.cpu_ptr,
                fragment.size,
                canonize(fragment.cpu_ptr as u64),
                self.config.validate_host_ptr_memory,
            )?;
            map.store_fragment(FragmentStorage {
                cpu_ptr: fragment.cpu_ptr,
                size: fragment.size,
                ref_count: 1,
                bo: Some(Arc::clone(&bo)),
                residency: Arc::clone(&fragment.residency),
                driver_allocation: false,
            });
            fragment.bo = Some(bo);
        }
        Ok(())
    }

    /// Wraps caller memory in one buffer object placed in a reserved range.
    fn allocate_for_non_svm_host_ptr(
        &self,
        data: &AllocationData,
        host_ptr: usize,
    ) -> GfxResult<GraphicsAllocation> {
        let allocation =
            GraphicsAllocation::new(data.allocation_type, MemoryPool::System4KBPages, data.size);
        self.build(allocation, |allocation| {
            self.wrap_host_ptr(allocation, HeapIndex::Standard, host_ptr, data.size)
        })
    }

    /// Keeps the GPU address inside a 4GB heap so the device can reach it with
    /// a 32-bit offset from the heap base.
    fn allocate_32bit(&self, data: &AllocationData, heap: HeapIndex) -> GfxResult<GraphicsAllocation> {
        let mut allocation = GraphicsAllocation::new(
            data.allocation_type,
            MemoryPool::System4KBPagesWith32BitGpuAddressing,
            data.size,
        );
        allocation.gpu_base_address = canonize(self.partition.heap_base(heap));

        self.build(allocation, |allocation| {
            if let Some(host_ptr) = data.host_ptr {
                return self.wrap_host_ptr(allocation, heap, host_ptr, data.size);
            }

            let alignment = Self::requested_alignment(data);
            let size = align_up_usize(data.size, PAGE_SIZE);
            let buffer = AlignedBuffer::new(size, alignment)?;
            let cpu_ptr = buffer.address();
            allocation.cpu_ptr = cpu_ptr;
            allocation.driver_allocated = Some(buffer);

            let base = self.reserve(allocation, heap, size as u64, alignment as u64)?;
            let bo = self.create_userptr_bo(cpu_ptr, size, canonize(base), false)?;
            allocation.gpu_address = bo.gpu_address();
            allocation.bos.push(bo);
            Ok(())
        })
    }

    fn wrap_host_ptr(
        &self,
        allocation: &mut GraphicsAllocation,
        heap: HeapIndex,
        host_ptr: usize,
        size: usize,
    ) -> GfxResult<()> {
        let aligned_ptr = align_down_usize(host_ptr, PAGE_SIZE);
        let offset = host_ptr - aligned_ptr;
        let aligned_size = align_size_whole_page(host_ptr, size);

        let base = self.reserve(allocation, heap, aligned_size as u64, 0)?;
        let bo = self
            .create_userptr_bo(
                aligned_ptr,
                aligned_size,
                canonize(base),
                self.config.validate_host_ptr_memory,
            )
            .map_err(|e| match e {
                GfxError::InvalidHostPointer { .. } => GfxError::InvalidHostPointer {
                    address: host_ptr,
                    size,
                },
                other => other,
            })?;

        allocation.cpu_ptr = host_ptr;
        allocation.allocation_offset = offset;
        allocation.gpu_address = canonize(base + offset as u64);
        allocation.bos.push(bo);
        Ok(())
    }

    /// Linear images take the generic path. Tiled images get kernel memory with
    /// the described tiling and no CPU pointer.
    fn allocate_image(&self, data: &AllocationData) -> GfxResult<GraphicsAllocation> {
        let Some(desc) = data.image else {
            return Err(GfxError::InvalidArgument("image allocation without a descriptor".into()));
        };
        let layout = self.describer.describe_image(&desc);

        if layout.linear {
            let linear = AllocationData {
                size: layout.size,
                image: None,
                ..*data
            };
            let mut allocation = self.allocate_with_alignment(&linear)?;
            allocation.gmm = Some(layout);
            return Ok(allocation);
        }

        let alignment = Self::requested_alignment(data);
        let stride = u32::try_from(layout.row_pitch).map_err(|_| {
            GfxError::InvalidArgument(format!("row pitch {:#x} out of range", layout.row_pitch))
        })?;

        let mut allocation = GraphicsAllocation::new(
            AllocationType::Image,
            MemoryPool::SystemCpuInaccessible,
            layout.size,
        );
        allocation.gmm = Some(layout);

        self.build(allocation, |allocation| {
            let base = self.reserve(
                allocation,
                HeapIndex::Standard,
                layout.size as u64,
                alignment as u64,
            )?;
            let info = self
                .driver
                .create_backing(&BackingDescriptor::Device { size: layout.size })?;
            let bo = Arc::new(
                BufferObject::new(Arc::clone(&self.driver), info.handle, info.size, canonize(base))
                    .with_tiling(layout.tiling),
            );
            allocation.bos.push(Arc::clone(&bo));

            self.driver.set_tiling(bo.handle(), layout.tiling, stride)?;
            self.map_gpu_va(&bo)?;
            allocation.gpu_address = bo.gpu_address();
            Ok(())
        })
    }

    // ===========================================================================================
    // Shared handles
    // ===========================================================================================

    /// Imports an externally shared object.
    ///
    /// Repeated imports of the same object share one buffer object; only the
    /// first one asks the kernel to open the handle. The external handles are
    /// closed when the last importer frees its allocation.
    ///
    /// # Errors
    /// Propagates open failures and `AddressSpaceExhausted`.
    pub fn create_allocation_from_shared_handle(
        &self,
        external: ExternalHandle,
        properties: &AllocationProperties,
        require_32bit: bool,
    ) -> GfxResult<GraphicsAllocation> {
        let heap = if require_32bit {
            HeapIndex::External
        } else {
            HeapIndex::Standard
        };

        let bo = {
            let mut registry = self.registry.lock();
            if let Some(bo) = registry.find_by_external(external) {
                bo
            } else {
                let shared = self.driver.open_shared_handle(external)?;
                if let Some(bo) = registry.find(shared.handle) {
                    bo.add_external_handle(external);
                    bo
                } else {
                    // Mapped before it is published: other importers only ever
                    // see objects with a GPU address behind them.
                    let bo = self.import_shared_backing(shared, heap)?;
                    bo.add_external_handle(external);
                    registry.push(Arc::clone(&bo));
                    bo
                }
            }
        };

        let mut allocation = GraphicsAllocation::new(
            properties.allocation_type,
            MemoryPool::SystemCpuInaccessible,
            bo.size(),
        );
        allocation.gpu_address = bo.gpu_address();
        allocation.shared_handle = Some(external);
        if require_32bit {
            allocation.gpu_base_address = canonize(self.partition.heap_base(HeapIndex::External));
        }
        allocation.bos.push(bo);

        self.build(allocation, |allocation| {
            let Some(desc) = properties.image else {
                return Ok(());
            };
            let tiling = self.driver.get_tiling(allocation.bos[0].handle())?;
            let mut layout = self.describer.describe_image(&desc);
            if tiling == TilingMode::None {
                layout.linear = true;
                layout.tiling = TilingMode::None;
            }
            allocation.gmm = Some(layout);
            Ok(())
        })
    }

    fn import_shared_backing(
        &self,
        shared: SharedBacking,
        heap: HeapIndex,
    ) -> GfxResult<Arc<BufferObject>> {
        let (base, size) = match self.partition.heap_allocate(heap, shared.size as u64, 0) {
            Ok(range) => range,
            Err(e) => {
                if let Err(err) = self.driver.destroy_backing(shared.handle) {
                    tracing::warn!(handle = shared.handle, error = %err, "closing import failed");
                }
                return Err(e);
            }
        };

        let bo = Arc::new(
            BufferObject::new(
                Arc::clone(&self.driver),
                shared.handle,
                shared.size,
                canonize(base),
            )
            .with_reserved_range(GpuRange { base, size }),
        );
        if let Err(e) = self.map_gpu_va(&bo) {
            self.partition.free_gpu_address_range(base, size);
            self.registry.unreference(&bo, false);
            return Err(e);
        }
        Ok(bo)
    }

    // ===========================================================================================
    // Derived allocations & CPU access
    // ===========================================================================================

    /// Re-wraps the CPU memory of `input` in a new buffer object placed in a
    /// fresh range of `size_with_padding` bytes.
    ///
    /// # Errors
    /// `InvalidArgument` if `input` has no CPU memory.
    pub fn create_padded_allocation(
        &self,
        input: &GraphicsAllocation,
        size_with_padding: usize,
    ) -> GfxResult<GraphicsAllocation> {
        if input.cpu_ptr == 0 {
            return Err(GfxError::InvalidArgument(
                "padding requires an allocation with CPU memory".into(),
            ));
        }
        let src = input.cpu_ptr;
        let aligned_ptr = align_down_usize(src, PAGE_SIZE);
        let offset = src - aligned_ptr;
        let aligned_size = align_size_whole_page(src, input.size);

        let mut allocation =
            GraphicsAllocation::new(input.allocation_type, input.memory_pool, size_with_padding);
        allocation.cpu_ptr = src;
        allocation.allocation_offset = offset;

        self.build(allocation, |allocation| {
            let base = self.reserve(
                allocation,
                HeapIndex::Standard,
                size_with_padding.max(aligned_size) as u64,
                0,
            )?;
            let bo = self.create_userptr_bo(aligned_ptr, aligned_size, canonize(base), false)?;
            allocation.gpu_address = canonize(base + offset as u64);
            allocation.bos.push(bo);
            Ok(())
        })
    }

    /// Returns a CPU pointer to the allocation's memory, mapping it if needed.
    ///
    /// # Errors
    /// `InvalidArgument` for allocations without a backing object, or the
    /// driver's error.
    pub fn lock_resource(&self, allocation: &GraphicsAllocation) -> GfxResult<*mut u8> {
        if allocation.cpu_ptr != 0 {
            return Ok(allocation.cpu_ptr());
        }
        let bo = allocation
            .bo()
            .ok_or_else(|| GfxError::InvalidArgument("allocation has no backing object".into()))?;

        if allocation.memory_pool == MemoryPool::SystemCpuInaccessible {
            self.make_resident_blocking(allocation)?;
        }
        let address = bo.lock()?;
        Ok(address as *mut u8)
    }

    /// # Errors
    /// The driver's error.
    pub fn unlock_resource(&self, allocation: &GraphicsAllocation) -> GfxResult<()> {
        match allocation.bo() {
            Some(bo) => bo.unlock().map_err(GfxError::from),
            None => Ok(()),
        }
    }

    fn make_resident_blocking(&self, allocation: &GraphicsAllocation) -> GfxResult<()> {
        let handles = allocation.backing_handles();
        let completion = self
            .driver
            .make_resident(&handles, false)
            .map_err(|failure| GfxError::from(failure.error))?;
        if let Completion::Pending(value) = completion {
            self.paging.update(value);
            self.paging
                .counter()
                .wait(value, self.config.fence_spin_duration, None);
        }
        allocation.residency.set_state(ResidencyState::Resident);
        Ok(())
    }

    /// Blocks until the GPU is done with every backing object of the allocation.
    pub fn handle_fence_completion(&self, allocation: &GraphicsAllocation) {
        for bo in allocation.all_bos() {
            if let Err(e) = bo.wait(None) {
                tracing::warn!(handle = bo.handle(), error = %e, "waiting for GPU idle failed");
            }
        }
    }

    // ===========================================================================================
    // Release
    // ===========================================================================================

    /// Releases everything the allocation holds: description, fragments or
    /// buffer objects, the reserved GPU range and driver-allocated CPU memory.
    pub fn free_graphics_memory(&self, mut allocation: GraphicsAllocation) {
        self.release_allocation_resources(&mut allocation);
    }

    /// Drops one reference on `bo`; see [`SharedHandleRegistry::unreference`].
    pub fn unreference(&self, bo: &Arc<BufferObject>, synchronous: bool) -> u32 {
        self.registry.unreference(bo, synchronous)
    }

    /// Blocks until the close worker has nothing queued.
    pub fn wait_for_deferred_closes(&self) {
        if let Some(worker) = &self.close_worker {
            while !worker.is_idle() {
                thread::sleep(Duration::from_micros(50));
            }
        }
    }

    /// The single teardown path, shared by `free_graphics_memory` and every
    /// failed construction.
    fn release_allocation_resources(&self, allocation: &mut GraphicsAllocation) {
        allocation.gmm = None;

        let host_memory = allocation.allocation_type == AllocationType::BufferHostMemory
            && allocation.driver_allocated.is_some();
        if host_memory {
            self.remove_allocation_from_host_ptr_manager(allocation);
        }

        if allocation.fragments.is_empty() {
            for bo in allocation.bos.drain(..) {
                self.release_bo(bo, host_memory);
            }
        } else {
            self.clean_graphics_memory_created_from_host_ptr(allocation);
        }

        if let Some(ReservedRange { base, size }) = allocation.reserved.take() {
            self.partition.free_gpu_address_range(base, size);
        }
        allocation.driver_allocated = None;
    }

    fn release_bo(&self, bo: Arc<BufferObject>, may_have_other_holders: bool) {
        if bo.is_reused() || may_have_other_holders {
            self.registry.unreference(&bo, false);
        } else if let Some(worker) = &self.close_worker {
            worker.push(bo);
        } else {
            self.registry.unreference(&bo, true);
        }
    }

    fn clean_graphics_memory_created_from_host_ptr(&self, allocation: &mut GraphicsAllocation) {
        {
            let mut map = self.host_ptr_manager.lock();
            for fragment in allocation
                .fragments
                .fragments
                .iter_mut()
                .filter(|f| f.bo.is_some())
            {
                if map.release_host_ptr(fragment.cpu_ptr) {
                    fragment.free_the_fragment = true;
                }
            }
        }
        self.clean_os_handles(&mut allocation.fragments);
        allocation.fragments.fragments.clear();
    }

    /// Drops this allocation's claim on every fragment; fragments whose last
    /// claim this was are waited on and closed.
    fn clean_os_handles(&self, storage: &mut OsHandleStorage) {
        for fragment in &mut storage.fragments {
            let Some(bo) = fragment.bo.take() else {
                continue;
            };
            if fragment.free_the_fragment {
                if let Err(e) = bo.wait(None) {
                    tracing::warn!(handle = bo.handle(), error = %e, "waiting for GPU idle failed");
                }
                let previous = self.registry.unreference(&bo, true);
                debug_assert_eq!(previous, 1);
            } else {
                self.registry.unreference(&bo, false);
            }
        }
    }

    fn add_allocation_to_host_ptr_manager(&self, allocation: &GraphicsAllocation) {
        let Some(bo) = allocation.bo() else {
            return;
        };
        // The fragment's claim holds its own reference.
        bo.reference();
        self.host_ptr_manager.store_fragment(FragmentStorage {
            cpu_ptr: allocation.cpu_ptr,
            size: align_up_usize(allocation.size, PAGE_SIZE),
            ref_count: 1,
            bo: Some(Arc::clone(bo)),
            residency: Arc::clone(&allocation.residency),
            driver_allocation: true,
        });
    }

    fn remove_allocation_from_host_ptr_manager(&self, allocation: &GraphicsAllocation) {
        let claim = {
            let mut map = self.host_ptr_manager.lock();
            match map.get_fragment(allocation.cpu_ptr) {
                Some(fragment) if fragment.driver_allocation => {
                    let bo = fragment.bo.clone();
                    map.release_host_ptr(allocation.cpu_ptr);
                    bo
                }
                _ => None,
            }
        };
        if let Some(bo) = claim {
            self.registry.unreference(&bo, false);
        }
    }

    // ===========================================================================================
    // Helpers
    // ===========================================================================================

    /// Runs a construction step; on failure the partially built allocation goes
    /// through the regular teardown before the error is returned.
    fn build<F>(&self, mut allocation: GraphicsAllocation, construct: F) -> GfxResult<GraphicsAllocation>
    where
        F: FnOnce(&mut GraphicsAllocation) -> GfxResult<()>,
    {
        match construct(&mut allocation) {
            Ok(()) => Ok(allocation),
            Err(e) => {
                tracing::debug!(
                    allocation_type = ?allocation.allocation_type,
                    size = allocation.size,
                    error = %e,
                    "allocation failed"
                );
                self.release_allocation_resources(&mut allocation);
                Err(e)
            }
        }
    }

    /// Reserves a range for the allocation and returns its decanonized base.
    fn reserve(
        &self,
        allocation: &mut GraphicsAllocation,
        heap: HeapIndex,
        size: u64,
        align: u64,
    ) -> GfxResult<u64> {
        let (base, reserved) = self.partition.heap_allocate(heap, size, align)?;
        allocation.reserved = Some(ReservedRange {
            base,
            size: reserved,
        });
        Ok(base)
    }

    fn create_userptr_bo(
        &self,
        address: usize,
        size: usize,
        gpu_address: u64,
        validate: bool,
    ) -> GfxResult<Arc<BufferObject>> {
        let desc = BackingDescriptor::UserPtr {
            address,
            size,
            validate,
        };
        let info = self.driver.create_backing(&desc).map_err(|e| match e {
            KmdError::InvalidHostPointer => GfxError::InvalidHostPointer { address, size },
            other => GfxError::from(other),
        })?;

        let bo = Arc::new(BufferObject::new(
            Arc::clone(&self.driver),
            info.handle,
            info.size,
            gpu_address,
        ));
        if let Err(e) = self.map_gpu_va(&bo) {
            self.registry.unreference(&bo, false);
            return Err(e);
        }
        Ok(bo)
    }

    fn map_gpu_va(&self, bo: &BufferObject) -> GfxResult<()> {
        let range = GpuRange {
            base: decanonize(bo.gpu_address()),
            size: bo.size() as u64,
        };
        match self.driver.map_virtual_address(bo.handle(), range) {
            Ok(completion) => {
                self.paging.track(completion);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    handle = bo.handle(),
                    gpu_va = format_args!("{:#x}", range.base),
                    size = range.size,
                    error = %e,
                    "mapping GPU virtual address failed"
                );
                Err(e.into())
            }
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if let Some(worker) = self.close_worker.take() {
            worker.close(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmd::SimulatedKmd;
    use crate::kmd::sim::SimConfig;
    use crate::memory::gmm::ImageDescriptor;
    use crate::utils::MB;

    fn manager_with(kmd: &Arc<SimulatedKmd>, config: MemoryManagerConfig) -> MemoryManager {
        let driver: Arc<dyn KernelDriver> = kmd.clone();
        MemoryManager::new(driver, config).unwrap()
    }

    fn manager(kmd: &Arc<SimulatedKmd>) -> MemoryManager {
        manager_with(kmd, MemoryManagerConfig::new().close_worker(CloseWorkerMode::Inactive))
    }

    #[test]
    fn svm_allocation_uses_cpu_address() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let allocation = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::Buffer, 100))
            .unwrap();
        assert_eq!(allocation.gpu_address(), allocation.cpu_ptr() as u64);
        assert!(allocation.reserved_range().is_none());
        assert!(allocation.is_driver_allocated());
        assert_eq!(allocation.bo().unwrap().size(), PAGE_SIZE);

        mm.free_graphics_memory(allocation);
        assert_eq!(kmd.live_backings(), 0);
    }

    #[test]
    fn svm_cpu_allocation_is_padded_and_aligned() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let allocation = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::SvmCpu, 3 * MB as usize))
            .unwrap();
        let reserved = allocation.reserved_range().unwrap();
        assert_eq!(reserved.size, 4 * MB + 2 * MB);
        assert_eq!(decanonize(allocation.gpu_address()) % (2 * MB), 0);
        assert!(decanonize(allocation.gpu_address()) + 3 * MB <= reserved.base + reserved.size);

        mm.free_graphics_memory(allocation);
        assert_eq!(mm.partition().heap_allocation_count(HeapIndex::Standard), 0);
    }

    #[test]
    fn kernel_isa_lands_in_internal_heap() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let allocation = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::KernelIsa, 4096))
            .unwrap();
        let base = mm.partition().heap_base(HeapIndex::Internal);
        assert_eq!(allocation.gpu_base_address(), canonize(base));
        assert_eq!(
            allocation.memory_pool(),
            MemoryPool::System4KBPagesWith32BitGpuAddressing
        );
        assert!(allocation.gpu_address_to_patch() < 4 * crate::utils::GB);
        mm.free_graphics_memory(allocation);
    }

    #[test]
    fn forced_32bit_host_ptr_keeps_offset() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager_with(
            &kmd,
            MemoryManagerConfig::new()
                .force_32bit_allocations()
                .close_worker(CloseWorkerMode::Inactive),
        );

        let host_ptr = 0x7000_0000 + 0x10;
        let allocation = mm
            .allocate_graphics_memory(
                &AllocationData::new(AllocationType::ExternalHostPtr, 64).host_ptr(host_ptr),
            )
            .unwrap();
        let reserved = allocation.reserved_range().unwrap();
        assert_eq!(allocation.gpu_address(), canonize(reserved.base + 0x10));
        assert_eq!(allocation.allocation_offset(), 0x10);
        assert_eq!(allocation.cpu_ptr() as usize, host_ptr);
        assert_eq!(
            allocation.gpu_base_address(),
            canonize(mm.partition().heap_base(HeapIndex::External))
        );
        mm.free_graphics_memory(allocation);
        assert_eq!(mm.partition().heap_allocation_count(HeapIndex::External), 0);
    }

    #[test]
    fn tiled_image_gets_device_memory() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let allocation = mm
            .allocate_graphics_memory(
                &AllocationData::new(AllocationType::Image, 0)
                    .image(ImageDescriptor::new_2d(256, 256, 4)),
            )
            .unwrap();
        assert!(allocation.cpu_ptr().is_null());
        assert_eq!(allocation.memory_pool(), MemoryPool::SystemCpuInaccessible);
        let bo = allocation.bo().unwrap();
        assert_eq!(kmd.get_tiling(bo.handle()).unwrap(), TilingMode::Y);
        assert_eq!(allocation.gmm().unwrap().row_pitch, 1024);

        let cpu = mm.lock_resource(&allocation).unwrap();
        assert!(!cpu.is_null());
        assert!(kmd.is_resident(bo.handle()));
        mm.unlock_resource(&allocation).unwrap();
        mm.free_graphics_memory(allocation);
        assert_eq!(kmd.live_backings(), 0);
    }

    #[test]
    fn linear_image_takes_the_generic_path() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let allocation = mm
            .allocate_graphics_memory(
                &AllocationData::new(AllocationType::Image, 0)
                    .image(ImageDescriptor::new_2d(64, 64, 4).linear()),
            )
            .unwrap();
        assert!(!allocation.cpu_ptr().is_null());
        assert!(allocation.gmm().unwrap().linear);
        mm.free_graphics_memory(allocation);
    }

    #[test]
    fn failed_map_releases_everything() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager_with(
            &kmd,
            MemoryManagerConfig::new()
                .limited_range_allocations()
                .close_worker(CloseWorkerMode::Inactive),
        );

        kmd.fail_next_map(KmdError::OutOfMemory);
        let err = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::Buffer, 4096))
            .unwrap_err();
        assert!(matches!(err, GfxError::OutOfMemory));
        assert_eq!(kmd.live_backings(), 0);
        assert_eq!(mm.partition().heap_allocation_count(HeapIndex::Standard), 0);
    }

    #[test]
    fn padded_allocation_covers_padding() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let input = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::Buffer, 4096))
            .unwrap();
        let padded = mm.create_padded_allocation(&input, 3 * PAGE_SIZE).unwrap();
        assert_eq!(padded.cpu_ptr(), input.cpu_ptr());
        assert_eq!(padded.size(), 3 * PAGE_SIZE);
        assert_eq!(padded.reserved_range().unwrap().size, 3 * PAGE_SIZE as u64);
        assert!(!Arc::ptr_eq(padded.bo().unwrap(), input.bo().unwrap()));

        mm.free_graphics_memory(padded);
        mm.free_graphics_memory(input);
        assert_eq!(kmd.live_backings(), 0);
    }

    #[test]
    fn host_memory_buffers_are_reused_as_fragments() {
        let kmd = Arc::new(SimulatedKmd::default());
        let mm = manager(&kmd);

        let host = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::BufferHostMemory, 4096))
            .unwrap();
        let creates = kmd.stats().creates;

        let wrapped = mm
            .allocate_graphics_memory(
                &AllocationData::new(AllocationType::ExternalHostPtr, 4096)
                    .host_ptr(host.cpu_ptr() as usize),
            )
            .unwrap();
        assert_eq!(kmd.stats().creates, creates);
        assert!(Arc::ptr_eq(
            wrapped.fragments().fragments[0].bo.as_ref().unwrap(),
            host.bo().unwrap()
        ));

        mm.free_graphics_memory(wrapped);
        assert!(kmd.is_live(host.bo().unwrap().handle()));
        mm.free_graphics_memory(host);
        assert_eq!(kmd.live_backings(), 0);
        assert_eq!(mm.host_ptr_manager().fragment_count(), 0);
    }

    #[test]
    fn pending_map_is_tracked_on_the_paging_fence() {
        let kmd = Arc::new(SimulatedKmd::new(SimConfig::default().pending_residency()));
        let mm = manager_with(
            &kmd,
            MemoryManagerConfig::new()
                .gpu_address_bits(47)
                .close_worker(CloseWorkerMode::Inactive),
        );

        let allocation = mm
            .allocate_graphics_memory(&AllocationData::new(AllocationType::Buffer, 4096))
            .unwrap();
        assert_eq!(mm.paging_fence_tracker().current(), kmd.last_paging_fence());
        mm.free_graphics_memory(allocation);
    }
}
