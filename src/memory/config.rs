use crate::memory::close_worker::CloseWorkerMode;
use std::time::Duration;

/// Construction-time settings of a [`MemoryManager`](crate::memory::MemoryManager).
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryManagerConfig {
    /// Width of the device's virtual address space: 36, 47 or 48.
    pub gpu_address_bits: u32,
    /// Place buffers in the 32-bit External heap.
    pub force_32bit_allocations: bool,
    /// Ask the kernel to fault in and check host memory when wrapping it.
    pub validate_host_ptr_memory: bool,
    /// Always place driver-allocated memory in an explicitly reserved range
    /// instead of reusing the CPU address.
    pub limited_range_allocations: bool,
    pub close_worker: CloseWorkerMode,
    /// How long fence waits poll before blocking.
    pub fence_spin_duration: Duration,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            gpu_address_bits: 48,
            force_32bit_allocations: false,
            validate_host_ptr_memory: false,
            limited_range_allocations: false,
            close_worker: CloseWorkerMode::Active,
            fence_spin_duration: Duration::from_micros(200),
        }
    }
}

impl MemoryManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn gpu_address_bits(mut self, bits: u32) -> Self {
        self.gpu_address_bits = bits;
        self
    }

    #[must_use]
    pub const fn force_32bit_allocations(mut self) -> Self {
        self.force_32bit_allocations = true;
        self
    }

    #[must_use]
    pub const fn validate_host_ptr_memory(mut self) -> Self {
        self.validate_host_ptr_memory = true;
        self
    }

    #[must_use]
    pub const fn limited_range_allocations(mut self) -> Self {
        self.limited_range_allocations = true;
        self
    }

    #[must_use]
    pub const fn close_worker(mut self, mode: CloseWorkerMode) -> Self {
        self.close_worker = mode;
        self
    }

    #[must_use]
    pub const fn fence_spin_duration(mut self, spin: Duration) -> Self {
        self.fence_spin_duration = spin;
        self
    }

    /// Narrower address spaces have no CPU-sharable heap, so every allocation
    /// needs an explicitly reserved range.
    #[must_use]
    pub const fn uses_limited_range(&self) -> bool {
        self.limited_range_allocations || self.gpu_address_bits < 48
    }
}
