//! Kernel-mode driver interface.
//!
//! The memory layer talks to the kernel only through [`KernelDriver`]. Two
//! implementations exist: [`DrmDevice`] for i915-style DRM render nodes, where
//! the kernel manages residency itself, and [`SimulatedKmd`], an in-process
//! model of a driver with explicit residency and paging fences.

pub mod device;
pub mod fence;
pub mod ioctl;
pub mod sim;
pub mod status;

pub use device::DrmDevice;
pub use fence::{FenceCounter, WaitStatus};
pub use sim::SimulatedKmd;
pub use status::{KmdError, KmdResult};

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Kernel handle of one backing object (GEM handle / D3DKMT allocation handle).
pub type BackingHandle = u32;

/// Handle of an externally shared object (dma-buf fd / global share handle).
pub type ExternalHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TilingMode {
    #[default]
    None,
    X,
    Y,
}

/// A GPU virtual address range in decanonized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuRange {
    pub base: u64,
    pub size: u64,
}

/// What the kernel should back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingDescriptor {
    /// Wrap existing, page-aligned CPU memory.
    UserPtr {
        address: usize,
        size: usize,
        /// Ask the kernel to fault the pages in now and fail on invalid memory.
        validate: bool,
    },
    /// Kernel-allocated memory without a CPU pointer.
    Device { size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingInfo {
    pub handle: BackingHandle,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedBacking {
    pub handle: BackingHandle,
    pub size: usize,
}

/// Outcome of an operation the kernel may finish asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    /// Finished once the paging fence reaches the value.
    Pending(u64),
}

/// A failed make-resident request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidencyFailure {
    pub error: KmdError,
    /// How much the kernel wants the caller to evict before retrying.
    pub bytes_to_trim: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRange {
    pub base: u64,
    pub limit: u64,
}

impl HeapRange {
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.limit - self.base + 1
    }
}

/// Address-space layout negotiated with drivers that dictate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceInfo {
    pub svm: Option<HeapRange>,
    /// Start of the two consecutive 4GB windows used by the 32-bit heaps.
    pub heap32_base: u64,
    pub standard: HeapRange,
    pub standard64kb: HeapRange,
}

/// The narrow request/response contract between the memory manager and the kernel.
pub trait KernelDriver: Send + Sync + Debug {
    fn create_backing(&self, desc: &BackingDescriptor) -> KmdResult<BackingInfo>;

    fn destroy_backing(&self, handle: BackingHandle) -> KmdResult<()>;

    fn map_virtual_address(&self, handle: BackingHandle, range: GpuRange)
    -> KmdResult<Completion>;

    /// `cant_trim_further` marks the request as must-succeed.
    fn make_resident(
        &self,
        handles: &[BackingHandle],
        cant_trim_further: bool,
    ) -> Result<Completion, ResidencyFailure>;

    /// Returns the number of bytes reclaimed.
    fn evict(&self, handles: &[BackingHandle]) -> KmdResult<u64>;

    fn open_shared_handle(&self, external: ExternalHandle) -> KmdResult<SharedBacking>;

    fn close_external_handle(&self, external: ExternalHandle) -> KmdResult<()>;

    fn set_tiling(&self, handle: BackingHandle, mode: TilingMode, stride: u32) -> KmdResult<()>;

    fn get_tiling(&self, handle: BackingHandle) -> KmdResult<TilingMode>;

    /// Waits for outstanding GPU work on `handle`. `None` waits forever.
    fn wait_idle(&self, handle: BackingHandle, timeout: Option<Duration>)
    -> KmdResult<WaitStatus>;

    /// Maps the backing into the CPU address space.
    fn lock(&self, handle: BackingHandle, size: usize) -> KmdResult<usize>;

    fn unlock(&self, handle: BackingHandle, address: usize, size: usize) -> KmdResult<()>;

    fn create_monitored_fence(&self) -> KmdResult<Arc<FenceCounter>>;

    /// Counter the kernel advances as paging operations retire.
    fn paging_fence(&self) -> Arc<FenceCounter>;

    /// Layout imposed by the kernel, if any.
    fn address_space(&self) -> Option<AddressSpaceInfo> {
        None
    }

    fn system_shared_memory(&self) -> u64;
}
