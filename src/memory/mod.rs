pub mod allocation;
pub mod buffer_object;
pub mod close_worker;
pub mod config;
pub mod gmm;
pub mod host_ptr;
pub mod manager;
pub mod partition;
pub mod registry;
pub mod residency;

// Re-export the main manager and the request/response types for easy access
pub use allocation::{
    AllocationData, AllocationProperties, AllocationType, GraphicsAllocation, MemoryPool,
    ReservedRange,
};
pub use buffer_object::BufferObject;
pub use close_worker::CloseWorkerMode;
pub use config::MemoryManagerConfig;
pub use gmm::{ImageDescriptor, ImageLayout, ResourceDescriber};
pub use manager::MemoryManager;
pub use partition::{GfxPartition, HeapIndex, RangeAllocator};
pub use residency::{ResidencyController, ResidencyState};
