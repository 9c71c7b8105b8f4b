//! GPU memory management for a compute driver.
//!
//! [`memory::MemoryManager`] turns allocation requests into kernel backing
//! objects with GPU virtual addresses. It talks to the kernel only through
//! [`kmd::KernelDriver`].

pub mod error;
pub mod kmd;
pub mod memory;
pub mod utils;

pub use error::{GfxError, GfxResult};
pub use memory::{AllocationData, AllocationType, GraphicsAllocation, MemoryManager};
