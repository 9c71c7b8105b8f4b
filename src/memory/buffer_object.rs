use crate::error::unrecoverable;
use crate::kmd::{
    BackingHandle, ExternalHandle, GpuRange, KernelDriver, KmdResult, TilingMode, WaitStatus,
};
use parking_lot::Mutex;
use std::fmt;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// Spins on the reference count before yielding the CPU.
const EXCLUSIVE_SPIN_LIMIT: u32 = 1024;

/// One kernel backing object with a GPU virtual address.
///
/// The reference count is the logical ownership count seen by the memory
/// manager and starts at one. The kernel handle is closed exactly once, when
/// the count drops from one to zero. `Arc` only keeps the bookkeeping alive
/// for holders that still need to read it.
pub struct BufferObject {
    driver: Arc<dyn KernelDriver>,
    handle: BackingHandle,
    size: usize,
    gpu_address: u64,
    tiling: TilingMode,
    /// Range owned by the object itself (imported objects only).
    reserved: Option<GpuRange>,

    ref_count: AtomicU32,
    reused: AtomicBool,
    closed: AtomicBool,
    locked_address: Mutex<Option<usize>>,
    external_handles: Mutex<Vec<ExternalHandle>>,
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("reused", &self.reused.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    /// `gpu_address` is canonical.
    #[must_use]
    pub fn new(
        driver: Arc<dyn KernelDriver>,
        handle: BackingHandle,
        size: usize,
        gpu_address: u64,
    ) -> Self {
        Self {
            driver,
            handle,
            size,
            gpu_address,
            tiling: TilingMode::None,
            reserved: None,
            ref_count: AtomicU32::new(1),
            reused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            locked_address: Mutex::new(None),
            external_handles: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_tiling(mut self, tiling: TilingMode) -> Self {
        self.tiling = tiling;
        self
    }

    /// Hands a decanonized GPU range to the object; it is released when the
    /// object leaves the shared-handle registry.
    #[must_use]
    pub fn with_reserved_range(mut self, range: GpuRange) -> Self {
        self.reserved = Some(range);
        self
    }

    #[must_use]
    pub const fn handle(&self) -> BackingHandle {
        self.handle
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    #[must_use]
    pub const fn tiling(&self) -> TilingMode {
        self.tiling
    }

    #[must_use]
    pub const fn reserved_range(&self) -> Option<GpuRange> {
        self.reserved
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_reused(&self) {
        self.reused.store(true, Ordering::Release);
    }

    /// Adds a holder. Must not be called on an object whose count already
    /// reached zero.
    pub fn reference(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one holder and returns the count before the decrement.
    pub(crate) fn release_reference(&self) -> u32 {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            unrecoverable("buffer object reference count underflow");
        }
        previous
    }

    /// Blocks until the caller is the only remaining holder.
    pub(crate) fn wait_exclusive(&self) {
        let mut spins = 0u32;
        while self.ref_count.load(Ordering::Acquire) > 1 {
            if spins < EXCLUSIVE_SPIN_LIMIT {
                hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    /// Releases the kernel handle, any CPU mapping and the external handles the
    /// object was imported through.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            unrecoverable("buffer object closed twice");
        }

        if let Some(address) = self.locked_address.lock().take() {
            if let Err(e) = self.driver.unlock(self.handle, address, self.size) {
                tracing::warn!(handle = self.handle, error = %e, "unlock on close failed");
            }
        }
        if let Err(e) = self.driver.destroy_backing(self.handle) {
            tracing::warn!(handle = self.handle, error = %e, "destroying backing failed");
        }
        for external in self.external_handles.lock().drain(..) {
            if let Err(e) = self.driver.close_external_handle(external) {
                tracing::warn!(external, error = %e, "closing external handle failed");
            }
        }
        tracing::trace!(handle = self.handle, "buffer object closed");
    }

    /// Waits for GPU work on the object. `None` waits without a deadline.
    ///
    /// # Errors
    /// Propagates the kernel driver's error.
    pub fn wait(&self, timeout: Option<Duration>) -> KmdResult<WaitStatus> {
        self.driver.wait_idle(self.handle, timeout)
    }

    // ===========================================================================================
    // CPU mapping
    // ===========================================================================================

    #[must_use]
    pub fn locked_address(&self) -> Option<usize> {
        *self.locked_address.lock()
    }

    /// Maps the object for CPU access, reusing an existing mapping.
    pub(crate) fn lock(&self) -> KmdResult<usize> {
        let mut locked = self.locked_address.lock();
        if let Some(address) = *locked {
            return Ok(address);
        }
        let address = self.driver.lock(self.handle, self.size)?;
        *locked = Some(address);
        Ok(address)
    }

    pub(crate) fn unlock(&self) -> KmdResult<()> {
        match self.locked_address.lock().take() {
            Some(address) => self.driver.unlock(self.handle, address, self.size),
            None => Ok(()),
        }
    }

    // ===========================================================================================
    // External handles
    // ===========================================================================================

    pub(crate) fn add_external_handle(&self, external: ExternalHandle) {
        let mut handles = self.external_handles.lock();
        if !handles.contains(&external) {
            handles.push(external);
        }
    }

    #[must_use]
    pub fn was_imported_through(&self, external: ExternalHandle) -> bool {
        self.external_handles.lock().contains(&external)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmd::{BackingDescriptor, SimulatedKmd};

    fn device_object(kmd: &Arc<SimulatedKmd>, size: usize) -> BufferObject {
        let info = kmd.create_backing(&BackingDescriptor::Device { size }).unwrap();
        let driver: Arc<dyn KernelDriver> = kmd.clone();
        BufferObject::new(driver, info.handle, info.size, 0x10_0000)
    }

    #[test]
    fn reference_counting() {
        let kmd = Arc::new(SimulatedKmd::default());
        let bo = device_object(&kmd, 4096);
        assert_eq!(bo.ref_count(), 1);
        bo.reference();
        assert_eq!(bo.release_reference(), 2);
        assert_eq!(bo.release_reference(), 1);
        assert_eq!(bo.ref_count(), 0);
    }

    #[test]
    fn close_destroys_backing_and_mapping() {
        let kmd = Arc::new(SimulatedKmd::default());
        let bo = device_object(&kmd, 4096);
        let address = bo.lock().unwrap();
        assert_eq!(bo.lock().unwrap(), address);
        assert_eq!(kmd.stats().locks, 1);

        bo.close();
        assert!(bo.is_closed());
        assert!(!kmd.is_live(bo.handle()));
        assert_eq!(bo.locked_address(), None);
    }

    #[test]
    fn close_releases_every_external_handle_once() {
        let kmd = Arc::new(SimulatedKmd::default());
        let external = kmd.create_shared_object(8192, TilingMode::None);
        let dup = kmd.duplicate_external(external).unwrap();
        let shared = kmd.open_shared_handle(external).unwrap();

        let driver: Arc<dyn KernelDriver> = kmd.clone();
        let bo = BufferObject::new(driver, shared.handle, shared.size, 0);
        bo.add_external_handle(external);
        bo.add_external_handle(dup);
        bo.add_external_handle(external);
        assert!(bo.was_imported_through(dup));

        bo.close();
        assert_eq!(kmd.stats().external_closes, 2);
        assert!(!kmd.is_external_open(external));
        assert!(!kmd.is_external_open(dup));
    }

    #[test]
    fn exclusive_wait_returns_once_other_holders_leave() {
        let kmd = Arc::new(SimulatedKmd::default());
        let bo = Arc::new(device_object(&kmd, 4096));
        bo.reference();

        let other = Arc::clone(&bo);
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.release_reference();
        });

        bo.wait_exclusive();
        assert_eq!(bo.ref_count(), 1);
        holder.join().unwrap();
    }
}
