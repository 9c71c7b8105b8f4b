//! Deduplication of buffer objects imported from shared handles.

use crate::kmd::{BackingHandle, ExternalHandle};
use crate::memory::buffer_object::BufferObject;
use crate::memory::partition::GfxPartition;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Buffer objects that more than one allocation may hold through an import.
///
/// Lookups, insertions, removals and the final reference drop of a registered
/// object all happen under one lock, so an import never observes an entry
/// that is being torn down.
#[derive(Debug)]
pub struct SharedHandleRegistry {
    objects: Mutex<Vec<Arc<BufferObject>>>,
    partition: Arc<GfxPartition>,
}

/// Exclusive access to the registry's entries.
pub struct RegistryGuard<'a> {
    objects: MutexGuard<'a, Vec<Arc<BufferObject>>>,
    partition: &'a GfxPartition,
}

impl SharedHandleRegistry {
    #[must_use]
    pub fn new(partition: Arc<GfxPartition>) -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
            partition,
        }
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            objects: self.objects.lock(),
            partition: &self.partition,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops one reference and returns the count before the drop.
    ///
    /// A synchronous release first waits until the caller is the only holder.
    /// The registry lock is taken only for registered objects; the last
    /// reference removes the object from the registry, releasing its GPU range,
    /// and closes it.
    pub fn unreference(&self, bo: &Arc<BufferObject>, synchronous: bool) -> u32 {
        if synchronous {
            bo.wait_exclusive();
        }

        let mut guard = bo.is_reused().then(|| self.lock());
        let previous = bo.release_reference();
        if previous == 1 {
            if let Some(registry) = guard.as_mut() {
                registry.erase(bo);
            }
            bo.close();
        }
        previous
    }
}

impl RegistryGuard<'_> {
    /// Finds the object already imported through `external` and adds a reference.
    #[must_use]
    pub fn find_by_external(&self, external: ExternalHandle) -> Option<Arc<BufferObject>> {
        let bo = self
            .objects
            .iter()
            .find(|bo| bo.was_imported_through(external))?;
        bo.reference();
        Some(Arc::clone(bo))
    }

    /// Finds the object with kernel handle `handle` and adds a reference.
    #[must_use]
    pub fn find(&self, handle: BackingHandle) -> Option<Arc<BufferObject>> {
        let bo = self.objects.iter().find(|bo| bo.handle() == handle)?;
        bo.reference();
        Some(Arc::clone(bo))
    }

    pub fn push(&mut self, bo: Arc<BufferObject>) {
        bo.mark_reused();
        self.objects.push(bo);
    }

    /// Removes `bo` and returns the GPU range it owns to the partition.
    pub fn erase(&mut self, bo: &Arc<BufferObject>) {
        if let Some(range) = bo.reserved_range() {
            self.partition.free_gpu_address_range(range.base, range.size);
        }
        self.objects.retain(|entry| !Arc::ptr_eq(entry, bo));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmd::{GpuRange, KernelDriver, SimulatedKmd, TilingMode};
    use crate::memory::partition::{HeapIndex, canonize};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<SimulatedKmd>, Arc<GfxPartition>, SharedHandleRegistry) {
        let kmd = Arc::new(SimulatedKmd::default());
        let partition = Arc::new(GfxPartition::init(48, None).unwrap());
        let registry = SharedHandleRegistry::new(Arc::clone(&partition));
        (kmd, partition, registry)
    }

    fn import(
        kmd: &Arc<SimulatedKmd>,
        partition: &GfxPartition,
        external: ExternalHandle,
    ) -> Arc<BufferObject> {
        let shared = kmd.open_shared_handle(external).unwrap();
        let (base, size) = partition
            .heap_allocate(HeapIndex::Standard, shared.size as u64, 0)
            .unwrap();
        let driver: Arc<dyn KernelDriver> = kmd.clone();
        let bo = BufferObject::new(driver, shared.handle, shared.size, canonize(base))
            .with_reserved_range(GpuRange { base, size });
        bo.add_external_handle(external);
        Arc::new(bo)
    }

    #[test]
    fn last_release_erases_and_frees_the_range() {
        let (kmd, partition, registry) = setup();
        let external = kmd.create_shared_object(8192, TilingMode::None);
        let bo = import(&kmd, &partition, external);
        registry.lock().push(Arc::clone(&bo));
        assert!(bo.is_reused());

        let again = registry.lock().find_by_external(external).unwrap();
        assert!(Arc::ptr_eq(&bo, &again));
        assert_eq!(bo.ref_count(), 2);

        assert_eq!(registry.unreference(&again, false), 2);
        assert_eq!(registry.len(), 1);
        assert!(kmd.is_live(bo.handle()));

        assert_eq!(registry.unreference(&bo, false), 1);
        assert!(registry.is_empty());
        assert!(!kmd.is_live(bo.handle()));
        assert!(!kmd.is_external_open(external));
        assert_eq!(partition.heap_allocation_count(HeapIndex::Standard), 0);
    }

    #[test]
    fn find_by_kernel_handle() {
        let (kmd, partition, registry) = setup();
        let external = kmd.create_shared_object(4096, TilingMode::None);
        let bo = import(&kmd, &partition, external);
        registry.lock().push(Arc::clone(&bo));

        let guard = registry.lock();
        assert!(guard.find(bo.handle() + 1).is_none());
        let found = guard.find(bo.handle()).unwrap();
        assert_eq!(found.ref_count(), 2);
    }

    #[test]
    fn synchronous_release_waits_for_other_holders() {
        let (kmd, partition, registry) = setup();
        let registry = Arc::new(registry);
        let external = kmd.create_shared_object(4096, TilingMode::None);
        let bo = import(&kmd, &partition, external);
        registry.lock().push(Arc::clone(&bo));
        bo.reference();

        let other = Arc::clone(&bo);
        let other_registry = Arc::clone(&registry);
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            // The synchronous release below must not have closed the object yet.
            assert!(!other.is_closed());
            other_registry.unreference(&other, false)
        });

        assert_eq!(registry.unreference(&bo, true), 1);
        assert!(bo.is_closed());
        assert_eq!(holder.join().unwrap(), 2);
    }
}
