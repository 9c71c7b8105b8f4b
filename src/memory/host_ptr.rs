//! Host-pointer fragment tracking.
//!
//! A host range handed to the driver is split into page-aligned fragments:
//! the partial leading page, the whole middle pages and the partial trailing
//! page. Each fragment gets one backing buffer object, shared by every
//! allocation that covers the same pages.

use crate::error::{GfxError, GfxResult};
use crate::memory::buffer_object::BufferObject;
use crate::memory::residency::ResidencyData;
use crate::utils::{PAGE_SIZE, align_down_usize};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const MAX_FRAGMENTS: usize = 3;

/// A page-aligned slice of a host range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRange {
    pub cpu_ptr: usize,
    pub size: usize,
}

impl FragmentRange {
    const fn end(&self) -> usize {
        self.cpu_ptr + self.size
    }

    const fn overlaps(&self, other: &Self) -> bool {
        self.cpu_ptr < other.end() && other.cpu_ptr < self.end()
    }
}

/// Splits `[host_ptr, host_ptr + size)` into at most three page-aligned fragments.
#[must_use]
pub fn allocation_requirements(host_ptr: usize, size: usize) -> Vec<FragmentRange> {
    let mut fragments = Vec::with_capacity(MAX_FRAGMENTS);
    let end = host_ptr + size;
    let aligned_end = align_down_usize(end, PAGE_SIZE);
    let mut cursor = align_down_usize(host_ptr, PAGE_SIZE);

    if cursor != host_ptr {
        fragments.push(FragmentRange {
            cpu_ptr: cursor,
            size: PAGE_SIZE,
        });
        cursor += PAGE_SIZE;
    }
    if aligned_end > cursor {
        fragments.push(FragmentRange {
            cpu_ptr: cursor,
            size: aligned_end - cursor,
        });
        cursor = aligned_end;
    }
    if end > cursor {
        fragments.push(FragmentRange {
            cpu_ptr: cursor,
            size: PAGE_SIZE,
        });
    }
    fragments
}

/// A registered fragment.
#[derive(Debug, Clone)]
pub struct FragmentStorage {
    pub cpu_ptr: usize,
    pub size: usize,
    /// Number of allocations currently claiming the fragment.
    pub ref_count: u32,
    pub bo: Option<Arc<BufferObject>>,
    pub residency: Arc<ResidencyData>,
    /// The fragment is the CPU backing of a driver-owned allocation.
    pub driver_allocation: bool,
}

/// One fragment as seen by a single allocation.
#[derive(Debug, Clone, Default)]
pub struct FragmentHandle {
    pub cpu_ptr: usize,
    pub size: usize,
    pub bo: Option<Arc<BufferObject>>,
    pub residency: Arc<ResidencyData>,
    /// Was already registered when the allocation was prepared.
    pub reused: bool,
    /// The backing must be released by the next `clean_os_handles`.
    pub free_the_fragment: bool,
}

/// The fragments backing one host-pointer allocation.
#[derive(Debug, Clone, Default)]
pub struct OsHandleStorage {
    pub fragments: Vec<FragmentHandle>,
}

impl OsHandleStorage {
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// The fragment table. Obtain it through [`HostPtrManager::lock`] when several
/// steps must appear atomic to other threads.
#[derive(Debug, Default)]
pub struct FragmentMap {
    // Fragment CPU address -> storage
    fragments: BTreeMap<usize, FragmentStorage>,
}

impl FragmentMap {
    #[must_use]
    pub fn get_fragment(&self, cpu_ptr: usize) -> Option<&FragmentStorage> {
        self.fragments.get(&cpu_ptr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Registers a fragment, or claims an identical one already registered.
    pub fn store_fragment(&mut self, fragment: FragmentStorage) {
        if let Some(existing) = self.fragments.get_mut(&fragment.cpu_ptr) {
            if existing.size == fragment.size {
                existing.ref_count += 1;
                return;
            }
        }
        self.fragments.insert(fragment.cpu_ptr, FragmentStorage {
            ref_count: fragment.ref_count.max(1),
            ..fragment
        });
    }

    /// Drops one claim on the fragment at `cpu_ptr`. Returns `true` when that
    /// was the last claim and the fragment is gone.
    pub fn release_host_ptr(&mut self, cpu_ptr: usize) -> bool {
        let Some(fragment) = self.fragments.get_mut(&cpu_ptr) else {
            tracing::warn!(cpu_ptr = format_args!("{cpu_ptr:#x}"), "releasing unknown fragment");
            return false;
        };
        fragment.ref_count -= 1;
        if fragment.ref_count == 0 {
            self.fragments.remove(&cpu_ptr);
            return true;
        }
        false
    }

    /// Resolves the fragments of a host range against the table.
    ///
    /// Fragments identical to a registered one are claimed and carry its buffer
    /// object; the rest come back without one for the caller to populate. A
    /// range that partially overlaps a registered fragment cannot be
    /// represented and is rejected.
    ///
    /// # Errors
    /// `InvalidHostPointer` on a partial overlap.
    pub fn prepare_os_storage(
        &mut self,
        host_ptr: usize,
        size: usize,
    ) -> GfxResult<OsHandleStorage> {
        let mut storage = OsHandleStorage::default();

        for range in allocation_requirements(host_ptr, size) {
            // Registered fragments never overlap each other, so only the last one
            // starting below the end of `range` can intersect it.
            let overlap = self
                .fragments
                .range(..range.end())
                .next_back()
                .map(|(_, f)| FragmentRange {
                    cpu_ptr: f.cpu_ptr,
                    size: f.size,
                })
                .filter(|f| f.overlaps(&range));

            match overlap {
                Some(existing) if existing == range => {
                    let fragment = self
                        .fragments
                        .get_mut(&existing.cpu_ptr)
                        .ok_or(GfxError::InvalidHostPointer {
                            address: host_ptr,
                            size,
                        })?;
                    fragment.ref_count += 1;
                    storage.fragments.push(FragmentHandle {
                        cpu_ptr: existing.cpu_ptr,
                        size: existing.size,
                        bo: fragment.bo.clone(),
                        residency: Arc::clone(&fragment.residency),
                        reused: true,
                        free_the_fragment: false,
                    });
                }
                Some(existing) => {
                    tracing::debug!(
                        host_ptr = format_args!("{host_ptr:#x}"),
                        size,
                        fragment = format_args!("{:#x}", existing.cpu_ptr),
                        fragment_size = existing.size,
                        "host range partially overlaps a registered fragment"
                    );
                    self.release_handle_storage(&storage);
                    return Err(GfxError::InvalidHostPointer {
                        address: host_ptr,
                        size,
                    });
                }
                None => storage.fragments.push(FragmentHandle {
                    cpu_ptr: range.cpu_ptr,
                    size: range.size,
                    ..Default::default()
                }),
            }
        }
        Ok(storage)
    }

    /// Undoes the claims `prepare_os_storage` made on already registered fragments.
    pub fn release_handle_storage(&mut self, storage: &OsHandleStorage) {
        for fragment in storage.fragments.iter().filter(|f| f.reused) {
            self.release_host_ptr(fragment.cpu_ptr);
        }
    }
}

/// Thread-safe owner of the fragment table.
#[derive(Debug, Default)]
pub struct HostPtrManager {
    map: Mutex<FragmentMap>,
}

impl HostPtrManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, FragmentMap> {
        self.map.lock()
    }

    pub fn store_fragment(&self, fragment: FragmentStorage) {
        self.map.lock().store_fragment(fragment);
    }

    #[must_use]
    pub fn get_fragment(&self, cpu_ptr: usize) -> Option<FragmentStorage> {
        self.map.lock().get_fragment(cpu_ptr).cloned()
    }

    pub fn release_host_ptr(&self, cpu_ptr: usize) -> bool {
        self.map.lock().release_host_ptr(cpu_ptr)
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.map.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PAGE: usize = PAGE_SIZE;

    fn fragment(cpu_ptr: usize, size: usize) -> FragmentStorage {
        FragmentStorage {
            cpu_ptr,
            size,
            ref_count: 1,
            bo: None,
            residency: Arc::default(),
            driver_allocation: false,
        }
    }

    #[test]
    fn unaligned_range_inside_one_page() {
        let fragments = allocation_requirements(0x10_0000 + 37, 4000);
        assert_eq!(fragments, vec![FragmentRange {
            cpu_ptr: 0x10_0000,
            size: PAGE,
        }]);
    }

    #[test]
    fn leading_middle_and_trailing() {
        let fragments = allocation_requirements(0x10_0000 + 100, 3 * PAGE);
        assert_eq!(fragments, vec![
            FragmentRange {
                cpu_ptr: 0x10_0000,
                size: PAGE
            },
            FragmentRange {
                cpu_ptr: 0x10_0000 + PAGE,
                size: 2 * PAGE
            },
            FragmentRange {
                cpu_ptr: 0x10_0000 + 3 * PAGE,
                size: PAGE
            },
        ]);
    }

    #[test]
    fn aligned_range_is_one_fragment() {
        let fragments = allocation_requirements(0x10_0000, 2 * PAGE);
        assert_eq!(fragments, vec![FragmentRange {
            cpu_ptr: 0x10_0000,
            size: 2 * PAGE,
        }]);
    }

    #[test]
    fn identical_pages_are_claimed_not_duplicated() {
        let mut map = FragmentMap::default();
        map.store_fragment(fragment(0x10_0000, PAGE));

        let storage = map.prepare_os_storage(0x10_0000 + 64, 128).unwrap();
        assert_eq!(storage.fragment_count(), 1);
        assert!(storage.fragments[0].reused);
        assert_eq!(map.get_fragment(0x10_0000).unwrap().ref_count, 2);

        assert!(!map.release_host_ptr(0x10_0000));
        assert!(map.release_host_ptr(0x10_0000));
        assert!(map.is_empty());
    }

    #[test]
    fn partial_overlap_is_rejected_and_claims_undone() {
        let mut map = FragmentMap::default();
        map.store_fragment(fragment(0x10_0000, PAGE));
        map.store_fragment(fragment(0x10_0000 + 2 * PAGE, 2 * PAGE));

        // Leading page matches; the middle pages collide with the second fragment.
        let err = map.prepare_os_storage(0x10_0000 + 8, 2 * PAGE).unwrap_err();
        assert!(matches!(err, GfxError::InvalidHostPointer { .. }));
        assert_eq!(map.get_fragment(0x10_0000).unwrap().ref_count, 1);

        let err = map.prepare_os_storage(0x10_0000 + 3 * PAGE, PAGE).unwrap_err();
        assert!(matches!(err, GfxError::InvalidHostPointer { .. }));
    }

    #[test]
    fn disjoint_ranges_need_new_fragments() {
        let mut map = FragmentMap::default();
        map.store_fragment(fragment(0x10_0000, PAGE));

        let storage = map.prepare_os_storage(0x20_0000, PAGE).unwrap();
        assert_eq!(storage.fragment_count(), 1);
        assert!(!storage.fragments[0].reused);
        assert!(storage.fragments[0].bo.is_none());
    }

    proptest! {
        #[test]
        fn fragments_cover_the_range_in_whole_pages(
            offset in 0usize..PAGE,
            size in 1usize..(16 * PAGE),
        ) {
            let host_ptr = 0x4000_0000 + offset;
            let fragments = allocation_requirements(host_ptr, size);

            prop_assert!(!fragments.is_empty() && fragments.len() <= MAX_FRAGMENTS);
            prop_assert_eq!(fragments[0].cpu_ptr, align_down_usize(host_ptr, PAGE));
            for pair in fragments.windows(2) {
                prop_assert_eq!(pair[0].end(), pair[1].cpu_ptr);
            }
            let last = fragments[fragments.len() - 1];
            prop_assert!(last.end() >= host_ptr + size);
            prop_assert!(last.end() - (host_ptr + size) < PAGE);
            for f in &fragments {
                prop_assert_eq!(f.cpu_ptr % PAGE, 0);
                prop_assert_eq!(f.size % PAGE, 0);
            }
        }
    }
}
