//! In-process kernel driver with explicit residency.
//!
//! Models the WDDM-style contract: device memory is committed against a budget,
//! allocations must be made resident before use, make-resident and VA mapping
//! may complete asynchronously behind a paging fence, and eviction reports the
//! bytes it reclaimed. The GPU side is driven by hand through
//! [`SimulatedKmd::retire_paging_fence`] and the fence counters it hands out.
//! Every test in the crate runs against it.

use crate::kmd::fence::{FenceCounter, WaitStatus};
use crate::kmd::status::{
    KmdError, KmdResult, STATUS_GRAPHICS_INVALID_ALLOCATION_HANDLE, STATUS_INVALID_PARAMETER,
};
use crate::kmd::{
    AddressSpaceInfo, BackingDescriptor, BackingHandle, BackingInfo, Completion, ExternalHandle,
    GpuRange, KernelDriver, ResidencyFailure, SharedBacking, TilingMode,
};
use crate::utils::GB;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Behaviour knobs for the simulated driver.
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Bytes of device memory that may be committed at once.
    pub memory_budget: u64,
    /// Bytes that may be resident at once.
    pub residency_budget: u64,
    /// Make-resident and VA mapping complete behind the paging fence.
    pub pending_residency: bool,
    pub address_space: Option<AddressSpaceInfo>,
    pub system_memory: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            memory_budget: u64::MAX,
            residency_budget: u64::MAX,
            pending_residency: false,
            address_space: None,
            system_memory: 16 * GB,
        }
    }
}

impl SimConfig {
    #[must_use]
    pub const fn memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    #[must_use]
    pub const fn residency_budget(mut self, bytes: u64) -> Self {
        self.residency_budget = bytes;
        self
    }

    #[must_use]
    pub const fn pending_residency(mut self) -> Self {
        self.pending_residency = true;
        self
    }

    #[must_use]
    pub const fn address_space(mut self, info: AddressSpaceInfo) -> Self {
        self.address_space = Some(info);
        self
    }
}

/// Call counters, for asserting on the request/response traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub creates: u64,
    pub destroys: u64,
    pub maps: u64,
    pub opens: u64,
    pub external_closes: u64,
    pub make_resident_calls: u64,
    /// Make-resident calls flagged as unable to trim further.
    pub cant_trim_requests: u64,
    pub evict_calls: u64,
    pub locks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackingKind {
    UserPtr { address: usize },
    Device,
    Imported { object: u64 },
}

#[derive(Debug)]
struct SimBacking {
    kind: BackingKind,
    size: usize,
    resident: bool,
    busy: bool,
    tiling: TilingMode,
    mapping: Option<GpuRange>,
    cpu_mirror: Option<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct Faults {
    create: Option<KmdError>,
    map: Option<KmdError>,
    make_resident: Option<KmdError>,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: BackingHandle,
    backings: HashMap<BackingHandle, SimBacking>,
    committed_bytes: u64,
    resident_bytes: u64,

    next_external: ExternalHandle,
    next_object: u64,
    /// External handle -> shared object.
    externals: HashMap<ExternalHandle, u64>,
    /// Shared object -> (size, tiling).
    objects: HashMap<u64, (usize, TilingMode)>,
    /// Shared object -> the local handle it is currently open as.
    imports: HashMap<u64, BackingHandle>,

    invalid_ranges: Vec<(usize, usize)>,
    last_paging_fence: u64,
    faults: Faults,
    stats: SimStats,
}

#[derive(Debug)]
pub struct SimulatedKmd {
    config: SimConfig,
    state: Mutex<SimState>,
    paging_fence: Arc<FenceCounter>,
}

impl Default for SimulatedKmd {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimulatedKmd {
    const FIRST_HANDLE: BackingHandle = 1;
    const FIRST_EXTERNAL: ExternalHandle = 100;

    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState {
                next_handle: Self::FIRST_HANDLE,
                next_external: Self::FIRST_EXTERNAL,
                ..Default::default()
            }),
            paging_fence: Arc::new(FenceCounter::new(0)),
        }
    }

    // ===========================================================================================
    // Test & GPU-side hooks
    // ===========================================================================================

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Host memory in `[address, address + size)` fails validation.
    pub fn add_invalid_host_range(&self, address: usize, size: usize) {
        self.state.lock().invalid_ranges.push((address, size));
    }

    pub fn fail_next_create(&self, error: KmdError) {
        self.state.lock().faults.create = Some(error);
    }

    pub fn fail_next_map(&self, error: KmdError) {
        self.state.lock().faults.map = Some(error);
    }

    pub fn fail_next_make_resident(&self, error: KmdError) {
        self.state.lock().faults.make_resident = Some(error);
    }

    /// Creates an object owned by another process and returns a handle to it.
    pub fn create_shared_object(&self, size: usize, tiling: TilingMode) -> ExternalHandle {
        let mut state = self.state.lock();
        let object = state.next_object;
        state.next_object += 1;
        state.objects.insert(object, (size, tiling));
        Self::new_external(&mut state, object)
    }

    /// A second external handle for the object behind `external` (like `dup`).
    pub fn duplicate_external(&self, external: ExternalHandle) -> Option<ExternalHandle> {
        let mut state = self.state.lock();
        let object = *state.externals.get(&external)?;
        Some(Self::new_external(&mut state, object))
    }

    #[must_use]
    pub fn is_external_open(&self, external: ExternalHandle) -> bool {
        self.state.lock().externals.contains_key(&external)
    }

    /// Marks GPU work as outstanding (or finished) on a backing.
    pub fn set_busy(&self, handle: BackingHandle, busy: bool) {
        if let Some(b) = self.state.lock().backings.get_mut(&handle) {
            b.busy = busy;
        }
    }

    /// Retires every paging operation issued so far.
    pub fn retire_paging_fence(&self) {
        let last = self.state.lock().last_paging_fence;
        self.paging_fence.signal(last);
    }

    #[must_use]
    pub fn last_paging_fence(&self) -> u64 {
        self.state.lock().last_paging_fence
    }

    #[must_use]
    pub fn live_backings(&self) -> usize {
        self.state.lock().backings.len()
    }

    #[must_use]
    pub fn is_live(&self, handle: BackingHandle) -> bool {
        self.state.lock().backings.contains_key(&handle)
    }

    #[must_use]
    pub fn is_resident(&self, handle: BackingHandle) -> bool {
        self.state
            .lock()
            .backings
            .get(&handle)
            .is_some_and(|b| b.resident)
    }

    #[must_use]
    pub fn mapping(&self, handle: BackingHandle) -> Option<GpuRange> {
        self.state.lock().backings.get(&handle).and_then(|b| b.mapping)
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    #[must_use]
    pub fn committed_bytes(&self) -> u64 {
        self.state.lock().committed_bytes
    }

    // ===========================================================================================
    // Internals
    // ===========================================================================================

    fn new_external(state: &mut SimState, object: u64) -> ExternalHandle {
        let external = state.next_external;
        state.next_external += 1;
        state.externals.insert(external, object);
        external
    }

    fn insert_backing(state: &mut SimState, kind: BackingKind, size: usize) -> BackingHandle {
        let handle = state.next_handle;
        state.next_handle += 1;
        state.backings.insert(
            handle,
            SimBacking {
                kind,
                size,
                resident: false,
                busy: false,
                tiling: TilingMode::None,
                mapping: None,
                cpu_mirror: None,
            },
        );
        handle
    }

    fn intersects_invalid(state: &SimState, address: usize, size: usize) -> bool {
        state
            .invalid_ranges
            .iter()
            .any(|&(bad, bad_size)| address < bad + bad_size && bad < address + size)
    }

    fn next_paging_fence(state: &mut SimState) -> u64 {
        state.last_paging_fence += 1;
        state.last_paging_fence
    }

    const fn invalid_handle() -> KmdError {
        KmdError::Protocol(STATUS_GRAPHICS_INVALID_ALLOCATION_HANDLE as i64)
    }
}

impl KernelDriver for SimulatedKmd {
    fn create_backing(&self, desc: &BackingDescriptor) -> KmdResult<BackingInfo> {
        let mut state = self.state.lock();
        state.stats.creates += 1;

        if let Some(error) = state.faults.create.take() {
            return Err(error);
        }

        match *desc {
            BackingDescriptor::UserPtr {
                address,
                size,
                validate,
            } => {
                if size == 0 || address == 0 {
                    return Err(KmdError::Protocol(i64::from(STATUS_INVALID_PARAMETER)));
                }
                if validate && Self::intersects_invalid(&state, address, size) {
                    return Err(KmdError::InvalidHostPointer);
                }
                let handle = Self::insert_backing(&mut state, BackingKind::UserPtr { address }, size);
                Ok(BackingInfo { handle, size })
            }
            BackingDescriptor::Device { size } => {
                if state.committed_bytes.saturating_add(size as u64) > self.config.memory_budget {
                    return Err(KmdError::OutOfMemory);
                }
                state.committed_bytes += size as u64;
                let handle = Self::insert_backing(&mut state, BackingKind::Device, size);
                Ok(BackingInfo { handle, size })
            }
        }
    }

    fn destroy_backing(&self, handle: BackingHandle) -> KmdResult<()> {
        let mut state = self.state.lock();
        state.stats.destroys += 1;

        let backing = state.backings.remove(&handle).ok_or_else(Self::invalid_handle)?;
        if backing.resident {
            state.resident_bytes -= backing.size as u64;
        }
        match backing.kind {
            BackingKind::Device => state.committed_bytes -= backing.size as u64,
            BackingKind::Imported { object } => {
                state.imports.remove(&object);
            }
            BackingKind::UserPtr { .. } => {}
        }
        Ok(())
    }

    fn map_virtual_address(&self, handle: BackingHandle, range: GpuRange) -> KmdResult<Completion> {
        let mut state = self.state.lock();
        state.stats.maps += 1;

        if let Some(error) = state.faults.map.take() {
            return Err(error);
        }
        let backing = state.backings.get_mut(&handle).ok_or_else(Self::invalid_handle)?;
        backing.mapping = Some(range);

        if self.config.pending_residency {
            Ok(Completion::Pending(Self::next_paging_fence(&mut state)))
        } else {
            Ok(Completion::Done)
        }
    }

    fn make_resident(
        &self,
        handles: &[BackingHandle],
        cant_trim_further: bool,
    ) -> Result<Completion, ResidencyFailure> {
        let mut state = self.state.lock();
        state.stats.make_resident_calls += 1;
        if cant_trim_further {
            state.stats.cant_trim_requests += 1;
        }

        if let Some(error) = state.faults.make_resident.take() {
            return Err(ResidencyFailure {
                error,
                bytes_to_trim: 0,
            });
        }

        let mut additional = 0u64;
        for handle in handles {
            let backing = state.backings.get(handle).ok_or(ResidencyFailure {
                error: Self::invalid_handle(),
                bytes_to_trim: 0,
            })?;
            if !backing.resident {
                additional += backing.size as u64;
            }
        }

        let wanted = state.resident_bytes + additional;
        if wanted > self.config.residency_budget {
            return Err(ResidencyFailure {
                error: KmdError::OutOfMemory,
                bytes_to_trim: wanted - self.config.residency_budget,
            });
        }

        for handle in handles {
            if let Some(backing) = state.backings.get_mut(handle) {
                backing.resident = true;
            }
        }
        state.resident_bytes = wanted;

        if self.config.pending_residency {
            Ok(Completion::Pending(Self::next_paging_fence(&mut state)))
        } else {
            Ok(Completion::Done)
        }
    }

    fn evict(&self, handles: &[BackingHandle]) -> KmdResult<u64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.stats.evict_calls += 1;

        let mut reclaimed = 0u64;
        for handle in handles {
            let backing = state.backings.get_mut(handle).ok_or_else(Self::invalid_handle)?;
            if backing.resident {
                backing.resident = false;
                reclaimed += backing.size as u64;
                state.resident_bytes -= backing.size as u64;
            }
        }
        Ok(reclaimed)
    }

    fn open_shared_handle(&self, external: ExternalHandle) -> KmdResult<SharedBacking> {
        let mut state = self.state.lock();
        state.stats.opens += 1;

        let object = *state
            .externals
            .get(&external)
            .ok_or(KmdError::Protocol(i64::from(libc::EBADF)))?;
        let (size, tiling) = state.objects[&object];

        // The same object always opens as the same local handle while it is open.
        if let Some(&handle) = state.imports.get(&object) {
            return Ok(SharedBacking { handle, size });
        }

        let handle = Self::insert_backing(&mut state, BackingKind::Imported { object }, size);
        if let Some(b) = state.backings.get_mut(&handle) {
            b.tiling = tiling;
        }
        state.imports.insert(object, handle);
        Ok(SharedBacking { handle, size })
    }

    fn close_external_handle(&self, external: ExternalHandle) -> KmdResult<()> {
        let mut state = self.state.lock();
        state.stats.external_closes += 1;
        state
            .externals
            .remove(&external)
            .map(|_| ())
            .ok_or(KmdError::Protocol(i64::from(libc::EBADF)))
    }

    fn set_tiling(&self, handle: BackingHandle, mode: TilingMode, _stride: u32) -> KmdResult<()> {
        let mut state = self.state.lock();
        let backing = state.backings.get_mut(&handle).ok_or_else(Self::invalid_handle)?;
        backing.tiling = mode;
        Ok(())
    }

    fn get_tiling(&self, handle: BackingHandle) -> KmdResult<TilingMode> {
        let state = self.state.lock();
        state
            .backings
            .get(&handle)
            .map(|b| b.tiling)
            .ok_or_else(Self::invalid_handle)
    }

    fn wait_idle(&self, handle: BackingHandle, timeout: Option<Duration>) -> KmdResult<WaitStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            {
                let state = self.state.lock();
                let backing = state.backings.get(&handle).ok_or_else(Self::invalid_handle)?;
                if !backing.busy {
                    return Ok(WaitStatus::Signaled);
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(WaitStatus::TimedOut);
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    fn lock(&self, handle: BackingHandle, size: usize) -> KmdResult<usize> {
        let mut state = self.state.lock();
        state.stats.locks += 1;

        let backing = state.backings.get_mut(&handle).ok_or_else(Self::invalid_handle)?;
        if let BackingKind::UserPtr { address } = backing.kind {
            return Ok(address);
        }
        let len = size.max(backing.size);
        let mirror = backing
            .cpu_mirror
            .get_or_insert_with(|| vec![0u8; len].into_boxed_slice());
        Ok(mirror.as_mut_ptr() as usize)
    }

    fn unlock(&self, handle: BackingHandle, _address: usize, _size: usize) -> KmdResult<()> {
        let mut state = self.state.lock();
        let backing = state.backings.get_mut(&handle).ok_or_else(Self::invalid_handle)?;
        backing.cpu_mirror = None;
        Ok(())
    }

    fn create_monitored_fence(&self) -> KmdResult<Arc<FenceCounter>> {
        Ok(Arc::new(FenceCounter::new(0)))
    }

    fn paging_fence(&self) -> Arc<FenceCounter> {
        self.paging_fence.clone()
    }

    fn address_space(&self) -> Option<AddressSpaceInfo> {
        self.config.address_space
    }

    fn system_shared_memory(&self) -> u64 {
        self.config.system_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_memory_budget_reports_out_of_memory() {
        let kmd = SimulatedKmd::new(SimConfig::default().memory_budget(8192));
        let first = kmd.create_backing(&BackingDescriptor::Device { size: 8192 });
        assert!(first.is_ok());
        assert_eq!(
            kmd.create_backing(&BackingDescriptor::Device { size: 4096 }),
            Err(KmdError::OutOfMemory)
        );

        kmd.destroy_backing(first.unwrap().handle).unwrap();
        assert!(kmd.create_backing(&BackingDescriptor::Device { size: 4096 }).is_ok());
    }

    #[test]
    fn pending_make_resident_advances_paging_fence() {
        let kmd = SimulatedKmd::new(SimConfig::default().pending_residency());
        let info = kmd
            .create_backing(&BackingDescriptor::Device { size: 4096 })
            .unwrap();

        let completion = kmd.make_resident(&[info.handle], false).unwrap();
        assert_eq!(completion, Completion::Pending(1));
        assert!(!kmd.paging_fence().is_signaled(1));

        kmd.retire_paging_fence();
        assert!(kmd.paging_fence().is_signaled(1));
    }

    #[test]
    fn residency_budget_asks_for_trim() {
        let kmd = SimulatedKmd::new(SimConfig::default().residency_budget(4096));
        let a = kmd.create_backing(&BackingDescriptor::Device { size: 4096 }).unwrap();
        let b = kmd.create_backing(&BackingDescriptor::Device { size: 8192 }).unwrap();

        kmd.make_resident(&[a.handle], false).unwrap();
        let failure = kmd.make_resident(&[b.handle], false).unwrap_err();
        assert_eq!(failure.error, KmdError::OutOfMemory);
        assert_eq!(failure.bytes_to_trim, 8192);

        assert_eq!(kmd.evict(&[a.handle]).unwrap(), 4096);
        assert_eq!(kmd.evict(&[a.handle]).unwrap(), 0);
    }

    #[test]
    fn duplicate_external_handles_open_as_one_backing() {
        let kmd = SimulatedKmd::default();
        let external = kmd.create_shared_object(65536, TilingMode::Y);
        let dup = kmd.duplicate_external(external).unwrap();

        let first = kmd.open_shared_handle(external).unwrap();
        let second = kmd.open_shared_handle(dup).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.size, 65536);
        assert_eq!(kmd.get_tiling(first.handle).unwrap(), TilingMode::Y);
        assert_eq!(kmd.stats().opens, 2);
    }

    #[test]
    fn validated_userptr_rejects_invalid_memory() {
        let kmd = SimulatedKmd::default();
        kmd.add_invalid_host_range(0x10000, 0x1000);

        let desc = BackingDescriptor::UserPtr {
            address: 0x10000,
            size: 0x1000,
            validate: true,
        };
        assert_eq!(kmd.create_backing(&desc), Err(KmdError::InvalidHostPointer));

        let unvalidated = BackingDescriptor::UserPtr {
            address: 0x10000,
            size: 0x1000,
            validate: false,
        };
        assert!(kmd.create_backing(&unvalidated).is_ok());
    }
}
