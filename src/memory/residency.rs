//! Residency and fence tracking for kernel drivers that page explicitly.
//!
//! An allocation must be resident before the device touches it. Make-resident
//! requests may complete behind the driver's paging fence, and memory may only
//! be reclaimed or touched by the CPU once the monitored fence of every
//! submission that used it has retired.

use crate::error::{GfxError, GfxResult, unrecoverable};
use crate::kmd::{BackingHandle, Completion, FenceCounter, KernelDriver, WaitStatus};
use crate::memory::allocation::GraphicsAllocation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidencyState {
    #[default]
    Nonresident,
    /// Resident once the paging fence reaches the value.
    PendingResident { paging_fence: u64 },
    Resident,
    Evicted,
}

#[derive(Debug, Default, Clone, Copy)]
struct ResidencyRecord {
    state: ResidencyState,
    last_fence_value: u64,
}

/// Residency bookkeeping of one allocation or host-pointer fragment.
#[derive(Debug, Default)]
pub struct ResidencyData {
    record: Mutex<ResidencyRecord>,
}

impl ResidencyData {
    #[must_use]
    pub fn state(&self) -> ResidencyState {
        self.record.lock().state
    }

    /// Monitored fence value of the last submission that used the memory.
    #[must_use]
    pub fn last_fence_value(&self) -> u64 {
        self.record.lock().last_fence_value
    }

    pub(crate) fn set_state(&self, state: ResidencyState) {
        self.record.lock().state = state;
    }

    fn update_fence(&self, value: u64) {
        let mut record = self.record.lock();
        record.last_fence_value = record.last_fence_value.max(value);
    }

    /// Promotes a pending entry whose paging fence retired.
    fn resolve(&self, paging_fence: &FenceCounter) -> ResidencyState {
        let mut record = self.record.lock();
        if let ResidencyState::PendingResident { paging_fence: value } = record.state {
            if paging_fence.is_signaled(value) {
                record.state = ResidencyState::Resident;
            }
        }
        record.state
    }
}

/// The unit the kernel makes resident: backing handles sharing one record.
#[derive(Debug, Clone)]
pub struct ResidencyUnit {
    pub handles: Vec<BackingHandle>,
    pub size: u64,
    pub data: Arc<ResidencyData>,
}

/// Highest paging fence value handed out by the driver so far.
#[derive(Debug)]
pub struct PagingFenceTracker {
    current: AtomicU64,
    counter: Arc<FenceCounter>,
}

impl PagingFenceTracker {
    #[must_use]
    pub const fn new(counter: Arc<FenceCounter>) -> Self {
        Self {
            current: AtomicU64::new(0),
            counter,
        }
    }

    pub fn update(&self, value: u64) {
        self.current.fetch_max(value, Ordering::AcqRel);
    }

    /// Records the fence of an operation that may still be in flight.
    pub fn track(&self, completion: Completion) {
        if let Completion::Pending(value) = completion {
            self.update(value);
        }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn counter(&self) -> &Arc<FenceCounter> {
        &self.counter
    }

    /// Waits until every paging operation issued so far has retired.
    pub fn wait(&self, spin: Duration, deadline: Option<Instant>) -> WaitStatus {
        self.counter.wait(self.current(), spin, deadline)
    }
}

#[derive(Debug, Clone, Copy)]
struct FenceValues {
    last_submitted: u64,
    current: u64,
}

/// A device-written completion counter plus the CPU's view of what was submitted.
#[derive(Debug)]
pub struct MonitoredFence {
    counter: Arc<FenceCounter>,
    values: Mutex<FenceValues>,
}

impl MonitoredFence {
    #[must_use]
    pub fn new(counter: Arc<FenceCounter>) -> Self {
        Self {
            counter,
            values: Mutex::new(FenceValues {
                last_submitted: 0,
                current: 1,
            }),
        }
    }

    #[must_use]
    pub fn counter(&self) -> &Arc<FenceCounter> {
        &self.counter
    }

    /// Value the next submission will signal.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.values.lock().current
    }

    #[must_use]
    pub fn last_submitted(&self) -> u64 {
        self.values.lock().last_submitted
    }

    /// Records one submission and returns the value it signals on completion.
    pub fn advance(&self) -> u64 {
        let mut values = self.values.lock();
        values.last_submitted = values.current;
        values.current += 1;
        values.last_submitted
    }
}

#[derive(Debug)]
struct TrackedEntry {
    handles: Vec<BackingHandle>,
    size: u64,
    data: Weak<ResidencyData>,
}

/// Residency state of one device context.
///
/// Evicting memory still used by queued GPU work is the caller's
/// responsibility; [`ResidencyController::trim_residency`] is the only path
/// that checks completion itself.
#[derive(Debug)]
pub struct ResidencyController {
    driver: Arc<dyn KernelDriver>,
    monitored_fence: MonitoredFence,
    paging: Arc<PagingFenceTracker>,
    resident: Mutex<Vec<TrackedEntry>>,
    spin: Duration,
}

impl ResidencyController {
    #[must_use]
    pub fn new(
        driver: Arc<dyn KernelDriver>,
        fence: Arc<FenceCounter>,
        paging: Arc<PagingFenceTracker>,
        spin: Duration,
    ) -> Self {
        Self {
            driver,
            monitored_fence: MonitoredFence::new(fence),
            paging,
            resident: Mutex::new(Vec::new()),
            spin,
        }
    }

    #[must_use]
    pub const fn monitored_fence(&self) -> &MonitoredFence {
        &self.monitored_fence
    }

    #[must_use]
    pub fn current_paging_fence(&self) -> u64 {
        self.paging.current()
    }

    /// Makes every allocation resident.
    ///
    /// When the driver wants memory trimmed first, completed allocations are
    /// evicted and the request is retried once. A failure with `must_succeed`
    /// set aborts the process: the submission it guards cannot run safely.
    ///
    /// # Errors
    /// The driver's error when the request cannot be satisfied.
    pub fn make_resident_allocations(
        &self,
        allocations: &[&GraphicsAllocation],
        must_succeed: bool,
    ) -> GfxResult<()> {
        let units: Vec<ResidencyUnit> = allocations
            .iter()
            .flat_map(|a| a.residency_units())
            .filter(|unit| {
                matches!(
                    unit.data.resolve(self.paging.counter()),
                    ResidencyState::Nonresident | ResidencyState::Evicted
                )
            })
            .collect();
        if units.is_empty() {
            return Ok(());
        }
        let handles: Vec<BackingHandle> = units
            .iter()
            .flat_map(|u| u.handles.iter().copied())
            .collect();

        let mut trimmed = false;
        let completion = loop {
            // The retry after a trim must not ask for more trimming.
            match self.driver.make_resident(&handles, must_succeed || trimmed) {
                Ok(completion) => break completion,
                Err(failure) => {
                    if must_succeed {
                        tracing::error!(
                            error = %failure.error,
                            bytes_to_trim = failure.bytes_to_trim,
                            handles = handles.len(),
                            "must-succeed make-resident failed"
                        );
                        unrecoverable("residency could not be established for a submission");
                    }
                    if trimmed
                        || failure.bytes_to_trim == 0
                        || self.trim_residency(failure.bytes_to_trim) < failure.bytes_to_trim
                    {
                        tracing::debug!(error = %failure.error, "make-resident failed");
                        return Err(GfxError::from(failure.error));
                    }
                    trimmed = true;
                }
            }
        };

        let state = match completion {
            Completion::Done => ResidencyState::Resident,
            Completion::Pending(value) => {
                self.paging.update(value);
                ResidencyState::PendingResident {
                    paging_fence: value,
                }
            }
        };

        let mut resident = self.resident.lock();
        for unit in units {
            unit.data.set_state(state);
            if !resident
                .iter()
                .any(|e| e.data.as_ptr() == Arc::as_ptr(&unit.data))
            {
                resident.push(TrackedEntry {
                    handles: unit.handles,
                    size: unit.size,
                    data: Arc::downgrade(&unit.data),
                });
            }
        }
        Ok(())
    }

    /// Evicts the allocations and returns the bytes the driver reclaimed.
    ///
    /// # Errors
    /// The driver's error.
    pub fn evict(&self, allocations: &[&GraphicsAllocation]) -> GfxResult<u64> {
        let units: Vec<ResidencyUnit> = allocations
            .iter()
            .flat_map(|a| a.residency_units())
            .filter(|unit| {
                matches!(
                    unit.data.state(),
                    ResidencyState::Resident | ResidencyState::PendingResident { .. }
                )
            })
            .collect();
        if units.is_empty() {
            return Ok(0);
        }

        let handles: Vec<BackingHandle> = units
            .iter()
            .flat_map(|u| u.handles.iter().copied())
            .collect();
        let reclaimed = self.driver.evict(&handles)?;

        let mut resident = self.resident.lock();
        for unit in &units {
            unit.data.set_state(ResidencyState::Evicted);
            resident.retain(|e| e.data.as_ptr() != Arc::as_ptr(&unit.data));
        }
        Ok(reclaimed)
    }

    /// Whether every part of the allocation is resident. Pending entries count
    /// only once their paging fence has retired.
    #[must_use]
    pub fn is_resident(&self, allocation: &GraphicsAllocation) -> bool {
        allocation
            .residency_units()
            .iter()
            .all(|unit| unit.data.resolve(self.paging.counter()) == ResidencyState::Resident)
    }

    /// Waits for every paging operation issued so far.
    pub fn wait_for_paging_fence(&self, deadline: Option<Instant>) -> WaitStatus {
        self.paging.wait(self.spin, deadline)
    }

    /// Records a submission that uses `allocations` and returns the monitored
    /// fence value it will signal. The fence advances by exactly one.
    pub fn on_submitted(&self, allocations: &[&GraphicsAllocation]) -> u64 {
        let value = self.monitored_fence.advance();
        for allocation in allocations {
            for unit in allocation.residency_units() {
                unit.data.update_fence(value);
            }
        }
        value
    }

    /// Waits until the device signals `value` on the monitored fence.
    pub fn wait_for_completion(&self, value: u64, deadline: Option<Instant>) -> WaitStatus {
        if self.monitored_fence.counter().is_signaled(value) {
            return WaitStatus::Signaled;
        }
        self.monitored_fence.counter().wait(value, self.spin, deadline)
    }

    /// Blocks until every submission that used the allocation has completed.
    pub fn handle_fence_completion(&self, allocation: &GraphicsAllocation) {
        let last = allocation
            .residency_units()
            .iter()
            .map(|unit| unit.data.last_fence_value())
            .max()
            .unwrap_or(0);
        self.wait_for_completion(last, None);
    }

    /// Evicts resident memory whose last use has completed, oldest first, until
    /// `bytes` are reclaimed. Returns the bytes actually reclaimed.
    pub fn trim_residency(&self, bytes: u64) -> u64 {
        let completed = self.monitored_fence.counter().value();

        let mut resident = self.resident.lock();
        resident.retain(|e| e.data.strong_count() > 0);

        let mut candidates: Vec<(u64, usize)> = resident
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let data = entry.data.upgrade()?;
                let fence = data.last_fence_value();
                let trimmable = fence <= completed
                    && data.resolve(self.paging.counter()) == ResidencyState::Resident;
                trimmable.then_some((fence, index))
            })
            .collect();
        candidates.sort_unstable();

        let mut reclaimed = 0u64;
        let mut evicted = Vec::new();
        for (_, index) in candidates {
            if reclaimed >= bytes {
                break;
            }
            let entry = &resident[index];
            match self.driver.evict(&entry.handles) {
                Ok(bytes_freed) => {
                    if let Some(data) = entry.data.upgrade() {
                        data.set_state(ResidencyState::Evicted);
                    }
                    tracing::trace!(size = entry.size, bytes_freed, "trimmed allocation");
                    reclaimed += bytes_freed;
                    evicted.push(index);
                }
                Err(e) => tracing::warn!(error = %e, handles = ?entry.handles, "trim evict failed"),
            }
        }

        evicted.sort_unstable();
        for index in evicted.into_iter().rev() {
            resident.swap_remove(index);
        }
        tracing::debug!(requested = bytes, reclaimed, "residency trimmed");
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitored_fence_advances_by_one() {
        let fence = MonitoredFence::new(Arc::new(FenceCounter::new(0)));
        assert_eq!(fence.current(), 1);
        assert_eq!(fence.last_submitted(), 0);

        assert_eq!(fence.advance(), 1);
        assert_eq!(fence.advance(), 2);
        assert_eq!(fence.last_submitted(), 2);
        assert_eq!(fence.current(), 3);
        assert!(fence.last_submitted() <= fence.current());
    }

    #[test]
    fn paging_tracker_keeps_the_maximum() {
        let tracker = PagingFenceTracker::new(Arc::new(FenceCounter::new(0)));
        tracker.track(Completion::Pending(7));
        tracker.update(3);
        tracker.track(Completion::Done);
        assert_eq!(tracker.current(), 7);

        assert_eq!(
            tracker.wait(Duration::ZERO, Some(Instant::now())),
            WaitStatus::TimedOut
        );
        tracker.counter().signal(7);
        assert_eq!(tracker.wait(Duration::ZERO, None), WaitStatus::Signaled);
    }

    #[test]
    fn pending_entry_resolves_after_paging_fence() {
        let counter = FenceCounter::new(0);
        let data = ResidencyData::default();
        data.set_state(ResidencyState::PendingResident { paging_fence: 2 });

        counter.signal(1);
        assert_eq!(
            data.resolve(&counter),
            ResidencyState::PendingResident { paging_fence: 2 }
        );
        counter.signal(2);
        assert_eq!(data.resolve(&counter), ResidencyState::Resident);
    }
}
