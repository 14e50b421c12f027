// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Enable/disable and publication of the active reporting configuration.
//!
//! The configuration is published as an atomically swapped nullable
//! reference, not a flag: the hot-path hooks test enablement and get the
//! per-region state in one acquire load. Disable unpublishes, stops the
//! worker, and then waits out a grace period until every reader that
//! loaded the old configuration has dropped its reference, so no candidate
//! memory is ever freed while a hook or the scanner can still see it.

use core::mem;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use arrayvec::ArrayVec;
use crossbeam_channel::Sender;
use crossbeam_utils::CachePadded;
use fallible_collections::vec::FallibleVec;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::backend::{RegionId, RegionSpan, ReportingBackend};
use crate::block::Block;
use crate::candidates::CandidateIndex;
use crate::error::ReportError;
use crate::scheduler::{self, Wake};

/// Most regions one configuration can track; enable fails beyond this.
pub const MAX_REPORTING_REGIONS: usize = 64;

/// Default batch capacity in blocks.
pub const REPORT_CAPACITY: u32 = 32;

/// Default smallest block order worth reporting (2 MiB with 4 KiB pages).
pub const REPORT_MIN_ORDER: u32 = 9;

/// Default debounce between the first wake request and the scan, so a
/// burst of frees builds a sizeable batch before the worker runs.
pub const REPORT_DELAY: Duration = Duration::from_millis(100);

/// Consumer of reported batches.
///
/// `report` runs on the reporting worker and may block. The call is
/// advisory: the engine releases every batch back to the allocator no
/// matter what the consumer does with it, and a reported block may be
/// reallocated (and dirtied) any time after `report` returns.
pub trait ReportDevice: Send + Sync {
    fn report(&self, batch: &[Block]);
}

/// Parameters for [`PageReporting::enable`].
#[derive(Clone)]
pub struct ReportingConfig {
    /// Receives each staged batch.
    pub device: Arc<dyn ReportDevice>,
    /// Batch capacity in blocks. A bound on staging memory, not a
    /// quality-of-service knob; it doubles as the pending-candidate
    /// threshold that wakes the worker.
    pub capacity: u32,
    /// Smallest block order worth reporting. Must be at least the
    /// allocator's own minimum order.
    pub min_order: u32,
    /// Debounce between a wake request and the start of a scan.
    pub delay: Duration,
}

impl ReportingConfig {
    pub fn new(device: Arc<dyn ReportDevice>) -> ReportingConfig {
        ReportingConfig {
            device,
            capacity: REPORT_CAPACITY,
            min_order: REPORT_MIN_ORDER,
            delay: REPORT_DELAY,
        }
    }
}

/// Per-region reporting state, fixed from enable to disable. The region's
/// span lives inside the candidate index, snapshotted at enable time.
pub(crate) struct RegionReporting {
    pub(crate) id: RegionId,
    pub(crate) index: CandidateIndex,
}

/// Everything the hooks, the scheduler and the scanner share while a
/// configuration is active.
pub(crate) struct ReportingState<A: ReportingBackend> {
    pub(crate) backend: Arc<A>,
    pub(crate) device: Arc<dyn ReportDevice>,
    pub(crate) capacity: usize,
    pub(crate) min_order: u32,
    pub(crate) delay: Duration,
    /// Sorted by region id; binary-searched on the hot paths.
    pub(crate) regions: ArrayVec<CachePadded<RegionReporting>, MAX_REPORTING_REGIONS>,
    /// Number of regions with an outstanding scan request. The 0 -> 1
    /// edge wakes the worker; every other request is absorbed into the
    /// cycle that wake starts.
    refcnt: AtomicUsize,
    /// Set once disable begins. The scanner finishes the batch in flight,
    /// then the worker exits.
    shutdown: AtomicBool,
    /// Staging buffer of capacity `capacity`, preallocated at enable. The
    /// scanner owns it for the duration of a pass.
    staging: spin::Mutex<Vec<Block>>,
    /// Wakes the worker.
    tx: Sender<Wake>,
}

impl<A: ReportingBackend> ReportingState<A> {
    pub(crate) fn region(&self, id: RegionId) -> Option<&RegionReporting> {
        self.regions
            .binary_search_by(|r| r.id.cmp(&id))
            .ok()
            .map(|i| &*self.regions[i])
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Request a scan covering `region`. At most one wake is in flight
    /// per cycle no matter how many regions ask.
    pub(crate) fn request_scan(&self, region: &RegionReporting) {
        if region.index.request() && self.refcnt.fetch_add(1, Ordering::AcqRel) == 0 {
            // First request of the cycle arms the worker.
            let _ = self.tx.send(Wake::Scan);
        }
    }

    /// The scanner is done with `region` for this cycle.
    pub(crate) fn finish_region(&self, region: &RegionReporting) {
        if region.index.clear_request() {
            self.refcnt.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Whether any region still has a scan request outstanding. Requests
    /// raised while a cycle is running bump the refcount without a wake,
    /// so the worker must consult this before going idle.
    pub(crate) fn has_requests(&self) -> bool {
        self.refcnt.load(Ordering::Acquire) > 0
    }

    pub(crate) fn take_batch(&self) -> Vec<Block> {
        mem::take(&mut *self.staging.lock())
    }

    pub(crate) fn put_batch(&self, mut batch: Vec<Block>) {
        batch.clear();
        *self.staging.lock() = batch;
    }
}

/// Handle on the worker thread plus the state it runs against.
struct Enabled<A: ReportingBackend> {
    state: Arc<ReportingState<A>>,
    worker: thread::JoinHandle<()>,
}

/// Free-page reporting engine for one allocator instance.
///
/// At most one configuration is active at a time. The hooks
/// ([`notify_free`]/[`notify_alloc`]) may be called at any point in the
/// lifecycle; they observe enablement through the published pointer and
/// return immediately while it is null.
///
/// [`notify_free`]: PageReporting::notify_free
/// [`notify_alloc`]: PageReporting::notify_alloc
pub struct PageReporting<A: ReportingBackend> {
    pub(crate) backend: Arc<A>,
    /// Single-writer lifecycle serialization.
    lifecycle: Mutex<Option<Enabled<A>>>,
    /// Published pointer the hot paths read; null means disabled.
    pub(crate) active: ArcSwapOption<ReportingState<A>>,
}

impl<A: ReportingBackend> PageReporting<A> {
    pub fn new(backend: Arc<A>) -> PageReporting<A> {
        PageReporting {
            backend,
            lifecycle: Mutex::new(None),
            active: ArcSwapOption::from(None),
        }
    }

    /// Begin reporting with `config`.
    ///
    /// Snapshots the populated regions, allocates per-region candidate
    /// indices and the staging buffer, spawns the worker, publishes the
    /// configuration, and requests an initial scan for every region so
    /// blocks that are freed right away surface promptly.
    ///
    /// Errors: [`ReportError::Busy`] when a configuration is already
    /// active, [`ReportError::InvalidCapacity`] for a zero batch
    /// capacity, [`ReportError::CapacityOverflow`] when the allocator
    /// exposes more regions than the engine tracks, and
    /// [`ReportError::OutOfMemory`]. On error nothing was published and
    /// no partial state survives.
    pub fn enable(&self, config: ReportingConfig) -> Result<(), ReportError> {
        if config.capacity == 0 {
            return Err(ReportError::InvalidCapacity);
        }

        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            return Err(ReportError::Busy);
        }

        // Snapshot the populated regions; their spans are assumed stable
        // until disable.
        let mut spans: ArrayVec<(RegionId, RegionSpan), MAX_REPORTING_REGIONS> = ArrayVec::new();
        let mut overflow = false;
        self.backend.for_each_region(&mut |id, span| {
            if spans.try_push((id, span)).is_err() {
                overflow = true;
            }
        });
        if overflow {
            return Err(ReportError::CapacityOverflow);
        }
        spans.sort_unstable_by_key(|&(id, _)| id);

        let mut regions: ArrayVec<CachePadded<RegionReporting>, MAX_REPORTING_REGIONS> =
            ArrayVec::new();
        for &(id, span) in spans.iter() {
            let index = CandidateIndex::new(span, config.min_order)?;
            regions.try_push(CachePadded::new(RegionReporting { id, index }))?;
        }

        let staging: Vec<Block> = Vec::try_with_capacity(config.capacity as usize)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(ReportingState {
            backend: Arc::clone(&self.backend),
            device: Arc::clone(&config.device),
            capacity: config.capacity as usize,
            min_order: config.min_order,
            delay: config.delay,
            regions,
            refcnt: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            staging: spin::Mutex::new(staging),
            tx,
        });
        let worker = scheduler::spawn(Arc::clone(&state), rx)?;

        // Publish, then flush whatever the regions already hold.
        self.active.store(Some(Arc::clone(&state)));
        for region in state.regions.iter() {
            state.request_scan(region);
        }

        debug!(
            "page reporting enabled: {} region(s), capacity {} block(s), min order {}",
            state.regions.len(),
            state.capacity,
            state.min_order
        );
        *lifecycle = Some(Enabled { state, worker });
        Ok(())
    }

    /// Stop reporting for `device`'s configuration.
    ///
    /// No-op when `device` is not the active configuration. On return the
    /// worker has exited, no further batches will be reported, and all
    /// candidate state has been freed.
    pub fn disable(&self, device: &Arc<dyn ReportDevice>) {
        let mut lifecycle = self.lifecycle.lock();
        let enabled = match lifecycle.take() {
            Some(enabled) if Arc::ptr_eq(&enabled.state.device, device) => enabled,
            other => {
                *lifecycle = other;
                return;
            }
        };

        // Stop the scanner, then unpublish: hooks that load from here on
        // see "disabled".
        enabled.state.shutdown.store(true, Ordering::Release);
        self.active.store(None);
        let _ = enabled.state.tx.send(Wake::Exit);

        // The worker finishes the batch in flight, if any, then exits.
        if enabled.worker.join().is_err() {
            warn!("reporting worker panicked during shutdown");
        }

        // Grace period: hook invocations that loaded the configuration
        // before it was unpublished may still hold a reference. Wait them
        // out before the candidate indices are dropped.
        let state = enabled.state;
        while Arc::strong_count(&state) > 1 {
            thread::yield_now();
        }
        debug!("page reporting disabled");
    }
}

impl<A: ReportingBackend> Drop for PageReporting<A> {
    fn drop(&mut self) {
        let device = self
            .lifecycle
            .lock()
            .as_ref()
            .map(|enabled| Arc::clone(&enabled.state.device));
        if let Some(device) = device {
            self.disable(&device);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use rand::prelude::*;

    use super::*;
    use crate::block::Pfn;
    use crate::region_model::{wait_until, Harness};

    #[test]
    fn enable_rejects_second_configuration() {
        let h = Harness::one_region(1 << 14);
        h.enable(16, 30);
        let second = ReportingConfig::new(h.device.clone());
        assert_eq!(h.engine.enable(second), Err(ReportError::Busy));
    }

    #[test]
    fn enable_rejects_zero_capacity() {
        let h = Harness::one_region(1 << 14);
        let mut config = ReportingConfig::new(h.device.clone());
        config.capacity = 0;
        assert_eq!(h.engine.enable(config), Err(ReportError::InvalidCapacity));
    }

    #[test]
    fn disable_of_foreign_configuration_is_noop() {
        let h = Harness::one_region(1 << 14);
        h.enable(16, 30);

        let other: Arc<dyn ReportDevice> = Arc::new(crate::region_model::NullDevice);
        h.engine.disable(&other);

        // Still active: a second enable is still refused.
        let second = ReportingConfig::new(h.device.clone());
        assert_eq!(h.engine.enable(second), Err(ReportError::Busy));
    }

    #[test]
    fn disable_then_enable_again() {
        let h = Harness::one_region(1 << 14);
        h.enable(16, 30);
        h.disable();
        h.enable(16, 30);
        h.disable();
    }

    #[test]
    fn hooks_are_noops_while_disabled() {
        let h = Harness::one_region(1 << 14);
        // No configuration published; nothing to observe, nothing to break.
        h.engine.notify_free(0, Pfn(4096), 9);
        h.engine.notify_alloc(0, Pfn(4096));
        h.free(0, Pfn(4096), 9);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(h.device.report_count(), 0);
    }

    /// Disable while the consumer sits in the callback: the in-flight
    /// batch is still released, nothing further is reported, and disable
    /// returns only after the worker is gone.
    #[test]
    fn disable_during_scan_finishes_current_batch() {
        let h = Harness::one_region(1 << 16);
        let (release_tx, entered_rx) = h.device.gate();
        h.enable(16, 30);
        for i in 0..32u64 {
            h.free(0, Pfn(i * 512), 9);
        }

        // First batch of 16 is now stuck inside the callback.
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("scan reaches the device");

        let engine = Arc::clone(&h.engine);
        let device = h.device.clone() as Arc<dyn ReportDevice>;
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let disabler = std::thread::spawn(move || {
            engine.disable(&device);
            done2.store(true, Ordering::Release);
        });

        // Disable is underway (the configuration is unpublished) but must
        // not return while the callback blocks the worker.
        assert!(wait_until(Duration::from_secs(5), || {
            h.engine.active.load_full().is_none()
        }));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::Acquire));

        release_tx.send(()).expect("worker is waiting");
        disabler.join().expect("disable returns");
        assert!(done.load(Ordering::Acquire));

        // Exactly the one batch, fully released; the other 16 candidates
        // died with the configuration.
        let batches = h.device.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 16);
        assert_eq!(h.alloc.isolates(), 16);
        assert_eq!(h.alloc.releases(), 16);

        // And the engine is reusable.
        h.enable(16, 30);
    }

    /// Disable while the worker is still debouncing: the pending cycle
    /// never runs.
    #[test]
    fn disable_cancels_pending_cycle() {
        let h = Harness::one_region(1 << 14);
        h.enable(16, 2_000);
        h.free(0, Pfn(0), 9);

        let started = Instant::now();
        h.disable();
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(h.device.report_count(), 0);
        // The candidate died unreported, but nothing leaked.
        assert_eq!(h.alloc.isolates(), 0);
        assert_eq!(h.alloc.releases(), 0);
    }

    /// Free/allocate churn against a running scanner: every isolate is
    /// matched by a release, and the device only ever sees blocks that
    /// are isolated at report time (asserted inside the device).
    #[test]
    fn churn_never_leaks() {
        let h = Harness::one_region(1 << 20);
        h.enable(16, 2);

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        for t in 0..2u64 {
            let h2 = h.clone();
            let stop2 = Arc::clone(&stop);
            workers.push(std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xdead_beef + t);
                while !stop2.load(Ordering::Acquire) {
                    let idx = rng.gen_range(0..1024u64);
                    let pfn = Pfn(idx * 512);
                    if rng.gen_bool(0.7) {
                        h2.free(0, pfn, 9);
                    } else {
                        h2.alloc_block(0, pfn);
                    }
                }
            }));
        }

        std::thread::sleep(Duration::from_millis(400));
        stop.store(true, Ordering::Release);
        for w in workers {
            w.join().expect("producer exits");
        }

        // Let in-flight cycles settle, then tear down.
        assert!(wait_until(Duration::from_secs(5), || {
            h.alloc.isolates() == h.alloc.releases()
        }));
        h.disable();
        assert_eq!(h.alloc.isolates(), h.alloc.releases());
        // Nothing is left isolated.
        assert_eq!(h.alloc.isolated_count(), 0);
    }
}
