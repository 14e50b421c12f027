// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A model page allocator for exercising the reporting engine.
//!
//! Free lists are maps from block-head pfn to `(order, migratetype)`, one
//! per region behind a spin lock, with the hooks wired exactly where a
//! real allocator would call them: `notify_free` after a block lands on
//! the free list, `notify_alloc` before one leaves it, both under the
//! region lock. Isolated blocks move to a side map so the model can check
//! that the consumer only ever sees blocks that are really isolated, that
//! order and migration class survive the round trip, and that every
//! isolate is matched by a release.

use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use spin::Mutex;

use crate::backend::{FreeBlock, IsolateError, RegionId, RegionOps, RegionSpan, ReportingBackend};
use crate::block::{Block, MigrateType, Pfn};
use crate::lifecycle::{PageReporting, ReportDevice, ReportingConfig};

/// One model region: free and isolated blocks keyed by head pfn.
pub(crate) struct ModelRegion {
    pub(crate) free: BTreeMap<u64, (u32, MigrateType)>,
    pub(crate) isolated: BTreeMap<u64, (u32, MigrateType)>,
    pub(crate) isolates: usize,
    pub(crate) releases: usize,
}

impl ModelRegion {
    fn new() -> ModelRegion {
        ModelRegion {
            free: BTreeMap::new(),
            isolated: BTreeMap::new(),
            isolates: 0,
            releases: 0,
        }
    }
}

impl RegionOps for ModelRegion {
    fn free_block(&self, pfn: Pfn, min_order: u32) -> Option<FreeBlock> {
        self.free
            .get(&pfn.as_u64())
            .filter(|&&(order, _)| order >= min_order)
            .map(|&(order, migratetype)| FreeBlock { order, migratetype })
    }

    fn isolate(&mut self, pfn: Pfn, order: u32) -> Result<(), IsolateError> {
        match self.free.get(&pfn.as_u64()) {
            Some(&(o, migratetype)) if o == order => {
                self.free.remove(&pfn.as_u64());
                self.isolated.insert(pfn.as_u64(), (order, migratetype));
                self.isolates += 1;
                Ok(())
            }
            _ => Err(IsolateError),
        }
    }

    fn release(&mut self, pfn: Pfn, order: u32, migratetype: MigrateType) {
        // Whatever was recorded at isolation must come back unchanged.
        let taken = self.isolated.remove(&pfn.as_u64());
        assert_eq!(taken, Some((order, migratetype)), "release of {:?}", pfn);
        self.free.insert(pfn.as_u64(), (order, migratetype));
        self.releases += 1;
        // No notify_free here: the release path must not re-enqueue.
    }
}

pub(crate) struct ModelAllocator {
    regions: Vec<(RegionId, RegionSpan, Mutex<ModelRegion>)>,
}

impl ModelAllocator {
    pub(crate) fn new(spans: &[(RegionId, RegionSpan)]) -> ModelAllocator {
        ModelAllocator {
            regions: spans
                .iter()
                .map(|&(id, span)| (id, span, Mutex::new(ModelRegion::new())))
                .collect(),
        }
    }

    pub(crate) fn isolates(&self) -> usize {
        self.regions.iter().map(|(_, _, m)| m.lock().isolates).sum()
    }

    pub(crate) fn releases(&self) -> usize {
        self.regions.iter().map(|(_, _, m)| m.lock().releases).sum()
    }

    pub(crate) fn isolated_count(&self) -> usize {
        self.regions
            .iter()
            .map(|(_, _, m)| m.lock().isolated.len())
            .sum()
    }

    pub(crate) fn is_isolated(&self, pfn: Pfn) -> bool {
        self.regions
            .iter()
            .any(|(_, _, m)| m.lock().isolated.contains_key(&pfn.as_u64()))
    }
}

impl ReportingBackend for ModelAllocator {
    type Region = ModelRegion;

    fn for_each_region(&self, f: &mut dyn FnMut(RegionId, RegionSpan)) {
        for (id, span, _) in self.regions.iter() {
            f(*id, *span);
        }
    }

    fn with_region<R, F: FnOnce(&mut ModelRegion) -> R>(&self, id: RegionId, f: F) -> Option<R> {
        self.regions
            .iter()
            .find(|(rid, _, _)| *rid == id)
            .map(|(_, _, m)| f(&mut m.lock()))
    }
}

/// Records every batch and checks the report-time invariants: batches are
/// never empty or oversized, entries never sit below the minimum order,
/// and every entry is isolated at the moment it is reported.
pub(crate) struct RecordingDevice {
    alloc: Arc<ModelAllocator>,
    batches: StdMutex<Vec<Vec<Block>>>,
    limits: StdMutex<(usize, u32)>,
    gate: StdMutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl RecordingDevice {
    pub(crate) fn new(alloc: Arc<ModelAllocator>) -> RecordingDevice {
        RecordingDevice {
            alloc,
            batches: StdMutex::new(Vec::new()),
            limits: StdMutex::new((usize::MAX, 0)),
            gate: StdMutex::new(None),
        }
    }

    pub(crate) fn set_limits(&self, capacity: usize, min_order: u32) {
        *self.limits.lock().unwrap() = (capacity, min_order);
    }

    /// Block the callback until the test says go. Returns the release
    /// sender and the "callback entered" receiver.
    pub(crate) fn gate(&self) -> (Sender<()>, Receiver<()>) {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        (release_tx, entered_rx)
    }

    pub(crate) fn batches(&self) -> Vec<Vec<Block>> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn report_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl ReportDevice for RecordingDevice {
    fn report(&self, batch: &[Block]) {
        let (capacity, min_order) = *self.limits.lock().unwrap();
        assert!(
            !batch.is_empty() && batch.len() <= capacity,
            "batch of {} entries out of bounds",
            batch.len()
        );
        for block in batch {
            assert!(
                block.order >= min_order,
                "reported {} below minimum order {}",
                block,
                min_order
            );
            assert!(
                self.alloc.is_isolated(block.pfn),
                "reported {} is not isolated",
                block
            );
        }
        self.batches.lock().unwrap().push(batch.to_vec());

        let pair = self
            .gate
            .lock()
            .unwrap()
            .as_ref()
            .map(|(tx, rx)| (tx.clone(), rx.clone()));
        if let Some((entered_tx, release_rx)) = pair {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
        }
    }
}

/// A device that ignores everything; useful as a "foreign" configuration.
pub(crate) struct NullDevice;

impl ReportDevice for NullDevice {
    fn report(&self, _batch: &[Block]) {}
}

/// Test harness pairing a model allocator with an engine.
#[derive(Clone)]
pub(crate) struct Harness {
    pub(crate) alloc: Arc<ModelAllocator>,
    pub(crate) device: Arc<RecordingDevice>,
    pub(crate) engine: Arc<PageReporting<ModelAllocator>>,
}

impl Harness {
    pub(crate) fn regions(spans: &[(RegionId, u64, usize)]) -> Harness {
        let spans: Vec<(RegionId, RegionSpan)> = spans
            .iter()
            .map(|&(id, base, pages)| (id, RegionSpan::new(Pfn(base), Pfn(base) + pages as u64)))
            .collect();
        let alloc = Arc::new(ModelAllocator::new(&spans));
        let device = Arc::new(RecordingDevice::new(Arc::clone(&alloc)));
        let engine = Arc::new(PageReporting::new(Arc::clone(&alloc)));
        Harness {
            alloc,
            device,
            engine,
        }
    }

    /// Single region 0 starting at pfn 0.
    pub(crate) fn one_region(pages: usize) -> Harness {
        Harness::regions(&[(0, 0, pages)])
    }

    pub(crate) fn enable(&self, capacity: u32, delay_ms: u64) {
        self.device.set_limits(capacity as usize, 9);
        let config = ReportingConfig {
            device: self.device.clone() as Arc<dyn ReportDevice>,
            capacity,
            min_order: 9,
            delay: Duration::from_millis(delay_ms),
        };
        self.engine.enable(config).expect("enable succeeds");
    }

    pub(crate) fn disable(&self) {
        let device = self.device.clone() as Arc<dyn ReportDevice>;
        self.engine.disable(&device);
    }

    /// Allocator free path: link the block, then run the hook, all under
    /// the region lock. Refuses to free a block the scanner holds
    /// isolated (a real allocator cannot free what is not allocated);
    /// re-freeing an already-free block is allowed so tests can exercise
    /// duplicate marks.
    pub(crate) fn free(&self, region: RegionId, pfn: Pfn, order: u32) -> bool {
        let migratetype = MigrateType(((pfn.as_u64() >> 9) & 3) as u8);
        self.alloc
            .with_region(region, |r| {
                if r.isolated.contains_key(&pfn.as_u64()) {
                    return false;
                }
                r.free.entry(pfn.as_u64()).or_insert((order, migratetype));
                self.engine.notify_free(region, pfn, order);
                true
            })
            .unwrap_or(false)
    }

    /// Allocator allocate path: hook first, then unlink, under the lock.
    pub(crate) fn alloc_block(&self, region: RegionId, pfn: Pfn) -> bool {
        self.alloc
            .with_region(region, |r| {
                if !r.free.contains_key(&pfn.as_u64()) {
                    return false;
                }
                self.engine.notify_alloc(region, pfn);
                r.free.remove(&pfn.as_u64());
                true
            })
            .unwrap_or(false)
    }

    pub(crate) fn is_free(&self, region: RegionId, pfn: Pfn) -> bool {
        self.alloc
            .with_region(region, |r| r.free.contains_key(&pfn.as_u64()))
            .unwrap_or(false)
    }

    /// Pending-candidate estimate of `region`, 0 when disabled.
    pub(crate) fn pending(&self, region: RegionId) -> usize {
        self.engine
            .active
            .load_full()
            .and_then(|state| state.region(region).map(|r| r.index.pending()))
            .unwrap_or(0)
    }

    /// Whether `region` has latched a scan request.
    pub(crate) fn requested(&self, region: RegionId) -> bool {
        self.engine
            .active
            .load_full()
            .and_then(|state| state.region(region).map(|r| r.index.is_requested()))
            .unwrap_or(false)
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn isolate_requires_exact_head() {
        let alloc = ModelAllocator::new(&[(0, RegionSpan::new(Pfn(0), Pfn(1 << 14)))]);
        alloc.with_region(0, |r| {
            r.free.insert(0, (9, MigrateType(1)));
            assert!(r.isolate(Pfn(512), 9).is_err());
            assert!(r.isolate(Pfn(0), 10).is_err());
            assert!(r.isolate(Pfn(0), 9).is_ok());
            // Not on the free list anymore.
            assert!(r.free_block(Pfn(0), 9).is_none());
            assert!(r.isolate(Pfn(0), 9).is_err());
            r.release(Pfn(0), 9, MigrateType(1));
            assert_eq!(r.free_block(Pfn(0), 9).unwrap().order, 9);
        });
    }

    #[test]
    fn free_block_filters_small_orders() {
        let alloc = ModelAllocator::new(&[(0, RegionSpan::new(Pfn(0), Pfn(1 << 14)))]);
        alloc.with_region(0, |r| {
            r.free.insert(0, (8, MigrateType(0)));
            assert!(r.free_block(Pfn(0), 9).is_none());
            assert!(r.free_block(Pfn(0), 8).is_some());
        });
    }
}
