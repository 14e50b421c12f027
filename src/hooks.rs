// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Allocator hot-path entry points.
//!
//! Both hooks run inside the allocator's region lock and never block: they
//! load the published configuration, update the candidate index, and at
//! most send one non-blocking wake. While reporting is disabled they cost
//! one atomic load.

use crate::backend::{RegionId, ReportingBackend};
use crate::block::Pfn;
use crate::lifecycle::PageReporting;

impl<A: ReportingBackend> PageReporting<A> {
    /// Free-path hook: the block of `1 << order` pages starting at `pfn`
    /// was just linked into `region`'s free list.
    ///
    /// The caller must hold the region lock and must call this after the
    /// block is on the free list. Frees below the configured minimum
    /// order are not interesting to the report consumer and are ignored.
    pub fn notify_free(&self, region: RegionId, pfn: Pfn, order: u32) {
        let state = match self.active.load_full() {
            Some(state) => state,
            None => return,
        };
        if order < state.min_order {
            return;
        }
        let region = match state.region(region) {
            Some(region) => region,
            None => return,
        };

        // Ask for a scan only once a batch's worth of candidates has
        // built up, and only if this region has not asked already.
        if region.index.mark(pfn)
            && !region.index.is_requested()
            && region.index.pending() >= state.capacity
        {
            state.request_scan(region);
        }
    }

    /// Allocate-path hook: the block containing `pfn` is about to leave
    /// `region`'s free list.
    ///
    /// Clears the candidate bit so the scanner will not waste a pass on
    /// (or worse, report) a block that is live again. The caller must
    /// hold the region lock and must call this before the block is
    /// unlinked.
    pub fn notify_alloc(&self, region: RegionId, pfn: Pfn) {
        let state = match self.active.load_full() {
            Some(state) => state,
            None => return,
        };
        if let Some(region) = state.region(region) {
            region.index.unmark_if_set(pfn);
        }
    }
}
