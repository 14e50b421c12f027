// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The scan cycle: turn candidate bits into validated, isolated, reported
//! and released blocks.
//!
//! The candidate index only ever holds hints. For every bit the scanner
//! clears it first, then re-reads the allocator's free-list state and
//! isolates the block, all under the region lock. Anything that fails that
//! gauntlet was a stale hint and is skipped; anything that passes is
//! exclusively ours until we hand it back. The report callback runs with
//! no lock held and may block.

use log::{trace, warn};

use crate::backend::{ReportingBackend, RegionOps};
use crate::block::Block;
use crate::lifecycle::{RegionReporting, ReportingState, MAX_REPORTING_REGIONS};

/// Outcome of one pass over a region's candidate snapshot.
enum Pass {
    /// Snapshot processed to the end.
    Completed {
        emitted_full: bool,
        ended_partial: bool,
    },
    /// The region is gone, or no memory for the snapshot; leftover bits
    /// stay marked for a later cycle.
    Aborted,
}

/// Round-robin over all regions until none has pending candidates.
///
/// A region leaves the rotation when it drains, when it gives up (two
/// passes in a row ended without filling a batch, meaning the allocator
/// cannot keep a batch's worth of blocks around), or when it vanishes.
/// Bits set while a pass is running are picked up by the next pass, never
/// the current one, so each pass is finite.
pub(crate) fn process<A: ReportingBackend>(state: &ReportingState<A>) {
    let mut done = [false; MAX_REPORTING_REGIONS];
    let mut partial_streak = [0u8; MAX_REPORTING_REGIONS];

    loop {
        let mut busy = false;
        for (slot, region) in state.regions.iter().enumerate() {
            if state.is_shutdown() {
                return;
            }
            if done[slot] {
                continue;
            }
            if region.index.pending() == 0 {
                state.finish_region(region);
                done[slot] = true;
                continue;
            }

            busy = true;
            match scan_region(state, region) {
                Pass::Completed {
                    emitted_full,
                    ended_partial,
                } => {
                    if emitted_full {
                        partial_streak[slot] = 0;
                    }
                    // A pass that never fills a batch counts against the
                    // region whether it ended on a partial emit or staged
                    // nothing at all (every candidate stale).
                    if ended_partial || !emitted_full {
                        partial_streak[slot] += 1;
                        if partial_streak[slot] >= 2 {
                            state.finish_region(region);
                            done[slot] = true;
                        }
                    }
                }
                Pass::Aborted => {
                    state.finish_region(region);
                    done[slot] = true;
                }
            }
        }
        if !busy {
            return;
        }
    }
}

/// One pass: drain the bits that were set at entry.
fn scan_region<A: ReportingBackend>(state: &ReportingState<A>, region: &RegionReporting) -> Pass {
    let snapshot = match region.index.set_bits() {
        Ok(snapshot) => snapshot,
        Err(_) => return Pass::Aborted,
    };

    let mut batch = state.take_batch();
    let mut emitted_full = false;
    let mut ended_partial = false;

    for idx in snapshot {
        if state.is_shutdown() {
            break;
        }
        let pfn = region.index.block_pfn(idx);
        let staged = state.backend.with_region(region.id, |r| {
            // Clear before re-validating: a free that lands after this
            // point re-sets the bit and the block is looked at again on
            // the next cycle, instead of being lost.
            if !region.index.unmark_if_set(pfn) {
                // Already cleared, i.e. we raced with the allocate hook.
                return None;
            }
            let blk = r.free_block(pfn, state.min_order)?;
            if r.isolate(pfn, blk.order).is_err() {
                return None;
            }
            // A block that grew past the minimum order since it was
            // marked is isolated and reported whole.
            Some(Block {
                pfn,
                order: blk.order,
                migratetype: blk.migratetype,
            })
        });

        let staged = match staged {
            Some(staged) => staged,
            None => {
                // Region vanished underneath us. Whatever is already
                // staged still gets reported and handed back.
                if !batch.is_empty() {
                    emit(state, region, &mut batch);
                }
                state.put_batch(batch);
                return Pass::Aborted;
            }
        };
        if let Some(block) = staged {
            batch.push(block);
            if batch.len() == state.capacity {
                emit(state, region, &mut batch);
                emitted_full = true;
            }
        }
    }

    // Partial batches are emitted at pass end so sparse regions still make
    // progress.
    if !batch.is_empty() {
        emit(state, region, &mut batch);
        ended_partial = true;
    }
    state.put_batch(batch);

    Pass::Completed {
        emitted_full,
        ended_partial,
    }
}

/// Report a staged batch, then hand every entry back to the allocator.
///
/// The consumer is advisory: whatever it did or did not do with the
/// batch, the blocks go back onto their free lists at their original
/// order and migration class before the scanner continues.
fn emit<A: ReportingBackend>(
    state: &ReportingState<A>,
    region: &RegionReporting,
    batch: &mut Vec<Block>,
) {
    debug_assert!(!batch.is_empty() && batch.len() <= state.capacity);
    trace!("reporting {} block(s) from region {}", batch.len(), region.id);

    state.device.report(batch);

    let released = state.backend.with_region(region.id, |r| {
        for block in batch.iter() {
            r.release(block.pfn, block.order, block.migratetype);
        }
    });
    if released.is_none() {
        warn!(
            "region {} disappeared with {} isolated block(s)",
            region.id,
            batch.len()
        );
    }
    batch.clear();
}
