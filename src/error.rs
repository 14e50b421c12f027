// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Errors surfaced by the reporting lifecycle.
//!
//! Only `enable`/`disable` return errors to the caller. Everything that can
//! go wrong during a scan (stale candidate bits, failed isolations, the
//! consumer misbehaving) is handled internally and retried or dropped.

use arrayvec::CapacityError;
use crossbeam_utils::CachePadded;
use custom_error::custom_error;

use crate::lifecycle::RegionReporting;

custom_error! {
#[derive(PartialEq, Clone)]
pub ReportError
    Busy = "A reporting configuration is already active.",
    InvalidCapacity = "The batch capacity must be at least one block.",
    OutOfMemory = "Unable to allocate candidate tracking state.",
    CapacityOverflow = "The allocator exposes more regions than the engine can track.",
}

impl From<fallible_collections::TryReserveError> for ReportError {
    fn from(_e: fallible_collections::TryReserveError) -> Self {
        ReportError::OutOfMemory
    }
}

impl From<CapacityError<CachePadded<RegionReporting>>> for ReportError {
    fn from(_e: CapacityError<CachePadded<RegionReporting>>) -> Self {
        ReportError::CapacityOverflow
    }
}
