// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deferred scan scheduling.
//!
//! One worker thread exists per active configuration. It sits idle on a
//! channel; the first region to cross the request threshold sends a single
//! wake (the configuration refcount gates the 0 -> 1 edge). The worker
//! then waits out a debounce interval so a burst of frees can build a
//! sizeable batch -- further wakes during that window are absorbed into
//! the same cycle -- and runs the scanner round-robin over all regions
//! until none has pending candidates and every outstanding scan request
//! has been retired.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::trace;

use crate::backend::ReportingBackend;
use crate::error::ReportError;
use crate::lifecycle::ReportingState;
use crate::scanner;

/// Wake-ups delivered to the reporting worker.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Wake {
    /// At least one region crossed the request threshold.
    Scan,
    /// The configuration is being disabled.
    Exit,
}

pub(crate) fn spawn<A: ReportingBackend>(
    state: Arc<ReportingState<A>>,
    rx: Receiver<Wake>,
) -> Result<thread::JoinHandle<()>, ReportError> {
    thread::Builder::new()
        .name("page-reporting".into())
        .spawn(move || worker(state, rx))
        .map_err(|_| ReportError::OutOfMemory)
}

/// Idle -> Pending (debounce) -> Running -> Idle, until told to exit.
fn worker<A: ReportingBackend>(state: Arc<ReportingState<A>>, rx: Receiver<Wake>) {
    loop {
        // Idle: nothing to do until a region requests a scan.
        match rx.recv() {
            Ok(Wake::Scan) => {}
            Ok(Wake::Exit) | Err(_) => break,
        }

        // Pending: hold off so the free path can queue up more candidates.
        // An Exit here wins; a pending cycle never starts running once
        // disable has begun.
        let deadline = Instant::now() + state.delay;
        let mut exit = false;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(Wake::Scan) => continue,
                Ok(Wake::Exit) | Err(RecvTimeoutError::Disconnected) => {
                    exit = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        if exit || state.is_shutdown() {
            break;
        }

        // Running: drain candidates across all regions. A request that
        // arrives while a cycle runs bumps the refcount without a wake
        // (the 0 -> 1 edge already fired), so keep cycling until the
        // count drains rather than trusting the channel.
        while !state.is_shutdown() {
            scanner::process(&state);
            if !state.has_requests() {
                break;
            }
        }
    }
    trace!("reporting worker exiting");
}
