// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use log::trace;
use tokio::runtime::Handle;

use super::{ScheduleHandle, ScheduledTask, Scheduler};

/// Real-time [`Scheduler`] backed by a [`tokio`] runtime.
///
/// Each scheduled task becomes a spawned task that sleeps for the delay.
/// Cancellation wins over an expired sleep when both are ready.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    /// Creates a scheduler spawning onto the given runtime.
    #[must_use]
    pub const fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Creates a scheduler spawning onto the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a [`tokio`] runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle {
        let handle = ScheduleHandle::new();
        let token = handle.token().clone();
        self.runtime.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => trace!("scheduled task cancelled"),
                () = tokio::time::sleep(delay) => task(),
            }
        });
        handle
    }
}
