// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Delayed execution of reply steps.
//!
//! The [`Scheduler`] trait runs a task once after a delay and hands out a
//! [`ScheduleHandle`] that can revoke the task before it fires.
//!
//! Two implementations are provided:
//! - [`TokioScheduler`] sleeps on a [`tokio`] runtime in real time.
//! - [`ManualScheduler`] keeps a virtual clock that is advanced explicitly,
//!   for deterministic tests.

mod manual;
mod timer;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use self::manual::ManualScheduler;
pub use self::timer::TokioScheduler;

/// Task to run once its delay has passed.
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task, used to cancel it.
///
/// Clones refer to the same task.
#[derive(Clone, Debug, Default)]
pub struct ScheduleHandle {
    token: CancellationToken,
}

impl ScheduleHandle {
    /// Creates a handle for a task that is not cancelled yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Revokes the task. It will not run if it has not started yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Abstraction for running tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Runs `task` once, `delay` from now, unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle;
}
