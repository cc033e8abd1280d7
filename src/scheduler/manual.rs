// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::trace;

use super::{ScheduleHandle, ScheduledTask, Scheduler};

/// Deterministic [`Scheduler`] with a virtual clock.
///
/// Nothing fires on its own. [`ManualScheduler::advance`] moves the clock
/// forward and runs every due task in deadline order, ties broken by
/// scheduling order. Tasks may schedule further tasks while running.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<TaskQueue>,
}

#[derive(Default)]
struct TaskQueue {
    now: Duration,
    next_seq: u64,
    tasks: BTreeMap<(Duration, u64), (ScheduleHandle, ScheduledTask)>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time, starting at zero.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Number of tasks that are scheduled and not cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|(handle, _)| !handle.is_cancelled())
            .count()
    }

    /// Moves the clock forward by `by`, running all tasks due until then.
    ///
    /// Returns the number of tasks that ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().now + by;
        let fired = self.run_due(Some(target));
        self.lock().now = target;
        fired
    }

    /// Runs tasks until none are left, moving the clock as needed.
    ///
    /// Returns the number of tasks that ran. Does not return if tasks keep
    /// scheduling new tasks forever.
    pub fn run_until_idle(&self) -> usize {
        self.run_due(None)
    }

    fn run_due(&self, until: Option<Duration>) -> usize {
        let mut fired = 0;
        loop {
            let task = {
                let mut queue = self.lock();
                let Some(entry) = queue.tasks.first_entry() else {
                    break;
                };
                let (deadline, _) = *entry.key();
                if until.is_some_and(|until| deadline > until) {
                    break;
                }
                let (handle, task) = entry.remove();
                queue.now = deadline;
                if handle.is_cancelled() {
                    trace!("dropping cancelled task due at {deadline:?}");
                    continue;
                }
                task
            };
            // queue lock is released here, the task may schedule more tasks
            task();
            fired += 1;
        }
        fired
    }

    fn lock(&self) -> MutexGuard<'_, TaskQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) -> ScheduleHandle {
        let handle = ScheduleHandle::new();
        let mut queue = self.lock();
        let deadline = queue.now + delay;
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.tasks.insert((deadline, seq), (handle.clone(), task));
        handle
    }
}
