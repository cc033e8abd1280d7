// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Self-driving reply phase.
//!
//! A [`Session`] owns a [`SimulationController`] and a [`Scheduler`]. Once the
//! reply sequence is started, the session runs one step right away and then
//! one more step per delay, until the agreed order is exhausted. After each
//! step a [`SessionEvent`] is sent to the receiver returned on creation.
//!
//! The handle of the next pending step is kept, so [`Session::cancel`] and
//! dropping the session revoke it before it fires.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::trace;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::agreement::AgreedOrder;
use crate::controller::{Report, SimulationController, SimulationError, StepOutcome, StepSnapshot};
use crate::scheduler::{ScheduleHandle, Scheduler};

/// Progress notifications emitted by a [`Session`].
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// One reply step was applied to every server.
    Step(StepSnapshot),
    /// The agreed order is exhausted.
    Complete(Box<Report>),
    /// The reply sequence was cancelled while running.
    Cancelled,
}

struct Shared {
    controller: SimulationController,
    /// Next scheduled step, if any.
    pending: Option<ScheduleHandle>,
    /// Bumped whenever the pending step is replaced or revoked. A fired task
    /// only runs if it still carries the current value.
    generation: u64,
    events: UnboundedSender<SessionEvent>,
}

impl Shared {
    fn revoke_pending(&mut self) {
        self.generation += 1;
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("session event receiver dropped");
        }
    }
}

/// Reply phase driven by a [`Scheduler`].
pub struct Session<S: Scheduler + 'static> {
    shared: Arc<Mutex<Shared>>,
    scheduler: Arc<S>,
    step_delay: Duration,
}

impl<S: Scheduler + 'static> Session<S> {
    /// Creates a new session, steps are `step_delay` apart.
    ///
    /// Returns the session and the receiver for its events.
    #[must_use]
    pub fn new(
        controller: SimulationController,
        scheduler: Arc<S>,
        step_delay: Duration,
    ) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = unbounded_channel();
        let shared = Shared {
            controller,
            pending: None,
            generation: 0,
            events,
        };
        let session = Self {
            shared: Arc::new(Mutex::new(shared)),
            scheduler,
            step_delay,
        };
        (session, receiver)
    }

    /// Runs the broadcast phase, see [`SimulationController::broadcast`].
    pub fn broadcast(&self) {
        self.lock().controller.broadcast();
    }

    /// Runs the agreement phase, see [`SimulationController::agree_order`].
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::NoAgreedOrder`] if no order was chosen.
    pub fn agree_order(&self) -> Result<AgreedOrder, SimulationError> {
        self.lock().controller.agree_order()
    }

    /// Starts the reply phase and runs its first step.
    ///
    /// Later steps follow one per step delay, driven by the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::NoAgreedOrder`] before agreement and
    /// [`SimulationError::AlreadyRunning`] while a reply phase is running.
    pub fn start_reply_sequence(&self) -> Result<(), SimulationError> {
        let mut shared = self.lock();
        shared.controller.start_reply_sequence()?;
        run_step(&mut shared, &self.shared, &self.scheduler, self.step_delay);
        Ok(())
    }

    /// Stops a running reply phase and revokes the pending step.
    ///
    /// Returns `true` iff the reply phase was running.
    pub fn cancel(&self) -> bool {
        let mut shared = self.lock();
        shared.revoke_pending();
        let cancelled = shared.controller.cancel_replies();
        if cancelled {
            shared.emit(SessionEvent::Cancelled);
        }
        cancelled
    }

    /// Returns `true` iff a step is scheduled and not yet run.
    #[must_use]
    pub fn has_pending_step(&self) -> bool {
        self.lock()
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }

    /// Runs `f` with read access to the controller, e.g. for queries.
    pub fn inspect<T>(&self, f: impl FnOnce(&SimulationController) -> T) -> T {
        f(&self.lock().controller)
    }

    /// Current results of all controller queries.
    #[must_use]
    pub fn report(&self) -> Report {
        self.inspect(SimulationController::report)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }
}

impl<S: Scheduler + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies one step and schedules the next one if the phase goes on.
fn run_step<S: Scheduler + 'static>(
    shared: &mut Shared,
    handle: &Arc<Mutex<Shared>>,
    scheduler: &Arc<S>,
    delay: Duration,
) {
    shared.revoke_pending();
    match shared.controller.step() {
        StepOutcome::Inactive => trace!("step fired while reply phase is not running"),
        StepOutcome::Complete => {
            let report = shared.controller.report();
            shared.emit(SessionEvent::Complete(Box::new(report)));
        }
        StepOutcome::Replied(snapshot) => {
            shared.emit(SessionEvent::Step(snapshot));
            let generation = shared.generation;
            let next = schedule_step(
                Arc::downgrade(handle),
                Arc::clone(scheduler),
                delay,
                generation,
            );
            shared.pending = Some(next);
        }
    }
}

fn schedule_step<S: Scheduler + 'static>(
    shared: Weak<Mutex<Shared>>,
    scheduler: Arc<S>,
    delay: Duration,
    generation: u64,
) -> ScheduleHandle {
    let sched = Arc::clone(&scheduler);
    scheduler.schedule(
        delay,
        Box::new(move || {
            let Some(shared) = shared.upgrade() else {
                trace!("session gone before step fired");
                return;
            };
            let mut guard = lock_shared(&shared);
            if guard.generation != generation {
                trace!("stale step {generation} ignored, current is {}", guard.generation);
                return;
            }
            run_step(&mut guard, &shared, &sched, delay);
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SequencerState;
    use crate::model::MessageStatus;
    use crate::scheduler::{ManualScheduler, ScheduledTask};
    use crate::test_utils::reference_scenario;

    const DELAY: Duration = Duration::from_secs(1);

    fn session(seed: u64) -> (Session<ManualScheduler>, Arc<ManualScheduler>, UnboundedReceiver<SessionEvent>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let (session, events) = Session::new(reference_scenario(seed), Arc::clone(&scheduler), DELAY);
        session.broadcast();
        session.agree_order().unwrap();
        (session, scheduler, events)
    }

    fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn steps_one_per_delay() {
        let (session, scheduler, mut events) = session(1);
        session.start_reply_sequence().unwrap();

        // first step runs right away
        let first = drain(&mut events);
        assert_eq!(first.len(), 1);
        assert!(matches!(&first[0], SessionEvent::Step(s) if s.step == 1));
        assert!(session.has_pending_step());

        assert_eq!(scheduler.advance(DELAY / 2), 0);
        assert!(drain(&mut events).is_empty());

        for step in 2..=4 {
            assert_eq!(scheduler.advance(DELAY), 1);
            let evs = drain(&mut events);
            assert!(matches!(&evs[..], [SessionEvent::Step(s)] if s.step == step));
        }
        assert_eq!(session.inspect(SimulationController::reply_progress_percent), 100.0);

        // one more step observes exhaustion
        assert_eq!(scheduler.advance(DELAY), 1);
        let evs = drain(&mut events);
        let [SessionEvent::Complete(report)] = &evs[..] else {
            panic!("expected completion, got {evs:?}");
        };
        assert_eq!(report.state, SequencerState::Complete);
        assert!(!session.has_pending_step());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn snapshots_follow_agreed_order() {
        let (session, scheduler, mut events) = session(2);
        let agreed = session.inspect(|c| c.agreed_order().unwrap());
        session.start_reply_sequence().unwrap();
        scheduler.run_until_idle();
        let handled: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Step(s) => Some(s.message),
                _ => None,
            })
            .collect();
        assert_eq!(handled, agreed);
        session.inspect(|c| {
            for client in 0..2 {
                for local in 0..2 {
                    assert_eq!(
                        c.client_message_status(client, local),
                        Ok(MessageStatus::Responded)
                    );
                }
            }
        });
    }

    #[test]
    fn cancel_revokes_pending_step() {
        let (session, scheduler, mut events) = session(3);
        session.start_reply_sequence().unwrap();
        scheduler.advance(DELAY);
        assert!(session.cancel());
        assert!(!session.has_pending_step());
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.run_until_idle(), 0);

        let evs = drain(&mut events);
        assert_eq!(evs.len(), 3);
        assert_eq!(evs[2], SessionEvent::Cancelled);
        assert_eq!(session.inspect(SimulationController::reply_progress_percent), 50.0);
        assert!(!session.cancel());
    }

    #[test]
    fn drop_revokes_pending_step() {
        let (session, scheduler, mut events) = session(4);
        session.start_reply_sequence().unwrap();
        assert_eq!(scheduler.pending(), 1);
        drop(session);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.run_until_idle(), 0);
        let evs = drain(&mut events);
        assert_eq!(evs.last(), Some(&SessionEvent::Cancelled));
    }

    #[test]
    fn restart_after_cancel() {
        let (session, scheduler, _events) = session(5);
        session.start_reply_sequence().unwrap();
        session.cancel();
        session.start_reply_sequence().unwrap();
        scheduler.run_until_idle();
        let report = session.report();
        assert_eq!(report.state, SequencerState::Complete);
        assert_eq!(report.replies_sent[&0].len(), 4);
    }

    /// Keeps every task and runs it on demand, ignoring its handle.
    #[derive(Default)]
    struct IgnoresCancel {
        tasks: Mutex<Vec<ScheduledTask>>,
    }

    impl IgnoresCancel {
        fn take(&self) -> Vec<ScheduledTask> {
            std::mem::take(&mut *self.tasks.lock().unwrap())
        }
    }

    impl Scheduler for IgnoresCancel {
        fn schedule(&self, _delay: Duration, task: ScheduledTask) -> ScheduleHandle {
            self.tasks.lock().unwrap().push(task);
            ScheduleHandle::new()
        }
    }

    fn steps(events: Vec<SessionEvent>) -> Vec<usize> {
        events
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Step(s) => Some(s.step),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn revoked_step_ignored_after_restart() {
        let scheduler = Arc::new(IgnoresCancel::default());
        let (session, mut events) =
            Session::new(reference_scenario(6), Arc::clone(&scheduler), DELAY);
        session.broadcast();
        session.agree_order().unwrap();

        session.start_reply_sequence().unwrap();
        let revoked = scheduler.take();
        assert_eq!(revoked.len(), 1);
        assert!(session.cancel());
        session.start_reply_sequence().unwrap();
        assert_eq!(steps(drain(&mut events)), vec![1, 1]);

        // revoked task fires late, the restarted run is untouched
        for task in revoked {
            task();
        }
        assert!(drain(&mut events).is_empty());
        assert_eq!(session.inspect(SimulationController::reply_progress_percent), 25.0);
        assert!(session.has_pending_step());

        // exactly one chain drives the restarted run
        let mut expected = 2;
        loop {
            let mut live = scheduler.take();
            if live.is_empty() {
                break;
            }
            assert_eq!(live.len(), 1);
            (live.remove(0))();
            let evs = drain(&mut events);
            match &evs[..] {
                [SessionEvent::Step(s)] => assert_eq!(s.step, expected),
                [SessionEvent::Complete(_)] => assert_eq!(expected, 5),
                other => panic!("unexpected events {other:?}"),
            }
            expected += 1;
        }
        assert_eq!(session.report().state, SequencerState::Complete);
    }

    #[test]
    fn start_errors_surface() {
        let scheduler = Arc::new(ManualScheduler::new());
        let (session, _events) = Session::new(reference_scenario(0), scheduler, DELAY);
        assert_eq!(session.start_reply_sequence(), Err(SimulationError::NoAgreedOrder));
        session.broadcast();
        session.agree_order().unwrap();
        session.start_reply_sequence().unwrap();
        assert_eq!(session.start_reply_sequence(), Err(SimulationError::AlreadyRunning));
    }
}
