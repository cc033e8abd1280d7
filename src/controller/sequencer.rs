// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! State machine walking the agreed order one message per step.

use std::sync::Arc;

use serde::Serialize;

use super::SimulationError;
use crate::model::Message;

/// Lifecycle of the reply phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    /// Reply phase not started.
    Idle,
    /// Walking the agreed order.
    Running,
    /// Agreed order exhausted.
    Complete,
    /// Torn down while running.
    Cancelled,
}

/// What the sequencer wants done on one step.
#[derive(Clone, Debug)]
pub enum Tick {
    /// Not running, nothing to do.
    Inactive,
    /// The order was exhausted on this step, the sequencer is now complete.
    Exhausted,
    /// Every server should try to reply to this message.
    Message(Arc<Message>),
}

/// Cursor over the agreed order plus a progress counter.
#[derive(Clone, Debug)]
pub struct ReplySequencer {
    state: SequencerState,
    order: Vec<Arc<Message>>,
    cursor: usize,
    progress: usize,
}

impl ReplySequencer {
    /// Creates an idle sequencer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SequencerState::Idle,
            order: Vec::new(),
            cursor: 0,
            progress: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SequencerState {
        self.state
    }

    /// Starts walking `order` from the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::AlreadyRunning`] if a walk is in progress.
    pub fn start(&mut self, order: Vec<Arc<Message>>) -> Result<(), SimulationError> {
        if self.state == SequencerState::Running {
            return Err(SimulationError::AlreadyRunning);
        }
        self.order = order;
        self.cursor = 0;
        self.progress = 0;
        self.state = SequencerState::Running;
        Ok(())
    }

    /// Takes the message at the cursor and advances past it.
    pub fn tick(&mut self) -> Tick {
        if self.state != SequencerState::Running {
            return Tick::Inactive;
        }
        let Some(message) = self.order.get(self.cursor) else {
            self.state = SequencerState::Complete;
            return Tick::Exhausted;
        };
        let message = Arc::clone(message);
        self.progress += 1;
        self.cursor += 1;
        Tick::Message(message)
    }

    /// Stops a running walk. Returns `true` iff it was running.
    pub fn cancel(&mut self) -> bool {
        if self.state != SequencerState::Running {
            return false;
        }
        self.state = SequencerState::Cancelled;
        true
    }

    /// Number of messages handled so far.
    #[must_use]
    pub const fn steps_done(&self) -> usize {
        self.progress
    }

    /// Length of the order being walked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Progress through the order in percent.
    ///
    /// A completed walk over an empty order counts as 100.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.is_empty() {
            return if self.state == SequencerState::Complete {
                100.0
            } else {
                0.0
            };
        }
        self.progress as f64 / self.order.len() as f64 * 100.0
    }
}

impl Default for ReplySequencer {
    fn default() -> Self {
        Self::new()
    }
}
