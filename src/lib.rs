// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ordersim: a stepped simulator of client broadcast and agreed-order replies.
//!
//! Clients broadcast their messages to a set of servers. Each server observes
//! the messages in its own random arrival order. The group then agrees on one
//! total order, and servers reply to the owning clients one message at a time.
//!
//! The main entry points are:
//! - [`SimulationController`] runs the broadcast, agreement and reply phases.
//! - [`Session`] drives the reply phase on a [`Scheduler`], one step per tick.
//! - [`SimulationConfig`] describes the clients, servers and messages to set up.

#![deny(rustdoc::broken_intra_doc_links)]

pub mod agreement;
pub mod config;
pub mod controller;
pub mod logging;
pub mod model;
pub mod scheduler;
pub mod session;
#[cfg(test)]
pub mod test_utils;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use self::agreement::{OrderAgreement, RandomPick};
pub use self::config::{SimulationConfig, Topology};
pub use self::controller::{SimulationController, SimulationError, StepOutcome, StepSnapshot};
pub use self::scheduler::{Scheduler, ScheduleHandle};
pub use self::session::{Session, SessionEvent};

/// Client ID number type.
pub type ClientId = usize;
/// Server ID number type.
pub type ServerId = usize;
/// Message ID number type, local to the owning client.
pub type LocalId = usize;

/// Identity of a message: the owning client plus the client-local ID.
///
/// All deduplication and lookups go through this key, never through the
/// address of a particular [`model::Message`] instance.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageKey {
    pub owner: ClientId,
    pub local: LocalId,
}

impl MessageKey {
    /// Creates a key for message `local` of client `owner`.
    #[must_use]
    pub const fn new(owner: ClientId, local: LocalId) -> Self {
        Self { owner, local }
    }
}

/// Renders the display label, e.g. `M2-1` for message 1 of client 0.
///
/// Both IDs are shown 1-based.
impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}-{}", self.local + 1, self.owner + 1)
    }
}
