// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Agreement on a single total order for the reply phase.
//!
//! Every server offers its arrived list as a [`Proposal`]. An [`OrderAgreement`]
//! picks the one proposal that drives the reply phase.
//!
//! This module provides one implementation of the [`OrderAgreement`] trait:
//! - [`RandomPick`] chooses one proposal uniformly at random.
//!
//! No implementation here checks proposals for validity or counts votes.
//!
//! # Examples
//!
//! ```rust
//! use ordersim::agreement::{OrderAgreement, Proposal, RandomPick};
//!
//! let proposals = vec![
//!     Proposal::new(0, Vec::new()),
//!     Proposal::new(1, Vec::new()),
//! ];
//! let mut agreement = RandomPick;
//! let chosen = agreement.choose_order(&proposals, &mut rand::rng());
//! assert!(chosen.is_some());
//! ```

mod random_pick;

use std::sync::Arc;

use rand::RngCore;
use serde::Serialize;

pub use self::random_pick::RandomPick;
use crate::model::Message;
use crate::{MessageKey, ServerId};

/// One server's candidate total order.
#[derive(Clone, Debug)]
pub struct Proposal {
    server: ServerId,
    order: Vec<Arc<Message>>,
}

impl Proposal {
    /// Creates the proposal of `server` from its arrival order.
    #[must_use]
    pub const fn new(server: ServerId, order: Vec<Arc<Message>>) -> Self {
        Self { server, order }
    }

    /// Server that offered this proposal.
    #[must_use]
    pub const fn server(&self) -> ServerId {
        self.server
    }

    #[must_use]
    pub fn order(&self) -> &[Arc<Message>] {
        &self.order
    }

    /// The proposed order as message keys.
    #[must_use]
    pub fn keys(&self) -> Vec<MessageKey> {
        self.order.iter().map(|m| m.key()).collect()
    }
}

/// Result of an agreement round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgreedOrder {
    /// Server whose proposal was chosen.
    pub proposer: ServerId,
    /// Chosen order.
    pub keys: Vec<MessageKey>,
}

/// Strategy for turning a set of proposals into the agreed order.
pub trait OrderAgreement: Send {
    /// Chooses the agreed order among `proposals`.
    ///
    /// Any randomness must be drawn from `rng`, so that runs with a seeded
    /// source are reproducible.
    /// Returns `None` iff no order can be chosen, e.g. without proposals.
    fn choose_order<'p>(
        &mut self,
        proposals: &'p [Proposal],
        rng: &mut dyn RngCore,
    ) -> Option<&'p Proposal>;
}
