// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use log::debug;
use rand::RngCore;
use rand::seq::IndexedRandom;

use super::{OrderAgreement, Proposal};

/// Picks one proposal uniformly at random.
///
/// Empty or diverging proposals are as likely to be chosen as any other one.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomPick;

impl OrderAgreement for RandomPick {
    fn choose_order<'p>(
        &mut self,
        proposals: &'p [Proposal],
        rng: &mut dyn RngCore,
    ) -> Option<&'p Proposal> {
        let chosen = proposals.choose(rng)?;
        debug!(
            "picked proposal of server {} out of {}",
            chosen.server(),
            proposals.len()
        );
        Some(chosen)
    }
}
