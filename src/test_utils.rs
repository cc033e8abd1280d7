// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Utility functions for tests.

use crate::controller::{SimulationController, StepOutcome, StepSnapshot};
use crate::{MessageKey, SimulationConfig};

/// Two clients owning two messages each, fully connected to one server.
pub fn reference_scenario(seed: u64) -> SimulationController {
    let config = SimulationConfig::new(1, vec![2, 2]).with_seed(seed);
    SimulationController::new(&config)
}

/// Steps the controller until the reply phase stops.
///
/// Returns the snapshots of all steps that handled a message.
pub fn complete_replies(sim: &mut SimulationController) -> Vec<StepSnapshot> {
    let mut steps = Vec::new();
    while let StepOutcome::Replied(snapshot) = sim.step() {
        steps.push(snapshot);
    }
    steps
}

/// Returns the keys in ascending order.
pub fn sorted(mut keys: Vec<MessageKey>) -> Vec<MessageKey> {
    keys.sort_unstable();
    keys
}
