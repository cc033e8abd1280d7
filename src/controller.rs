// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Orchestration of the three simulation phases.
//!
//! [`SimulationController`] owns all clients and servers and runs:
//! 1. Broadcast: clients stage their messages at the linked servers, then
//!    every server lets them arrive in its own random order.
//! 2. Agreement: each server's arrived list becomes a proposal, and the
//!    configured [`OrderAgreement`] picks the agreed order.
//! 3. Replies: the [`ReplySequencer`] walks the agreed order, one message per
//!    [`SimulationController::step`], letting every server reply if gating allows.
//!
//! Stepping itself is not timed here, see [`crate::Session`] for that.
//! State is only exposed through queries returning keys and labels.

mod sequencer;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;

pub use self::sequencer::{ReplySequencer, SequencerState, Tick};
use crate::agreement::{AgreedOrder, OrderAgreement, Proposal, RandomPick};
use crate::config::SimulationConfig;
use crate::model::{Client, Message, MessageStatus, Server};
use crate::{ClientId, LocalId, MessageKey, ServerId};

/// Errors returned by [`SimulationController`] queries and phase calls.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    #[error("client does not own message {0}")]
    UnknownMessage(MessageKey),
    #[error("no agreed order available")]
    NoAgreedOrder,
    #[error("reply sequence is already running")]
    AlreadyRunning,
}

/// State pushed outward after each reply step.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepSnapshot {
    /// Number of messages handled so far, including this one.
    pub step: usize,
    /// Message handled in this step.
    pub message: MessageKey,
    /// Servers that sent a reply for the message in this step.
    pub replied_by: Vec<ServerId>,
    pub progress_percent: f64,
}

/// Result of a single [`SimulationController::step`].
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// One message of the agreed order was handled.
    Replied(StepSnapshot),
    /// The agreed order is exhausted, no further steps are needed.
    Complete,
    /// The reply phase is not running.
    Inactive,
}

/// Per-client part of a [`Report`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientReport {
    pub id: ClientId,
    /// Status of each owned message, by local ID.
    pub statuses: BTreeMap<LocalId, MessageStatus>,
}

/// Snapshot of every read-only query at once.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub arrived: BTreeMap<ServerId, Vec<MessageKey>>,
    pub proposals: BTreeMap<ServerId, Vec<MessageKey>>,
    pub agreed_order: Option<AgreedOrder>,
    pub state: SequencerState,
    pub progress_percent: f64,
    pub clients: Vec<ClientReport>,
    pub replies_sent: BTreeMap<ServerId, Vec<String>>,
}

/// Owner of the simulated clients and servers.
pub struct SimulationController {
    clients: Vec<Client>,
    servers: Vec<Server>,
    /// Number of completed broadcast phases.
    broadcasts: usize,
    /// Proposals of the latest agreement round.
    proposals: Vec<Proposal>,
    /// Order chosen in the latest agreement round.
    agreed: Option<Proposal>,
    sequencer: ReplySequencer,
    agreement: Box<dyn OrderAgreement>,
    reshuffle_proposals: bool,
    /// Source of all random choices.
    rng: StdRng,
}

impl SimulationController {
    /// Sets up clients, servers, messages and links as described by `config`.
    ///
    /// Links naming a client or server outside of the configured counts are
    /// skipped. Uses [`RandomPick`] for agreement.
    #[must_use]
    pub fn new(config: &SimulationConfig) -> Self {
        let mut clients: Vec<_> = (0..config.num_clients).map(Client::new).collect();
        let mut servers: Vec<_> = (0..config.num_servers).map(Server::new).collect();
        for (client, server) in config.links() {
            if client >= clients.len() || server >= servers.len() {
                warn!("skipping link between client {client} and server {server}");
                continue;
            }
            clients[client].add_server(server);
            servers[server].add_client(client);
        }
        for client in &mut clients {
            for local in 0..config.message_count(client.id()) {
                client.add_message(Arc::new(Message::new(local, client.id())));
            }
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            clients,
            servers,
            broadcasts: 0,
            proposals: Vec::new(),
            agreed: None,
            sequencer: ReplySequencer::new(),
            agreement: Box::new(RandomPick),
            reshuffle_proposals: config.reshuffle_proposals,
            rng,
        }
    }

    /// Replaces the agreement strategy.
    #[must_use]
    pub fn with_agreement(mut self, agreement: impl OrderAgreement + 'static) -> Self {
        self.agreement = Box::new(agreement);
        self
    }

    #[must_use]
    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    /// Runs the broadcast phase, including arrival at every server.
    ///
    /// Each client's messages and the order in which clients send are
    /// shuffled first. Messages that already arrived at a server are not
    /// staged there again.
    #[fastrace::trace]
    pub fn broadcast(&mut self) {
        for client in &mut self.clients {
            client.shuffle_messages(&mut self.rng);
        }
        let mut senders: Vec<ClientId> = (0..self.clients.len()).collect();
        senders.shuffle(&mut self.rng);
        for client in senders {
            self.clients[client].send_all(&mut self.servers);
        }
        for server in &mut self.servers {
            server.arrive(&mut self.rng);
            debug!(
                "server {} arrived: {}",
                server.id(),
                format_labels(server.arrived().iter().map(|m| m.key()))
            );
        }
        self.broadcasts += 1;
        info!("broadcast {} done", self.broadcasts);
    }

    /// Runs the agreement phase and returns the agreed order.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::NoAgreedOrder`] if the agreement strategy
    /// does not choose any proposal, e.g. because there are no servers.
    #[fastrace::trace]
    pub fn agree_order(&mut self) -> Result<AgreedOrder, SimulationError> {
        if self.reshuffle_proposals {
            for server in &mut self.servers {
                server.reshuffle_arrived(&mut self.rng);
            }
        }
        let proposals: Vec<_> = self
            .servers
            .iter()
            .map(|s| Proposal::new(s.id(), s.arrived().to_vec()))
            .collect();
        let chosen = self
            .agreement
            .choose_order(&proposals, &mut self.rng)
            .cloned();
        self.proposals = proposals;
        self.agreed = chosen;
        let agreed = self.agreed_order_full().ok_or(SimulationError::NoAgreedOrder)?;
        info!(
            "agreed on order of server {}: {}",
            agreed.proposer,
            format_labels(agreed.keys.iter().copied())
        );
        Ok(agreed)
    }

    /// Starts the reply phase over the agreed order.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::NoAgreedOrder`] before a successful
    /// [`Self::agree_order`] and [`SimulationError::AlreadyRunning`] while a
    /// reply phase is in progress.
    pub fn start_reply_sequence(&mut self) -> Result<(), SimulationError> {
        let order = self
            .agreed
            .as_ref()
            .ok_or(SimulationError::NoAgreedOrder)?
            .order()
            .to_vec();
        let len = order.len();
        self.sequencer.start(order)?;
        info!("starting reply sequence over {len} messages");
        Ok(())
    }

    /// Handles the next message of the agreed order.
    ///
    /// Every server is offered the message before the snapshot is built.
    pub fn step(&mut self) -> StepOutcome {
        let message = match self.sequencer.tick() {
            Tick::Inactive => return StepOutcome::Inactive,
            Tick::Exhausted => {
                info!("all replies sent");
                return StepOutcome::Complete;
            }
            Tick::Message(message) => message,
        };
        let mut replied_by = Vec::new();
        for server in &mut self.servers {
            if server.send_reply(&message, &message, &mut self.clients) {
                replied_by.push(server.id());
            }
        }
        let snapshot = StepSnapshot {
            step: self.sequencer.steps_done(),
            message: message.key(),
            replied_by,
            progress_percent: self.sequencer.progress_percent(),
        };
        debug!(
            "step {}: {} replied by {:?} ({:.1}%)",
            snapshot.step, snapshot.message, snapshot.replied_by, snapshot.progress_percent
        );
        StepOutcome::Replied(snapshot)
    }

    /// Stops a running reply phase. Returns `true` iff it was running.
    pub fn cancel_replies(&mut self) -> bool {
        let cancelled = self.sequencer.cancel();
        if cancelled {
            warn!(
                "reply sequence cancelled after {} of {} steps",
                self.sequencer.steps_done(),
                self.sequencer.len()
            );
        }
        cancelled
    }

    #[must_use]
    pub const fn sequencer_state(&self) -> SequencerState {
        self.sequencer.state()
    }

    /// Arrival order observed by the given server.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::UnknownServer`] if there is no such server.
    pub fn list_arrived(&self, server: ServerId) -> Result<Vec<MessageKey>, SimulationError> {
        let server = self.server(server)?;
        Ok(server.arrived().iter().map(|m| m.key()).collect())
    }

    /// Proposals of the latest agreement round, by server.
    #[must_use]
    pub fn list_proposals(&self) -> BTreeMap<ServerId, Vec<MessageKey>> {
        self.proposals.iter().map(|p| (p.server(), p.keys())).collect()
    }

    /// The agreed order, if agreement has happened.
    #[must_use]
    pub fn agreed_order(&self) -> Option<Vec<MessageKey>> {
        self.agreed.as_ref().map(Proposal::keys)
    }

    /// The agreed order together with the server that proposed it.
    #[must_use]
    pub fn agreed_order_full(&self) -> Option<AgreedOrder> {
        self.agreed.as_ref().map(|p| AgreedOrder {
            proposer: p.server(),
            keys: p.keys(),
        })
    }

    /// Progress of the reply phase in percent, between 0 and 100.
    #[must_use]
    pub fn reply_progress_percent(&self) -> f64 {
        self.sequencer.progress_percent()
    }

    /// Status of message `local` of the given client.
    ///
    /// `Responded` iff the client received a reply for it, otherwise `Sent`
    /// once a broadcast has happened, `Unsent` before.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::UnknownClient`] if there is no such client and
    /// [`SimulationError::UnknownMessage`] if the client does not own the message.
    pub fn client_message_status(
        &self,
        client: ClientId,
        local: LocalId,
    ) -> Result<MessageStatus, SimulationError> {
        let c = self
            .clients
            .get(client)
            .ok_or(SimulationError::UnknownClient(client))?;
        let key = MessageKey::new(client, local);
        if !c.owns(key) {
            return Err(SimulationError::UnknownMessage(key));
        }
        Ok(self.status_of(c, local))
    }

    /// Labels of the replies sent by the given server, in send order.
    ///
    /// # Errors
    ///
    /// Returns [`SimulationError::UnknownServer`] if there is no such server.
    pub fn server_replies_sent(&self, server: ServerId) -> Result<Vec<String>, SimulationError> {
        let server = self.server(server)?;
        Ok(server.replies_sent().iter().map(ToString::to_string).collect())
    }

    /// Collects the results of all queries into one [`Report`].
    #[must_use]
    pub fn report(&self) -> Report {
        let arrived = self
            .servers
            .iter()
            .map(|s| (s.id(), s.arrived().iter().map(|m| m.key()).collect()))
            .collect();
        let clients = self
            .clients
            .iter()
            .map(|c| ClientReport {
                id: c.id(),
                statuses: c
                    .messages()
                    .iter()
                    .map(|m| (m.local_id(), self.status_of(c, m.local_id())))
                    .collect(),
            })
            .collect();
        let replies_sent = self
            .servers
            .iter()
            .map(|s| (s.id(), s.replies_sent().iter().map(ToString::to_string).collect()))
            .collect();
        Report {
            arrived,
            proposals: self.list_proposals(),
            agreed_order: self.agreed_order_full(),
            state: self.sequencer.state(),
            progress_percent: self.sequencer.progress_percent(),
            clients,
            replies_sent,
        }
    }

    fn server(&self, server: ServerId) -> Result<&Server, SimulationError> {
        self.servers
            .get(server)
            .ok_or(SimulationError::UnknownServer(server))
    }

    fn status_of(&self, client: &Client, local: LocalId) -> MessageStatus {
        if client.has_reply(local) {
            MessageStatus::Responded
        } else if self.broadcasts > 0 {
            MessageStatus::Sent
        } else {
            MessageStatus::Unsent
        }
    }
}

/// Joins message labels with `", "`.
pub fn format_labels(keys: impl IntoIterator<Item = MessageKey>) -> String {
    keys.into_iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::RngCore;

    use super::*;
    use crate::config::Topology;
    use crate::test_utils::{complete_replies, reference_scenario, sorted};

    #[test]
    fn reference_scenario_end_to_end() {
        let mut sim = reference_scenario(5);
        for c in 0..2 {
            for m in 0..2 {
                assert_eq!(sim.client_message_status(c, m), Ok(MessageStatus::Unsent));
            }
        }

        sim.broadcast();
        let arrived = sim.list_arrived(0).unwrap();
        let expected = vec![
            MessageKey::new(0, 0),
            MessageKey::new(0, 1),
            MessageKey::new(1, 0),
            MessageKey::new(1, 1),
        ];
        assert_eq!(sorted(arrived.clone()), expected);
        assert_eq!(sim.client_message_status(1, 1), Ok(MessageStatus::Sent));

        let agreed = sim.agree_order().unwrap();
        assert_eq!(agreed.proposer, 0);
        assert_eq!(agreed.keys, arrived);

        sim.start_reply_sequence().unwrap();
        let steps = complete_replies(&mut sim);
        assert_eq!(steps.len(), 4);
        assert_eq!(sim.reply_progress_percent(), 100.0);
        assert_eq!(sim.sequencer_state(), SequencerState::Complete);
        for c in 0..2 {
            for m in 0..2 {
                assert_eq!(sim.client_message_status(c, m), Ok(MessageStatus::Responded));
            }
        }
        let labels: Vec<_> = arrived.iter().map(ToString::to_string).collect();
        assert_eq!(sim.server_replies_sent(0).unwrap(), labels);
    }

    #[test]
    fn delivery_complete_and_idempotent() {
        let config = SimulationConfig::new(3, vec![3, 2, 1]).with_seed(1);
        let mut sim = SimulationController::new(&config);
        sim.broadcast();
        sim.broadcast();
        for server in 0..3 {
            let arrived = sim.list_arrived(server).unwrap();
            assert_eq!(arrived.len(), 6);
            let unique: HashSet<_> = arrived.iter().collect();
            assert_eq!(unique.len(), 6);
        }
    }

    #[test]
    fn servers_see_independent_orders() {
        // with 9 messages and 3 servers identical orders everywhere are very unlikely
        let config = SimulationConfig::new(3, vec![3, 3, 3]).with_seed(2);
        let mut sim = SimulationController::new(&config);
        sim.broadcast();
        let orders: Vec<_> = (0..3).map(|s| sim.list_arrived(s).unwrap()).collect();
        assert!(orders[0] != orders[1] || orders[1] != orders[2]);
        for order in &orders {
            assert_eq!(sorted(order.clone()), sorted(orders[0].clone()));
        }
    }

    #[test]
    fn agreed_order_is_one_proposal() {
        for seed in 0..20 {
            let config = SimulationConfig::new(3, vec![2, 2]).with_seed(seed);
            let mut sim = SimulationController::new(&config);
            sim.broadcast();
            let agreed = sim.agree_order().unwrap();
            let proposals = sim.list_proposals();
            assert_eq!(proposals.len(), 3);
            assert_eq!(proposals[&agreed.proposer], agreed.keys);
            for (server, proposal) in &proposals {
                assert_eq!(proposal, &sim.list_arrived(*server).unwrap());
            }
        }
    }

    #[test]
    fn reshuffled_proposals_still_match_arrived() {
        let config = SimulationConfig::new(2, vec![3, 3])
            .with_seed(4)
            .with_reshuffled_proposals();
        let mut sim = SimulationController::new(&config);
        sim.broadcast();
        let agreed = sim.agree_order().unwrap();
        assert_eq!(sim.list_arrived(agreed.proposer).unwrap(), agreed.keys);
    }

    #[test]
    fn seeded_runs_reproducible() {
        let run = || {
            let config = SimulationConfig::new(3, vec![3, 3, 3]).with_seed(99);
            let mut sim = SimulationController::new(&config);
            sim.broadcast();
            sim.agree_order().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn progress_steps_evenly() {
        let config = SimulationConfig::new(2, vec![3]).with_seed(8);
        let mut sim = SimulationController::new(&config);
        sim.broadcast();
        sim.agree_order().unwrap();
        sim.start_reply_sequence().unwrap();
        let steps = complete_replies(&mut sim);
        let percents: Vec<_> = steps.iter().map(|s| s.progress_percent).collect();
        assert_eq!(percents.len(), 3);
        assert!((percents[0] - 100.0 / 3.0).abs() < 1e-9);
        assert!((percents[1] - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(percents[2], 100.0);
        // every server replies in a fully connected setup
        for step in &steps {
            assert_eq!(step.replied_by, vec![0, 1]);
        }
    }

    #[test]
    fn start_without_agreement() {
        let mut sim = reference_scenario(0);
        assert_eq!(sim.start_reply_sequence(), Err(SimulationError::NoAgreedOrder));
        assert_eq!(sim.step(), StepOutcome::Inactive);
    }

    #[test]
    fn no_servers_no_agreement() {
        let mut sim = SimulationController::new(&SimulationConfig::new(0, vec![1]).with_seed(0));
        sim.broadcast();
        assert_eq!(sim.agree_order(), Err(SimulationError::NoAgreedOrder));
        assert!(sim.list_proposals().is_empty());
    }

    #[test]
    fn start_twice() {
        let mut sim = reference_scenario(1);
        sim.broadcast();
        sim.agree_order().unwrap();
        sim.start_reply_sequence().unwrap();
        assert_eq!(sim.start_reply_sequence(), Err(SimulationError::AlreadyRunning));
    }

    #[test]
    fn replay_sends_nothing_new() {
        let mut sim = reference_scenario(2);
        sim.broadcast();
        sim.agree_order().unwrap();
        sim.start_reply_sequence().unwrap();
        complete_replies(&mut sim);
        sim.start_reply_sequence().unwrap();
        let steps = complete_replies(&mut sim);
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|s| s.replied_by.is_empty()));
        assert_eq!(sim.server_replies_sent(0).unwrap().len(), 4);
    }

    #[test]
    fn diverging_views_gate_replies() {
        // server 0 only knows client 0, server 1 only knows client 1
        let config = SimulationConfig::new(2, vec![1, 1])
            .with_seed(3)
            .with_topology(Topology::Links(vec![(0, 0), (1, 1)]));
        let mut sim = SimulationController::new(&config);
        sim.broadcast();
        assert_eq!(sim.list_arrived(0).unwrap(), vec![MessageKey::new(0, 0)]);
        assert_eq!(sim.list_arrived(1).unwrap(), vec![MessageKey::new(1, 0)]);
        let agreed = sim.agree_order().unwrap();
        sim.start_reply_sequence().unwrap();
        let steps = complete_replies(&mut sim);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].replied_by, vec![agreed.proposer]);
        let other = 1 - agreed.proposer;
        assert_eq!(sim.client_message_status(other, 0), Ok(MessageStatus::Sent));
        assert!(sim.server_replies_sent(other).unwrap().is_empty());
    }

    #[test]
    fn cancel_freezes_progress() {
        let mut sim = reference_scenario(6);
        sim.broadcast();
        sim.agree_order().unwrap();
        sim.start_reply_sequence().unwrap();
        assert!(matches!(sim.step(), StepOutcome::Replied(_)));
        assert!(sim.cancel_replies());
        assert_eq!(sim.step(), StepOutcome::Inactive);
        assert_eq!(sim.reply_progress_percent(), 25.0);
        assert_eq!(sim.sequencer_state(), SequencerState::Cancelled);
        assert!(!sim.cancel_replies());
    }

    #[test]
    fn unknown_ids() {
        let sim = reference_scenario(0);
        assert_eq!(sim.list_arrived(5), Err(SimulationError::UnknownServer(5)));
        assert_eq!(sim.server_replies_sent(1), Err(SimulationError::UnknownServer(1)));
        assert_eq!(
            sim.client_message_status(2, 0),
            Err(SimulationError::UnknownClient(2))
        );
        assert_eq!(
            sim.client_message_status(0, 2),
            Err(SimulationError::UnknownMessage(MessageKey::new(0, 2)))
        );
    }

    #[test]
    fn out_of_range_links_skipped() {
        let config = SimulationConfig::new(1, vec![1])
            .with_seed(0)
            .with_topology(Topology::Links(vec![(0, 0), (0, 4), (3, 0)]));
        let mut sim = SimulationController::new(&config);
        sim.broadcast();
        assert_eq!(sim.list_arrived(0).unwrap(), vec![MessageKey::new(0, 0)]);
    }

    /// Always picks the last proposal.
    struct LastProposal;

    impl OrderAgreement for LastProposal {
        fn choose_order<'p>(
            &mut self,
            proposals: &'p [Proposal],
            _rng: &mut dyn RngCore,
        ) -> Option<&'p Proposal> {
            proposals.last()
        }
    }

    #[test]
    fn custom_agreement() {
        let config = SimulationConfig::new(3, vec![2]).with_seed(0);
        let mut sim = SimulationController::new(&config).with_agreement(LastProposal);
        sim.broadcast();
        let agreed = sim.agree_order().unwrap();
        assert_eq!(agreed.proposer, 2);
    }

    #[test]
    fn report_collects_queries() {
        let mut sim = reference_scenario(10);
        sim.broadcast();
        sim.agree_order().unwrap();
        sim.start_reply_sequence().unwrap();
        complete_replies(&mut sim);
        let report = sim.report();
        assert_eq!(report.state, SequencerState::Complete);
        assert_eq!(report.progress_percent, 100.0);
        assert_eq!(report.arrived[&0], sim.list_arrived(0).unwrap());
        assert_eq!(report.replies_sent[&0], sim.server_replies_sent(0).unwrap());
        assert_eq!(report.clients.len(), 2);
        assert!(
            report
                .clients
                .iter()
                .flat_map(|c| c.statuses.values())
                .all(|s| *s == MessageStatus::Responded)
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"Complete\""));
    }

    #[test]
    fn labels_joined() {
        let labels = format_labels([MessageKey::new(0, 0), MessageKey::new(1, 2)]);
        assert_eq!(labels, "M1-1, M3-2");
    }
}
