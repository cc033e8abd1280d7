// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::Arc;

use log::trace;
use rand::Rng;
use rand::seq::SliceRandom;

use super::{Client, Message};
use crate::{ClientId, MessageKey, ServerId};

/// A server receiving broadcasts and replying in agreed order.
///
/// Incoming messages first land in the staging buffer. [`Server::arrive`]
/// moves them, in random order, to the arrived list, which is this server's
/// local view of the delivery order.
#[derive(Clone, Debug)]
pub struct Server {
    id: ServerId,
    /// Clients this server is linked to, in link order.
    clients: Vec<ClientId>,
    /// Messages received but not yet arrived.
    staged: Vec<Arc<Message>>,
    /// Messages that went through arrival, in arrival order.
    arrived: Vec<Arc<Message>>,
    /// Keys of replies already sent, for deduplication.
    sent_keys: HashSet<MessageKey>,
    /// Keys of replies already sent, in send order.
    sent_log: Vec<MessageKey>,
}

impl Server {
    /// Creates a new server without links or messages.
    #[must_use]
    pub fn new(id: ServerId) -> Self {
        Self {
            id,
            clients: Vec::new(),
            staged: Vec::new(),
            arrived: Vec::new(),
            sent_keys: HashSet::new(),
            sent_log: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ServerId {
        self.id
    }

    /// Links this server to the given client.
    pub fn add_client(&mut self, client: ClientId) {
        self.clients.push(client);
    }

    #[must_use]
    pub fn clients(&self) -> &[ClientId] {
        &self.clients
    }

    #[must_use]
    pub fn staged(&self) -> &[Arc<Message>] {
        &self.staged
    }

    #[must_use]
    pub fn arrived(&self) -> &[Arc<Message>] {
        &self.arrived
    }

    /// Keys of the replies sent so far, in send order.
    #[must_use]
    pub fn replies_sent(&self) -> &[MessageKey] {
        &self.sent_log
    }

    /// Puts the message into the staging buffer.
    ///
    /// Does nothing if a message with the same key is already staged or has
    /// already arrived, so staging and arrived list stay disjoint.
    pub fn stage(&mut self, message: Arc<Message>) {
        let key = message.key();
        let known = |m: &Arc<Message>| m.key() == key;
        if self.staged.iter().any(known) || self.arrived.iter().any(known) {
            trace!("server {} ignores duplicate delivery of {key}", self.id);
            return;
        }
        self.staged.push(message);
    }

    /// Moves all staged messages to the arrived list in random order.
    ///
    /// The permutation is drawn independently per call and per server.
    pub fn arrive<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.staged.shuffle(rng);
        self.arrived.append(&mut self.staged);
    }

    /// Re-permutes the arrived list in place.
    pub fn reshuffle_arrived<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.arrived.shuffle(rng);
    }

    /// Sends a reply for `message` to its owner, if gating allows it.
    ///
    /// A reply is sent iff `message` is `expected_next`, the message is owned
    /// by one of the linked clients, and no reply for it was sent before.
    /// Only the owning client receives the reply. Returns `true` iff sent.
    pub fn send_reply(
        &mut self,
        message: &Arc<Message>,
        expected_next: &Message,
        clients: &mut [Client],
    ) -> bool {
        let key = message.key();
        if key != expected_next.key() {
            trace!("server {}: {key} is not next, expected {}", self.id, expected_next.key());
            return false;
        }
        for &client_id in &self.clients {
            let Some(client) = clients.get_mut(client_id) else {
                continue;
            };
            if !client.owns(key) {
                continue;
            }
            if !self.sent_keys.insert(key) {
                trace!("server {} already replied to {key}", self.id);
                return false;
            }
            self.sent_log.push(key);
            client.receive_reply(Arc::clone(message));
            return true;
        }
        trace!("server {}: no linked owner for {key}", self.id);
        false
    }
}
