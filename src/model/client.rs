// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use log::trace;
use rand::Rng;
use rand::seq::SliceRandom;

use super::{Message, Server};
use crate::{ClientId, LocalId, MessageKey, ServerId};

/// A client owning a set of messages.
///
/// Links to servers and owned messages are set up before the broadcast phase
/// and never change afterwards, apart from the order of the owned messages.
#[derive(Clone, Debug)]
pub struct Client {
    id: ClientId,
    /// Servers this client broadcasts to, in link order.
    servers: Vec<ServerId>,
    /// Owned messages.
    messages: Vec<Arc<Message>>,
    /// Messages for which a reply was received, by local ID.
    received_replies: BTreeMap<LocalId, Arc<Message>>,
}

impl Client {
    /// Creates a new client without links or messages.
    #[must_use]
    pub const fn new(id: ClientId) -> Self {
        Self {
            id,
            servers: Vec::new(),
            messages: Vec::new(),
            received_replies: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Links this client to the given server.
    pub fn add_server(&mut self, server: ServerId) {
        self.servers.push(server);
    }

    /// Adds a message to the set of owned messages.
    pub fn add_message(&mut self, message: Arc<Message>) {
        self.messages.push(message);
    }

    #[must_use]
    pub fn servers(&self) -> &[ServerId] {
        &self.servers
    }

    #[must_use]
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    /// Returns `true` iff this client owns a message with the given key.
    #[must_use]
    pub fn owns(&self, key: MessageKey) -> bool {
        self.messages.iter().any(|m| m.key() == key)
    }

    /// Randomizes the order in which owned messages will be sent.
    pub fn shuffle_messages<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.messages.shuffle(rng);
    }

    /// Stages every owned message at every linked server.
    ///
    /// Links to servers that do not exist in `servers` are skipped.
    pub fn send_all(&self, servers: &mut [Server]) {
        for message in &self.messages {
            for &server_id in &self.servers {
                let Some(server) = servers.get_mut(server_id) else {
                    trace!("client {} skips unknown server {server_id}", self.id);
                    continue;
                };
                server.stage(Arc::clone(message));
            }
        }
    }

    /// Records a reply for the given message.
    ///
    /// Receiving a reply for the same local ID again does nothing.
    pub fn receive_reply(&mut self, message: Arc<Message>) {
        let local = message.local_id();
        if self.received_replies.contains_key(&local) {
            trace!("client {} already has reply for {}", self.id, message.key());
            return;
        }
        self.received_replies.insert(local, message);
    }

    /// Returns `true` iff a reply for the given local ID was received.
    #[must_use]
    pub fn has_reply(&self, local: LocalId) -> bool {
        self.received_replies.contains_key(&local)
    }

    /// Number of distinct replies received so far.
    #[must_use]
    pub fn replies_received(&self) -> usize {
        self.received_replies.len()
    }
}
