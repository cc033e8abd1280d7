// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{ClientId, LocalId, MessageKey};

/// Delivery status of a message as seen from the owning client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Not yet broadcast.
    Unsent,
    /// Broadcast to the linked servers, no reply received yet.
    Sent,
    /// A reply for this message reached the owning client.
    Responded,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unsent => "unsent",
            Self::Sent => "sent",
            Self::Responded => "responded",
        };
        f.write_str(s)
    }
}

/// A message created by a client at setup time.
///
/// Equality and hashing only consider the [`MessageKey`].
#[derive(Clone, Debug)]
pub struct Message {
    key: MessageKey,
    /// Status at creation. Never updated, live status is derived elsewhere.
    initial_status: MessageStatus,
}

impl Message {
    /// Creates message `local` owned by client `owner`.
    #[must_use]
    pub const fn new(local: LocalId, owner: ClientId) -> Self {
        Self {
            key: MessageKey::new(owner, local),
            initial_status: MessageStatus::Unsent,
        }
    }

    #[must_use]
    pub const fn key(&self) -> MessageKey {
        self.key
    }

    #[must_use]
    pub const fn local_id(&self) -> LocalId {
        self.key.local
    }

    #[must_use]
    pub const fn owner(&self) -> ClientId {
        self.key.owner
    }

    /// The informational status set at construction.
    #[must_use]
    pub const fn initial_status(&self) -> MessageStatus {
        self.initial_status
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}
