// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Entity model of the simulation.
//!
//! - [`Message`] is an immutable identity, owned by exactly one [`Client`].
//! - [`Client`] holds its outgoing messages and records received replies.
//! - [`Server`] buffers incoming messages, randomizes their arrival order and
//!   sends order-gated replies.
//!
//! Clients and servers refer to each other by ID only. The controller owns
//! both sides and passes the other side in where an operation needs it.

mod client;
mod message;
mod server;

pub use self::client::Client;
pub use self::message::{Message, MessageStatus};
pub use self::server::Server;
