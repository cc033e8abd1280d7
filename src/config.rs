// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simulation parameters.
//!
//! A [`SimulationConfig`] says how many clients and servers to create, how
//! many messages each client owns, and how clients and servers are linked.
//! It can be built in code or loaded from TOML:
//!
//! ```toml
//! num_clients = 2
//! num_servers = 1
//! messages_per_client = [2, 2]
//! seed = 7
//! step_delay_ms = 500
//! ```
//!
//! The engine accepts any config. [`SimulationConfig::validate`] applies the
//! ranges of the reference setup and is meant for front-ends.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

use crate::{ClientId, ServerId};

/// Maximum number of clients accepted by [`SimulationConfig::validate`].
pub const MAX_CLIENTS: usize = 3;
/// Maximum number of servers accepted by [`SimulationConfig::validate`].
pub const MAX_SERVERS: usize = 3;
/// Maximum number of messages per client accepted by [`SimulationConfig::validate`].
pub const MAX_MESSAGES_PER_CLIENT: usize = 3;
/// Default time between two reply steps.
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(1000);

const_assert!(MAX_CLIENTS >= 1 && MAX_SERVERS >= 1 && MAX_MESSAGES_PER_CLIENT >= 1);

/// Errors when loading or validating a [`SimulationConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file")]
    Io(#[from] std::io::Error),
    #[error("could not parse config")]
    Parse(#[from] toml::de::Error),
    #[error("{what} must be in 1..={max}, got {value}")]
    OutOfRange {
        what: &'static str,
        value: usize,
        max: usize,
    },
    #[error("no message count given for client {0}")]
    MissingMessageCount(ClientId),
    #[error("link ({client}, {server}) names an unknown client or server")]
    UnknownLink { client: ClientId, server: ServerId },
}

/// How clients and servers are linked.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every client is linked to every server.
    #[default]
    FullyConnected,
    /// Only the listed `(client, server)` pairs are linked.
    Links(Vec<(ClientId, ServerId)>),
}

/// Parameters of one simulation session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub num_clients: usize,
    pub num_servers: usize,
    /// Number of messages owned by each client, indexed by client ID.
    /// Missing entries mean the client owns no messages.
    pub messages_per_client: Vec<usize>,
    pub topology: Topology,
    /// Seed for all random choices, random if not set.
    pub seed: Option<u64>,
    /// Time between two reply steps in milliseconds.
    pub step_delay_ms: u64,
    /// Re-permute every arrived list right before collecting proposals.
    pub reshuffle_proposals: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_clients: 1,
            num_servers: 1,
            messages_per_client: vec![1],
            topology: Topology::FullyConnected,
            seed: None,
            step_delay_ms: DEFAULT_STEP_DELAY.as_millis() as u64,
            reshuffle_proposals: false,
        }
    }
}

impl SimulationConfig {
    /// Creates a fully connected config with the given message counts.
    ///
    /// The number of clients is the length of `messages_per_client`.
    #[must_use]
    pub fn new(num_servers: usize, messages_per_client: Vec<usize>) -> Self {
        Self {
            num_clients: messages_per_client.len(),
            num_servers,
            messages_per_client,
            ..Self::default()
        }
    }

    /// Sets the seed for all random choices.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the links between clients and servers.
    #[must_use]
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Sets the time between two reply steps.
    #[must_use]
    pub const fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enables re-permuting arrived lists before agreement.
    #[must_use]
    pub const fn with_reshuffled_proposals(mut self) -> Self {
        self.reshuffle_proposals = true;
        self
    }

    /// Parses a config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `s` is not a valid config.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] if its contents are not a valid config.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    #[must_use]
    pub const fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    /// Number of messages owned by the given client.
    #[must_use]
    pub fn message_count(&self, client: ClientId) -> usize {
        self.messages_per_client.get(client).copied().unwrap_or(0)
    }

    /// All `(client, server)` links implied by the topology.
    #[must_use]
    pub fn links(&self) -> Vec<(ClientId, ServerId)> {
        match &self.topology {
            Topology::FullyConnected => (0..self.num_clients)
                .flat_map(|c| (0..self.num_servers).map(move |s| (c, s)))
                .collect(),
            Topology::Links(links) => links.clone(),
        }
    }

    /// Checks the config against the ranges of the reference setup.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint as [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("number of clients", self.num_clients, MAX_CLIENTS)?;
        check_range("number of servers", self.num_servers, MAX_SERVERS)?;
        for client in 0..self.num_clients {
            let Some(&count) = self.messages_per_client.get(client) else {
                return Err(ConfigError::MissingMessageCount(client));
            };
            check_range("messages per client", count, MAX_MESSAGES_PER_CLIENT)?;
        }
        if let Topology::Links(links) = &self.topology {
            for &(client, server) in links {
                if client >= self.num_clients || server >= self.num_servers {
                    return Err(ConfigError::UnknownLink { client, server });
                }
            }
        }
        Ok(())
    }
}

fn check_range(what: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::OutOfRange { what, value, max });
    }
    Ok(())
}
