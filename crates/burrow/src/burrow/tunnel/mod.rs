//! Reverse-tunnel server core: control sessions, pipes and the tunnel registry.
//!
//! A client keeps one multiplexed control session open and dials extra "pipe"
//! connections tagged with its [`ClientId`]; public traffic is relayed over
//! work streams opened on those pipes.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod auth;
pub mod control;
pub mod mux;
pub mod pipe;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod secure;
pub mod server;
pub mod transform;
pub mod transport;

#[cfg(test)]
pub mod testkit;

/// Identifier minted for each control session; pipes present it to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// First eight hex digits; used to derive default tunnel hostnames.
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
