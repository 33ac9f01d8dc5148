//! Core enumerations for the envelope protocol.
//!
//! Canonical definitions for message kinds and channel tags.

use serde::{Deserialize, Serialize};

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Fire-and-forget payload, no reply expected.
    Event,
    /// Named operation call awaiting a Response.
    Request,
    /// Outcome of a Request, correlated by `messageId`.
    Response,
}

/// Outer discriminator for traffic multiplexed on one raw transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelTag {
    /// Ordinary envelope traffic.
    ServiceMessage,
    /// Hand-off of a freshly opened channel endpoint for one client.
    ServiceNewClient,
}
