//! Core types shared by hosts, workers and clients.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ClientId, ServiceName) and the message id sequence
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for requests, transport, bridge and logging

mod config;
mod errors;
mod ids;

pub use config::{
    BridgeConfig, Config, InspectConfig, ObservabilityConfig, RequestConfig, SpawnOptions,
    TransportConfig, DEFAULT_REQUEST_TIMEOUT,
};
pub use errors::{Error, HandlerError, Result};
pub use ids::{ClientId, MessageId, MessageIdSequence, ServiceName};
