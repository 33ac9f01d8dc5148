//! # UPM Core - correlated messaging between a host and its workers
//!
//! A host process supervises named worker services. Each side talks through
//! a uniform [`Port`](port::Port) regardless of the transport underneath,
//! exchanging [`Envelope`](envelope::Envelope)s that are events, requests or
//! responses. Requests are correlated by message id in a
//! [`PendingRequests`](client::PendingRequests) registry that enforces
//! timeouts and teardown.
//!
//! ## Architecture
//!
//! ```text
//!   front-end ──FrontEndLink──▶ ServiceHost ──spawn──▶ WorkerSpawner
//!                                   │                       │
//!                                Service ◀──WorkerEvent─────┘
//!                                   │ primary link (Frame)
//!                                   ▼
//!   MessageClient ◀══MessageChannel══▶ WorkerDispatcher ── handlers
//! ```
//!
//! Workers run either in-process ([`LocalSpawner`](host::LocalSpawner)) or as
//! child processes linked over stdio ([`ProcessSpawner`](host::ProcessSpawner),
//! [`ipc`]).

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod envelope;
pub mod host;
pub mod ipc;
pub mod port;
pub mod types;
pub mod worker;

// Internal utilities
pub mod observability;

pub use client::MessageClient;
pub use host::{Service, ServiceHost};
pub use types::{Config, Error, Result};
pub use worker::WorkerDispatcher;
