//! Stdio transport for out-of-process workers.
//!
//! A worker process and its host exchange length-prefixed frames over the
//! child's stdin/stdout. Each side runs a [`LinkBridge`] that mirrors an
//! in-memory process link onto that stream.

pub mod bridge;
pub mod codec;

pub use bridge::{BridgeRole, LinkBridge};

use crate::port::{parent_link, ParentPort};
use crate::types::TransportConfig;

impl ParentPort {
    /// Parent link of a worker started by a process spawner, carried over
    /// this process's stdin/stdout. Logs must not go to stdout.
    pub fn stdio(config: &TransportConfig) -> ParentPort {
        let (child, parent) = parent_link();
        let bridge = LinkBridge::new(child, config.clone(), BridgeRole::Worker);
        tokio::spawn(async move {
            if let Err(err) = bridge.run(tokio::io::stdin(), tokio::io::stdout()).await {
                tracing::error!(error = %err, "stdio link to host failed");
            }
        });
        parent
    }
}
