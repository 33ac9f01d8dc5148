//! Pending request registry - correlates outgoing requests with responses.
//!
//! Each entry owns a oneshot settle handle and an expiry timer. An entry is
//! removed the moment it settles, whichever of these happens first:
//! - a matching response ([`PendingRequests::resolve`] / [`PendingRequests::reject`])
//! - its timer firing ([`PendingRequests::expire`])
//! - teardown ([`PendingRequests::cancel_all`])
//!
//! Settling consumes the oneshot sender, so an entry can settle at most once.
//! A response for an id that is no longer registered is a normal race (late
//! reply after timeout or shutdown) and is only logged.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::port::lock;
use crate::types::{Error, MessageId, Result};

type Settlement = Result<Value>;

struct PendingRequest {
    settle: oneshot::Sender<Settlement>,
    timer: AbortHandle,
}

/// Registry of in-flight requests for one client or service instance.
///
/// Clones share the same table.
#[derive(Clone)]
pub struct PendingRequests {
    owner: Arc<str>,
    entries: Arc<Mutex<HashMap<MessageId, PendingRequest>>>,
}

impl fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("owner", &self.owner)
            .field("len", &self.len())
            .finish()
    }
}

/// Awaitable side of a registered entry.
#[derive(Debug)]
pub struct PendingResponse {
    message_id: MessageId,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Wait for the entry to settle.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(settlement) => settlement,
            // Registry dropped with the entry still in it.
            Err(_) => Err(Error::abandoned(self.message_id)),
        }
    }
}

impl PendingRequests {
    /// `owner` labels log lines (a client id or service name).
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: Arc::from(owner.into()),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `message_id` and arm its expiry timer.
    pub fn register(&self, message_id: MessageId, timeout: Duration) -> Result<PendingResponse> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&message_id) {
            return Err(Error::already_registered(format!(
                "message id {} is still pending for {}",
                message_id, self.owner
            )));
        }

        let (settle, rx) = oneshot::channel();
        let registry = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(message_id, timeout);
        })
        .abort_handle();

        entries.insert(message_id, PendingRequest { settle, timer });
        Ok(PendingResponse { message_id, rx })
    }

    /// Settle `message_id` successfully. Returns true if an entry settled.
    pub fn resolve(&self, message_id: MessageId, value: Value) -> bool {
        self.settle(message_id, Ok(value))
    }

    /// Settle `message_id` with `error`. Returns true if an entry settled.
    pub fn reject(&self, message_id: MessageId, error: Error) -> bool {
        self.settle(message_id, Err(error))
    }

    fn settle(&self, message_id: MessageId, outcome: Settlement) -> bool {
        let Some(entry) = lock(&self.entries).remove(&message_id) else {
            tracing::debug!(
                owner = %self.owner,
                message_id,
                "no pending entry for response (late or unknown message id)"
            );
            return false;
        };
        entry.timer.abort();

        if entry.settle.send(outcome).is_err() {
            tracing::warn!(
                owner = %self.owner,
                message_id,
                "{}: caller stopped waiting",
                Error::AlreadySettled(message_id)
            );
            return false;
        }
        true
    }

    /// Timer path: reject with a timeout if the entry is still pending.
    pub fn expire(&self, message_id: MessageId, after: Duration) {
        let Some(entry) = lock(&self.entries).remove(&message_id) else {
            return;
        };
        tracing::warn!(
            owner = %self.owner,
            message_id,
            timeout_ms = after.as_millis() as u64,
            "request timed out"
        );
        let _ = entry.settle.send(Err(Error::timeout(message_id, after)));
    }

    /// Reject every pending entry as abandoned and clear the table.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(MessageId, PendingRequest)> = lock(&self.entries).drain().collect();
        if !drained.is_empty() {
            tracing::info!(
                owner = %self.owner,
                count = drained.len(),
                "cancelling pending requests"
            );
        }
        let count = drained.len();
        for (message_id, entry) in drained {
            entry.timer.abort();
            let _ = entry.settle.send(Err(Error::abandoned(message_id)));
        }
        count
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        lock(&self.entries).contains_key(&message_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
