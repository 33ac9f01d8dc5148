//! In-memory duplex channel.
//!
//! [`MessageChannel::new`] opens a pair of entangled [`MessagePort`]s. Each end
//! can post to the other independently. Inbound frames buffer until
//! [`MessagePort::start`] is called, then flow to every registered listener in
//! send order. Closing either end ends delivery on both.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{lock, PortHandle, PortLifecycle, PortListener};
use crate::envelope::Frame;
use crate::types::{Error, Result};

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Factory for entangled port pairs.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        Self {
            port1: MessagePort::from_parts(tx2, rx1),
            port2: MessagePort::from_parts(tx1, rx2),
        }
    }

    /// Close both ends.
    pub fn close(&self) {
        self.port1.close();
        self.port2.close();
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

struct PortInner {
    id: u64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    listeners: Mutex<Vec<PortListener>>,
    closed: CancellationToken,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// One end of a [`MessageChannel`]. Clones share the same end.
#[derive(Clone)]
pub struct MessagePort {
    inner: Arc<PortInner>,
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MessagePort {
    fn from_parts(
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                outbound: Mutex::new(Some(outbound)),
                inbound: Mutex::new(Some(inbound)),
                listeners: Mutex::new(Vec::new()),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Post a frame to the other end.
    pub fn post_message(&self, frame: Frame) -> Result<()> {
        let outbound = lock(&self.inner.outbound);
        let tx = outbound
            .as_ref()
            .ok_or_else(|| Error::channel_closed(format!("port {} is closed", self.inner.id)))?;
        tx.send(frame).map_err(|_| {
            Error::channel_closed(format!("peer of port {} is closed", self.inner.id))
        })
    }

    /// Register a listener. Frames that arrive after `start` reach it.
    pub fn add_listener(&self, listener: PortListener) {
        lock(&self.inner.listeners).push(listener);
    }

    /// Begin delivering buffered and future frames. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(mut rx) = lock(&self.inner.inbound).take() else {
            return;
        };
        if self.is_closed() {
            return;
        }

        let weak: Weak<PortInner> = Arc::downgrade(&self.inner);
        let closed = self.inner.closed.clone();
        let id = self.inner.id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    next = rx.recv() => {
                        let Some(frame) = next else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        let listeners = lock(&inner.listeners).clone();
                        drop(inner);
                        for listener in &listeners {
                            listener.deliver(frame.clone());
                        }
                    }
                }
            }
            tracing::debug!(port = id, "message port delivery ended");
            if let Some(inner) = weak.upgrade() {
                let listeners = std::mem::take(&mut *lock(&inner.listeners));
                lock(&inner.outbound).take();
                inner.closed.cancel();
                for listener in &listeners {
                    listener.closed();
                }
            }
        });
    }

    /// Close this end. The peer observes the closure once its buffered
    /// frames drain.
    pub fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        lock(&self.inner.outbound).take();
        self.inner.closed.cancel();
        // Never started: nobody else will drop the receiver or tell listeners.
        if lock(&self.inner.inbound).take().is_some() {
            let listeners = std::mem::take(&mut *lock(&self.inner.listeners));
            for listener in &listeners {
                listener.closed();
            }
        }
    }
}

impl PortLifecycle for MessagePort {
    fn start(&self) {
        MessagePort::start(self);
    }

    fn close(&self) {
        MessagePort::close(self);
    }
}

impl PortHandle for MessagePort {
    fn post_message(&self, frame: Frame) -> Result<()> {
        MessagePort::post_message(self, frame)
    }

    fn add_listener(&self, listener: &PortListener) -> bool {
        MessagePort::add_listener(self, listener.clone());
        true
    }

    fn lifecycle(&self) -> Option<&dyn PortLifecycle> {
        Some(self)
    }
}
