//! Port abstraction - one send/listen/start/close surface over every
//! transport shape.
//!
//! A raw transport handle exposes capabilities through [`PortHandle`]. The
//! handle is inspected once, when a [`Port`] is opened:
//! - a start/close lifecycle means a **duplex channel** ([`MessagePort`])
//! - otherwise a process side means a **child handle** or **parent handle**
//! - anything else is rejected with `Error::InvalidPort`
//!
//! Listening is attached registration-style when the handle supports it,
//! falling back to taking the handle's inbound stream and pumping it.
//! Duplex channels are started after the listener is in place, since they
//! buffer until started. Downstream code only sees the normalized [`Port`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::envelope::{Envelope, Frame};
use crate::types::{Error, Result};

mod channel;
mod link;

pub use channel::{MessageChannel, MessagePort};
pub use link::{parent_link, ChildHandle, ParentPort};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capability shape detected on a transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    DuplexChannel,
    ChildHandle,
    ParentHandle,
}

/// Which side of a process link a handle sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSide {
    /// Host looking at a worker.
    Child,
    /// Worker looking at its host.
    Parent,
}

/// Explicit start/close lifecycle, present only on duplex channels.
pub trait PortLifecycle {
    fn start(&self);
    fn close(&self);
}

/// Raw transport handle.
///
/// Implementors override the capability checks they support; the defaults
/// report "not supported".
pub trait PortHandle: Send + Sync + fmt::Debug {
    /// Post one frame. Delivery is message-oriented; no framing is added.
    fn post_message(&self, frame: Frame) -> Result<()>;

    /// Listener-registration style. Returns false when unsupported.
    fn add_listener(&self, _listener: &PortListener) -> bool {
        false
    }

    /// Subscription style: hands out the inbound stream, once.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        None
    }

    fn lifecycle(&self) -> Option<&dyn PortLifecycle> {
        None
    }

    fn process_side(&self) -> Option<ProcessSide> {
        None
    }
}

type MessageFn = Arc<dyn Fn(Frame) + Send + Sync>;
type CloseFn = Arc<dyn Fn() + Send + Sync>;

/// Callbacks invoked for inbound frames and for end of delivery.
#[derive(Clone)]
pub struct PortListener {
    on_message: MessageFn,
    on_close: Option<CloseFn>,
}

impl PortListener {
    pub fn new(on_message: impl Fn(Frame) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Arc::new(on_message),
            on_close: None,
        }
    }

    pub fn on_close(mut self, on_close: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(on_close));
        self
    }

    pub(crate) fn deliver(&self, frame: Frame) {
        (self.on_message)(frame);
    }

    pub(crate) fn closed(&self) {
        if let Some(on_close) = &self.on_close {
            on_close();
        }
    }
}

impl fmt::Debug for PortListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortListener")
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// Detect which capability shape `handle` exposes.
pub fn classify(handle: &dyn PortHandle) -> Result<PortKind> {
    if handle.lifecycle().is_some() {
        return Ok(PortKind::DuplexChannel);
    }
    match handle.process_side() {
        Some(ProcessSide::Child) => Ok(PortKind::ChildHandle),
        Some(ProcessSide::Parent) => Ok(PortKind::ParentHandle),
        None => {
            tracing::error!(?handle, "transport handle matches no port shape");
            Err(Error::invalid_port(format!("{:?}", handle)))
        }
    }
}

/// Attach `listener` to `handle` and start it if it is a duplex channel.
pub fn attach_listener(handle: &Arc<dyn PortHandle>, listener: PortListener) -> Result<PortKind> {
    let kind = classify(handle.as_ref())?;

    if !handle.add_listener(&listener) {
        let Some(rx) = handle.take_inbound() else {
            tracing::error!(?handle, "no message listener capability left on handle");
            return Err(Error::invalid_port(format!(
                "{:?} has no listenable inbound stream",
                handle
            )));
        };
        spawn_pump(rx, listener);
    }

    if let Some(lifecycle) = handle.lifecycle() {
        lifecycle.start();
    }
    Ok(kind)
}

fn spawn_pump(mut rx: mpsc::UnboundedReceiver<Frame>, listener: PortListener) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            listener.deliver(frame);
        }
        listener.closed();
    });
}

/// Normalized transport endpoint.
///
/// Shares the underlying handle; opening a `Port` never takes ownership of
/// the transport away from whoever else holds it.
#[derive(Debug, Clone)]
pub struct Port {
    handle: Arc<dyn PortHandle>,
    kind: PortKind,
}

impl Port {
    /// Classify `handle`, attach `listener`, and start it when needed.
    pub fn open(handle: Arc<dyn PortHandle>, listener: PortListener) -> Result<Self> {
        let kind = attach_listener(&handle, listener)?;
        Ok(Self { handle, kind })
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        self.handle.post_message(frame.into())
    }

    pub fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.send(Frame::ServiceMessage(envelope))
    }

    /// True when both ports wrap the same underlying handle.
    pub fn same_endpoint(&self, other: &Port) -> bool {
        Arc::as_ptr(&self.handle) as *const () == Arc::as_ptr(&other.handle) as *const ()
    }

    /// Close a duplex channel. Process handles are left alone.
    pub fn close(&self) {
        if let Some(lifecycle) = self.handle.lifecycle() {
            lifecycle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Opaque;

    impl PortHandle for Opaque {
        fn post_message(&self, _frame: Frame) -> Result<()> {
            Ok(())
        }
    }

    fn noop() -> PortListener {
        PortListener::new(|_| {})
    }

    #[tokio::test]
    async fn test_classify_shapes() {
        let channel = MessageChannel::new();
        let (child, parent) = parent_link();

        assert_eq!(classify(&channel.port1).unwrap(), PortKind::DuplexChannel);
        assert_eq!(classify(&child).unwrap(), PortKind::ChildHandle);
        assert_eq!(classify(&parent).unwrap(), PortKind::ParentHandle);

        let err = classify(&Opaque).unwrap_err();
        assert_eq!(err.code(), "INVALID_PORT");
    }

    #[tokio::test]
    async fn test_open_starts_duplex_channel() {
        let channel = MessageChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let port = Port::open(
            Arc::new(channel.port1.clone()),
            PortListener::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();
        assert_eq!(port.kind(), PortKind::DuplexChannel);

        channel
            .port2
            .post_message(Envelope::event(3, json!("hi")).into())
            .unwrap();
        let got = rx.recv().await.unwrap().into_envelope().unwrap();
        assert_eq!(got.message_id, 3);
    }

    #[tokio::test]
    async fn test_open_falls_back_to_subscription() {
        let (child, parent) = parent_link();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let port = Port::open(
            Arc::new(child),
            PortListener::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();
        assert_eq!(port.kind(), PortKind::ChildHandle);

        parent
            .post_message(Envelope::event(1, json!(true)).into())
            .unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_second_open_on_claimed_link_is_invalid() {
        let (child, _parent) = parent_link();
        let handle: Arc<dyn PortHandle> = Arc::new(child);
        Port::open(handle.clone(), noop()).unwrap();
        let err = Port::open(handle, noop()).unwrap_err();
        assert_eq!(err.code(), "INVALID_PORT");
    }

    #[tokio::test]
    async fn test_close_on_process_handle_is_noop() {
        let (child, parent) = parent_link();
        let port = Port::open(Arc::new(child), noop()).unwrap();
        port.close();
        assert!(parent
            .post_message(Envelope::event(0, json!(null)).into())
            .is_ok());
    }
}
