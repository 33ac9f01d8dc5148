//! Process links: the host's handle on a worker and the worker's handle on
//! its parent.
//!
//! Both ends are subscription-style: the inbound stream is handed out once
//! through [`PortHandle::take_inbound`]. Neither end has `start`/`close`;
//! their lifetime is the worker's.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{lock, PortHandle, ProcessSide};
use crate::envelope::Frame;
use crate::types::{Error, Result};

#[derive(Debug)]
struct LinkEnd {
    label: &'static str,
    tx: mpsc::UnboundedSender<Frame>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

impl LinkEnd {
    fn post(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::process_not_running(format!("{} link is down", self.label)))
    }

    fn take(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        lock(&self.rx).take()
    }
}

/// Open an in-memory parent link.
pub fn parent_link() -> (ChildHandle, ParentPort) {
    let (to_child, from_host) = mpsc::unbounded_channel();
    let (to_host, from_child) = mpsc::unbounded_channel();
    (
        ChildHandle {
            end: Arc::new(LinkEnd {
                label: "child",
                tx: to_child,
                rx: Mutex::new(Some(from_child)),
            }),
        },
        ParentPort {
            end: Arc::new(LinkEnd {
                label: "parent",
                tx: to_host,
                rx: Mutex::new(Some(from_host)),
            }),
        },
    )
}

/// Host-side handle on a worker's primary link.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    end: Arc<LinkEnd>,
}

impl PortHandle for ChildHandle {
    fn post_message(&self, frame: Frame) -> Result<()> {
        self.end.post(frame)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.end.take()
    }

    fn process_side(&self) -> Option<ProcessSide> {
        Some(ProcessSide::Child)
    }
}

/// Worker-side handle on the link to its host.
#[derive(Debug, Clone)]
pub struct ParentPort {
    end: Arc<LinkEnd>,
}

impl PortHandle for ParentPort {
    fn post_message(&self, frame: Frame) -> Result<()> {
        self.end.post(frame)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.end.take()
    }

    fn process_side(&self) -> Option<ProcessSide> {
        Some(ProcessSide::Parent)
    }
}
