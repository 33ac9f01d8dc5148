//! Link bridge - carries a process link over a byte stream.
//!
//! The bridge owns the far end of an in-memory link and mirrors it onto a
//! framed stream (see [`super::codec`]). Transferred channels survive the
//! process boundary as numbered virtual ports:
//! - an outbound `ServiceNewClient` registers the channel under a fresh port
//!   number and sends a `NEW_CLIENT` frame
//! - an inbound `NEW_CLIENT` frame opens a local channel pair, registers one
//!   end and hands the other to the link as `ServiceNewClient`
//! - closing a registered channel on either side sends `CLOSE_PORT`
//!
//! Host and worker run the same bridge; only the port numbering differs so
//! both sides can allocate without colliding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::codec::{
    read_frame, write_frame, WireFrame, PRIMARY_PORT, TAG_CLOSE_PORT, TAG_NEW_CLIENT,
    TAG_SERVICE_MESSAGE,
};
use crate::envelope::{Envelope, Frame, NewClientPayload};
use crate::port::{lock, MessageChannel, MessagePort, PortHandle, PortListener};
use crate::types::{ClientId, Error, Result, TransportConfig};

/// Which side of the stream this bridge sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRole {
    /// Host process; allocates odd port numbers.
    Host,
    /// Worker process; allocates even port numbers.
    Worker,
}

impl BridgeRole {
    fn first_port(self) -> u32 {
        match self {
            BridgeRole::Host => 1,
            BridgeRole::Worker => 2,
        }
    }
}

struct BridgeState {
    role: BridgeRole,
    ports: Mutex<HashMap<u32, MessagePort>>,
    next_port: AtomicU32,
    out: mpsc::UnboundedSender<WireFrame>,
}

impl std::fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeState")
            .field("role", &self.role)
            .field("ports", &lock(&self.ports).len())
            .finish()
    }
}

impl BridgeState {
    fn emit(&self, frame: WireFrame) {
        if self.out.send(frame).is_err() {
            tracing::debug!(role = ?self.role, "bridge writer gone, dropping frame");
        }
    }

    fn emit_envelope(&self, port: u32, envelope: &Envelope) {
        match serde_json::to_vec(envelope) {
            Ok(payload) => self.emit(WireFrame::new(TAG_SERVICE_MESSAGE, port, payload)),
            Err(err) => {
                tracing::error!(port, message_id = envelope.message_id, error = %err, "unable to encode envelope");
            }
        }
    }

    /// Put a local channel end on the wire under a fresh port number.
    fn export_channel(self: &Arc<Self>, client_id: &ClientId, channel: MessagePort) {
        let number = self.next_port.fetch_add(2, Ordering::Relaxed);
        let payload = match serde_json::to_vec(&NewClientPayload {
            client_id: client_id.clone(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(client_id = %client_id, error = %err, "unable to encode new client");
                channel.close();
                return;
            }
        };
        self.register(number, channel);
        self.emit(WireFrame::new(TAG_NEW_CLIENT, number, payload));
    }

    /// Track `channel` under `number` and mirror its traffic onto the wire.
    fn register(self: &Arc<Self>, number: u32, channel: MessagePort) {
        lock(&self.ports).insert(number, channel.clone());

        let on_message = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);
        channel.add_listener(
            PortListener::new(move |frame| {
                let Some(state) = on_message.upgrade() else {
                    return;
                };
                match frame {
                    Frame::ServiceMessage(envelope) => state.emit_envelope(number, &envelope),
                    Frame::ServiceNewClient { port, .. } => {
                        tracing::error!(port = number, "{}", Error::protocol("channel hand-off on a client port"));
                        port.close();
                    }
                }
            })
            .on_close(move || {
                if let Some(state) = on_close.upgrade() {
                    if lock(&state.ports).remove(&number).is_some() {
                        state.emit(WireFrame::close_port(number));
                    }
                }
            }),
        );
        channel.start();
    }

    fn close_all(&self) {
        let ports: Vec<MessagePort> = lock(&self.ports).drain().map(|(_, port)| port).collect();
        for port in ports {
            port.close();
        }
    }
}

/// Bridge between one in-memory link end and a framed byte stream.
#[derive(Debug)]
pub struct LinkBridge<H> {
    local: H,
    config: TransportConfig,
    role: BridgeRole,
}

impl<H: PortHandle + 'static> LinkBridge<H> {
    /// `local` must still have its inbound stream available.
    pub fn new(local: H, config: TransportConfig, role: BridgeRole) -> Self {
        Self {
            local,
            config,
            role,
        }
    }

    /// Run the bridge on its own task.
    pub fn spawn<R, W>(self, reader: R, writer: W) -> JoinHandle<Result<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(reader, writer))
    }

    /// Pump both directions until the stream ends. The local link end is
    /// dropped on return, which its peer observes as the link going down.
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(mut local_inbound) = self.local.take_inbound() else {
            return Err(Error::invalid_port("bridge link end has no inbound stream"));
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireFrame>();
        let state = Arc::new(BridgeState {
            role: self.role,
            ports: Mutex::new(HashMap::new()),
            next_port: AtomicU32::new(self.role.first_port()),
            out: out_tx,
        });
        let max_frame_bytes = self.config.max_frame_bytes;
        let role = self.role;

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = write_frame(&mut writer, &frame, max_frame_bytes).await {
                    if err.kind() == std::io::ErrorKind::InvalidInput {
                        tracing::error!(role = ?role, port = frame.port, error = %err, "dropping oversized frame");
                        continue;
                    }
                    tracing::warn!(role = ?role, error = %err, "bridge write failed");
                    break;
                }
            }
        });

        let pump_state = state.clone();
        let pump_task = tokio::spawn(async move {
            while let Some(frame) = local_inbound.recv().await {
                match frame {
                    Frame::ServiceMessage(envelope) => pump_state.emit_envelope(PRIMARY_PORT, &envelope),
                    Frame::ServiceNewClient { client_id, port } => {
                        pump_state.export_channel(&client_id, port);
                    }
                }
            }
        });

        tracing::debug!(role = ?self.role, "link bridge running");
        let outcome = loop {
            let frame = match read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(err) => {
                    tracing::error!(role = ?self.role, error = %err, "bridge read failed");
                    break Err(Error::from(err));
                }
            };
            self.route(&state, frame);
        };

        tracing::debug!(role = ?self.role, "link bridge stream ended");
        pump_task.abort();
        state.close_all();
        drop(state);
        // Let queued frames drain; the writer ends once every sender is gone.
        let _ = writer_task.await;
        outcome
    }

    fn route(&self, state: &Arc<BridgeState>, frame: WireFrame) {
        match frame.tag {
            TAG_SERVICE_MESSAGE => {
                let envelope: Envelope = match serde_json::from_slice(&frame.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(port = frame.port, error = %err, "dropping undecodable envelope");
                        return;
                    }
                };
                if frame.port == PRIMARY_PORT {
                    if let Err(err) = self.local.post_message(Frame::ServiceMessage(envelope)) {
                        tracing::warn!(error = %err, "local link is down");
                    }
                    return;
                }
                let target = lock(&state.ports).get(&frame.port).cloned();
                match target {
                    Some(channel) => {
                        if let Err(err) = channel.post_message(Frame::ServiceMessage(envelope)) {
                            tracing::warn!(port = frame.port, error = %err, "unable to deliver to channel");
                        }
                    }
                    None => tracing::debug!(port = frame.port, "frame for unknown or closed port"),
                }
            }
            TAG_NEW_CLIENT => {
                let payload: NewClientPayload = match serde_json::from_slice(&frame.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(port = frame.port, error = %err, "dropping undecodable new client");
                        return;
                    }
                };
                let channel = MessageChannel::new();
                state.register(frame.port, channel.port1);
                let handoff = Frame::ServiceNewClient {
                    client_id: payload.client_id,
                    port: channel.port2,
                };
                if let Err(err) = self.local.post_message(handoff) {
                    tracing::warn!(port = frame.port, error = %err, "local link is down");
                }
            }
            TAG_CLOSE_PORT => {
                let removed = lock(&state.ports).remove(&frame.port);
                if let Some(channel) = removed {
                    tracing::debug!(port = frame.port, "remote closed channel");
                    channel.close();
                }
            }
            other => {
                tracing::warn!(tag = other, port = frame.port, "unknown frame tag");
            }
        }
    }
}
