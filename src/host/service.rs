//! Host-side record of one worker: readiness, requests, channels, stop.
//!
//! Lifecycle:
//! ```text
//!   Starting ──Spawned──▶ Ready ──stop()──▶ Stopping ──Exited──▶ Stopped
//!      │                    │
//!      └──Exited──▶ Failed  └──Exited──▶ Stopped
//! ```
//! Any exit cancels every pending request and closes every channel. An exit
//! before `Spawned` also fails readiness with `StartupExit`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::spawner::{SpawnedWorker, WorkerControl, WorkerEvent};
use crate::client::{
    send_request, settle_from_frame, MessageClient, PendingRequests, RequestSender, ServiceClient,
};
use crate::envelope::{Envelope, Frame};
use crate::port::{lock, MessageChannel, MessagePort, Port, PortListener};
use crate::types::{ClientId, Error, MessageId, MessageIdSequence, Result, ServiceName};

/// Externally visible service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Spawned, waiting for the acknowledgement.
    Starting,
    /// Acknowledged and accepting traffic.
    Ready,
    /// Exited before acknowledging.
    Failed,
    /// Stop requested, exit not yet observed.
    Stopping,
    /// Exited after becoming ready.
    Stopped,
}

/// Snapshot of a service for listing and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: ServiceName,
    pub entry: String,
    pub state: ServiceState,
    pub pending_requests: usize,
    pub channels: Vec<ClientId>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Starting,
    Ready,
    Failed(i32),
}

#[derive(Debug)]
struct ServiceInner {
    name: ServiceName,
    entry: String,
    started_at: DateTime<Utc>,
    port: Port,
    control: Box<dyn WorkerControl>,
    ids: MessageIdSequence,
    pending: PendingRequests,
    default_timeout: Duration,
    channels: Mutex<HashMap<ClientId, MessageChannel>>,
    readiness: watch::Sender<Readiness>,
    exit: watch::Sender<Option<i32>>,
    stopping: AtomicBool,
}

/// Handle on one managed worker. Clones share the same service.
#[derive(Debug, Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Wrap a freshly spawned worker and start supervising it.
    pub(crate) fn start(
        name: ServiceName,
        entry: impl Into<String>,
        worker: SpawnedWorker,
        default_timeout: Duration,
    ) -> Result<Self> {
        let SpawnedWorker {
            port: handle,
            control,
            events,
        } = worker;

        let pending = PendingRequests::new(name.as_str());
        let on_message = pending.clone();
        let on_close = pending.clone();
        let link_name = name.clone();
        let listener = PortListener::new(move |frame| settle_from_frame(&on_message, frame))
            .on_close(move || {
                let abandoned = on_close.cancel_all();
                tracing::debug!(service = %link_name, abandoned, "worker link closed");
            });
        let port = Port::open(Arc::new(handle), listener)?;

        let (readiness, _) = watch::channel(Readiness::Starting);
        let (exit, _) = watch::channel(None);
        let inner = Arc::new(ServiceInner {
            name,
            entry: entry.into(),
            started_at: Utc::now(),
            port,
            control,
            ids: MessageIdSequence::new(),
            pending,
            default_timeout,
            channels: Mutex::new(HashMap::new()),
            readiness,
            exit,
            stopping: AtomicBool::new(false),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), events));
        Ok(Self { inner })
    }

    pub fn name(&self) -> &ServiceName {
        &self.inner.name
    }

    pub fn entry(&self) -> &str {
        &self.inner.entry
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.control.pid()
    }

    pub fn state(&self) -> ServiceState {
        let exited = self.inner.exit.borrow().is_some();
        match *self.inner.readiness.borrow() {
            Readiness::Starting if self.inner.stopping.load(Ordering::SeqCst) => ServiceState::Stopping,
            Readiness::Starting => ServiceState::Starting,
            Readiness::Failed(_) => ServiceState::Failed,
            Readiness::Ready if exited => ServiceState::Stopped,
            Readiness::Ready if self.inner.stopping.load(Ordering::SeqCst) => ServiceState::Stopping,
            Readiness::Ready => ServiceState::Ready,
        }
    }

    /// Still healthy, running and runnable.
    pub fn is_running(&self) -> bool {
        !self.inner.stopping.load(Ordering::SeqCst) && self.inner.exit.borrow().is_none()
    }

    pub fn info(&self) -> ServiceInfo {
        let mut channels: Vec<ClientId> = lock(&self.inner.channels).keys().cloned().collect();
        channels.sort();
        ServiceInfo {
            name: self.inner.name.clone(),
            entry: self.inner.entry.clone(),
            state: self.state(),
            pending_requests: self.inner.pending.len(),
            channels,
            started_at: self.inner.started_at,
            exit_code: *self.inner.exit.borrow(),
        }
    }

    /// Resolve once the worker acknowledged spawn; fail if it exited first.
    pub async fn when_ready(&self) -> Result<()> {
        let mut readiness = self.inner.readiness.subscribe();
        let outcome = *readiness
            .wait_for(|state| *state != Readiness::Starting)
            .await
            .map_err(|_| Error::not_ready(format!("service {} went away while starting", self.inner.name)))?;
        match outcome {
            Readiness::Ready => Ok(()),
            Readiness::Failed(code) => Err(Error::StartupExit(code)),
            Readiness::Starting => Err(Error::not_ready(self.inner.name.to_string())),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        Err(Error::process_not_running(format!(
            "service {} is not running",
            self.inner.name
        )))
    }

    /// Fire-and-forget event on the worker's primary link.
    pub fn send_event(&self, data: Value) -> Result<MessageId> {
        self.ensure_running()?;
        let message_id = self.inner.ids.next_id();
        self.inner
            .port
            .send_envelope(Envelope::event(message_id, data))
            .map_err(|err| {
                tracing::error!(service = %self.inner.name, message_id, error = %err, "unable to post event");
                Error::process_not_running(err.to_string())
            })?;
        Ok(message_id)
    }

    pub async fn execute_request(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        self.execute_request_with_timeout(operation, args, self.inner.default_timeout)
            .await
    }

    pub async fn execute_request_with_timeout(
        &self,
        operation: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_running().map_err(|err| {
            tracing::error!(service = %self.inner.name, operation, error = %err, "request to stopped service");
            err
        })?;
        send_request(
            &self.inner.port,
            &self.inner.ids,
            &self.inner.pending,
            operation,
            args,
            timeout,
        )
        .await
    }

    pub fn service_client(&self) -> ServiceClient<Service> {
        ServiceClient::new(self.clone())
    }

    /// Open a channel to the worker for `client_id` and return the caller's end.
    pub fn create_message_channel(&self, client_id: ClientId) -> Result<MessagePort> {
        let readiness = *self.inner.readiness.borrow();
        if readiness != Readiness::Ready || !self.is_running() {
            tracing::error!(service = %self.inner.name, client_id = %client_id, state = ?self.state(), "channel requested from service that is not ready");
            return Err(Error::not_ready(format!(
                "service {} is {:?}",
                self.inner.name,
                self.state()
            )));
        }

        let channel = MessageChannel::new();
        let previous = lock(&self.inner.channels).insert(client_id.clone(), channel.clone());
        if let Some(previous) = previous {
            tracing::info!(service = %self.inner.name, client_id = %client_id, "replacing channel for reconnected client");
            previous.close();
        }

        let handoff = Frame::ServiceNewClient {
            client_id: client_id.clone(),
            port: channel.port1.clone(),
        };
        if let Err(err) = self.inner.port.send(handoff) {
            tracing::error!(service = %self.inner.name, client_id = %client_id, error = %err, "unable to create channel");
            self.close_channel(&client_id, &channel);
            return Err(Error::process_not_running(err.to_string()));
        }

        tracing::info!(service = %self.inner.name, client_id = %client_id, "created message channel");
        Ok(channel.port2)
    }

    /// Message client on a new channel, owned by the host.
    pub fn create_main_client(&self, client_id: ClientId) -> Result<MessageClient> {
        let port = self.create_message_channel(client_id.clone())?;
        MessageClient::with_timeout(client_id, Arc::new(port), self.inner.default_timeout)
    }

    /// Drop `channel` from the map unless a newer one took its place.
    fn close_channel(&self, client_id: &ClientId, channel: &MessageChannel) {
        {
            let mut channels = lock(&self.inner.channels);
            if channels
                .get(client_id)
                .is_some_and(|current| current.port1.id() == channel.port1.id())
            {
                channels.remove(client_id);
            }
        }
        channel.close();
    }

    /// Stop the worker. Repeated calls wait on the same outcome.
    ///
    /// Pending requests are cancelled and channels closed before the worker
    /// is asked to terminate.
    pub async fn stop(&self) -> Result<i32> {
        let mut exit = self.inner.exit.subscribe();
        let already_exited = exit.borrow().is_some();

        if already_exited || self.inner.stopping.swap(true, Ordering::SeqCst) {
            tracing::debug!(service = %self.inner.name, "service already stopping or stopped");
        } else {
            tracing::info!(service = %self.inner.name, "stopping service");
            self.inner.release();
            if let Err(err) = self.inner.control.kill() {
                tracing::error!(service = %self.inner.name, error = %err, "unable to kill worker");
                // Let the next stop() retry the kill.
                self.inner.stopping.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }

        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::process_not_running(format!("service {} lost its worker", self.inner.name)))?;
        Ok(code.unwrap_or_default())
    }
}

impl ServiceInner {
    /// Cancel pending requests and close every channel.
    fn release(&self) {
        let abandoned = self.pending.cancel_all();
        let channels: Vec<(ClientId, MessageChannel)> = lock(&self.channels).drain().collect();
        let closed = channels.len();
        for (_, channel) in channels {
            channel.close();
        }
        if abandoned > 0 || closed > 0 {
            tracing::info!(service = %self.name, abandoned, closed, "released service resources");
        }
    }

    fn on_exit(&self, code: i32) {
        let failed_start = self.readiness.send_if_modified(|state| {
            if *state == Readiness::Starting {
                *state = Readiness::Failed(code);
                return true;
            }
            false
        });
        if failed_start {
            tracing::error!(service = %self.name, code, "{}", Error::StartupExit(code));
        } else {
            tracing::warn!(service = %self.name, code, "service exited");
        }

        self.release();
        self.exit.send_if_modified(|exit| {
            if exit.is_some() {
                tracing::warn!(service = %self.name, code, "exit already recorded");
                return false;
            }
            *exit = Some(code);
            true
        });
    }
}

/// Follow the worker's lifecycle events until it exits.
async fn supervise(service: Weak<ServiceInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    loop {
        let event = events.recv().await;
        let Some(inner) = service.upgrade() else {
            return;
        };
        match event {
            Some(WorkerEvent::Spawned) => {
                let acknowledged = inner.readiness.send_if_modified(|state| {
                    if *state == Readiness::Starting {
                        *state = Readiness::Ready;
                        return true;
                    }
                    false
                });
                if acknowledged {
                    tracing::info!(service = %inner.name, entry = %inner.entry, "service ready");
                }
            }
            Some(WorkerEvent::Exited(code)) => {
                inner.on_exit(code);
                return;
            }
            None => {
                tracing::error!(service = %inner.name, "worker event stream ended without an exit");
                inner.on_exit(-1);
                return;
            }
        }
    }
}

#[async_trait]
impl RequestSender for Service {
    async fn ready(&self) -> Result<()> {
        self.when_ready().await
    }

    async fn request(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        self.execute_request(operation, args).await
    }
}
