//! Worker dispatcher - the worker-side counterpart of a message client.
//!
//! One dispatcher serves every client of a worker through one set of
//! handlers:
//! - `ServiceMessage` on the parent link is traffic from client `"host"`
//! - `ServiceNewClient` on the parent link hands over a channel for a new
//!   client, which is registered, listened on and started
//! - Requests go to the handler registered for their `type`; the outcome,
//!   success or failure, always goes back as a Response envelope
//! - Events run through the ordered handler chain until one returns true

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::Operation;
use crate::envelope::{Envelope, Frame, MessageKind};
use crate::port::{lock, MessagePort, Port, PortHandle, PortListener};
use crate::types::{ClientId, Error, HandlerError, MessageIdSequence, Result};

mod handler;

pub use handler::{BoxFuture, EventContext, HandlerResult, RequestContext};

use handler::{EventHandler, RequestHandler};

#[derive(Default)]
struct DispatcherInner {
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    event_handlers: RwLock<Vec<EventHandler>>,
    client_ports: Mutex<HashMap<ClientId, Port>>,
    ids: Arc<MessageIdSequence>,
}

/// Routes inbound envelopes to registered handlers. Clones share state.
#[derive(Clone, Default)]
pub struct WorkerDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatcher")
            .field("operations", &self.operations())
            .field("event_handlers", &self.inner.read_events().len())
            .field("clients", &self.clients())
            .finish()
    }
}

impl DispatcherInner {
    fn read_events(&self) -> Vec<EventHandler> {
        self.event_handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn request_handler(&self, operation: &str) -> Option<RequestHandler> {
        self.request_handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(operation)
            .cloned()
    }
}

impl WorkerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `operation`. A later registration replaces
    /// an earlier one.
    pub fn add_request_handler<F, Fut>(&self, operation: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: RequestHandler =
            Arc::new(move |ctx| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(ctx)) });
        self.insert_request_handler(operation.into(), wrapped);
    }

    /// Register a typed handler for a declared [`Operation`].
    pub fn add_operation<O, F, Fut>(&self, handler: F)
    where
        O: Operation + 'static,
        F: Fn(O::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O::Output, HandlerError>> + Send + 'static,
    {
        self.insert_request_handler(O::NAME.to_string(), handler::typed::<O, F, Fut>(handler));
    }

    fn insert_request_handler(&self, operation: String, handler: RequestHandler) {
        tracing::info!(operation = %operation, "registering request handler");
        let previous = self
            .inner
            .request_handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(operation.clone(), handler);
        if previous.is_some() {
            tracing::warn!(operation = %operation, "replaced existing request handler");
        }
    }

    /// Append a synchronous event handler. Returning true stops the chain.
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&EventContext, &Value) -> bool + Send + Sync + 'static,
    {
        self.push_event_handler(EventHandler::Sync(Arc::new(handler)));
    }

    /// Append an async event handler. Resolving to true stops the chain.
    pub fn add_async_event_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(EventContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.push_event_handler(EventHandler::Async(Arc::new(
            move |ctx, data| -> BoxFuture<'static, bool> { Box::pin(handler(ctx, data)) },
        )));
    }

    fn push_event_handler(&self, handler: EventHandler) {
        tracing::info!("registering event handler");
        self.inner
            .event_handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(handler);
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .request_handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Client ids with a live transferred channel.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = lock(&self.inner.client_ports).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Serve the parent link until it closes.
    pub async fn serve<H: PortHandle + 'static>(&self, parent: H) -> Result<()> {
        let (port, mut inbound) = open_forwarding(Arc::new(parent))?;
        tracing::info!(kind = ?port.kind(), "worker dispatcher serving parent link");

        while let Some(frame) = inbound.recv().await {
            match frame {
                Frame::ServiceMessage(envelope) => {
                    self.dispatch(ClientId::host(), port.clone(), envelope);
                }
                Frame::ServiceNewClient { client_id, port } => {
                    self.accept_client(client_id, port);
                }
            }
        }

        tracing::info!("parent link closed, dispatcher stopping");
        let ports: Vec<Port> = lock(&self.inner.client_ports).drain().map(|(_, p)| p).collect();
        for port in ports {
            port.close();
        }
        Ok(())
    }

    fn accept_client(&self, client_id: ClientId, channel: MessagePort) {
        tracing::info!(client_id = %client_id, port = channel.id(), "received new client port");

        let (port, mut inbound) = match open_forwarding(Arc::new(channel)) {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!(client_id = %client_id, error = %err, "unable to open client port");
                return;
            }
        };
        let previous = lock(&self.inner.client_ports).insert(client_id.clone(), port.clone());
        if let Some(previous) = previous {
            tracing::warn!(client_id = %client_id, "replacing port for reconnected client");
            previous.close();
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    Frame::ServiceMessage(envelope) => {
                        dispatcher.dispatch(client_id.clone(), port.clone(), envelope);
                    }
                    Frame::ServiceNewClient { port: stray, .. } => {
                        tracing::error!(
                            client_id = %client_id,
                            "{}",
                            Error::protocol("only service messages are allowed on client ports")
                        );
                        stray.close();
                    }
                }
            }
            dispatcher.release_client(&client_id, &port);
        });
    }

    fn release_client(&self, client_id: &ClientId, port: &Port) {
        let mut ports = lock(&self.inner.client_ports);
        // A same-named client may have registered since; only drop our own.
        if ports.get(client_id).is_some_and(|p| p.same_endpoint(port)) {
            ports.remove(client_id);
            tracing::info!(client_id = %client_id, "client port closed");
        }
    }

    /// Handle one envelope from `client_id` on its own task.
    fn dispatch(&self, client_id: ClientId, reply: Port, envelope: Envelope) {
        let inner = self.inner.clone();
        tokio::spawn(async move { route_envelope(&inner, client_id, reply, envelope).await });
    }
}

async fn route_envelope(inner: &DispatcherInner, client_id: ClientId, reply: Port, envelope: Envelope) {
    match envelope.kind {
        MessageKind::Request => handle_request(inner, client_id, &reply, envelope).await,
        MessageKind::Event => handle_event(inner, client_id, reply, envelope).await,
        other => {
            tracing::error!(
                client_id = %client_id,
                message_id = envelope.message_id,
                kind = ?other,
                "{}",
                Error::protocol(format!("message kind {:?} is invalid here", other))
            );
        }
    }
}

/// Open `handle` with a listener that forwards every frame to a channel.
///
/// The receiver ends once the transport stops delivering.
fn open_forwarding(handle: Arc<dyn PortHandle>) -> Result<(Port, mpsc::UnboundedReceiver<Frame>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let port = Port::open(
        handle,
        PortListener::new(move |frame| {
            let _ = tx.send(frame);
        }),
    )?;
    Ok((port, rx))
}

async fn handle_request(
    inner: &DispatcherInner,
    client_id: ClientId,
    reply: &Port,
    envelope: Envelope,
) {
    let message_id = envelope.message_id;
    let operation = envelope.operation.unwrap_or_default();

    let outcome = match inner.request_handler(&operation) {
        Some(handler) => {
            let ctx = RequestContext {
                client_id: client_id.clone(),
                message_id,
                operation: operation.clone(),
                args: envelope.args.unwrap_or_default(),
            };
            handler(ctx).await
        }
        None => Err(Error::unregistered_handler(operation.clone()).into()),
    };

    let response = match outcome {
        Ok(result) => Envelope::success(message_id, Some(operation.clone()), result),
        Err(err) => {
            tracing::error!(
                client_id = %client_id,
                message_id,
                operation = %operation,
                error = %err,
                "unable to handle request"
            );
            Envelope::failure(message_id, Some(operation.clone()), err.to_string())
        }
    };

    if let Err(err) = reply.send_envelope(response) {
        tracing::warn!(
            client_id = %client_id,
            message_id,
            operation = %operation,
            error = %err,
            "unable to post response"
        );
    }
}

async fn handle_event(inner: &DispatcherInner, client_id: ClientId, reply: Port, envelope: Envelope) {
    let message_id = envelope.message_id;
    let data = envelope.event_data.unwrap_or(Value::Null);
    let ctx = EventContext::new(client_id.clone(), message_id, reply, inner.ids.clone());

    for handler in inner.read_events() {
        if handler.handle(&ctx, &data).await {
            tracing::debug!(client_id = %client_id, message_id, "event handled");
            return;
        }
    }
    tracing::info!(client_id = %client_id, message_id, "unhandled event");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{parent_link, MessageChannel, ParentPort};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    crate::declare_operation!(Add = "add", (i64, i64) -> i64);

    struct Harness {
        host: Port,
        inbound: mpsc::UnboundedReceiver<Frame>,
    }

    impl Harness {
        async fn response(&mut self) -> Envelope {
            tokio::time::timeout(Duration::from_secs(1), self.inbound.recv())
                .await
                .unwrap()
                .unwrap()
                .into_envelope()
                .unwrap()
        }
    }

    fn serve(dispatcher: &WorkerDispatcher) -> Harness {
        let (child, parent): (_, ParentPort) = parent_link();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.serve(parent).await });
        let (host, inbound) = open_forwarding(Arc::new(child)).unwrap();
        Harness { host, inbound }
    }

    #[tokio::test]
    async fn test_request_answered_with_result() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_request_handler("ping", |ctx| async move {
            let name: String = ctx.arg(0)?;
            Ok(json!(format!("pong: {}", name)))
        });
        let mut h = serve(&dispatcher);

        h.host
            .send_envelope(Envelope::request(0, "ping", vec![json!("main")]))
            .unwrap();
        let response = h.response().await;
        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.message_id, 0);
        assert_eq!(response.result, Some(json!("pong: main")));
        assert!(!response.is_failure());
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_field() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_request_handler("fail", |_ctx| async move { Err("boom".into()) });
        let mut h = serve(&dispatcher);

        h.host
            .send_envelope(Envelope::request(7, "fail", Vec::new()))
            .unwrap();
        let response = h.response().await;
        assert_eq!(response.message_id, 7);
        assert_eq!(response.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_unregistered_operation_is_failed_response() {
        let dispatcher = WorkerDispatcher::new();
        let mut h = serve(&dispatcher);

        h.host
            .send_envelope(Envelope::request(1, "missing", Vec::new()))
            .unwrap();
        let response = h.response().await;
        assert_eq!(response.error.as_deref(), Some("unregistered handler: missing"));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_request_handler("v", |_| async { Ok(json!(1)) });
        dispatcher.add_request_handler("v", |_| async { Ok(json!(2)) });
        assert_eq!(dispatcher.operations(), vec!["v".to_string()]);

        let mut h = serve(&dispatcher);
        h.host.send_envelope(Envelope::request(0, "v", Vec::new())).unwrap();
        assert_eq!(h.response().await.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_typed_operation() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_operation::<Add, _, _>(|(a, b)| async move { Ok(a + b) });
        let mut h = serve(&dispatcher);

        h.host
            .send_envelope(Envelope::request(3, "add", vec![json!(20), json!(22)]))
            .unwrap();
        assert_eq!(h.response().await.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_event_chain_stops_at_first_true() {
        let dispatcher = WorkerDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let c = calls.clone();
        dispatcher.add_event_handler(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            false
        });
        let c = calls.clone();
        dispatcher.add_async_event_handler(move |_, data| {
            let c = c.clone();
            let done_tx = done_tx.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(data);
                true
            }
        });
        let c = calls.clone();
        dispatcher.add_event_handler(move |_, _| {
            c.fetch_add(100, Ordering::SeqCst);
            true
        });

        let h = serve(&dispatcher);
        h.host.send_envelope(Envelope::event(0, json!({ "n": 1 }))).unwrap();

        assert_eq!(done_rx.recv().await.unwrap(), json!({ "n": 1 }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Route on the test task so the log lines carry the test's span.
    async fn route_inline(dispatcher: &WorkerDispatcher, envelope: Envelope) {
        let channel = MessageChannel::new();
        let (reply, _rx) = open_forwarding(Arc::new(channel.port1)).unwrap();
        route_envelope(&dispatcher.inner, ClientId::host(), reply, envelope).await;
    }

    #[traced_test]
    #[tokio::test]
    async fn test_unhandled_event_is_logged_not_raised() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_event_handler(|_, _| false);
        route_inline(&dispatcher, Envelope::event(0, json!({ "test": "x" }))).await;
        assert!(logs_contain("unhandled event"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_response_kind_inbound_is_protocol_violation() {
        let dispatcher = WorkerDispatcher::new();
        route_inline(&dispatcher, Envelope::success(0, None, json!(null))).await;
        assert!(logs_contain("is invalid here"));
    }

    #[tokio::test]
    async fn test_new_client_channel_is_served_and_released() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_request_handler("whoami", |ctx| async move {
            Ok(json!(ctx.client_id.to_string()))
        });
        let h = serve(&dispatcher);

        let channel = MessageChannel::new();
        let client_id: ClientId = "renderer".parse().unwrap();
        h.host
            .send(Frame::ServiceNewClient {
                client_id: client_id.clone(),
                port: channel.port2,
            })
            .unwrap();

        let (client_port, mut inbound) = open_forwarding(Arc::new(channel.port1)).unwrap();
        client_port
            .send_envelope(Envelope::request(0, "whoami", Vec::new()))
            .unwrap();
        let response = inbound.recv().await.unwrap().into_envelope().unwrap();
        assert_eq!(response.result, Some(json!("renderer")));
        assert_eq!(dispatcher.clients(), vec![client_id]);

        client_port.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.clients().is_empty());
    }

    #[tokio::test]
    async fn test_event_handler_can_reply_to_client() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_event_handler(|ctx, data| {
            ctx.send_event(json!({ "echo": data })).is_ok()
        });
        let mut h = serve(&dispatcher);
        h.host.send_envelope(Envelope::event(5, json!("hi"))).unwrap();
        let back = h.response().await;
        assert_eq!(back.kind, MessageKind::Event);
        assert_eq!(back.event_data, Some(json!({ "echo": "hi" })));
    }

    #[tokio::test]
    async fn test_reconnecting_client_replaces_old_port() {
        let dispatcher = WorkerDispatcher::new();
        dispatcher.add_request_handler("whoami", |ctx| async move {
            Ok(json!(ctx.client_id.to_string()))
        });
        let h = serve(&dispatcher);
        let client_id: ClientId = "dup".parse().unwrap();

        let first = MessageChannel::new();
        let replaced = first.port1.clone();
        h.host
            .send(Frame::ServiceNewClient {
                client_id: client_id.clone(),
                port: first.port2,
            })
            .unwrap();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        replaced.add_listener(PortListener::new(|_| {}).on_close(move || {
            let _ = closed_tx.send(());
        }));
        replaced.start();

        let second = MessageChannel::new();
        h.host
            .send(Frame::ServiceNewClient {
                client_id: client_id.clone(),
                port: second.port2,
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), closed_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let (client_port, mut inbound) = open_forwarding(Arc::new(second.port1)).unwrap();
        client_port
            .send_envelope(Envelope::request(0, "whoami", Vec::new()))
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap()
            .into_envelope()
            .unwrap();
        assert_eq!(response.result, Some(json!("dup")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.clients(), vec![client_id]);
    }
}
