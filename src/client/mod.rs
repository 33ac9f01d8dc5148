//! Message client - request/response and events over one port.
//!
//! A [`MessageClient`] wraps one [`Port`] and one [`PendingRequests`]
//! registry. Ids for events and requests come from a single per-client
//! sequence. Inbound `ServiceMessage` responses settle the matching pending
//! entry; everything else on the inbound side is ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::{Envelope, Frame, MessageKind};
use crate::port::{Port, PortHandle, PortListener};
use crate::types::{ClientId, Error, MessageId, MessageIdSequence, Result, DEFAULT_REQUEST_TIMEOUT};

mod contract;
mod pending;

pub use contract::{decode_args, encode_args, Operation, RequestSender, ServiceClient};
pub use pending::{PendingRequests, PendingResponse};

/// Settle a pending entry from an inbound frame, if it is a response.
pub(crate) fn settle_from_frame(pending: &PendingRequests, frame: Frame) {
    let envelope = match frame {
        Frame::ServiceMessage(envelope) => envelope,
        other => {
            tracing::debug!(channel = ?other.channel(), "ignoring non service-message traffic");
            return;
        }
    };
    if envelope.kind != MessageKind::Response {
        tracing::debug!(
            kind = ?envelope.kind,
            message_id = envelope.message_id,
            "ignoring inbound envelope that is not a response"
        );
        return;
    }

    let Envelope {
        message_id,
        result,
        error,
        ..
    } = envelope;
    match error {
        Some(error) => {
            tracing::error!(message_id, %error, "request failed on the remote side");
            pending.reject(message_id, Error::remote(error));
        }
        None => {
            pending.resolve(message_id, result.unwrap_or(Value::Null));
        }
    }
}

/// Register, post and await one request. Shared by clients and services.
pub(crate) async fn send_request(
    port: &Port,
    ids: &MessageIdSequence,
    pending: &PendingRequests,
    operation: &str,
    args: Vec<Value>,
    timeout: Duration,
) -> Result<Value> {
    let message_id = ids.next_id();
    let response = pending.register(message_id, timeout)?;

    if let Err(err) = port.send_envelope(Envelope::request(message_id, operation, args)) {
        tracing::error!(message_id, operation, error = %err, "unable to post request");
        pending.reject(message_id, Error::process_not_running(err.to_string()));
    }

    match response.wait().await {
        Ok(result) => {
            tracing::debug!(message_id, operation, "completed request");
            Ok(result)
        }
        Err(err) => {
            tracing::error!(message_id, operation, error = %err, "failed request");
            Err(err)
        }
    }
}

#[derive(Debug)]
struct ClientInner {
    client_id: ClientId,
    port: Port,
    ids: MessageIdSequence,
    pending: PendingRequests,
    default_timeout: Duration,
}

/// Client bound to one transport endpoint. Clones share the endpoint and
/// the pending registry.
#[derive(Debug, Clone)]
pub struct MessageClient {
    inner: Arc<ClientInner>,
}

impl MessageClient {
    /// Wrap `handle` with the default request timeout.
    pub fn new(client_id: ClientId, handle: Arc<dyn PortHandle>) -> Result<Self> {
        Self::with_timeout(client_id, handle, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        client_id: ClientId,
        handle: Arc<dyn PortHandle>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let pending = PendingRequests::new(client_id.as_str());

        let on_message = pending.clone();
        let on_close = pending.clone();
        let closed_id = client_id.clone();
        let listener = PortListener::new(move |frame| settle_from_frame(&on_message, frame))
            .on_close(move || {
                let abandoned = on_close.cancel_all();
                if abandoned > 0 {
                    tracing::warn!(client_id = %closed_id, abandoned, "client transport closed");
                }
            });

        let port = Port::open(handle, listener).map_err(|err| {
            tracing::error!(client_id = %client_id, error = %err, "invalid port for message client");
            err
        })?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                client_id,
                port,
                ids: MessageIdSequence::new(),
                pending,
                default_timeout,
            }),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    pub fn port(&self) -> &Port {
        &self.inner.port
    }

    /// Fire-and-forget event. Returns the id it was sent under.
    pub fn send_event(&self, data: Value) -> Result<MessageId> {
        let message_id = self.inner.ids.next_id();
        self.inner
            .port
            .send_envelope(Envelope::event(message_id, data))
            .map_err(|err| {
                tracing::error!(client_id = %self.inner.client_id, message_id, error = %err, "unable to post event");
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

    /// Typed request through an [`Operation`] declaration.
    pub async fn call<O: Operation>(&self, args: O::Args) -> Result<O::Output> {
        let result = self.execute_request(O::NAME, encode_args(&args)?).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub fn service_client(&self) -> ServiceClient<MessageClient> {
        ServiceClient::new(self.clone())
    }

    /// Client-side ports are already open; there is nothing to wait for.
    pub async fn when_ready(&self) -> Result<&Self> {
        Ok(self)
    }

    /// No effect on the transport, which the client only borrows.
    pub fn close(&self) {
        tracing::debug!(client_id = %self.inner.client_id, "close has no effect on a borrowed port");
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

#[async_trait]
impl RequestSender for MessageClient {
    async fn ready(&self) -> Result<()> {
        self.when_ready().await.map(|_| ())
    }

    async fn request(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        self.execute_request(operation, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MessageChannel;
    use serde_json::json;
    use tokio::sync::mpsc;

    crate::declare_operation!(Ping = "ping", (String) -> String);

    /// Client on port1, raw inbound capture on port2.
    fn wired() -> (MessageClient, crate::port::MessagePort, mpsc::UnboundedReceiver<Frame>) {
        let channel = MessageChannel::new();
        let client =
            MessageClient::new("main".parse().unwrap(), Arc::new(channel.port1.clone())).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.port2.add_listener(PortListener::new(move |frame| {
            let _ = tx.send(frame);
        }));
        channel.port2.start();
        (client, channel.port2, rx)
    }

    async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Envelope {
        rx.recv().await.unwrap().into_envelope().unwrap()
    }

    #[tokio::test]
    async fn test_ids_shared_between_events_and_requests() {
        let (client, peer, mut rx) = wired();

        assert_eq!(client.send_event(json!({ "a": 1 })).unwrap(), 0);
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.execute_request("ping", vec![json!("main")]).await }
        });
        assert_eq!(client.send_event(json!(null)).unwrap_or(99), 2);

        let event = next_envelope(&mut rx).await;
        assert_eq!(event.kind, MessageKind::Event);
        let request = next_envelope(&mut rx).await;
        assert_eq!(request.kind, MessageKind::Request);
        assert_eq!(request.message_id, 1);
        assert_eq!(request.operation.as_deref(), Some("ping"));

        peer.post_message(Envelope::success(1, Some("ping".into()), json!("pong: main")).into())
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("pong: main"));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_failed_response_rejects_with_remote_error() {
        let (client, peer, mut rx) = wired();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.execute_request("explode", Vec::new()).await }
        });

        let request = next_envelope(&mut rx).await;
        peer.post_message(Envelope::failure(request.message_id, None, "kaboom").into())
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "REMOTE");
        assert_eq!(err.to_string(), "kaboom");
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (client, peer, mut rx) = wired();
        let first = tokio::spawn({
            let client = client.clone();
            async move { client.execute_request("a", Vec::new()).await }
        });
        let a = next_envelope(&mut rx).await;
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.execute_request("b", Vec::new()).await }
        });
        let b = next_envelope(&mut rx).await;

        peer.post_message(Envelope::success(b.message_id, None, json!("B")).into())
            .unwrap();
        peer.post_message(Envelope::success(a.message_id, None, json!("A")).into())
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), json!("A"));
        assert_eq!(second.await.unwrap().unwrap(), json!("B"));
    }

    #[tokio::test]
    async fn test_typed_call() {
        let (client, peer, mut rx) = wired();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call::<Ping>(("main".to_string(),)).await }
        });
        let request = next_envelope(&mut rx).await;
        assert_eq!(request.args, Some(vec![json!("main")]));
        peer.post_message(Envelope::success(request.message_id, None, json!("pong: main")).into())
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), "pong: main");
    }

    #[tokio::test]
    async fn test_service_client_calls_by_name() {
        let (client, peer, mut rx) = wired();
        let facade = client.service_client();
        let call = tokio::spawn(async move { facade.call("ping", vec![json!("x")]).await });
        let request = next_envelope(&mut rx).await;
        assert_eq!(request.operation.as_deref(), Some("ping"));
        peer.post_message(Envelope::success(request.message_id, None, json!("pong: x")).into())
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("pong: x"));
    }

    #[tokio::test]
    async fn test_request_on_closed_port_is_process_not_running() {
        let (client, peer, _rx) = wired();
        client.port().close();
        drop(peer);
        let err = client.execute_request("ping", Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "PROCESS_NOT_RUNNING");
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_abandons_pending() {
        let (client, peer, mut rx) = wired();
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.execute_request("slow", Vec::new()).await }
        });
        let _ = next_envelope(&mut rx).await;
        peer.close();
        assert!(call.await.unwrap().unwrap_err().is_abandoned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_with_override() {
        let (client, _peer, _rx) = wired();
        let err = client
            .execute_request_with_timeout("never", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_requests(), 0);
    }
}
