//! Handler types and the contexts they receive.

use std::future::Future;
use std::sync::Arc;

pub use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{decode_args, Operation};
use crate::envelope::Envelope;
use crate::port::Port;
use crate::types::{ClientId, HandlerError, MessageId, MessageIdSequence, Result};

/// Result of a request handler. An `Err` becomes the Response's `error` field.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

pub(crate) type RequestHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum EventHandler {
    Sync(Arc<dyn Fn(&EventContext, &Value) -> bool + Send + Sync>),
    Async(Arc<dyn Fn(EventContext, Value) -> BoxFuture<'static, bool> + Send + Sync>),
}

impl EventHandler {
    pub(crate) async fn handle(&self, ctx: &EventContext, data: &Value) -> bool {
        match self {
            EventHandler::Sync(handler) => handler(ctx, data),
            EventHandler::Async(handler) => handler(ctx.clone(), data.clone()).await,
        }
    }
}

/// Wrap a typed operation body as an untyped request handler.
pub(crate) fn typed<O, F, Fut>(handler: F) -> RequestHandler
where
    O: Operation + 'static,
    F: Fn(O::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O::Output, HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(
        move |ctx: RequestContext| -> BoxFuture<'static, HandlerResult> {
            Box::pin(call_typed::<O, F, Fut>(handler.clone(), ctx.args))
        },
    )
}

async fn call_typed<O, F, Fut>(handler: Arc<F>, args: Vec<Value>) -> HandlerResult
where
    O: Operation + 'static,
    F: Fn(O::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<O::Output, HandlerError>> + Send + 'static,
{
    let args: O::Args = decode_args(args)?;
    let output = handler(args).await?;
    Ok(serde_json::to_value(output)?)
}

/// One inbound request as seen by its handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_id: ClientId,
    pub message_id: MessageId,
    pub operation: String,
    pub args: Vec<Value>,
}

impl RequestContext {
    /// Positional argument `index`, deserialized.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, HandlerError> {
        let value = self
            .args
            .get(index)
            .cloned()
            .ok_or_else(|| format!("{}: missing argument {}", self.operation, index))?;
        Ok(serde_json::from_value(value)?)
    }

    /// All arguments as one tuple.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T> {
        decode_args(self.args.clone())
    }
}

/// One inbound event as seen by the handler chain.
///
/// Carries the port it arrived on so a handler can talk back to that client.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub client_id: ClientId,
    pub message_id: MessageId,
    port: Port,
    ids: Arc<MessageIdSequence>,
}

impl EventContext {
    pub(crate) fn new(
        client_id: ClientId,
        message_id: MessageId,
        port: Port,
        ids: Arc<MessageIdSequence>,
    ) -> Self {
        Self {
            client_id,
            message_id,
            port,
            ids,
        }
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Post an event back to the originating client.
    pub fn send_event(&self, data: Value) -> Result<MessageId> {
        let message_id = self.ids.next_id();
        self.port.send_envelope(Envelope::event(message_id, data))?;
        Ok(message_id)
    }
}
