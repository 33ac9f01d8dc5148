//! Request contracts - compile-time typing over the untyped envelope path.
//!
//! An [`Operation`] ties an operation name to its argument tuple and return
//! type. Nothing about it exists at runtime: arguments are still sent as an
//! ordered JSON list and results come back as a JSON value.
//!
//! ```ignore
//! upm_core::declare_operation!(pub Ping = "ping", (String) -> String);
//!
//! let pong = client.call::<Ping>(("main".to_string(),)).await?;
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::types::{Error, Result};

/// Static declaration of one named operation.
pub trait Operation {
    const NAME: &'static str;
    /// Argument tuple, sent as an ordered list.
    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// Declare a marker type implementing [`Operation`].
#[macro_export]
macro_rules! declare_operation {
    ($(#[$meta:meta])* $vis:vis $name:ident = $op:literal, ($($arg:ty),* $(,)?) -> $out:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::client::Operation for $name {
            const NAME: &'static str = $op;
            type Args = ($($arg,)*);
            type Output = $out;
        }
    };
}

/// Flatten an argument tuple into the envelope's ordered `args` list.
pub fn encode_args<T: Serialize>(args: &T) -> Result<Vec<Value>> {
    match serde_json::to_value(args)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}

/// Rebuild an argument tuple from an envelope's `args` list.
pub fn decode_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T> {
    let value = if args.is_empty() {
        Value::Null
    } else {
        Value::Array(args)
    };
    serde_json::from_value(value).map_err(Error::from)
}

/// Anything that can carry a request to a worker.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Resolve once requests can be sent.
    async fn ready(&self) -> Result<()>;

    /// Send `operation` with `args` and await its result.
    async fn request(&self, operation: &str, args: Vec<Value>) -> Result<Value>;
}

/// Call-by-name facade over a [`RequestSender`].
///
/// `call("f", args)` is the same request as `execute_request("f", args)`,
/// issued after the sender reports ready.
#[derive(Debug, Clone)]
pub struct ServiceClient<S> {
    sender: S,
}

impl<S: RequestSender> ServiceClient<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    pub async fn call(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        self.sender.ready().await?;
        self.sender.request(operation, args).await
    }

    pub async fn invoke<O: Operation>(&self, args: O::Args) -> Result<O::Output> {
        let result = self.call(O::NAME, encode_args(&args)?).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }
}
