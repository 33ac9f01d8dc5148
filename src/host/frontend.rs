//! Front-end channel bridge.
//!
//! A front-end that wants to talk to a service directly asks the host for a
//! channel by `{service_name, client_id}`. The host answers on a broadcast
//! with a [`ClientGrant`] carrying the worker-connected port, or an error.
//! Requesters match grants against their own outstanding request.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::client::MessageClient;
use crate::port::MessagePort;
use crate::types::{ClientId, Config, Error, Result, ServiceName};

const GRANT_CAPACITY: usize = 64;

/// Front-end control message: open a channel to `service_name` for `client_id`.
#[derive(Debug, Clone)]
pub struct NewClientRequest {
    pub service_name: ServiceName,
    pub client_id: ClientId,
}

/// Host failure carried back in a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for GrantError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Host answer to a [`NewClientRequest`], tagged for matching.
#[derive(Debug, Clone)]
pub struct ClientGrant {
    pub service_name: ServiceName,
    pub client_id: ClientId,
    pub ports: Vec<MessagePort>,
    pub error: Option<GrantError>,
}

impl ClientGrant {
    pub fn granted(request: NewClientRequest, port: MessagePort) -> Self {
        Self {
            service_name: request.service_name,
            client_id: request.client_id,
            ports: vec![port],
            error: None,
        }
    }

    pub fn failed(request: NewClientRequest, err: &Error) -> Self {
        Self {
            service_name: request.service_name,
            client_id: request.client_id,
            ports: Vec::new(),
            error: Some(GrantError::from(err)),
        }
    }

    fn answers(&self, service_name: &ServiceName, client_id: &ClientId) -> bool {
        &self.service_name == service_name && &self.client_id == client_id
    }
}

/// Open the front-end control link. The link goes to front-ends, the
/// endpoint to [`ServiceHost::serve_front_end`](super::ServiceHost::serve_front_end).
pub fn front_end_link(config: &Config) -> (FrontEndLink, FrontEndEndpoint) {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (grants, _) = broadcast::channel(GRANT_CAPACITY);
    (
        FrontEndLink {
            requests: requests_tx,
            grants: grants.clone(),
            grant_timeout: config.bridge.grant_timeout,
            request_timeout: config.requests.default_timeout,
        },
        FrontEndEndpoint {
            requests: requests_rx,
            grants,
        },
    )
}

/// Front-end side of the control link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrontEndLink {
    requests: mpsc::UnboundedSender<NewClientRequest>,
    grants: broadcast::Sender<ClientGrant>,
    grant_timeout: Duration,
    request_timeout: Duration,
}

impl FrontEndLink {
    /// Ask the host for a channel to `service_name` and wrap it in a client.
    pub async fn create_client(
        &self,
        service_name: ServiceName,
        client_id: ClientId,
    ) -> Result<MessageClient> {
        let mut grants = self.grants.subscribe();
        self.requests
            .send(NewClientRequest {
                service_name: service_name.clone(),
                client_id: client_id.clone(),
            })
            .map_err(|_| Error::channel_closed("front-end control link is closed"))?;

        let grant = tokio::time::timeout(
            self.grant_timeout,
            wait_for_grant(&mut grants, &service_name, &client_id),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "no channel grant for client {} on service {} after {:?}",
                client_id, service_name, self.grant_timeout
            ))
        })??;

        if let Some(err) = grant.error {
            tracing::error!(service = %service_name, client_id = %client_id, code = %err.code, "channel grant failed");
            return Err(Error::remote(err.message));
        }

        let mut ports = grant.ports.into_iter();
        let port = ports
            .next()
            .ok_or_else(|| Error::invalid_port("at least one port must be transferred"))?;
        for extra in ports {
            tracing::warn!(port = extra.id(), "closing extra port in channel grant");
            extra.close();
        }

        tracing::debug!(service = %service_name, client_id = %client_id, "received channel grant");
        MessageClient::with_timeout(client_id, std::sync::Arc::new(port), self.request_timeout)
    }
}

async fn wait_for_grant(
    grants: &mut broadcast::Receiver<ClientGrant>,
    service_name: &ServiceName,
    client_id: &ClientId,
) -> Result<ClientGrant> {
    loop {
        match grants.recv().await {
            Ok(grant) if grant.answers(service_name, client_id) => return Ok(grant),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "front-end missed channel grants");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::channel_closed("front-end control link is closed"));
            }
        }
    }
}

/// Host side of the control link.
#[derive(Debug)]
pub struct FrontEndEndpoint {
    requests: mpsc::UnboundedReceiver<NewClientRequest>,
    grants: broadcast::Sender<ClientGrant>,
}

impl FrontEndEndpoint {
    /// Next channel request, or `None` once every link is dropped.
    pub async fn next_request(&mut self) -> Option<NewClientRequest> {
        self.requests.recv().await
    }

    /// Publish a grant. Ports in a grant nobody receives are closed.
    pub fn grant(&self, grant: ClientGrant) {
        if let Err(broadcast::error::SendError(unclaimed)) = self.grants.send(grant) {
            tracing::warn!(client_id = %unclaimed.client_id, "no front-end waiting for channel grant");
            for port in unclaimed.ports {
                port.close();
            }
        }
    }
}
