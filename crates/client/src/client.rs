//! Client facade choosing between the websocket and HTTP per call.

use std::sync::Arc;

use bytes::Bytes;
use protocol::Credential;
use tracing::debug;

use crate::config::{Config, NetworkConfig};
use crate::error::Result;
use crate::network::{
    CallbackRegistry, ConnectionManager, ConnectionStatus, Handshake, HttpExecutor,
    RequestBuilder, SignedRequest, WsConfig,
};

/// Transport used for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Multiplexed frame on the open websocket.
    Websocket,
    /// One-shot HTTP request.
    Http,
}

/// An endpoint reachable over both transports.
///
/// The payload schema and response parsing stay with the endpoint; the
/// client only picks the transport and moves bytes.
pub trait DualEndpoint: Send + Sync {
    /// Parsed response.
    type Output: Send;

    /// Command id of the websocket request.
    fn cmd(&self) -> u32;

    /// Whether the websocket payload is compressed.
    fn compress(&self) -> bool {
        false
    }

    /// Serialize the websocket request body.
    fn ws_payload(&self, credential: &dyn Credential) -> Result<Vec<u8>>;

    /// Parse the websocket response body.
    fn parse_ws(&self, response: Bytes) -> Result<Self::Output>;

    /// Build the HTTP request.
    fn http_request(&self, builder: &RequestBuilder, network: &NetworkConfig) -> Result<SignedRequest>;

    /// Parse the HTTP response body.
    fn parse_http(&self, response: Bytes) -> Result<Self::Output>;
}

/// Entry point tying configuration, credential and both transports together.
pub struct Client {
    config: Config,
    credential: Arc<dyn Credential>,
    websocket: ConnectionManager,
    builder: RequestBuilder,
    http: HttpExecutor,
}

impl Client {
    /// Create a client without push handlers.
    pub fn new(config: Config, credential: Arc<dyn Credential>) -> Result<Self> {
        Self::with_registry(config, credential, CallbackRegistry::new())
    }

    /// Create a client whose websocket dispatches pushes to `registry`.
    pub fn with_registry(
        config: Config,
        credential: Arc<dyn Credential>,
        registry: CallbackRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let websocket = ConnectionManager::new(
            WsConfig::from_config(&config),
            Arc::clone(&credential),
            Arc::new(registry),
        );
        let builder = RequestBuilder::new(Arc::clone(&credential));
        let http = HttpExecutor::new(&config)?;

        Ok(Self {
            config,
            credential,
            websocket,
            builder,
            http,
        })
    }

    /// Run `handshake` on every websocket connect.
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.websocket = self.websocket.with_handshake(handshake);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn credential(&self) -> &Arc<dyn Credential> {
        &self.credential
    }

    pub fn websocket(&self) -> &ConnectionManager {
        &self.websocket
    }

    pub fn request_builder(&self) -> &RequestBuilder {
        &self.builder
    }

    pub fn http(&self) -> &HttpExecutor {
        &self.http
    }

    /// Connect the websocket unless it is already open.
    pub async fn init_websocket(&self) -> Result<()> {
        if self.websocket.status() != ConnectionStatus::Open {
            self.websocket.connect().await?;
        }
        Ok(())
    }

    /// Transport the next call would use.
    pub fn strategy(&self) -> Strategy {
        if self.config.network.try_ws && self.websocket.status() == ConnectionStatus::Open {
            Strategy::Websocket
        } else {
            Strategy::Http
        }
    }

    /// Perform `endpoint` over the transport chosen by [`Client::strategy`].
    ///
    /// The choice is made once; a websocket failure is returned rather than
    /// retried over HTTP.
    pub async fn call<E: DualEndpoint>(&self, endpoint: &E) -> Result<E::Output> {
        let strategy = self.strategy();
        debug!(cmd = endpoint.cmd(), ?strategy, "Calling endpoint");

        match strategy {
            Strategy::Websocket => {
                let payload = endpoint.ws_payload(self.credential.as_ref())?;
                let response = self
                    .websocket
                    .request(&payload, endpoint.cmd(), endpoint.compress(), true)
                    .await?;
                endpoint.parse_ws(response)
            }
            Strategy::Http => {
                let request = endpoint.http_request(&self.builder, &self.config.network)?;
                let response = self.http.execute(request).await?;
                endpoint.parse_http(response)
            }
        }
    }

    /// Close the websocket, failing anything still waiting on it.
    pub async fn close(&self) -> Result<()> {
        self.websocket.close().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("websocket", &self.websocket)
            .field("strategy", &self.strategy())
            .finish()
    }
}
