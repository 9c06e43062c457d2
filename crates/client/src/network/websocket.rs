//! Multiplexed push-channel connection.
//!
//! One websocket carries concurrent request/response exchanges, matched by
//! correlation id, and server pushes, matched by command id. The
//! [`ConnectionManager`] owns the connection state machine:
//!
//! ```text
//! Closed ──connect()──▶ Connecting ──upgrade + handshake ok──▶ Open
//!   ▲                       │                                   │
//!   └────── failure ────────┘◀──── close frame / read error ────┘
//! ```
//!
//! A single dispatch task reads frames in arrival order. Writes from any
//! number of callers are serialized through one async mutex around the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Credential, FrameCodec, ProtocolError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, Sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::callbacks::{CallbackRegistry, PushFrame};
use super::cursor::{GroupCursorTable, GroupInfo};
use super::pending::{PendingRequest, PendingRequestTable};
use crate::config::Config;
use crate::error::{ClientError, Result, TimeoutKind};

/// Command id of the application handshake.
pub const HANDSHAKE_CMD: u32 = 1001;

/// Extension header announcing the IM protocol version.
pub const IM_VERSION_EXTENSION: &str = "im_version=2.3";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No usable connection.
    Closed,
    /// Upgrade or handshake in progress.
    Connecting,
    /// Ready for requests.
    Open,
}

/// Application-level handshake run right after the websocket upgrade.
///
/// The payload schema belongs to the endpoint layer. The handshake frame is
/// sent without compression or encryption because the server learns the
/// session key from it.
pub trait Handshake: Send + Sync {
    /// Command id of the handshake frame.
    fn cmd(&self) -> u32 {
        HANDSHAKE_CMD
    }

    /// Serialize the handshake request for `credential`.
    fn payload(&self, credential: &dyn Credential) -> Result<Vec<u8>>;

    /// Parse the handshake response into the groups to seed cursors with.
    ///
    /// A non-zero server status must be reported as [`ClientError::Server`].
    fn parse(&self, response: &[u8]) -> Result<Vec<GroupInfo>>;
}

/// Configuration for the push-channel connection.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Websocket URL.
    pub url: String,
    /// Budget for the TCP connect and websocket upgrade.
    pub connect_timeout: Duration,
    /// Budget for writing one frame.
    pub send_timeout: Duration,
    /// Default budget for awaiting a response.
    pub read_timeout: Duration,
    /// Close the connection after this long without traffic in either
    /// direction. Zero disables the check.
    pub keepalive: Duration,
    /// Interval between pings, if any.
    pub heartbeat: Option<Duration>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WsConfig {
    /// Creates a configuration for `url` with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Derive the websocket settings from the client configuration.
    pub fn from_config(config: &Config) -> Self {
        let timeout = &config.timeout;
        Self {
            url: config.network.ws_url.clone(),
            connect_timeout: timeout.ws_connect(),
            send_timeout: timeout.ws_send(),
            read_timeout: timeout.ws_read(),
            keepalive: timeout.ws_keepalive(),
            heartbeat: timeout.ws_heartbeat(),
        }
    }

    pub fn with_connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = duration;
        self
    }

    pub fn with_send_timeout(mut self, duration: Duration) -> Self {
        self.send_timeout = duration;
        self
    }

    pub fn with_read_timeout(mut self, duration: Duration) -> Self {
        self.read_timeout = duration;
        self
    }

    pub fn with_keepalive(mut self, duration: Duration) -> Self {
        self.keepalive = duration;
        self
    }

    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }
}

/// Running dispatch task of the current connection.
struct Dispatcher {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

/// Write side of the connection, shared with the dispatch task.
struct SharedWriter {
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// Set once a write fails fatally, so the next status check reports it.
    transport_closed: AtomicBool,
    last_write: Mutex<Instant>,
}

impl SharedWriter {
    fn new() -> Self {
        Self {
            sink: tokio::sync::Mutex::new(None),
            transport_closed: AtomicBool::new(false),
            last_write: Mutex::new(Instant::now()),
        }
    }

    async fn install(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
        self.transport_closed.store(false, Ordering::Release);
        self.touch();
    }

    async fn take(&self) -> Option<WsSink> {
        self.sink.lock().await.take()
    }

    fn is_closed(&self) -> bool {
        self.transport_closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.transport_closed.store(true, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_write.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_write(&self) -> Instant {
        *self.last_write.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write one message under the send timeout.
    async fn send(&self, timeout: Duration, message: WsMessage) -> Result<()> {
        let write = async {
            let mut sink = self.sink.lock().await;
            let sink = sink
                .as_mut()
                .ok_or_else(|| ClientError::ConnectionClosed("websocket is not open".to_string()))?;
            sink.send(message).await.map_err(ClientError::from)
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => {
                if e.is_connection_fatal() {
                    self.mark_closed();
                }
                Err(e)
            }
            Err(_) => Err(ClientError::Timeout(TimeoutKind::Send)),
        }
    }
}

/// Status plus the generation of the connection that owns it.
///
/// Every connect attempt starts a new generation; a dispatch task from an
/// older generation must not touch status, pending requests or the sink.
#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    generation: u64,
}

/// Owner of the push-channel websocket.
pub struct ConnectionManager {
    config: WsConfig,
    credential: Arc<dyn Credential>,
    codec: FrameCodec,
    registry: Arc<CallbackRegistry>,
    handshake: Option<Arc<dyn Handshake>>,
    pending: Arc<PendingRequestTable>,
    cursors: Arc<GroupCursorTable>,
    state: Arc<Mutex<ConnectionState>>,
    writer: Arc<SharedWriter>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl ConnectionManager {
    /// Create a closed manager.
    ///
    /// `registry` is shared read-only with the dispatch loop, so every push
    /// handler must be registered before this call.
    pub fn new(
        config: WsConfig,
        credential: Arc<dyn Credential>,
        registry: Arc<CallbackRegistry>,
    ) -> Self {
        let codec = FrameCodec::with_cipher(Arc::new(Arc::clone(&credential)));
        let pending = PendingRequestTable::new(config.read_timeout);
        Self {
            config,
            credential,
            codec,
            registry,
            handshake: None,
            pending,
            cursors: Arc::new(GroupCursorTable::new()),
            state: Arc::new(Mutex::new(ConnectionState {
                status: ConnectionStatus::Closed,
                generation: 0,
            })),
            writer: Arc::new(SharedWriter::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Run `handshake` after every upgrade before reporting the connection open.
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Message-id cursors of the current connection.
    pub fn cursors(&self) -> &Arc<GroupCursorTable> {
        &self.cursors
    }

    /// Outstanding requests.
    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, generation: u64, new_status: ConnectionStatus) {
        let mut state = self.lock_state();
        if state.generation != generation {
            debug!(
                generation,
                current = state.generation,
                "Stale status update ignored"
            );
            return;
        }
        if state.status != new_status {
            debug!(from = ?state.status, to = ?new_status, "Connection status changed");
            state.status = new_status;
        }
    }

    /// Current status.
    ///
    /// An `Open` connection whose dispatch task has exited or whose transport
    /// failed on write is reported (and recorded) as `Closed`.
    pub fn status(&self) -> ConnectionStatus {
        let mut state = self.lock_state();
        if state.status == ConnectionStatus::Open
            && (self.writer.is_closed() || self.dispatcher_finished())
        {
            debug!("Connection found closed");
            state.status = ConnectionStatus::Closed;
        }
        state.status
    }

    fn dispatcher_finished(&self) -> bool {
        let dispatcher = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner());
        dispatcher
            .as_ref()
            .map_or(true, |dispatcher| dispatcher.task.is_finished())
    }

    /// Move `Closed` to `Connecting` and start a new generation.
    ///
    /// Returns `None` when a connection is already open or being opened.
    fn begin_connect(&self) -> Option<u64> {
        // lazy close detection first, so a dead connection can be replaced
        self.status();
        let mut state = self.lock_state();
        if state.status != ConnectionStatus::Closed {
            debug!(status = ?state.status, "Connect skipped");
            return None;
        }
        state.status = ConnectionStatus::Connecting;
        state.generation += 1;
        Some(state.generation)
    }

    /// Open the websocket and run the handshake.
    ///
    /// A no-op when already open or connecting. On any failure the socket is
    /// torn down, the status returns to `Closed` and the error is returned.
    /// There is no automatic retry.
    pub async fn connect(&self) -> Result<()> {
        let Some(generation) = self.begin_connect() else {
            return Ok(());
        };

        match self.open(generation).await {
            Ok(()) => {
                self.set_status(generation, ConnectionStatus::Open);
                info!(url = %self.config.url, generation, "Websocket connected");
                Ok(())
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "Websocket connect failed");
                self.teardown().await;
                self.pending.fail_all("connect failed");
                self.set_status(generation, ConnectionStatus::Closed);
                Err(e)
            }
        }
    }

    async fn open(&self, generation: u64) -> Result<()> {
        // the previous dispatcher is stale by now and exits without side effects
        self.teardown().await;
        self.pending.fail_all("reconnecting");
        self.cursors.clear();

        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Extensions",
            HeaderValue::from_static(IM_VERSION_EXTENSION),
        );
        headers.insert("Accept-Encoding", HeaderValue::from_static("gzip"));

        debug!(url = %self.config.url, generation, "Opening websocket");
        let (stream, response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(request))
                .await
                .map_err(|_| ClientError::Timeout(TimeoutKind::Connect))??;
        debug!(status = %response.status(), "Websocket upgraded");

        let (sink, source) = stream.split();
        self.writer.install(sink).await;

        let shutdown = CancellationToken::new();
        let context = self.dispatch_context(generation);
        let task = tokio::spawn(context.run(source, shutdown.clone()));
        let replaced = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Dispatcher { task, shutdown });
        if let Some(old) = replaced {
            old.shutdown.cancel();
        }

        if let Some(handshake) = self.handshake.clone() {
            self.run_handshake(handshake.as_ref()).await?;
        }
        Ok(())
    }

    fn dispatch_context(&self, generation: u64) -> DispatchContext {
        DispatchContext {
            generation,
            codec: self.codec.clone(),
            registry: Arc::clone(&self.registry),
            pending: Arc::clone(&self.pending),
            cursors: Arc::clone(&self.cursors),
            state: Arc::clone(&self.state),
            writer: Arc::clone(&self.writer),
            keepalive: self.config.keepalive,
            heartbeat: self.config.heartbeat,
            send_timeout: self.config.send_timeout,
        }
    }

    async fn run_handshake(&self, handshake: &dyn Handshake) -> Result<()> {
        let payload = handshake.payload(self.credential.as_ref())?;
        let pending = self
            .send_frame(&payload, handshake.cmd(), false, false)
            .await?;
        let response = pending.await_result(self.config.read_timeout).await?;
        let groups = handshake.parse(&response)?;
        self.cursors.seed(&groups);
        info!(groups = groups.len(), "Handshake complete");
        Ok(())
    }

    /// Stop the dispatch task and drop the sink, waiting for the task to exit.
    async fn teardown(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown.cancel();
            if let Err(e) = dispatcher.task.await {
                warn!(error = %e, "Dispatch task ended abnormally");
            }
        }
        self.writer.take().await;
    }

    /// Send a close frame and shut the connection down.
    pub async fn close(&self) -> Result<()> {
        if let Some(mut sink) = self.writer.take().await {
            match tokio::time::timeout(self.config.send_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
                Err(_) => debug!("Timed out sending close frame"),
            }
        }
        self.teardown().await;
        self.pending.fail_all("connection closed by client");
        let generation = self.lock_state().generation;
        self.set_status(generation, ConnectionStatus::Closed);
        info!("Websocket closed");
        Ok(())
    }

    /// Send a request frame and return the handle for its response.
    ///
    /// The frame is written before this returns. If encoding or writing
    /// fails, the request is removed again and the error is returned.
    pub async fn send(
        &self,
        payload: &[u8],
        cmd: u32,
        compress: bool,
        encrypt: bool,
    ) -> Result<PendingRequest> {
        if self.status() != ConnectionStatus::Open {
            return Err(ClientError::ConnectionClosed(
                "websocket is not open".to_string(),
            ));
        }
        self.send_frame(payload, cmd, compress, encrypt).await
    }

    /// Send a request and wait for its response with the default read timeout.
    pub async fn request(
        &self,
        payload: &[u8],
        cmd: u32,
        compress: bool,
        encrypt: bool,
    ) -> Result<Bytes> {
        self.send(payload, cmd, compress, encrypt).await?.read().await
    }

    async fn send_frame(
        &self,
        payload: &[u8],
        cmd: u32,
        compress: bool,
        encrypt: bool,
    ) -> Result<PendingRequest> {
        let pending = self.pending.register();
        let correlation_id = pending.correlation_id();
        let frame = self
            .codec
            .encode(payload, cmd, correlation_id, compress, encrypt)?;
        debug!(cmd, correlation_id, len = frame.len(), "Sending frame");
        self.writer
            .send(self.config.send_timeout, WsMessage::Binary(frame))
            .await?;
        Ok(pending)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(dispatcher) = dispatcher.take() {
                dispatcher.shutdown.cancel();
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.url)
            .field("status", &self.lock_state().status)
            .field("pending", &self.pending.len())
            .field("registry", &self.registry)
            .finish()
    }
}

/// State shared between a connection and its dispatch task.
struct DispatchContext {
    generation: u64,
    codec: FrameCodec,
    registry: Arc<CallbackRegistry>,
    pending: Arc<PendingRequestTable>,
    cursors: Arc<GroupCursorTable>,
    state: Arc<Mutex<ConnectionState>>,
    writer: Arc<SharedWriter>,
    keepalive: Duration,
    heartbeat: Option<Duration>,
    send_timeout: Duration,
}

impl DispatchContext {
    async fn run(self, mut source: WsSource, shutdown: CancellationToken) {
        let reason = self.read_loop(&mut source, &shutdown).await;
        self.finish(&reason).await;
    }

    /// Close out the connection after the read loop ends.
    ///
    /// Returns `false` without side effects when a newer connection has
    /// taken over.
    async fn finish(&self, reason: &str) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != self.generation {
                debug!(
                    generation = self.generation,
                    current = state.generation,
                    reason,
                    "Stale dispatch loop stopped"
                );
                return false;
            }
            state.status = ConnectionStatus::Closed;
            self.writer.mark_closed();
        }
        self.pending.fail_all(reason);
        self.writer.take().await;
        info!(reason = %reason, "Dispatch loop stopped");
        true
    }

    /// Read frames until the connection ends, returning why it ended.
    async fn read_loop(&self, source: &mut WsSource, shutdown: &CancellationToken) -> String {
        let mut heartbeat = self.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        let mut idle = (!self.keepalive.is_zero())
            .then(|| Box::pin(tokio::time::sleep(self.keepalive)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return "closed by client".to_string();
                }
                _ = idle_expired(&mut idle) => {
                    // writes count as activity too
                    let deadline = self.writer.last_write() + self.keepalive;
                    if deadline > Instant::now() {
                        if let Some(idle) = idle.as_mut() {
                            idle.as_mut().reset(deadline);
                        }
                        continue;
                    }
                    warn!(keepalive = ?self.keepalive, "Websocket idle, closing");
                    let close = self.writer.send(self.send_timeout, WsMessage::Close(None));
                    if let Err(e) = close.await {
                        debug!(error = %e, "Close frame not delivered");
                    }
                    return "keepalive expired".to_string();
                }
                _ = next_tick(&mut heartbeat) => {
                    let ping = self.writer.send(self.send_timeout, WsMessage::Ping(Vec::new()));
                    if let Err(e) = ping.await {
                        warn!(error = %e, "Failed to send heartbeat ping");
                        return format!("heartbeat failed: {e}");
                    }
                    debug!("Sent heartbeat ping");
                }
                message = source.next() => {
                    if let Some(idle) = idle.as_mut() {
                        idle.as_mut().reset(Instant::now() + self.keepalive);
                    }
                    match message {
                        Some(Ok(WsMessage::Binary(data))) => {
                            if let Err(e) = self.handle_frame(&data) {
                                warn!(error = %e, len = data.len(), "Undecodable frame");
                                return format!("protocol error: {e}");
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!(frame = ?frame, "Server sent close");
                            return "server closed connection".to_string();
                        }
                        Some(Ok(_)) => {
                            // text, ping and pong carry nothing for us
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Websocket read failed");
                            return format!("read error: {e}");
                        }
                        None => return "stream ended".to_string(),
                    }
                }
            }
        }
    }

    /// Route one inbound frame to its push handler or waiting request.
    fn handle_frame(&self, data: &[u8]) -> std::result::Result<(), ProtocolError> {
        let frame = self.codec.decode(data)?;
        let push = PushFrame {
            cmd: frame.cmd,
            correlation_id: frame.correlation_id,
            payload: Bytes::from(frame.payload),
            cursors: Arc::clone(&self.cursors),
        };

        match self.registry.dispatch(push) {
            Ok(handler) => {
                debug!(cmd = frame.cmd, "Dispatching push");
                tokio::spawn(handler);
            }
            Err(push) => {
                let (cmd, correlation_id) = (push.cmd, push.correlation_id);
                if !self.pending.resolve(correlation_id, push.payload) {
                    debug!(cmd, correlation_id, "Dropping frame with no handler or waiter");
                }
            }
        }
        Ok(())
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn idle_expired(sleep: &mut Option<std::pin::Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
