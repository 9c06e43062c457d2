//! Integration tests for the push-channel connection.
//!
//! Each test runs a local websocket server speaking the frame format and
//! drives a real [`ConnectionManager`] against it:
//! - Upgrade headers and the application handshake
//! - Request/response matching and frame flags
//! - Push dispatch order
//! - Connection failure, timeouts and keepalive

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use client::error::{ClientError, Result, TimeoutKind};
use client::network::{
    CallbackRegistry, ConnectionManager, ConnectionStatus, GroupInfo, Handshake, PushFrame,
    WsConfig, GROUP_TYPE_MISC, GROUP_TYPE_PRIVATE_MSG, HANDSHAKE_CMD, PUSH_NOTIFY_CMD,
};
use futures_util::{SinkExt, StreamExt};
use protocol::{Account, Credential, Frame, FrameCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const SECRET: [u8; 31] = [7; 31];

fn account() -> Arc<Account> {
    Arc::new(Account::anonymous().with_ws_secret(SECRET))
}

/// Server side of one accepted websocket.
struct ServerConn {
    ws: WebSocketStream<TcpStream>,
    codec: FrameCodec,
}

impl ServerConn {
    /// Next decoded frame, or `None` once the client went away.
    async fn recv_frame(&mut self) -> Option<Frame> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(Message::Binary(data)) => return Some(self.codec.decode(&data).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }

    async fn send_frame(&mut self, payload: &[u8], cmd: u32, id: u32, compress: bool, encrypt: bool) {
        let frame = self.codec.encode(payload, cmd, id, compress, encrypt).unwrap();
        self.ws.send(Message::Binary(frame)).await.unwrap();
    }

    /// Read until the client disconnects.
    async fn drain(mut self) {
        while self.recv_frame().await.is_some() {}
    }
}

/// Upgrade headers captured by the server.
#[derive(Debug)]
struct UpgradeHeaders {
    extensions: Option<String>,
    accept_encoding: Option<String>,
}

/// Accept one websocket connection and hand it to `handler`.
async fn spawn_server<F, Fut>(handler: F) -> (String, oneshot::Receiver<UpgradeHeaders>)
where
    F: FnOnce(ServerConn) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (headers_tx, headers_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let _ = headers_tx.send(UpgradeHeaders {
                extensions: header("sec-websocket-extensions"),
                accept_encoding: header("accept-encoding"),
            });
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
        let codec = FrameCodec::with_cipher(account());
        handler(ServerConn { ws, codec }).await;
    });

    (url, headers_rx)
}

fn ws_config(url: &str) -> WsConfig {
    WsConfig::new(url)
        .with_connect_timeout(Duration::from_secs(2))
        .with_send_timeout(Duration::from_secs(1))
        .with_read_timeout(Duration::from_secs(2))
}

fn manager(url: &str) -> ConnectionManager {
    ConnectionManager::new(ws_config(url), account(), Arc::new(CallbackRegistry::new()))
}

async fn wait_for_status(manager: &ConnectionManager, expected: ConnectionStatus) {
    for _ in 0..100 {
        if manager.status() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("status never became {expected:?}");
}

/// Handshake with a `type:group:last_msg;...` text response.
struct TextHandshake;

impl Handshake for TextHandshake {
    fn payload(&self, credential: &dyn Credential) -> Result<Vec<u8>> {
        Ok(format!("cuid={}", credential.cuid()).into_bytes())
    }

    fn parse(&self, response: &[u8]) -> Result<Vec<GroupInfo>> {
        let text = String::from_utf8_lossy(response);
        if let Some(message) = text.strip_prefix("error:") {
            return Err(ClientError::Server {
                code: 110000,
                message: message.to_string(),
            });
        }
        Ok(text
            .split(';')
            .map(|group| {
                let parts: Vec<u64> = group.split(':').map(|p| p.parse().unwrap()).collect();
                GroupInfo {
                    group_type: parts[0] as i32,
                    group_id: parts[1],
                    last_msg_id: parts[2],
                }
            })
            .collect())
    }
}

// =============================================================================
// Connection Setup Tests
// =============================================================================

#[tokio::test]
async fn test_upgrade_sends_protocol_headers() {
    let (url, headers) = spawn_server(|conn| conn.drain()).await;
    let manager = manager(&url);

    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Open);

    let headers = headers.await.unwrap();
    assert_eq!(headers.extensions.as_deref(), Some("im_version=2.3"));
    assert_eq!(headers.accept_encoding.as_deref(), Some("gzip"));

    manager.close().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_connect_twice_is_noop() {
    let (url, _headers) = spawn_server(|conn| conn.drain()).await;
    let manager = manager(&url);

    manager.connect().await.unwrap();
    // the server accepts only one connection, so a second upgrade would fail
    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Open);
}

#[tokio::test]
async fn test_rejected_upgrade_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
            .await;
    });

    let manager = manager(&url);
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)), "got {err:?}");
    assert_eq!(manager.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_handshake_seeds_cursors() {
    let (url, _headers) = spawn_server(|mut conn| async move {
        let hello = conn.recv_frame().await.unwrap();
        assert_eq!(hello.cmd, HANDSHAKE_CMD);
        assert!(!hello.flags.is_encrypted());
        assert!(!hello.flags.is_compressed());
        assert!(hello.payload.starts_with(b"cuid="));

        let groups = format!("{GROUP_TYPE_PRIVATE_MSG}:1000:55;{GROUP_TYPE_MISC}:2000:7");
        conn.send_frame(groups.as_bytes(), HANDSHAKE_CMD, hello.correlation_id, false, false)
            .await;
        conn.drain().await;
    })
    .await;

    let manager = manager(&url).with_handshake(Arc::new(TextHandshake));
    manager.connect().await.unwrap();

    let cursors = manager.cursors();
    assert_eq!(cursors.len(), 2);
    assert_eq!(cursors.private_group(), 1000);
    assert_eq!(cursors.last_id(1000), 55);
    assert_eq!(cursors.last_id(2000), 7);
    assert_eq!(cursors.record_id(), 5501);
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn test_handshake_server_error_closes() {
    let (url, _headers) = spawn_server(|mut conn| async move {
        let hello = conn.recv_frame().await.unwrap();
        conn.send_frame(b"error:bad cuid", HANDSHAKE_CMD, hello.correlation_id, false, false)
            .await;
        conn.drain().await;
    })
    .await;

    let manager = manager(&url).with_handshake(Arc::new(TextHandshake));
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Server { code: 110000, .. }), "got {err:?}");
    assert_eq!(manager.status(), ConnectionStatus::Closed);
    assert!(manager.cursors().is_empty());
}

// =============================================================================
// Request / Response Tests
// =============================================================================

#[tokio::test]
async fn test_request_response_all_flag_combinations() {
    let combos = [(false, false), (true, false), (false, true), (true, true)];

    let (url, _headers) = spawn_server(move |mut conn| async move {
        for (compress, encrypt) in combos {
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.flags.is_compressed(), compress);
            assert_eq!(frame.flags.is_encrypted(), encrypt);

            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&frame.payload);
            conn.send_frame(&reply, frame.cmd, frame.correlation_id, compress, encrypt)
                .await;
        }
        conn.drain().await;
    })
    .await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    for (compress, encrypt) in combos {
        let payload = format!("compress={compress} encrypt={encrypt}");
        let response = manager
            .request(payload.as_bytes(), 205001, compress, encrypt)
            .await
            .unwrap();
        assert_eq!(response, Bytes::from(format!("re:{payload}")));
    }
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (url, _headers) = spawn_server(|mut conn| async move {
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(conn.recv_frame().await.unwrap());
        }
        for frame in frames.iter().rev() {
            let mut reply = b"for ".to_vec();
            reply.extend_from_slice(&frame.payload);
            conn.send_frame(&reply, frame.cmd, frame.correlation_id, false, true)
                .await;
        }
        conn.drain().await;
    })
    .await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    let first = manager.send(b"a", 1, false, true).await.unwrap();
    let second = manager.send(b"b", 1, false, true).await.unwrap();
    let third = manager.send(b"c", 1, false, true).await.unwrap();

    let ids = [first.correlation_id(), second.correlation_id(), third.correlation_id()];
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);

    let (a, b, c) = tokio::join!(first.read(), second.read(), third.read());
    assert_eq!(&a.unwrap()[..], b"for a");
    assert_eq!(&b.unwrap()[..], b"for b");
    assert_eq!(&c.unwrap()[..], b"for c");
}

#[tokio::test]
async fn test_unknown_frame_is_dropped() {
    let (url, _headers) = spawn_server(|mut conn| async move {
        let frame = conn.recv_frame().await.unwrap();
        let stray_id = frame.correlation_id.wrapping_add(1000);
        conn.send_frame(b"stray", 777, stray_id, false, false).await;
        conn.send_frame(b"answer", frame.cmd, frame.correlation_id, false, false)
            .await;
        conn.drain().await;
    })
    .await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    let response = manager.request(b"q", 42, false, false).await.unwrap();
    assert_eq!(&response[..], b"answer");
    assert_eq!(manager.status(), ConnectionStatus::Open);
}

#[tokio::test]
async fn test_read_timeout_removes_request_and_ignores_late_response() {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (url, _headers) = spawn_server(|mut conn| async move {
        let slow = conn.recv_frame().await.unwrap();
        let _ = release_rx.await;
        conn.send_frame(b"late", slow.cmd, slow.correlation_id, false, false)
            .await;

        let next = conn.recv_frame().await.unwrap();
        conn.send_frame(b"fresh", next.cmd, next.correlation_id, false, false)
            .await;
        conn.drain().await;
    })
    .await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    let pending = manager.send(b"slow", 9, false, false).await.unwrap();
    let id = pending.correlation_id();
    let err = pending.await_result(Duration::from_millis(100)).await.unwrap_err();
    assert!(err.is_timeout(TimeoutKind::Read), "got {err:?}");
    assert!(!manager.pending().contains(id));

    let _ = release_tx.send(());
    let response = manager.request(b"next", 9, false, false).await.unwrap();
    assert_eq!(&response[..], b"fresh");
    assert_eq!(manager.status(), ConnectionStatus::Open);
}

// =============================================================================
// Push Dispatch Tests
// =============================================================================

#[tokio::test]
async fn test_pushes_are_dispatched_in_arrival_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = CallbackRegistry::new();
    registry.register_callback(PUSH_NOTIFY_CMD, move |frame: PushFrame| {
        let _ = tx.send(frame.payload.clone());
        async {}
    });

    let (url, _headers) = spawn_server(|mut conn| async move {
        for i in 0..5u32 {
            let payload = format!("push {i}");
            conn.send_frame(payload.as_bytes(), PUSH_NOTIFY_CMD, 0, i % 2 == 0, true)
                .await;
        }
        conn.drain().await;
    })
    .await;

    let manager = ConnectionManager::new(ws_config(&url), account(), Arc::new(registry));
    manager.connect().await.unwrap();

    for i in 0..5u32 {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from(format!("push {i}")));
    }
}

#[tokio::test]
async fn test_push_does_not_resolve_pending_request() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = CallbackRegistry::new();
    registry.register_callback(PUSH_NOTIFY_CMD, move |frame: PushFrame| {
        let _ = tx.send(frame.correlation_id);
        async {}
    });

    let (url, _headers) = spawn_server(|mut conn| async move {
        let frame = conn.recv_frame().await.unwrap();
        // a push that happens to carry the request's id goes to the handler
        conn.send_frame(b"push", PUSH_NOTIFY_CMD, frame.correlation_id, false, false)
            .await;
        conn.send_frame(b"reply", frame.cmd, frame.correlation_id, false, false)
            .await;
        conn.drain().await;
    })
    .await;

    let manager = ConnectionManager::new(ws_config(&url), account(), Arc::new(registry));
    manager.connect().await.unwrap();

    let pending = manager.send(b"q", 3, false, false).await.unwrap();
    let id = pending.correlation_id();
    assert_eq!(&pending.read().await.unwrap()[..], b"reply");
    assert_eq!(rx.recv().await, Some(id));
}

// =============================================================================
// Connection Failure Tests
// =============================================================================

#[tokio::test]
async fn test_server_close_fails_pending_requests() {
    let (url, _headers) = spawn_server(|mut conn| async move {
        let _ = conn.recv_frame().await.unwrap();
        let _ = conn.recv_frame().await.unwrap();
        let _ = conn.ws.close(None).await;
        conn.drain().await;
    })
    .await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    let first = manager.send(b"one", 5, false, false).await.unwrap();
    let second = manager.send(b"two", 5, false, false).await.unwrap();

    let (a, b) = tokio::join!(first.read(), second.read());
    assert!(matches!(a, Err(ClientError::ConnectionClosed(_))), "got {a:?}");
    assert!(matches!(b, Err(ClientError::ConnectionClosed(_))), "got {b:?}");

    wait_for_status(&manager, ConnectionStatus::Closed).await;
    assert!(manager.pending().is_empty());

    let err = manager.send(b"three", 5, false, false).await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_client_close_fails_pending_requests() {
    let (url, _headers) = spawn_server(|conn| conn.drain()).await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    let pending = manager.send(b"never answered", 5, false, false).await.unwrap();
    manager.close().await.unwrap();

    let result = pending.read().await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed(_))), "got {result:?}");
    assert_eq!(manager.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_idle_connection_expires() {
    let (url, _headers) = spawn_server(|conn| conn.drain()).await;

    let manager = ConnectionManager::new(
        ws_config(&url).with_keepalive(Duration::from_millis(150)),
        account(),
        Arc::new(CallbackRegistry::new()),
    );
    manager.connect().await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Open);

    wait_for_status(&manager, ConnectionStatus::Closed).await;
}

#[tokio::test]
async fn test_heartbeat_sends_pings() {
    let (pings_tx, pings_rx) = oneshot::channel();
    let (url, _headers) = spawn_server(|mut conn| async move {
        let mut pings = 0;
        while let Some(Ok(message)) = conn.ws.next().await {
            if message.is_ping() {
                pings += 1;
                if pings == 2 {
                    break;
                }
            }
        }
        let _ = pings_tx.send(pings);
        conn.drain().await;
    })
    .await;

    let manager = ConnectionManager::new(
        ws_config(&url).with_heartbeat(Some(Duration::from_millis(50))),
        account(),
        Arc::new(CallbackRegistry::new()),
    );
    manager.connect().await.unwrap();

    let pings = tokio::time::timeout(Duration::from_secs(2), pings_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pings, 2);
    assert_eq!(manager.status(), ConnectionStatus::Open);
}

#[tokio::test]
async fn test_undecodable_frame_fails_pending_requests() {
    let (url, _headers) = spawn_server(|mut conn| async move {
        let _ = conn.recv_frame().await.unwrap();
        let _ = conn.recv_frame().await.unwrap();
        // shorter than a frame header
        conn.ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        conn.drain().await;
    })
    .await;

    let manager = manager(&url);
    manager.connect().await.unwrap();

    let first = manager.send(b"one", 5, false, false).await.unwrap();
    let second = manager.send(b"two", 5, false, false).await.unwrap();

    let (a, b) = tokio::join!(first.read(), second.read());
    for result in [a, b] {
        match result {
            Err(ClientError::ConnectionClosed(reason)) => {
                assert!(reason.starts_with("protocol error"), "got {reason}")
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    wait_for_status(&manager, ConnectionStatus::Closed).await;
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn test_stalled_writer_is_send_timeout() {
    let (url, _headers) = spawn_server(|conn| async move {
        // keep the socket open without reading so the client's buffers fill
        let _conn = conn;
        tokio::time::sleep(Duration::from_secs(30)).await;
    })
    .await;

    let manager = ConnectionManager::new(
        ws_config(&url).with_send_timeout(Duration::from_millis(200)),
        account(),
        Arc::new(CallbackRegistry::new()),
    );
    manager.connect().await.unwrap();

    let chunk = vec![0x5a; 1024 * 1024];
    let mut sent = Vec::new();
    let mut failure = None;
    for _ in 0..64 {
        match manager.send(&chunk, 5, false, false).await {
            Ok(pending) => sent.push(pending),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let err = failure.expect("writes never stalled");
    assert!(err.is_timeout(TimeoutKind::Send), "got {err:?}");
    // only the requests that were written stay registered
    assert_eq!(manager.pending().len(), sent.len());
    drop(sent);
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn test_writes_keep_connection_alive() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let (url, _headers) = spawn_server(|mut conn| async move {
        let mut saw_close = false;
        while let Some(Ok(message)) = conn.ws.next().await {
            if message.is_close() {
                saw_close = true;
                break;
            }
        }
        let _ = closed_tx.send(saw_close);
    })
    .await;

    let manager = ConnectionManager::new(
        ws_config(&url).with_keepalive(Duration::from_millis(300)),
        account(),
        Arc::new(CallbackRegistry::new()),
    );
    manager.connect().await.unwrap();

    // the server never answers, so only outbound traffic keeps the socket alive
    for _ in 0..7 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending = manager.send(b"tick", 5, false, false).await.unwrap();
        drop(pending);
    }
    assert_eq!(manager.status(), ConnectionStatus::Open);

    wait_for_status(&manager, ConnectionStatus::Closed).await;
    let saw_close = tokio::time::timeout(Duration::from_secs(2), closed_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(saw_close, "server never saw a close frame");
}
