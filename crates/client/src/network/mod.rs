//! Network transports.
//!
//! Two ways to reach the platform:
//! - the multiplexed push-channel websocket ([`websocket::ConnectionManager`])
//! - one-shot HTTP requests ([`request::RequestBuilder`] + [`http::HttpExecutor`])

pub mod callbacks;
pub mod cursor;
pub mod http;
pub mod pending;
pub mod request;
pub mod websocket;

pub use callbacks::{CallbackRegistry, PushFrame, PushHandler, PUSH_NOTIFY_CMD};
pub use cursor::{GroupCursor, GroupCursorTable, GroupInfo, GROUP_TYPE_MISC, GROUP_TYPE_PRIVATE_MSG};
pub use http::HttpExecutor;
pub use pending::{PendingRequest, PendingRequestTable};
pub use request::{Channel, Payload, RequestBuilder, SignedRequest};
pub use websocket::{ConnectionManager, ConnectionStatus, Handshake, WsConfig, HANDSHAKE_CMD};
