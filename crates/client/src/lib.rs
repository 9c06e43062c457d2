//! # tieba-wire Client Library
//!
//! Async transports for the forum platform's private interfaces.
//!
//! ## Overview
//!
//! - **Push channel**: one websocket multiplexing concurrent requests and
//!   server pushes, with per-frame compression and encryption
//! - **HTTP**: signed mobile requests and cookie-authenticated web requests
//!   over a pooled client
//! - **Configuration**: TOML file with timeouts, proxy and account tokens
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Client                           │
//! │                 strategy(): Websocket | Http             │
//! ├────────────────────────────┬─────────────────────────────┤
//! │     ConnectionManager      │       RequestBuilder        │
//! │  ┌──────────────────────┐  │  ┌───────────────────────┐  │
//! │  │ PendingRequestTable  │  │  │  sign / multipart /   │  │
//! │  │ CallbackRegistry     │  │  │  cookies per channel  │  │
//! │  │ GroupCursorTable     │  │  └───────────────────────┘  │
//! │  └──────────────────────┘  │        HttpExecutor         │
//! ├────────────────────────────┴─────────────────────────────┤
//! │                 protocol::FrameCodec                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use client::network::{CallbackRegistry, PushFrame, PUSH_NOTIFY_CMD};
//! use client::{Client, Config};
//! use protocol::Account;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let account = Arc::new(Account::new(
//!         config.account.bduss.clone(),
//!         config.account.stoken.clone(),
//!     )?);
//!
//!     let mut registry = CallbackRegistry::new();
//!     registry.register_callback(PUSH_NOTIFY_CMD, |frame: PushFrame| async move {
//!         println!("push with {} bytes", frame.payload.len());
//!     });
//!
//!     let client = Client::with_registry(config, account, registry)?;
//!     client.init_websocket().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod network;

pub use client::{Client, DualEndpoint, Strategy};
pub use config::{Config, ConfigError, TimeoutConfig};
pub use error::{ClientError, Result, TimeoutKind};
pub use network::{
    Channel, ConnectionManager, ConnectionStatus, HttpExecutor, Payload, RequestBuilder,
    SignedRequest, WsConfig,
};
