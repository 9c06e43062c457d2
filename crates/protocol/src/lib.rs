//! # tieba-wire Protocol Library
//!
//! Pure, I/O-free building blocks of the forum client's transport layer.
//!
//! ## Overview
//!
//! - **Frame Codec**: the 9-byte-header binary frame used on the push channel
//! - **Ciphers**: AES-256-ECB frame encryption, AES-128-CBC, `rc4_42` key
//!   wrapping and RSA sealing of the session secret
//! - **Compression**: deterministic gzip for frame payloads
//! - **Signing**: the MD5 parameter signature of the mobile API
//! - **Credentials**: login tokens plus per-device key material
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Endpoint payloads              │  protobuf / form fields
//! ├─────────────────────────────────────────┤
//! │              Compression                │  gzip, mtime 0
//! ├─────────────────────────────────────────┤
//! │              Encryption                 │  AES-256-ECB, PKCS#7
//! ├─────────────────────────────────────────┤
//! │                Framing                  │  flags | cmd | correlation id
//! ├─────────────────────────────────────────┤
//! │          Transport (websocket)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use protocol::{Account, FrameCodec};
//!
//! let account = Arc::new(Account::anonymous());
//! let codec = FrameCodec::with_cipher(account);
//!
//! let bytes = codec.encode(b"payload", 202006, 1, true, true).unwrap();
//! let frame = codec.decode(&bytes).unwrap();
//! assert_eq!(frame.payload, b"payload");
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec
//! - [`cipher`]: Frame cipher and key handling
//! - [`compression`]: gzip helpers
//! - [`signing`]: Request signature
//! - [`credential`]: Account credentials
//! - [`error`]: Error types

pub mod cipher;
pub mod compression;
pub mod credential;
pub mod error;
pub mod framing;
pub mod signing;

pub use cipher::{
    platform_public_key_der, rc4_42, AesCbcCipher, AesEcbCipher, CipherContext,
    PLATFORM_PUBLIC_KEY,
};
pub use credential::{Account, Credential, WebCookie};
pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, FrameFlags, FrameHeader, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use signing::{append_signature, sign_params};
