//! Frame codec for the push channel's binary frames.
//!
//! # Frame Format
//!
//! Each websocket binary message carries exactly one frame:
//! - 1 byte: flags (bit 7 = encrypted, bit 6 = compressed, bit 3 always set)
//! - 4 bytes: command id (big-endian)
//! - 4 bytes: correlation id (big-endian)
//! - N bytes: payload
//!
//! # Transforms
//!
//! On encode the payload is gzip-compressed first and then AES-encrypted;
//! decode undoes them in the opposite order. The flags byte records which
//! transforms were applied so the receiver never has to guess.

use std::fmt;
use std::sync::Arc;

use crate::cipher::CipherContext;
use crate::compression;
use crate::error::{ProtocolError, Result};

/// Maximum frame size (4 MB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Frame header size: 1 (flags) + 4 (cmd) + 4 (correlation id) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Flags byte of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is AES encrypted.
    pub const ENCRYPTED: u8 = 0b1000_0000;

    /// Payload is gzip compressed.
    pub const COMPRESSED: u8 = 0b0100_0000;

    /// Bit present on every frame.
    pub const BASE: u8 = 0b0000_1000;

    /// Flags with only the base bit.
    #[inline]
    pub fn new() -> Self {
        Self(Self::BASE)
    }

    /// Create flags from a raw byte value. Reserved bits are kept as-is.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the encrypted flag is set.
    #[inline]
    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Check if the compressed flag is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a new flags with encrypted set or cleared.
    #[inline]
    pub fn with_encrypted(self, encrypted: bool) -> Self {
        self.with_bit(Self::ENCRYPTED, encrypted)
    }

    /// Return a new flags with compressed set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        self.with_bit(Self::COMPRESSED, compressed)
    }

    #[inline]
    fn with_bit(self, bit: u8, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded frame. The payload is always in plain form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Flags as they appeared on the wire.
    pub flags: FrameFlags,
    /// Command id selecting the handler or endpoint.
    pub cmd: u32,
    /// Matches a response to its request.
    pub correlation_id: u32,
    /// Decrypted and decompressed payload.
    pub payload: Vec<u8>,
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame flags.
    pub flags: FrameFlags,
    /// Command id.
    pub cmd: u32,
    /// Correlation id.
    pub correlation_id: u32,
}

impl FrameHeader {
    /// Parse the first [`FRAME_HEADER_SIZE`] bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                need: FRAME_HEADER_SIZE,
                have: data.len(),
            });
        }
        let cmd = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let correlation_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        Ok(Self {
            flags: FrameFlags::from_byte(data[0]),
            cmd,
            correlation_id,
        })
    }

    /// Serialize into `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.flags.as_byte());
        out.extend_from_slice(&self.cmd.to_be_bytes());
        out.extend_from_slice(&self.correlation_id.to_be_bytes());
    }
}

/// Encoder and decoder for frames.
///
/// The codec holds the frame cipher, if any. Without one it can still encode
/// and decode frames whose encrypted bit is clear.
#[derive(Clone, Default)]
pub struct FrameCodec {
    cipher: Option<Arc<dyn CipherContext>>,
}

impl FrameCodec {
    /// Create a codec with no cipher.
    pub fn new() -> Self {
        Self { cipher: None }
    }

    /// Create a codec that encrypts and decrypts with `cipher`.
    pub fn with_cipher(cipher: Arc<dyn CipherContext>) -> Self {
        Self {
            cipher: Some(cipher),
        }
    }

    /// Whether a cipher is attached.
    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    fn cipher(&self) -> Result<&dyn CipherContext> {
        self.cipher.as_deref().ok_or(ProtocolError::CipherUnavailable)
    }

    /// Encode a payload into a wire frame.
    pub fn encode(
        &self,
        payload: &[u8],
        cmd: u32,
        correlation_id: u32,
        compress: bool,
        encrypt: bool,
    ) -> Result<Vec<u8>> {
        let mut body = if compress {
            compression::compress(payload)?
        } else {
            payload.to_vec()
        };
        if encrypt {
            body = self.cipher()?.encrypt(&body)?;
        }

        let total_size = FRAME_HEADER_SIZE + body.len();
        if total_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total_size,
                max: MAX_FRAME_SIZE,
            });
        }

        let header = FrameHeader {
            flags: FrameFlags::new()
                .with_encrypted(encrypt)
                .with_compressed(compress),
            cmd,
            correlation_id,
        };
        let mut output = Vec::with_capacity(total_size);
        header.write_to(&mut output);
        output.extend_from_slice(&body);
        Ok(output)
    }

    /// Decode a complete wire frame.
    pub fn decode(&self, data: &[u8]) -> Result<Frame> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        let header = FrameHeader::parse(data)?;
        let body = &data[FRAME_HEADER_SIZE..];

        let decrypted;
        let body = if header.flags.is_encrypted() {
            decrypted = self.cipher()?.decrypt(body)?;
            decrypted.as_slice()
        } else {
            body
        };

        let payload = if header.flags.is_compressed() {
            compression::decompress(body)?
        } else {
            body.to_vec()
        };

        Ok(Frame {
            flags: header.flags,
            cmd: header.cmd,
            correlation_id: header.correlation_id,
            payload,
        })
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("has_cipher", &self.has_cipher())
            .finish()
    }
}
