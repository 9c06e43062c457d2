//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every failure of the pure codec layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Frame errors
    /// Input is shorter than the fixed frame header.
    #[error("frame too short: need {need} bytes, have {have}")]
    FrameTooShort {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed, including bad padding.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// An encrypted frame was requested but no cipher is attached.
    #[error("no cipher available for encrypted frame")]
    CipherUnavailable,

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    // Compression errors
    /// Compressing a payload failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Payload was not valid gzip.
    #[error("decompression failed: {0}")]
    Decompression(String),

    // Credential errors
    /// Login token has the wrong shape.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rsa::pkcs8::spki::Error> for ProtocolError {
    fn from(err: rsa::pkcs8::spki::Error) -> Self {
        ProtocolError::InvalidPublicKey(err.to_string())
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        ProtocolError::Encryption(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_too_short_error_display() {
        let err = ProtocolError::FrameTooShort { need: 9, have: 4 };
        assert_eq!(err.to_string(), "frame too short: need 9 bytes, have 4");
    }

    #[test]
    fn test_frame_too_large_error_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_decryption_error_display() {
        let err = ProtocolError::Decryption("bad padding".to_string());
        assert_eq!(err.to_string(), "decryption failed: bad padding");
    }

    #[test]
    fn test_cipher_unavailable_error_display() {
        assert_eq!(
            ProtocolError::CipherUnavailable.to_string(),
            "no cipher available for encrypted frame"
        );
    }

    #[test]
    fn test_decompression_error_display() {
        let err = ProtocolError::Decompression("invalid gzip header".to_string());
        assert_eq!(err.to_string(), "decompression failed: invalid gzip header");
    }

    #[test]
    fn test_invalid_credential_error_display() {
        let err = ProtocolError::InvalidCredential("BDUSS must be 192 characters".to_string());
        assert_eq!(
            err.to_string(),
            "invalid credential: BDUSS must be 192 characters"
        );
    }

    #[test]
    fn test_from_spki_error() {
        use rsa::pkcs8::DecodePublicKey;
        let spki_err = rsa::RsaPublicKey::from_public_key_der(&[0x30, 0x00]).unwrap_err();
        let protocol_err: ProtocolError = spki_err.into();
        assert!(matches!(protocol_err, ProtocolError::InvalidPublicKey(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<()> {
            Ok(())
        }
        assert!(returns_result().is_ok());
    }
}
