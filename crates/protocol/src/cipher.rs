//! Symmetric and asymmetric primitives dictated by the platform wire format.
//!
//! The algorithms here are fixed by the server: AES-256-ECB for websocket
//! frames, AES-128-CBC with a zero IV for device registration payloads, a
//! modified RC4 keystream for wrapping the CBC key, and RSA PKCS#1 v1.5 for
//! delivering the websocket secret during the application handshake.
//!
//! None of this is meant to be strong cryptography. It only has to match
//! the server bit for bit.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use base64::Engine;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha1::Sha1;

use crate::error::{ProtocolError, Result};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Salt for deriving the websocket key from the session secret.
pub const WS_KEY_SALT: [u8; 8] = [0xa4, 0x0b, 0xc8, 0x34, 0xd6, 0x95, 0xf3, 0x13];

/// PBKDF2 iteration count for the websocket key.
pub const WS_KEY_ITERATIONS: u32 = 5;

/// Length of the random websocket session secret.
pub const WS_SECRET_LEN: usize = 31;

/// Length of the random CBC key.
pub const CBC_KEY_LEN: usize = 16;

/// Platform RSA public key (SubjectPublicKeyInfo, base64 DER) used to seal
/// the websocket session secret.
pub const PLATFORM_PUBLIC_KEY: &str = "MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAwQpwBZxXJV/JVRF/uNfyMSdu7YWwRNLM8+2xbniGp2iIQHOikPpTYQjlQgMi1uvq1kZpJ32rHo3hkwjy2l0lFwr3u4Hk2Wk7vnsqYQjAlYlK0TCzjpmiI+OiPOUNVtbWHQiLiVqFtzvpvi4AU7C1iKGvc/4IS45WjHxeScHhnZZ7njS4S1UgNP/GflRIbzgbBhyZ9kEW5/OO5YfG1fy6r4KSlDJw4o/mw5XhftyIpL+5ZBVBC6E1EIiP/dd9AbK62VV1PByfPMHMixpxI3GM2qwcmFsXcCcgvUXJBa9k6zP8dDQ3csCM2QNT+CQAOxthjtp/TFWaD7MzOdsIYb3THwIDAQAB";

/// Encrypts and decrypts frame payloads.
///
/// Implemented by the websocket cipher and by any credential that owns one,
/// so the frame codec can stay ignorant of where the key came from.
pub trait CipherContext: Send + Sync {
    /// Pad and encrypt `data`.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `data` and strip padding.
    ///
    /// Input that is not a whole number of blocks, or whose padding is
    /// malformed, is an error rather than a truncated result.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Derive the 32-byte websocket key from the session secret.
pub fn derive_ws_key(secret: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha1>(secret, &WS_KEY_SALT, WS_KEY_ITERATIONS, &mut key);
    key
}

/// Append PKCS#7 padding up to the next block boundary.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS#7 padding, validating every pad byte.
pub fn pkcs7_unpad(data: &[u8]) -> Result<&[u8]> {
    let Some(&last) = data.last() else {
        return Err(ProtocolError::Decryption("empty ciphertext".to_string()));
    };
    let pad = last as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(ProtocolError::Decryption(format!(
            "bad padding length {pad}"
        )));
    }
    let (body, tail) = data.split_at(data.len() - pad);
    if tail.iter().any(|&b| b != last) {
        return Err(ProtocolError::Decryption("bad padding bytes".to_string()));
    }
    Ok(body)
}

fn check_block_aligned(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
            data.len()
        )));
    }
    Ok(())
}

/// AES-256-ECB with PKCS#7 padding, the websocket frame cipher.
#[derive(Clone)]
pub struct AesEcbCipher {
    cipher: Aes256,
}

impl AesEcbCipher {
    /// Build from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    /// Build from the session secret via PBKDF2.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self::new(&derive_ws_key(secret))
    }
}

impl CipherContext for AesEcbCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = pkcs7_pad(data);
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        check_block_aligned(data)?;
        let mut buf = data.to_vec();
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        let len = pkcs7_unpad(&buf)?.len();
        buf.truncate(len);
        Ok(buf)
    }
}

impl fmt::Debug for AesEcbCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesEcbCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// AES-128-CBC with an all-zero IV and PKCS#7 padding.
#[derive(Clone)]
pub struct AesCbcCipher {
    cipher: Aes128,
}

impl AesCbcCipher {
    /// Build from a raw 16-byte key.
    pub fn new(key: &[u8; CBC_KEY_LEN]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }
}

impl CipherContext for AesCbcCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buf = pkcs7_pad(data);
        let mut prev = [0u8; BLOCK_SIZE];
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            for (b, p) in chunk.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(chunk));
            prev.copy_from_slice(chunk);
        }
        Ok(buf)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        check_block_aligned(data)?;
        let mut buf = data.to_vec();
        let mut prev = [0u8; BLOCK_SIZE];
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            let mut saved = [0u8; BLOCK_SIZE];
            saved.copy_from_slice(chunk);
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(chunk));
            for (b, p) in chunk.iter_mut().zip(prev.iter()) {
                *b ^= p;
            }
            prev = saved;
        }
        let len = pkcs7_unpad(&buf)?.len();
        buf.truncate(len);
        Ok(buf)
    }
}

impl fmt::Debug for AesCbcCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCbcCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// RC4 keystream with every output byte additionally XORed with 42.
///
/// Used to wrap the CBC key with the device's xyus digest. Symmetric: applying
/// it twice with the same key yields the input.
pub fn rc4_42(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut state: [u8; 256] = std::array::from_fn(|i| i as u8);
    if !key.is_empty() {
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
    }

    let (mut x, mut y) = (0u8, 0u8);
    data.iter()
        .map(|&byte| {
            x = x.wrapping_add(1);
            let a = state[x as usize];
            y = y.wrapping_add(a);
            let b = state[y as usize];
            state[x as usize] = b;
            state[y as usize] = a;
            byte ^ state[a.wrapping_add(b) as usize] ^ 42
        })
        .collect()
}

/// Decode [`PLATFORM_PUBLIC_KEY`] to DER.
pub fn platform_public_key_der() -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(PLATFORM_PUBLIC_KEY)
        .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
}

/// RSA PKCS#1 v1.5 encrypt `secret` for the holder of `public_key_der`.
pub fn seal_secret(public_key_der: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
    let key = RsaPublicKey::from_public_key_der(public_key_der)?;
    let mut rng = rand::thread_rng();
    Ok(key.encrypt(&mut rng, Pkcs1v15Encrypt, secret)?)
}
