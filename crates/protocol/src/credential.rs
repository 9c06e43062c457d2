//! Account credentials and the per-device key material derived from them.
//!
//! A [`Credential`] is everything the transport needs from a logged-in (or
//! anonymous) user: the frame cipher, the request signature, login tokens for
//! cookies and form fields, and the sealed session secret for the websocket
//! handshake. [`Account`] is the concrete implementation.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

use crate::cipher::{
    rc4_42, seal_secret, AesCbcCipher, AesEcbCipher, CipherContext, CBC_KEY_LEN, WS_SECRET_LEN,
};
use crate::error::{ProtocolError, Result};
use crate::signing::append_signature;

/// Required length of a BDUSS token.
pub const BDUSS_LEN: usize = 192;

/// Required length of a STOKEN token.
pub const STOKEN_LEN: usize = 64;

/// Prefix of the client user id.
pub const CUID_PREFIX: &str = "baidutiebaapp";

/// Cookie attached to desktop-web requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebCookie {
    /// Registrable domain the cookie is scoped to.
    pub domain: &'static str,
    /// Cookie name.
    pub name: &'static str,
    /// Cookie value.
    pub value: String,
}

impl WebCookie {
    /// Whether this cookie should be sent to `host`.
    pub fn matches_host(&self, host: &str) -> bool {
        host == self.domain
            || host
                .strip_suffix(self.domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

/// Capabilities the transport needs from an account.
pub trait Credential: CipherContext {
    /// The BDUSS login token, if logged in.
    fn bduss(&self) -> Option<&str>;

    /// The STOKEN web token, if known.
    fn stoken(&self) -> Option<&str>;

    /// Client user id sent with app requests and the handshake.
    fn cuid(&self) -> &str;

    /// Seal the websocket session secret with the server's RSA key.
    fn sealed_secret(&self, public_key_der: &[u8]) -> Result<Vec<u8>>;

    /// Canonicalize `params` and append the request signature.
    fn sign(&self, params: &mut Vec<(String, String)>) {
        append_signature(params);
    }

    /// Cookies for desktop-web requests.
    fn cookies(&self) -> Vec<WebCookie> {
        let mut cookies = Vec::with_capacity(2);
        if let Some(bduss) = self.bduss() {
            cookies.push(WebCookie {
                domain: "baidu.com",
                name: "BDUSS",
                value: bduss.to_string(),
            });
        }
        if let Some(stoken) = self.stoken() {
            cookies.push(WebCookie {
                domain: "tieba.baidu.com",
                name: "STOKEN",
                value: stoken.to_string(),
            });
        }
        cookies
    }
}

/// Shared credentials can stand in wherever a frame cipher is needed.
impl<C: Credential + ?Sized> CipherContext for Arc<C> {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).encrypt(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        (**self).decrypt(data)
    }
}

/// A user account with freshly generated device identity and session keys.
#[derive(Clone)]
pub struct Account {
    bduss: String,
    stoken: String,
    android_id: String,
    uuid: String,
    cuid: String,
    ws_secret: [u8; WS_SECRET_LEN],
    cbc_key: [u8; CBC_KEY_LEN],
    ws_cipher: AesEcbCipher,
}

impl Account {
    /// Create an account from login tokens. Either may be empty.
    ///
    /// Non-empty tokens must have the platform's fixed lengths.
    pub fn new(bduss: impl Into<String>, stoken: impl Into<String>) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let android_id = hex::encode(rng.gen::<[u8; 8]>());
        let uuid = uuid::Uuid::new_v4().to_string();
        Self::with_device(bduss, stoken, android_id, uuid)
    }

    /// Create an account that is not logged in.
    pub fn anonymous() -> Self {
        let mut rng = rand::thread_rng();
        let android_id = hex::encode(rng.gen::<[u8; 8]>());
        let uuid = uuid::Uuid::new_v4().to_string();
        Self::build(String::new(), String::new(), android_id, uuid)
    }

    /// Create an account with a fixed device identity.
    pub fn with_device(
        bduss: impl Into<String>,
        stoken: impl Into<String>,
        android_id: impl Into<String>,
        uuid: impl Into<String>,
    ) -> Result<Self> {
        let bduss = bduss.into();
        let stoken = stoken.into();
        if !bduss.is_empty() && bduss.len() != BDUSS_LEN {
            return Err(ProtocolError::InvalidCredential(format!(
                "BDUSS must be {BDUSS_LEN} characters, got {}",
                bduss.len()
            )));
        }
        if !stoken.is_empty() && stoken.len() != STOKEN_LEN {
            return Err(ProtocolError::InvalidCredential(format!(
                "STOKEN must be {STOKEN_LEN} characters, got {}",
                stoken.len()
            )));
        }
        Ok(Self::build(bduss, stoken, android_id.into(), uuid.into()))
    }

    fn build(bduss: String, stoken: String, android_id: String, uuid: String) -> Self {
        let mut rng = rand::thread_rng();
        let mut ws_secret = [0u8; WS_SECRET_LEN];
        rng.fill(&mut ws_secret);
        let mut cbc_key = [0u8; CBC_KEY_LEN];
        rng.fill(&mut cbc_key);

        Self {
            bduss,
            stoken,
            cuid: format!("{CUID_PREFIX}{uuid}"),
            android_id,
            uuid,
            ws_cipher: AesEcbCipher::from_secret(&ws_secret),
            ws_secret,
            cbc_key,
        }
    }

    /// Replace the websocket session secret.
    pub fn with_ws_secret(mut self, secret: [u8; WS_SECRET_LEN]) -> Self {
        self.ws_cipher = AesEcbCipher::from_secret(&secret);
        self.ws_secret = secret;
        self
    }

    /// Random hex android id.
    pub fn android_id(&self) -> &str {
        &self.android_id
    }

    /// Device uuid.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Raw websocket session secret.
    pub fn ws_secret(&self) -> &[u8] {
        &self.ws_secret
    }

    /// Device identifier derived from android id and uuid.
    pub fn xyus(&self) -> String {
        let digest = md5::compute(format!("{}{}", self.android_id, self.uuid));
        format!("{:X}|0", digest)
    }

    /// Lowercase hex MD5 of [`Account::xyus`], the RC4 key for the CBC key.
    pub fn xyus_md5(&self) -> String {
        format!("{:x}", md5::compute(self.xyus()))
    }

    /// AES-CBC cipher for device registration payloads.
    pub fn cbc_cipher(&self) -> AesCbcCipher {
        AesCbcCipher::new(&self.cbc_key)
    }

    /// CBC key wrapped with [`rc4_42`] under [`Account::xyus_md5`].
    pub fn wrapped_cbc_key(&self) -> Vec<u8> {
        rc4_42(self.xyus_md5().as_bytes(), &self.cbc_key)
    }
}

impl CipherContext for Account {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.ws_cipher.encrypt(data)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.ws_cipher.decrypt(data)
    }
}

impl Credential for Account {
    fn bduss(&self) -> Option<&str> {
        (!self.bduss.is_empty()).then_some(self.bduss.as_str())
    }

    fn stoken(&self) -> Option<&str> {
        (!self.stoken.is_empty()).then_some(self.stoken.as_str())
    }

    fn cuid(&self) -> &str {
        &self.cuid
    }

    fn sealed_secret(&self, public_key_der: &[u8]) -> Result<Vec<u8>> {
        seal_secret(public_key_der, &self.ws_secret)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("logged_in", &!self.bduss.is_empty())
            .field("cuid", &self.cuid)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesEcbCipher;

    const ANDROID_ID: &str = "91be894d01799c49";
    const UUID: &str = "e4200716-58a8-4170-af15-ea7edeb8e513";

    fn fixed() -> Account {
        Account::with_device("", "", ANDROID_ID, UUID).unwrap()
    }

    #[test]
    fn test_xyus_vector() {
        let account = fixed();
        assert_eq!(account.xyus(), "B5D2DDFC5EDA7BCC19EB09172CAC1A1A|0");
        assert_eq!(account.xyus_md5(), "7454453f6590a9bd55d197317b12982a");
    }

    #[test]
    fn test_cuid_has_prefix() {
        assert_eq!(fixed().cuid(), format!("baidutiebaapp{UUID}"));
    }

    #[test]
    fn test_new_generates_device_identity() {
        let account = Account::new("", "").unwrap();
        assert_eq!(account.android_id().len(), 16);
        assert!(uuid::Uuid::parse_str(account.uuid()).is_ok());
        assert!(account.cuid().starts_with(CUID_PREFIX));
    }

    #[test]
    fn test_token_length_validation() {
        assert!(matches!(
            Account::new("short", ""),
            Err(ProtocolError::InvalidCredential(_))
        ));
        assert!(matches!(
            Account::new("", "short"),
            Err(ProtocolError::InvalidCredential(_))
        ));
        let account = Account::new("b".repeat(BDUSS_LEN), "s".repeat(STOKEN_LEN)).unwrap();
        assert_eq!(account.bduss().map(str::len), Some(BDUSS_LEN));
    }

    #[test]
    fn test_anonymous_has_no_tokens_or_cookies() {
        let account = Account::anonymous();
        assert!(account.bduss().is_none());
        assert!(account.stoken().is_none());
        assert!(account.cookies().is_empty());
    }

    #[test]
    fn test_cookies_are_scoped() {
        let account = Account::new("b".repeat(BDUSS_LEN), "s".repeat(STOKEN_LEN)).unwrap();
        let cookies = account.cookies();
        assert_eq!(cookies.len(), 2);

        let bduss = &cookies[0];
        assert!(bduss.matches_host("tieba.baidu.com"));
        assert!(bduss.matches_host("baidu.com"));
        assert!(!bduss.matches_host("notbaidu.com"));

        let stoken = &cookies[1];
        assert!(stoken.matches_host("tieba.baidu.com"));
        assert!(!stoken.matches_host("baidu.com"));
    }

    #[test]
    fn test_frame_cipher_matches_secret() {
        let account = fixed().with_ws_secret(std::array::from_fn(|i| i as u8));
        let peer = AesEcbCipher::from_secret(account.ws_secret());
        let encrypted = account.encrypt(b"hello").unwrap();
        assert_eq!(hex::encode(&encrypted), "814867248331ef21c34455d41c062f72");
        assert_eq!(peer.decrypt(&encrypted).unwrap(), b"hello");
    }

    #[test]
    fn test_shared_credential_as_cipher() {
        let shared: Arc<dyn Credential> = Arc::new(fixed());
        let cipher: Arc<dyn CipherContext> = Arc::new(shared.clone());
        let encrypted = cipher.encrypt(b"shared").unwrap();
        assert_eq!(shared.decrypt(&encrypted).unwrap(), b"shared");
    }

    #[test]
    fn test_wrapped_cbc_key_unwraps() {
        let account = fixed();
        let wrapped = account.wrapped_cbc_key();
        let unwrapped = rc4_42(account.xyus_md5().as_bytes(), &wrapped);
        let cipher = AesCbcCipher::new(&unwrapped.try_into().unwrap());
        let encrypted = account.cbc_cipher().encrypt(b"device").unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"device");
    }

    #[test]
    fn test_sign_appends_signature() {
        let mut params = vec![("kw".to_string(), "rust".to_string())];
        fixed().sign(&mut params);
        assert_eq!(params.last().map(|p| p.0.as_str()), Some("sign"));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let account = Account::new("b".repeat(BDUSS_LEN), "").unwrap();
        let debug = format!("{:?}", account);
        assert!(!debug.contains("bbbb"));
        assert!(debug.contains("[REDACTED]"));
    }
}
