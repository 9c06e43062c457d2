//! One-shot request construction for the HTTP transport.
//!
//! Three channels, each with its own header set and payload conventions:
//!
//! | Channel      | Payload          | Signed | Cookies |
//! |--------------|------------------|--------|---------|
//! | `MobileApp`  | multipart binary | no     | no      |
//! | `MobileWeb`  | url-encoded form | yes    | no      |
//! | `DesktopWeb` | form or query    | no     | yes     |
//!
//! Building a request performs no I/O. The result is an immutable
//! [`SignedRequest`] that [`super::http::HttpExecutor`] sends.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use protocol::Credential;
use rand::Rng;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use url::Url;

use crate::error::{ClientError, Result};

/// Fixed prefix of the multipart boundary.
pub const BOUNDARY_PREFIX: &str = "*-672328094--";

/// Header marking a protobuf request body.
pub const DATA_TYPE_HEADER: &str = "x_bd_data_type";

/// Request style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Mobile app with a protobuf body.
    MobileApp,
    /// Mobile app with a signed form body.
    MobileWeb,
    /// Desktop website, authenticated by cookies.
    DesktopWeb,
}

/// Request body or query shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `application/x-www-form-urlencoded` body.
    Form(Vec<(String, String)>),
    /// Single binary part in a multipart body.
    Binary(Vec<u8>),
    /// Query string of a GET request.
    Query(Vec<(String, String)>),
}

impl Payload {
    fn shape(&self) -> &'static str {
        match self {
            Payload::Form(_) => "form",
            Payload::Binary(_) => "binary",
            Payload::Query(_) => "query",
        }
    }
}

/// A fully built request, ready to execute.
#[derive(Clone)]
pub struct SignedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

impl SignedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Split into parts for the executor.
    pub fn into_parts(self) -> (Method, Url, HeaderMap, Bytes) {
        (self.method, self.url, self.headers, self.body)
    }
}

impl fmt::Debug for SignedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Builds [`SignedRequest`]s for one credential.
#[derive(Clone)]
pub struct RequestBuilder {
    credential: Arc<dyn Credential>,
    user_agent: String,
}

impl RequestBuilder {
    pub fn new(credential: Arc<dyn Credential>) -> Self {
        Self {
            credential,
            user_agent: format!("tieba-wire/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Override the `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build a request for `channel`.
    ///
    /// Form payloads on the mobile channels are sorted and signed. A payload
    /// shape the channel does not accept is a [`ClientError::Signing`] error.
    pub fn build_request(&self, channel: Channel, url: &str, payload: Payload) -> Result<SignedRequest> {
        let url = Url::parse(url)
            .map_err(|e| ClientError::Signing(format!("invalid url {url}: {e}")))?;

        let request = match (channel, payload) {
            (Channel::MobileApp, Payload::Binary(data)) => self.app_proto_request(url, data),
            (Channel::MobileWeb, Payload::Form(mut params)) => {
                self.credential.sign(&mut params);
                let body = encode_form(&params)?;
                let mut headers = self.app_headers(&url)?;
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
                Ok(SignedRequest {
                    method: Method::POST,
                    url,
                    headers,
                    body: Bytes::from(body),
                })
            }
            (Channel::DesktopWeb, Payload::Form(params)) => {
                let body = encode_form(&params)?;
                let mut headers = self.web_headers(&url)?;
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
                Ok(SignedRequest {
                    method: Method::POST,
                    url,
                    headers,
                    body: Bytes::from(body),
                })
            }
            (Channel::DesktopWeb, Payload::Query(params)) => {
                let mut url = url;
                if !params.is_empty() {
                    url.query_pairs_mut().extend_pairs(params.iter());
                }
                let headers = self.web_headers(&url)?;
                Ok(SignedRequest {
                    method: Method::GET,
                    url,
                    headers,
                    body: Bytes::new(),
                })
            }
            (channel, payload) => Err(ClientError::Signing(format!(
                "{channel:?} does not accept a {} payload",
                payload.shape()
            ))),
        }?;

        tracing::trace!(
            channel = ?channel,
            method = %request.method,
            url = %request.url,
            "Built request"
        );
        Ok(request)
    }

    /// Build a request that requires a logged-in credential.
    ///
    /// Mobile form payloads get the `BDUSS` parameter before signing.
    pub fn build_authed_request(
        &self,
        channel: Channel,
        url: &str,
        payload: Payload,
    ) -> Result<SignedRequest> {
        let bduss = self
            .credential
            .bduss()
            .ok_or_else(|| ClientError::Signing("request requires a BDUSS".to_string()))?;

        let payload = match (channel, payload) {
            (Channel::MobileWeb, Payload::Form(mut params)) => {
                params.insert(0, ("BDUSS".to_string(), bduss.to_string()));
                Payload::Form(params)
            }
            (_, payload) => payload,
        };
        self.build_request(channel, url, payload)
    }

    fn app_proto_request(&self, url: Url, data: Vec<u8>) -> Result<SignedRequest> {
        let boundary = format!("{BOUNDARY_PREFIX}{}", rand::thread_rng().gen_range(0..=9));
        let body = multipart_body(&boundary, &data);

        let mut headers = self.app_headers(&url)?;
        headers.insert(
            HeaderName::from_static(DATA_TYPE_HEADER),
            HeaderValue::from_static("protobuf"),
        );
        headers.insert(
            header::CONTENT_TYPE,
            header_value(&format!("multipart/form-data; boundary=\"{boundary}\""))?,
        );

        Ok(SignedRequest {
            method: Method::POST,
            url,
            headers,
            body: Bytes::from(body),
        })
    }

    fn common_headers(&self, url: &Url) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, header_value(&self.user_agent)?);
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Some(host) = url.host_str() {
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            headers.insert(header::HOST, header_value(&host)?);
        }
        Ok(headers)
    }

    fn app_headers(&self, url: &Url) -> Result<HeaderMap> {
        let mut headers = self.common_headers(url)?;
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        Ok(headers)
    }

    fn web_headers(&self, url: &Url) -> Result<HeaderMap> {
        let mut headers = self.common_headers(url)?;
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let host = url.host_str().unwrap_or_default();
        let cookie = self
            .credential
            .cookies()
            .into_iter()
            .filter(|cookie| cookie.matches_host(host))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        if !cookie.is_empty() {
            headers.insert(header::COOKIE, header_value(&cookie)?);
        }
        Ok(headers)
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ClientError::Signing(format!("invalid header value: {e}")))
}

fn encode_form(params: &[(String, String)]) -> Result<String> {
    serde_urlencoded::to_string(params).map_err(|e| ClientError::Signing(e.to_string()))
}

/// Multipart body with one `data` part and no part content type.
fn multipart_body(boundary: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 2 * boundary.len() + 96);
    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"\r\nContent-Disposition: form-data; name=\"data\"; filename=\"file\"\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"--\r\n");
    body
}
