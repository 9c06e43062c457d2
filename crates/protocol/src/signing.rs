//! Request signature for the mobile API channels.
//!
//! The signature is the lowercase hex MD5 of every `key=value` pair
//! concatenated without separators, followed by a fixed salt. Parameters are
//! sorted by key first, so the caller's ordering never affects the result.

/// Salt appended to the canonical parameter string.
pub const SIGN_SALT: &str = "tiebaclient!!!";

/// Name of the parameter carrying the signature.
pub const SIGN_KEY: &str = "sign";

/// Sort parameters by key. The sort is stable, so repeated keys keep their
/// relative order.
pub fn canonicalize<K, V>(params: &mut [(K, V)])
where
    K: AsRef<str>,
{
    params.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));
}

/// Compute the signature of already-canonical parameters.
pub fn signature<K, V>(params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut context = md5::Context::new();
    for (key, value) in params {
        context.consume(key.as_ref().as_bytes());
        context.consume(b"=");
        context.consume(value.as_ref().as_bytes());
    }
    context.consume(SIGN_SALT.as_bytes());
    format!("{:x}", context.compute())
}

/// Canonicalize `params` and return the signature.
pub fn sign_params(params: &mut Vec<(String, String)>) -> String {
    canonicalize(params);
    signature(params)
}

/// Canonicalize `params` and append the `sign` pair.
pub fn append_signature(params: &mut Vec<(String, String)>) {
    let sign = sign_params(params);
    params.push((SIGN_KEY.to_string(), sign));
}
