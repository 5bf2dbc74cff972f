use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use openssl::{hash::MessageDigest, pkey::PKey, sign::Signer};
use serde_json::{json, Value};

use super::ExternalAccountBinding;
use crate::crypto::{b64, PrivateKey};

/// How the protected header names the signing key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum KeyId<'a> {
    /// Embed the public JWK (new-account and the inner key-change JWS).
    Jwk,
    /// Reference the account URL.
    Kid(&'a str),
}

/// Build a flattened JWS. `None` payload is an empty POST-as-GET body.
pub(crate) fn sign(
    key: &PrivateKey,
    key_id: KeyId<'_>,
    url: &str,
    nonce: Option<&str>,
    payload: Option<&Value>,
) -> Result<Value> {
    let mut protected = json!({
        "alg": key.jws_alg(),
        "url": url,
    });
    match key_id {
        KeyId::Jwk => protected["jwk"] = key.jwk()?,
        KeyId::Kid(kid) => protected["kid"] = Value::String(kid.to_string()),
    }
    if let Some(nonce) = nonce {
        protected["nonce"] = Value::String(nonce.to_string());
    }
    let protected = b64(protected.to_string());
    let payload = match payload {
        Some(payload) => b64(payload.to_string()),
        None => String::new(),
    };
    let signature = key.sign(format!("{protected}.{payload}").as_bytes())?;
    Ok(json!({
        "protected": protected,
        "payload": payload,
        "signature": b64(signature),
    }))
}

/// External account binding: the account JWK MACed with the CA-issued key.
pub(crate) fn external_account_binding(
    eab: &ExternalAccountBinding,
    account_key: &PrivateKey,
    new_account_url: &str,
) -> Result<Value> {
    let hmac_key = decode_hmac_key(&eab.hmac_key)?;
    let protected = b64(json!({
        "alg": "HS256",
        "kid": eab.key_id,
        "url": new_account_url,
    })
    .to_string());
    let payload = b64(account_key.jwk()?.to_string());
    let pkey = PKey::hmac(&hmac_key)?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)?;
    signer.update(format!("{protected}.{payload}").as_bytes())?;
    Ok(json!({
        "protected": protected,
        "payload": payload,
        "signature": b64(signer.sign_to_vec()?),
    }))
}

fn decode_hmac_key(key: &str) -> Result<Vec<u8>> {
    let key = key.trim();
    URL_SAFE_NO_PAD
        .decode(key.trim_end_matches('='))
        .or_else(|_| STANDARD.decode(key))
        .context("EAB HMAC key is not valid base64")
}

/// RFC 8555 §7.3.5 inner JWS, signed by the new key.
pub(crate) fn key_change_inner(
    old_key: &PrivateKey,
    new_key: &PrivateKey,
    account_url: &str,
    key_change_url: &str,
) -> Result<Value> {
    let payload = json!({
        "account": account_url,
        "oldKey": old_key.jwk()?,
    });
    sign(new_key, KeyId::Jwk, key_change_url, None, Some(&payload))
}

#[cfg(test)]
pub(crate) fn decode_part(part: &Value) -> Value {
    let bytes = URL_SAFE_NO_PAD
        .decode(part.as_str().unwrap_or_default())
        .unwrap();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}
