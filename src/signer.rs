//! HMAC signatures keyed by named secrets.
//!
//! A signature is `<hex hmac-sha256>.<expiry>` where `expiry` is Unix seconds
//! (0 for never). The MAC covers the MessagePack encoding of
//! `(data, expiry)`, so the expiry cannot be altered without invalidating it.
//!
//! Hub push signatures follow the hub's own format instead:
//! `sha1=<hex hmac-sha1 of the raw body>`.

use crate::error::{FeedError, Result};
use crate::secrets::SecretCache;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Prefix of the `X-Hub-Signature` header value.
const HUB_SIGNATURE_PREFIX: &str = "sha1=";

/// Signs and verifies data with secrets from a shared cache.
#[derive(Clone)]
pub struct Signer {
    secrets: Arc<SecretCache>,
}

impl Signer {
    pub fn new(secrets: Arc<SecretCache>) -> Self {
        Self { secrets }
    }

    pub fn secrets(&self) -> &Arc<SecretCache> {
        &self.secrets
    }

    /// Sign `data` with the named secret, valid for `lifetime` (forever if
    /// `None`).
    pub fn sign(&self, secret_name: &str, data: &str, lifetime: Option<Duration>) -> Result<String> {
        let expiry = match lifetime {
            Some(lifetime) => Utc::now().timestamp() + lifetime.as_secs().max(1) as i64,
            None => 0,
        };
        self.sign_until(secret_name, data, expiry)
    }

    /// Sign `data` with an explicit expiry in Unix seconds (0 for never).
    pub fn sign_until(&self, secret_name: &str, data: &str, expiry: i64) -> Result<String> {
        let secret = self.secrets.get_or_create(secret_name)?;
        let mac = signing_mac(&secret, data, expiry)?;
        Ok(format!("{}.{}", hex::encode(mac.finalize().into_bytes()), expiry))
    }

    /// Whether `signature` is an unexpired signature of `data` by the named
    /// secret. Never fails: anything malformed is simply not authentic.
    pub fn verify(&self, secret_name: &str, data: &str, signature: &str) -> bool {
        let Some((mac_hex, expiry)) = signature.rsplit_once('.') else {
            return false;
        };
        let Ok(expiry) = expiry.parse::<i64>() else {
            return false;
        };
        if expiry < 0 || (expiry != 0 && Utc::now().timestamp() >= expiry) {
            return false;
        }
        let Ok(claimed) = hex::decode(mac_hex) else {
            return false;
        };

        let secret = match self.secrets.get(secret_name) {
            Ok(Some(secret)) => secret,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(secret = secret_name, error = %e, "secret unavailable for verification");
                return false;
            }
        };

        match signing_mac(&secret, data, expiry) {
            Ok(mac) => mac.verify_slice(&claimed).is_ok(),
            Err(_) => false,
        }
    }
}

fn signing_mac(secret: &[u8], data: &str, expiry: i64) -> Result<HmacSha256> {
    let message = rmp_serde::to_vec(&(data, expiry))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| FeedError::InvalidOperation(e.to_string()))?;
    mac.update(&message);
    Ok(mac)
}

/// `X-Hub-Signature` value for a push body.
pub fn hub_signature(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = hub_mac(secret)?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        HUB_SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Whether an `X-Hub-Signature` header authenticates `body`.
pub fn verify_hub_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(claimed) = header.trim().strip_prefix(HUB_SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(claimed) = hex::decode(claimed) else {
        return false;
    };
    let Ok(mut mac) = hub_mac(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&claimed).is_ok()
}

fn hub_mac(secret: &[u8]) -> Result<HmacSha1> {
    HmacSha1::new_from_slice(secret).map_err(|e| FeedError::InvalidOperation(e.to_string()))
}
