// src/attachments/signing.rs
// HMAC-signed download URLs with an embedded expiry

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

pub struct UrlSigner {
    key: Vec<u8>,
}

impl UrlSigner {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    fn mac(&self) -> CoreResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CoreError::internal(format!("HMAC key rejected: {e}")))
    }

    /// Relative download URL carrying the expiry and signature; the
    /// transport prefixes its public base.
    pub fn sign(&self, storage_key: &str, ttl: Duration) -> CoreResult<String> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let mut mac = self.mac()?;
        mac.update(format!("{storage_key}:{expires}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!(
            "/attachments/{storage_key}?expires={expires}&sig={signature}"
        ))
    }

    /// Constant-time signature check plus expiry.
    pub fn verify(&self, storage_key: &str, expires: i64, signature_hex: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(format!("{storage_key}:{expires}").as_bytes());
        mac.verify_slice(&signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_url_verifies() {
        let signer = UrlSigner::new(b"signing-key");
        let url = signer.sign("aabbccdd", Duration::from_secs(60)).unwrap();

        let expires: i64 = url
            .split("expires=")
            .nth(1)
            .and_then(|s| s.split('&').next())
            .and_then(|s| s.parse().ok())
            .unwrap();
        let signature = url.split("sig=").nth(1).unwrap();

        assert!(signer.verify("aabbccdd", expires, signature));
        assert!(!signer.verify("other-key", expires, signature));
        assert!(!signer.verify("aabbccdd", expires - 120, signature));
    }

    #[test]
    fn expired_url_is_rejected() {
        let signer = UrlSigner::new(b"signing-key");
        let mut mac = HmacSha256::new_from_slice(b"signing-key").unwrap();
        let expires = Utc::now().timestamp() - 10;
        mac.update(format!("key:{expires}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        assert!(!signer.verify("key", expires, &signature));
    }
}
