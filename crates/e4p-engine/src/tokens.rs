//! Signed, expiring download tokens
//!
//! Wire format: `base64url(claims JSON) "." base64url(HMAC-SHA256)`.
//! The token is authenticated, not encrypted — claims carry only the
//! opaque artifact id and the restore filename. Verification is
//! constant-time via `Mac::verify_slice`. Time is injected through the
//! `*_at` variants so expiry is testable without sleeping.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use e4p_core::error::{E4pError, E4pResult};

type HmacSha256 = Hmac<Sha256>;

/// Authenticated claims carried by a download token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Opaque artifact id (UUID), resolved via StorageLifecycle
    pub artifact: String,
    /// Filename offered to the downloader
    pub filename: String,
    /// Expiry, Unix seconds
    pub exp: u64,
    /// Issued-at, Unix seconds
    pub iat: u64,
    /// Expire on first successful redemption
    pub once: bool,
}

pub struct TokenService {
    secret: Vec<u8>,
    ttl_secs: u64,
    one_time: bool,
    /// Redeemed one-time tokens mapped to their expiry; entries past
    /// their expiry are pruned on redemption so the set stays bounded
    /// by the number of tokens live at once.
    redeemed: Mutex<HashMap<String, u64>>,
}

impl TokenService {
    pub fn new(secret: &str, ttl_secs: u64, one_time: bool) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_secs,
            one_time,
            redeemed: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token for `artifact` valid for the configured TTL.
    pub fn issue(&self, artifact: &str, filename: &str) -> E4pResult<String> {
        self.issue_at(artifact, filename, now_unix())
    }

    pub fn issue_at(&self, artifact: &str, filename: &str, now: u64) -> E4pResult<String> {
        let claims = TokenClaims {
            artifact: artifact.to_string(),
            filename: filename.to_string(),
            exp: now + self.ttl_secs,
            iat: now,
            once: self.one_time,
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| E4pError::Storage(format!("token claims: {e}")))?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();

        debug!(artifact, exp = claims.exp, once = claims.once, "issued download token");
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        ))
    }

    /// Verify signature and expiry. Does not consume one-time tokens.
    pub fn verify(&self, token: &str) -> E4pResult<TokenClaims> {
        self.verify_at(token, now_unix())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> E4pResult<TokenClaims> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(E4pError::TokenInvalid)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| E4pError::TokenInvalid)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| E4pError::TokenInvalid)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| E4pError::TokenInvalid)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| E4pError::TokenInvalid)?;
        if now >= claims.exp {
            return Err(E4pError::TokenExpired);
        }
        Ok(claims)
    }

    /// Verify and, for one-time tokens, consume: the second redemption of
    /// the same token fails with `TokenInvalid`.
    pub fn redeem(&self, token: &str) -> E4pResult<TokenClaims> {
        self.redeem_at(token, now_unix())
    }

    pub fn redeem_at(&self, token: &str, now: u64) -> E4pResult<TokenClaims> {
        let claims = self.verify_at(token, now)?;
        if claims.once {
            let mut redeemed = self
                .redeemed
                .lock()
                .map_err(|_| E4pError::TokenInvalid)?;
            // Expired entries can never be replayed (verify_at rejects
            // them first), so dropping them here keeps the set bounded.
            redeemed.retain(|_, exp| *exp > now);
            if redeemed.contains_key(token) {
                return Err(E4pError::TokenInvalid);
            }
            redeemed.insert(token.to_string(), claims.exp);
        }
        Ok(claims)
    }

    fn mac(&self) -> E4pResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| E4pError::InvalidParameters("empty signing secret".into()))
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
