//! Bitfinex authentication payload signing
//!
//! The auth frame carries `authPayload = prefix + nonce` (nonce in
//! microseconds) and `authSig`, the hex HMAC-SHA384 of that payload keyed by
//! the API secret. Signing sits behind [`PayloadSigner`] so tests and
//! hardware-backed keys can substitute their own implementation.

use crate::errors::{ExchangeError, Result};
use bfxlink_core::PerfTimer;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha384;
use std::fmt;
use tracing::debug;

type HmacSha384 = Hmac<Sha384>;

pub const API_KEY_VAR: &str = "BFX_API_KEY";
pub const API_SECRET_VAR: &str = "BFX_API_SECRET";

/// Bitfinex API credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Load credentials from `BFX_API_KEY` / `BFX_API_SECRET`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| ExchangeError::MissingCredentials(API_KEY_VAR.to_string()))?;
        let api_secret = std::env::var(API_SECRET_VAR)
            .map_err(|_| ExchangeError::MissingCredentials(API_SECRET_VAR.to_string()))?;

        Ok(Self::new(api_key, api_secret))
    }

    /// Check if credentials are valid (non-empty)
    pub fn is_valid(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// `sign(payload, secret) -> hex digest`
pub trait PayloadSigner {
    fn sign(&self, payload: &str, secret: &str) -> Result<String>;
}

/// Default signer: hex HMAC-SHA384
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSha384Signer;

impl PayloadSigner for HmacSha384Signer {
    fn sign(&self, payload: &str, secret: &str) -> Result<String> {
        let mut mac = HmacSha384::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::SigningError(format!("HMAC setup failed: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Outbound `auth` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthRequest {
    pub event: &'static str,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "authSig")]
    pub auth_sig: String,
    #[serde(rename = "authNonce")]
    pub auth_nonce: u64,
    #[serde(rename = "authPayload")]
    pub auth_payload: String,
}

impl AuthRequest {
    pub fn build(
        credentials: &Credentials,
        prefix: &str,
        nonce: u64,
        signer: &dyn PayloadSigner,
    ) -> Result<Self> {
        if !credentials.is_valid() {
            return Err(ExchangeError::MissingCredentials(
                "api key and secret must be non-empty".to_string(),
            ));
        }

        let _timer = PerfTimer::start("bitfinex_sign_auth");
        let auth_payload = format!("{prefix}{nonce}");
        let auth_sig = signer.sign(&auth_payload, &credentials.api_secret)?;
        debug!("🔐 Signed auth payload with nonce {}", nonce);

        Ok(Self {
            event: "auth",
            api_key: credentials.api_key.clone(),
            auth_sig,
            auth_nonce: nonce,
            auth_payload,
        })
    }
}
