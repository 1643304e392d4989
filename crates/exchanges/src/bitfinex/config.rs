//! Session configuration

use crate::bitfinex::auth::Credentials;
use crate::bitfinex::types::OrderDefaults;
use crate::errors::Result;

pub const DEFAULT_URL: &str = "wss://api.bitfinex.com/ws/2";
/// Orders per `ox_multi` frame accepted by the server
pub const MAX_BATCH_ORDERS: usize = 15;
pub const DEFAULT_AUTH_PREFIX: &str = "AUTH";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    /// Protocol versions accepted in the server's first info frame
    pub allowed_versions: Vec<u32>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub order_defaults: OrderDefaults,
    pub max_batch_size: usize,
    pub auth_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            allowed_versions: vec![2],
            api_key: None,
            api_secret: None,
            order_defaults: OrderDefaults::default(),
            max_batch_size: MAX_BATCH_ORDERS,
            auth_prefix: DEFAULT_AUTH_PREFIX.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_credentials(mut self, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self.api_secret = Some(api_secret.into());
        self
    }

    pub fn with_allowed_versions(mut self, versions: Vec<u32>) -> Self {
        self.allowed_versions = versions;
        self
    }

    pub fn with_order_defaults(mut self, defaults: OrderDefaults) -> Self {
        self.order_defaults = defaults;
        self
    }

    /// Read credentials from `BFX_API_KEY` / `BFX_API_SECRET`.
    pub fn with_env_credentials(self) -> Result<Self> {
        let credentials = Credentials::from_env()?;
        Ok(self.with_credentials(credentials.api_key, credentials.api_secret))
    }

    /// Configured credentials, if both halves are present
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.api_key, &self.api_secret) {
            (Some(key), Some(secret)) => Some(Credentials::new(key.clone(), secret.clone())),
            _ => None,
        }
    }
}
