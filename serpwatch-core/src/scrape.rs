//! Boundary to the component that actually queries the search engine.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::captcha::CaptchaGate;
use crate::config::{DEFAULT_TIMEOUT_MS, DEFAULT_USER_AGENT};
use crate::model::Search;
use crate::proxy::Proxy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Ordered result URLs for one search, plus the captchas met on the way.
///
/// Captchas are counted per finished attempt: an attempt interrupted by
/// cancellation reports none, whatever it met before being dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeResult {
    pub urls: Vec<String>,
    pub captchas: u32,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("proxy {proxy} failed: {reason}")]
    Proxy { proxy: String, reason: String },
    #[error("captcha left unresolved after {captchas} challenge(s)")]
    Captcha { captchas: u32 },
    /// The attempt was dropped on cancellation; its captchas are lost.
    #[error("scrape interrupted")]
    Interrupted,
}

impl ScrapeError {
    pub fn captchas(&self) -> u32 {
        match self {
            ScrapeError::Captcha { captchas } => *captchas,
            _ => 0,
        }
    }

    /// Whether the proxy used for the attempt should leave the rotation.
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, ScrapeError::Proxy { .. })
    }
}

#[async_trait]
pub trait ScrapeExecutor: Send + Sync {
    async fn execute(
        &self,
        search: &Search,
        proxy: &Proxy,
        captcha: &CaptchaGate,
        http: &HttpSettings,
    ) -> Result<ScrapeResult, ScrapeError>;
}
