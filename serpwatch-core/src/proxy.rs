use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported proxy scheme: {0}")]
    UnsupportedScheme(String),
    #[error("proxy url has no host")]
    MissingHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

/// One egress route handed to the scrape executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Proxy {
    Direct,
    Remote {
        scheme: ProxyScheme,
        host: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip)]
        password: Option<String>,
    },
}

impl Proxy {
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("direct"),
            Proxy::Remote {
                scheme, host, port, ..
            } => write!(f, "{}://{host}:{port}", scheme.as_str()),
        }
    }
}

impl std::str::FromStr for Proxy {
    type Err = ProxyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("direct") {
            return Ok(Proxy::Direct);
        }
        let parsed = url::Url::parse(value)?;
        let scheme = match parsed.scheme() {
            "http" => ProxyScheme::Http,
            "https" => ProxyScheme::Https,
            "socks5" | "socks" => ProxyScheme::Socks5,
            other => return Err(ProxyError::UnsupportedScheme(other.to_string())),
        };
        let host = parsed.host_str().ok_or(ProxyError::MissingHost)?.to_string();
        let port = parsed.port_or_known_default().unwrap_or(match scheme {
            ProxyScheme::Socks5 => 1080,
            ProxyScheme::Http | ProxyScheme::Https => 8080,
        });
        let username = Some(parsed.username())
            .filter(|user| !user.is_empty())
            .map(str::to_string);
        Ok(Proxy::Remote {
            scheme,
            host,
            port,
            username,
            password: parsed.password().map(str::to_string),
        })
    }
}

/// Run-scoped pool of alive proxies.
///
/// Hands out the least recently used entry and forgets evicted ones for the
/// rest of the run.
pub struct ProxyRotator {
    alive: Mutex<VecDeque<Proxy>>,
    configured: usize,
}

impl ProxyRotator {
    /// Builds the pool, substituting a direct connection when `proxies` is empty.
    pub fn new(proxies: Vec<Proxy>) -> Self {
        let mut proxies = proxies;
        if proxies.is_empty() {
            warn!("no proxy configured, using direct connection");
            proxies.push(Proxy::Direct);
        }
        let configured = proxies.len();
        Self {
            alive: Mutex::new(proxies.into()),
            configured,
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Proxy>> {
        self.alive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next(&self) -> Option<Proxy> {
        let mut alive = self.entries();
        let proxy = alive.pop_front()?;
        alive.push_back(proxy.clone());
        Some(proxy)
    }

    /// Removes `proxy` from rotation. Returns `false` when it was already gone.
    pub fn evict(&self, proxy: &Proxy) -> bool {
        let mut alive = self.entries();
        let before = alive.len();
        alive.retain(|candidate| candidate != proxy);
        let removed = alive.len() < before;
        if removed {
            info!(proxy = %proxy, remaining = alive.len(), "proxy evicted from rotation");
        }
        removed
    }

    pub fn alive(&self) -> usize {
        self.entries().len()
    }

    pub fn configured(&self) -> usize {
        self.configured
    }

    pub fn evicted(&self) -> usize {
        self.configured - self.alive()
    }
}

impl fmt::Debug for ProxyRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRotator")
            .field("alive", &self.alive())
            .field("configured", &self.configured)
            .finish()
    }
}
