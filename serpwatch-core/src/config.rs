use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::proxy::Proxy;
use crate::scrape::HttpSettings;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SerpwatchConfig {
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub http: HttpSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub proxies: ProxySection,
}

impl SerpwatchConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_threads: default_max_threads(),
            shuffle: default_shuffle(),
            queue_poll_ms: default_queue_poll_ms(),
        }
    }
}

impl TaskSection {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl HttpSection {
    pub fn settings(&self) -> HttpSettings {
        HttpSettings {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub database: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub entries: Vec<String>,
}

impl ProxySection {
    /// Parses every non-blank entry, failing on the first malformed one.
    pub fn parse(&self) -> Result<Vec<Proxy>> {
        self.entries
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<Proxy>()
                    .map_err(|err| ConfigError::InvalidProxy {
                        entry: entry.to_string(),
                        reason: err.to_string(),
                    })
            })
            .collect()
    }
}

fn default_max_threads() -> usize {
    4
}

fn default_shuffle() -> bool {
    true
}

fn default_queue_poll_ms() -> u64 {
    1_000
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SerpwatchConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
