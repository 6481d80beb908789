pub mod aggregator;
pub mod captcha;
pub mod config;
pub mod error;
pub mod model;
pub mod proxy;
pub mod queue;
pub mod scrape;
mod sqlite;
pub mod store;
pub mod summary;
pub mod task;

pub use aggregator::{ResultAggregator, RunContext};
pub use captcha::{
    CaptchaChallenge, CaptchaError, CaptchaGate, CaptchaGuard, CaptchaSolution, CaptchaSolver,
};
pub use config::{
    load_config, HttpSection, PathsSection, ProxySection, SerpwatchConfig, TaskSection,
};
pub use error::{ConfigError, Result};
pub use model::{
    BestRank, GroupId, PatternError, Rank, RankRecord, Run, RunId, RunStatus, Search, SearchId,
    SerpEntry, SerpSnapshot, Target, TargetId, TargetPattern, HISTORY_DAYS,
};
pub use proxy::{Proxy, ProxyError, ProxyRotator, ProxyScheme};
pub use queue::WorkQueue;
pub use scrape::{HttpSettings, ScrapeError, ScrapeExecutor, ScrapeResult};
pub use store::{RankStore, SqliteRankStore, SqliteRankStoreBuilder, StoreError, StoreResult};
pub use summary::{SummaryAccumulator, TargetSummary, TOP_SIZE};
pub use task::{RunController, RunReport, TaskError, TaskMode, TaskOptions, TaskResult};
