use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RunId = i64;
pub type SearchId = i64;
pub type TargetId = i64;
pub type GroupId = i64;

/// Day offsets for which a snapshot entry records its former position.
pub const HISTORY_DAYS: [u16; 4] = [1, 7, 30, 90];

/// Position of a target in a result list.
///
/// `Unranked` sorts after every ranked position, so "better" is simply
/// "smaller".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<u16>", into = "Option<u16>")]
pub enum Rank {
    Ranked(u16),
    Unranked,
}

impl Rank {
    /// Value used for `Unranked` in storage columns.
    pub const UNRANKED_SENTINEL: i64 = 32_767;

    /// Builds a rank from a zero-based index into a result list.
    pub fn from_index(index: usize) -> Self {
        match u16::try_from(index + 1) {
            Ok(position) if i64::from(position) < Self::UNRANKED_SENTINEL => Rank::Ranked(position),
            _ => Rank::Unranked,
        }
    }

    pub fn position(self) -> Option<u16> {
        match self {
            Rank::Ranked(position) => Some(position),
            Rank::Unranked => None,
        }
    }

    pub fn is_ranked(self) -> bool {
        matches!(self, Rank::Ranked(_))
    }

    pub fn to_db(self) -> i64 {
        match self {
            Rank::Ranked(position) => i64::from(position),
            Rank::Unranked => Self::UNRANKED_SENTINEL,
        }
    }

    pub fn from_db(value: i64) -> Self {
        if value <= 0 || value >= Self::UNRANKED_SENTINEL {
            return Rank::Unranked;
        }
        u16::try_from(value).map_or(Rank::Unranked, Rank::Ranked)
    }
}

impl From<Option<u16>> for Rank {
    fn from(value: Option<u16>) -> Self {
        match value {
            Some(position) if position > 0 => Rank::Ranked(position),
            _ => Rank::Unranked,
        }
    }
}

impl From<Rank> for Option<u16> {
    fn from(value: Rank) -> Self {
        value.position()
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Ranked(position) => write!(f, "{position}"),
            Rank::Unranked => f.write_str("-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    DoneSuccess,
    DoneWithError,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::DoneSuccess => "done_success",
            RunStatus::DoneWithError => "done_with_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid run status: {0}")]
pub struct InvalidRunStatus(pub String);

impl std::str::FromStr for RunStatus {
    type Err = InvalidRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "done_success" => Ok(Self::DoneSuccess),
            "done_with_error" => Ok(Self::DoneWithError),
            other => Err(InvalidRunStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub progress: u8,
    pub errors: u32,
    pub captchas: u32,
    pub day: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RunStatus::Running,
            progress: 0,
            errors: 0,
            captchas: 0,
            day: started_at.date_naive(),
            started_at,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Search {
    pub id: SearchId,
    pub keyword: String,
    pub groups: Vec<GroupId>,
}

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("unknown pattern kind: {0}")]
    UnknownKind(String),
    #[error("empty pattern")]
    Empty,
    #[error("invalid regex pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// How a target recognises its own URLs in a result list.
#[derive(Debug, Clone)]
pub enum TargetPattern {
    /// Host equals the pattern.
    Domain(String),
    /// Host equals the pattern or is one of its subdomains.
    Subdomain(String),
    /// URL contains the pattern verbatim.
    Contains(String),
    /// Regular expression over the full URL.
    Regex(Regex),
}

impl TargetPattern {
    pub fn parse(kind: &str, raw: &str) -> Result<Self, PatternError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }
        match kind.to_ascii_lowercase().as_str() {
            "domain" => Ok(Self::Domain(raw.to_ascii_lowercase())),
            "subdomain" => Ok(Self::Subdomain(
                raw.trim_start_matches('.').to_ascii_lowercase(),
            )),
            "contains" => Ok(Self::Contains(raw.to_string())),
            "regex" => Ok(Self::Regex(Regex::new(raw)?)),
            other => Err(PatternError::UnknownKind(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::Subdomain(_) => "subdomain",
            Self::Contains(_) => "contains",
            Self::Regex(_) => "regex",
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Domain(value) | Self::Subdomain(value) | Self::Contains(value) => value,
            Self::Regex(regex) => regex.as_str(),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Domain(domain) => host_of(url).is_some_and(|host| host == *domain),
            Self::Subdomain(domain) => host_of(url).is_some_and(|host| {
                host == *domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }),
            Self::Contains(fragment) => url.contains(fragment.as_str()),
            Self::Regex(regex) => regex.is_match(url),
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url)
        .or_else(|_| url::Url::parse(&format!("http://{url}")))
        .ok()?;
    parsed.host_str().map(str::to_ascii_lowercase)
}

#[derive(Debug, Clone)]
pub struct Target {
    pub id: TargetId,
    pub group_id: GroupId,
    pub name: String,
    pub pattern: TargetPattern,
}

impl Target {
    pub fn matches(&self, url: &str) -> bool {
        self.pattern.matches(url)
    }

    /// Returns the rank of the first matching URL along with that URL.
    pub fn rank_in<'a>(&self, urls: &'a [String]) -> (Rank, Option<&'a str>) {
        urls.iter()
            .position(|url| self.matches(url))
            .map_or((Rank::Unranked, None), |index| {
                (Rank::from_index(index), Some(urls[index].as_str()))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerpEntry {
    pub url: String,
    /// Former position keyed by day offset.
    #[serde(default)]
    pub history: BTreeMap<u16, u16>,
}

impl SerpEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            history: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerpSnapshot {
    pub run_id: RunId,
    pub search_id: SearchId,
    pub captured_at: DateTime<Utc>,
    pub entries: Vec<SerpEntry>,
}

impl SerpSnapshot {
    /// 1-based position of the first entry with this URL.
    pub fn position_of(&self, url: &str) -> Option<u16> {
        self.entries
            .iter()
            .position(|entry| entry.url == url)
            .and_then(|index| u16::try_from(index + 1).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    pub run_id: RunId,
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub search_id: SearchId,
    pub rank: Rank,
    pub previous_rank: Rank,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestRank {
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub search_id: SearchId,
    pub rank: Rank,
    pub recorded_at: DateTime<Utc>,
    pub url: Option<String>,
}
