//! Persistence boundary for runs, reference data and derived rank records.

mod error;
mod sqlite;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::{
    BestRank, GroupId, Rank, RankRecord, Run, RunId, Search, SearchId, SerpSnapshot, Target,
    TargetId, TargetPattern,
};
use crate::summary::TargetSummary;

pub use error::{StoreError, StoreResult};
pub use sqlite::{SqliteRankStore, SqliteRankStoreBuilder};

/// Storage collaborator used by the run controller and its workers.
///
/// Implementations are called concurrently from several workers and must
/// serialise writes themselves.
pub trait RankStore: Send + Sync {
    fn create_run(&self, started_at: DateTime<Utc>) -> StoreResult<Run>;
    fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>>;
    /// Most recent run started before `run_id`.
    fn find_previous_run(&self, run_id: RunId) -> StoreResult<Option<Run>>;
    fn find_runs_by_day(&self, day: NaiveDate) -> StoreResult<Vec<Run>>;
    fn list_runs(&self, limit: usize) -> StoreResult<Vec<Run>>;
    fn update_run_progress(&self, run_id: RunId, progress: u8) -> StoreResult<()>;
    fn update_run_captchas(&self, run_id: RunId, captchas: u32) -> StoreResult<()>;
    /// Persists the terminal status, error count and finish time.
    fn finish_run(&self, run: &Run) -> StoreResult<()>;
    /// Puts a finished run back to running and clears its finish time.
    fn reopen_run(&self, run_id: RunId) -> StoreResult<()>;

    fn insert_search(&self, keyword: &str, groups: &[GroupId]) -> StoreResult<Search>;
    fn list_searches(&self) -> StoreResult<Vec<Search>>;
    /// Searches that have no snapshot yet for `run_id`.
    fn list_unchecked_searches(&self, run_id: RunId) -> StoreResult<Vec<Search>>;
    fn count_searches_by_group(&self) -> StoreResult<HashMap<GroupId, u32>>;

    fn insert_target(
        &self,
        group_id: GroupId,
        name: &str,
        pattern: &TargetPattern,
    ) -> StoreResult<Target>;
    fn list_targets(&self) -> StoreResult<Vec<Target>>;

    fn insert_serp(&self, snapshot: &SerpSnapshot) -> StoreResult<()>;
    fn get_serp(&self, run_id: RunId, search_id: SearchId) -> StoreResult<Option<SerpSnapshot>>;

    fn insert_rank(&self, record: &RankRecord) -> StoreResult<()>;
    /// Rank stored for the triple in `run_id`, `Rank::Unranked` when absent.
    fn get_rank(
        &self,
        run_id: RunId,
        group_id: GroupId,
        target_id: TargetId,
        search_id: SearchId,
    ) -> StoreResult<Rank>;
    fn list_ranks(&self, run_id: RunId) -> StoreResult<Vec<RankRecord>>;
    fn get_best(
        &self,
        group_id: GroupId,
        target_id: TargetId,
        search_id: SearchId,
    ) -> StoreResult<Option<BestRank>>;
    /// Replaces the best rank of the triple.
    fn insert_best(&self, best: &BestRank) -> StoreResult<()>;
    /// Writes everything one search produced, or nothing when any write fails.
    ///
    /// The snapshot marks the search as checked, so it must never be stored
    /// without its ranks.
    fn commit_result(
        &self,
        snapshot: &SerpSnapshot,
        ranks: &[RankRecord],
        bests: &[BestRank],
    ) -> StoreResult<()>;

    /// Final score of every target summarised in `run_id`.
    fn previous_scores(&self, run_id: RunId) -> StoreResult<HashMap<TargetId, u32>>;
    fn list_summaries(&self, run_id: RunId) -> StoreResult<Vec<TargetSummary>>;
    /// Upserts all summaries in a single transaction.
    fn insert_summaries(&self, summaries: &[TargetSummary]) -> StoreResult<()>;
}
