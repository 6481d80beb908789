//! Turns one scraped result list into persisted snapshot and rank records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{
    BestRank, GroupId, Rank, RankRecord, RunId, Search, SerpEntry, SerpSnapshot, Target,
};
use crate::store::{RankStore, StoreResult};
use crate::summary::SummaryAccumulator;

/// Run-scoped lookups shared by every worker of one run.
#[derive(Debug, Default)]
pub struct RunContext {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub previous_run_id: Option<RunId>,
    /// Day offset to the run recorded that many days earlier.
    pub history_runs: BTreeMap<u16, RunId>,
    pub targets_by_group: HashMap<GroupId, Vec<Target>>,
    pub summaries: SummaryAccumulator,
}

impl RunContext {
    pub fn new(run_id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            ..Self::default()
        }
    }

    pub fn add_target(&mut self, target: Target) {
        self.targets_by_group
            .entry(target.group_id)
            .or_default()
            .push(target);
    }

    pub fn target_count(&self) -> usize {
        self.targets_by_group.values().map(Vec::len).sum()
    }
}

pub struct ResultAggregator {
    store: Arc<dyn RankStore>,
    context: Arc<RunContext>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn RankStore>, context: Arc<RunContext>) -> Self {
        Self { store, context }
    }

    /// Persists the snapshot of `search` and every rank it yields.
    ///
    /// Nothing is stored and no summary is touched unless every write
    /// succeeds. Returns the rank records produced, in group then target order.
    pub fn aggregate(&self, search: &Search, urls: &[String]) -> StoreResult<Vec<RankRecord>> {
        let context = &*self.context;
        let snapshot = self.snapshot(search, urls);

        let mut records = Vec::new();
        let mut bests = Vec::new();
        for group_id in &search.groups {
            let Some(targets) = context.targets_by_group.get(group_id) else {
                continue;
            };
            for target in targets {
                let (record, best) = self.rank_target(search, *group_id, target, urls)?;
                records.push(record);
                bests.extend(best);
            }
        }
        self.store.commit_result(&snapshot, &records, &bests)?;

        for record in &records {
            context.summaries.add(record);
        }
        debug!(
            run_id = context.run_id,
            search_id = search.id,
            urls = urls.len(),
            ranks = records.len(),
            bests = bests.len(),
            "result aggregated"
        );
        Ok(records)
    }

    fn snapshot(&self, search: &Search, urls: &[String]) -> SerpSnapshot {
        let context = &*self.context;
        let history: Vec<(u16, SerpSnapshot)> = context
            .history_runs
            .iter()
            .filter_map(|(day, run_id)| match self.store.get_serp(*run_id, search.id) {
                Ok(snapshot) => snapshot.map(|snapshot| (*day, snapshot)),
                Err(err) => {
                    warn!(
                        run_id,
                        search_id = search.id,
                        day,
                        error = %err,
                        "failed to load historical snapshot"
                    );
                    None
                }
            })
            .collect();

        let entries = urls
            .iter()
            .map(|url| {
                let mut entry = SerpEntry::new(url.as_str());
                for (day, past) in &history {
                    if let Some(position) = past.position_of(url) {
                        entry.history.insert(*day, position);
                    }
                }
                entry
            })
            .collect();

        SerpSnapshot {
            run_id: context.run_id,
            search_id: search.id,
            captured_at: context.started_at,
            entries,
        }
    }

    /// Rank of `target` in `urls`, plus the new best rank when it improves or ties.
    fn rank_target(
        &self,
        search: &Search,
        group_id: GroupId,
        target: &Target,
        urls: &[String],
    ) -> StoreResult<(RankRecord, Option<BestRank>)> {
        let context = &*self.context;
        let (rank, url) = target.rank_in(urls);
        let previous_rank = match context.previous_run_id {
            Some(previous) => self
                .store
                .get_rank(previous, group_id, target.id, search.id)?,
            None => Rank::Unranked,
        };

        let record = RankRecord {
            run_id: context.run_id,
            group_id,
            target_id: target.id,
            search_id: search.id,
            rank,
            previous_rank,
            url: url.map(str::to_string),
        };
        if !rank.is_ranked() {
            return Ok((record, None));
        }

        let best = self
            .store
            .get_best(group_id, target.id, search.id)?
            .map_or(Rank::Unranked, |best| best.rank);
        let best = (rank <= best).then(|| BestRank {
            group_id,
            target_id: target.id,
            search_id: search.id,
            rank,
            recorded_at: context.started_at,
            url: record.url.clone(),
        });
        Ok((record, best))
    }
}
