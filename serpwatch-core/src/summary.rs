//! Per-target scoring state for one run.
//!
//! Workers feed rank records concurrently through [`SummaryAccumulator`];
//! the controller finalizes every summary once, single-threaded, when the
//! run ends.

use std::cmp::Ordering;
use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{GroupId, Rank, RankRecord, RunId, TargetId};

/// Length of the best/improvement/loss lists kept per summary.
pub const TOP_SIZE: usize = 5;

/// Ranks past this position earn no points.
const SCORED_POSITIONS: u16 = 100;

const MAX_SCORE_BP: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub run_id: RunId,
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub previous_score_bp: u32,
    pub score_raw: u64,
    pub score_bp: u32,
    pub top3: u32,
    pub top10: u32,
    pub top100: u32,
    pub out: u32,
    pub top_ranks: Vec<RankRecord>,
    pub top_improvements: Vec<RankRecord>,
    pub top_losts: Vec<RankRecord>,
}

impl TargetSummary {
    pub fn new(
        group_id: GroupId,
        target_id: TargetId,
        run_id: RunId,
        previous_score_bp: u32,
    ) -> Self {
        Self {
            run_id,
            group_id,
            target_id,
            previous_score_bp,
            score_raw: 0,
            score_bp: 0,
            top3: 0,
            top10: 0,
            top100: 0,
            out: 0,
            top_ranks: Vec::new(),
            top_improvements: Vec::new(),
            top_losts: Vec::new(),
        }
    }

    pub fn add_rank_candidate(&mut self, record: &RankRecord) {
        match record.rank {
            Rank::Ranked(position) if position <= 3 => self.top3 += 1,
            Rank::Ranked(position) if position <= 10 => self.top10 += 1,
            Rank::Ranked(position) if position <= SCORED_POSITIONS => self.top100 += 1,
            _ => self.out += 1,
        }
        self.score_raw += u64::from(points(record.rank));

        if record.rank.is_ranked() {
            push_bounded(&mut self.top_ranks, record, |a, b| {
                a.rank.cmp(&b.rank).then(a.search_id.cmp(&b.search_id))
            });
        }

        let climb = movement(record);
        if climb > 0 {
            push_bounded(&mut self.top_improvements, record, |a, b| {
                movement(b)
                    .cmp(&movement(a))
                    .then(a.search_id.cmp(&b.search_id))
            });
        } else if climb < 0 {
            push_bounded(&mut self.top_losts, record, |a, b| {
                movement(a)
                    .cmp(&movement(b))
                    .then(a.search_id.cmp(&b.search_id))
            });
        }
    }

    /// Sets `score_bp` from the accumulated points and the group's search count.
    pub fn compute_score_bp(&mut self, searches_in_group: u32) {
        self.score_bp = if searches_in_group == 0 {
            0
        } else {
            let max_raw = u64::from(searches_in_group) * u64::from(SCORED_POSITIONS);
            let score = self.score_raw * u64::from(MAX_SCORE_BP) / max_raw;
            u32::try_from(score).map_or(MAX_SCORE_BP, |score| score.min(MAX_SCORE_BP))
        };
    }

    pub fn score_delta_bp(&self) -> i64 {
        i64::from(self.score_bp) - i64::from(self.previous_score_bp)
    }
}

fn points(rank: Rank) -> u16 {
    match rank {
        Rank::Ranked(position) if position <= SCORED_POSITIONS => SCORED_POSITIONS + 1 - position,
        _ => 0,
    }
}

fn movement_key(rank: Rank) -> i32 {
    match rank {
        Rank::Ranked(position) if position <= SCORED_POSITIONS => i32::from(position),
        _ => i32::from(SCORED_POSITIONS) + 1,
    }
}

/// Positive when the target climbed since the previous run.
fn movement(record: &RankRecord) -> i32 {
    movement_key(record.previous_rank) - movement_key(record.rank)
}

fn push_bounded<F>(list: &mut Vec<RankRecord>, record: &RankRecord, compare: F)
where
    F: Fn(&RankRecord, &RankRecord) -> Ordering,
{
    list.push(record.clone());
    list.sort_by(|a, b| compare(a, b));
    list.truncate(TOP_SIZE);
}

/// Run-scoped map of target id to its summary.
///
/// Each entry is locked on its own, so workers touching different targets
/// never wait on each other.
#[derive(Debug, Default)]
pub struct SummaryAccumulator {
    summaries: DashMap<TargetId, TargetSummary>,
}

impl SummaryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, summary: TargetSummary) {
        self.summaries.insert(summary.target_id, summary);
    }

    pub fn get(&self, target_id: TargetId) -> Option<TargetSummary> {
        self.summaries.get(&target_id).map(|entry| entry.clone())
    }

    /// Feeds one rank record into its target's summary.
    pub fn add(&self, record: &RankRecord) -> bool {
        match self.summaries.get_mut(&record.target_id) {
            Some(mut summary) => {
                summary.add_rank_candidate(record);
                true
            }
            None => {
                warn!(
                    target_id = record.target_id,
                    search_id = record.search_id,
                    "rank record for untracked target ignored"
                );
                false
            }
        }
    }

    /// Computes every score and returns the summaries ordered by target id.
    pub fn finalize(&self, search_count_by_group: &HashMap<GroupId, u32>) -> Vec<TargetSummary> {
        let mut finalized: Vec<TargetSummary> = self
            .summaries
            .iter_mut()
            .map(|mut entry| {
                let searches = search_count_by_group
                    .get(&entry.group_id)
                    .copied()
                    .unwrap_or(0);
                entry.compute_score_bp(searches);
                entry.clone()
            })
            .collect();
        finalized.sort_by_key(|summary| summary.target_id);
        finalized
    }
}
