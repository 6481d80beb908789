use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::model::{
    BestRank, GroupId, Rank, RankRecord, Run, RunId, RunStatus, Search, SearchId, SerpSnapshot,
    Target, TargetId, TargetPattern,
};
use crate::sqlite::configure_connection;
use crate::summary::TargetSummary;

use super::{RankStore, StoreError, StoreResult};

const SCHEMA: &str = include_str!("../../sql/serpwatch.sql");

#[derive(Debug, Clone)]
pub struct SqliteRankStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteRankStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteRankStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteRankStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteRankStore { path, flags })
    }
}

/// SQLite-backed [`RankStore`]; every call opens its own connection.
#[derive(Debug, Clone)]
pub struct SqliteRankStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteRankStore {
    pub fn builder() -> SqliteRankStoreBuilder {
        SqliteRankStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteRankStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn load_groups(conn: &Connection, searches: &mut [Search]) -> StoreResult<()> {
        let mut stmt = conn.prepare(
            "SELECT group_id FROM search_groups WHERE search_id = ?1 ORDER BY group_id",
        )?;
        for search in searches.iter_mut() {
            search.groups = stmt
                .query_map([search.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<GroupId>>>()?;
        }
        Ok(())
    }

    fn query_searches(
        conn: &Connection,
        sql: &str,
        run_id: Option<RunId>,
    ) -> StoreResult<Vec<Search>> {
        let mut stmt = conn.prepare(sql)?;
        let mut searches = match run_id {
            Some(run_id) => stmt.query_map([run_id], search_from_row)?,
            None => stmt.query_map([], search_from_row)?,
        }
        .collect::<rusqlite::Result<Vec<_>>>()?;
        Self::load_groups(conn, &mut searches)?;
        Ok(searches)
    }
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(index, err))
}

fn search_from_row(row: &Row<'_>) -> rusqlite::Result<Search> {
    Ok(Search {
        id: row.get("id")?,
        keyword: row.get("keyword")?,
        groups: Vec::new(),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(1)?;
    Ok(Run {
        id: row.get(0)?,
        status: status
            .parse::<RunStatus>()
            .map_err(|err| conversion_error(1, err))?,
        progress: row.get(2)?,
        errors: row.get(3)?,
        captchas: row.get(4)?,
        day: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
    })
}

const RUN_COLUMNS: &str = "id, status, progress, errors, captchas, day, started_at, finished_at";

fn rank_from_row(row: &Row<'_>) -> rusqlite::Result<RankRecord> {
    Ok(RankRecord {
        run_id: row.get(0)?,
        group_id: row.get(1)?,
        target_id: row.get(2)?,
        search_id: row.get(3)?,
        rank: Rank::from_db(row.get(4)?),
        previous_rank: Rank::from_db(row.get(5)?),
        url: row.get(6)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<TargetSummary> {
    Ok(TargetSummary {
        run_id: row.get(0)?,
        target_id: row.get(1)?,
        group_id: row.get(2)?,
        previous_score_bp: row.get(3)?,
        score_raw: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
        score_bp: row.get(5)?,
        top3: row.get(6)?,
        top10: row.get(7)?,
        top100: row.get(8)?,
        out: row.get(9)?,
        top_ranks: json_column(row, 10)?,
        top_improvements: json_column(row, 11)?,
        top_losts: json_column(row, 12)?,
    })
}

fn write_serp(conn: &Connection, snapshot: &SerpSnapshot) -> StoreResult<()> {
    let entries = serde_json::to_string(&snapshot.entries)?;
    conn.execute(
        "INSERT OR REPLACE INTO serps (run_id, search_id, captured_at, entries) \
         VALUES (?1, ?2, ?3, ?4)",
        params![snapshot.run_id, snapshot.search_id, snapshot.captured_at, entries],
    )?;
    Ok(())
}

fn write_rank(conn: &Connection, record: &RankRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO ranks (run_id, group_id, target_id, search_id, rank, previous_rank, url) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.run_id,
            record.group_id,
            record.target_id,
            record.search_id,
            record.rank.to_db(),
            record.previous_rank.to_db(),
            record.url
        ],
    )?;
    Ok(())
}

fn write_best(conn: &Connection, best: &BestRank) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO ranks_best \
         (group_id, target_id, search_id, rank, recorded_at, url) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            best.group_id,
            best.target_id,
            best.search_id,
            best.rank.to_db(),
            best.recorded_at,
            best.url
        ],
    )?;
    Ok(())
}

impl RankStore for SqliteRankStore {
    fn create_run(&self, started_at: DateTime<Utc>) -> StoreResult<Run> {
        let conn = self.open()?;
        let mut run = Run::new(0, started_at);
        conn.execute(
            "INSERT INTO runs (status, progress, errors, captchas, day, started_at) \
             VALUES (?1, 0, 0, 0, ?2, ?3)",
            params![run.status.as_str(), run.day, run.started_at],
        )?;
        run.id = conn.last_insert_rowid();
        Ok(run)
    }

    fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        let conn = self.open()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn find_previous_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        let conn = self.open()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id < ?1 ORDER BY id DESC LIMIT 1"),
                [run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn find_runs_by_day(&self, day: NaiveDate) -> StoreResult<Vec<Run>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE day = ?1 ORDER BY id DESC"
        ))?;
        let runs = stmt
            .query_map([day], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn list_runs(&self, limit: usize) -> StoreResult<Vec<Run>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
        ))?;
        let runs = stmt
            .query_map([limit as i64], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn update_run_progress(&self, run_id: RunId, progress: u8) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE runs SET progress = ?1 WHERE id = ?2",
            params![progress, run_id],
        )?;
        if affected == 0 {
            return Err(StoreError::RunNotFound { run_id });
        }
        Ok(())
    }

    fn update_run_captchas(&self, run_id: RunId, captchas: u32) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE runs SET captchas = ?1 WHERE id = ?2",
            params![captchas, run_id],
        )?;
        if affected == 0 {
            return Err(StoreError::RunNotFound { run_id });
        }
        Ok(())
    }

    fn finish_run(&self, run: &Run) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE runs SET status = ?1, progress = ?2, errors = ?3, captchas = ?4, finished_at = ?5 \
             WHERE id = ?6",
            params![
                run.status.as_str(),
                run.progress,
                run.errors,
                run.captchas,
                run.finished_at,
                run.id
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::RunNotFound { run_id: run.id });
        }
        Ok(())
    }

    fn reopen_run(&self, run_id: RunId) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = NULL WHERE id = ?2",
            params![RunStatus::Running.as_str(), run_id],
        )?;
        if affected == 0 {
            return Err(StoreError::RunNotFound { run_id });
        }
        Ok(())
    }

    fn insert_search(&self, keyword: &str, groups: &[GroupId]) -> StoreResult<Search> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute("INSERT INTO searches (keyword) VALUES (?1)", [keyword])?;
        let id = tx.last_insert_rowid();
        for group in groups {
            tx.execute(
                "INSERT OR IGNORE INTO search_groups (search_id, group_id) VALUES (?1, ?2)",
                params![id, group],
            )?;
        }
        tx.commit()?;
        let mut groups = groups.to_vec();
        groups.sort_unstable();
        groups.dedup();
        Ok(Search {
            id,
            keyword: keyword.to_string(),
            groups,
        })
    }

    fn list_searches(&self) -> StoreResult<Vec<Search>> {
        let conn = self.open()?;
        Self::query_searches(&conn, "SELECT id, keyword FROM searches ORDER BY id", None)
    }

    fn list_unchecked_searches(&self, run_id: RunId) -> StoreResult<Vec<Search>> {
        let conn = self.open()?;
        Self::query_searches(
            &conn,
            "SELECT id, keyword FROM searches \
             WHERE id NOT IN (SELECT search_id FROM serps WHERE run_id = ?1) ORDER BY id",
            Some(run_id),
        )
    }

    fn count_searches_by_group(&self) -> StoreResult<HashMap<GroupId, u32>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT group_id, COUNT(*) FROM search_groups GROUP BY group_id")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<GroupId, u32>>>()?;
        Ok(counts)
    }

    fn insert_target(
        &self,
        group_id: GroupId,
        name: &str,
        pattern: &TargetPattern,
    ) -> StoreResult<Target> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO targets (group_id, name, pattern_kind, pattern) VALUES (?1, ?2, ?3, ?4)",
            params![group_id, name, pattern.kind(), pattern.as_str()],
        )?;
        Ok(Target {
            id: conn.last_insert_rowid(),
            group_id,
            name: name.to_string(),
            pattern: pattern.clone(),
        })
    }

    fn list_targets(&self) -> StoreResult<Vec<Target>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, group_id, name, pattern_kind, pattern FROM targets ORDER BY id",
        )?;
        let targets = stmt
            .query_map([], |row| {
                let kind: String = row.get(3)?;
                let raw: String = row.get(4)?;
                Ok(Target {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    name: row.get(2)?,
                    pattern: TargetPattern::parse(&kind, &raw)
                        .map_err(|err| conversion_error(4, err))?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(targets)
    }

    fn insert_serp(&self, snapshot: &SerpSnapshot) -> StoreResult<()> {
        let conn = self.open()?;
        write_serp(&conn, snapshot)
    }

    fn get_serp(&self, run_id: RunId, search_id: SearchId) -> StoreResult<Option<SerpSnapshot>> {
        let conn = self.open()?;
        let snapshot = conn
            .query_row(
                "SELECT run_id, search_id, captured_at, entries FROM serps \
                 WHERE run_id = ?1 AND search_id = ?2",
                params![run_id, search_id],
                |row| {
                    Ok(SerpSnapshot {
                        run_id: row.get(0)?,
                        search_id: row.get(1)?,
                        captured_at: row.get(2)?,
                        entries: json_column(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    fn insert_rank(&self, record: &RankRecord) -> StoreResult<()> {
        let conn = self.open()?;
        write_rank(&conn, record)
    }

    fn get_rank(
        &self,
        run_id: RunId,
        group_id: GroupId,
        target_id: TargetId,
        search_id: SearchId,
    ) -> StoreResult<Rank> {
        let conn = self.open()?;
        let rank = conn
            .query_row(
                "SELECT rank FROM ranks \
                 WHERE run_id = ?1 AND group_id = ?2 AND target_id = ?3 AND search_id = ?4",
                params![run_id, group_id, target_id, search_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(rank.map_or(Rank::Unranked, Rank::from_db))
    }

    fn list_ranks(&self, run_id: RunId) -> StoreResult<Vec<RankRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, group_id, target_id, search_id, rank, previous_rank, url FROM ranks \
             WHERE run_id = ?1 ORDER BY group_id, target_id, search_id",
        )?;
        let ranks = stmt
            .query_map([run_id], rank_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ranks)
    }

    fn get_best(
        &self,
        group_id: GroupId,
        target_id: TargetId,
        search_id: SearchId,
    ) -> StoreResult<Option<BestRank>> {
        let conn = self.open()?;
        let best = conn
            .query_row(
                "SELECT group_id, target_id, search_id, rank, recorded_at, url FROM ranks_best \
                 WHERE group_id = ?1 AND target_id = ?2 AND search_id = ?3",
                params![group_id, target_id, search_id],
                |row| {
                    Ok(BestRank {
                        group_id: row.get(0)?,
                        target_id: row.get(1)?,
                        search_id: row.get(2)?,
                        rank: Rank::from_db(row.get(3)?),
                        recorded_at: row.get(4)?,
                        url: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(best)
    }

    fn insert_best(&self, best: &BestRank) -> StoreResult<()> {
        let conn = self.open()?;
        write_best(&conn, best)
    }

    fn commit_result(
        &self,
        snapshot: &SerpSnapshot,
        ranks: &[RankRecord],
        bests: &[BestRank],
    ) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for record in ranks {
            write_rank(&tx, record)?;
        }
        for best in bests {
            write_best(&tx, best)?;
        }
        write_serp(&tx, snapshot)?;
        tx.commit()?;
        Ok(())
    }

    fn previous_scores(&self, run_id: RunId) -> StoreResult<HashMap<TargetId, u32>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT target_id, score_bp FROM target_summaries WHERE run_id = ?1")?;
        let scores = stmt
            .query_map([run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<TargetId, u32>>>()?;
        Ok(scores)
    }

    fn list_summaries(&self, run_id: RunId) -> StoreResult<Vec<TargetSummary>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, target_id, group_id, previous_score_bp, score_raw, score_bp, \
             top3, top10, top100, out, top_ranks, top_improvements, top_losts \
             FROM target_summaries WHERE run_id = ?1 ORDER BY target_id",
        )?;
        let summaries = stmt
            .query_map([run_id], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    fn insert_summaries(&self, summaries: &[TargetSummary]) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO target_summaries (
                    run_id, target_id, group_id, previous_score_bp, score_raw, score_bp,
                    top3, top10, top100, out, top_ranks, top_improvements, top_losts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for summary in summaries {
                stmt.execute(params![
                    summary.run_id,
                    summary.target_id,
                    summary.group_id,
                    summary.previous_score_bp,
                    i64::try_from(summary.score_raw).unwrap_or(i64::MAX),
                    summary.score_bp,
                    summary.top3,
                    summary.top10,
                    summary.top100,
                    summary.out,
                    serde_json::to_string(&summary.top_ranks)?,
                    serde_json::to_string(&summary.top_improvements)?,
                    serde_json::to_string(&summary.top_losts)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SerpEntry;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteRankStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteRankStore::new(dir.path().join("serpwatch.sqlite")).unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    #[test]
    fn run_lifecycle_roundtrip() {
        let (_dir, store) = temp_store();
        let first = store.create_run(Utc::now()).unwrap();
        let mut second = store.create_run(Utc::now()).unwrap();
        assert!(second.id > first.id);

        store.update_run_progress(second.id, 40).unwrap();
        store.update_run_captchas(second.id, 3).unwrap();
        let loaded = store.get_run(second.id).unwrap().unwrap();
        assert_eq!(loaded.progress, 40);
        assert_eq!(loaded.captchas, 3);
        assert_eq!(loaded.status, RunStatus::Running);

        second.status = RunStatus::DoneWithError;
        second.errors = 2;
        second.finished_at = Some(Utc::now());
        store.finish_run(&second).unwrap();
        let loaded = store.get_run(second.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::DoneWithError);
        assert_eq!(loaded.errors, 2);

        store.reopen_run(second.id).unwrap();
        let reopened = store.get_run(second.id).unwrap().unwrap();
        assert_eq!(reopened.status, RunStatus::Running);
        assert!(reopened.finished_at.is_none());
        assert_eq!(reopened.errors, 2);

        let previous = store.find_previous_run(second.id).unwrap().unwrap();
        assert_eq!(previous.id, first.id);
        assert!(store.find_previous_run(first.id).unwrap().is_none());
        assert_eq!(store.find_runs_by_day(first.day).unwrap().len(), 2);
        assert!(matches!(
            store.update_run_progress(999, 1),
            Err(StoreError::RunNotFound { run_id: 999 })
        ));
    }

    #[test]
    fn unchecked_searches_exclude_captured_ones() {
        let (_dir, store) = temp_store();
        let a = store.insert_search("rust crates", &[1, 2]).unwrap();
        let b = store.insert_search("tokio tutorial", &[2]).unwrap();
        let run = store.create_run(Utc::now()).unwrap();
        store
            .insert_serp(&SerpSnapshot {
                run_id: run.id,
                search_id: a.id,
                captured_at: Utc::now(),
                entries: vec![SerpEntry::new("https://crates.io/")],
            })
            .unwrap();

        let unchecked = store.list_unchecked_searches(run.id).unwrap();
        assert_eq!(unchecked, vec![b.clone()]);
        let all = store.list_searches().unwrap();
        assert_eq!(all[0].groups, vec![1, 2]);
        let counts = store.count_searches_by_group().unwrap();
        assert_eq!(counts.get(&1), Some(&1));
        assert_eq!(counts.get(&2), Some(&2));
    }

    #[test]
    fn ranks_and_best_roundtrip() {
        let (_dir, store) = temp_store();
        let record = RankRecord {
            run_id: 1,
            group_id: 2,
            target_id: 3,
            search_id: 4,
            rank: Rank::Ranked(6),
            previous_rank: Rank::Unranked,
            url: Some("https://example.com/".into()),
        };
        store.insert_rank(&record).unwrap();
        assert!(store.insert_rank(&record).is_err());
        assert_eq!(store.get_rank(1, 2, 3, 4).unwrap(), Rank::Ranked(6));
        assert_eq!(store.get_rank(9, 2, 3, 4).unwrap(), Rank::Unranked);
        assert_eq!(store.list_ranks(1).unwrap(), vec![record]);

        assert!(store.get_best(2, 3, 4).unwrap().is_none());
        let best = BestRank {
            group_id: 2,
            target_id: 3,
            search_id: 4,
            rank: Rank::Ranked(6),
            recorded_at: Utc::now(),
            url: None,
        };
        store.insert_best(&best).unwrap();
        store
            .insert_best(&BestRank {
                rank: Rank::Ranked(2),
                ..best.clone()
            })
            .unwrap();
        assert_eq!(store.get_best(2, 3, 4).unwrap().unwrap().rank, Rank::Ranked(2));
    }

    #[test]
    fn failed_result_commit_leaves_nothing_behind() {
        let (_dir, store) = temp_store();
        let search = store.insert_search("rust crates", &[2]).unwrap();
        let run = store.create_run(Utc::now()).unwrap();
        let record = RankRecord {
            run_id: run.id,
            group_id: 2,
            target_id: 3,
            search_id: search.id,
            rank: Rank::Ranked(1),
            previous_rank: Rank::Unranked,
            url: Some("https://crates.io/".into()),
        };
        let best = BestRank {
            group_id: 2,
            target_id: 3,
            search_id: search.id,
            rank: Rank::Ranked(1),
            recorded_at: Utc::now(),
            url: record.url.clone(),
        };
        let snapshot = SerpSnapshot {
            run_id: run.id,
            search_id: search.id,
            captured_at: Utc::now(),
            entries: vec![SerpEntry::new("https://crates.io/")],
        };

        // The second copy of the same rank violates the primary key.
        let result =
            store.commit_result(&snapshot, &[record.clone(), record.clone()], &[best.clone()]);
        assert!(result.is_err());
        assert!(store.get_serp(run.id, search.id).unwrap().is_none());
        assert!(store.list_ranks(run.id).unwrap().is_empty());
        assert!(store.get_best(2, 3, search.id).unwrap().is_none());
        assert_eq!(store.list_unchecked_searches(run.id).unwrap(), vec![search.clone()]);

        store.commit_result(&snapshot, &[record.clone()], &[best.clone()]).unwrap();
        assert_eq!(store.get_serp(run.id, search.id).unwrap().unwrap(), snapshot);
        assert_eq!(store.list_ranks(run.id).unwrap(), vec![record]);
        assert_eq!(store.get_best(2, 3, search.id).unwrap().unwrap(), best);
        assert!(store.list_unchecked_searches(run.id).unwrap().is_empty());
    }

    #[test]
    fn targets_keep_their_pattern() {
        let (_dir, store) = temp_store();
        let pattern = TargetPattern::parse("regex", r"example\.com/blog").unwrap();
        store.insert_target(7, "blog", &pattern).unwrap();
        let targets = store.list_targets().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].pattern.kind(), "regex");
        assert!(targets[0].matches("https://example.com/blog/1"));
    }

    #[test]
    fn summaries_upsert_and_previous_scores() {
        let (_dir, store) = temp_store();
        let mut summary = TargetSummary::new(1, 5, 3, 0);
        summary.score_bp = 4_200;
        store.insert_summaries(&[summary.clone()]).unwrap();
        summary.score_bp = 4_300;
        store.insert_summaries(&[summary.clone()]).unwrap();
        assert_eq!(store.list_summaries(3).unwrap(), vec![summary]);
        assert_eq!(store.previous_scores(3).unwrap().get(&5), Some(&4_300));
    }
}
