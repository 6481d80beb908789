//! Run controller: loads the work of one run, drives the worker pool and
//! decides the terminal status.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{ResultAggregator, RunContext};
use crate::captcha::{CaptchaGate, CaptchaGuard, CaptchaSolver};
use crate::config::SerpwatchConfig;
use crate::model::{
    GroupId, RankRecord, Run, RunId, RunStatus, Search, Target, HISTORY_DAYS,
};
use crate::proxy::{Proxy, ProxyRotator};
use crate::queue::WorkQueue;
use crate::scrape::{HttpSettings, ScrapeError, ScrapeExecutor};
use crate::store::{RankStore, StoreError, StoreResult};
use crate::summary::TargetSummary;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run {0} does not exist")]
    UnknownRun(RunId),
    #[error("storage job aborted: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Where the work of a run comes from.
#[derive(Debug, Clone, Default)]
pub enum TaskMode {
    /// Every stored search against every stored target, in a new run.
    #[default]
    Full,
    /// Searches of an existing run that have no snapshot yet.
    Resume { run_id: RunId },
    /// Caller-supplied searches and targets, in a new run.
    Custom {
        searches: Vec<Search>,
        targets: Vec<Target>,
    },
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub max_threads: usize,
    pub shuffle: bool,
    pub queue_poll: Duration,
    pub http: HttpSettings,
    pub mode: TaskMode,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_threads: 4,
            shuffle: true,
            queue_poll: Duration::from_secs(1),
            http: HttpSettings::default(),
            mode: TaskMode::Full,
        }
    }
}

impl TaskOptions {
    pub fn from_config(config: &SerpwatchConfig, mode: TaskMode) -> Self {
        Self {
            max_threads: config.task.max_threads,
            shuffle: config.task.shuffle,
            queue_poll: config.task.queue_poll(),
            http: config.http.settings(),
            mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: Run,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub workers: usize,
    pub proxies_configured: usize,
    pub proxies_evicted: usize,
    pub captchas: u32,
    pub summaries: usize,
    /// Every rank produced, filled only for custom runs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ranks: Vec<RankRecord>,
}

pub struct RunController {
    store: Arc<dyn RankStore>,
    executor: Arc<dyn ScrapeExecutor>,
    solver: Option<Arc<dyn CaptchaSolver>>,
    proxies: Vec<Proxy>,
    options: TaskOptions,
    cancel: CancellationToken,
}

impl RunController {
    pub fn new(
        store: Arc<dyn RankStore>,
        executor: Arc<dyn ScrapeExecutor>,
        proxies: Vec<Proxy>,
        options: TaskOptions,
    ) -> Self {
        Self {
            store,
            executor,
            solver: None,
            proxies,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Token that interrupts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> TaskResult<RunReport> {
        let mut captcha = CaptchaGuard::new(CaptchaGate::initialize(self.solver.clone()));
        let execution = self.execute(captcha.gate()).await?;
        captcha.release();
        Ok(self.complete(execution).await)
    }

    async fn execute(&self, gate: &CaptchaGate) -> TaskResult<Execution> {
        let run = self.open_run().await?;
        let mut context = RunContext::new(run.id, run.started_at);
        self.resolve_history(&mut context, &run).await?;
        let searches = self.load_work(&mut context, &run).await?;
        let custom_counts = match &self.options.mode {
            TaskMode::Custom { searches, .. } => Some(count_by_group(searches)),
            _ => None,
        };

        let rotator = ProxyRotator::new(self.proxies.clone());
        let mut workers = self.options.max_threads.max(1);
        if rotator.alive() < workers {
            info!(
                proxies = rotator.alive(),
                max_threads = self.options.max_threads,
                "fewer proxies than max threads, clamping worker count"
            );
            workers = rotator.alive();
        }

        let context = Arc::new(context);
        let queue = WorkQueue::new(searches, self.options.shuffle);
        let total = queue.dispatched();
        info!(
            run_id = run.id,
            searches = total,
            targets = context.target_count(),
            workers,
            "starting run"
        );

        let pool = Arc::new(WorkerPool {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            aggregator: ResultAggregator::new(Arc::clone(&self.store), Arc::clone(&context)),
            queue,
            rotator,
            gate: gate.clone(),
            http: self.options.http.clone(),
            poll: self.options.queue_poll,
            cancel: self.cancel.clone(),
            progress: RunProgress::new(run.id, total, run.captchas),
            collected: custom_counts.as_ref().map(|_| Mutex::new(Vec::new())),
        });
        self.join_workers(&pool, workers).await;

        let summaries = self.finalize_summaries(&context, custom_counts).await;
        let evicted = pool.rotator.evicted();
        warn!(
            run_id = run.id,
            evicted,
            configured = pool.rotator.configured(),
            "{evicted} proxies failed during the run"
        );

        let ranks = match &pool.collected {
            Some(collected) => {
                std::mem::take(&mut *collected.lock().unwrap_or_else(PoisonError::into_inner))
            }
            None => Vec::new(),
        };
        Ok(Execution {
            run,
            total,
            processed: pool.progress.processed(),
            failed: pool.progress.failed(),
            captchas: pool.progress.captchas(),
            workers,
            proxies_configured: pool.rotator.configured(),
            proxies_evicted: evicted,
            summaries,
            ranks,
        })
    }

    async fn open_run(&self) -> TaskResult<Run> {
        match &self.options.mode {
            TaskMode::Resume { run_id } => {
                let run_id = *run_id;
                let mut run = blocking(&self.store, move |store| store.get_run(run_id))
                    .await?
                    .ok_or(TaskError::UnknownRun(run_id))?;
                if run.status != RunStatus::Running {
                    blocking(&self.store, move |store| store.reopen_run(run_id)).await?;
                    run.status = RunStatus::Running;
                    run.finished_at = None;
                }
                info!(run_id, progress = run.progress, "resuming run");
                Ok(run)
            }
            TaskMode::Full | TaskMode::Custom { .. } => {
                blocking(&self.store, |store| store.create_run(Utc::now())).await
            }
        }
    }

    async fn resolve_history(&self, context: &mut RunContext, run: &Run) -> TaskResult<()> {
        let run_id = run.id;
        let day = run.day;
        let (previous, history) = blocking(&self.store, move |store| {
            let mut history = BTreeMap::new();
            let Some(previous) = store.find_previous_run(run_id)? else {
                return Ok((None, history));
            };
            for offset in HISTORY_DAYS {
                let offset_days = chrono::Duration::days(i64::from(offset));
                let Some(past_day) = day.checked_sub_signed(offset_days) else {
                    continue;
                };
                if let Some(past) = store.find_runs_by_day(past_day)?.first() {
                    history.insert(offset, past.id);
                }
            }
            Ok((Some(previous.id), history))
        })
        .await?;
        debug!(run_id, previous_run_id = ?previous, history = ?history, "previous runs resolved");
        context.previous_run_id = previous;
        context.history_runs = history;
        Ok(())
    }

    /// Registers every target with a fresh summary and returns the searches to dispatch.
    async fn load_work(&self, context: &mut RunContext, run: &Run) -> TaskResult<Vec<Search>> {
        let run_id = run.id;
        let previous = context.previous_run_id;
        let (searches, targets, previous_scores, existing) = match &self.options.mode {
            TaskMode::Custom { searches, targets } => {
                let scores = match previous {
                    Some(previous) => {
                        blocking(&self.store, move |store| store.previous_scores(previous)).await?
                    }
                    None => HashMap::new(),
                };
                (searches.clone(), targets.clone(), scores, Vec::new())
            }
            mode => {
                let resume = matches!(mode, TaskMode::Resume { .. });
                blocking(&self.store, move |store| {
                    let searches = if resume {
                        store.list_unchecked_searches(run_id)?
                    } else {
                        store.list_searches()?
                    };
                    let scores = match previous {
                        Some(previous) => store.previous_scores(previous)?,
                        None => HashMap::new(),
                    };
                    let existing = if resume {
                        store.list_summaries(run_id)?
                    } else {
                        Vec::new()
                    };
                    Ok((searches, store.list_targets()?, scores, existing))
                })
                .await?
            }
        };

        for target in targets {
            let previous_score = previous_scores.get(&target.id).copied().unwrap_or(0);
            context.summaries.insert(TargetSummary::new(
                target.group_id,
                target.id,
                run_id,
                previous_score,
            ));
            context.add_target(target);
        }
        for summary in existing {
            context.summaries.insert(summary);
        }
        info!(run_id, searches = searches.len(), "searches to do");
        Ok(searches)
    }

    async fn join_workers(&self, pool: &Arc<WorkerPool>, workers: usize) {
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(run_worker(worker_id, Arc::clone(pool)));
        }

        let run_id = pool.progress.run_id;
        let mut interrupted = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        error!(run_id, error = %err, "worker terminated abnormally");
                        if err.is_panic() {
                            pool.progress.fail();
                        }
                    }
                },
                _ = self.cancel.cancelled(), if !interrupted => {
                    interrupted = true;
                    warn!(run_id, "run interrupted, waiting for workers to stop");
                }
            }
        }
    }

    async fn finalize_summaries(
        &self,
        context: &Arc<RunContext>,
        custom_counts: Option<HashMap<GroupId, u32>>,
    ) -> usize {
        let context = Arc::clone(context);
        let finalized = blocking(&self.store, move |store| {
            let counts = match custom_counts {
                Some(counts) => counts,
                None => store.count_searches_by_group()?,
            };
            let summaries = context.summaries.finalize(&counts);
            store.insert_summaries(&summaries)?;
            Ok(summaries.len())
        })
        .await;
        match finalized {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, "failed to persist target summaries");
                0
            }
        }
    }

    async fn complete(&self, execution: Execution) -> RunReport {
        let Execution {
            mut run,
            total,
            processed,
            failed,
            captchas,
            workers,
            proxies_configured,
            proxies_evicted,
            summaries,
            ranks,
        } = execution;

        let remaining = total.saturating_sub(processed);
        run.captchas = captchas;
        run.progress = percent(processed, total);
        run.finished_at = Some(Utc::now());
        if remaining > 0 {
            run.status = RunStatus::DoneWithError;
            run.errors = u32::try_from(remaining).unwrap_or(u32::MAX);
            warn!(run_id = run.id, remaining, "searches have not been checked");
        } else {
            run.status = RunStatus::DoneSuccess;
            run.errors = 0;
        }

        let persisted = run.clone();
        if let Err(err) = blocking(&self.store, move |store| store.finish_run(&persisted)).await {
            error!(run_id = run.id, error = %err, "failed to persist run status");
        }
        info!(
            run_id = run.id,
            status = %run.status,
            processed,
            failed,
            total,
            "run finished"
        );

        RunReport {
            run,
            total,
            processed,
            failed,
            workers,
            proxies_configured,
            proxies_evicted,
            captchas,
            summaries,
            ranks,
        }
    }
}

struct Execution {
    run: Run,
    total: usize,
    processed: usize,
    failed: usize,
    captchas: u32,
    workers: usize,
    proxies_configured: usize,
    proxies_evicted: usize,
    summaries: usize,
    ranks: Vec<RankRecord>,
}

fn count_by_group(searches: &[Search]) -> HashMap<GroupId, u32> {
    let mut counts = HashMap::new();
    for search in searches {
        for group in &search.groups {
            *counts.entry(*group).or_insert(0) += 1;
        }
    }
    counts
}

fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from((processed.min(total) * 100) / total).unwrap_or(100)
}

async fn blocking<T, F>(store: &Arc<dyn RankStore>, job: F) -> TaskResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn RankStore) -> StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let value = tokio::task::spawn_blocking(move || job(store.as_ref())).await??;
    Ok(value)
}

#[derive(Debug, Default)]
struct Persisted {
    progress: u8,
    captchas: u32,
}

/// Counters of one run. Persisted values only ever grow.
struct RunProgress {
    run_id: RunId,
    total: usize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    captchas: AtomicU32,
    persisted: tokio::sync::Mutex<Persisted>,
}

impl RunProgress {
    fn new(run_id: RunId, total: usize, captchas: u32) -> Self {
        Self {
            run_id,
            total,
            processed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            captchas: AtomicU32::new(captchas),
            persisted: tokio::sync::Mutex::new(Persisted {
                progress: 0,
                captchas,
            }),
        }
    }

    fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn captchas(&self) -> u32 {
        self.captchas.load(Ordering::SeqCst)
    }

    fn settled(&self) -> usize {
        self.processed() + self.failed()
    }

    fn fail(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

struct WorkerPool {
    store: Arc<dyn RankStore>,
    executor: Arc<dyn ScrapeExecutor>,
    aggregator: ResultAggregator,
    queue: WorkQueue<Search>,
    rotator: ProxyRotator,
    gate: CaptchaGate,
    http: HttpSettings,
    poll: Duration,
    cancel: CancellationToken,
    progress: RunProgress,
    collected: Option<Mutex<Vec<RankRecord>>>,
}

impl WorkerPool {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
            || self.progress.settled() >= self.progress.total
            || self.rotator.alive() == 0
    }

    async fn process(self: &Arc<Self>, worker_id: usize, search: Search) {
        let Some(proxy) = self.rotator.next() else {
            warn!(worker_id, search_id = search.id, "no proxy left for search");
            self.progress.fail();
            return;
        };

        let outcome = tokio::select! {
            outcome = self.executor.execute(&search, &proxy, &self.gate, &self.http) => outcome,
            _ = self.cancel.cancelled() => Err(ScrapeError::Interrupted),
        };

        match outcome {
            Ok(result) => {
                self.record_captchas(result.captchas).await;
                self.aggregate(worker_id, search, result.urls).await;
            }
            Err(err) => {
                self.record_captchas(err.captchas()).await;
                if err.is_proxy_failure() {
                    self.rotator.evict(&proxy);
                }
                warn!(
                    worker_id,
                    search_id = search.id,
                    keyword = %search.keyword,
                    proxy = %proxy,
                    error = %err,
                    "search failed"
                );
                self.progress.fail();
            }
        }
    }

    async fn aggregate(self: &Arc<Self>, worker_id: usize, search: Search, urls: Vec<String>) {
        let pool = Arc::clone(self);
        let search_id = search.id;
        let joined =
            tokio::task::spawn_blocking(move || pool.aggregator.aggregate(&search, &urls)).await;
        match joined {
            Ok(Ok(records)) => {
                if let Some(collected) = &self.collected {
                    collected
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend(records);
                }
                self.progress.processed.fetch_add(1, Ordering::SeqCst);
                self.persist_progress().await;
            }
            Ok(Err(err)) => {
                error!(worker_id, search_id, error = %err, "failed to persist search result");
                self.progress.fail();
            }
            Err(err) => {
                error!(worker_id, search_id, error = %err, "aggregation job panicked");
                self.progress.fail();
            }
        }
    }

    async fn persist_progress(&self) {
        let mut persisted = self.progress.persisted.lock().await;
        let progress = percent(self.progress.processed(), self.progress.total);
        if progress <= persisted.progress {
            return;
        }
        let run_id = self.progress.run_id;
        let persisted_progress =
            blocking(&self.store, move |store| store.update_run_progress(run_id, progress)).await;
        match persisted_progress {
            Ok(()) => persisted.progress = progress,
            Err(err) => warn!(run_id, progress, error = %err, "failed to persist run progress"),
        }
    }

    async fn record_captchas(&self, count: u32) {
        if count == 0 {
            return;
        }
        self.progress.captchas.fetch_add(count, Ordering::SeqCst);
        let mut persisted = self.progress.persisted.lock().await;
        let captchas = self.progress.captchas();
        if captchas <= persisted.captchas {
            return;
        }
        let run_id = self.progress.run_id;
        let persisted_captchas =
            blocking(&self.store, move |store| store.update_run_captchas(run_id, captchas)).await;
        match persisted_captchas {
            Ok(()) => persisted.captchas = captchas,
            Err(err) => warn!(run_id, captchas, error = %err, "failed to persist captcha count"),
        }
    }
}

async fn run_worker(worker_id: usize, pool: Arc<WorkerPool>) {
    debug!(worker_id, "worker started");
    while !pool.should_stop() {
        let next = tokio::select! {
            unit = pool.queue.take(pool.poll) => unit,
            _ = pool.cancel.cancelled() => None,
        };
        match next {
            Some(search) => pool.process(worker_id, search).await,
            None if pool.queue.is_drained() => break,
            None => {}
        }
    }
    debug!(worker_id, "worker stopped");
}
