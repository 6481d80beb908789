use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serpwatch_core::{
    BestRank, CaptchaChallenge, CaptchaError, CaptchaGate, CaptchaSolution, CaptchaSolver,
    HttpSettings, Proxy, Rank, RankRecord, RankStore, RunController, RunId, RunStatus,
    ScrapeError, ScrapeExecutor, ScrapeResult, Search, SerpEntry, SerpSnapshot, SqliteRankStore,
    Target, TargetPattern, TaskMode, TaskOptions,
};
use tempfile::TempDir;

type Outcome = Result<Vec<&'static str>, &'static str>;

/// Answers each keyword with a canned outcome and records every call.
#[derive(Default)]
struct ScriptedExecutor {
    outcomes: HashMap<String, Outcome>,
    captchas_per_call: u32,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Proxy, bool)>>,
}

impl ScriptedExecutor {
    fn answering(outcomes: &[(&str, Outcome)]) -> Self {
        Self {
            outcomes: outcomes
                .iter()
                .map(|(keyword, outcome)| (keyword.to_string(), outcome.clone()))
                .collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(String, Proxy, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScrapeExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        search: &Search,
        proxy: &Proxy,
        captcha: &CaptchaGate,
        _http: &HttpSettings,
    ) -> Result<ScrapeResult, ScrapeError> {
        self.calls
            .lock()
            .unwrap()
            .push((search.keyword.clone(), proxy.clone(), captcha.is_present()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.outcomes.get(&search.keyword) {
            Some(Ok(urls)) => Ok(ScrapeResult {
                urls: urls.iter().map(|url| url.to_string()).collect(),
                captchas: self.captchas_per_call,
            }),
            Some(Err("proxy")) => Err(ScrapeError::Proxy {
                proxy: proxy.to_string(),
                reason: "connection refused".into(),
            }),
            Some(Err("captcha")) => Err(ScrapeError::Captcha { captchas: 1 }),
            Some(Err(reason)) => Err(ScrapeError::Network(reason.to_string())),
            None => Ok(ScrapeResult::default()),
        }
    }
}

/// Records the stored status of a run every time a search is executed.
struct StatusRecorder {
    store: Arc<SqliteRankStore>,
    run_id: RunId,
    seen: Mutex<Vec<RunStatus>>,
}

#[async_trait]
impl ScrapeExecutor for StatusRecorder {
    async fn execute(
        &self,
        _search: &Search,
        _proxy: &Proxy,
        _captcha: &CaptchaGate,
        _http: &HttpSettings,
    ) -> Result<ScrapeResult, ScrapeError> {
        let run = self.store.get_run(self.run_id).unwrap().unwrap();
        self.seen.lock().unwrap().push(run.status);
        Ok(ScrapeResult::default())
    }
}

struct RefusingSolver;

#[async_trait]
impl CaptchaSolver for RefusingSolver {
    fn friendly_name(&self) -> &str {
        "refusing"
    }

    fn init(&self) -> bool {
        false
    }

    async fn solve(&self, _challenge: &CaptchaChallenge) -> Result<CaptchaSolution, CaptchaError> {
        Err(CaptchaError::Unavailable)
    }

    fn close(&self) {}
}

fn setup_store() -> (TempDir, Arc<SqliteRankStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteRankStore::builder()
        .path(dir.path().join("runs.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    (dir, Arc::new(store))
}

fn seed(store: &SqliteRankStore, keywords: &[&str]) -> (Vec<Search>, Target) {
    let searches = keywords
        .iter()
        .map(|keyword| store.insert_search(keyword, &[1]).unwrap())
        .collect();
    let pattern = TargetPattern::parse("domain", "example.com").unwrap();
    let target = store.insert_target(1, "example", &pattern).unwrap();
    (searches, target)
}

fn options(max_threads: usize, mode: TaskMode) -> TaskOptions {
    TaskOptions {
        max_threads,
        shuffle: true,
        queue_poll: Duration::from_millis(20),
        http: HttpSettings::default(),
        mode,
    }
}

fn controller(
    store: &Arc<SqliteRankStore>,
    executor: Arc<ScriptedExecutor>,
    proxies: Vec<Proxy>,
    options: TaskOptions,
) -> RunController {
    RunController::new(store.clone(), executor, proxies, options)
}

fn proxies(count: usize) -> Vec<Proxy> {
    (0..count)
        .map(|index| format!("http://10.0.0.{}:3128", index + 1).parse().unwrap())
        .collect()
}

const HIT: &[&str] = &["https://a.com/", "https://example.com/page", "https://b.com/"];

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_searches_on_two_workers_succeed() {
    let (_dir, store) = setup_store();
    let (searches, target) = seed(&store, &["alpha", "beta", "gamma"]);
    let executor = Arc::new(ScriptedExecutor::answering(&[
        ("alpha", Ok(HIT.to_vec())),
        ("beta", Ok(HIT.to_vec())),
        ("gamma", Ok(vec!["https://c.com/"])),
    ]));

    let report = controller(&store, executor.clone(), proxies(2), options(2, TaskMode::Full))
        .run()
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::DoneSuccess);
    assert_eq!(report.run.progress, 100);
    assert_eq!(report.run.errors, 0);
    assert_eq!((report.total, report.processed, report.workers), (3, 3, 2));
    assert!(report.ranks.is_empty());
    assert_eq!(executor.calls().len(), 3);

    let stored = store.get_run(report.run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::DoneSuccess);
    assert_eq!(stored.progress, 100);
    assert!(stored.finished_at.is_some());

    let ranks = store.list_ranks(report.run.id).unwrap();
    assert_eq!(ranks.len(), 3);
    for search in &searches[..2] {
        assert_eq!(
            store.get_rank(report.run.id, 1, target.id, search.id).unwrap(),
            Rank::Ranked(2)
        );
    }
    assert_eq!(
        store.get_rank(report.run.id, 1, target.id, searches[2].id).unwrap(),
        Rank::Unranked
    );

    let summaries = store.list_summaries(report.run.id).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].top3, 2);
    assert_eq!(summaries[0].out, 1);
    assert_eq!(summaries[0].score_bp, (99 + 99) * 10_000 / 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_proxies_run_on_one_direct_worker() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "beta"]);
    let executor = Arc::new(ScriptedExecutor::default());

    let report = controller(&store, executor.clone(), Vec::new(), options(4, TaskMode::Full))
        .run()
        .await
        .unwrap();

    assert_eq!(report.workers, 1);
    assert_eq!(report.proxies_configured, 1);
    assert_eq!(report.run.status, RunStatus::DoneSuccess);
    assert!(executor
        .calls()
        .iter()
        .all(|(_, proxy, _)| *proxy == Proxy::Direct));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_count_is_clamped_to_proxies() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "beta", "gamma", "delta"]);
    let executor = Arc::new(ScriptedExecutor::default());

    let report = controller(&store, executor, proxies(3), options(8, TaskMode::Full))
        .run()
        .await
        .unwrap();

    assert_eq!(report.workers, 3);
    assert_eq!(report.processed, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn improvement_over_previous_run_updates_best() {
    let (_dir, store) = setup_store();
    let (searches, target) = seed(&store, &["alpha"]);
    let search_id = searches[0].id;

    let first = ScriptedExecutor::answering(&[(
        "alpha",
        Ok(vec![
            "https://1.com/",
            "https://2.com/",
            "https://3.com/",
            "https://4.com/",
            "https://example.com/old",
        ]),
    )]);
    let first = controller(&store, Arc::new(first), Vec::new(), options(1, TaskMode::Full))
        .run()
        .await
        .unwrap();
    assert_eq!(store.get_best(1, target.id, search_id).unwrap().unwrap().rank, Rank::Ranked(5));

    store
        .insert_best(&BestRank {
            group_id: 1,
            target_id: target.id,
            search_id,
            rank: Rank::Ranked(4),
            recorded_at: Utc::now(),
            url: None,
        })
        .unwrap();

    let second = ScriptedExecutor::answering(&[(
        "alpha",
        Ok(vec!["https://1.com/", "https://2.com/", "https://example.com/new"]),
    )]);
    let second = controller(&store, Arc::new(second), Vec::new(), options(1, TaskMode::Full))
        .run()
        .await
        .unwrap();

    let ranks = store.list_ranks(second.run.id).unwrap();
    assert_eq!(ranks[0].previous_rank, Rank::Ranked(5));
    assert_eq!(ranks[0].rank, Rank::Ranked(3));
    let best = store.get_best(1, target.id, search_id).unwrap().unwrap();
    assert_eq!(best.rank, Rank::Ranked(3));
    assert_eq!(best.url.as_deref(), Some("https://example.com/new"));

    let previous_score = store.list_summaries(first.run.id).unwrap()[0].score_bp;
    let summary = &store.list_summaries(second.run.id).unwrap()[0];
    assert_eq!(summary.previous_score_bp, previous_score);
    assert_eq!(summary.top_improvements.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_searches_finish_with_error_count() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "broken", "gamma"]);
    let executor = Arc::new(ScriptedExecutor::answering(&[
        ("alpha", Ok(HIT.to_vec())),
        ("broken", Err("timed out")),
    ]));

    let report = controller(&store, executor.clone(), proxies(2), options(2, TaskMode::Full))
        .run()
        .await
        .unwrap();

    assert_eq!(report.run.status, RunStatus::DoneWithError);
    assert_eq!(report.run.errors, 1);
    assert_eq!((report.processed, report.failed), (2, 1));
    assert_eq!(report.run.progress, 66);
    // Failures are not retried.
    assert_eq!(executor.calls().len(), 3);

    let stored = store.get_run(report.run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::DoneWithError);
    assert_eq!(stored.errors, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dead_proxies_are_evicted_until_exhaustion() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "beta", "gamma"]);
    let executor = Arc::new(ScriptedExecutor::answering(&[
        ("alpha", Err("proxy")),
        ("beta", Err("proxy")),
        ("gamma", Err("proxy")),
    ]));

    let report = controller(&store, executor.clone(), proxies(1), options(1, TaskMode::Full))
        .run()
        .await
        .unwrap();

    assert_eq!(report.proxies_evicted, 1);
    assert_eq!(report.run.status, RunStatus::DoneWithError);
    assert_eq!(report.run.errors, 3);
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_interrupts_in_flight_searches() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "beta", "gamma"]);
    let executor = Arc::new(ScriptedExecutor {
        delay: Some(Duration::from_secs(60)),
        ..ScriptedExecutor::default()
    });

    let controller = controller(&store, executor, proxies(2), options(2, TaskMode::Full));
    let token = controller.cancellation_token();
    let handle = tokio::spawn(controller.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run should stop after cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(report.run.status, RunStatus::DoneWithError);
    assert_eq!(report.processed, 0);
    assert_eq!(report.run.errors, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn captcha_solver_failing_init_is_dropped_and_captchas_counted() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "beta", "gamma"]);
    let executor = Arc::new(ScriptedExecutor {
        captchas_per_call: 2,
        ..ScriptedExecutor::answering(&[
            ("alpha", Ok(HIT.to_vec())),
            ("beta", Ok(vec!["https://c.com/"])),
            ("gamma", Err("captcha")),
        ])
    });

    let report = controller(&store, executor.clone(), proxies(2), options(2, TaskMode::Full))
        .with_captcha_solver(Arc::new(RefusingSolver))
        .run()
        .await
        .unwrap();

    assert!(executor.calls().iter().all(|(_, _, present)| !present));
    assert_eq!(report.captchas, 2 + 2 + 1);
    assert_eq!(report.run.status, RunStatus::DoneWithError);
    assert_eq!(store.get_run(report.run.id).unwrap().unwrap().captchas, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_dispatches_only_unchecked_searches() {
    let (_dir, store) = setup_store();
    let (searches, _target) = seed(&store, &["alpha", "beta", "gamma"]);
    let run = store.create_run(Utc::now()).unwrap();
    store
        .insert_serp(&SerpSnapshot {
            run_id: run.id,
            search_id: searches[0].id,
            captured_at: run.started_at,
            entries: vec![SerpEntry::new("https://example.com/")],
        })
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::default());
    let report = RunController::new(
        store.clone(),
        executor.clone(),
        Vec::new(),
        options(2, TaskMode::Resume { run_id: run.id }),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.run.id, run.id);
    assert_eq!(report.total, 2);
    assert_eq!(report.run.status, RunStatus::DoneSuccess);
    let mut keywords: Vec<_> = executor
        .calls()
        .into_iter()
        .map(|(keyword, _, _)| keyword)
        .collect();
    keywords.sort();
    assert_eq!(keywords, vec!["beta", "gamma"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_run_is_running_while_it_executes() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha", "beta"]);
    let mut run = store.create_run(Utc::now()).unwrap();
    run.status = RunStatus::DoneWithError;
    run.errors = 2;
    run.finished_at = Some(Utc::now());
    store.finish_run(&run).unwrap();

    let executor = Arc::new(StatusRecorder {
        store: store.clone(),
        run_id: run.id,
        seen: Mutex::new(Vec::new()),
    });
    let report = RunController::new(
        store.clone(),
        executor.clone(),
        Vec::new(),
        options(1, TaskMode::Resume { run_id: run.id }),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(
        *executor.seen.lock().unwrap(),
        vec![RunStatus::Running, RunStatus::Running]
    );
    assert_eq!(report.run.status, RunStatus::DoneSuccess);
    let stored = store.get_run(run.id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::DoneSuccess);
    assert_eq!(stored.errors, 0);
    assert!(stored.finished_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_result_write_leaves_search_for_resume() {
    let (_dir, store) = setup_store();
    let (searches, target) = seed(&store, &["alpha"]);
    // A fresh database hands out run id 1; a rank already stored there makes
    // the result write of "alpha" fail.
    store
        .insert_rank(&RankRecord {
            run_id: 1,
            group_id: 1,
            target_id: target.id,
            search_id: searches[0].id,
            rank: Rank::Unranked,
            previous_rank: Rank::Unranked,
            url: None,
        })
        .unwrap();
    let executor = Arc::new(ScriptedExecutor::answering(&[("alpha", Ok(HIT.to_vec()))]));

    let report = controller(&store, executor.clone(), Vec::new(), options(1, TaskMode::Full))
        .run()
        .await
        .unwrap();

    assert_eq!(report.run.id, 1);
    assert_eq!(report.run.status, RunStatus::DoneWithError);
    assert_eq!((report.processed, report.failed), (0, 1));
    let summary = &store.list_summaries(report.run.id).unwrap()[0];
    assert_eq!((summary.top3, summary.out, summary.score_bp), (0, 0, 0));
    assert!(store.get_best(1, target.id, searches[0].id).unwrap().is_none());
    assert_eq!(
        store.list_unchecked_searches(report.run.id).unwrap(),
        vec![searches[0].clone()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_workers_stop_as_soon_as_the_queue_is_drained() {
    let (_dir, store) = setup_store();
    seed(&store, &["alpha"]);
    let executor = Arc::new(ScriptedExecutor::default());
    let mut options = options(8, TaskMode::Full);
    options.queue_poll = Duration::from_secs(2);

    let started = std::time::Instant::now();
    let report = controller(&store, executor, proxies(8), options)
        .run()
        .await
        .unwrap();

    assert_eq!(report.workers, 8);
    assert_eq!(report.run.status, RunStatus::DoneSuccess);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resuming_unknown_run_fails_before_dispatch() {
    let (_dir, store) = setup_store();
    let executor = Arc::new(ScriptedExecutor::default());
    let result = RunController::new(
        store,
        executor.clone(),
        Vec::new(),
        options(1, TaskMode::Resume { run_id: 42 }),
    )
    .run()
    .await;
    assert!(result.is_err());
    assert!(executor.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_run_reports_every_rank() {
    let (_dir, store) = setup_store();
    let searches = vec![
        Search {
            id: 100,
            keyword: "alpha".into(),
            groups: vec![9],
        },
        Search {
            id: 101,
            keyword: "beta".into(),
            groups: vec![9],
        },
    ];
    let targets = vec![
        Target {
            id: 500,
            group_id: 9,
            name: "example".into(),
            pattern: TargetPattern::parse("subdomain", "example.com").unwrap(),
        },
        Target {
            id: 501,
            group_id: 9,
            name: "b".into(),
            pattern: TargetPattern::parse("contains", "b.com").unwrap(),
        },
    ];
    let executor = Arc::new(ScriptedExecutor::answering(&[
        ("alpha", Ok(HIT.to_vec())),
        ("beta", Ok(vec![])),
    ]));

    let report = RunController::new(
        store.clone(),
        executor,
        Vec::new(),
        options(2, TaskMode::Custom { searches, targets }),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.run.status, RunStatus::DoneSuccess);
    let mut ranks: Vec<RankRecord> = report.ranks.clone();
    ranks.sort_by_key(|record| (record.search_id, record.target_id));
    let observed: Vec<_> = ranks
        .iter()
        .map(|record| (record.search_id, record.target_id, record.rank))
        .collect();
    assert_eq!(
        observed,
        vec![
            (100, 500, Rank::Ranked(2)),
            (100, 501, Rank::Ranked(3)),
            (101, 500, Rank::Unranked),
            (101, 501, Rank::Unranked),
        ]
    );
    let summaries = store.list_summaries(report.run.id).unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].score_bp, 99 * 10_000 / 200);
}
