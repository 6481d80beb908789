use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serpwatch_core::{
    load_config, BestRank, GroupId, Proxy, RankRecord, RankStore, Run, RunId, Search, SearchId,
    SerpwatchConfig, SqliteRankStore, Target, TargetId, TargetPattern, TargetSummary,
};
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] serpwatch_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] serpwatch_core::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid target pattern: {0}")]
    Pattern(#[from] serpwatch_core::PatternError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "serpwatch rank-tracking control interface", long_about = None)]
pub struct Cli {
    /// Path to serpwatch.toml
    #[arg(long, default_value = "configs/serpwatch.toml")]
    pub config: PathBuf,
    /// Database override (replaces paths.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Creates the database schema
    Init,
    /// Shows the latest run
    Status,
    /// Run history
    #[command(subcommand)]
    Runs(RunCommands),
    /// Tracked searches
    #[command(subcommand)]
    Search(SearchCommands),
    /// Tracked targets
    #[command(subcommand)]
    Target(TargetCommands),
    /// Ranks recorded by a run
    #[command(subcommand)]
    Ranks(RankCommands),
    /// Target summaries of a run
    #[command(subcommand)]
    Summary(SummaryCommands),
    /// Best rank of a target for a search
    #[command(subcommand)]
    Best(BestCommands),
    /// Lists the configured proxies
    Proxies,
}

#[derive(Subcommand, Debug)]
pub enum RunCommands {
    List(RunListArgs),
}

#[derive(Args, Debug)]
pub struct RunListArgs {
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum SearchCommands {
    Add(SearchAddArgs),
}

#[derive(Args, Debug)]
pub struct SearchAddArgs {
    #[arg(long)]
    pub keyword: String,
    /// Group the search belongs to (repeatable)
    #[arg(long = "group", required = true)]
    pub groups: Vec<GroupId>,
}

#[derive(Subcommand, Debug)]
pub enum TargetCommands {
    Add(TargetAddArgs),
}

#[derive(Args, Debug)]
pub struct TargetAddArgs {
    #[arg(long)]
    pub group: GroupId,
    #[arg(long)]
    pub name: String,
    /// domain, subdomain, contains or regex
    #[arg(long, default_value = "domain")]
    pub kind: String,
    #[arg(long)]
    pub pattern: String,
}

#[derive(Subcommand, Debug)]
pub enum RankCommands {
    Show(RunArgs),
}

#[derive(Subcommand, Debug)]
pub enum SummaryCommands {
    Show(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long)]
    pub run: RunId,
}

#[derive(Subcommand, Debug)]
pub enum BestCommands {
    Show(BestShowArgs),
}

#[derive(Args, Debug)]
pub struct BestShowArgs {
    #[arg(long)]
    pub group: GroupId,
    #[arg(long)]
    pub target: TargetId,
    #[arg(long)]
    pub search: SearchId,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Init => {
            let report = context.init()?;
            render(&report, cli.format)?;
        }
        Commands::Status => {
            let status = context.status()?;
            render(&status, cli.format)?;
        }
        Commands::Runs(RunCommands::List(args)) => {
            let runs = context.runs_list(args)?;
            render(&runs, cli.format)?;
        }
        Commands::Search(SearchCommands::Add(args)) => {
            let search = context.search_add(args)?;
            render(&search, cli.format)?;
        }
        Commands::Target(TargetCommands::Add(args)) => {
            let target = context.target_add(args)?;
            render(&target, cli.format)?;
        }
        Commands::Ranks(RankCommands::Show(args)) => {
            let ranks = context.ranks_show(args)?;
            render(&ranks, cli.format)?;
        }
        Commands::Summary(SummaryCommands::Show(args)) => {
            let summaries = context.summary_show(args)?;
            render(&summaries, cli.format)?;
        }
        Commands::Best(BestCommands::Show(args)) => {
            let best = context.best_show(args)?;
            render(&best, cli.format)?;
        }
        Commands::Proxies => {
            let proxies = context.proxies()?;
            render(&proxies, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: SerpwatchConfig,
    database: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(&cli.config)?;
        let config_dir = cli
            .config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let database = match &cli.database {
            Some(path) => path.clone(),
            None => config.resolve_path(&config_dir, &config.paths.database),
        };
        Ok(Self { config, database })
    }

    fn store(&self) -> Result<SqliteRankStore> {
        if !self.database.exists() {
            return Err(AppError::NotFound(format!(
                "database {} (run `serpwatchctl init` first)",
                self.database.display()
            )));
        }
        let store = SqliteRankStore::builder()
            .path(&self.database)
            .create_if_missing(false)
            .build()?;
        Ok(store)
    }

    fn init(&self) -> Result<InitReport> {
        if let Some(parent) = self.database.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = SqliteRankStore::builder()
            .path(&self.database)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        info!(database = %self.database.display(), "schema applied");
        Ok(InitReport {
            database: self.database.display().to_string(),
        })
    }

    fn status(&self) -> Result<StatusReport> {
        let store = self.store()?;
        let latest = store.list_runs(1)?.into_iter().next();
        Ok(StatusReport {
            database: self.database.display().to_string(),
            searches: store.list_searches()?.len(),
            targets: store.list_targets()?.len(),
            latest_run: latest,
        })
    }

    fn runs_list(&self, args: &RunListArgs) -> Result<RunList> {
        let rows = self.store()?.list_runs(args.limit)?;
        Ok(RunList { rows })
    }

    fn search_add(&self, args: &SearchAddArgs) -> Result<Search> {
        let keyword = args.keyword.trim();
        if keyword.is_empty() {
            return Err(AppError::InvalidArgument("keyword is empty".to_string()));
        }
        Ok(self.store()?.insert_search(keyword, &args.groups)?)
    }

    fn target_add(&self, args: &TargetAddArgs) -> Result<TargetEntry> {
        let pattern = TargetPattern::parse(&args.kind, &args.pattern)?;
        let target = self.store()?.insert_target(args.group, &args.name, &pattern)?;
        Ok(TargetEntry::from(&target))
    }

    fn ranks_show(&self, args: &RunArgs) -> Result<RankList> {
        let store = self.store()?;
        ensure_run(&store, args.run)?;
        Ok(RankList {
            run_id: args.run,
            rows: store.list_ranks(args.run)?,
        })
    }

    fn summary_show(&self, args: &RunArgs) -> Result<SummaryList> {
        let store = self.store()?;
        ensure_run(&store, args.run)?;
        Ok(SummaryList {
            run_id: args.run,
            rows: store.list_summaries(args.run)?,
        })
    }

    fn best_show(&self, args: &BestShowArgs) -> Result<BestReport> {
        let best = self
            .store()?
            .get_best(args.group, args.target, args.search)?;
        Ok(BestReport {
            group_id: args.group,
            target_id: args.target,
            search_id: args.search,
            best,
        })
    }

    fn proxies(&self) -> Result<ProxyList> {
        let rows = self.config.proxies.parse()?;
        Ok(ProxyList {
            direct_fallback: rows.is_empty(),
            rows,
        })
    }
}

fn ensure_run(store: &SqliteRankStore, run_id: RunId) -> Result<Run> {
    store
        .get_run(run_id)?
        .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub database: String,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub searches: usize,
    pub targets: usize,
    pub latest_run: Option<Run>,
}

#[derive(Debug, Serialize)]
pub struct RunList {
    pub rows: Vec<Run>,
}

#[derive(Debug, Serialize)]
pub struct TargetEntry {
    pub id: TargetId,
    pub group_id: GroupId,
    pub name: String,
    pub kind: String,
    pub pattern: String,
}

impl From<&Target> for TargetEntry {
    fn from(target: &Target) -> Self {
        Self {
            id: target.id,
            group_id: target.group_id,
            name: target.name.clone(),
            kind: target.pattern.kind().to_string(),
            pattern: target.pattern.as_str().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RankList {
    pub run_id: RunId,
    pub rows: Vec<RankRecord>,
}

#[derive(Debug, Serialize)]
pub struct SummaryList {
    pub run_id: RunId,
    pub rows: Vec<TargetSummary>,
}

#[derive(Debug, Serialize)]
pub struct BestReport {
    pub group_id: GroupId,
    pub target_id: TargetId,
    pub search_id: SearchId,
    pub best: Option<BestRank>,
}

#[derive(Debug, Serialize)]
pub struct ProxyList {
    pub direct_fallback: bool,
    pub rows: Vec<Proxy>,
}

struct RunLine<'a>(&'a Run);

impl fmt::Display for RunLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.0;
        let finished = run
            .finished_at
            .as_ref()
            .map(timestamp)
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "#{id} {status} progress={progress}% errors={errors} captchas={captchas} started={started} finished={finished}",
            id = run.id,
            status = run.status,
            progress = run.progress,
            errors = run.errors,
            captchas = run.captchas,
            started = timestamp(&run.started_at),
        )
    }
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        format!("schema applied to {}", self.database)
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("database: {}", self.database),
            format!("searches: {} | targets: {}", self.searches, self.targets),
        ];
        match &self.latest_run {
            Some(run) => lines.push(format!("latest run: {}", RunLine(run))),
            None => lines.push("latest run: none".to_string()),
        }
        lines.join("\n")
    }
}

impl DisplayFallback for RunList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No runs recorded".to_string();
        }
        self.rows
            .iter()
            .map(|run| RunLine(run).to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for Search {
    fn display(&self) -> String {
        let groups = self
            .groups
            .iter()
            .map(|group| group.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("search #{} \"{}\" groups={}", self.id, self.keyword, groups)
    }
}

impl DisplayFallback for TargetEntry {
    fn display(&self) -> String {
        format!(
            "target #{} {} group={} {}={}",
            self.id, self.name, self.group_id, self.kind, self.pattern
        )
    }
}

impl DisplayFallback for RankList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No ranks for run #{}", self.run_id);
        }
        let mut lines = Vec::new();
        for record in &self.rows {
            lines.push(format!(
                "group={group} target={target} search={search} rank={rank} previous={previous} url={url}",
                group = record.group_id,
                target = record.target_id,
                search = record.search_id,
                rank = record.rank,
                previous = record.previous_rank,
                url = record.url.as_deref().unwrap_or("-"),
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SummaryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No summaries for run #{}", self.run_id);
        }
        let mut lines = Vec::new();
        for summary in &self.rows {
            lines.push(format!(
                "target={target} group={group} score={score:.2}% ({delta:+}bp) top3={top3} top10={top10} top100={top100} out={out}",
                target = summary.target_id,
                group = summary.group_id,
                score = f64::from(summary.score_bp) / 100.0,
                delta = summary.score_delta_bp(),
                top3 = summary.top3,
                top10 = summary.top10,
                top100 = summary.top100,
                out = summary.out,
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for BestReport {
    fn display(&self) -> String {
        match &self.best {
            Some(best) => format!(
                "best rank {} since {} url={}",
                best.rank,
                timestamp(&best.recorded_at),
                best.url.as_deref().unwrap_or("-")
            ),
            None => format!(
                "No best rank for group={} target={} search={}",
                self.group_id, self.target_id, self.search_id
            ),
        }
    }
}

impl DisplayFallback for ProxyList {
    fn display(&self) -> String {
        if self.direct_fallback {
            return "No proxy configured, runs use a direct connection".to_string();
        }
        self.rows
            .iter()
            .map(|proxy| proxy.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
