//! Daily ingestion and rating pipeline: configuration, the run driver and scheduling.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use papersift_adapters::arxiv::DEFAULT_CATEGORY;
use papersift_adapters::{
    previous_working_day, ArxivProducer, HuggingFaceProducer, ItemSink, SourceProducer,
    SubmissionWindow,
};
use papersift_core::{RatingResult, Source, WorkItem};
use papersift_rater::{
    ChatEndpointConfig, DecodingParams, OpenAiCompatClient, RatingClient, RatingError, Rubric,
};
use papersift_storage::{
    FeishuClient, FeishuConfig, HttpClientConfig, HttpFetcher, ResultDumpStore, RubricSource,
    TableDestination, TableSink,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod coordinator;
pub mod queue;
pub mod sink;
pub mod worker;

pub use coordinator::{PipelineState, ProducerGuard, ResultCollection, RunTally, TallySnapshot};
pub use queue::{DoneGuard, WorkQueue};
pub use sink::{flush, persist_source, SourceOutcome};
pub use worker::{spawn_workers, WorkerContext, DEFAULT_POP_TIMEOUT, DEFAULT_WORKERS};

pub const CRATE_NAME: &str = "papersift-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    pub enabled: bool,
    pub destination: TableDestination,
    /// arXiv category to query.
    #[serde(default)]
    pub category: Option<String>,
    /// Hugging Face listing date; defaults to the previous working day.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Override for the source's API or site root.
    #[serde(default)]
    pub base_url: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        for (i, entry) in registry.sources.iter().enumerate() {
            if registry.sources[..i].iter().any(|s| s.source == entry.source) {
                bail!("source `{}` is listed more than once", entry.source);
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source: Source) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source == source)
    }
}

impl SourceConfig {
    /// Crawler for this source as of `today`.
    pub fn producer(&self, today: NaiveDate) -> Arc<dyn SourceProducer> {
        match self.source {
            Source::Arxiv => {
                let category = self.category.as_deref().unwrap_or(DEFAULT_CATEGORY);
                let mut producer = ArxivProducer::new(category, SubmissionWindow::for_run_date(today));
                if let Some(base) = &self.base_url {
                    producer = producer.with_api_base(base.as_str());
                }
                Arc::new(producer)
            }
            Source::HuggingFace => {
                let date = self.date.unwrap_or_else(|| previous_working_day(today));
                let mut producer = HuggingFaceProducer::new(date);
                if let Some(base) = &self.base_url {
                    producer = producer.with_base_url(base.as_str());
                }
                Arc::new(producer)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub feishu_base_url: String,
    pub feishu_app_id: Option<String>,
    pub feishu_app_secret: Option<String>,
    pub rating_sop_doc_token: Option<String>,
    pub job_tag_doc_token: Option<String>,
    pub rater_api_key: Option<String>,
    pub rater_base_url: String,
    pub rater_model: Option<String>,
    pub rater_timeout_secs: u64,
    pub decoding: DecodingParams,
    pub workers: usize,
    pub pop_timeout_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub results_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub workspace_root: PathBuf,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("{key} must be set"))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = DecodingParams::default();
        Self {
            feishu_base_url: std::env::var("FEISHU_BASE_URL")
                .unwrap_or_else(|_| papersift_storage::feishu::DEFAULT_BASE_URL.to_string()),
            feishu_app_id: env_opt("FEISHU_APP_ID"),
            feishu_app_secret: env_opt("FEISHU_APP_SECRET"),
            rating_sop_doc_token: env_opt("RATING_SOP_DOC_TOKEN"),
            job_tag_doc_token: env_opt("JOB_TAG_DOC_TOKEN"),
            rater_api_key: env_opt("RATER_API_KEY"),
            rater_base_url: std::env::var("RATER_BASE_URL")
                .unwrap_or_else(|_| papersift_rater::completion::DEFAULT_BASE_URL.to_string()),
            rater_model: env_opt("RATER_MODEL"),
            rater_timeout_secs: env_parse("RATER_TIMEOUT_SECS", 180),
            decoding: DecodingParams {
                temperature: env_parse("RATER_TEMPERATURE", defaults.temperature),
                top_p: env_parse("RATER_TOP_P", defaults.top_p),
                seed: env_parse("RATER_SEED", defaults.seed),
            },
            workers: env_parse("PAPERSIFT_WORKERS", DEFAULT_WORKERS).max(1),
            pop_timeout_secs: env_parse("PAPERSIFT_POP_TIMEOUT_SECS", DEFAULT_POP_TIMEOUT.as_secs()),
            user_agent: std::env::var("PAPERSIFT_USER_AGENT")
                .unwrap_or_else(|_| "papersift-bot/0.1".to_string()),
            http_timeout_secs: env_parse("PAPERSIFT_HTTP_TIMEOUT_SECS", 30),
            results_dir: std::env::var("RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./results")),
            scheduler_enabled: std::env::var("PAPERSIFT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("PAPERSIFT_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 9 * * Mon-Fri".to_string()),
            workspace_root: std::env::var("PAPERSIFT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn settings(&self) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            workers: self.workers,
            pop_timeout: Duration::from_secs(self.pop_timeout_secs),
            results_dir: self.results_dir.clone(),
            sop_doc_token: required(&self.rating_sop_doc_token, "RATING_SOP_DOC_TOKEN")?.to_string(),
            tag_doc_token: required(&self.job_tag_doc_token, "JOB_TAG_DOC_TOKEN")?.to_string(),
        })
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }

    pub async fn feishu_client(&self) -> Result<FeishuClient> {
        let mut feishu = FeishuConfig::new(
            required(&self.feishu_app_id, "FEISHU_APP_ID")?,
            required(&self.feishu_app_secret, "FEISHU_APP_SECRET")?,
        );
        feishu.base_url = self.feishu_base_url.clone();
        FeishuClient::connect(feishu)
            .await
            .context("exchanging feishu app access token")
    }

    pub fn rating_client(&self) -> Result<RatingClient> {
        let mut endpoint = ChatEndpointConfig::new(required(&self.rater_api_key, "RATER_API_KEY")?);
        endpoint.base_url = self.rater_base_url.clone();
        endpoint.timeout = Duration::from_secs(self.rater_timeout_secs);
        let completion = OpenAiCompatClient::new(endpoint).context("building completion client")?;
        Ok(RatingClient::new(
            Arc::new(completion),
            required(&self.rater_model, "RATER_MODEL")?,
            self.decoding,
        ))
    }

    pub async fn load_source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.workspace_root.join("sources.yaml")).await
    }
}

/// Run-shape knobs for [`SyncPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub pop_timeout: Duration,
    pub results_dir: PathBuf,
    pub sop_doc_token: String,
    pub tag_doc_token: String,
}

/// One enabled source: how to crawl it and where its results go.
#[derive(Clone)]
pub struct SourceLane {
    pub producer: Arc<dyn SourceProducer>,
    pub destination: TableDestination,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub source: Source,
    pub period_label: String,
    pub pushed: usize,
    pub producer_error: Option<String>,
    pub persisted: SourceOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workers: usize,
    pub pushed: usize,
    pub tally: TallySnapshot,
    pub sources: Vec<SourceSummary>,
    #[serde(skip)]
    pub manifest_path: PathBuf,
}

impl SyncRunSummary {
    pub fn source(&self, source: Source) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.source == source)
    }
}

/// Counts what one producer pushes, whether or not it finishes cleanly.
struct CountingSink<'a> {
    queue: &'a WorkQueue,
    pushed: &'a AtomicUsize,
}

impl ItemSink for CountingSink<'_> {
    fn push(&self, item: WorkItem) {
        self.pushed.fetch_add(1, Ordering::SeqCst);
        self.queue.push(item);
    }
}

/// Collects items in memory; used for dry-run crawls.
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Mutex<Vec<WorkItem>>,
}

impl CollectingSink {
    pub fn into_items(self) -> Vec<WorkItem> {
        self.items.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ItemSink for CollectingSink {
    fn push(&self, item: WorkItem) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }
}

pub struct SyncPipeline {
    settings: PipelineSettings,
    http: Arc<HttpFetcher>,
    rubric_source: Arc<dyn RubricSource>,
    table: Arc<dyn TableSink>,
    rater: RatingClient,
    store: ResultDumpStore,
    lanes: Vec<SourceLane>,
}

impl SyncPipeline {
    pub fn new(
        settings: PipelineSettings,
        http: HttpFetcher,
        rubric_source: Arc<dyn RubricSource>,
        table: Arc<dyn TableSink>,
        rater: RatingClient,
    ) -> Self {
        let store = ResultDumpStore::new(settings.results_dir.clone());
        Self {
            settings,
            http: Arc::new(http),
            rubric_source,
            table,
            rater,
            store,
            lanes: Vec::new(),
        }
    }

    /// Add a source lane. Each source may appear once per run; its dump file and
    /// result collection are keyed by source.
    pub fn with_source(
        mut self,
        producer: Arc<dyn SourceProducer>,
        destination: TableDestination,
    ) -> Result<Self> {
        let source = producer.source();
        if self.lanes.iter().any(|lane| lane.producer.source() == source) {
            bail!("source {source} is already wired into this pipeline");
        }
        self.lanes.push(SourceLane {
            producer,
            destination,
        });
        Ok(self)
    }

    /// Wire every enabled source from `sources.yaml` and the live services from the env.
    pub async fn from_config(config: &SyncConfig, today: NaiveDate) -> Result<Self> {
        let registry = config.load_source_registry().await?;
        let feishu = Arc::new(config.feishu_client().await?);
        let mut pipeline = Self::new(
            config.settings()?,
            config.http_fetcher()?,
            feishu.clone(),
            feishu,
            config.rating_client()?,
        );
        for source in registry.enabled() {
            pipeline = pipeline.with_source(source.producer(today), source.destination.clone())?;
        }
        if pipeline.lanes.is_empty() {
            warn!("sources.yaml enables no sources; the run will only write empty manifests");
        }
        Ok(pipeline)
    }

    pub async fn fetch_rubric(&self) -> Result<Rubric> {
        let sop = self
            .rubric_source
            .fetch_document(&self.settings.sop_doc_token)
            .await
            .context("fetching rating SOP document")?;
        let tags = self
            .rubric_source
            .fetch_document(&self.settings.tag_doc_token)
            .await
            .context("fetching role tag document")?;
        Ok(Rubric::new(sop, tags))
    }

    /// Crawl, rate and persist once.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = self.lanes.len(), workers = self.settings.workers, "run started");

        let rubric = self.fetch_rubric().await?;
        let state = Arc::new(PipelineState::new(self.lanes.len()));

        let mut producers = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            let producer = Arc::clone(&lane.producer);
            let source = producer.source();
            let pushed = Arc::new(AtomicUsize::new(0));
            let guard = state.producer_guard(source);
            let task = {
                let state = Arc::clone(&state);
                let http = Arc::clone(&self.http);
                let pushed = Arc::clone(&pushed);
                tokio::spawn(async move {
                    let _guard = guard;
                    let sink = CountingSink {
                        queue: &state.queue,
                        pushed: &pushed,
                    };
                    producer.produce(&http, &sink).await.map_err(|err| {
                        warn!(%source, error = %err, "producer stopped early; keeping items already queued");
                        err.to_string()
                    })
                })
            };
            producers.push((source, lane.producer.period_label(), pushed, task));
        }

        let ctx = Arc::new(WorkerContext {
            state: Arc::clone(&state),
            rater: self.rater.clone(),
            rubric,
            pop_timeout: self.settings.pop_timeout,
        });
        let mut workers = spawn_workers(ctx, self.settings.workers);

        let mut produced = Vec::with_capacity(producers.len());
        for (source, period_label, pushed, task) in producers {
            let producer_error = match task.await {
                Ok(Ok(_)) => None,
                Ok(Err(err)) => Some(err),
                Err(join_err) => {
                    error!(%source, error = %join_err, "producer task aborted");
                    Some(join_err.to_string())
                }
            };
            produced.push((source, period_label, pushed.load(Ordering::SeqCst), producer_error));
        }
        info!(pushed = state.queue.total_pushed(), "all producers finished; draining queue");

        state.queue.join().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "rating worker aborted");
            }
        }

        let tally = state.tally.snapshot();
        let pushed = state.queue.total_pushed();
        if tally.accounted() != pushed {
            warn!(pushed, accounted = tally.accounted(), "item accounting mismatch");
        }

        let mut sources = Vec::with_capacity(produced.len());
        for ((source, period_label, pushed, producer_error), lane) in produced.into_iter().zip(&self.lanes) {
            let results = state.collection(source).freeze();
            let persisted =
                persist_source(&self.store, self.table.as_ref(), source, &results, &lane.destination).await;
            sources.push(SourceSummary {
                source,
                period_label,
                pushed,
                producer_error,
                persisted,
            });
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            workers: self.settings.workers,
            pushed,
            tally,
            sources,
            manifest_path: self.store.root().join("manifest.json"),
        };
        self.store
            .write_json("manifest.json", &summary)
            .await
            .context("writing run manifest")?;

        let failed: Vec<String> = summary
            .sources
            .iter()
            .filter_map(|s| s.persisted.error.as_ref().map(|e| format!("{}: {e}", s.source)))
            .collect();
        if !failed.is_empty() {
            bail!("persisting results failed ({})", failed.join("; "));
        }

        info!(
            %run_id,
            rated = tally.rated,
            failed = tally.failed(),
            skipped = tally.skipped,
            "run finished"
        );
        Ok(summary)
    }

    /// Rate specific links against the live rubric without touching the tables.
    pub async fn rate_links(&self, links: &[String]) -> Result<Vec<(String, Result<RatingResult, RatingError>)>> {
        let rubric = self.fetch_rubric().await?;
        let period_label = Local::now().date_naive().format("%Y-%m-%d").to_string();
        let mut rated = Vec::with_capacity(links.len());
        for link in links {
            let outcome = self.rater.rate(&rubric, link, &period_label).await;
            rated.push((link.clone(), outcome));
        }
        Ok(rated)
    }
}

/// Crawl one source and return its items without rating them.
pub async fn crawl_links(producer: &dyn SourceProducer, http: &HttpFetcher) -> Result<Vec<WorkItem>> {
    let sink = CollectingSink::default();
    let pushed = producer
        .produce(http, &sink)
        .await
        .with_context(|| format!("crawling {}", producer.source()))?;
    info!(source = %producer.source(), pushed, "crawl finished");
    Ok(sink.into_items())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config, Local::now().date_naive()).await?;
    pipeline.run_once().await
}

/// Daily job running one full pipeline pass, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, |_uuid, _l| {
        Box::pin(async move {
            match run_sync_once_from_env().await {
                Ok(summary) => info!(run_id = %summary.run_id, rated = summary.tally.rated, "scheduled run finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Run the scheduler until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let Some(mut sched) = maybe_build_scheduler(&config).await? else {
        bail!("scheduler is disabled; set PAPERSIFT_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
