//! Report assembly and per-stream run orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use spotcheck_adapters::{
    AdapterError, Bill, BillChecker, BillId, Calendar, CalendarChecker, CalendarId, Checker,
    SenateSiteBill, SenateSiteCalendar, SenateSiteJsonParser, SnapshotParser,
};
use spotcheck_core::{
    ContentKey, Dump, Keyed, Mismatch, MismatchType, Observation, ParseIdError, ReferenceType,
    Report, ReportBuilder, ReportId, ReportView, SortOrder, UpdateKind,
};
use spotcheck_storage::{
    DumpProvider, EntityFetchError, EntityStore, FsDumpProvider, FsReportStore, MemoryLocalData,
    ReportStore, StorageError, UpdateIndex,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spotcheck-engine";

const STREAM_REGISTRY_FILE: &str = "spotcheck.yaml";
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    #[default]
    Claim,
    LeavePending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub reference_type: ReferenceType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub parse_failure: ParseFailurePolicy,
    /// Which update timestamp places an id inside a dump's window.
    #[serde(default)]
    pub update_kind: UpdateKind,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl StreamConfig {
    pub fn new(reference_type: ReferenceType) -> Self {
        Self {
            reference_type,
            enabled: true,
            cron: None,
            parse_failure: ParseFailurePolicy::default(),
            update_kind: UpdateKind::default(),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamRegistryFile {
    pub streams: Vec<StreamConfig>,
}

impl StreamRegistryFile {
    pub fn enabled(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SpotcheckConfig {
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub fetch_timeout_secs: u64,
    pub fetch_concurrency: usize,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

impl SpotcheckConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("SPOTCHECK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            scheduler_enabled: lookup("SPOTCHECK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: lookup("SPOTCHECK_CRON").unwrap_or_else(|| "0 0 * * * *".to_string()),
            fetch_timeout_secs: lookup("SPOTCHECK_FETCH_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            fetch_concurrency: lookup("SPOTCHECK_FETCH_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(8),
            web_port: lookup("SPOTCHECK_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            workspace_root: lookup("SPOTCHECK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn dumps_dir(&self) -> PathBuf {
        self.data_dir.join("dumps")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn local_data_path(&self, reference_type: ReferenceType) -> PathBuf {
        self.data_dir
            .join("local")
            .join(format!("{}.json", reference_type.as_str()))
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            fetch_concurrency: self.fetch_concurrency,
        }
    }

    pub async fn load_stream_registry(&self) -> Result<StreamRegistryFile> {
        let path = self.workspace_root.join(STREAM_REGISTRY_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub fetch_timeout: Duration,
    pub fetch_concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            fetch_concurrency: 8,
        }
    }
}

/// What a run had accumulated when it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunContext {
    pub reference_type: ReferenceType,
    pub run_id: Uuid,
    pub dump_id: Option<String>,
    pub candidates: usize,
    pub observations: usize,
}

impl RunContext {
    pub fn new(reference_type: ReferenceType, run_id: Uuid) -> Self {
        Self {
            reference_type,
            run_id,
            dump_id: None,
            candidates: 0,
            observations: 0,
        }
    }
}

impl fmt::Display for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reference_type={} run_id={} dump={} candidates={} observations={}",
            self.reference_type,
            self.run_id,
            self.dump_id.as_deref().unwrap_or("-"),
            self.candidates,
            self.observations
        )
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reference data unavailable: {reason} ({context})")]
    ReferenceDataUnavailable { reason: String, context: RunContext },
    #[error("run cancelled ({context})")]
    Cancelled { context: RunContext },
    #[error("dump fetch failed ({context}): {source}")]
    DumpFetch {
        source: StorageError,
        context: RunContext,
    },
    #[error("dump parse failed ({context}, claimed={claimed}): {source}")]
    Parse {
        source: AdapterError,
        context: RunContext,
        claimed: bool,
    },
    #[error("local data unavailable ({context}): {source}")]
    LocalData {
        source: StorageError,
        context: RunContext,
    },
    #[error("report persistence failed ({context}): {source}")]
    Persistence {
        source: StorageError,
        context: RunContext,
    },
    #[error("claiming dump failed after report was stored ({context}): {source}")]
    Claim {
        source: StorageError,
        context: RunContext,
    },
}

impl ReportError {
    pub fn context(&self) -> &RunContext {
        match self {
            Self::ReferenceDataUnavailable { context, .. }
            | Self::Cancelled { context }
            | Self::DumpFetch { context, .. }
            | Self::Parse { context, .. }
            | Self::LocalData { context, .. }
            | Self::Persistence { context, .. }
            | Self::Claim { context, .. } => context,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReferenceDataUnavailable { .. } => "reference_data_unavailable",
            Self::Cancelled { .. } => "cancelled",
            Self::DumpFetch { .. } => "dump_fetch_failure",
            Self::Parse { .. } => "parse_failure",
            Self::LocalData { .. } => "local_data_failure",
            Self::Persistence { .. } => "persistence_failure",
            Self::Claim { .. } => "claim_failure",
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    InvalidContentId(#[from] ParseIdError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    Stored {
        report_id: ReportId,
        open_mismatches: usize,
    },
    Failed {
        reference_type: ReferenceType,
        reason: String,
    },
}

/// Aborts an in-flight run at its next stage boundary, before the dump is claimed.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    fn check(&self, context: &RunContext) -> Result<(), ReportError> {
        if self.is_cancelled() {
            warn!(%context, "run cancelled");
            return Err(ReportError::Cancelled {
                context: context.clone(),
            });
        }
        Ok(())
    }
}

/// Complete dump with the latest coverage end.
pub fn select_most_recent_complete(dumps: &[Dump]) -> Option<&Dump> {
    dumps
        .iter()
        .filter(|d| d.complete)
        .max_by(|a, b| (a.coverage.to, &a.id).cmp(&(b.coverage.to, &b.id)))
}

/// Marks a dump processed at most once per run.
struct DumpClaim {
    dump: Dump,
    claimed: bool,
}

impl DumpClaim {
    fn new(dump: Dump) -> Self {
        Self {
            dump,
            claimed: false,
        }
    }

    async fn claim(&mut self, provider: &dyn DumpProvider) -> Result<(), StorageError> {
        if self.claimed {
            return Ok(());
        }
        let changed = provider.mark_processed(&self.dump).await?;
        self.claimed = true;
        if !changed {
            debug!(dump_id = %self.dump.id, "dump was already claimed");
        }
        Ok(())
    }
}

fn observe_data_missing(err: &EntityFetchError) -> Mismatch {
    match err {
        EntityFetchError::NotFound => Mismatch::missing(MismatchType::ObserveDataMissing),
        other => Mismatch::new(MismatchType::ObserveDataMissing, "", other.to_string()),
    }
}

/// Builds one report from a dump payload and the local system of record.
pub struct ReportAssembler<K: ContentKey, E, R> {
    reference_type: ReferenceType,
    updates: Arc<dyn UpdateIndex<K>>,
    entities: Arc<dyn EntityStore<K, E>>,
    parser: Arc<dyn SnapshotParser<R>>,
    checker: Arc<dyn Checker<E, R>>,
    options: RunOptions,
    update_kind: UpdateKind,
}

impl<K, E, R> ReportAssembler<K, E, R>
where
    K: ContentKey,
    E: Send + Sync + 'static,
    R: Keyed<K> + Send + Sync + 'static,
{
    pub fn new(
        reference_type: ReferenceType,
        updates: Arc<dyn UpdateIndex<K>>,
        entities: Arc<dyn EntityStore<K, E>>,
        parser: Arc<dyn SnapshotParser<R>>,
        checker: Arc<dyn Checker<E, R>>,
    ) -> Self {
        Self {
            reference_type,
            updates,
            entities,
            parser,
            checker,
            options: RunOptions::default(),
            update_kind: UpdateKind::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_update_kind(mut self, update_kind: UpdateKind) -> Self {
        self.update_kind = update_kind;
        self
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.reference_type
    }

    /// Ids updated locally within the dump's coverage: after `from`, no later than `to`.
    pub async fn candidates(&self, dump: &Dump) -> Result<BTreeSet<K>, StorageError> {
        let tokens = self
            .updates
            .list_update_tokens(dump.coverage.from, self.update_kind)
            .await?;
        Ok(tokens
            .into_iter()
            .filter(|t| {
                t.timestamp(self.update_kind)
                    .is_some_and(|at| dump.coverage.contains_update(at))
            })
            .map(|t| t.content_id)
            .collect())
    }

    async fn fetch_entities(
        &self,
        candidates: &BTreeSet<K>,
    ) -> BTreeMap<K, Result<E, EntityFetchError>> {
        let semaphore = Arc::new(Semaphore::new(self.options.fetch_concurrency.max(1)));
        let timeout = self.options.fetch_timeout;
        let mut tasks = JoinSet::new();
        for content_id in candidates {
            let store = Arc::clone(&self.entities);
            let semaphore = Arc::clone(&semaphore);
            let content_id = content_id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = match tokio::time::timeout(timeout, store.get_entity(&content_id)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(EntityFetchError::Timeout(timeout)),
                };
                (content_id, result)
            });
        }

        let mut fetched = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((content_id, result)) => {
                    if let Err(err) = &result {
                        debug!(%content_id, error = %err, "local entity unavailable");
                    }
                    fetched.insert(content_id, result);
                }
                Err(err) => warn!(error = %err, "entity fetch task failed"),
            }
        }
        for content_id in candidates {
            fetched.entry(content_id.clone()).or_insert_with(|| {
                Err(EntityFetchError::Backend(
                    "fetch task did not complete".to_string(),
                ))
            });
        }
        fetched
    }

    pub async fn assemble(
        &self,
        dump: &Dump,
        payload: &[u8],
        context: &mut RunContext,
        cancel: &CancelHandle,
    ) -> Result<Report<K>, ReportError> {
        let candidates = self
            .candidates(dump)
            .await
            .map_err(|source| ReportError::LocalData {
                source,
                context: context.clone(),
            })?;
        context.candidates = candidates.len();
        info!(candidates = candidates.len(), dump_id = %dump.id, "candidate set derived");
        cancel.check(context)?;

        let mut local = self.fetch_entities(&candidates).await;
        let failed = local.values().filter(|r| r.is_err()).count();
        info!(fetched = local.len() - failed, failed, "local entities fetched");
        cancel.check(context)?;

        let records = self
            .parser
            .parse(dump, payload)
            .map_err(|source| ReportError::Parse {
                source,
                context: context.clone(),
                claimed: false,
            })?;
        let parsed = records.len();
        let mut reference = BTreeMap::new();
        for record in records {
            let content_id = record.content_id();
            if reference.contains_key(&content_id) {
                warn!(%content_id, "duplicate reference record, keeping the first");
                continue;
            }
            reference.insert(content_id, record);
        }

        let mut builder = ReportBuilder::new(ReportId::new(
            self.reference_type,
            dump.coverage.to,
            Utc::now(),
        ));
        builder.add_note(format!("dump: {}", dump.id));
        let ignored = reference
            .keys()
            .filter(|id| !candidates.contains(*id))
            .map(|id| id.to_string())
            .collect::<Vec<_>>();
        if !ignored.is_empty() {
            builder.add_note(format!("ignored: {}", ignored.join(", ")));
        }

        let mut missing = 0usize;
        for content_id in candidates {
            let entity = match local.remove(&content_id) {
                Some(Ok(entity)) => entity,
                Some(Err(err)) => {
                    builder.add_observation(Observation::with_mismatch(
                        content_id,
                        observe_data_missing(&err),
                    ));
                    continue;
                }
                None => continue,
            };
            match reference.get(&content_id) {
                Some(record) => {
                    let mut observation = Observation::new(content_id);
                    for mismatch in self.checker.check(&entity, record) {
                        observation.add_mismatch(mismatch);
                    }
                    builder.add_observation(observation);
                }
                None => {
                    missing += 1;
                    builder.add_observation(Observation::with_mismatch(
                        content_id,
                        Mismatch::missing(MismatchType::ReferenceDataMissing),
                    ));
                }
            }
        }

        context.observations = builder.observation_count();
        info!(
            parsed,
            ignored = ignored.len(),
            missing,
            observations = builder.observation_count(),
            mismatches = builder.mismatch_count(),
            "report assembled"
        );
        Ok(builder.finish())
    }
}

/// Runs reports for one reference type. At most one run is in flight at a time.
pub struct ReportService<K: ContentKey, E, R> {
    config: StreamConfig,
    assembler: ReportAssembler<K, E, R>,
    dumps: Arc<dyn DumpProvider>,
    store: Arc<dyn ReportStore<K>>,
    run_lock: Mutex<()>,
    cancel: CancelHandle,
    events: broadcast::Sender<ReportEvent>,
}

impl<K, E, R> ReportService<K, E, R>
where
    K: ContentKey,
    E: Send + Sync + 'static,
    R: Keyed<K> + Send + Sync + 'static,
{
    pub fn new(
        config: StreamConfig,
        assembler: ReportAssembler<K, E, R>,
        dumps: Arc<dyn DumpProvider>,
        store: Arc<dyn ReportStore<K>>,
        events: broadcast::Sender<ReportEvent>,
    ) -> Self {
        Self {
            config,
            assembler,
            dumps,
            store,
            run_lock: Mutex::new(()),
            cancel: CancelHandle::default(),
            events,
        }
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.assembler.reference_type()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<dyn ReportStore<K>> {
        &self.store
    }

    pub async fn generate(&self) -> Result<Report<K>, ReportError> {
        let _guard = self.run_lock.lock().await;
        self.cancel.reset();
        let run_id = Uuid::new_v4();
        let reference_type = self.reference_type();
        let span = info_span!("spotcheck_run", %run_id, reference_type = %reference_type);
        let result = self.run(run_id).instrument(span).await;
        self.cancel.reset();

        let event = match &result {
            Ok(report) => ReportEvent::Stored {
                report_id: report.report_id.clone(),
                open_mismatches: report.open_mismatch_count(false),
            },
            Err(err) => {
                error!(kind = err.kind(), error = %err, "spotcheck run failed");
                ReportEvent::Failed {
                    reference_type,
                    reason: err.to_string(),
                }
            }
        };
        let _ = self.events.send(event);
        result
    }

    async fn run(&self, run_id: Uuid) -> Result<Report<K>, ReportError> {
        let reference_type = self.reference_type();
        let mut context = RunContext::new(reference_type, run_id);

        let pending = self
            .dumps
            .list_pending(reference_type)
            .await
            .map_err(|source| ReportError::DumpFetch {
                source,
                context: context.clone(),
            })?;
        let latest = self
            .store
            .latest_reference_time(reference_type)
            .await
            .map_err(|source| ReportError::Persistence {
                source,
                context: context.clone(),
            })?;
        let (superseded, fresh): (Vec<Dump>, Vec<Dump>) = pending
            .into_iter()
            .partition(|d| latest.is_some_and(|t| d.coverage.to <= t));
        for dump in &superseded {
            DumpClaim::new(dump.clone())
                .claim(self.dumps.as_ref())
                .await
                .map_err(|source| ReportError::Claim {
                    source,
                    context: context.clone(),
                })?;
            info!(dump_id = %dump.id, to = %dump.coverage.to, "superseded dump claimed");
        }

        let dump = match select_most_recent_complete(&fresh) {
            Some(dump) => dump.clone(),
            None => {
                let reason = match latest {
                    Some(t) if !superseded.is_empty() => format!(
                        "no complete dump newer than the report for {}; {} superseded dump(s) claimed",
                        t.to_rfc3339(),
                        superseded.len()
                    ),
                    _ => format!(
                        "no complete dump among {} pending",
                        superseded.len() + fresh.len()
                    ),
                };
                return Err(ReportError::ReferenceDataUnavailable { reason, context });
            }
        };
        context.dump_id = Some(dump.id.clone());
        info!(dump_id = %dump.id, to = %dump.coverage.to, "dump selected");
        let mut claim = DumpClaim::new(dump.clone());

        self.cancel.check(&context)?;

        let payload = self
            .dumps
            .fetch(&dump)
            .await
            .map_err(|source| ReportError::DumpFetch {
                source,
                context: context.clone(),
            })?;

        let report = match self
            .assembler
            .assemble(&dump, &payload, &mut context, &self.cancel)
            .await
        {
            Ok(report) => report,
            Err(ReportError::Parse {
                source, context, ..
            }) => {
                let claimed = match self.config.parse_failure {
                    ParseFailurePolicy::Claim => match claim.claim(self.dumps.as_ref()).await {
                        Ok(()) => true,
                        Err(err) => {
                            error!(error = %err, "could not claim malformed dump");
                            false
                        }
                    },
                    ParseFailurePolicy::LeavePending => false,
                };
                return Err(ReportError::Parse {
                    source,
                    context,
                    claimed,
                });
            }
            Err(err) => return Err(err),
        };
        self.cancel.check(&context)?;

        let stored = self
            .store
            .save_report(report)
            .await
            .map_err(|source| ReportError::Persistence {
                source,
                context: context.clone(),
            })?;
        if let Err(err) = claim.claim(self.dumps.as_ref()).await {
            error!(%context, error = %err, "report stored but dump claim failed; next run claims it as superseded");
        }
        info!(report_id = %stored.report_id, open = stored.open_mismatch_count(false), "spotcheck run complete");
        Ok(stored)
    }
}

/// Type-erased view of one stream for schedulers and the query surface.
#[async_trait]
pub trait SpotcheckStream: Send + Sync {
    fn config(&self) -> &StreamConfig;

    fn reference_type(&self) -> ReferenceType {
        self.config().reference_type
    }

    fn cancel(&self);

    async fn generate_report(&self) -> Result<ReportView, ReportError>;

    async fn get_report(&self, reference_time: DateTime<Utc>) -> Result<ReportView, QueryError>;

    async fn list_report_ids(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ReportId>, QueryError>;

    async fn open_mismatch_count(
        &self,
        reference_time: DateTime<Utc>,
        include_ignored: bool,
    ) -> Result<usize, QueryError>;

    async fn ignore_mismatch(
        &self,
        content_id: &str,
        mismatch_type: MismatchType,
    ) -> Result<(), QueryError>;

    async fn unignore_mismatch(
        &self,
        content_id: &str,
        mismatch_type: MismatchType,
    ) -> Result<bool, QueryError>;
}

#[async_trait]
impl<K, E, R> SpotcheckStream for ReportService<K, E, R>
where
    K: ContentKey,
    E: Send + Sync + 'static,
    R: Keyed<K> + Send + Sync + 'static,
{
    fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn generate_report(&self) -> Result<ReportView, ReportError> {
        let report = self.generate().await?;
        Ok(ReportView::from(&report))
    }

    async fn get_report(&self, reference_time: DateTime<Utc>) -> Result<ReportView, QueryError> {
        let lookup = ReportId::new(self.reference_type(), reference_time, reference_time);
        let report = self.store.get_report(&lookup).await?;
        Ok(ReportView::from(&report))
    }

    async fn list_report_ids(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ReportId>, QueryError> {
        Ok(self
            .store
            .list_report_ids(self.reference_type(), from, to, order, limit)
            .await?)
    }

    async fn open_mismatch_count(
        &self,
        reference_time: DateTime<Utc>,
        include_ignored: bool,
    ) -> Result<usize, QueryError> {
        let lookup = ReportId::new(self.reference_type(), reference_time, reference_time);
        Ok(self
            .store
            .open_mismatch_count(&lookup, include_ignored)
            .await?)
    }

    async fn ignore_mismatch(
        &self,
        content_id: &str,
        mismatch_type: MismatchType,
    ) -> Result<(), QueryError> {
        let content_id: K = content_id.parse()?;
        self.store
            .ignore_mismatch(self.reference_type(), &content_id, mismatch_type)
            .await?;
        Ok(())
    }

    async fn unignore_mismatch(
        &self,
        content_id: &str,
        mismatch_type: MismatchType,
    ) -> Result<bool, QueryError> {
        let content_id: K = content_id.parse()?;
        Ok(self
            .store
            .unignore_mismatch(self.reference_type(), &content_id, mismatch_type)
            .await?)
    }
}

/// Streams keyed by reference type, plus the report event channel they publish on.
pub struct SpotcheckRegistry {
    streams: BTreeMap<ReferenceType, Arc<dyn SpotcheckStream>>,
    events: broadcast::Sender<ReportEvent>,
}

impl Default for SpotcheckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotcheckRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            streams: BTreeMap::new(),
            events,
        }
    }

    pub fn events(&self) -> broadcast::Sender<ReportEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReportEvent> {
        self.events.subscribe()
    }

    pub fn insert(&mut self, stream: Arc<dyn SpotcheckStream>) {
        self.streams.insert(stream.reference_type(), stream);
    }

    pub fn get(&self, reference_type: ReferenceType) -> Option<Arc<dyn SpotcheckStream>> {
        self.streams.get(&reference_type).cloned()
    }

    pub fn streams(&self) -> impl Iterator<Item = &Arc<dyn SpotcheckStream>> {
        self.streams.values()
    }

    /// Wires every enabled stream against the filesystem layout under `config.data_dir`.
    pub async fn from_config(config: &SpotcheckConfig, streams: &StreamRegistryFile) -> Result<Self> {
        let mut registry = Self::new();
        let dumps: Arc<dyn DumpProvider> = Arc::new(FsDumpProvider::new(config.dumps_dir()));
        for stream in streams.enabled() {
            let built = build_stream(config, stream.clone(), Arc::clone(&dumps), registry.events())
                .await
                .with_context(|| format!("building stream {}", stream.reference_type))?;
            registry.insert(built);
        }
        info!(streams = registry.streams.len(), data_dir = %config.data_dir.display(), "stream registry ready");
        Ok(registry)
    }

    pub async fn maybe_build_scheduler(
        &self,
        config: &SpotcheckConfig,
    ) -> Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for stream in self.streams.values() {
            let cron = stream
                .config()
                .cron
                .clone()
                .unwrap_or_else(|| config.cron.clone());
            let stream = Arc::clone(stream);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let stream = Arc::clone(&stream);
                Box::pin(async move {
                    match stream.generate_report().await {
                        Ok(view) => info!(
                            report_id = %view.report_id,
                            open = view.summary.open_mismatches,
                            "scheduled spotcheck stored"
                        ),
                        Err(err) => warn!(
                            kind = err.kind(),
                            error = %err,
                            "scheduled spotcheck failed; waiting for next trigger"
                        ),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

async fn load_local_data<K, E>(path: &Path) -> Result<Arc<MemoryLocalData<K, E>>>
where
    K: ContentKey,
    E: Keyed<K> + Clone + Send + Sync + DeserializeOwned + 'static,
{
    let exists = tokio::fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?;
    if !exists {
        warn!(path = %path.display(), "no local data file, starting empty");
        return Ok(Arc::new(MemoryLocalData::new()));
    }
    Ok(Arc::new(MemoryLocalData::from_json_file(path).await?))
}

fn wire_stream<K, E, R>(
    config: &SpotcheckConfig,
    stream: StreamConfig,
    local: Arc<MemoryLocalData<K, E>>,
    checker: Arc<dyn Checker<E, R>>,
    dumps: Arc<dyn DumpProvider>,
    events: broadcast::Sender<ReportEvent>,
) -> Arc<dyn SpotcheckStream>
where
    K: ContentKey,
    E: Keyed<K> + Clone + Send + Sync + 'static,
    R: Keyed<K> + DeserializeOwned + Send + Sync + 'static,
{
    let assembler = ReportAssembler::new(
        stream.reference_type,
        local.clone(),
        local,
        Arc::new(SenateSiteJsonParser::<R>::new()),
        checker,
    )
    .with_options(config.run_options())
    .with_update_kind(stream.update_kind);
    let store: Arc<dyn ReportStore<K>> = Arc::new(FsReportStore::<K>::new(config.reports_dir()));
    Arc::new(ReportService::new(stream, assembler, dumps, store, events))
}

async fn build_stream(
    config: &SpotcheckConfig,
    stream: StreamConfig,
    dumps: Arc<dyn DumpProvider>,
    events: broadcast::Sender<ReportEvent>,
) -> Result<Arc<dyn SpotcheckStream>> {
    let local_path = config.local_data_path(stream.reference_type);
    let built = match stream.reference_type {
        ReferenceType::SenateSiteBills => {
            let local = load_local_data::<BillId, Bill>(&local_path).await?;
            wire_stream::<BillId, Bill, SenateSiteBill>(
                config,
                stream,
                local,
                Arc::new(BillChecker),
                dumps,
                events,
            )
        }
        ReferenceType::SenateSiteCalendars => {
            let local = load_local_data::<CalendarId, Calendar>(&local_path).await?;
            wire_stream::<CalendarId, Calendar, SenateSiteCalendar>(
                config,
                stream,
                local,
                Arc::new(CalendarChecker),
                dumps,
                events,
            )
        }
    };
    Ok(built)
}
