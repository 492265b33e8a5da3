//! Batch controller, poller and enrichment engine.

use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use idem_adapters::{reader_for_path, Enricher, RecordReader};
use idem_core::{
    ConsumptionEntry, ConsumptionLedger, EnrichmentEntry, Flow, FlowBatch, FlowError, FlowRecord,
    Snapshot, SnapshotOrigin, Validator,
};
use idem_storage::{FlowStore, LedgerStore, SnapshotStore};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "idem-sync";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_CONTROLLER_NAME: &str = "file-controller";
pub const DEFAULT_PROCESS_NAME: &str = "import";

/// A CSV-backed enricher declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnricherConfig {
    pub id: String,
    pub path: PathBuf,
    /// Column of the enrichment file holding the join key.
    pub part_key: String,
    /// Field of the target record holding the join key.
    pub whole_key: String,
    /// Columns copied onto the target; empty copies every non-key column.
    #[serde(default)]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub flow_code: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_controller_name")]
    pub controller_name: String,
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_input_directory")]
    pub input_directory: PathBuf,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Records allowed in one input file; 0 disables the limit.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub unique_field: Option<String>,
    #[serde(default)]
    pub enrichers: Vec<EnricherConfig>,
}

fn default_controller_name() -> String {
    DEFAULT_CONTROLLER_NAME.to_string()
}

fn default_process_name() -> String {
    DEFAULT_PROCESS_NAME.to_string()
}

fn default_input_directory() -> PathBuf {
    PathBuf::from("./data/in")
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./data/out")
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

impl PipelineConfig {
    pub fn new(flow_code: impl Into<String>) -> Self {
        Self {
            flow_code: flow_code.into(),
            display_name: String::new(),
            controller_name: default_controller_name(),
            process_name: default_process_name(),
            input_directory: default_input_directory(),
            output_directory: default_output_directory(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            required_fields: Vec::new(),
            unique_field: None,
            enrichers: Vec::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let flow_code = var("IDEM_FLOW_CODE")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FlowError::MissingConfig("IDEM_FLOW_CODE".to_string()))?;
        let mut config = Self::new(flow_code);
        if let Some(dir) = var("IDEM_INPUT_DIR") {
            config.input_directory = PathBuf::from(dir);
        }
        if let Some(dir) = var("IDEM_OUTPUT_DIR") {
            config.output_directory = PathBuf::from(dir);
        }
        if let Some(name) = var("IDEM_CONTROLLER").filter(|v| !v.trim().is_empty()) {
            config.controller_name = name;
        }
        config.poll_interval_ms = var("IDEM_POLL_INTERVAL_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        config.max_batch_size = var("IDEM_MAX_BATCH_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_BATCH_SIZE);
        config.validated()
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.flow_code.trim().is_empty() {
            return Err(FlowError::MissingConfig("flow_code".to_string()).into());
        }
        if self.controller_name.trim().is_empty() {
            return Err(FlowError::MissingConfig("controller_name".to_string()).into());
        }
        if self.process_name.trim().is_empty() {
            return Err(FlowError::MissingConfig("process_name".to_string()).into());
        }
        Ok(self)
    }

    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.flow_code
        } else {
            &self.display_name
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// The three stores sharing one output directory.
#[derive(Debug, Clone)]
pub struct Stores {
    pub flows: Arc<FlowStore>,
    pub ledgers: LedgerStore,
    pub snapshots: SnapshotStore,
}

impl Stores {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            flows: Arc::new(FlowStore::new(root.clone())),
            ledgers: LedgerStore::new(root.clone()),
            snapshots: SnapshotStore::new(root),
        }
    }
}

/// Create the flow and register `T` on it unless both already exist.
pub async fn ensure_flow<T: FlowRecord>(flows: &FlowStore, code: &str, display_name: &str) -> Result<Flow> {
    if flows.find_flow(code).await?.is_none() {
        flows.create_flow(code, display_name).await?;
        info!(flow = code, "flow created");
    }
    let flow = flows.get_flow(code).await?;
    if flow.entity(T::ENTITY_TYPE_ID).is_none() {
        flows.register_entity::<T>(code).await?;
        info!(flow = code, entity = T::ENTITY_TYPE_ID, "entity registered");
        return flows.get_flow(code).await;
    }
    Ok(flow)
}

/// What a processor hands back for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutput<T> {
    pub records: Vec<T>,
    pub warnings: Vec<String>,
    /// Non-fatal per-record failures; the records concerned are dropped.
    pub exceptions: Vec<String>,
}

impl<T> ProcessorOutput<T> {
    pub fn records(records: Vec<T>) -> Self {
        Self {
            records,
            warnings: Vec::new(),
            exceptions: Vec::new(),
        }
    }
}

/// Turns the records read from one file into candidate output records.
pub trait Processor<I, O>: Send + Sync {
    fn transform(&self, batch: &FlowBatch, records: Vec<I>) -> Result<ProcessorOutput<O>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProcessor;

impl<T> Processor<T, T> for IdentityProcessor {
    fn transform(&self, _batch: &FlowBatch, records: Vec<T>) -> Result<ProcessorOutput<T>> {
        Ok(ProcessorOutput::records(records))
    }
}

pub struct FnProcessor<F>(pub F);

impl<I, O, F> Processor<I, O> for FnProcessor<F>
where
    F: Fn(&FlowBatch, Vec<I>) -> Result<ProcessorOutput<O>> + Send + Sync,
{
    fn transform(&self, batch: &FlowBatch, records: Vec<I>) -> Result<ProcessorOutput<O>> {
        (self.0)(batch, records)
    }
}

/// A file that could not be turned into a snapshot. Its consumption is not recorded.
#[derive(Debug, Error)]
#[error("processing {} in batch {batch} failed", file.display())]
pub struct ProcessFailed {
    pub file: PathBuf,
    pub batch: FlowBatch,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    SelectingFile,
    NoFileFound,
    FileSelected,
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSelection {
    Selected(PathBuf),
    AllConsumed,
    EmptyDirectory,
}

impl FileSelection {
    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            Self::Selected(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ControllerOutcome<T> {
    NoFileFound { warning: Option<String> },
    Processed(Box<Snapshot<T>>),
}

impl<T> ControllerOutcome<T> {
    pub fn snapshot(&self) -> Option<&Snapshot<T>> {
        match self {
            Self::Processed(snapshot) => Some(snapshot),
            Self::NoFileFound { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub flow_code: String,
    pub controller_name: String,
    pub process_name: String,
    pub input_directory: PathBuf,
    pub max_batch_size: usize,
}

impl From<&PipelineConfig> for ControllerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            flow_code: config.flow_code.clone(),
            controller_name: config.controller_name.clone(),
            process_name: config.process_name.clone(),
            input_directory: config.input_directory.clone(),
            max_batch_size: config.max_batch_size,
        }
    }
}

/// Consumes input files one at a time, oldest first, at most once per controller name.
pub struct BatchController<I, O> {
    settings: ControllerSettings,
    flows: Arc<FlowStore>,
    ledgers: LedgerStore,
    snapshots: SnapshotStore,
    reader: Option<Arc<dyn RecordReader<I>>>,
    processor: Arc<dyn Processor<I, O>>,
    validator: Validator<O>,
}

impl<I, O> BatchController<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: FlowRecord,
{
    pub fn new(
        settings: ControllerSettings,
        stores: &Stores,
        processor: Arc<dyn Processor<I, O>>,
        validator: Validator<O>,
    ) -> Self {
        Self {
            settings,
            flows: Arc::clone(&stores.flows),
            ledgers: stores.ledgers.clone(),
            snapshots: stores.snapshots.clone(),
            reader: None,
            processor,
            validator,
        }
    }

    /// Use one reader for every file instead of choosing by extension.
    pub fn with_reader(mut self, reader: Arc<dyn RecordReader<I>>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    fn transition(&self, state: ControllerState) {
        debug!(controller = %self.settings.controller_name, ?state, "controller state");
    }

    fn reader_for(&self, file: &Path) -> Result<Arc<dyn RecordReader<I>>> {
        match &self.reader {
            Some(reader) => Ok(Arc::clone(reader)),
            None => reader_for_path(file).ok_or_else(|| anyhow!("no reader for {}", file.display())),
        }
    }

    /// Readable files in the input directory ordered by creation time, then name.
    ///
    /// The directory is created when missing. Hidden files are skipped, as are files no reader
    /// handles when no fixed reader is configured.
    pub async fn list_input_files(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.settings.input_directory;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating input directory {}", dir.display()))?;
        let dir = fs::canonicalize(dir)
            .await
            .with_context(|| format!("resolving {}", dir.display()))?;

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading {}", dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let meta = entry
                .metadata()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if self.reader.is_none() && reader_for_path::<I>(&path).is_none() {
                continue;
            }
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((created, name, path));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, _, path)| path).collect())
    }

    pub async fn get_next_file(&self, ledger: &ConsumptionLedger) -> Result<FileSelection> {
        let files = self.list_input_files().await?;
        if files.is_empty() {
            warn!(
                dir = %self.settings.input_directory.display(),
                "input directory is empty"
            );
            return Ok(FileSelection::EmptyDirectory);
        }
        let next = files.into_iter().find(|path| {
            !ledger.has_been_processed(&self.settings.controller_name, &path.display().to_string())
        });
        Ok(next.map_or(FileSelection::AllConsumed, FileSelection::Selected))
    }

    /// Read, transform, partition and persist one file. Any failure comes back as [`ProcessFailed`].
    ///
    /// A file over `max_batch_size` is not transformed. Its snapshot holds no records and one
    /// exception, so the file is still consumed and newer files are not held back.
    pub async fn process(&self, file: &Path, batch: &FlowBatch) -> Result<Snapshot<O>> {
        let started = Instant::now();
        let attempt = async {
            let reader = self.reader_for(file)?;
            let records = reader.read(file).await?;
            let limit = self.settings.max_batch_size;
            let mut output = if limit > 0 && records.len() > limit {
                let rejected = FlowError::BatchTooLarge {
                    address: file.display().to_string(),
                    count: records.len(),
                    limit,
                };
                warn!("{rejected}; recording the file without records");
                ProcessorOutput {
                    records: Vec::new(),
                    warnings: Vec::new(),
                    exceptions: vec![rejected.to_string()],
                }
            } else {
                self.processor.transform(batch, records)?
            };
            if output.records.is_empty() && output.exceptions.is_empty() {
                output.warnings.push("file contained no records".to_string());
            }
            let origin = SnapshotOrigin {
                process_name: self.settings.process_name.clone(),
                source_type: reader.source_type().to_string(),
                source_address_id: file.display().to_string(),
                target_type: O::ENTITY_TYPE_ID.to_string(),
            };
            let mut snapshot =
                Snapshot::assemble(origin, batch.clone(), self.validator.partition(output.records));
            snapshot.warnings = output.warnings;
            snapshot.exceptions = output.exceptions;
            snapshot.process_time_ms = started.elapsed().as_millis() as u64;
            self.snapshots.save(&snapshot).await?;
            Ok::<_, anyhow::Error>(snapshot)
        };
        attempt.await.map_err(|source| {
            ProcessFailed {
                file: file.to_path_buf(),
                batch: batch.clone(),
                source,
            }
            .into()
        })
    }

    /// One controller invocation: select a file, process it, then record its consumption.
    pub async fn run_once(&self) -> Result<ControllerOutcome<O>> {
        let span = info_span!(
            "controller_run",
            flow = %self.settings.flow_code,
            controller = %self.settings.controller_name,
            batch = tracing::field::Empty,
        );
        async move {
            self.transition(ControllerState::Idle);
            let flow_code = &self.settings.flow_code;
            self.flows
                .get_flow(flow_code)
                .await?
                .require_entity(O::ENTITY_TYPE_ID)?;
            let mut ledger: ConsumptionLedger = self.ledgers.get(flow_code, O::ENTITY_TYPE_ID).await?;

            self.transition(ControllerState::SelectingFile);
            let file = match self.get_next_file(&ledger).await? {
                FileSelection::Selected(path) => path,
                FileSelection::AllConsumed => {
                    self.transition(ControllerState::NoFileFound);
                    return Ok(ControllerOutcome::NoFileFound { warning: None });
                }
                FileSelection::EmptyDirectory => {
                    self.transition(ControllerState::NoFileFound);
                    return Ok(ControllerOutcome::NoFileFound {
                        warning: Some(format!(
                            "input directory {} is empty",
                            self.settings.input_directory.display()
                        )),
                    });
                }
            };
            self.transition(ControllerState::FileSelected);
            info!(file = %file.display(), "selected input file");

            let batch = self.flows.next_batch(flow_code).await?;
            tracing::Span::current().record("batch", batch.batch_id);
            self.transition(ControllerState::Processing);
            let snapshot = match self.process(&file, &batch).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.transition(ControllerState::Failed);
                    return Err(err);
                }
            };
            info!(
                address = %snapshot.target_address_id,
                valid = snapshot.valid_count(),
                invalid = snapshot.invalid_count(),
                "snapshot persisted"
            );

            ledger.append(ConsumptionEntry {
                controller_name: self.settings.controller_name.clone(),
                flow_code: flow_code.clone(),
                batch_id: batch.batch_id,
                address_id: snapshot.source_address_id.clone(),
                date_processed: Utc::now(),
            });
            self.ledgers.save(&ledger).await?;
            info!(file = %file.display(), entries = ledger.len(), "consumption ledger updated");
            self.transition(ControllerState::Success);
            Ok(ControllerOutcome::Processed(Box::new(snapshot)))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Ran(ControllerOutcome<T>),
    /// A previous run was still in flight.
    Skipped,
}

/// Drives a controller on a fixed interval with at most one run in flight.
pub struct Poller<I, O> {
    controller: Arc<BatchController<I, O>>,
    interval: Duration,
    in_flight: Mutex<()>,
    skipped: AtomicU64,
}

impl<I, O> Poller<I, O>
where
    I: DeserializeOwned + Send + Sync + 'static,
    O: FlowRecord,
{
    pub fn new(controller: Arc<BatchController<I, O>>, interval: Duration) -> Self {
        Self {
            controller,
            interval: interval.max(Duration::from_millis(1)),
            in_flight: Mutex::new(()),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ticks dropped because a run was still in flight.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub async fn poll_once(&self) -> Result<PollOutcome<O>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("previous controller run still in flight; skipping tick");
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(PollOutcome::Skipped);
        };
        Ok(PollOutcome::Ran(self.controller.run_once().await?))
    }

    async fn tick(&self) {
        match self.poll_once().await {
            Ok(PollOutcome::Ran(ControllerOutcome::Processed(snapshot))) => {
                info!(batch = %snapshot.batch, "poll processed a file");
            }
            Ok(_) => {}
            Err(err) => error!("controller run failed: {err:#}"),
        }
    }

    /// Poll until `shutdown` resolves. Failed runs are logged and polling continues.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(interval_ms = self.interval.as_millis() as u64, "poller started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("poller stopping");
                    return Ok(());
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// Register a repeated job on `sched`; ticks that overlap a running job are skipped.
    pub async fn schedule(self: Arc<Self>, sched: &JobScheduler) -> Result<uuid::Uuid> {
        let interval = self.interval;
        let poller = self;
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let poller = Arc::clone(&poller);
            Box::pin(async move { poller.tick().await })
        })
        .context("creating poll job")?;
        sched.add(job).await.context("adding poll job")
    }
}

/// Applies the matches found by one enricher to the shared record set.
pub trait MergePlan<W>: Send {
    /// Returns the number of records that received at least one part.
    fn apply(self: Box<Self>, records: &mut [W]) -> usize;
}

/// Object-safe view of an [`Enricher`] used by the engine's fan-out.
#[async_trait]
pub trait EnrichmentStep<W>: Send + Sync {
    fn unique_id(&self) -> &str;
    fn source_address_id(&self) -> &str;
    async fn plan(self: Arc<Self>, records: Arc<Vec<W>>) -> Result<Box<dyn MergePlan<W>>>;
}

struct Matches<E, W>
where
    E: Enricher<W>,
{
    enricher: Arc<E>,
    found: Vec<(usize, Vec<E::Part>)>,
    _whole: PhantomData<fn(&mut W)>,
}

impl<E, W> MergePlan<W> for Matches<E, W>
where
    E: Enricher<W>,
    W: Send + Sync + 'static,
{
    fn apply(self: Box<Self>, records: &mut [W]) -> usize {
        let mut enriched = 0;
        for (idx, parts) in &self.found {
            let Some(whole) = records.get_mut(*idx) else {
                continue;
            };
            for part in parts {
                self.enricher.enrich(part, whole);
            }
            enriched += 1;
        }
        enriched
    }
}

#[async_trait]
impl<E, W> EnrichmentStep<W> for E
where
    E: Enricher<W>,
    W: Send + Sync + 'static,
{
    fn unique_id(&self) -> &str {
        <E as Enricher<W>>::unique_id(self)
    }

    fn source_address_id(&self) -> &str {
        <E as Enricher<W>>::address_id(self)
    }

    async fn plan(self: Arc<Self>, records: Arc<Vec<W>>) -> Result<Box<dyn MergePlan<W>>> {
        let parts = self
            .get()
            .await
            .with_context(|| format!("loading parts from {}", <E as Enricher<W>>::address_id(&self)))?;
        let found = records
            .iter()
            .enumerate()
            .filter_map(|(idx, whole)| {
                let matched = self.find(&parts, whole);
                (!matched.is_empty()).then_some((idx, matched))
            })
            .collect();
        Ok(Box::new(Matches {
            enricher: self,
            found,
            _whole: PhantomData,
        }))
    }
}

#[derive(Debug)]
pub struct EnrichmentOutcome<W> {
    /// The superseding snapshot, or the untouched input when nothing was pending.
    pub snapshot: Snapshot<W>,
    pub applied: Vec<EnrichmentEntry>,
}

/// Merges parts from every enricher into the latest snapshot of a target, at most once per
/// `(enricher, target address)`.
pub struct EnrichmentEngine<W> {
    flow_code: String,
    process_name: String,
    flows: Arc<FlowStore>,
    ledgers: LedgerStore,
    snapshots: SnapshotStore,
    enrichers: Vec<Arc<dyn EnrichmentStep<W>>>,
    validator: Validator<W>,
}

impl<W: FlowRecord> EnrichmentEngine<W> {
    pub fn new(
        flow_code: impl Into<String>,
        process_name: impl Into<String>,
        stores: &Stores,
        validator: Validator<W>,
    ) -> Self {
        Self {
            flow_code: flow_code.into(),
            process_name: process_name.into(),
            flows: Arc::clone(&stores.flows),
            ledgers: stores.ledgers.clone(),
            snapshots: stores.snapshots.clone(),
            enrichers: Vec::new(),
            validator,
        }
    }

    pub fn with_enricher<E: Enricher<W>>(mut self, enricher: E) -> Self {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    pub fn enricher_ids(&self) -> Vec<&str> {
        self.enrichers.iter().map(|e| e.unique_id()).collect()
    }

    /// Enrich the latest snapshot taken from `address_id`; `None` when no snapshot exists.
    pub async fn enrich_address(&self, address_id: &str) -> Result<Option<EnrichmentOutcome<W>>> {
        let latest = self
            .snapshots
            .latest_for_address(&self.process_name, &self.flow_code, address_id)
            .await?;
        match latest {
            Some(snapshot) => Ok(Some(self.enrich_snapshot(snapshot).await?)),
            None => {
                warn!(address = address_id, "no snapshot to enrich");
                Ok(None)
            }
        }
    }

    /// Enrich every latest snapshot that still has an enricher pending.
    pub async fn enrich_pending(&self) -> Result<Vec<EnrichmentOutcome<W>>> {
        let latest: Vec<Snapshot<W>> = self
            .snapshots
            .latest_per_address(&self.process_name, &self.flow_code)
            .await?;
        let mut out = Vec::new();
        for snapshot in latest {
            let outcome = self.enrich_snapshot(snapshot).await?;
            if !outcome.applied.is_empty() {
                out.push(outcome);
            }
        }
        Ok(out)
    }

    pub async fn enrich_snapshot(&self, snapshot: Snapshot<W>) -> Result<EnrichmentOutcome<W>> {
        let target = snapshot.source_address_id.clone();
        let span = info_span!("enrichment", flow = %self.flow_code, target = %target);
        async move {
            let mut ledger = self.ledgers.get::<EnrichmentEntry>(&self.flow_code, W::ENTITY_TYPE_ID).await?;
            let pending: Vec<Arc<dyn EnrichmentStep<W>>> = self
                .enrichers
                .iter()
                .filter(|e| !ledger.has_been_processed(e.unique_id(), &target))
                .cloned()
                .collect();
            if pending.is_empty() {
                debug!("every enricher already applied");
                return Ok(EnrichmentOutcome {
                    snapshot,
                    applied: Vec::new(),
                });
            }

            let started = Instant::now();
            let previous_batch = snapshot.batch.batch_id;
            let origin = snapshot.origin();
            let records = Arc::new(snapshot.into_records());

            let (tx, mut rx) = mpsc::channel(pending.len());
            for (slot, step) in pending.iter().enumerate() {
                let tx = tx.clone();
                let step = Arc::clone(step);
                let records = Arc::clone(&records);
                tokio::spawn(async move {
                    let plan = step.plan(records).await;
                    let _ = tx.send((slot, plan)).await;
                });
            }
            drop(tx);

            let mut plans: Vec<Option<Box<dyn MergePlan<W>>>> = pending.iter().map(|_| None).collect();
            while let Some((slot, plan)) = rx.recv().await {
                let plan = plan.with_context(|| {
                    format!("enricher `{}` failed for {target}", pending[slot].unique_id())
                })?;
                plans[slot] = Some(plan);
            }

            let mut records = Arc::try_unwrap(records).unwrap_or_else(|shared| shared.as_ref().clone());
            let batch = self.flows.next_batch(&self.flow_code).await?;
            let created = Utc::now();
            let mut entries = Vec::with_capacity(pending.len());
            for (step, plan) in pending.iter().zip(plans) {
                let plan = plan
                    .ok_or_else(|| anyhow!("enricher `{}` stopped without a result", step.unique_id()))?;
                let entities_enriched = plan.apply(&mut records);
                debug!(enricher = step.unique_id(), entities_enriched, "merge applied");
                entries.push(EnrichmentEntry {
                    enricher_id: step.unique_id().to_string(),
                    source_address_id: step.source_address_id().to_string(),
                    target_address_id: target.clone(),
                    batch_id: batch.batch_id,
                    entities_enriched,
                    date_created: created,
                    date_completed: None,
                });
            }

            let mut next = Snapshot::assemble(origin, batch, self.validator.partition(records));
            next.supersedes = Some(previous_batch);
            next.process_time_ms = started.elapsed().as_millis() as u64;
            self.snapshots.save(&next).await?;
            info!(
                address = %next.target_address_id,
                supersedes = previous_batch,
                valid = next.valid_count(),
                invalid = next.invalid_count(),
                "enriched snapshot persisted"
            );

            let completed = Utc::now();
            for entry in &mut entries {
                entry.date_completed = Some(completed);
                ledger.append(entry.clone());
            }
            self.ledgers.save(&ledger).await?;
            info!(applied = entries.len(), "enrichment ledger updated");

            Ok(EnrichmentOutcome {
                snapshot: next,
                applied: entries,
            })
        }
        .instrument(span)
        .await
    }
}

/// Markdown summary of a flow: counter, entities, ledgers and the latest snapshot per source.
pub async fn report_markdown(
    stores: &Stores,
    flow_code: &str,
    entity_type_id: &str,
    process_name: &str,
) -> Result<String> {
    let flow = stores.flows.get_flow(flow_code).await?;
    let consumed: ConsumptionLedger = stores.ledgers.get(flow_code, entity_type_id).await?;
    let enrichment = stores
        .ledgers
        .get::<EnrichmentEntry>(flow_code, entity_type_id)
        .await?;
    let latest: Vec<Snapshot<serde_json::Value>> = stores
        .snapshots
        .latest_per_address(process_name, flow_code)
        .await?;

    let mut lines = vec![
        format!("# Flow `{}`: {}", flow.code, flow.display_name),
        String::new(),
        format!("- current batch: {}", flow.current_batch_id()),
        format!("- data dir: `{}`", flow.data_dir.display()),
        String::new(),
        "## Entities".to_string(),
    ];
    for entity in &flow.entities {
        lines.push(format!(
            "- `{}` ({}) registered {}",
            entity.entity_type_id,
            entity.qualified_type_name,
            entity.date_registered.to_rfc3339()
        ));
    }

    lines.push(String::new());
    lines.push(format!("## Consumed files ({})", consumed.len()));
    for entry in consumed.entries() {
        lines.push(format!(
            "- `{}` batch #{} by {} at {}",
            entry.address_id,
            entry.batch_id,
            entry.controller_name,
            entry.date_processed.to_rfc3339()
        ));
    }

    lines.push(String::new());
    lines.push(format!("## Enrichments ({})", enrichment.len()));
    for entry in enrichment.entries() {
        lines.push(format!(
            "- `{}` -> `{}`: {} enriched in batch #{}",
            entry.enricher_id, entry.target_address_id, entry.entities_enriched, entry.batch_id
        ));
    }

    lines.push(String::new());
    lines.push(format!("## Latest snapshots ({process_name})"));
    if latest.is_empty() {
        lines.push("_none_".to_string());
    } else {
        lines.push("| batch | source | valid | invalid | errors | supersedes |".to_string());
        lines.push("|---|---|---|---|---|---|".to_string());
        for snapshot in &latest {
            lines.push(format!(
                "| {} | `{}` | {} | {} | {} | {} |",
                snapshot.batch.batch_id,
                snapshot.source_address_id,
                snapshot.valid_count(),
                snapshot.invalid_count(),
                snapshot.errors.len(),
                snapshot
                    .supersedes
                    .map(|id| format!("#{id}"))
                    .unwrap_or_else(|| "-".to_string())
            ));
        }
    }
    lines.push(String::new());
    Ok(lines.join("\n"))
}
