//! Run orchestration: sequential per-row execution, shared run-state, reports and scheduling.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use bidash_backends::{BackendExecutor, BackendsConfig};
use bidash_core::{
    ErrorType, Row, RowOutcome, RunOutcome, RunStateSnapshot, RunStatus, RunSummary,
};
use bidash_storage::{load_seed_file, RowStore, StoreError};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidash-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub seed_file: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub run_cron: String,
    pub backends: BackendsConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("BIDASH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/dashboard.db")),
            seed_file: std::env::var("BIDASH_SEED_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rows.yaml")),
            reports_dir: std::env::var("BIDASH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            scheduler_enabled: std::env::var("BIDASH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            run_cron: std::env::var("BIDASH_RUN_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            backends: BackendsConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Default)]
struct SessionState {
    status: RunStatus,
    run_id: Option<Uuid>,
    active_row_id: Option<String>,
    updated: Vec<Row>,
}

#[derive(Debug, Default)]
struct SessionInner {
    state: Mutex<SessionState>,
    stop_requested: AtomicBool,
}

/// Coordination point shared by the run loop and status pollers. Cheap to clone;
/// separate sessions never observe each other.
#[derive(Debug, Clone, Default)]
pub struct RunSession {
    inner: Arc<SessionInner>,
}

impl RunSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomic idle -> running transition.
    pub fn begin(&self, run_id: Uuid) -> Result<RunTicket, SessionError> {
        let mut state = self.state();
        if state.status != RunStatus::Idle {
            return Err(SessionError::AlreadyRunning);
        }
        state.status = RunStatus::Running;
        state.run_id = Some(run_id);
        state.active_row_id = None;
        state.updated.clear();
        self.inner.stop_requested.store(false, Ordering::SeqCst);
        Ok(RunTicket {
            session: self.clone(),
        })
    }

    /// Cooperative stop, observed between rows. Returns `false` when nothing is running.
    pub fn request_stop(&self) -> bool {
        let mut state = self.state();
        if state.status != RunStatus::Running {
            return false;
        }
        state.status = RunStatus::Stopped;
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_idle(&self) -> bool {
        self.state().status == RunStatus::Idle
    }

    pub fn current_run_id(&self) -> Option<Uuid> {
        self.state().run_id
    }

    /// Non-draining view of the run state.
    pub fn snapshot(&self) -> RunStateSnapshot {
        let state = self.state();
        RunStateSnapshot {
            status: state.status,
            active_row_id: state.active_row_id.clone(),
            updated_data: state.updated.clone(),
        }
    }

    /// Status poll: returns and clears rows updated since the previous poll.
    pub fn poll(&self) -> RunStateSnapshot {
        let mut state = self.state();
        RunStateSnapshot {
            status: state.status,
            active_row_id: state.active_row_id.clone(),
            updated_data: std::mem::take(&mut state.updated),
        }
    }
}

/// Held by the run loop for the lifetime of a run. Dropping it settles the
/// session on `idle`, whichever way the run ended.
#[derive(Debug)]
pub struct RunTicket {
    session: RunSession,
}

impl RunTicket {
    pub fn stop_requested(&self) -> bool {
        self.session.inner.stop_requested.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, row_id: &str) {
        self.session.state().active_row_id = Some(row_id.to_string());
    }

    /// Publish a row's new state to pollers; a later update for the same id replaces the earlier one.
    pub fn publish(&self, row: Row) {
        let mut state = self.session.state();
        state.updated.retain(|r| r.id != row.id);
        state.updated.push(row);
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        let mut state = self.session.state();
        state.status = RunStatus::Idle;
        state.run_id = None;
        state.active_row_id = None;
        self.session
            .inner
            .stop_requested
            .store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Rows to execute, in order. `None` means the full Row Store list.
    #[serde(default)]
    pub rows: Option<Vec<Row>>,
    /// Production runs persist results and write reports; others are dry runs.
    #[serde(default)]
    pub is_production: bool,
}

impl RunRequest {
    pub fn production() -> Self {
        Self {
            rows: None,
            is_production: true,
        }
    }

    pub fn dry_run() -> Self {
        Self {
            rows: None,
            is_production: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("row store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl RunError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, RunError::Session(SessionError::AlreadyRunning))
    }
}

pub struct RunOrchestrator {
    store: RowStore,
    executor: Arc<BackendExecutor>,
    session: RunSession,
    reports: Option<ReportWriter>,
}

impl RunOrchestrator {
    pub fn new(store: RowStore, executor: Arc<BackendExecutor>, session: RunSession) -> Self {
        Self {
            store,
            executor,
            session,
            reports: None,
        }
    }

    pub fn with_reports(mut self, reports: ReportWriter) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn store(&self) -> &RowStore {
        &self.store
    }

    pub fn executor(&self) -> &BackendExecutor {
        &self.executor
    }

    pub fn session(&self) -> &RunSession {
        &self.session
    }

    pub fn reports(&self) -> Option<&ReportWriter> {
        self.reports.as_ref()
    }

    pub fn stop(&self) -> bool {
        let requested = self.session.request_stop();
        if requested {
            info!(run_id = ?self.session.current_run_id(), "stop requested");
        }
        requested
    }

    pub fn state(&self) -> RunStateSnapshot {
        self.session.poll()
    }

    /// Execute rows strictly in order. Per-row failures are recorded and the loop
    /// moves on; only a Row Store failure ends the run early.
    pub async fn start(&self, request: RunRequest) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let ticket = self.session.begin(run_id)?;
        let span = info_span!("run", %run_id, is_production = request.is_production);
        self.drive(ticket, run_id, request).instrument(span).await
    }

    async fn drive(
        &self,
        ticket: RunTicket,
        run_id: Uuid,
        request: RunRequest,
    ) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let rows = match request.rows {
            Some(rows) => rows,
            None => self.store.list_rows().await?,
        };
        info!(rows = rows.len(), "run started");

        let mut outcome = RunOutcome::Completed;
        let mut results = Vec::with_capacity(rows.len());
        let mut final_rows = Vec::with_capacity(rows.len());

        for mut row in rows {
            if ticket.stop_requested() {
                outcome = RunOutcome::Stopped;
                info!(next_row = %row.id, "run stopped before row");
                break;
            }

            ticket.set_active(&row.id);
            let row_outcome = self.execute_row(&row).await;
            row.apply_outcome(&row_outcome);

            if request.is_production {
                if let Err(err) = self.persist(&row, &row_outcome).await {
                    error!(row_id = %row.id, error = %err, "row store write failed; aborting run");
                    return Err(err.into());
                }
            }

            ticket.publish(row.clone());
            results.push(row_outcome);
            final_rows.push(row);
        }
        drop(ticket);

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            is_production: request.is_production,
            outcome,
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        };
        info!(
            outcome = ?summary.outcome,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "run finished"
        );

        if request.is_production {
            if let Some(reports) = &self.reports {
                if let Err(err) = reports.write(&summary, &final_rows).await {
                    warn!(error = %err, "failed to write run report");
                }
            }
        }

        Ok(summary)
    }

    async fn execute_row(&self, row: &Row) -> RowOutcome {
        let started = Instant::now();
        let result = self
            .executor
            .execute(&row.server_name, &row.sql_expression)
            .await;
        let executed_at = Utc::now();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                debug!(row_id = %row.id, %value, elapsed_ms, "row executed");
                RowOutcome {
                    row_id: row.id.clone(),
                    value: Some(value),
                    error: None,
                    error_type: None,
                    executed_at,
                    elapsed_ms,
                }
            }
            Err(err) => {
                let error_type = err.error_type();
                warn!(
                    row_id = %row.id,
                    server = %row.server_name,
                    %error_type,
                    error = %err,
                    "row failed"
                );
                RowOutcome {
                    row_id: row.id.clone(),
                    value: None,
                    error: Some(err.to_string()),
                    error_type: Some(error_type),
                    executed_at,
                    elapsed_ms,
                }
            }
        }
    }

    async fn persist(&self, row: &Row, outcome: &RowOutcome) -> Result<(), StoreError> {
        let found = match (&outcome.value, &outcome.error) {
            (Some(value), None) => {
                self.store
                    .record_success(&row.id, value, outcome.executed_at)
                    .await?
            }
            _ => {
                self.store
                    .record_failure(
                        &row.id,
                        outcome.error_type.unwrap_or(ErrorType::Unknown),
                        outcome.error.as_deref().unwrap_or_default(),
                        outcome.executed_at,
                    )
                    .await?
            }
        };
        // Rows posted with the run request may not exist in the store yet.
        if !found {
            self.store.save_row(row).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub has_snapshot: bool,
}

/// Writes `reports/<run_id>/` after production runs.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(&self, summary: &RunSummary, rows: &[Row]) -> Result<PathBuf> {
        let run_dir = self.root.join(summary.run_id.to_string());
        let snapshot_dir = run_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let summary_path = run_dir.join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&summary_path, bytes)
            .await
            .with_context(|| format!("writing {}", summary_path.display()))?;

        let rows_path = snapshot_dir.join("rows.parquet");
        write_rows_parquet(&rows_path, rows)?;

        let manifest = SnapshotManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("run_summary", &run_dir, &summary_path)?,
                manifest_entry("rows", &run_dir, &rows_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(dir = %run_dir.display(), "run report written");
        Ok(run_dir)
    }
}

/// Most recent run reports first. Directories without a readable summary are skipped.
pub fn list_reports(root: &Path, limit: usize) -> Result<Vec<ReportEntry>> {
    if !root.exists() {
        return Ok(vec![]);
    }
    let mut dirs = std::fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut out = Vec::new();
    for dir in dirs {
        if out.len() >= limit.max(1) {
            break;
        }
        let summary_path = dir.path().join("run_summary.json");
        let summary: RunSummary = match std::fs::read_to_string(&summary_path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<RunSummary>(&text).map_err(anyhow::Error::from))
        {
            Ok(summary) => summary,
            Err(err) => {
                debug!(path = %summary_path.display(), error = %err, "skipping report directory");
                continue;
            }
        };
        out.push(ReportEntry {
            run_id: summary.run_id.to_string(),
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            outcome: summary.outcome,
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
            has_snapshot: dir.path().join("snapshots/rows.parquet").exists(),
        });
    }
    Ok(out)
}

fn write_rows_parquet(path: &Path, rows: &[Row]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("chart_group", DataType::Utf8, false),
        ArrowField::new("chart_name", DataType::Utf8, false),
        ArrowField::new("variable_name", DataType::Utf8, false),
        ArrowField::new("server_name", DataType::Utf8, false),
        ArrowField::new("value", DataType::Utf8, true),
        ArrowField::new("last_updated", DataType::Utf8, true),
        ArrowField::new("error_type", DataType::Utf8, true),
    ]));

    let text_column =
        |f: &dyn Fn(&Row) -> Option<String>| StringArray::from(rows.iter().map(f).collect::<Vec<_>>());
    let columns: Vec<ArrayRef> = vec![
        text_column(&|r| Some(r.id.clone())),
        text_column(&|r| Some(r.chart_group.clone())),
        text_column(&|r| Some(r.chart_name.clone())),
        text_column(&|r| Some(r.variable_name.clone())),
        text_column(&|r| Some(r.server_name.clone())),
        text_column(&|r| r.value.clone()),
        text_column(&|r| r.last_updated.map(|t| t.to_rfc3339())),
        text_column(&|r| r.error_type.map(|t| t.as_str().to_string())),
    ]
    .into_iter()
    .map(|column| Arc::new(column) as ArrayRef)
    .collect();
    let batch = RecordBatch::try_new(schema, columns).context("building rows record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: path
            .strip_prefix(base)
            .unwrap_or(path)
            .display()
            .to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Open the Row Store, seeding it from the definitions file when it is empty.
pub async fn open_store(config: &SyncConfig) -> Result<RowStore> {
    let store = RowStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening row store {}", config.db_path.display()))?;
    if store.count().await? == 0 {
        if config.seed_file.exists() {
            let defs = load_seed_file(&config.seed_file).await?;
            store.seed_definitions(&defs).await?;
        } else {
            warn!(path = %config.seed_file.display(), "row store is empty and no seed file was found");
        }
    }
    Ok(store)
}

pub async fn orchestrator_from_config(config: &SyncConfig) -> Result<RunOrchestrator> {
    let store = open_store(config).await?;
    let executor = config
        .backends
        .build_executor()
        .context("building backend executor")?;
    Ok(
        RunOrchestrator::new(store, Arc::new(executor), RunSession::new())
            .with_reports(ReportWriter::new(config.reports_dir.clone())),
    )
}

pub async fn run_once_from_env(is_production: bool) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let orchestrator = orchestrator_from_config(&config).await?;
    let request = if is_production {
        RunRequest::production()
    } else {
        RunRequest::dry_run()
    };
    Ok(orchestrator.start(request).await?)
}

/// Cron-triggered production runs. A trigger that lands while a run is active is skipped.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<RunOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.run_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.start(RunRequest::production()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "scheduled run finished"
                ),
                Err(err) if err.is_already_running() => {
                    warn!("scheduled run skipped; a run is already in progress")
                }
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduled runs enabled");
    Ok(Some(sched))
}
