//! Pipeline orchestration: bootstrap, load, and clean stages run in order per tick, with
//! retries, `etl_logs` bookkeeping, and a cron scheduler.

mod clean;
mod config;
mod schedule;
mod warehouse;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use churnpipe_core::{ErrorKind, EtlError, EtlLogEntry, PipelineStep, StepStatus};
use churnpipe_loader::{extract_csv_bytes, LoadSummary};
use churnpipe_storage::{AppendOutcome, DatabaseStatus, TableStatus};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use clean::{clean_frame, round_cents, CleanOptions, CleanOutcome, CleanReport, FillStrategy, Imputation};
pub use config::{
    DatabaseConfig, PipelineConfig, ScheduleConfig, TableConfig, WebConfig, CONFIG_PATH_ENV,
};
pub use schedule::{build_scheduler, run_scheduler};
pub use warehouse::{PgWarehouse, Warehouse};

pub const CRATE_NAME: &str = "churnpipe-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub database: String,
    pub database_created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub table_created: bool,
    pub divergence: Vec<String>,
    pub summary: LoadSummary,
    pub rows_inserted: u64,
    pub skipped_batch: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepReport {
    SetupDb(BootstrapReport),
    LoadData(LoadReport),
    CleanData(CleanReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub step: PipelineStep,
    pub status: StepStatus,
    pub attempts: usize,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub report: Option<StepReport>,
}

impl StepRecord {
    fn skipped(step: PipelineStep) -> Self {
        Self {
            step,
            status: StepStatus::Skipped,
            attempts: 0,
            error_kind: None,
            error: None,
            report: None,
        }
    }
}

/// Outcome of one pipeline tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The tick found the previous one still running and did nothing.
    pub overlapped: bool,
    pub steps: Vec<StepRecord>,
    #[serde(skip)]
    pub failure: Option<EtlError>,
}

impl TickSummary {
    pub fn succeeded(&self) -> bool {
        !self.overlapped && self.failure.is_none()
    }

    pub fn step(&self, step: PipelineStep) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }

    pub fn into_result(self) -> Result<TickSummary, EtlError> {
        match self.failure.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    warehouse: Arc<dyn Warehouse>,
    running: Mutex<()>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            config,
            warehouse,
            running: Mutex::new(()),
        }
    }

    /// Pipeline over PostgreSQL, connecting with the configured settings.
    pub fn postgres(config: PipelineConfig) -> Self {
        let warehouse = Arc::new(PgWarehouse::new(config.database_settings()));
        Self::new(config, warehouse)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create the database if missing and apply the `etl_logs`/`load_batches` migrations.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, EtlError> {
        let status = self.warehouse.ensure_database().await?;
        self.warehouse.ensure_schema().await?;
        let report = BootstrapReport {
            database: self.config.database.name.clone(),
            database_created: status == DatabaseStatus::Created,
        };
        info!(
            database = %report.database,
            created = report.database_created,
            "database bootstrap complete"
        );
        Ok(report)
    }

    /// Extract the CSV and append it to the staging table.
    pub async fn load(&self) -> Result<LoadReport, EtlError> {
        let path = &self.config.csv_path;
        let source_name = path.display().to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| EtlError::source_unreadable(&source_name, err))?;
        let extracted = extract_csv_bytes(&source_name, &bytes)?;
        let summary = &extracted.summary;
        info!(
            rows = summary.rows_read,
            columns = summary.columns.len(),
            duplicates = summary.duplicates_removed,
            "read source csv"
        );
        for column in summary.columns.iter().filter(|c| c.missing > 0) {
            info!(column = %column.name, missing = column.missing, "missing values");
        }

        let table = self.config.staging_table();
        let (table_created, divergence) =
            match self.warehouse.ensure_table(&table, extracted.frame.columns()).await? {
                TableStatus::Created => {
                    info!(%table, "created staging table");
                    (true, Vec::new())
                }
                TableStatus::Existing { divergence } => {
                    if !divergence.is_empty() {
                        warn!(%table, ?divergence, "staging table schema differs from source");
                    }
                    (false, divergence)
                }
            };

        let batch = self
            .config
            .skip_loaded_batches
            .then(|| extracted.batch_for(&table));
        let (rows_inserted, skipped_batch) = match self
            .warehouse
            .append(&table, &extracted.frame, batch.as_ref())
            .await?
        {
            AppendOutcome::Inserted { rows } => {
                info!(%table, rows, "appended rows to staging");
                (rows, false)
            }
            AppendOutcome::AlreadyLoaded { loaded_at } => {
                info!(
                    %table,
                    sha256 = %extracted.summary.content_sha256,
                    %loaded_at,
                    "source already loaded, skipping append"
                );
                (0, true)
            }
        };

        Ok(LoadReport {
            table,
            table_created,
            divergence,
            summary: extracted.summary,
            rows_inserted,
            skipped_batch,
        })
    }

    /// Rebuild the cleaned table from staging.
    pub async fn clean(&self) -> Result<CleanReport, EtlError> {
        let staging = self.config.staging_table();
        let cleaned = self.config.cleaned_table();
        let options = CleanOptions {
            strict_binary_values: self.config.strict_binary_values,
        };
        let report = self
            .warehouse
            .clean_snapshot(&staging, &cleaned, &options)
            .await?;
        info!(
            table = %cleaned,
            report = %serde_json::to_string(&report).unwrap_or_default(),
            "cleaned table replaced"
        );
        Ok(report)
    }

    /// Run setup_db, load_data, clean_data in order. A failed step skips the rest.
    /// Returns immediately if another tick is still running.
    pub async fn run_tick(&self) -> TickSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let Ok(_running) = self.running.try_lock() else {
            warn!(%run_id, "previous tick still running, skipping this one");
            return TickSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                overlapped: true,
                steps: Vec::new(),
                failure: None,
            };
        };

        info!(%run_id, "pipeline tick started");
        let mut steps = Vec::with_capacity(PipelineStep::ORDER.len());
        let mut failure = None;
        for step in PipelineStep::ORDER {
            if failure.is_some() {
                steps.push(StepRecord::skipped(step));
                continue;
            }
            let (record, err) = self.run_step(run_id, step).await;
            steps.push(record);
            failure = err;
        }

        let summary = TickSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            overlapped: false,
            steps,
            failure,
        };
        match &summary.failure {
            None => info!(%run_id, "pipeline tick succeeded"),
            Some(err) => error!(%run_id, kind = %err.kind(), error = %err, "pipeline tick failed"),
        }
        summary
    }

    async fn run_step(&self, run_id: Uuid, step: PipelineStep) -> (StepRecord, Option<EtlError>) {
        let policy = self.config.retry_policy();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let span = info_span!("step", %run_id, step = step.task_id(), attempt);
            let result = self.attempt(step).instrument(span).await;
            match result {
                Ok(report) => {
                    let record = StepRecord {
                        step,
                        status: StepStatus::Success,
                        attempts: attempt,
                        error_kind: None,
                        error: None,
                        report: Some(report),
                    };
                    return (record, None);
                }
                Err(err) if err.is_retryable() && attempt <= policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt - 1);
                    warn!(
                        %run_id,
                        %step,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(%run_id, %step, attempt, kind = %err.kind(), error = %err, "step failed");
                    let record = StepRecord {
                        step,
                        status: StepStatus::Failed,
                        attempts: attempt,
                        error_kind: Some(err.kind()),
                        error: Some(err.to_string()),
                        report: None,
                    };
                    return (record, Some(err));
                }
            }
        }
    }

    async fn attempt(&self, step: PipelineStep) -> Result<StepReport, EtlError> {
        let mut entry = EtlLogEntry::started(step, Utc::now());
        // etl_logs may not exist before setup_db has run, so that step logs once at the end.
        let log_id = match step {
            PipelineStep::SetupDb => None,
            _ => self.open_log(&entry).await,
        };

        let result = match step {
            PipelineStep::SetupDb => self.bootstrap().await.map(StepReport::SetupDb),
            PipelineStep::LoadData => self.load().await.map(StepReport::LoadData),
            PipelineStep::CleanData => self.clean().await.map(StepReport::CleanData),
        };

        entry.finish(Utc::now(), result.as_ref().map(|_| ()));
        self.close_log(log_id, &entry).await;
        result
    }

    async fn open_log(&self, entry: &EtlLogEntry) -> Option<i32> {
        if !self.config.record_etl_logs {
            return None;
        }
        match self.warehouse.insert_log(entry).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(task_id = %entry.task_id, error = %err, "could not record step start");
                None
            }
        }
    }

    async fn close_log(&self, id: Option<i32>, entry: &EtlLogEntry) {
        if !self.config.record_etl_logs {
            return;
        }
        let result = match id {
            Some(id) => self.warehouse.finish_log(id, entry).await,
            None => self.warehouse.insert_log(entry).await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!(task_id = %entry.task_id, error = %err, "could not record step outcome");
        }
    }
}

pub async fn run_tick_from_env() -> Result<TickSummary, EtlError> {
    let config = PipelineConfig::load()?;
    Pipeline::postgres(config).run_tick().await.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use churnpipe_core::{Cell, Column, ColumnType, Frame, REQUIRED_COLUMNS};
    use churnpipe_storage::{schema_divergence, LoadBatch};
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemoryWarehouse {
        tables: StdMutex<HashMap<String, Frame>>,
        batches: StdMutex<HashSet<(String, String)>>,
        logs: StdMutex<Vec<EtlLogEntry>>,
        append_failures: AtomicUsize,
        reject_appends: AtomicBool,
    }

    impl MemoryWarehouse {
        fn failing_appends(n: usize) -> Self {
            let warehouse = Self::default();
            warehouse.append_failures.store(n, Ordering::SeqCst);
            warehouse
        }

        fn rejecting_appends() -> Self {
            let warehouse = Self::default();
            warehouse.reject_appends.store(true, Ordering::SeqCst);
            warehouse
        }

        fn table(&self, name: &str) -> Option<Frame> {
            self.tables.lock().unwrap().get(name).cloned()
        }

        fn logs(&self) -> Vec<EtlLogEntry> {
            self.logs.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Warehouse for MemoryWarehouse {
        async fn ensure_database(&self) -> Result<DatabaseStatus, EtlError> {
            Ok(DatabaseStatus::AlreadyExists)
        }

        async fn ensure_schema(&self) -> Result<(), EtlError> {
            Ok(())
        }

        async fn ensure_table(&self, table: &str, columns: &[Column]) -> Result<TableStatus, EtlError> {
            let mut tables = self.tables.lock().unwrap();
            match tables.get(table) {
                Some(existing) => Ok(TableStatus::Existing {
                    divergence: schema_divergence(existing.columns(), columns),
                }),
                None => {
                    tables.insert(table.to_string(), Frame::new(columns.to_vec()));
                    Ok(TableStatus::Created)
                }
            }
        }

        async fn append(
            &self,
            table: &str,
            frame: &Frame,
            batch: Option<&LoadBatch>,
        ) -> Result<AppendOutcome, EtlError> {
            if self
                .append_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EtlError::write_failure(table, "connection reset"));
            }
            if self.reject_appends.load(Ordering::SeqCst) {
                return Err(EtlError::write_rejected(table, "column \"age\" does not exist"));
            }
            let key = batch.map(|b| (b.content_sha256.clone(), b.table_name.clone()));
            if let Some(key) = &key {
                if self.batches.lock().unwrap().contains(key) {
                    return Ok(AppendOutcome::AlreadyLoaded {
                        loaded_at: Utc::now(),
                    });
                }
            }
            let mut tables = self.tables.lock().unwrap();
            let target = tables
                .get_mut(table)
                .ok_or_else(|| EtlError::write_failure(table, "no such table"))?;
            for row in frame.rows() {
                target.push_row(row.clone())?;
            }
            if let Some(key) = key {
                self.batches.lock().unwrap().insert(key);
            }
            Ok(AppendOutcome::Inserted {
                rows: frame.height() as u64,
            })
        }

        async fn clean_snapshot(
            &self,
            staging: &str,
            cleaned: &str,
            options: &CleanOptions,
        ) -> Result<CleanReport, EtlError> {
            let frame = self
                .table(staging)
                .ok_or_else(|| EtlError::source_unreadable(staging, "table does not exist"))?;
            let outcome = clean_frame(&frame, staging, options)?;
            self.tables
                .lock()
                .unwrap()
                .insert(cleaned.to_string(), outcome.frame);
            Ok(outcome.report)
        }

        async fn insert_log(&self, entry: &EtlLogEntry) -> Result<i32, EtlError> {
            let mut logs = self.logs.lock().unwrap();
            let id = logs.len() as i32 + 1;
            logs.push(EtlLogEntry {
                id: Some(id),
                ..entry.clone()
            });
            Ok(id)
        }

        async fn finish_log(&self, id: i32, entry: &EtlLogEntry) -> Result<(), EtlError> {
            let mut logs = self.logs.lock().unwrap();
            let slot = logs
                .iter_mut()
                .find(|e| e.id == Some(id))
                .ok_or_else(|| EtlError::write_failure("etl_logs", "unknown log id"))?;
            *slot = EtlLogEntry {
                id: Some(id),
                ..entry.clone()
            };
            Ok(())
        }
    }

    fn fixture_path() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/customer_churn_sample.csv")
    }

    fn config_for(csv_path: PathBuf) -> PipelineConfig {
        PipelineConfig {
            csv_path,
            schedule: ScheduleConfig {
                retries: 1,
                retry_delay_secs: 0,
                ..ScheduleConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn pipeline(csv_path: PathBuf, warehouse: Arc<MemoryWarehouse>) -> Pipeline {
        Pipeline::new(config_for(csv_path), warehouse)
    }

    #[tokio::test]
    async fn tick_runs_all_three_steps_in_order() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(fixture_path(), warehouse.clone());

        let summary = pipeline.run_tick().await;
        assert!(summary.succeeded(), "{:?}", summary.failure);
        let order = summary.steps.iter().map(|r| r.step).collect::<Vec<_>>();
        assert_eq!(order, PipelineStep::ORDER.to_vec());
        assert!(summary.steps.iter().all(|r| r.status == StepStatus::Success));

        let cleaned = warehouse.table("customer_data_cleaned").unwrap();
        assert_eq!(cleaned.column_names(), REQUIRED_COLUMNS.to_vec());
        assert_eq!(cleaned.height(), 11);
        let contract = cleaned.column_index("contracttype").unwrap();
        assert!(cleaned
            .column_cells(contract)
            .all(|c| matches!(c.as_text(), Some("Monthly" | "Yearly" | "2-Yearly"))));
        let churn = cleaned.column_index("churn").unwrap();
        assert!(cleaned.column_cells(churn).all(|c| matches!(c, Cell::Boolean(_))));
        let charges = cleaned.column_index("totalcharges").unwrap();
        assert_eq!(cleaned.columns()[charges].kind, ColumnType::Float);
    }

    #[tokio::test]
    async fn every_step_attempt_is_logged() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(fixture_path(), warehouse.clone());
        pipeline.run_tick().await;

        let logs = warehouse.logs();
        let tasks = logs.iter().map(|e| e.task_id.as_str()).collect::<Vec<_>>();
        assert_eq!(tasks, vec!["setup_db", "load_data", "clean_data"]);
        assert!(logs
            .iter()
            .all(|e| e.status == StepStatus::Success && e.end_time.is_some()));
    }

    #[tokio::test]
    async fn unchanged_source_is_not_appended_twice() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(fixture_path(), warehouse.clone());

        pipeline.run_tick().await;
        let second = pipeline.run_tick().await;
        assert!(second.succeeded());
        match &second.step(PipelineStep::LoadData).unwrap().report {
            Some(StepReport::LoadData(report)) => {
                assert!(report.skipped_batch);
                assert!(!report.table_created);
                assert!(report.divergence.is_empty());
                assert_eq!(report.rows_inserted, 0);
            }
            other => panic!("unexpected report {other:?}"),
        }
        assert_eq!(warehouse.table("customer_data").unwrap().height(), 11);
    }

    #[tokio::test]
    async fn missing_source_fails_without_retry_and_skips_clean() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(dir.path().join("absent.csv"), warehouse.clone());

        let summary = pipeline.run_tick().await;
        assert!(!summary.succeeded());
        let load = summary.step(PipelineStep::LoadData).unwrap();
        assert_eq!(load.status, StepStatus::Failed);
        assert_eq!(load.attempts, 1);
        assert_eq!(load.error_kind, Some(ErrorKind::SourceUnreadable));
        let clean = summary.step(PipelineStep::CleanData).unwrap();
        assert_eq!(clean.status, StepStatus::Skipped);
        assert!(warehouse.table("customer_data_cleaned").is_none());

        let failed = warehouse
            .logs()
            .into_iter()
            .find(|e| e.task_id == "load_data")
            .unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed
            .error_message
            .unwrap()
            .starts_with("[source-unreadable]"));
        assert_eq!(
            summary.into_result().unwrap_err().kind(),
            ErrorKind::SourceUnreadable
        );
    }

    #[tokio::test]
    async fn transient_write_failure_is_retried() {
        let warehouse = Arc::new(MemoryWarehouse::failing_appends(1));
        let pipeline = pipeline(fixture_path(), warehouse.clone());

        let summary = pipeline.run_tick().await;
        assert!(summary.succeeded(), "{:?}", summary.failure);
        assert_eq!(summary.step(PipelineStep::LoadData).unwrap().attempts, 2);
        let load_logs = warehouse
            .logs()
            .into_iter()
            .filter(|e| e.task_id == "load_data")
            .map(|e| e.status)
            .collect::<Vec<_>>();
        assert_eq!(load_logs, vec![StepStatus::Failed, StepStatus::Success]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let warehouse = Arc::new(MemoryWarehouse::failing_appends(5));
        let pipeline = pipeline(fixture_path(), warehouse.clone());

        let summary = pipeline.run_tick().await;
        let load = summary.step(PipelineStep::LoadData).unwrap();
        assert_eq!(load.status, StepStatus::Failed);
        assert_eq!(load.attempts, 2);
        assert_eq!(load.error_kind, Some(ErrorKind::WriteFailure));
    }

    #[tokio::test]
    async fn rejected_write_is_not_retried() {
        let warehouse = Arc::new(MemoryWarehouse::rejecting_appends());
        let pipeline = pipeline(fixture_path(), warehouse.clone());

        let summary = pipeline.run_tick().await;
        let load = summary.step(PipelineStep::LoadData).unwrap();
        assert_eq!(load.status, StepStatus::Failed);
        assert_eq!(load.attempts, 1);
        assert_eq!(load.error_kind, Some(ErrorKind::WriteFailure));
        assert_eq!(
            summary.step(PipelineStep::CleanData).unwrap().status,
            StepStatus::Skipped
        );
    }

    #[tokio::test]
    async fn missing_required_columns_leave_no_cleaned_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.csv");
        std::fs::write(&path, "CustomerID,Age,Gender\n1,30,Male\n2,40,Female\n").unwrap();
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(path, warehouse.clone());

        let summary = pipeline.run_tick().await;
        let clean = summary.step(PipelineStep::CleanData).unwrap();
        assert_eq!(clean.error_kind, Some(ErrorKind::MissingColumns));
        assert_eq!(clean.attempts, 1);
        assert!(warehouse.table("customer_data").is_some());
        assert!(warehouse.table("customer_data_cleaned").is_none());
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(fixture_path(), warehouse.clone());

        let _held = pipeline.running.lock().await;
        let summary = pipeline.run_tick().await;
        assert!(summary.overlapped);
        assert!(summary.steps.is_empty());
        assert!(!summary.succeeded());
        assert!(warehouse.logs().is_empty());
    }

    #[tokio::test]
    async fn etl_log_writes_can_be_disabled() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let config = PipelineConfig {
            record_etl_logs: false,
            ..config_for(fixture_path())
        };
        let pipeline = Pipeline::new(config, warehouse.clone());
        assert!(pipeline.run_tick().await.succeeded());
        assert!(warehouse.logs().is_empty());
    }

    #[tokio::test]
    async fn tick_summary_serializes_step_reports() {
        let warehouse = Arc::new(MemoryWarehouse::default());
        let pipeline = pipeline(fixture_path(), warehouse);
        let summary = pipeline.run_tick().await;
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["steps"][1]["step"], "load_data");
        assert_eq!(json["steps"][1]["report"]["step"], "load_data");
        assert_eq!(json["steps"][1]["report"]["summary"]["rows_kept"], 11);
    }
}
