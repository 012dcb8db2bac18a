use async_trait::async_trait;
use churnpipe_core::{Column, EtlError, EtlLogEntry, Frame};
use churnpipe_storage::{
    append_frame, connection_error, ensure_database, ensure_schema, ensure_table, lock_for_clean,
    read_table, recent_logs, replace_table, write_error, AppendOutcome, DatabaseSettings,
    DatabaseStatus, LoadBatch, TableStatus,
};
use sqlx::PgPool;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::clean::{clean_frame, CleanOptions, CleanReport};

/// Everything the pipeline stages need from the store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_database(&self) -> Result<DatabaseStatus, EtlError>;

    async fn ensure_schema(&self) -> Result<(), EtlError>;

    async fn ensure_table(&self, table: &str, columns: &[Column]) -> Result<TableStatus, EtlError>;

    async fn append(
        &self,
        table: &str,
        frame: &Frame,
        batch: Option<&LoadBatch>,
    ) -> Result<AppendOutcome, EtlError>;

    /// Read `staging`, clean it, and replace `cleaned` as one consistent snapshot.
    async fn clean_snapshot(
        &self,
        staging: &str,
        cleaned: &str,
        options: &CleanOptions,
    ) -> Result<CleanReport, EtlError>;

    async fn insert_log(&self, entry: &EtlLogEntry) -> Result<i32, EtlError>;

    async fn finish_log(&self, id: i32, entry: &EtlLogEntry) -> Result<(), EtlError>;
}

/// PostgreSQL warehouse. The pool is opened on first use so bootstrap can create the
/// database before anything connects to it.
pub struct PgWarehouse {
    settings: DatabaseSettings,
    pool: OnceCell<PgPool>,
}

impl PgWarehouse {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            pool: OnceCell::new(),
        }
    }

    /// Warehouse over a pool the caller already opened.
    pub fn with_pool(settings: DatabaseSettings, pool: PgPool) -> Self {
        Self {
            settings,
            pool: OnceCell::new_with(Some(pool)),
        }
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub async fn pool(&self) -> Result<&PgPool, EtlError> {
        self.pool
            .get_or_try_init(|| async {
                debug!(settings = ?self.settings, "opening connection pool");
                self.settings.connect().await
            })
            .await
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<EtlLogEntry>, EtlError> {
        recent_logs(self.pool().await?, limit).await
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_database(&self) -> Result<DatabaseStatus, EtlError> {
        ensure_database(&self.settings).await
    }

    async fn ensure_schema(&self) -> Result<(), EtlError> {
        ensure_schema(self.pool().await?).await
    }

    async fn ensure_table(&self, table: &str, columns: &[Column]) -> Result<TableStatus, EtlError> {
        ensure_table(self.pool().await?, table, columns).await
    }

    async fn append(
        &self,
        table: &str,
        frame: &Frame,
        batch: Option<&LoadBatch>,
    ) -> Result<AppendOutcome, EtlError> {
        append_frame(self.pool().await?, table, frame, batch).await
    }

    async fn clean_snapshot(
        &self,
        staging: &str,
        cleaned: &str,
        options: &CleanOptions,
    ) -> Result<CleanReport, EtlError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(connection_error)?;
        lock_for_clean(&mut *tx, staging, cleaned).await?;
        let frame = read_table(&mut *tx, staging).await?;
        let outcome = clean_frame(&frame, staging, options)?;
        replace_table(&mut *tx, cleaned, &outcome.frame).await?;
        tx.commit().await.map_err(|err| write_error(cleaned, err))?;
        Ok(outcome.report)
    }

    async fn insert_log(&self, entry: &EtlLogEntry) -> Result<i32, EtlError> {
        churnpipe_storage::insert_log(self.pool().await?, entry)
            .await
            .map_err(|err| write_error("etl_logs", err))
    }

    async fn finish_log(&self, id: i32, entry: &EtlLogEntry) -> Result<(), EtlError> {
        churnpipe_storage::finish_log(self.pool().await?, id, entry)
            .await
            .map_err(|err| write_error("etl_logs", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use churnpipe_core::{Cell, ColumnType, ErrorKind};
    use churnpipe_loader::extract_csv;
    use sqlx::postgres::PgConnectOptions;
    use std::path::PathBuf;
    use std::time::Duration;

    async fn live_warehouse() -> Option<PgWarehouse> {
        let url = std::env::var("CHURNPIPE_TEST_DATABASE_URL").ok()?;
        let options = url.parse::<PgConnectOptions>().expect("database url");
        let settings = DatabaseSettings {
            host: options.get_host().to_string(),
            port: options.get_port(),
            username: options.get_username().to_string(),
            password: String::new(),
            database: options.get_database().unwrap_or("postgres").to_string(),
            maintenance_database: "postgres".to_string(),
            max_connections: 2,
            acquire_timeout: Duration::from_secs(10),
        };
        let pool = PgPool::connect(&url).await.expect("connect");
        let warehouse = PgWarehouse::with_pool(settings, pool);
        warehouse.ensure_schema().await.expect("schema");
        Some(warehouse)
    }

    async fn drop_tables(warehouse: &PgWarehouse, tables: &[&str]) {
        let pool = warehouse.pool().await.expect("pool");
        for table in tables {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", churnpipe_storage::quote_ident(table)))
                .execute(pool)
                .await
                .expect("drop");
        }
    }

    async fn read_back(warehouse: &PgWarehouse, table: &str) -> Frame {
        let mut conn = warehouse.pool().await.expect("pool").acquire().await.expect("acquire");
        read_table(&mut conn, table).await.expect("read")
    }

    async fn stage(warehouse: &PgWarehouse, table: &str, frame: &Frame) {
        warehouse
            .ensure_table(table, frame.columns())
            .await
            .expect("ensure staging");
        warehouse.append(table, frame, None).await.expect("append");
    }

    #[tokio::test]
    async fn cleaning_twice_stores_identical_tables() {
        let Some(warehouse) = live_warehouse().await else {
            return;
        };
        let staging = "churnpipe_test_clean_src";
        let cleaned = "churnpipe_test_clean_src_cleaned";
        drop_tables(&warehouse, &[staging, cleaned]).await;

        let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/customer_churn_sample.csv");
        let extracted = extract_csv(&fixture).expect("fixture");
        stage(&warehouse, staging, &extracted.frame).await;

        let options = CleanOptions::default();
        let first_report = warehouse
            .clean_snapshot(staging, cleaned, &options)
            .await
            .expect("first clean");
        let first = read_back(&warehouse, cleaned).await;
        let second_report = warehouse
            .clean_snapshot(staging, cleaned, &options)
            .await
            .expect("second clean");
        let second = read_back(&warehouse, cleaned).await;

        assert_eq!(first, second);
        assert_eq!(first_report, second_report);
        assert_eq!(first.height(), first_report.rows_written);

        let kind_of = |name: &str| first.columns()[first.column_index(name).unwrap()].kind;
        assert_eq!(kind_of("totalcharges"), ColumnType::Float);
        assert_eq!(kind_of("churn"), ColumnType::Boolean);
        assert_eq!(kind_of("techsupport"), ColumnType::Boolean);
        let churn = first.column_index("churn").unwrap();
        assert!(first
            .column_cells(churn)
            .all(|c| matches!(c, Cell::Boolean(_) | Cell::Null)));
    }

    #[tokio::test]
    async fn failed_clean_leaves_existing_cleaned_table_untouched() {
        let Some(warehouse) = live_warehouse().await else {
            return;
        };
        let staging = "churnpipe_test_partial";
        let cleaned = "churnpipe_test_partial_cleaned";
        drop_tables(&warehouse, &[staging, cleaned]).await;

        let previous = Frame::from_rows(
            vec![Column::new("customerid", ColumnType::Integer)],
            vec![vec![Cell::Integer(7)], vec![Cell::Integer(8)]],
        )
        .expect("frame");
        stage(&warehouse, cleaned, &previous).await;

        let partial = Frame::from_rows(
            vec![
                Column::new("customerid", ColumnType::Integer),
                Column::new("age", ColumnType::Integer),
            ],
            vec![vec![Cell::Integer(1), Cell::Integer(30)]],
        )
        .expect("frame");
        stage(&warehouse, staging, &partial).await;

        let err = warehouse
            .clean_snapshot(staging, cleaned, &CleanOptions::default())
            .await
            .expect_err("staging lacks required columns");
        assert_eq!(err.kind(), ErrorKind::MissingColumns);
        assert_eq!(read_back(&warehouse, cleaned).await.rows(), previous.rows());
    }
}
