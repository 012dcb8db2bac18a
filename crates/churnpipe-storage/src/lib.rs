//! PostgreSQL persistence for churnpipe: bootstrap, staging + cleaned tables, ETL logs.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use churnpipe_core::{
    Cell, CleanedCustomer, Column, ColumnType, EtlError, EtlLogEntry, Frame, StepStatus,
};
use sha2::{Digest, Sha256};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query_builder::Separated;
use sqlx::{Connection, QueryBuilder, Row};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "churnpipe-storage";

/// PostgreSQL caps a statement at 65535 bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub maintenance_database: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("maintenance_database", &self.maintenance_database)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl DatabaseSettings {
    fn base_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        self.base_options().database(&self.database)
    }

    pub fn maintenance_options(&self) -> PgConnectOptions {
        self.base_options().database(&self.maintenance_database)
    }

    pub async fn connect(&self) -> Result<PgPool, EtlError> {
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .acquire_timeout(self.acquire_timeout)
            .connect_with(self.connect_options())
            .await
            .map_err(|err| {
                EtlError::Connection(format!(
                    "{}@{}:{}/{}: {err}",
                    self.username, self.host, self.port, self.database
                ))
            })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase SQL identifier that needs no quoting and fits PostgreSQL's 63-byte limit.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Stable advisory-lock key for a table name.
pub fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

const RETRYABLE_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "57P01"];

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("08") || RETRYABLE_SQLSTATES.iter().any(|c| code == *c) => {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(_) => sqlstate(err).is_some_and(|c| c.starts_with("08")),
        _ => classify_sqlx_error(err) == RetryDisposition::Retryable,
    }
}

pub fn connection_error(err: sqlx::Error) -> EtlError {
    EtlError::Connection(err.to_string())
}

/// Failures while reading `table`: transport trouble is a connection failure, anything
/// else (missing table, bad cast) means the table cannot be read.
pub fn read_error(table: &str, err: sqlx::Error) -> EtlError {
    if is_connection_error(&err) {
        connection_error(err)
    } else {
        EtlError::source_unreadable(table, err)
    }
}

/// Failures while writing `table`. Statements the server refuses (undefined column,
/// out-of-range value) are not worth another attempt; transient conflicts are.
pub fn write_error(table: &str, err: sqlx::Error) -> EtlError {
    if is_connection_error(&err) {
        connection_error(err)
    } else if classify_sqlx_error(&err) == RetryDisposition::Retryable {
        EtlError::write_failure(table, err)
    } else {
        EtlError::write_rejected(table, err)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(1, Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseStatus {
    Created,
    AlreadyExists,
}

/// Create the target database through the maintenance database unless it exists.
pub async fn ensure_database(settings: &DatabaseSettings) -> Result<DatabaseStatus, EtlError> {
    let mut conn = PgConnection::connect_with(&settings.maintenance_options())
        .await
        .map_err(connection_error)?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&settings.database)
            .fetch_one(&mut conn)
            .await
            .map_err(connection_error)?;

    let status = if exists {
        DatabaseStatus::AlreadyExists
    } else {
        let statement = format!("CREATE DATABASE {}", quote_ident(&settings.database));
        match sqlx::query(&statement).execute(&mut conn).await {
            Ok(_) => DatabaseStatus::Created,
            Err(err) if sqlstate(&err).as_deref() == Some("42P04") => DatabaseStatus::AlreadyExists,
            Err(err) => return Err(write_error(&settings.database, err)),
        }
    };

    if let Err(err) = conn.close().await {
        warn!(error = %err, "closing maintenance connection");
    }
    match status {
        DatabaseStatus::Created => info!(database = %settings.database, "database created"),
        DatabaseStatus::AlreadyExists => {
            info!(database = %settings.database, "database already exists")
        }
    }
    Ok(status)
}

/// Apply the embedded migrations (`etl_logs`, `load_batches`).
pub async fn ensure_schema(pool: &PgPool) -> Result<(), EtlError> {
    MIGRATOR.run(pool).await.map_err(|err| match err {
        sqlx::migrate::MigrateError::Execute(inner) => write_error("etl_logs", inner),
        other => EtlError::write_failure("etl_logs", other),
    })?;
    info!("etl_logs and load_batches tables ensured");
    Ok(())
}

pub async fn table_columns(
    conn: &mut PgConnection,
    table: &str,
) -> Result<Vec<Column>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT column_name::text AS column_name,
               data_type::text AS data_type
          FROM information_schema.columns
         WHERE table_schema = current_schema()
           AND table_name = $1
         ORDER BY ordinal_position
        "#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        out.push(Column::new(name, ColumnType::from_catalog_name(&data_type)));
    }
    Ok(out)
}

pub fn create_table_sql(table: &str, columns: &[Column], if_not_exists: bool) -> String {
    let defs = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    format!("CREATE TABLE {guard}{} ({defs})", quote_ident(table))
}

/// Names whose presence or storage type differs between an existing table and a frame.
pub fn schema_divergence(existing: &[Column], wanted: &[Column]) -> Vec<String> {
    let mut out = Vec::new();
    for column in wanted {
        match existing.iter().find(|e| e.name == column.name) {
            None => out.push(format!("{} (missing from table)", column.name)),
            Some(e) if e.kind != column.kind => out.push(format!(
                "{} (table {}, source {})",
                column.name, e.kind, column.kind
            )),
            Some(_) => {}
        }
    }
    for column in existing {
        if !wanted.iter().any(|w| w.name == column.name) {
            out.push(format!("{} (absent from source)", column.name));
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableStatus {
    Created,
    Existing { divergence: Vec<String> },
}

/// Create `table` from the frame's schema if absent. An existing table keeps its schema.
pub async fn ensure_table(pool: &PgPool, table: &str, columns: &[Column]) -> Result<TableStatus, EtlError> {
    let mut conn = pool.acquire().await.map_err(connection_error)?;
    let existing = table_columns(&mut conn, table)
        .await
        .map_err(|err| read_error(table, err))?;
    if !existing.is_empty() {
        return Ok(TableStatus::Existing {
            divergence: schema_divergence(&existing, columns),
        });
    }

    sqlx::query(&create_table_sql(table, columns, true))
        .execute(&mut *conn)
        .await
        .map_err(|err| write_error(table, err))?;
    Ok(TableStatus::Created)
}

fn push_cell(sep: &mut Separated<'_, '_, Postgres, &'static str>, cell: &Cell, kind: ColumnType) {
    match kind {
        ColumnType::Text => {
            let value = match cell {
                Cell::Null => None,
                Cell::Text(v) => Some(v.clone()),
                other => Some(other.to_string()),
            };
            sep.push_bind(value);
        }
        ColumnType::Integer => {
            let value = match cell {
                Cell::Integer(v) => Some(*v),
                Cell::Boolean(v) => Some(i64::from(*v)),
                other => other.to_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64),
            };
            sep.push_bind(value);
        }
        ColumnType::Float => {
            sep.push_bind(cell.to_f64());
        }
        ColumnType::Boolean => {
            let value = match cell {
                Cell::Boolean(v) => Some(*v),
                _ => None,
            };
            sep.push_bind(value);
        }
        ColumnType::Timestamp => {
            let value = match cell {
                Cell::Timestamp(v) => Some(*v),
                _ => None,
            };
            sep.push_bind(value);
        }
    }
}

/// Bulk insert every row of `frame`, chunked under the bind-parameter cap.
pub async fn insert_rows(conn: &mut PgConnection, table: &str, frame: &Frame) -> Result<u64, sqlx::Error> {
    if frame.width() == 0 {
        return Ok(0);
    }
    let rows_per_statement = (MAX_BIND_PARAMS / frame.width()).max(1);
    let column_list = frame
        .columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut inserted = 0u64;
    for chunk in frame.rows().chunks(rows_per_statement) {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({column_list}) ", quote_ident(table)));
        qb.push_values(chunk, |mut sep, row| {
            for (cell, column) in row.iter().zip(frame.columns()) {
                push_cell(&mut sep, cell, column.kind);
            }
        });
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBatch {
    pub content_sha256: String,
    pub table_name: String,
    pub source_path: String,
    pub row_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted { rows: u64 },
    AlreadyLoaded { loaded_at: DateTime<Utc> },
}

/// Append `frame` to `table`. With a batch, the batch is recorded in the same
/// transaction, and a batch seen before is skipped.
pub async fn append_frame(
    pool: &PgPool,
    table: &str,
    frame: &Frame,
    batch: Option<&LoadBatch>,
) -> Result<AppendOutcome, EtlError> {
    let mut tx = pool.begin().await.map_err(connection_error)?;

    if let Some(batch) = batch {
        let loaded_at: Option<NaiveDateTime> = sqlx::query_scalar(
            "SELECT loaded_at FROM load_batches WHERE content_sha256 = $1 AND table_name = $2",
        )
        .bind(&batch.content_sha256)
        .bind(&batch.table_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| read_error("load_batches", err))?;
        if let Some(loaded_at) = loaded_at {
            return Ok(AppendOutcome::AlreadyLoaded {
                loaded_at: loaded_at.and_utc(),
            });
        }
    }

    let rows = insert_rows(&mut *tx, table, frame)
        .await
        .map_err(|err| write_error(table, err))?;

    if let Some(batch) = batch {
        sqlx::query(
            r#"
            INSERT INTO load_batches (content_sha256, table_name, source_path, row_count)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&batch.content_sha256)
        .bind(&batch.table_name)
        .bind(&batch.source_path)
        .bind(batch.row_count)
        .execute(&mut *tx)
        .await
        .map_err(|err| write_error("load_batches", err))?;
    }

    tx.commit().await.map_err(|err| write_error(table, err))?;
    Ok(AppendOutcome::Inserted { rows })
}

fn select_expr(column: &Column) -> String {
    let cast = match column.kind {
        ColumnType::Text => "text",
        ColumnType::Integer => "bigint",
        ColumnType::Float => "double precision",
        ColumnType::Boolean => "boolean",
        ColumnType::Timestamp => "timestamp",
    };
    format!("{}::{cast}", quote_ident(&column.name))
}

pub fn select_table_sql(table: &str, columns: &[Column]) -> String {
    let exprs = columns.iter().map(select_expr).collect::<Vec<_>>().join(", ");
    format!("SELECT {exprs} FROM {} ORDER BY ctid", quote_ident(table))
}

fn decode_cell(row: &PgRow, index: usize, kind: ColumnType) -> Result<Cell, sqlx::Error> {
    let cell = match kind {
        ColumnType::Text => row.try_get::<Option<String>, _>(index)?.map(Cell::Text),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(index)?.map(Cell::Integer),
        ColumnType::Float => row.try_get::<Option<f64>, _>(index)?.map(Cell::Float),
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(index)?.map(Cell::Boolean),
        ColumnType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(Cell::Timestamp),
    };
    Ok(cell.unwrap_or(Cell::Null))
}

/// Read a whole table in physical row order, typed by its catalog column types.
pub async fn read_table(conn: &mut PgConnection, table: &str) -> Result<Frame, EtlError> {
    let columns = table_columns(conn, table)
        .await
        .map_err(|err| read_error(table, err))?;
    if columns.is_empty() {
        return Err(EtlError::source_unreadable(table, "table does not exist"));
    }

    let rows = sqlx::query(&select_table_sql(table, &columns))
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| read_error(table, err))?;

    let mut frame = Frame::new(columns.clone());
    for row in rows {
        let cells = columns
            .iter()
            .enumerate()
            .map(|(i, c)| decode_cell(&row, i, c.kind))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| read_error(table, err))?;
        frame.push_row(cells)?;
    }
    Ok(frame)
}

/// Take the locks a clean run needs inside its transaction: an advisory lock per cleaned
/// table, and a SHARE lock on staging so appends wait until commit.
pub async fn lock_for_clean(
    conn: &mut PgConnection,
    staging_table: &str,
    cleaned_table: &str,
) -> Result<(), EtlError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(advisory_key(cleaned_table))
        .execute(&mut *conn)
        .await
        .map_err(connection_error)?;
    sqlx::query(&format!("LOCK TABLE {} IN SHARE MODE", quote_ident(staging_table)))
        .execute(&mut *conn)
        .await
        .map_err(|err| read_error(staging_table, err))?;
    Ok(())
}

/// Drop and recreate `table` from `frame`. Callers run this inside a transaction so
/// readers never see the table missing.
pub async fn replace_table(conn: &mut PgConnection, table: &str, frame: &Frame) -> Result<u64, EtlError> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
        .execute(&mut *conn)
        .await
        .map_err(|err| write_error(table, err))?;
    sqlx::query(&create_table_sql(table, frame.columns(), false))
        .execute(&mut *conn)
        .await
        .map_err(|err| write_error(table, err))?;
    insert_rows(conn, table, frame)
        .await
        .map_err(|err| write_error(table, err))
}

pub async fn insert_log(pool: &PgPool, entry: &EtlLogEntry) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO etl_logs (task_id, status, start_time, end_time, error_message)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(&entry.task_id)
    .bind(entry.status.as_str())
    .bind(entry.start_time.naive_utc())
    .bind(entry.end_time.map(|t| t.naive_utc()))
    .bind(&entry.error_message)
    .fetch_one(pool)
    .await
}

pub async fn finish_log(pool: &PgPool, id: i32, entry: &EtlLogEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE etl_logs
           SET status = $2,
               end_time = $3,
               error_message = $4
         WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(entry.status.as_str())
    .bind(entry.end_time.map(|t| t.naive_utc()))
    .bind(&entry.error_message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_logs(pool: &PgPool, limit: i64) -> Result<Vec<EtlLogEntry>, EtlError> {
    let rows = sqlx::query(
        r#"
        SELECT id, task_id, status, start_time, end_time, error_message
          FROM etl_logs
         ORDER BY id DESC
         LIMIT $1
        "#,
    )
    .bind(limit.max(1))
    .fetch_all(pool)
    .await
    .map_err(|err| read_error("etl_logs", err))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let status: Option<String> = row.try_get("status").map_err(|e| read_error("etl_logs", e))?;
        let start_time: Option<NaiveDateTime> =
            row.try_get("start_time").map_err(|e| read_error("etl_logs", e))?;
        let end_time: Option<NaiveDateTime> =
            row.try_get("end_time").map_err(|e| read_error("etl_logs", e))?;
        out.push(EtlLogEntry {
            id: row.try_get("id").map_err(|e| read_error("etl_logs", e))?,
            task_id: row
                .try_get::<Option<String>, _>("task_id")
                .map_err(|e| read_error("etl_logs", e))?
                .unwrap_or_default(),
            status: status
                .as_deref()
                .and_then(StepStatus::from_label)
                .unwrap_or(StepStatus::Running),
            start_time: start_time.map(|t| t.and_utc()).unwrap_or_default(),
            end_time: end_time.map(|t| t.and_utc()),
            error_message: row
                .try_get("error_message")
                .map_err(|e| read_error("etl_logs", e))?,
        });
    }
    Ok(out)
}

/// Read the cleaned table into typed rows for presentation.
pub async fn load_cleaned_customers(pool: &PgPool, table: &str) -> Result<Vec<CleanedCustomer>, EtlError> {
    let query = format!(
        r#"
        SELECT customerid::text AS customerid,
               age::double precision AS age,
               gender::text AS gender,
               tenure::double precision AS tenure,
               monthlycharges::double precision AS monthlycharges,
               contracttype::text AS contracttype,
               internetservice::text AS internetservice,
               totalcharges::double precision AS totalcharges,
               techsupport::boolean AS techsupport,
               churn::boolean AS churn
          FROM {}
         ORDER BY ctid
        "#,
        quote_ident(table)
    );
    let rows = sqlx::query(&query)
        .fetch_all(pool)
        .await
        .map_err(|err| read_error(table, err))?;

    rows.iter()
        .map(|row| -> Result<CleanedCustomer, sqlx::Error> {
            Ok(CleanedCustomer {
                customer_id: row
                    .try_get::<Option<String>, _>("customerid")?
                    .unwrap_or_default(),
                age: row.try_get("age")?,
                gender: row.try_get("gender")?,
                tenure: row.try_get("tenure")?,
                monthly_charges: row.try_get("monthlycharges")?,
                contract_type: row.try_get("contracttype")?,
                internet_service: row.try_get("internetservice")?,
                total_charges: row.try_get("totalcharges")?,
                tech_support: row.try_get("techsupport")?,
                churn: row.try_get("churn")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| read_error(table, err))
}
