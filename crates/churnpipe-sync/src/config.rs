use std::path::{Path, PathBuf};
use std::time::Duration;

use churnpipe_core::EtlError;
use churnpipe_storage::{is_sql_identifier, DatabaseSettings, RetryPolicy};
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "CHURNPIPE_CONFIG";

/// Postgres caps identifiers at this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub maintenance_name: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            name: "prediction_data".to_string(),
            maintenance_name: "postgres".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub staging: String,
    pub cleaned_suffix: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            staging: "customer_data".to_string(),
            cleaned_suffix: "_cleaned".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub cron: String,
    pub retries: usize,
    pub retry_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 * * * *".to_string(),
            retries: 1,
            retry_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
    pub cache_ttl_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8501,
            cache_ttl_secs: 300,
        }
    }
}

/// Everything a pipeline process needs, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub tables: TableConfig,
    pub csv_path: PathBuf,
    pub schedule: ScheduleConfig,
    pub web: WebConfig,
    pub skip_loaded_batches: bool,
    pub record_etl_logs: bool,
    pub strict_binary_values: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            tables: TableConfig::default(),
            csv_path: PathBuf::from("/data/customer_churn_data.csv"),
            schedule: ScheduleConfig::default(),
            web: WebConfig::default(),
            skip_loaded_batches: true,
            record_etl_logs: true,
            strict_binary_values: false,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the YAML file named by `CHURNPIPE_CONFIG`, then `CHURNPIPE_*` overrides.
    pub fn load() -> Result<Self, EtlError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EtlError> {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, EtlError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EtlError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_yaml_str(&raw)
            .map_err(|err| EtlError::Config(format!("parsing {}: {err}", path.display())))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), EtlError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("CHURNPIPE_DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = get("CHURNPIPE_DB_PORT") {
            self.database.port = parse_env("CHURNPIPE_DB_PORT", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_DB_USER") {
            self.database.user = v;
        }
        if let Some(v) = get("CHURNPIPE_DB_PASSWORD") {
            self.database.password = v;
        }
        if let Some(v) = get("CHURNPIPE_DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("CHURNPIPE_DB_MAINTENANCE_NAME") {
            self.database.maintenance_name = v;
        }
        if let Some(v) = get("CHURNPIPE_STAGING_TABLE") {
            self.tables.staging = v;
        }
        if let Some(v) = lookup("CHURNPIPE_CLEANED_SUFFIX") {
            self.tables.cleaned_suffix = v;
        }
        if let Some(v) = get("CHURNPIPE_CSV_PATH") {
            self.csv_path = PathBuf::from(v);
        }
        if let Some(v) = get("CHURNPIPE_SCHEDULE_CRON") {
            self.schedule.cron = v;
        }
        if let Some(v) = get("CHURNPIPE_RETRIES") {
            self.schedule.retries = parse_env("CHURNPIPE_RETRIES", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_RETRY_DELAY_SECS") {
            self.schedule.retry_delay_secs = parse_env("CHURNPIPE_RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_WEB_PORT") {
            self.web.port = parse_env("CHURNPIPE_WEB_PORT", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_CACHE_TTL_SECS") {
            self.web.cache_ttl_secs = parse_env("CHURNPIPE_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_SKIP_LOADED_BATCHES") {
            self.skip_loaded_batches = parse_flag("CHURNPIPE_SKIP_LOADED_BATCHES", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_RECORD_ETL_LOGS") {
            self.record_etl_logs = parse_flag("CHURNPIPE_RECORD_ETL_LOGS", &v)?;
        }
        if let Some(v) = get("CHURNPIPE_STRICT_BINARY") {
            self.strict_binary_values = parse_flag("CHURNPIPE_STRICT_BINARY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), EtlError> {
        let db = &self.database;
        for (field, value) in [
            ("database.host", &db.host),
            ("database.user", &db.user),
            ("database.name", &db.name),
            ("database.maintenance_name", &db.maintenance_name),
            ("schedule.cron", &self.schedule.cron),
        ] {
            if value.trim().is_empty() {
                return Err(EtlError::Config(format!("{field} must not be empty")));
            }
        }
        if db.port == 0 {
            return Err(EtlError::Config("database.port must not be 0".into()));
        }
        if db.max_connections == 0 {
            return Err(EtlError::Config("database.max_connections must be at least 1".into()));
        }
        if self.csv_path.as_os_str().is_empty() {
            return Err(EtlError::Config("csv_path must not be empty".into()));
        }
        for table in [self.staging_table(), self.cleaned_table()] {
            if !is_sql_identifier(&table) || table.len() > MAX_IDENTIFIER_LEN {
                return Err(EtlError::Config(format!(
                    "table name {table:?} must match [a-z_][a-z0-9_]* and be at most {MAX_IDENTIFIER_LEN} bytes"
                )));
            }
        }
        if self.staging_table() == self.cleaned_table() {
            return Err(EtlError::Config("tables.cleaned_suffix must not be empty".into()));
        }
        Ok(())
    }

    pub fn staging_table(&self) -> String {
        self.tables.staging.clone()
    }

    pub fn cleaned_table(&self) -> String {
        format!("{}{}", self.tables.staging, self.tables.cleaned_suffix)
    }

    pub fn database_settings(&self) -> DatabaseSettings {
        let db = &self.database;
        DatabaseSettings {
            host: db.host.clone(),
            port: db.port,
            username: db.user.clone(),
            password: db.password.clone(),
            database: db.name.clone(),
            maintenance_database: db.maintenance_name.clone(),
            max_connections: db.max_connections,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.schedule.retries,
            Duration::from_secs(self.schedule.retry_delay_secs),
        )
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.web.cache_ttl_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, EtlError> {
    value
        .trim()
        .parse()
        .map_err(|_| EtlError::Config(format!("{key}={value:?} is not a valid number")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, EtlError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EtlError::Config(format!("{key}={value:?} is not a boolean"))),
    }
}
