//! Axum + Askama churn dashboard over the cleaned customer table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use askama::Template;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use churnpipe_core::{CleanedCustomer, EtlError};
use churnpipe_storage::{load_cleaned_customers, DatabaseSettings};
use churnpipe_sync::PipelineConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "churnpipe-web";

const DASHBOARD_TITLE: &str = "Telecom Customer Churn Dashboard";
const ALL: &str = "All";

/// Where the dashboard reads cleaned rows from.
#[async_trait]
pub trait CleanedSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<CleanedCustomer>, EtlError>;

    fn label(&self) -> String;
}

pub struct PgCleanedSource {
    settings: DatabaseSettings,
    table: String,
    pool: OnceCell<PgPool>,
}

impl PgCleanedSource {
    pub fn new(settings: DatabaseSettings, table: impl Into<String>) -> Self {
        Self {
            settings,
            table: table.into(),
            pool: OnceCell::new(),
        }
    }
}

#[async_trait]
impl CleanedSource for PgCleanedSource {
    async fn fetch(&self) -> Result<Vec<CleanedCustomer>, EtlError> {
        let pool = self
            .pool
            .get_or_try_init(|| self.settings.connect())
            .await?;
        load_cleaned_customers(pool, &self.table).await
    }

    fn label(&self) -> String {
        format!("PostgreSQL table {}.{}", self.settings.database, self.table)
    }
}

struct CachedRows {
    loaded_at: Instant,
    rows: Arc<Vec<CleanedCustomer>>,
}

/// Cleaned rows held for `ttl`, or until cleared.
pub struct CustomerCache {
    ttl: Duration,
    slot: RwLock<Option<CachedRows>>,
}

impl CustomerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    fn fresh(&self, cached: &Option<CachedRows>) -> Option<Arc<Vec<CleanedCustomer>>> {
        cached
            .as_ref()
            .filter(|c| c.loaded_at.elapsed() < self.ttl)
            .map(|c| Arc::clone(&c.rows))
    }

    pub async fn get_or_load(
        &self,
        source: &dyn CleanedSource,
    ) -> Result<Arc<Vec<CleanedCustomer>>, EtlError> {
        if let Some(rows) = self.fresh(&*self.slot.read().await) {
            return Ok(rows);
        }
        let mut slot = self.slot.write().await;
        if let Some(rows) = self.fresh(&slot) {
            return Ok(rows);
        }
        let rows = Arc::new(source.fetch().await?);
        debug!(rows = rows.len(), "loaded cleaned table into cache");
        *slot = Some(CachedRows {
            loaded_at: Instant::now(),
            rows: Arc::clone(&rows),
        });
        Ok(rows)
    }

    pub async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn CleanedSource>,
    pub cache: Arc<CustomerCache>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(source: Arc<dyn CleanedSource>, ttl: Duration, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache: Arc::new(CustomerCache::new(ttl)),
            workspace_root: workspace_root.into(),
        }
    }

    async fn rows(&self) -> Result<Arc<Vec<CleanedCustomer>>, EtlError> {
        self.cache.get_or_load(self.source.as_ref()).await
    }
}

/// Query-string filters; absent, empty, or `All` means unfiltered.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterQuery {
    pub contract_type: Option<String>,
    pub internet_service: Option<String>,
    pub churn: Option<String>,
}

fn selected(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty() && *v != ALL)
}

impl FilterQuery {
    pub fn matches(&self, customer: &CleanedCustomer) -> bool {
        if let Some(want) = selected(&self.contract_type) {
            if customer.contract_type.as_deref() != Some(want) {
                return false;
            }
        }
        if let Some(want) = selected(&self.internet_service) {
            if customer.internet_service.as_deref() != Some(want) {
                return false;
            }
        }
        if let Some(want) = selected(&self.churn) {
            if customer.churn.map(|c| c.to_string()).as_deref() != Some(want) {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, rows: &'a [CleanedCustomer]) -> Vec<&'a CleanedCustomer> {
        rows.iter().filter(|c| self.matches(c)).collect()
    }
}

/// Summary figures over the filtered rows, formatted for display.
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardMetrics {
    pub total_customers: usize,
    pub churned: usize,
    pub churn_rate: String,
    pub avg_monthly_charges: String,
    pub total_revenue: String,
    pub lost_revenue: String,
}

impl DashboardMetrics {
    pub fn compute(rows: &[&CleanedCustomer]) -> Self {
        let churned = rows.iter().filter(|c| c.churn == Some(true)).count();
        let churn_rate = mean(rows.iter().filter_map(|c| c.churn.map(f64::from)));
        let avg_monthly = mean(rows.iter().filter_map(|c| c.monthly_charges));
        let total_revenue: f64 = rows.iter().filter_map(|c| c.total_charges).sum();
        let lost_revenue: f64 = rows
            .iter()
            .filter(|c| c.churn == Some(true))
            .filter_map(|c| c.total_charges)
            .sum();

        Self {
            total_customers: rows.len(),
            churned,
            churn_rate: churn_rate
                .map(|r| format!("{:.2}%", r * 100.0))
                .unwrap_or_else(|| "N/A".to_string()),
            avg_monthly_charges: avg_monthly
                .map(|v| format!("₹{v:.2}"))
                .unwrap_or_else(|| "N/A".to_string()),
            total_revenue: format_money(total_revenue),
            lost_revenue: format_money(lost_revenue),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Rupee amount with two decimals and thousands separators.
pub fn format_money(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 && fixed != "0.00" { "-" } else { "" };
    format!("{sign}₹{grouped}.{cents}")
}

/// Mean churn per group, groups in sorted order. Rows without a key or churn value are ignored.
pub fn churn_rate_by<F>(rows: &[&CleanedCustomer], key: F) -> Vec<(String, f64)>
where
    F: Fn(&CleanedCustomer) -> Option<String>,
{
    let mut groups: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for row in rows {
        let (Some(group), Some(churn)) = (key(row), row.churn) else {
            continue;
        };
        let entry = groups.entry(group).or_default();
        entry.0 += f64::from(churn);
        entry.1 += 1;
    }
    groups
        .into_iter()
        .map(|(group, (sum, n))| (group, sum / n as f64))
        .collect()
}

fn churn_rate_bar(title: &str, axis: &str, groups: &[(String, f64)]) -> Value {
    let x = groups.iter().map(|(g, _)| g.as_str()).collect::<Vec<_>>();
    let y = groups.iter().map(|(_, r)| *r).collect::<Vec<_>>();
    json!({
        "data": [{
            "type": "bar",
            "x": x,
            "y": y,
            "texttemplate": "%{y:.2%}",
            "marker": {"color": "#0ea5e9"}
        }],
        "layout": {
            "title": {"text": title},
            "xaxis": {"title": {"text": axis}},
            "yaxis": {"title": {"text": "Churn Rate"}}
        }
    })
}

/// The six dashboard figures as Plotly JSON, keyed by the element id they render into.
pub fn chart_figures(rows: &[&CleanedCustomer]) -> Value {
    let by_contract = churn_rate_by(rows, |c| c.contract_type.clone());
    let by_internet = churn_rate_by(rows, |c| c.internet_service.clone());
    let by_gender = churn_rate_by(rows, |c| c.gender.clone());
    let by_support = churn_rate_by(rows, |c| c.tech_support.map(|v| v.to_string()));

    let tenure = rows.iter().filter_map(|c| c.tenure).collect::<Vec<_>>();

    let mut charges_by_churn: BTreeMap<bool, Vec<f64>> = BTreeMap::new();
    for row in rows {
        if let (Some(churn), Some(charges)) = (row.churn, row.total_charges) {
            charges_by_churn.entry(churn).or_default().push(charges);
        }
    }
    let boxes = charges_by_churn
        .into_iter()
        .map(|(churn, y)| {
            json!({
                "type": "box",
                "name": churn.to_string(),
                "x": vec![churn.to_string(); y.len()],
                "y": y,
                "boxpoints": "outliers"
            })
        })
        .collect::<Vec<_>>();

    json!({
        "churn_by_contract": churn_rate_bar("Churn Rate by Contract Type", "contracttype", &by_contract),
        "churn_by_internet": churn_rate_bar("Churn Rate by Internet Service", "internetservice", &by_internet),
        "churn_by_gender": {
            "data": [{
                "type": "pie",
                "labels": by_gender.iter().map(|(g, _)| g.as_str()).collect::<Vec<_>>(),
                "values": by_gender.iter().map(|(_, r)| *r).collect::<Vec<_>>(),
                "hole": 0.4
            }],
            "layout": {"title": {"text": "Churn Rate by Gender"}}
        },
        "tenure_histogram": {
            "data": [{"type": "histogram", "x": tenure, "nbinsx": 30}],
            "layout": {
                "title": {"text": "Customer Tenure Distribution"},
                "xaxis": {"title": {"text": "Tenure (Months)"}}
            }
        },
        "charges_by_churn": {
            "data": boxes,
            "layout": {
                "title": {"text": "Total Charges by Churn"},
                "xaxis": {"title": {"text": "Churn"}},
                "yaxis": {"title": {"text": "Total Charges (₹)"}}
            }
        },
        "churn_by_support": churn_rate_bar("Churn Rate by Tech Support", "techsupport", &by_support),
    })
}

const CHART_IDS: [&str; 6] = [
    "churn_by_contract",
    "churn_by_internet",
    "churn_by_gender",
    "tenure_histogram",
    "charges_by_churn",
    "churn_by_support",
];

#[derive(Debug, Clone)]
struct SelectOption {
    value: String,
    selected: bool,
}

fn distinct_values(
    rows: &[CleanedCustomer],
    value: impl Fn(&CleanedCustomer) -> Option<String>,
) -> BTreeSet<String> {
    rows.iter().filter_map(value).collect()
}

/// `All` first, then `values` in the order given.
fn select_options(
    values: impl IntoIterator<Item = String>,
    current: &Option<String>,
) -> Vec<SelectOption> {
    let current = selected(current);
    std::iter::once(ALL.to_string())
        .chain(values)
        .map(|value| SelectOption {
            selected: match current {
                Some(want) => value == want,
                None => value == ALL,
            },
            value,
        })
        .collect()
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: &'static str,
    metrics: DashboardMetrics,
    contract_options: Vec<SelectOption>,
    internet_options: Vec<SelectOption>,
    churn_options: Vec<SelectOption>,
    chart_ids: Vec<&'static str>,
    source_label: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/charts", get(charts_handler))
        .route("/refresh", post(refresh_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &PipelineConfig) -> anyhow::Result<()> {
    let source = PgCleanedSource::new(config.database_settings(), config.cleaned_table());
    let state = AppState::new(Arc::new(source), config.cache_ttl(), ".");
    let port = config.web.port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding dashboard port {port}"))?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::load()?;
    serve(&config).await
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Response {
    match state.rows().await {
        Ok(rows) => {
            let contract_types = distinct_values(&rows, |c| c.contract_type.clone());
            let internet_services = distinct_values(&rows, |c| c.internet_service.clone());
            let filtered = query.apply(&rows);
            render_html(IndexTemplate {
                title: DASHBOARD_TITLE,
                metrics: DashboardMetrics::compute(&filtered),
                contract_options: select_options(contract_types, &query.contract_type),
                internet_options: select_options(internet_services, &query.internet_service),
                churn_options: select_options(["true", "false"].map(String::from), &query.churn),
                chart_ids: CHART_IDS.to_vec(),
                source_label: state.source.label(),
            })
        }
        Err(err) => server_error(err.into()),
    }
}

async fn charts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Response {
    match state.rows().await {
        Ok(rows) => Json(chart_figures(&query.apply(&rows))).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    state.cache.clear().await;
    info!("dashboard cache cleared");
    Redirect::to("/").into_response()
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
