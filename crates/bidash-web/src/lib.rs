//! Axum + Askama surface for the dashboard: JSON API, admin page and polling table partial.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bidash_core::{ErrorType, Row, RunStatus};
use bidash_sync::{
    list_reports, maybe_build_scheduler, orchestrator_from_config, RunError, RunOrchestrator,
    RunRequest, SyncConfig,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "bidash-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RunOrchestrator>,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(orchestrator: Arc<RunOrchestrator>, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            reports_dir: reports_dir.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("BIDASH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DataPayload {
    data: Vec<Row>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    server_name: String,
    sql_expression: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_type: Option<ErrorType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartGroup {
    pub chart_group: String,
    pub charts: Vec<Chart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub chart_name: String,
    pub series: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub variable_name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
struct RowView {
    id: String,
    chart_group: String,
    chart_name: String,
    variable_name: String,
    server_name: String,
    sql_expression: String,
    value: String,
    last_updated: String,
    error: String,
    error_type: String,
    active: bool,
}

impl RowView {
    fn from_row(row: &Row, active_row_id: Option<&str>) -> Self {
        Self {
            id: row.id.clone(),
            chart_group: row.chart_group.clone(),
            chart_name: row.chart_name.clone(),
            variable_name: row.variable_name.clone(),
            server_name: row.server_name.clone(),
            sql_expression: row.sql_expression.clone(),
            value: row.value.clone().unwrap_or_default(),
            last_updated: row
                .last_updated
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            error: row.error.clone().unwrap_or_default(),
            error_type: row
                .error_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            active: active_row_id == Some(row.id.as_str()),
        }
    }
}

#[derive(Template)]
#[template(path = "admin.html")]
struct AdminTemplate {
    total_rows: usize,
    backends: String,
}

#[derive(Template)]
#[template(path = "rows_table_partial.html")]
struct RowsTablePartialTemplate {
    status: String,
    running: bool,
    active_row_id: String,
    rows: Vec<RowView>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(admin_handler))
        .route("/admin/rows", get(admin_rows_handler))
        .route("/api/data", get(list_data_handler).post(save_data_handler))
        .route("/api/run", get(run_state_handler).post(start_run_handler))
        .route("/api/run/stop", post(stop_run_handler))
        .route("/api/query", post(query_handler))
        .route("/api/charts", get(charts_handler))
        .route("/api/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: &WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let sync_config = SyncConfig::from_env();
    let orchestrator = Arc::new(orchestrator_from_config(&sync_config).await?);
    let scheduler = maybe_build_scheduler(&sync_config, orchestrator.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
    }
    let state = AppState::new(orchestrator, sync_config.reports_dir.clone());
    serve(state, &WebConfig::from_env()).await
}

async fn admin_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().count().await {
        Ok(total_rows) => {
            let servers = state.orchestrator.executor().configured_servers();
            let backends = if servers.is_empty() {
                "none configured".to_string()
            } else {
                servers.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            };
            render_html(AdminTemplate {
                total_rows,
                backends,
            })
        }
        Err(err) => server_error(err.into()),
    }
}

/// Renders from a non-draining snapshot so the page never steals updates from API pollers.
async fn admin_rows_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.orchestrator.session().snapshot();
    let mut rows = match state.orchestrator.store().list_rows().await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };
    // Dry runs never reach the store; show their results over the stored rows.
    for updated in &snapshot.updated_data {
        if let Some(row) = rows.iter_mut().find(|r| r.id == updated.id) {
            *row = updated.clone();
        }
    }

    let active = snapshot.active_row_id.as_deref();
    render_html(RowsTablePartialTemplate {
        status: status_label(snapshot.status).to_string(),
        running: snapshot.status != RunStatus::Idle,
        active_row_id: snapshot.active_row_id.clone().unwrap_or_default(),
        rows: rows.iter().map(|r| RowView::from_row(r, active)).collect(),
    })
}

async fn list_data_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().list_rows().await {
        Ok(data) => Json(DataPayload { data }).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn save_data_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DataPayload>,
) -> Response {
    match state.orchestrator.store().upsert_rows(&payload.data).await {
        Ok(saved) => {
            info!(saved, "rows saved");
            Json(serde_json::json!({ "saved": saved })).into_response()
        }
        Err(err) => {
            error!(error = %err, "saving rows failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// The run is detached from the request: a caller that disconnects stops
/// waiting for the summary, while the run itself still ends only on its last
/// row or a cooperative stop.
async fn start_run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    let orchestrator = state.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.start(request).await });
    match run.await {
        Ok(Ok(summary)) => Json(summary).into_response(),
        Ok(Err(err @ RunError::Session(_))) => json_error(StatusCode::CONFLICT, err.to_string()),
        Ok(Err(err @ RunError::Store(_))) => {
            error!(error = %err, "run aborted");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(join_err) => {
            error!(error = %join_err, "run task failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, join_err.to_string())
        }
    }
}

async fn run_state_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.state()).into_response()
}

async fn stop_run_handler(State(state): State<Arc<AppState>>) -> Response {
    let stop_requested = state.orchestrator.stop();
    Json(serde_json::json!({ "stopRequested": stop_requested })).into_response()
}

/// Ad-hoc single execution for the admin editor; the Row Store is not touched.
async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let response = match state
        .orchestrator
        .executor()
        .execute(&request.server_name, &request.sql_expression)
        .await
    {
        Ok(value) => QueryResponse {
            value: Some(value),
            error: None,
            error_type: None,
        },
        Err(err) => {
            warn!(server = %request.server_name, error = %err, "ad-hoc query failed");
            QueryResponse {
                value: None,
                error: Some(err.to_string()),
                error_type: Some(err.error_type()),
            }
        }
    };
    Json(response).into_response()
}

async fn charts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().list_rows().await {
        Ok(rows) => Json(serde_json::json!({ "groups": group_charts(&rows) })).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    match list_reports(&state.reports_dir, 20) {
        Ok(reports) => Json(serde_json::json!({ "reports": reports })).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Groups keep the order in which they first appear in the row list.
pub fn group_charts(rows: &[Row]) -> Vec<ChartGroup> {
    let mut groups: Vec<ChartGroup> = Vec::new();
    for row in rows {
        let group_idx = match groups.iter().position(|g| g.chart_group == row.chart_group) {
            Some(idx) => idx,
            None => {
                groups.push(ChartGroup {
                    chart_group: row.chart_group.clone(),
                    charts: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let charts = &mut groups[group_idx].charts;
        let chart_idx = match charts.iter().position(|c| c.chart_name == row.chart_name) {
            Some(idx) => idx,
            None => {
                charts.push(Chart {
                    chart_name: row.chart_name.clone(),
                    series: Vec::new(),
                });
                charts.len() - 1
            }
        };
        charts[chart_idx].series.push(ChartPoint {
            variable_name: row.variable_name.clone(),
            value: row.value.clone(),
        });
    }
    groups
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Idle => "idle",
        RunStatus::Running => "running",
        RunStatus::Stopped => "stopping",
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

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use bidash_backends::{BackendDriver, BackendExecutor, DriverError, ScalarValue, SqliteDriver};
    use bidash_core::ServerName;
    use bidash_storage::RowStore;
    use bidash_sync::{ReportWriter, RunSession};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tempfile::{tempdir, TempDir};
    use tokio::sync::{mpsc, Semaphore};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn mk_row(id: &str, group: &str, chart: &str, server: &str, sql: &str) -> Row {
        Row {
            id: id.into(),
            chart_group: group.into(),
            chart_name: chart.into(),
            variable_name: format!("var-{id}"),
            server_name: server.into(),
            table_name: String::new(),
            sql_expression: sql.into(),
            value: None,
            last_updated: None,
            error: None,
            error_type: None,
        }
    }

    // The P21 driver reads the dashboard database itself, so no separate backend fixture is needed.
    async fn test_state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("dashboard.db");
        let store = RowStore::open(&db_path).await.unwrap();
        store
            .upsert_rows(&[
                mk_row("1", "Key Metrics", "Totals", "P21", "SELECT COUNT(*) AS value FROM chart_rows"),
                mk_row("30", "POR Overview", "Contracts", "POR", "SELECT Count(*) FROM Contracts"),
            ])
            .await
            .unwrap();
        let executor = BackendExecutor::new(Duration::from_secs(5))
            .with_driver(Arc::new(SqliteDriver::open(ServerName::P21, &db_path)));
        let reports_dir = dir.path().join("reports");
        let orchestrator = RunOrchestrator::new(store, Arc::new(executor), RunSession::new())
            .with_reports(ReportWriter::new(&reports_dir));
        (dir, AppState::new(Arc::new(orchestrator), reports_dir))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    #[tokio::test]
    async fn admin_page_and_idle_partial_render() {
        let (_dir, state) = test_state().await;
        let app = app(state);

        let resp = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("BI Dashboard Admin"));
        assert!(text.contains("2 rows"));

        let resp = app.oneshot(get("/admin/rows")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("row-30"));
        assert!(!text.contains("every 1s"));
    }

    #[tokio::test]
    async fn partial_polls_and_run_is_rejected_while_running() {
        let (_dir, state) = test_state().await;
        let ticket = state.orchestrator.session().begin(Uuid::new_v4()).unwrap();
        ticket.set_active("30");
        let app = app(state);

        let text = body_text(app.clone().oneshot(get("/admin/rows")).await.unwrap()).await;
        assert!(text.contains("hx-trigger=\"every 1s\""));
        assert!(text.contains("class=\"active\""));

        let resp = app
            .clone()
            .oneshot(post_json("/api/run", json!({ "isProduction": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = app.clone().oneshot(post_json("/api/run/stop", json!({}))).await.unwrap();
        assert_eq!(body_json(resp).await["stopRequested"], true);
        drop(ticket);

        let resp = app.oneshot(get("/api/run")).await.unwrap();
        assert_eq!(body_json(resp).await["status"], "idle");
    }

    #[tokio::test]
    async fn production_run_updates_data_and_poll_drains() {
        let (_dir, state) = test_state().await;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json("/api/run", json!({ "isProduction": true })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = body_json(resp).await;
        assert_eq!(summary["outcome"], "completed");
        assert_eq!(summary["succeeded"], 1);
        assert_eq!(summary["failed"], 1);

        let data = body_json(app.clone().oneshot(get("/api/data")).await.unwrap()).await;
        assert_eq!(data["data"][0]["id"], "1");
        assert_eq!(data["data"][0]["value"], "2");
        assert_eq!(data["data"][1]["errorType"], "connection");

        let first = body_json(app.clone().oneshot(get("/api/run")).await.unwrap()).await;
        assert_eq!(first["status"], "idle");
        assert_eq!(first["updatedData"].as_array().unwrap().len(), 2);
        let second = body_json(app.clone().oneshot(get("/api/run")).await.unwrap()).await;
        assert!(second["updatedData"].as_array().unwrap().is_empty());

        let reports = body_json(app.oneshot(get("/api/reports")).await.unwrap()).await;
        assert_eq!(reports["reports"].as_array().unwrap().len(), 1);
    }

    /// Announces each statement, then blocks until the test hands out a permit.
    struct GatedDriver {
        entered: mpsc::UnboundedSender<String>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl BackendDriver for GatedDriver {
        fn server(&self) -> ServerName {
            ServerName::P21
        }

        fn describe(&self) -> String {
            "gated".into()
        }

        async fn query_scalar(&self, sql: &str) -> Result<ScalarValue, DriverError> {
            let _ = self.entered.send(sql.to_string());
            self.gate.acquire().await.expect("gate open").forget();
            Ok(ScalarValue::Integer(1))
        }
    }

    #[tokio::test]
    async fn run_continues_after_the_caller_disconnects() {
        let dir = tempdir().unwrap();
        let store = RowStore::open(dir.path().join("dashboard.db")).await.unwrap();
        store
            .upsert_rows(&[
                mk_row("a", "Key Metrics", "Orders", "P21", "qa"),
                mk_row("b", "Key Metrics", "Orders", "P21", "qb"),
                mk_row("c", "Key Metrics", "Orders", "P21", "qc"),
            ])
            .await
            .unwrap();
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let executor = BackendExecutor::new(Duration::from_secs(30)).with_driver(Arc::new(GatedDriver {
            entered: entered_tx,
            gate: gate.clone(),
        }));
        let orchestrator = Arc::new(RunOrchestrator::new(
            store.clone(),
            Arc::new(executor),
            RunSession::new(),
        ));
        let app = app(AppState::new(orchestrator.clone(), dir.path().join("reports")));

        let request = tokio::spawn(app.oneshot(post_json("/api/run", json!({ "isProduction": true }))));
        assert_eq!(entered_rx.recv().await.as_deref(), Some("qa"));

        // Dropping the handler future is what the server does when the client goes away.
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert!(!orchestrator.session().is_idle());

        gate.add_permits(3);
        assert_eq!(entered_rx.recv().await.as_deref(), Some("qb"));
        assert_eq!(entered_rx.recv().await.as_deref(), Some("qc"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !orchestrator.session().is_idle() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("run settles on idle");

        let values = store
            .list_rows()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.value)
            .collect::<Vec<_>>();
        assert_eq!(values, vec![Some("1".to_string()); 3]);
    }

    #[tokio::test]
    async fn posted_rows_are_upserted() {
        let (_dir, state) = test_state().await;
        let app = app(state);
        let mut edited = mk_row("1", "Key Metrics", "Totals", "P21", "SELECT 5");
        edited.value = Some("5".into());
        let new_row = mk_row("2", "Key Metrics", "Totals", "P21", "SELECT 6");

        let resp = app
            .clone()
            .oneshot(post_json("/api/data", json!({ "data": [edited, new_row] })))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["saved"], 2);

        let data = body_json(app.oneshot(get("/api/data")).await.unwrap()).await;
        let rows = data["data"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["sqlExpression"], "SELECT 5");
        assert_eq!(rows[0]["value"], "5");
    }

    #[tokio::test]
    async fn ad_hoc_query_reports_value_or_classified_error() {
        let (_dir, state) = test_state().await;
        let app = app(state);

        let ok = body_json(
            app.clone()
                .oneshot(post_json("/api/query", json!({ "serverName": "P21", "sqlExpression": "SELECT 7" })))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(ok["value"], "7");
        assert!(ok.get("error").is_none());

        let bad = body_json(
            app.oneshot(post_json("/api/query", json!({ "serverName": "MSSQL", "sqlExpression": "SELECT 1" })))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(bad["errorType"], "unknown");
    }

    #[tokio::test]
    async fn charts_are_grouped_by_group_then_chart() {
        let (_dir, state) = test_state().await;
        let resp = app(state).oneshot(get("/api/charts")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["groups"][0]["chartGroup"], "Key Metrics");
        assert_eq!(body["groups"][1]["charts"][0]["chartName"], "Contracts");
    }

    #[test]
    fn group_charts_keeps_first_seen_order() {
        let rows = vec![
            mk_row("1", "AR Aging", "Buckets", "P21", "q"),
            mk_row("2", "Key Metrics", "Orders", "P21", "q"),
            mk_row("3", "AR Aging", "Buckets", "P21", "q"),
            mk_row("4", "AR Aging", "Totals", "P21", "q"),
        ];
        let groups = group_charts(&rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].chart_group, "AR Aging");
        assert_eq!(groups[0].charts.len(), 2);
        assert_eq!(groups[0].charts[0].series.len(), 2);
        assert_eq!(groups[0].charts[0].series[1].variable_name, "var-3");
    }
}
