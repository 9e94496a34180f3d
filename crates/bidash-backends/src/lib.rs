//! Backend Query Executor: driver contracts, dispatch by server tag, and error classification.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bidash_core::{ErrorType, ServerName, UnsupportedServer};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as SqlxRow, SqlitePool, TypeInfo, ValueRef};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

#[cfg(feature = "odbc")]
mod odbc;
#[cfg(feature = "odbc")]
pub use odbc::OdbcDriver;

pub const CRATE_NAME: &str = "bidash-backends";

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// First column of the first row, as the backend reported it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ScalarValue {
    /// Type a text-rendered column using the column's declared SQL type.
    /// Only exact integer and floating-point columns are parsed; everything
    /// else keeps the backend's text.
    pub fn from_column_text(kind: ColumnKind, text: &str) -> Self {
        let trimmed = text.trim();
        match kind {
            ColumnKind::Integer => trimmed
                .parse::<i64>()
                .map(ScalarValue::Integer)
                .unwrap_or_else(|_| ScalarValue::Text(text.to_string())),
            ColumnKind::Float => match trimmed.parse::<f64>() {
                Ok(f) if f.is_finite() => ScalarValue::Real(f),
                _ => ScalarValue::Text(text.to_string()),
            },
            ColumnKind::Decimal => ScalarValue::Text(trim_decimal_zeros(trimmed).to_string()),
            ColumnKind::Text => ScalarValue::Text(text.to_string()),
        }
    }

    /// Display string stored in the Row Store. `Null` (and "no rows") become `"0"`.
    pub fn to_display(&self) -> String {
        match self {
            ScalarValue::Null => "0".to_string(),
            ScalarValue::Integer(i) => i.to_string(),
            ScalarValue::Real(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", *f as i64)
            }
            ScalarValue::Real(f) => f.to_string(),
            ScalarValue::Text(s) => s.clone(),
        }
    }
}

/// How a driver should interpret a column it could only read as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    /// Exact numerics (DECIMAL, NUMERIC, MONEY); kept as text so no precision is lost.
    Decimal,
    Text,
}

/// `"2.500"` -> `"2.5"`, `"2.000"` -> `"2"`. Values without a fractional part are untouched.
fn trim_decimal_zeros(text: &str) -> &str {
    let Some((whole, frac)) = text.split_once('.') else {
        return text;
    };
    if whole.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return text;
    }
    let kept = frac.trim_end_matches('0');
    if kept.is_empty() {
        whole
    } else {
        &text[..whole.len() + 1 + kept.len()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Could not reach or open the backend.
    Connect,
    /// Backend was reached but rejected or failed the statement.
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub sqlstate: Option<String>,
    pub native_code: Option<i32>,
    pub message: String,
}

impl DriverError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connect,
            sqlstate: None,
            native_code: None,
            message: message.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Query,
            sqlstate: None,
            native_code: None,
            message: message.into(),
        }
    }

    pub fn with_sqlstate(mut self, state: impl Into<String>) -> Self {
        self.sqlstate = Some(state.into());
        self
    }

    pub fn with_native_code(mut self, code: i32) -> Self {
        self.native_code = Some(code);
        self
    }
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn server(&self) -> ServerName;

    /// Human-readable target, never including credentials.
    fn describe(&self) -> String;

    /// Run a read-only statement and return the first column of the first row.
    /// An empty result set is `ScalarValue::Null`.
    async fn query_scalar(&self, sql: &str) -> Result<ScalarValue, DriverError>;
}

/// Classify a backend failure. Structured codes win; message text is a best-effort fallback.
pub fn classify(err: &DriverError) -> ErrorType {
    if let Some(class) = err.sqlstate.as_deref().and_then(|s| classify_sqlstate(s, err.native_code)) {
        return class;
    }
    if let Some(class) = err.native_code.and_then(classify_sql_server_code) {
        return class;
    }
    if let Some(class) = classify_message(&err.message) {
        return class;
    }
    match err.kind {
        DriverErrorKind::Connect => ErrorType::Connection,
        DriverErrorKind::Query => ErrorType::Unknown,
    }
}

fn classify_sqlstate(state: &str, native_code: Option<i32>) -> Option<ErrorType> {
    let state = state.trim().to_ascii_uppercase();
    if state.starts_with("08") || state == "HYT00" || state == "HYT01" || state == "28000" {
        return Some(ErrorType::Connection);
    }
    match state.as_str() {
        "42S02" | "42S12" | "42S22" | "42S01" => Some(ErrorType::Execution),
        // SQL Server reports both syntax errors and some missing objects as 42000.
        "42000" => native_code
            .and_then(classify_sql_server_code)
            .or(Some(ErrorType::Syntax)),
        "37000" => Some(ErrorType::Syntax),
        "07002" => Some(ErrorType::Execution),
        _ => None,
    }
}

fn classify_sql_server_code(code: i32) -> Option<ErrorType> {
    match code {
        102 | 105 | 156 | 170 | 319 => Some(ErrorType::Syntax),
        207 | 208 | 2812 | 4104 | 229 | 8134 | 245 => Some(ErrorType::Execution),
        18456 | 53 | 2 | 10054 | 10060 | 10061 => Some(ErrorType::Connection),
        _ => None,
    }
}

const CONNECTION_MARKERS: &[&str] = &[
    "unable to open database",
    "could not find file",
    "is not a valid path",
    "login failed",
    "data source name not found",
    "connection refused",
    "network-related",
    "communication link failure",
    "timed out",
    "timeout expired",
    "could not connect",
    "no backend configured",
];

const SYNTAX_MARKERS: &[&str] = &[
    "syntax error",
    "incorrect syntax",
    "unrecognized token",
    "missing operator",
    "reserved word",
    "incomplete input",
];

const EXECUTION_MARKERS: &[&str] = &[
    "no such table",
    "no such column",
    "no such function",
    "invalid object name",
    "invalid column name",
    "cannot find the input table",
    "could not find output table",
    "too few parameters",
    "undefined function",
    "does not exist",
    "division by zero",
    "divide by zero",
    "data type mismatch",
];

/// Substring heuristics over backend error text. Order matters: connection
/// markers are checked before the broader execution markers.
pub fn classify_message(message: &str) -> Option<ErrorType> {
    let lower = message.to_ascii_lowercase();
    let hit = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    if hit(CONNECTION_MARKERS) {
        Some(ErrorType::Connection)
    } else if hit(SYNTAX_MARKERS) {
        Some(ErrorType::Syntax)
    } else if hit(EXECUTION_MARKERS) {
        Some(ErrorType::Execution)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("configuration error: {0}")]
    UnsupportedServer(#[from] UnsupportedServer),
    #[error("no backend configured for {0}")]
    NotConfigured(ServerName),
    #[error("SQL expression is empty")]
    EmptySql,
    #[error("{server} query timed out after {limit:?}")]
    Timeout { server: ServerName, limit: Duration },
    #[error("{source}")]
    Backend {
        server: ServerName,
        error_type: ErrorType,
        source: DriverError,
    },
}

impl ExecutionError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ExecutionError::UnsupportedServer(_) => ErrorType::Unknown,
            ExecutionError::NotConfigured(_) | ExecutionError::Timeout { .. } => {
                ErrorType::Connection
            }
            ExecutionError::EmptySql => ErrorType::Syntax,
            ExecutionError::Backend { error_type, .. } => *error_type,
        }
    }
}

/// Dispatches a row's SQL to the driver registered for its server tag.
#[derive(Clone)]
pub struct BackendExecutor {
    drivers: BTreeMap<ServerName, Arc<dyn BackendDriver>>,
    // One in-flight call per backend. Held by the call itself, so a timed-out
    // query keeps the backend busy until it really returns.
    gates: BTreeMap<ServerName, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl std::fmt::Debug for BackendExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendExecutor")
            .field(
                "drivers",
                &self
                    .drivers
                    .values()
                    .map(|d| d.describe())
                    .collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for BackendExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}

impl BackendExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            drivers: BTreeMap::new(),
            gates: BTreeMap::new(),
            timeout,
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn BackendDriver>) -> Self {
        self.register(driver);
        self
    }

    /// Registering a second driver for the same server replaces the first.
    pub fn register(&mut self, driver: Arc<dyn BackendDriver>) {
        self.gates.entry(driver.server()).or_default();
        self.drivers.insert(driver.server(), driver);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn configured_servers(&self) -> Vec<ServerName> {
        self.drivers.keys().copied().collect()
    }

    /// One attempt, bounded by the executor timeout. No retries.
    pub async fn execute(&self, server_name: &str, sql: &str) -> Result<String, ExecutionError> {
        let server: ServerName = server_name.parse()?;
        let driver = self
            .drivers
            .get(&server)
            .ok_or(ExecutionError::NotConfigured(server))?;
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(ExecutionError::EmptySql);
        }

        let gate = self.gates.get(&server).cloned().unwrap_or_default();
        let call = {
            let driver = driver.clone();
            let sql = sql.to_string();
            let span = info_span!("backend_query", %server, target = %driver.describe());
            // Detached so that timing out abandons the wait, not the query.
            tokio::spawn(
                async move {
                    let _busy = gate.lock_owned().await;
                    driver.query_scalar(&sql).await
                }
                .instrument(span),
            )
        };
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(join_err)) => Ok(Err(DriverError::connect(format!(
                "backend worker failed: {join_err}"
            )))),
            Err(elapsed) => Err(elapsed),
        };

        match result {
            Err(_) => {
                warn!(%server, limit_secs = self.timeout.as_secs(), "backend query timed out");
                Err(ExecutionError::Timeout {
                    server,
                    limit: self.timeout,
                })
            }
            Ok(Err(source)) => {
                let error_type = classify(&source);
                debug!(%server, %error_type, error = %source, "backend query failed");
                Err(ExecutionError::Backend {
                    server,
                    error_type,
                    source,
                })
            }
            Ok(Ok(value)) => {
                debug!(%server, elapsed_ms = started.elapsed().as_millis() as u64, "backend query ok");
                Ok(value.to_display())
            }
        }
    }
}

/// Read-only SQLite driver, used for local mirrors of a backend and for tests.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    server: ServerName,
    label: String,
    pool: SqlitePool,
}

impl SqliteDriver {
    /// Connections are opened lazily, so a missing file surfaces as a
    /// connection-class error on the first query rather than at startup.
    pub fn open(server: ServerName, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .create_if_missing(false);
        Self::from_options(server, format!("sqlite:{}", path.display()), options)
    }

    pub fn from_url(server: ServerName, url: &str) -> Result<Self, DriverError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DriverError::connect(format!("invalid sqlite url: {e}")))?
            .read_only(true)
            .create_if_missing(false);
        Ok(Self::from_options(server, url.to_string(), options))
    }

    fn from_options(server: ServerName, label: String, options: SqliteConnectOptions) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with(options);
        Self {
            server,
            label,
            pool,
        }
    }
}

#[async_trait]
impl BackendDriver for SqliteDriver {
    fn server(&self) -> ServerName {
        self.server
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn query_scalar(&self, sql: &str) -> Result<ScalarValue, DriverError> {
        let row = sqlx::query(sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error)?;
        match row {
            Some(row) => first_column(&row).map_err(sqlx_error),
            None => Ok(ScalarValue::Null),
        }
    }
}

fn first_column(row: &SqliteRow) -> Result<ScalarValue, sqlx::Error> {
    if row.columns().is_empty() {
        return Ok(ScalarValue::Null);
    }
    let raw = row.try_get_raw(0)?;
    if raw.is_null() {
        return Ok(ScalarValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let value = match storage.as_str() {
        "INTEGER" => ScalarValue::Integer(row.try_get_unchecked::<i64, _>(0)?),
        "REAL" => ScalarValue::Real(row.try_get_unchecked::<f64, _>(0)?),
        "BLOB" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(0)?;
            ScalarValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => ScalarValue::Text(row.try_get_unchecked::<String, _>(0)?),
    };
    Ok(value)
}

fn sqlx_error(err: sqlx::Error) -> DriverError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().and_then(|c| c.parse::<i32>().ok());
            // SQLITE_CANTOPEN / SQLITE_NOTADB
            let kind = match code {
                Some(14) | Some(26) => DriverErrorKind::Connect,
                _ => DriverErrorKind::Query,
            };
            let mut out = DriverError {
                kind,
                sqlstate: None,
                native_code: None,
                message: db.message().to_string(),
            };
            if kind == DriverErrorKind::Connect {
                out.message = format!("unable to open database: {}", db.message());
            }
            out
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Configuration(_) => DriverError::connect(err.to_string()),
        _ => DriverError::query(err.to_string()),
    }
}

/// Where a backend's queries go, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// `sqlite:` URL of a local mirror.
    Sqlite(String),
    /// ODBC connection string (P21 DSN or any driver string).
    Odbc(String),
    /// Access `.mdb`/`.accdb` file opened through the Access ODBC driver.
    AccessFile(PathBuf),
}

impl BackendTarget {
    pub fn parse_connection(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            None
        } else if value.starts_with("sqlite:") {
            Some(BackendTarget::Sqlite(value.to_string()))
        } else {
            Some(BackendTarget::Odbc(value.to_string()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendsConfig {
    pub p21: Option<BackendTarget>,
    pub por: Option<BackendTarget>,
    pub query_timeout: Duration,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            p21: None,
            por: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl BackendsConfig {
    pub fn from_env() -> Self {
        let p21 = std::env::var("P21_CONNECTION")
            .ok()
            .and_then(|v| BackendTarget::parse_connection(&v));
        let por = std::env::var("POR_CONNECTION")
            .ok()
            .and_then(|v| BackendTarget::parse_connection(&v))
            .or_else(|| {
                std::env::var("POR_DB_PATH")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| BackendTarget::AccessFile(PathBuf::from(v.trim())))
            });
        Self {
            p21,
            por,
            query_timeout: std::env::var("BIDASH_QUERY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_QUERY_TIMEOUT),
        }
    }

    pub fn target(&self, server: ServerName) -> Option<&BackendTarget> {
        match server {
            ServerName::P21 => self.p21.as_ref(),
            ServerName::POR => self.por.as_ref(),
        }
    }

    /// Build an executor with a driver for each configured backend. Targets that
    /// this build cannot serve are skipped with a warning; their rows then fail
    /// with a connection-class "no backend configured" error.
    pub fn build_executor(&self) -> anyhow::Result<BackendExecutor> {
        let mut executor = BackendExecutor::new(self.query_timeout);
        for server in ServerName::ALL {
            let Some(target) = self.target(server) else {
                warn!(%server, "no backend connection configured");
                continue;
            };
            if let Some(driver) = driver_for_target(server, target, self.query_timeout)? {
                executor.register(driver);
            }
        }
        Ok(executor)
    }
}

#[cfg_attr(not(feature = "odbc"), allow(unused_variables))]
fn driver_for_target(
    server: ServerName,
    target: &BackendTarget,
    query_timeout: Duration,
) -> anyhow::Result<Option<Arc<dyn BackendDriver>>> {
    match target {
        BackendTarget::Sqlite(url) => {
            let driver = SqliteDriver::from_url(server, url)
                .with_context(|| format!("configuring {server} sqlite mirror"))?;
            Ok(Some(Arc::new(driver)))
        }
        #[cfg(feature = "odbc")]
        BackendTarget::Odbc(connection_string) => Ok(Some(Arc::new(
            OdbcDriver::new(server, connection_string.clone()).with_query_timeout(query_timeout),
        ))),
        #[cfg(feature = "odbc")]
        BackendTarget::AccessFile(path) => Ok(Some(Arc::new(
            OdbcDriver::access_file(server, path).with_query_timeout(query_timeout),
        ))),
        #[cfg(not(feature = "odbc"))]
        BackendTarget::Odbc(_) | BackendTarget::AccessFile(_) => {
            warn!(%server, "ODBC target configured but this build lacks the `odbc` feature");
            Ok(None)
        }
    }
}
