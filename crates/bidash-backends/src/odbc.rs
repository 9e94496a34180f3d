//! ODBC driver for the live backends: P21 through a SQL Server DSN, POR through the Access driver.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bidash_core::ServerName;
use odbc_api::{ConnectionOptions, Cursor, DataType, Environment, ResultSetMetadata};

use crate::{BackendDriver, ColumnKind, DriverError, DriverErrorKind, ScalarValue};

const ACCESS_DRIVER: &str = "Microsoft Access Driver (*.mdb, *.accdb)";

#[derive(Debug, Clone)]
pub struct OdbcDriver {
    server: ServerName,
    connection_string: String,
    label: String,
    query_timeout: Option<Duration>,
}

impl OdbcDriver {
    pub fn new(server: ServerName, connection_string: impl Into<String>) -> Self {
        let connection_string = connection_string.into();
        let label = redact_connection_string(&connection_string);
        Self {
            server,
            connection_string,
            label,
            query_timeout: None,
        }
    }

    /// Read-only connection to an Access database file.
    pub fn access_file(server: ServerName, path: &Path) -> Self {
        let connection_string = format!(
            "Driver={{{ACCESS_DRIVER}}};Dbq={};ReadOnly=1;",
            path.display()
        );
        Self {
            server,
            connection_string,
            label: format!("access:{}", path.display()),
            query_timeout: None,
        }
    }

    /// Statement-level timeout handed to the driver, so an abandoned query
    /// is also cancelled on the server side.
    pub fn with_query_timeout(mut self, limit: Duration) -> Self {
        self.query_timeout = Some(limit);
        self
    }
}

#[async_trait]
impl BackendDriver for OdbcDriver {
    fn server(&self) -> ServerName {
        self.server
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn query_scalar(&self, sql: &str) -> Result<ScalarValue, DriverError> {
        let connection_string = self.connection_string.clone();
        let sql = sql.to_string();
        let query_timeout = self.query_timeout;
        tokio::task::spawn_blocking(move || {
            query_scalar_blocking(&connection_string, &sql, query_timeout)
        })
            .await
            .map_err(|e| DriverError::connect(format!("odbc worker failed: {e}")))?
    }
}

// Driver managers are not assumed thread-safe for these backends, so every call
// gets its own environment and connection.
fn query_scalar_blocking(
    connection_string: &str,
    sql: &str,
    query_timeout: Option<Duration>,
) -> Result<ScalarValue, DriverError> {
    let env = Environment::new().map_err(|e| odbc_error(e, DriverErrorKind::Connect))?;
    let conn = env
        .connect_with_connection_string(connection_string, ConnectionOptions::default())
        .map_err(|e| odbc_error(e, DriverErrorKind::Connect))?;

    let mut statement = conn
        .preallocate()
        .map_err(|e| odbc_error(e, DriverErrorKind::Query))?;
    if let Some(limit) = query_timeout {
        statement
            .set_query_timeout_sec(limit.as_secs().max(1) as usize)
            .map_err(|e| odbc_error(e, DriverErrorKind::Query))?;
    }

    let Some(mut cursor) = statement
        .execute(sql, ())
        .map_err(|e| odbc_error(e, DriverErrorKind::Query))?
    else {
        return Ok(ScalarValue::Null);
    };

    let kind = column_kind(
        &cursor
            .col_data_type(1)
            .map_err(|e| odbc_error(e, DriverErrorKind::Query))?,
    );

    let Some(mut row) = cursor
        .next_row()
        .map_err(|e| odbc_error(e, DriverErrorKind::Query))?
    else {
        return Ok(ScalarValue::Null);
    };

    let mut buf = Vec::new();
    let present = row
        .get_text(1, &mut buf)
        .map_err(|e| odbc_error(e, DriverErrorKind::Query))?;
    if !present {
        return Ok(ScalarValue::Null);
    }
    Ok(ScalarValue::from_column_text(kind, &String::from_utf8_lossy(&buf)))
}

fn column_kind(data_type: &DataType) -> ColumnKind {
    match data_type {
        DataType::TinyInt | DataType::SmallInt | DataType::Integer | DataType::BigInt => {
            ColumnKind::Integer
        }
        DataType::Real | DataType::Double | DataType::Float { .. } => ColumnKind::Float,
        DataType::Decimal { .. } | DataType::Numeric { .. } => ColumnKind::Decimal,
        _ => ColumnKind::Text,
    }
}

fn odbc_error(err: odbc_api::Error, kind: DriverErrorKind) -> DriverError {
    let mut out = DriverError {
        kind,
        sqlstate: None,
        native_code: None,
        message: err.to_string(),
    };
    if let odbc_api::Error::Diagnostics { record, .. } = &err {
        out.sqlstate = Some(record.state.as_str().to_string());
        out.native_code = Some(record.native_error);
    }
    out
}

fn redact_connection_string(connection_string: &str) -> String {
    connection_string
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, _)) if matches!(key.trim().to_ascii_uppercase().as_str(), "PWD" | "PASSWORD") => {
                format!("{key}=***")
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}
