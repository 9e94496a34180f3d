//! Core domain model for the dashboard query orchestrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidash-core";

/// Backend a row's SQL targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServerName {
    /// SQL-Server ERP system.
    P21,
    /// MS-Access point-of-rental system.
    POR,
}

impl ServerName {
    pub const ALL: [ServerName; 2] = [ServerName::P21, ServerName::POR];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerName::P21 => "P21",
            ServerName::POR => "POR",
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported server '{0}' (expected P21 or POR)")]
pub struct UnsupportedServer(pub String);

impl FromStr for ServerName {
    type Err = UnsupportedServer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("P21") {
            Ok(ServerName::P21)
        } else if trimmed.eq_ignore_ascii_case("POR") {
            Ok(ServerName::POR)
        } else {
            Err(UnsupportedServer(s.to_string()))
        }
    }
}

/// Failure class attached to a row after an unsuccessful execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Connection,
    Execution,
    Syntax,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Connection => "connection",
            ErrorType::Execution => "execution",
            ErrorType::Syntax => "syntax",
            ErrorType::Unknown => "unknown",
        }
    }

    /// Lenient parse used when reading persisted values; unrecognised text maps to `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "connection" => ErrorType::Connection,
            "execution" => ErrorType::Execution,
            "syntax" => ErrorType::Syntax,
            _ => ErrorType::Unknown,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dashboard data point: identity, grouping, target backend, SQL and cached result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: String,
    #[serde(default)]
    pub chart_group: String,
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub variable_name: String,
    pub server_name: String,
    #[serde(default)]
    pub table_name: String,
    pub sql_expression: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
}

impl Row {
    pub fn server(&self) -> Result<ServerName, UnsupportedServer> {
        self.server_name.parse()
    }

    /// Apply a successful execution: new value, fresh timestamp, prior error cleared.
    pub fn mark_success(&mut self, value: String, at: DateTime<Utc>) {
        self.value = Some(value);
        self.last_updated = Some(at);
        self.error = None;
        self.error_type = None;
    }

    /// Apply a failed execution; the last good value is kept.
    pub fn mark_failure(&mut self, error_type: ErrorType, message: String, at: DateTime<Utc>) {
        self.last_updated = Some(at);
        self.error = Some(message);
        self.error_type = Some(error_type);
    }

    pub fn apply_outcome(&mut self, outcome: &RowOutcome) {
        match (&outcome.value, &outcome.error) {
            (Some(value), None) => self.mark_success(value.clone(), outcome.executed_at),
            (_, Some(message)) => self.mark_failure(
                outcome.error_type.unwrap_or(ErrorType::Unknown),
                message.clone(),
                outcome.executed_at,
            ),
            (None, None) => self.last_updated = Some(outcome.executed_at),
        }
    }
}

/// Authored part of a row as it appears in the seed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowDefinition {
    pub id: String,
    pub chart_group: String,
    #[serde(default)]
    pub chart_name: String,
    #[serde(default)]
    pub variable_name: String,
    pub server_name: String,
    #[serde(default)]
    pub table_name: String,
    pub sql_expression: String,
}

impl RowDefinition {
    pub fn into_row(self) -> Row {
        Row {
            id: self.id,
            chart_group: self.chart_group,
            chart_name: self.chart_name,
            variable_name: self.variable_name,
            server_name: self.server_name,
            table_name: self.table_name,
            sql_expression: self.sql_expression,
            value: None,
            last_updated: None,
            error: None,
            error_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    /// Stop requested; the in-flight row is still finishing.
    Stopped,
}

/// What a status poll returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunStateSnapshot {
    pub status: RunStatus,
    pub active_row_id: Option<String>,
    pub updated_data: Vec<Row>,
}

/// Result of executing a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome {
    pub row_id: String,
    pub value: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub executed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RowOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub is_production: bool,
    pub outcome: RunOutcome,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<RowOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_row() -> Row {
        Row {
            id: "6".into(),
            chart_group: "Key Metrics".into(),
            chart_name: "Orders".into(),
            variable_name: "Total Orders".into(),
            server_name: "P21".into(),
            table_name: "oe_hdr".into(),
            sql_expression: "SELECT COUNT(*) as value FROM oe_hdr".into(),
            value: Some("10".into()),
            last_updated: None,
            error: Some("old failure".into()),
            error_type: Some(ErrorType::Connection),
        }
    }

    #[test]
    fn server_name_parses_known_tags_only() {
        assert_eq!("P21".parse::<ServerName>().unwrap(), ServerName::P21);
        assert_eq!(" por ".parse::<ServerName>().unwrap(), ServerName::POR);
        let err = "MSSQL".parse::<ServerName>().unwrap_err();
        assert_eq!(err.0, "MSSQL");
    }

    #[test]
    fn row_wire_format_is_camel_case() {
        let json = serde_json::to_value(sample_row()).unwrap();
        assert_eq!(json["serverName"], "P21");
        assert_eq!(json["sqlExpression"], "SELECT COUNT(*) as value FROM oe_hdr");
        assert_eq!(json["errorType"], "connection");
        assert!(json.get("server_name").is_none());
    }

    #[test]
    fn row_deserializes_with_optional_fields_missing() {
        let row: Row = serde_json::from_str(
            r#"{"id":"30","serverName":"POR","sqlExpression":"SELECT 1"}"#,
        )
        .unwrap();
        assert_eq!(row.value, None);
        assert_eq!(row.chart_group, "");
        assert_eq!(row.error_type, None);
    }

    #[test]
    fn success_clears_error_and_failure_keeps_value() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        let mut row = sample_row();
        row.mark_success("42".into(), at);
        assert_eq!(row.value.as_deref(), Some("42"));
        assert_eq!(row.error, None);
        assert_eq!(row.error_type, None);
        assert_eq!(row.last_updated, Some(at));

        row.mark_failure(ErrorType::Execution, "no such table".into(), at);
        assert_eq!(row.value.as_deref(), Some("42"));
        assert_eq!(row.error_type, Some(ErrorType::Execution));
    }

    #[test]
    fn error_type_lenient_parse_falls_back_to_unknown() {
        assert_eq!(ErrorType::parse_lenient("Syntax"), ErrorType::Syntax);
        assert_eq!(ErrorType::parse_lenient("weird"), ErrorType::Unknown);
    }
}
