//! Row Store: the local SQLite cache holding row definitions and last-known values.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bidash_core::{ErrorType, Row, RowDefinition, ServerName};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row as SqlxRow, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bidash-storage";

pub const SEED_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("seed file error: {0}")]
    Seed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SELECT_COLUMNS: &str = "id, chart_group, chart_name, variable_name, server_name, \
     db_table_name, sql_expression, value, last_updated, error, error_type";

const UPSERT_ROW_SQL: &str = r#"
    INSERT INTO chart_rows (
        id, chart_group, chart_name, variable_name, server_name,
        db_table_name, sql_expression, value, last_updated, error, error_type
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
    ON CONFLICT(id) DO UPDATE SET
        chart_group    = excluded.chart_group,
        chart_name     = excluded.chart_name,
        variable_name  = excluded.variable_name,
        server_name    = excluded.server_name,
        db_table_name  = excluded.db_table_name,
        sql_expression = excluded.sql_expression,
        value          = excluded.value,
        last_updated   = excluded.last_updated,
        error          = excluded.error,
        error_type     = excluded.error_type
"#;

const SEED_ROW_SQL: &str = r#"
    INSERT INTO chart_rows (
        id, chart_group, chart_name, variable_name, server_name, db_table_name, sql_expression
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(id) DO UPDATE SET
        chart_group    = excluded.chart_group,
        chart_name     = excluded.chart_name,
        variable_name  = excluded.variable_name,
        server_name    = excluded.server_name,
        db_table_name  = excluded.db_table_name,
        sql_expression = excluded.sql_expression
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone)]
pub struct RowStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl RowStore {
    /// Open (creating if needed) the cache database and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path = %path.display(), "row store opened");

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// All rows in authored (insertion) order.
    pub async fn list_rows(&self) -> StoreResult<Vec<Row>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM chart_rows ORDER BY rowid");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let decoded = rows.iter().map(decode_row).collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(decoded)
    }

    pub async fn get_row(&self, id: &str) -> StoreResult<Option<Row>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM chart_rows WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(r) => Ok(Some(decode_row(&r)?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self) -> StoreResult<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chart_rows")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as usize)
    }

    /// Bulk upsert; every column is written exactly as given.
    pub async fn upsert_rows(&self, rows: &[Row]) -> StoreResult<usize> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            bind_row(UPSERT_ROW_SQL, row).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    pub async fn save_row(&self, row: &Row) -> StoreResult<()> {
        bind_row(UPSERT_ROW_SQL, row).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns `false` when no row has this id.
    pub async fn record_success(
        &self,
        id: &str,
        value: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chart_rows
               SET value = ?1,
                   last_updated = ?2,
                   error = NULL,
                   error_type = NULL
             WHERE id = ?3
            "#,
        )
        .bind(value)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records a failure; `value` is left as it was.
    pub async fn record_failure(
        &self,
        id: &str,
        error_type: ErrorType,
        message: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE chart_rows
               SET last_updated = ?1,
                   error = ?2,
                   error_type = ?3
             WHERE id = ?4
            "#,
        )
        .bind(at)
        .bind(message)
        .bind(error_type.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert missing rows and refresh authored columns of existing ones.
    /// Cached values, timestamps and errors are never touched.
    pub async fn seed_definitions(&self, defs: &[RowDefinition]) -> StoreResult<SeedReport> {
        let mut report = SeedReport::default();
        let mut tx = self.pool.begin().await?;
        for def in defs {
            let exists = sqlx::query("SELECT 1 FROM chart_rows WHERE id = ?1")
                .bind(&def.id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            sqlx::query(SEED_ROW_SQL)
                .bind(&def.id)
                .bind(&def.chart_group)
                .bind(&def.chart_name)
                .bind(&def.variable_name)
                .bind(&def.server_name)
                .bind(&def.table_name)
                .bind(&def.sql_expression)
                .execute(&mut *tx)
                .await?;
            if exists {
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
        }
        tx.commit().await?;
        info!(inserted = report.inserted, updated = report.updated, "seeded row definitions");
        Ok(report)
    }
}

fn bind_row<'q>(
    sql: &'q str,
    row: &'q Row,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(&row.id)
        .bind(&row.chart_group)
        .bind(&row.chart_name)
        .bind(&row.variable_name)
        .bind(&row.server_name)
        .bind(&row.table_name)
        .bind(&row.sql_expression)
        .bind(&row.value)
        .bind(row.last_updated)
        .bind(&row.error)
        .bind(row.error_type.map(|t| t.as_str()))
}

fn decode_row(r: &SqliteRow) -> Result<Row, sqlx::Error> {
    let error_type: Option<String> = r.try_get("error_type")?;
    Ok(Row {
        id: r.try_get("id")?,
        chart_group: r.try_get("chart_group")?,
        chart_name: r.try_get("chart_name")?,
        variable_name: r.try_get("variable_name")?,
        server_name: r.try_get("server_name")?,
        table_name: r.try_get("db_table_name")?,
        sql_expression: r.try_get("sql_expression")?,
        value: r.try_get("value")?,
        last_updated: r.try_get("last_updated")?,
        error: r.try_get("error")?,
        error_type: error_type.as_deref().map(ErrorType::parse_lenient),
    })
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    version: u32,
    #[serde(default)]
    rows: Vec<RowDefinition>,
}

/// Parse the versioned YAML seed file of row definitions.
pub async fn load_seed_file(path: impl AsRef<Path>) -> StoreResult<Vec<RowDefinition>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).await?;
    parse_seed_yaml(&text)
        .map_err(|e| StoreError::Seed(format!("{}: {e}", path.display())))
}

pub fn parse_seed_yaml(text: &str) -> Result<Vec<RowDefinition>, String> {
    let parsed: SeedFile = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    if parsed.version != SEED_FILE_VERSION {
        return Err(format!(
            "unsupported seed file version {} (expected {SEED_FILE_VERSION})",
            parsed.version
        ));
    }

    let mut seen = HashSet::new();
    for def in &parsed.rows {
        if !seen.insert(def.id.as_str()) {
            return Err(format!("duplicate row id '{}'", def.id));
        }
        if def.server_name.parse::<ServerName>().is_err() {
            warn!(row_id = %def.id, server = %def.server_name, "seed row targets an unsupported server");
        }
    }
    Ok(parsed.rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 15, 0).single().unwrap()
    }

    fn mk_row(id: &str, server: &str, sql: &str) -> Row {
        Row {
            id: id.into(),
            chart_group: "AR Aging".into(),
            chart_name: "Aging Buckets".into(),
            variable_name: format!("bucket-{id}"),
            server_name: server.into(),
            table_name: "ar_open_items".into(),
            sql_expression: sql.into(),
            value: None,
            last_updated: None,
            error: None,
            error_type: None,
        }
    }

    async fn open_store() -> (tempfile::TempDir, RowStore) {
        let dir = tempdir().expect("tempdir");
        let store = RowStore::open(dir.path().join("cache/dashboard.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn bulk_upsert_then_list_returns_posted_rows_in_order() {
        let (_dir, store) = open_store().await;
        let mut a = mk_row("10", "P21", "SELECT 1");
        a.value = Some("7".into());
        a.last_updated = Some(ts(9));
        let mut b = mk_row("2", "POR", "SELECT Count(*) FROM Contracts");
        b.error = Some("boom".into());
        b.error_type = Some(ErrorType::Syntax);

        store.upsert_rows(&[a.clone(), b.clone()]).await.expect("upsert");
        let rows = store.list_rows().await.expect("list");
        assert_eq!(rows, vec![a.clone(), b.clone()]);

        // Re-upserting an edited row keeps its position.
        let mut edited = a.clone();
        edited.sql_expression = "SELECT 2".into();
        store.upsert_rows(&[edited.clone()]).await.expect("upsert edit");
        let rows = store.list_rows().await.expect("list");
        assert_eq!(rows[0], edited);
        assert_eq!(rows[1], b);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn record_success_clears_error_and_failure_keeps_value() {
        let (_dir, store) = open_store().await;
        let mut row = mk_row("6", "P21", "SELECT COUNT(*) as value FROM oe_hdr");
        row.error = Some("stale".into());
        row.error_type = Some(ErrorType::Connection);
        store.save_row(&row).await.expect("save");

        assert!(store.record_success("6", "42", ts(10)).await.unwrap());
        let after = store.get_row("6").await.unwrap().unwrap();
        assert_eq!(after.value.as_deref(), Some("42"));
        assert_eq!(after.error, None);
        assert_eq!(after.error_type, None);
        assert_eq!(after.last_updated, Some(ts(10)));

        assert!(store
            .record_failure("6", ErrorType::Execution, "Invalid object name", ts(11))
            .await
            .unwrap());
        let after = store.get_row("6").await.unwrap().unwrap();
        assert_eq!(after.value.as_deref(), Some("42"));
        assert_eq!(after.error_type, Some(ErrorType::Execution));
        assert_eq!(after.last_updated, Some(ts(11)));

        assert!(!store.record_success("missing", "1", ts(12)).await.unwrap());
    }

    #[tokio::test]
    async fn seeding_refreshes_definitions_without_touching_values() {
        let (_dir, store) = open_store().await;
        let mut existing = mk_row("1", "P21", "SELECT 0");
        existing.value = Some("99".into());
        existing.last_updated = Some(ts(8));
        store.save_row(&existing).await.unwrap();

        let defs = vec![
            RowDefinition {
                id: "1".into(),
                chart_group: "AR Aging".into(),
                chart_name: "Aging Buckets".into(),
                variable_name: "Current".into(),
                server_name: "P21".into(),
                table_name: "ar_open_items".into(),
                sql_expression: "SELECT SUM(amount) FROM ar_open_items".into(),
            },
            RowDefinition {
                id: "30".into(),
                chart_group: "POR Overview".into(),
                chart_name: "Open Contracts".into(),
                variable_name: "Open".into(),
                server_name: "POR".into(),
                table_name: "Contracts".into(),
                sql_expression: "SELECT Count(*) FROM Contracts".into(),
            },
        ];
        let report = store.seed_definitions(&defs).await.unwrap();
        assert_eq!(report, SeedReport { inserted: 1, updated: 1 });

        let one = store.get_row("1").await.unwrap().unwrap();
        assert_eq!(one.value.as_deref(), Some("99"));
        assert_eq!(one.last_updated, Some(ts(8)));
        assert_eq!(one.variable_name, "Current");
        assert_eq!(one.sql_expression, "SELECT SUM(amount) FROM ar_open_items");

        let thirty = store.get_row("30").await.unwrap().unwrap();
        assert_eq!(thirty.value, None);
        assert_eq!(thirty.server_name, "POR");
    }

    #[test]
    fn seed_yaml_rejects_duplicates_and_unknown_versions() {
        let dupes = r#"
version: 1
rows:
  - { id: "1", chartGroup: A, serverName: P21, sqlExpression: "SELECT 1" }
  - { id: "1", chartGroup: B, serverName: POR, sqlExpression: "SELECT 2" }
"#;
        assert!(parse_seed_yaml(dupes).unwrap_err().contains("duplicate row id '1'"));

        let future = "version: 2\nrows: []\n";
        assert!(parse_seed_yaml(future).unwrap_err().contains("unsupported seed file version"));

        let ok = r#"
version: 1
rows:
  - id: "6"
    chartGroup: Key Metrics
    chartName: Orders
    variableName: Total Orders
    serverName: P21
    tableName: oe_hdr
    sqlExpression: SELECT COUNT(*) as value FROM oe_hdr
"#;
        let defs = parse_seed_yaml(ok).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].table_name, "oe_hdr");
    }

    #[tokio::test]
    async fn workspace_seed_file_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let defs = load_seed_file(root.join("rows.yaml")).await.expect("rows.yaml");
        assert!(!defs.is_empty());
        assert!(defs.iter().all(|d| d.server_name.parse::<ServerName>().is_ok()));
    }
}
