//! MySQL importers
//!
//! Both importers page through a `SELECT` with `LIMIT`/`OFFSET`. The row count
//! is taken once, before the first page, and becomes the progress total.
//!
//! Table scans are ordered by the table's primary key so pages neither skip
//! nor repeat rows. Query imports keep whatever order the query asks for; a
//! query without `ORDER BY` gets MySQL's unspecified order.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, MySql, Row, TypeInfo};
use std::time::Duration;
use tracing::{debug, info, warn};

use ferry_common::types::NamedEntity;

use super::config::MySqlCredentials;
use super::importer::{Batch, ImportProgress, Importer, Record};
use crate::config::DatabaseConfig;
use crate::error::{WorkerError, WorkerResult};

/// Default page size when the config does not set one
pub const DEFAULT_BATCH_SIZE: u32 = 100;

fn default_batch() -> u32 {
    DEFAULT_BATCH_SIZE
}

/// `config` section of a table import
#[derive(Debug, Clone, Deserialize)]
pub struct MySqlTableConfig {
    pub database_name: NamedEntity,
    pub table_name: NamedEntity,
    #[serde(default = "default_batch")]
    pub batch: u32,
}

/// `config` section of a query import
#[derive(Debug, Clone, Deserialize)]
pub struct MySqlQueryConfig {
    pub database_name: NamedEntity,
    pub query: String,
    #[serde(default = "default_batch")]
    pub batch: u32,
}

impl MySqlTableConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        validate_batch(self.batch)?;
        self.database_name.validate()?;
        self.table_name.validate()?;
        Ok(())
    }

    fn qualified_table(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.database_name.id),
            quote_identifier(&self.table_name.id)
        )
    }

    fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", self.qualified_table())
    }

    fn page_sql(&self, key_columns: &[String]) -> String {
        let order = if key_columns.is_empty() {
            String::new()
        } else {
            let columns: Vec<String> = key_columns.iter().map(|c| quote_identifier(c)).collect();
            format!(" ORDER BY {}", columns.join(", "))
        };
        format!("SELECT * FROM {}{} LIMIT ? OFFSET ?", self.qualified_table(), order)
    }
}

impl MySqlQueryConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        validate_batch(self.batch)?;
        self.database_name.validate()?;

        let query = self.normalized_query();
        if !query.to_ascii_lowercase().starts_with("select") {
            return Err(WorkerError::Configuration(
                "query imports accept a single SELECT statement".to_string(),
            ));
        }
        if unquoted(query).contains(';') {
            return Err(WorkerError::Configuration(
                "query imports accept exactly one statement".to_string(),
            ));
        }
        Ok(())
    }

    fn normalized_query(&self) -> &str {
        self.query.trim().trim_end_matches(';').trim_end()
    }

    fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM ({}) AS ferry_source", self.normalized_query())
    }

    /// The query's own `ORDER BY` only survives when the page clause is
    /// appended to it; a query with its own `LIMIT` is paged as a derived table
    fn page_sql(&self) -> String {
        let query = self.normalized_query();
        if has_keyword(&unquoted(query), "limit") {
            format!("SELECT * FROM ({}) AS ferry_source LIMIT ? OFFSET ?", query)
        } else {
            format!("{} LIMIT ? OFFSET ?", query)
        }
    }
}

fn validate_batch(batch: u32) -> WorkerResult<()> {
    if batch == 0 {
        return Err(WorkerError::Configuration(
            "batch size must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Quote a MySQL identifier with backticks
fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// The query with the contents of every quoted literal or identifier blanked
fn unquoted(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            None => {
                if matches!(c, '\'' | '"' | '`') {
                    quote = Some(c);
                }
                out.push(c);
            },
            Some(q) => {
                if c == '\\' && q != '`' {
                    chars.next();
                    out.push_str("  ");
                } else if c == q {
                    // Doubled quote is an escaped quote
                    if chars.peek() == Some(&q) {
                        chars.next();
                        out.push_str("  ");
                    } else {
                        quote = None;
                        out.push(c);
                    }
                } else {
                    out.push(' ');
                }
            },
        }
    }
    out
}

fn has_keyword(sql: &str, keyword: &str) -> bool {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|word| word.eq_ignore_ascii_case(keyword))
}

async fn connect(
    credentials: MySqlCredentials,
    database: &str,
    settings: &DatabaseConfig,
) -> WorkerResult<MySqlPool> {
    let host = credentials.host.clone();
    let options = credentials.into_connect_options(database);

    let pool = MySqlPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .connect_with(options)
        .await?;

    debug!(host = %host, database, "MySQL pool established");
    Ok(pool)
}

/// Primary key columns of a table, in key order
async fn primary_key_columns(
    pool: &MySqlPool,
    config: &MySqlTableConfig,
) -> WorkerResult<Vec<String>> {
    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT CAST(COLUMN_NAME AS CHAR) FROM information_schema.KEY_COLUMN_USAGE \
         WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
         ORDER BY ORDINAL_POSITION",
    )
    .bind(&config.database_name.id)
    .bind(&config.table_name.id)
    .fetch_all(pool)
    .await?;
    Ok(columns)
}

// ============================================================================
// Paging
// ============================================================================

/// Where pages come from
#[async_trait]
trait PageSource: Send {
    async fn count(&mut self) -> WorkerResult<u64>;

    async fn fetch(&mut self, limit: u32, offset: u64) -> WorkerResult<Batch>;

    /// Release connections once the last page has been read
    async fn close(&mut self);
}

struct MySqlPages {
    pool: MySqlPool,
    count_sql: String,
    page_sql: String,
}

#[async_trait]
impl PageSource for MySqlPages {
    async fn count(&mut self) -> WorkerResult<u64> {
        let total: i64 = sqlx::query_scalar(&self.count_sql).fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    async fn fetch(&mut self, limit: u32, offset: u64) -> WorkerResult<Batch> {
        let rows: Vec<MySqlRow> = sqlx::query(&self.page_sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn close(&mut self) {
        self.pool.close().await;
    }
}

/// `LIMIT`/`OFFSET` pager shared by both importers
struct Pager<S> {
    name: &'static str,
    source: S,
    batch: u32,
    offset: u64,
    total: u64,
    exhausted: bool,
}

impl<S: PageSource> Pager<S> {
    async fn open(name: &'static str, mut source: S, batch: u32) -> WorkerResult<Self> {
        let total = source.count().await?;
        info!(importer = name, total, batch, "Counted source rows");

        Ok(Self {
            name,
            source,
            batch,
            offset: 0,
            total,
            exhausted: false,
        })
    }

    async fn next_page(&mut self) -> WorkerResult<Option<(ImportProgress, Batch)>> {
        if self.exhausted {
            return Ok(None);
        }

        let batch = self.source.fetch(self.batch, self.offset).await?;

        if batch.len() < self.batch as usize {
            self.exhausted = true;
            self.source.close().await;
        }
        if batch.is_empty() {
            return Ok(None);
        }

        self.offset += batch.len() as u64;
        debug!(importer = self.name, offset = self.offset, "Fetched page");

        // Rows inserted after the count was taken push the total up
        self.total = self.total.max(self.offset);

        Ok(Some((
            ImportProgress {
                current: self.offset,
                total: Some(self.total),
            },
            batch,
        )))
    }
}

/// Reads a whole table
pub struct MySqlTableImporter {
    pages: Pager<MySqlPages>,
}

impl MySqlTableImporter {
    pub async fn connect(
        credentials: MySqlCredentials,
        config: MySqlTableConfig,
        settings: &DatabaseConfig,
    ) -> WorkerResult<Self> {
        config.validate()?;
        let pool = connect(credentials, &config.database_name.id, settings).await?;

        let key_columns = primary_key_columns(&pool, &config).await?;
        if key_columns.is_empty() {
            warn!(
                table = %config.table_name.id,
                "Table has no primary key, page order is not guaranteed"
            );
        }

        let source = MySqlPages {
            count_sql: config.count_sql(),
            page_sql: config.page_sql(&key_columns),
            pool,
        };
        let pages = Pager::open("mysql-table", source, config.batch).await?;
        Ok(Self { pages })
    }
}

#[async_trait]
impl Importer for MySqlTableImporter {
    fn name(&self) -> &str {
        self.pages.name
    }

    async fn next_batch(&mut self) -> WorkerResult<Option<(ImportProgress, Batch)>> {
        self.pages.next_page().await
    }
}

/// Reads the result of a caller-supplied `SELECT`
pub struct MySqlQueryImporter {
    pages: Pager<MySqlPages>,
}

impl MySqlQueryImporter {
    pub async fn connect(
        credentials: MySqlCredentials,
        config: MySqlQueryConfig,
        settings: &DatabaseConfig,
    ) -> WorkerResult<Self> {
        config.validate()?;
        let pool = connect(credentials, &config.database_name.id, settings).await?;

        let source = MySqlPages {
            count_sql: config.count_sql(),
            page_sql: config.page_sql(),
            pool,
        };
        let pages = Pager::open("mysql-query", source, config.batch).await?;
        Ok(Self { pages })
    }
}

#[async_trait]
impl Importer for MySqlQueryImporter {
    fn name(&self) -> &str {
        self.pages.name
    }

    async fn next_batch(&mut self) -> WorkerResult<Option<(ImportProgress, Batch)>> {
        self.pages.next_page().await
    }
}

// ============================================================================
// Row conversion
// ============================================================================

/// How a column is decoded, by MySQL type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Signed,
    Unsigned,
    Year,
    Float,
    Decimal,
    Date,
    Time,
    DateTime,
    Timestamp,
    Json,
    Binary,
    Text,
}

impl ColumnKind {
    fn of(type_name: &str) -> Self {
        match type_name {
            "BOOLEAN" => ColumnKind::Bool,
            name if name.ends_with("UNSIGNED") => ColumnKind::Unsigned,
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => ColumnKind::Signed,
            "YEAR" => ColumnKind::Year,
            "FLOAT" | "DOUBLE" => ColumnKind::Float,
            "DECIMAL" => ColumnKind::Decimal,
            "DATE" => ColumnKind::Date,
            "TIME" => ColumnKind::Time,
            "DATETIME" => ColumnKind::DateTime,
            "TIMESTAMP" => ColumnKind::Timestamp,
            "JSON" => ColumnKind::Json,
            "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                ColumnKind::Binary
            },
            _ => ColumnKind::Text,
        }
    }
}

fn datetime_value(value: chrono::NaiveDateTime) -> Value {
    Value::String(value.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn binary_value(bytes: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(bytes).into_owned())
}

/// Convert a row into a JSON object keyed by column name
fn row_to_record(row: &MySqlRow) -> Record {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = column_value(row, column.ordinal(), column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn column_value(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    let decoded: Result<Option<Value>, sqlx::Error> = match ColumnKind::of(type_name) {
        ColumnKind::Bool => get::<bool>(row, index).map(|v| v.map(Value::from)),
        ColumnKind::Signed => get::<i64>(row, index).map(|v| v.map(Value::from)),
        ColumnKind::Unsigned => get::<u64>(row, index).map(|v| v.map(Value::from)),
        ColumnKind::Year => row
            .try_get_unchecked::<Option<u16>, _>(index)
            .map(|v| v.map(Value::from)),
        ColumnKind::Float => get::<f64>(row, index).map(|v| v.map(Value::from)),
        ColumnKind::Decimal => get::<sqlx::types::BigDecimal>(row, index)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        ColumnKind::Date => {
            get::<chrono::NaiveDate>(row, index).map(|v| v.map(|d| Value::String(d.to_string())))
        },
        ColumnKind::Time => {
            get::<chrono::NaiveTime>(row, index).map(|v| v.map(|t| Value::String(t.to_string())))
        },
        ColumnKind::DateTime => get::<chrono::NaiveDateTime>(row, index).map(|v| v.map(datetime_value)),
        ColumnKind::Timestamp => get::<chrono::DateTime<chrono::Utc>>(row, index)
            .map(|v| v.map(|t| Value::String(t.to_rfc3339()))),
        ColumnKind::Json => get::<Value>(row, index),
        ColumnKind::Binary => get::<Vec<u8>>(row, index).map(|v| v.map(|bytes| binary_value(&bytes))),
        ColumnKind::Text => get::<String>(row, index).map(|v| v.map(Value::String)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            debug!(column = index, type_name, error = %e, "Column not decodable, using null");
            Value::Null
        },
    }
}

fn get<'r, T>(row: &'r MySqlRow, index: usize) -> Result<Option<T>, sqlx::Error>
where
    T: sqlx::Decode<'r, MySql> + sqlx::Type<MySql>,
{
    row.try_get::<Option<T>, _>(index)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn entity(id: &str) -> Value {
        json!({ "id": id, "name": id })
    }

    fn table(batch: u32) -> MySqlTableConfig {
        serde_json::from_value(json!({
            "database_name": entity("mysql"),
            "table_name": entity("time`zone"),
            "batch": batch
        }))
        .unwrap()
    }

    fn query(q: &str) -> MySqlQueryConfig {
        MySqlQueryConfig {
            database_name: NamedEntity::new("Rfam", "Rfam").unwrap(),
            query: q.to_string(),
            batch: 2,
        }
    }

    #[derive(Default)]
    struct Calls {
        fetches: Vec<(u32, u64)>,
        closed: usize,
    }

    /// In-memory rows behind the pager
    struct VecSource {
        counted: u64,
        rows: Vec<Record>,
        calls: Arc<Mutex<Calls>>,
    }

    impl VecSource {
        fn new(counted: u64, rows: usize) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            let source = Self {
                counted,
                rows: (0..rows).map(|n| json!({ "n": n })).collect(),
                calls: calls.clone(),
            };
            (source, calls)
        }
    }

    #[async_trait]
    impl PageSource for VecSource {
        async fn count(&mut self) -> WorkerResult<u64> {
            Ok(self.counted)
        }

        async fn fetch(&mut self, limit: u32, offset: u64) -> WorkerResult<Batch> {
            self.calls.lock().unwrap().fetches.push((limit, offset));
            Ok(self
                .rows
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn close(&mut self) {
            self.calls.lock().unwrap().closed += 1;
        }
    }

    async fn drain(pager: &mut Pager<VecSource>) -> Vec<(ImportProgress, usize)> {
        let mut pages = Vec::new();
        while let Some((progress, batch)) = pager.next_page().await.unwrap() {
            pages.push((progress, batch.len()));
        }
        pages
    }

    fn progress(current: u64, total: u64) -> ImportProgress {
        ImportProgress {
            current,
            total: Some(total),
        }
    }

    #[tokio::test]
    async fn test_short_page_ends_run_and_closes_source() {
        let (source, calls) = VecSource::new(5, 5);
        let mut pager = Pager::open("test", source, 2).await.unwrap();

        let pages = drain(&mut pager).await;

        assert_eq!(
            pages,
            vec![(progress(2, 5), 2), (progress(4, 5), 2), (progress(5, 5), 1)]
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls.fetches, vec![(2, 0), (2, 2), (2, 4)]);
        assert_eq!(calls.closed, 1);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_empty_page() {
        let (source, calls) = VecSource::new(4, 4);
        let mut pager = Pager::open("test", source, 2).await.unwrap();

        let pages = drain(&mut pager).await;

        assert_eq!(pages, vec![(progress(2, 4), 2), (progress(4, 4), 2)]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.fetches, vec![(2, 0), (2, 2), (2, 4)]);
        assert_eq!(calls.closed, 1);
        drop(calls);

        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rows_added_after_count_raise_total() {
        let (source, _calls) = VecSource::new(2, 3);
        let mut pager = Pager::open("test", source, 2).await.unwrap();

        let pages = drain(&mut pager).await;

        assert_eq!(pages, vec![(progress(2, 2), 2), (progress(3, 3), 1)]);
        assert!(pages.iter().all(|(p, _)| p.total.is_some_and(|t| p.current <= t)));
    }

    #[tokio::test]
    async fn test_empty_source_yields_nothing() {
        let (source, calls) = VecSource::new(0, 0);
        let mut pager = Pager::open("test", source, 10).await.unwrap();

        assert!(drain(&mut pager).await.is_empty());
        assert_eq!(calls.lock().unwrap().closed, 1);
    }

    #[test]
    fn test_table_scan_is_ordered_by_primary_key() {
        let config = table(10);
        config.validate().unwrap();

        assert_eq!(config.count_sql(), "SELECT COUNT(*) FROM `mysql`.`time``zone`");
        assert_eq!(
            config.page_sql(&["tz_id".to_string(), "ts".to_string()]),
            "SELECT * FROM `mysql`.`time``zone` ORDER BY `tz_id`, `ts` LIMIT ? OFFSET ?"
        );
        assert_eq!(
            config.page_sql(&[]),
            "SELECT * FROM `mysql`.`time``zone` LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn test_query_pages_keep_query_order() {
        assert_eq!(
            query("SELECT * FROM family ORDER BY rfam_acc;").page_sql(),
            "SELECT * FROM family ORDER BY rfam_acc LIMIT ? OFFSET ?"
        );
        assert_eq!(
            query("SELECT * FROM family LIMIT 10").page_sql(),
            "SELECT * FROM (SELECT * FROM family LIMIT 10) AS ferry_source LIMIT ? OFFSET ?"
        );
        assert_eq!(
            query("SELECT limit_value FROM quota").page_sql(),
            "SELECT limit_value FROM quota LIMIT ? OFFSET ?"
        );
    }

    #[test]
    fn test_batch_defaults_and_zero_is_rejected() {
        let config: MySqlTableConfig = serde_json::from_value(json!({
            "database_name": entity("db"),
            "table_name": entity("t")
        }))
        .unwrap();
        assert_eq!(config.batch, DEFAULT_BATCH_SIZE);

        assert!(matches!(table(0).validate(), Err(WorkerError::Configuration(_))));
    }

    #[test]
    fn test_query_must_be_single_select() {
        assert!(query("SELECT * FROM family WHERE match_pair_node=false;").validate().is_ok());
        assert!(query("  select id from family").validate().is_ok());
        assert!(query("DELETE FROM family").validate().is_err());
        assert!(query("SELECT 1; DROP TABLE family").validate().is_err());
    }

    #[test]
    fn test_semicolons_inside_literals_are_allowed() {
        assert!(query("SELECT * FROM notes WHERE note = 'a;b'").validate().is_ok());
        assert!(query(r#"SELECT * FROM notes WHERE note = "it's; fine""#).validate().is_ok());
        assert!(query(r"SELECT * FROM notes WHERE note = 'a\';b'").validate().is_ok());
        assert!(query("SELECT * FROM notes WHERE note = 'a'';b'").validate().is_ok());
        assert!(query("SELECT `a;b` FROM notes").validate().is_ok());
        assert!(query("SELECT 'a;b'; DROP TABLE notes").validate().is_err());
    }

    #[test]
    fn test_normalized_query_strips_trailing_semicolon() {
        assert_eq!(query("SELECT * FROM family ;  ").normalized_query(), "SELECT * FROM family");
    }

    #[test]
    fn test_column_kind_by_type_name() {
        let cases = [
            ("BOOLEAN", ColumnKind::Bool),
            ("INT", ColumnKind::Signed),
            ("BIGINT", ColumnKind::Signed),
            ("INT UNSIGNED", ColumnKind::Unsigned),
            ("BIGINT UNSIGNED", ColumnKind::Unsigned),
            ("YEAR", ColumnKind::Year),
            ("DOUBLE", ColumnKind::Float),
            ("DECIMAL", ColumnKind::Decimal),
            ("DATETIME", ColumnKind::DateTime),
            ("TIMESTAMP", ColumnKind::Timestamp),
            ("JSON", ColumnKind::Json),
            ("VARBINARY", ColumnKind::Binary),
            ("LONGBLOB", ColumnKind::Binary),
            ("VARCHAR", ColumnKind::Text),
            ("ENUM", ColumnKind::Text),
        ];
        for (name, kind) in cases {
            assert_eq!(ColumnKind::of(name), kind, "{name}");
        }
    }

    #[test]
    fn test_datetime_and_binary_values() {
        let at = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_milli_opt(12, 30, 5, 250)
            .unwrap();
        assert_eq!(datetime_value(at), json!("2024-03-01T12:30:05.250"));
        assert_eq!(binary_value(b"abc"), json!("abc"));
        assert_eq!(binary_value(&[0x61, 0xff]), json!("a\u{fffd}"));
    }
}
