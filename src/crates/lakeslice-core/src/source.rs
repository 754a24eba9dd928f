//! Collaborator seams: the remote store the rows come from and the writer
//! they go to
//!
//! Neither side is implemented here beyond the in-memory doubles in
//! [`crate::memory`]; real bindings (a warehouse client, a Parquet writer)
//! live outside the core and only need to satisfy these traits.
//!
//! ```text
//!            ExtractionRequest                  RowStream
//! SampleSpec ─────────────────▶ RemoteStore ─────────────────▶ TableWriter ──▶ location
//!  (pure mapping)              stream_table()                 write()
//! ```

use crate::error::{StoreError, WriterError};
use crate::graph::TableDescriptor;
use crate::spec::SampleSpec;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One row, column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows streamed from a store. A failing item ends the extraction attempt.
pub type RowStream = BoxStream<'static, Result<Row, StoreError>>;

/// Rows of one extraction plus the table's total size when the store knows
/// it without a full scan.
pub struct TableStream {
    pub rows: RowStream,
    pub source_row_count: Option<u64>,
}

impl fmt::Debug for TableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableStream")
            .field("source_row_count", &self.source_row_count)
            .finish_non_exhaustive()
    }
}

/// What to ask the store for. Built from a [`SampleSpec`] by a pure lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionRequest {
    /// Probabilistic sample of `rows` rows
    Sample { rows: u64, seed: Option<u64> },
    /// Newest `limit` rows by `order_by`, descending
    Latest { order_by: String, limit: u64 },
    /// First `limit` rows in natural order
    Head { limit: u64 },
    /// Last `limit` rows in natural order
    Tail { limit: u64 },
    /// About `rows` rows, each value of `column` represented proportionally
    Stratified { column: String, rows: u64 },
    /// Caller SQL, passed through verbatim; at most `limit` rows are kept
    Query { sql: String, limit: u64 },
    /// Every row
    Everything,
}

impl ExtractionRequest {
    pub fn from_spec(spec: &SampleSpec) -> Self {
        match spec {
            SampleSpec::Random { row_budget, seed } => ExtractionRequest::Sample {
                rows: *row_budget,
                seed: *seed,
            },
            SampleSpec::Recent {
                row_budget,
                date_column,
            } => ExtractionRequest::Latest {
                order_by: date_column.clone(),
                limit: *row_budget,
            },
            SampleSpec::Head { row_budget } => ExtractionRequest::Head { limit: *row_budget },
            SampleSpec::Tail { row_budget } => ExtractionRequest::Tail { limit: *row_budget },
            SampleSpec::Stratified {
                row_budget,
                stratify_column,
            } => ExtractionRequest::Stratified {
                column: stratify_column.clone(),
                rows: *row_budget,
            },
            SampleSpec::Query {
                row_budget,
                custom_query,
            } => ExtractionRequest::Query {
                sql: custom_query.clone(),
                limit: *row_budget,
            },
            SampleSpec::Full => ExtractionRequest::Everything,
        }
    }

    /// Upper bound on rows this request may produce.
    pub fn row_limit(&self) -> Option<u64> {
        match self {
            ExtractionRequest::Sample { rows, .. } | ExtractionRequest::Stratified { rows, .. } => {
                Some(*rows)
            }
            ExtractionRequest::Latest { limit, .. }
            | ExtractionRequest::Head { limit }
            | ExtractionRequest::Tail { limit }
            | ExtractionRequest::Query { limit, .. } => Some(*limit),
            ExtractionRequest::Everything => None,
        }
    }

    /// Render as SQL for stores that speak a DuckDB-flavoured dialect.
    pub fn to_sql(&self, table: &str) -> String {
        let t = quote_ident(table);
        match self {
            ExtractionRequest::Sample { rows, seed } => match seed {
                Some(seed) => {
                    format!("SELECT * FROM {t} USING SAMPLE reservoir({rows} ROWS) REPEATABLE ({seed})")
                }
                None => format!("SELECT * FROM {t} USING SAMPLE reservoir({rows} ROWS)"),
            },
            ExtractionRequest::Latest { order_by, limit } => format!(
                "SELECT * FROM {t} ORDER BY {} DESC NULLS LAST LIMIT {limit}",
                quote_ident(order_by)
            ),
            ExtractionRequest::Head { limit } => format!("SELECT * FROM {t} LIMIT {limit}"),
            ExtractionRequest::Tail { limit } => format!(
                "SELECT * EXCLUDE (__ls_rn) FROM (\
                 SELECT * FROM (SELECT *, row_number() OVER () AS __ls_rn FROM {t}) \
                 ORDER BY __ls_rn DESC LIMIT {limit}) ORDER BY __ls_rn"
            ),
            ExtractionRequest::Stratified { column, rows } => {
                let c = quote_ident(column);
                format!(
                    "SELECT * EXCLUDE (__ls_rn, __ls_n, __ls_total) FROM (\
                     SELECT *, \
                     row_number() OVER (PARTITION BY {c} ORDER BY random()) AS __ls_rn, \
                     count(*) OVER (PARTITION BY {c}) AS __ls_n, \
                     count(*) OVER () AS __ls_total \
                     FROM {t}) \
                     WHERE __ls_rn <= greatest(1, round(__ls_n * {rows} / __ls_total)) \
                     LIMIT {rows}"
                )
            }
            ExtractionRequest::Query { sql, .. } => sql.clone(),
            ExtractionRequest::Everything => format!("SELECT * FROM {t}"),
        }
    }
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Output file formats. The core passes this through to the writer untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Parquet,
    Csv,
    Json,
    #[default]
    Jsonl,
    Duckdb,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
            OutputFormat::Duckdb => "duckdb",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Where and how a writer should emit a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default)]
    pub format: OutputFormat,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub compression: Option<String>,
}

impl FormatConfig {
    pub fn new(format: OutputFormat, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            format,
            output_dir: output_dir.into(),
            compression: None,
        }
    }

    /// `<output_dir>/<table>.<ext>`; the same table always maps to the same path.
    pub fn location_for(&self, table: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", table, self.format.extension()))
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self::new(OutputFormat::default(), "lakeslice-data")
    }
}

/// What a writer reports after a table is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub location: String,
    pub rows_written: u64,
}

/// Remote tabular store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>, StoreError>;

    async fn stream_table(
        &self,
        table: &str,
        request: &ExtractionRequest,
    ) -> Result<TableStream, StoreError>;
}

/// Local sink for extracted rows.
///
/// Writing the same table to the same output directory twice must replace
/// the earlier output, not append to it.
#[async_trait]
pub trait TableWriter: Send + Sync {
    async fn write(
        &self,
        table: &str,
        rows: RowStream,
        format: &FormatConfig,
    ) -> Result<WriteReceipt, WriterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traits_are_object_safe() {
        fn _store(_: &dyn RemoteStore) {}
        fn _writer(_: &dyn TableWriter) {}
    }

    #[test]
    fn test_request_mapping() {
        let recent = SampleSpec::Recent {
            row_budget: 100,
            date_column: "created_at".into(),
        };
        assert_eq!(
            ExtractionRequest::from_spec(&recent),
            ExtractionRequest::Latest {
                order_by: "created_at".into(),
                limit: 100
            }
        );
        assert_eq!(
            ExtractionRequest::from_spec(&SampleSpec::Full),
            ExtractionRequest::Everything
        );
        assert_eq!(ExtractionRequest::Everything.row_limit(), None);
        assert_eq!(ExtractionRequest::Head { limit: 3 }.row_limit(), Some(3));
    }

    #[test]
    fn test_sql_rendering() {
        assert_eq!(
            ExtractionRequest::Sample {
                rows: 50,
                seed: Some(42)
            }
            .to_sql("orders"),
            r#"SELECT * FROM "orders" USING SAMPLE reservoir(50 ROWS) REPEATABLE (42)"#
        );
        assert_eq!(
            ExtractionRequest::Latest {
                order_by: "ts".into(),
                limit: 10
            }
            .to_sql("events"),
            r#"SELECT * FROM "events" ORDER BY "ts" DESC NULLS LAST LIMIT 10"#
        );
        assert_eq!(
            ExtractionRequest::Everything.to_sql(r#"we"ird"#),
            r#"SELECT * FROM "we""ird""#
        );

        let sql = "SELECT id FROM orders WHERE total > 10";
        assert_eq!(
            ExtractionRequest::Query {
                sql: sql.into(),
                limit: 5
            }
            .to_sql("ignored"),
            sql
        );
        assert!(ExtractionRequest::Stratified {
            column: "region".into(),
            rows: 100
        }
        .to_sql("sales")
        .contains(r#"PARTITION BY "region""#));
    }

    #[test]
    fn test_location_is_stable_per_table() {
        let format = FormatConfig::new(OutputFormat::Parquet, "/data");
        assert_eq!(format.location_for("orders"), PathBuf::from("/data/orders.parquet"));
        assert_eq!(format.location_for("orders"), format.location_for("orders"));
    }
}
