//! In-memory store and writer
//!
//! [`InMemoryStore`] implements every extraction request over rows held in
//! memory, with hooks to inject failures and count calls. [`MemoryWriter`]
//! keeps written rows per table. Together they run the whole engine without a
//! network or a filesystem, which is what the tests and the CLI's fixture
//! mode use.

use crate::error::{StoreError, StoreErrorKind, WriterError};
use crate::graph::TableDescriptor;
use crate::source::{
    ExtractionRequest, FormatConfig, RemoteStore, Row, RowStream, TableStream, TableWriter,
    WriteReceipt,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
struct StoreData {
    /// Keyed by lowercase table name
    tables: BTreeMap<String, (TableDescriptor, Vec<Row>)>,
    /// Keyed by trimmed SQL text
    queries: HashMap<String, Vec<Row>>,
    failures: HashMap<String, VecDeque<StoreError>>,
    stream_calls: HashMap<String, u32>,
}

/// A [`RemoteStore`] over in-memory rows.
///
/// Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<StoreData>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("tables", &self.data.read().tables.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table.
    pub fn insert_table(&self, descriptor: TableDescriptor, rows: Vec<Row>) {
        let key = descriptor.name.to_lowercase();
        self.data.write().tables.insert(key, (descriptor, rows));
    }

    /// Rows returned for `sql` when a `query` extraction sends exactly that text.
    pub fn register_query(&self, sql: &str, rows: Vec<Row>) {
        self.data.write().queries.insert(sql.trim().to_string(), rows);
    }

    /// The next `stream_table` calls for `table` fail with these errors, in order.
    pub fn fail_next(&self, table: &str, errors: impl IntoIterator<Item = StoreError>) {
        self.data
            .write()
            .failures
            .entry(table.to_lowercase())
            .or_default()
            .extend(errors);
    }

    /// How many times `stream_table` was called for `table`.
    pub fn stream_calls(&self, table: &str) -> u32 {
        self.data
            .read()
            .stream_calls
            .get(&table.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn table_count(&self) -> usize {
        self.data.read().tables.len()
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.data
            .read()
            .tables
            .get(&table.to_lowercase())
            .map(|(_, rows)| rows.len())
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn list_tables(&self) -> Result<Vec<TableDescriptor>, StoreError> {
        Ok(self
            .data
            .read()
            .tables
            .values()
            .map(|(descriptor, rows)| {
                let mut descriptor = descriptor.clone();
                descriptor
                    .estimated_row_count
                    .get_or_insert(rows.len() as u64);
                descriptor
            })
            .collect())
    }

    async fn stream_table(
        &self,
        table: &str,
        request: &ExtractionRequest,
    ) -> Result<TableStream, StoreError> {
        let key = table.to_lowercase();
        let selected = {
            let mut data = self.data.write();
            *data.stream_calls.entry(key.clone()).or_insert(0) += 1;
            if let Some(err) = data.failures.get_mut(&key).and_then(VecDeque::pop_front) {
                return Err(err);
            }

            if let ExtractionRequest::Query { sql, .. } = request {
                let rows = data.queries.get(sql.trim()).cloned().ok_or_else(|| {
                    StoreError::new(
                        StoreErrorKind::Unsupported,
                        format!("no result registered for query on '{table}'"),
                    )
                })?;
                return Ok(TableStream {
                    rows: into_stream(rows),
                    source_row_count: None,
                });
            }

            let (_, rows) = data
                .tables
                .get(&key)
                .ok_or_else(|| StoreError::not_found(format!("table '{table}' does not exist")))?;
            (select(rows, request)?, rows.len() as u64)
        };

        let (rows, total) = selected;
        Ok(TableStream {
            rows: into_stream(rows),
            source_row_count: Some(total),
        })
    }
}

fn into_stream(rows: Vec<Row>) -> RowStream {
    futures::stream::iter(rows.into_iter().map(Ok)).boxed()
}

fn limit(n: u64, len: usize) -> usize {
    usize::try_from(n).map_or(len, |n| n.min(len))
}

fn select(rows: &[Row], request: &ExtractionRequest) -> Result<Vec<Row>, StoreError> {
    let picked = match request {
        ExtractionRequest::Everything => rows.to_vec(),
        ExtractionRequest::Head { limit: n } => rows[..limit(*n, rows.len())].to_vec(),
        ExtractionRequest::Tail { limit: n } => {
            rows[rows.len() - limit(*n, rows.len())..].to_vec()
        }
        ExtractionRequest::Sample { rows: n, seed } => {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(*seed),
                None => StdRng::from_entropy(),
            };
            let mut indices =
                rand::seq::index::sample(&mut rng, rows.len(), limit(*n, rows.len())).into_vec();
            indices.sort_unstable();
            indices.into_iter().map(|i| rows[i].clone()).collect()
        }
        ExtractionRequest::Latest { order_by, limit: n } => {
            require_column(rows, order_by)?;
            let mut sorted = rows.to_vec();
            sorted.sort_by(|a, b| compare_desc(a.get(order_by), b.get(order_by)));
            sorted.truncate(limit(*n, rows.len()));
            sorted
        }
        ExtractionRequest::Stratified { column, rows: n } => {
            require_column(rows, column)?;
            stratify(rows, column, limit(*n, rows.len()))
        }
        ExtractionRequest::Query { .. } => {
            return Err(StoreError::new(
                StoreErrorKind::Unsupported,
                "query requests are answered from registered results",
            ))
        }
    };
    Ok(picked)
}

fn require_column(rows: &[Row], column: &str) -> Result<(), StoreError> {
    match rows.first() {
        Some(row) if !row.contains_key(column) => Err(StoreError::new(
            StoreErrorKind::Schema,
            format!("column '{column}' does not exist"),
        )),
        _ => Ok(()),
    }
}

/// Newest first; nulls and missing values last.
fn compare_desc(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn present(v: Option<&Value>) -> Option<&Value> {
        v.filter(|v| !v.is_null())
    }
    match (present(a), present(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => compare_values(b, a),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        if let (Some(x), Some(y)) = (parse_timestamp(x), parse_timestamp(y)) {
            return x.cmp(&y);
        }
        return x.cmp(y);
    }
    a.to_string().cmp(&b.to_string())
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// `n` rows split across values of `column` by largest remainder, first rows
/// of each group, natural order preserved.
fn stratify(rows: &[Row], column: &str, n: usize) -> Vec<Row> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        let value = row.get(column).map_or_else(|| "null".to_string(), Value::to_string);
        groups.entry(value).or_default().push(i);
    }

    let total = rows.len().max(1);
    let mut quotas: Vec<(usize, usize, &Vec<usize>)> = groups
        .values()
        .map(|members| {
            let exact = members.len() * n;
            (exact / total, exact % total, members)
        })
        .collect();

    let mut remaining = n - quotas.iter().map(|(q, _, _)| q).sum::<usize>();
    let mut order: Vec<usize> = (0..quotas.len()).collect();
    order.sort_by(|&a, &b| quotas[b].1.cmp(&quotas[a].1));
    for i in order {
        if remaining == 0 {
            break;
        }
        if quotas[i].0 < quotas[i].2.len() {
            quotas[i].0 += 1;
            remaining -= 1;
        }
    }

    let mut picked: Vec<usize> = quotas
        .iter()
        .flat_map(|(quota, _, members)| members.iter().take(*quota).copied())
        .collect();
    picked.sort_unstable();
    picked.into_iter().map(|i| rows[i].clone()).collect()
}

/// A [`TableWriter`] that keeps rows in memory, replacing on rewrite.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    tables: Arc<RwLock<HashMap<String, Vec<Row>>>>,
    writes: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWriter")
            .field("tables", &self.tables.read().len())
            .finish()
    }
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows last written for `table`.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        self.tables.read().get(table).cloned()
    }

    pub fn written_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total completed writes, including rewrites.
    pub fn write_count(&self) -> u64 {
        self.writes.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl TableWriter for MemoryWriter {
    async fn write(
        &self,
        table: &str,
        mut rows: RowStream,
        format: &FormatConfig,
    ) -> Result<WriteReceipt, WriterError> {
        let mut buffer = Vec::new();
        while let Some(row) = rows.next().await {
            buffer.push(row?);
        }

        let rows_written = buffer.len() as u64;
        self.tables.write().insert(table.to_string(), buffer);
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);

        Ok(WriteReceipt {
            location: format!("memory://{}", format.location_for(table).display()),
            rows_written,
        })
    }
}
