//! Per-table unit of work: one spec, one store request, one write

use crate::error::ExtractionError;
use crate::graph::TableDescriptor;
use crate::source::{ExtractionRequest, FormatConfig, RemoteStore, TableWriter};
use crate::spec::SampleSpec;
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// What one successful attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOutput {
    pub sampled_row_count: u64,
    pub source_row_count: Option<u64>,
    pub output_location: String,
}

/// Turns a table and its [`SampleSpec`] into rows written by a [`TableWriter`].
///
/// A job performs exactly one attempt per call; retries are the
/// orchestrator's business.
#[derive(Clone)]
pub struct ExtractionJob {
    store: Arc<dyn RemoteStore>,
    writer: Arc<dyn TableWriter>,
    format: FormatConfig,
}

impl std::fmt::Debug for ExtractionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionJob")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ExtractionJob {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        writer: Arc<dyn TableWriter>,
        format: FormatConfig,
    ) -> Self {
        Self {
            store,
            writer,
            format,
        }
    }

    pub fn format(&self) -> &FormatConfig {
        &self.format
    }

    /// The same store and writer with different output settings.
    pub fn with_format(&self, format: FormatConfig) -> Self {
        Self {
            store: Arc::clone(&self.store),
            writer: Arc::clone(&self.writer),
            format,
        }
    }

    /// One attempt. Errors keep their retry classification.
    pub async fn attempt(
        &self,
        table: &TableDescriptor,
        spec: &SampleSpec,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let request = ExtractionRequest::from_spec(spec);
        if let ExtractionRequest::Query { sql, .. } = &request {
            check_query(sql)?;
        }
        debug!(table = %table.name, request = ?request, "Requesting rows");

        let stream = self.store.stream_table(&table.name, &request).await?;
        let rows = match request.row_limit() {
            Some(limit) => stream
                .rows
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .boxed(),
            None => stream.rows,
        };

        let receipt = self.writer.write(&table.name, rows, &self.format).await?;
        let source_row_count = match spec {
            SampleSpec::Full => Some(receipt.rows_written),
            _ => stream.source_row_count,
        };

        Ok(ExtractionOutput {
            sampled_row_count: receipt.rows_written,
            source_row_count,
            output_location: receipt.location,
        })
    }
}

/// Syntactic sanity check for caller SQL: a single read statement with
/// balanced quotes and parentheses. Anything deeper is the engine's call.
pub fn check_query(sql: &str) -> Result<(), ExtractionError> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if trimmed.is_empty() {
        return Err(ExtractionError::InvalidQuery("query is empty".to_string()));
    }

    let first_word = trimmed
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if !matches!(first_word.as_str(), "SELECT" | "WITH" | "FROM" | "VALUES") {
        return Err(ExtractionError::InvalidQuery(format!(
            "expected a SELECT statement, found '{first_word}'"
        )));
    }

    let mut depth: i64 = 0;
    let mut quote: Option<char> = None;
    for c in trimmed.chars() {
        match (quote, c) {
            (Some(open), c) if c == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth < 0 {
                    return Err(ExtractionError::InvalidQuery(
                        "unbalanced ')'".to_string(),
                    ));
                }
            }
            (None, ';') => {
                return Err(ExtractionError::InvalidQuery(
                    "multiple statements are not allowed".to_string(),
                ));
            }
            _ => {}
        }
    }
    if let Some(open) = quote {
        return Err(ExtractionError::InvalidQuery(format!("unterminated {open} quote")));
    }
    if depth != 0 {
        return Err(ExtractionError::InvalidQuery("unbalanced '('".to_string()));
    }
    Ok(())
}
