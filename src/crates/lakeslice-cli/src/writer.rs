//! Local file writer for JSON and JSON-lines output

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use lakeslice_core::{FormatConfig, OutputFormat, RowStream, TableWriter, WriteReceipt, WriterError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Writes each table to `<output_dir>/<table>.<ext>`.
///
/// Rows are streamed into a temporary sibling file that replaces the target
/// only once every row was written, so a failed or repeated extraction never
/// leaves a partial or appended file behind. The temporary file is also
/// removed when the write future is dropped part-way, as on an attempt
/// timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileWriter;

impl FileWriter {
    pub fn new() -> Self {
        Self
    }

    async fn write_rows(
        path: &Path,
        mut rows: RowStream,
        format: OutputFormat,
    ) -> Result<u64, WriterError> {
        let file = fs::File::create(path).await?;
        let mut out = BufWriter::new(file);
        let mut count = 0u64;

        if format == OutputFormat::Json {
            out.write_all(b"[").await?;
        }
        while let Some(row) = rows.next().await {
            let row = row?;
            let encoded =
                serde_json::to_vec(&row).map_err(|e| WriterError::Write(e.to_string()))?;
            match format {
                OutputFormat::Json => {
                    if count > 0 {
                        out.write_all(b",").await?;
                    }
                    out.write_all(b"\n  ").await?;
                    out.write_all(&encoded).await?;
                }
                _ => {
                    out.write_all(&encoded).await?;
                    out.write_all(b"\n").await?;
                }
            }
            count += 1;
        }
        if format == OutputFormat::Json {
            out.write_all(b"\n]\n").await?;
        }

        out.flush().await?;
        out.into_inner().sync_all().await?;
        Ok(count)
    }
}

#[async_trait]
impl TableWriter for FileWriter {
    async fn write(
        &self,
        table: &str,
        rows: RowStream,
        format: &FormatConfig,
    ) -> Result<WriteReceipt, WriterError> {
        if !matches!(format.format, OutputFormat::Json | OutputFormat::Jsonl) {
            return Err(WriterError::Write(format!(
                "output format '{}' is not supported by the file writer (use json or jsonl)",
                format.format
            )));
        }

        fs::create_dir_all(&format.output_dir).await?;
        let target = format.location_for(table);
        let partial = PartialFile::for_target(&target);

        let rows_written = Self::write_rows(partial.path(), rows, format.format).await?;
        fs::rename(partial.path(), &target).await?;
        partial.keep();

        debug!(table, path = %target.display(), rows = rows_written, "Wrote table");
        Ok(WriteReceipt {
            location: target.display().to_string(),
            rows_written,
        })
    }
}

/// `<target>.partial`, deleted on drop unless [`PartialFile::keep`] was called.
struct PartialFile {
    path: PathBuf,
    kept: bool,
}

impl PartialFile {
    fn for_target(target: &Path) -> Self {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        Self {
            path: target.with_file_name(name),
            kept: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The file was renamed into place; nothing to clean up.
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial output")
            }
        }
    }
}

/// Delete the files a rolled-back run wrote. Locations that are already gone
/// are not an error. Returns how many files were removed.
pub async fn remove_outputs(locations: &[String]) -> anyhow::Result<usize> {
    let mut removed = 0;
    for location in locations {
        match fs::remove_file(location).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(location = %location, "Output already removed");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", location));
            }
        }
    }
    Ok(removed)
}
