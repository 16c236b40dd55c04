//! CSV ledger storage.
//!
//! Each ledger is a CSV file with a header row. Ledgers are read whole,
//! merged in memory and written back; there is no partial update.
//!
//! - `read` returns `None` for a ledger that does not exist yet
//! - `merge_records` enforces the key uniqueness and sort order of a record type
//! - `merge_files` concatenates ledgers with a union of their columns

use std::collections::HashMap;
use std::cmp::Reverse;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::types::{LedgerRecord, SortOrder};

/// Errors that can occur while reading or writing a ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl LedgerError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv { path: path.to_path_buf(), source }
    }
}

/// How `write` treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Replace the file contents, always with a header row.
    #[default]
    Overwrite,
    /// Append rows; the header is written only into a new or empty file.
    Append,
}

/// Reads a whole ledger.
///
/// Returns `Ok(None)` if the file does not exist. Blank lines are skipped.
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>, LedgerError> {
    if !path.exists() {
        return Ok(None);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| LedgerError::csv(path, e))?;

    let rows = reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| LedgerError::csv(path, e))?;

    debug!(path = %path.display(), rows = rows.len(), "Read ledger");
    Ok(Some(rows))
}

/// Writes rows to a ledger, creating parent directories as needed.
pub fn write<T: Serialize>(path: &Path, rows: &[T], mode: WriteMode) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
    }

    let (file, needs_headers) = match mode {
        WriteMode::Overwrite => (File::create(path).map_err(|e| LedgerError::io(path, e))?, true),
        WriteMode::Append => {
            let is_empty = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LedgerError::io(path, e))?;
            (file, is_empty)
        }
    };

    let mut writer = csv::WriterBuilder::new().has_headers(needs_headers).from_writer(file);
    for row in rows {
        writer.serialize(row).map_err(|e| LedgerError::csv(path, e))?;
    }
    writer.flush().map_err(|e| LedgerError::io(path, e))?;

    debug!(path = %path.display(), rows = rows.len(), ?mode, "Wrote ledger");
    Ok(())
}

/// Concatenates `existing` and `fetched`, drops duplicate keys keeping the
/// last occurrence, and stably sorts by the record's time in its ledger order.
pub fn merge_records<T: LedgerRecord>(existing: Vec<T>, fetched: Vec<T>) -> Vec<T> {
    let mut combined = existing;
    combined.extend(fetched);

    let mut last_seen: HashMap<T::Key, usize> = HashMap::with_capacity(combined.len());
    for (idx, row) in combined.iter().enumerate() {
        last_seen.insert(row.key(), idx);
    }

    let mut merged: Vec<T> = combined
        .into_iter()
        .enumerate()
        .filter(|(idx, row)| last_seen.get(&row.key()) == Some(idx))
        .map(|(_, row)| row)
        .collect();

    match T::ORDER {
        SortOrder::Ascending => merged.sort_by_key(|row| row.sort_time()),
        SortOrder::Descending => merged.sort_by_key(|row| Reverse(row.sort_time())),
    }
    merged
}

/// Concatenates several ledgers into `target`.
///
/// The target header is the union of the source headers in first-appearance
/// order; columns a source lacks are left empty. No de-duplication is done.
/// Missing sources are skipped. Returns the number of data rows written.
pub fn merge_files(sources: &[PathBuf], target: &Path) -> Result<usize, LedgerError> {
    let mut header: Vec<String> = Vec::new();
    let mut tables: Vec<(Vec<String>, Vec<csv::StringRecord>)> = Vec::new();

    for source in sources.iter().filter(|p| p.exists()) {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(source)
            .map_err(|e| LedgerError::csv(source, e))?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| LedgerError::csv(source, e))?
            .iter()
            .map(str::to_string)
            .collect();
        for column in &columns {
            if !column.is_empty() && !header.contains(column) {
                header.push(column.clone());
            }
        }

        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::csv(source, e))?;
        tables.push((columns, records));
    }

    if tables.is_empty() {
        debug!(target = %target.display(), "No source ledgers to merge");
        return Ok(0);
    }

    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
    }

    let mut writer = csv::Writer::from_path(target).map_err(|e| LedgerError::csv(target, e))?;
    writer.write_record(&header).map_err(|e| LedgerError::csv(target, e))?;

    let mut written = 0;
    for (columns, records) in &tables {
        let positions: Vec<Option<usize>> = header
            .iter()
            .map(|name| columns.iter().position(|c| c == name))
            .collect();
        for record in records {
            let row = positions
                .iter()
                .map(|pos| pos.and_then(|i| record.get(i)).unwrap_or(""));
            writer.write_record(row).map_err(|e| LedgerError::csv(target, e))?;
            written += 1;
        }
    }
    writer.flush().map_err(|e| LedgerError::io(target, e))?;

    debug!(target = %target.display(), rows = written, sources = tables.len(), "Merged ledgers");
    Ok(written)
}
