//! CSV table I/O
//!
//! All processed tables are UTF-8 CSV. Reads tolerate a leading byte-order
//! mark; writes emit one so spreadsheet tools pick the right encoding.
//!
//! Two styles are supported:
//! - [`CsvTable`]: header + string cells, for ingestion boundaries where
//!   columns are probed once and adapted into typed records
//! - [`read_records`]: serde-typed rows

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Read a whole file, dropping a leading UTF-8 BOM
fn read_without_bom(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
    if bytes.starts_with(UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    Ok(bytes)
}

fn create_with_bom(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(UTF8_BOM)?;
    Ok(writer)
}

/// In-memory table of string cells with a header row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvTable {
    /// Name used in error messages (usually the file name)
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    index: HashMap<String, usize>,
}

impl CsvTable {
    pub fn new(name: impl Into<String>, headers: Vec<String>) -> Self {
        // A repeated header resolves to its first occurrence
        let mut index = HashMap::new();
        for (i, h) in headers.iter().enumerate() {
            index.entry(h.clone()).or_insert(i);
        }
        Self {
            name: name.into(),
            headers,
            rows: Vec::new(),
            index,
        }
    }

    /// Read a CSV file
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = read_without_bom(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes.as_slice());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut table = Self::new(name, headers);

        for record in reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(table.headers.len(), String::new());
            table.rows.push(row);
        }

        tracing::debug!(
            table = %table.name,
            rows = table.rows.len(),
            columns = table.headers.len(),
            "Read CSV table"
        );
        Ok(table)
    }

    /// Write the table, BOM-prefixed
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_writer(create_with_bom(path)?);
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    /// Column index, or `Error::MissingColumn`
    pub fn require_column(&self, column: &str) -> Result<usize> {
        self.column_index(column).ok_or_else(|| Error::MissingColumn {
            table: self.name.clone(),
            column: column.to_string(),
        })
    }

    /// Cell value, `None` when the column is absent or the cell is blank
    pub fn get<'a>(&'a self, row: &'a [String], column: &str) -> Option<&'a str> {
        self.column_index(column)
            .and_then(|i| row.get(i))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty() && !is_null_marker(v))
    }

    /// Append a row; it is padded or truncated to the header width
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }
}

/// Textual null markers produced by upstream exports
pub fn is_null_marker(value: &str) -> bool {
    matches!(value, "nan" | "NaN" | "NA" | "<NA>" | "None" | "null")
}

/// Drop a float-export artifact: `"900123.0"` -> `"900123"`
///
/// Only an all-digit integer part followed by zeros is rewritten.
pub fn normalize_numeric_text(value: &str) -> &str {
    let value = value.trim();
    match value.split_once('.') {
        Some((int_part, frac))
            if !int_part.is_empty()
                && int_part.bytes().all(|b| b.is_ascii_digit())
                && !frac.is_empty()
                && frac.bytes().all(|b| b == b'0') =>
        {
            int_part
        }
        _ => value,
    }
}

/// Read serde-typed rows from a CSV file
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = read_without_bom(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes.as_slice());
    let mut records = Vec::new();
    for record in reader.deserialize() {
        records.push(record?);
    }
    Ok(records)
}
