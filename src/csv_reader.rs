use crate::structs::{LipidError, Result};
use csv::ReaderBuilder;
use std::path::Path;

/// Represents a parsed CSV/TSV file with headers and rows
#[derive(Debug, Clone)]
pub struct CsvData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Pick the field delimiter for a file: tab for `.tsv`/`.txt` or when forced
#[must_use]
pub fn delimiter_for(path: &Path, force_tsv: bool) -> u8 {
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_lowercase().as_str(), "tsv" | "txt"));
    if force_tsv || by_extension {
        b'\t'
    } else {
        b','
    }
}

impl CsvData {
    /// Parse a delimited file. Rows with a different field count than the
    /// header are rejected.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is ragged, or has no header
    pub fn from_file(path: &Path, delimiter: u8) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(ToString::to_string)
            .collect();

        if headers.iter().all(String::is_empty) {
            return Err(LipidError::EmptyData(format!(
                "No header row in {}",
                path.display()
            )));
        }

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record.iter().map(ToString::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    /// Get number of rows
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get number of columns
    #[must_use]
    pub fn col_count(&self) -> usize {
        self.headers.len()
    }

    /// Get column index by name
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Get column index by name, failing if the column is absent
    ///
    /// # Errors
    /// Returns `MissingColumn` if no header matches
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| LipidError::MissingColumn(name.to_string()))
    }

    /// Get a single cell, empty string when the row is short
    #[must_use]
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map_or("", String::as_str)
    }
}
