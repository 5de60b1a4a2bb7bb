//! Ingestion: schema validation, group recoding, detection-limit clamping,
//! wide-to-long reshape and the one-shot export of the long table.

use crate::csv_reader::{delimiter_for, CsvData};
use crate::structs::{
    LipidError, LongRecord, LongTable, PersistOutcome, Result, SampleRecord, SampleTable,
};
use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Substitute for missing and zero measurements (nmol/mg)
pub const DEFAULT_DETECTION_LIMIT: f64 = 0.001;

/// Fixed header names of the long file
const LONG_SAMPLE: &str = "sample";
const LONG_GROUP: &str = "group";
const LONG_ANALYTE: &str = "analyte";
const LONG_CONCENTRATION: &str = "concentration";

/// Explicit schema of the input spreadsheet
#[derive(Debug, Clone)]
pub struct IngestSchema {
    pub sample_column: String,
    pub group_column: String,
    /// Numeric covariates carried into the long table
    pub covariate_columns: Vec<String>,
    /// Single-analyte columns contain this character; class sums do not
    pub analyte_delimiter: char,
    /// Raw group code to display label
    pub group_labels: BTreeMap<String, String>,
    pub detection_limit: f64,
}

impl Default for IngestSchema {
    fn default() -> Self {
        Self {
            sample_column: "Sample".into(),
            group_column: "Group".into(),
            covariate_columns: vec!["Age".into(), "BMI".into()],
            analyte_delimiter: ':',
            group_labels: BTreeMap::from([
                ("0".to_string(), "Control".to_string()),
                ("1".to_string(), "Treatment".to_string()),
            ]),
            detection_limit: DEFAULT_DETECTION_LIMIT,
        }
    }
}

/// Role of an input column under a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Sample,
    Group,
    Covariate,
    /// Single-analyte measurement
    Analyte,
    /// Class-sum or other column without the analyte delimiter
    Aggregate,
}

impl IngestSchema {
    /// Check the schema itself before touching any data
    ///
    /// # Errors
    /// Returns `Config` for a non-positive detection limit, a lookup that is not
    /// two distinct labels, or overlapping column names
    pub fn validate(&self) -> Result<()> {
        if !(self.detection_limit.is_finite() && self.detection_limit > 0.0) {
            return Err(LipidError::Config(format!(
                "Detection limit must be positive, got {}",
                self.detection_limit
            )));
        }

        let labels: HashSet<&String> = self.group_labels.values().collect();
        if self.group_labels.len() != 2 || labels.len() != 2 {
            return Err(LipidError::Config(format!(
                "Group lookup must map exactly two codes to two labels, got {:?}",
                self.group_labels
            )));
        }

        let mut names = HashSet::new();
        for name in [&self.sample_column, &self.group_column]
            .into_iter()
            .chain(&self.covariate_columns)
        {
            if !names.insert(name) {
                return Err(LipidError::Config(format!(
                    "Column '{name}' is assigned more than one role"
                )));
            }
        }
        Ok(())
    }

    /// Classify a header under this schema
    #[must_use]
    pub fn classify(&self, header: &str) -> ColumnRole {
        if header == self.sample_column {
            ColumnRole::Sample
        } else if header == self.group_column {
            ColumnRole::Group
        } else if self.covariate_columns.iter().any(|c| c == header) {
            ColumnRole::Covariate
        } else if header.contains(self.analyte_delimiter) {
            ColumnRole::Analyte
        } else {
            ColumnRole::Aggregate
        }
    }

    /// Map a raw group code to its display label
    ///
    /// # Errors
    /// Returns `UnknownGroup` for any code outside the lookup
    pub fn recode_group(&self, sample: &str, code: &str) -> Result<String> {
        self.group_labels
            .get(code)
            .cloned()
            .ok_or_else(|| LipidError::UnknownGroup {
                sample: sample.to_string(),
                code: code.to_string(),
            })
    }

    /// Parse a numeric cell, replacing missing and zero values with the
    /// detection limit
    ///
    /// # Errors
    /// Returns `InvalidValue` for text, infinities and negative numbers
    pub fn clamp_value(&self, sample: &str, column: &str, raw: &str) -> Result<f64> {
        let invalid = |reason: &str| LipidError::InvalidValue {
            sample: sample.to_string(),
            column: column.to_string(),
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        if is_missing(raw) {
            return Ok(self.detection_limit);
        }
        let value: f64 = raw.trim().parse().map_err(|_| invalid("not a number"))?;
        if !value.is_finite() {
            return Err(invalid("not finite"));
        }
        if value < 0.0 {
            return Err(invalid("negative concentration"));
        }
        if value == 0.0 {
            return Ok(self.detection_limit);
        }
        Ok(value)
    }
}

fn is_missing(raw: &str) -> bool {
    let v = raw.trim();
    v.is_empty()
        || v.eq_ignore_ascii_case("na")
        || v.eq_ignore_ascii_case("n/a")
        || v.eq_ignore_ascii_case("nan")
}

/// Read and validate the wide spreadsheet export
///
/// # Errors
/// Returns error if the file cannot be parsed or violates the schema
pub fn read_samples(path: &Path, schema: &IngestSchema, force_tsv: bool) -> Result<SampleTable> {
    let csv = CsvData::from_file(path, delimiter_for(path, force_tsv))?;
    info!(
        "Loaded {} rows x {} columns from {}",
        csv.row_count(),
        csv.col_count(),
        path.display()
    );
    samples_from_csv(&csv, schema)
}

/// Build the wide sample table from parsed CSV data
///
/// # Errors
/// Returns error if required columns are missing, no analyte column exists, or
/// any cell fails recoding or clamping
pub fn samples_from_csv(csv: &CsvData, schema: &IngestSchema) -> Result<SampleTable> {
    schema.validate()?;

    let sample_col = csv.require_column(&schema.sample_column)?;
    let group_col = csv.require_column(&schema.group_column)?;
    let covariate_cols = schema
        .covariate_columns
        .iter()
        .map(|c| csv.require_column(c))
        .collect::<Result<Vec<_>>>()?;

    let mut analyte_cols = Vec::new();
    let mut excluded_columns = Vec::new();
    let mut seen = HashSet::new();
    for (idx, header) in csv.headers.iter().enumerate() {
        if !seen.insert(header.as_str()) {
            return Err(LipidError::Config(format!("Duplicate column '{header}'")));
        }
        match schema.classify(header) {
            ColumnRole::Analyte => analyte_cols.push(idx),
            ColumnRole::Aggregate => excluded_columns.push(header.clone()),
            ColumnRole::Sample | ColumnRole::Group | ColumnRole::Covariate => {}
        }
    }

    if analyte_cols.is_empty() {
        return Err(LipidError::EmptyData(format!(
            "No analyte columns containing '{}'",
            schema.analyte_delimiter
        )));
    }
    if csv.row_count() == 0 {
        return Err(LipidError::EmptyData("No samples in input".into()));
    }
    if !excluded_columns.is_empty() {
        info!(
            "Excluded {} aggregate columns: {}",
            excluded_columns.len(),
            excluded_columns.join(", ")
        );
    }

    let mut samples = Vec::with_capacity(csv.row_count());
    let mut sample_ids = HashSet::new();
    for row in 0..csv.row_count() {
        let sample = csv.cell(row, sample_col).to_string();
        if sample.is_empty() {
            return Err(LipidError::InvalidValue {
                sample: format!("row {}", row + 1),
                column: schema.sample_column.clone(),
                value: String::new(),
                reason: "empty sample identifier".into(),
            });
        }
        if !sample_ids.insert(sample.clone()) {
            return Err(LipidError::InvalidValue {
                sample: sample.clone(),
                column: schema.sample_column.clone(),
                value: sample,
                reason: "duplicate sample identifier".into(),
            });
        }

        let group = schema.recode_group(&sample, csv.cell(row, group_col))?;

        let covariates = covariate_cols
            .iter()
            .map(|&c| schema.clamp_value(&sample, &csv.headers[c], csv.cell(row, c)))
            .collect::<Result<Vec<_>>>()?;

        let concentrations = analyte_cols
            .iter()
            .map(|&c| schema.clamp_value(&sample, &csv.headers[c], csv.cell(row, c)))
            .collect::<Result<Vec<_>>>()?;

        samples.push(SampleRecord {
            sample,
            group,
            covariates,
            concentrations,
        });
    }

    Ok(SampleTable {
        covariate_names: schema.covariate_columns.clone(),
        analyte_names: analyte_cols.iter().map(|&c| csv.headers[c].clone()).collect(),
        excluded_columns,
        samples,
    })
}

/// Reshape wide to long: sample order, then analyte column order
#[must_use]
pub fn melt(table: &SampleTable) -> LongTable {
    let records = table
        .samples
        .iter()
        .flat_map(|s| {
            table
                .analyte_names
                .iter()
                .zip(&s.concentrations)
                .map(move |(analyte, &concentration)| LongRecord {
                    sample: s.sample.clone(),
                    group: s.group.clone(),
                    covariates: s.covariates.clone(),
                    analyte: analyte.clone(),
                    concentration,
                })
        })
        .collect();

    LongTable {
        covariate_names: table.covariate_names.clone(),
        records,
    }
}

/// Serialize a long table in the on-disk layout
fn encode_long_table(table: &LongTable, delimiter: u8) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    let mut header = vec![LONG_SAMPLE.to_string(), LONG_GROUP.to_string()];
    header.extend(table.covariate_names.iter().cloned());
    header.push(LONG_ANALYTE.to_string());
    header.push(LONG_CONCENTRATION.to_string());
    writer.write_record(&header)?;

    for r in &table.records {
        let mut fields = vec![r.sample.clone(), r.group.clone()];
        fields.extend(r.covariates.iter().map(ToString::to_string));
        fields.push(r.analyte.clone());
        fields.push(r.concentration.to_string());
        writer.write_record(&fields)?;
    }

    writer.into_inner().map_err(|e| LipidError::Io(e.into_error()))
}

/// Write the long table once. An existing file is never overwritten; the skip
/// is logged and flagged as stale when its content differs from this table.
///
/// The content is written to a temporary file in the target directory and
/// only linked into place once complete, so a failed write leaves no file.
///
/// # Errors
/// Returns error if the file cannot be read or written
pub fn persist_long_table(path: &Path, table: &LongTable) -> Result<PersistOutcome> {
    let bytes = encode_long_table(table, delimiter_for(path, false))?;

    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(&bytes)?;
    staged.as_file().sync_all()?;

    match staged.persist_noclobber(path) {
        Ok(_) => {
            info!("Wrote {} long-form rows to {}", table.len(), path.display());
            Ok(PersistOutcome::Written)
        }
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            let stale = fs::read(path)? != bytes;
            if stale {
                warn!(
                    "{} exists with different content; not overwriting",
                    path.display()
                );
            } else {
                info!("{} already up to date; skipping write", path.display());
            }
            Ok(PersistOutcome::Skipped { stale })
        }
        Err(e) => Err(e.error.into()),
    }
}

impl LongTable {
    /// Read a persisted long table back, re-checking the positivity invariant
    ///
    /// # Errors
    /// Returns error if the layout is not `sample,group,...,analyte,concentration`
    /// or any concentration is not a positive number
    pub fn from_file(path: &Path) -> Result<Self> {
        let csv = CsvData::from_file(path, delimiter_for(path, false))?;
        let h = &csv.headers;

        if h.len() < 4 {
            return Err(LipidError::Config(format!(
                "Long file {} needs at least 4 columns, found {}",
                path.display(),
                h.len()
            )));
        }
        for (idx, expected) in [
            (0, LONG_SAMPLE),
            (1, LONG_GROUP),
            (h.len() - 2, LONG_ANALYTE),
            (h.len() - 1, LONG_CONCENTRATION),
        ] {
            if h[idx] != expected {
                return Err(LipidError::MissingColumn(expected.to_string()));
            }
        }
        let covariate_names = h[2..h.len() - 2].to_vec();

        let mut records = Vec::with_capacity(csv.row_count());
        for row in &csv.rows {
            let parse = |col: usize| -> Result<f64> {
                row[col]
                    .parse::<f64>()
                    .map_err(|_| LipidError::InvalidValue {
                        sample: row[0].clone(),
                        column: h[col].clone(),
                        value: row[col].clone(),
                        reason: "not a number".into(),
                    })
            };

            let concentration = parse(h.len() - 1)?;
            if !(concentration.is_finite() && concentration > 0.0) {
                return Err(LipidError::InvalidValue {
                    sample: row[0].clone(),
                    column: row[h.len() - 2].clone(),
                    value: row[h.len() - 1].clone(),
                    reason: "concentration must be positive".into(),
                });
            }

            records.push(LongRecord {
                sample: row[0].clone(),
                group: row[1].clone(),
                covariates: (2..h.len() - 2).map(parse).collect::<Result<Vec<_>>>()?,
                analyte: row[h.len() - 2].clone(),
                concentration,
            });
        }

        if records.is_empty() {
            return Err(LipidError::EmptyData(format!(
                "No rows in long file {}",
                path.display()
            )));
        }

        Ok(Self {
            covariate_names,
            records,
        })
    }
}

/// Full ingestion stage: read, validate, melt, persist
///
/// # Errors
/// Returns error if reading, validation or persisting fails
pub fn ingest(
    input: &Path,
    long_path: &Path,
    schema: &IngestSchema,
    force_tsv: bool,
) -> Result<(LongTable, PersistOutcome)> {
    let samples = read_samples(input, schema, force_tsv)?;
    info!(
        "{} samples, {} analytes, {} aggregate columns excluded",
        samples.n_samples(),
        samples.n_analytes(),
        samples.excluded_columns.len()
    );
    let long = melt(&samples);
    let outcome = persist_long_table(long_path, &long)?;
    Ok((long, outcome))
}
