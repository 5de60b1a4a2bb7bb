//! Consolidated public types for the lipidstat crate
//!
//! This module contains the error type and the data structures passed between
//! the ingestion, summary, testing and clustering stages.

use ndarray::Array2;
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum LipidError {
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing column '{0}' in input")]
    MissingColumn(String),

    #[error("Invalid value '{value}' for sample '{sample}', column '{column}': {reason}")]
    InvalidValue {
        sample: String,
        column: String,
        value: String,
        reason: String,
    },

    #[error("Unrecognized group code '{code}' for sample '{sample}'")]
    UnknownGroup { sample: String, code: String },

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Statistical test failed for '{analyte}': {reason}")]
    Stats { analyte: String, reason: String },

    #[error("ML error: {0}")]
    Ml(String),

    #[error("Plot error: {0}")]
    Plot(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LipidError>;

/// Why a two-sample test could not produce a p-value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TestError {
    #[error("group has {0} observations, at least 2 required")]
    TooFewObservations(usize),

    #[error("all values are tied")]
    AllTied,

    #[error("zero variance in a group")]
    ZeroVariance,

    #[error("non-positive value {0} cannot be log-transformed")]
    NonPositive(f64),

    #[error("distribution error: {0}")]
    Distribution(String),
}

impl TestError {
    /// Attach the analyte the test was run for
    #[must_use]
    pub fn for_analyte(self, analyte: &str) -> LipidError {
        LipidError::Stats {
            analyte: analyte.to_string(),
            reason: self.to_string(),
        }
    }
}

// ============================================================================
// Sample Types
// ============================================================================

/// One row of the input spreadsheet after validation and clamping
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample: String,
    pub group: String,
    /// Covariate values, same order as `SampleTable::covariate_names`
    pub covariates: Vec<f64>,
    /// Concentrations in nmol/mg, same order as `SampleTable::analyte_names`
    pub concentrations: Vec<f64>,
}

/// Wide-form sample table: one record per sample, one value per analyte
#[derive(Debug, Clone)]
pub struct SampleTable {
    pub covariate_names: Vec<String>,
    pub analyte_names: Vec<String>,
    /// Aggregate (class-sum) columns that were recognized and excluded
    pub excluded_columns: Vec<String>,
    pub samples: Vec<SampleRecord>,
}

impl SampleTable {
    /// Number of samples
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Number of single-analyte columns
    #[must_use]
    pub fn n_analytes(&self) -> usize {
        self.analyte_names.len()
    }

    /// Concentration of an analyte for one sample, looked up by name
    #[cfg(test)]
    #[must_use]
    pub fn concentration(&self, sample_idx: usize, analyte: &str) -> Option<f64> {
        let col = self.analyte_names.iter().position(|a| a == analyte)?;
        self.samples
            .get(sample_idx)
            .and_then(|s| s.concentrations.get(col).copied())
    }
}

// ============================================================================
// Long-form Types
// ============================================================================

/// One (sample, analyte) observation
#[derive(Debug, Clone, PartialEq)]
pub struct LongRecord {
    pub sample: String,
    pub group: String,
    pub covariates: Vec<f64>,
    pub analyte: String,
    pub concentration: f64,
}

/// Long-form table, the canonical artifact of the ingestion stage
#[derive(Debug, Clone, PartialEq)]
pub struct LongTable {
    pub covariate_names: Vec<String>,
    pub records: Vec<LongRecord>,
}

impl LongTable {
    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Analyte names in order of first appearance
    #[must_use]
    pub fn analytes(&self) -> Vec<String> {
        unique_in_order(self.records.iter().map(|r| r.analyte.as_str()))
    }

    /// Sample identifiers in order of first appearance
    #[must_use]
    pub fn samples(&self) -> Vec<String> {
        unique_in_order(self.records.iter().map(|r| r.sample.as_str()))
    }

    /// Group labels, sorted
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.group.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Concentrations of one analyte within one group
    #[must_use]
    pub fn values(&self, analyte: &str, group: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.analyte == analyte && r.group == group)
            .map(|r| r.concentration)
            .collect()
    }

    /// Derived view restricted to analytes whose name contains `pattern`
    #[must_use]
    pub fn filter_analytes(&self, pattern: &str) -> Self {
        Self {
            covariate_names: self.covariate_names.clone(),
            records: self
                .records
                .iter()
                .filter(|r| r.analyte.contains(pattern))
                .cloned()
                .collect(),
        }
    }
}

fn unique_in_order<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item) {
            out.push(item.to_string());
        }
    }
    out
}

/// What happened when the long table was persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The file did not exist and was written
    Written,
    /// The file already existed and was left untouched
    Skipped {
        /// Existing content differs from what this run would have written
        stale: bool,
    },
}

// ============================================================================
// Summary Types
// ============================================================================

/// Descriptive statistics for one (analyte, group) cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub analyte: String,
    pub group: String,
    pub n: usize,
    pub mean: f64,
    /// Sample standard deviation; undefined below two observations
    pub std_dev: Option<f64>,
}

// ============================================================================
// Hypothesis Testing Types
// ============================================================================

/// Statistic and two-sided p-value of a two-sample test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestOutcome {
    #[allow(dead_code)]
    pub statistic: f64,
    pub p_value: f64,
}

/// Raw and adjusted p-values for one analyte
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PValueRecord {
    pub analyte: String,
    /// Rank-sum test on concentration
    pub p_rank: f64,
    /// Welch t-test on log concentration
    pub p_log: f64,
    /// Benjamini-Hochberg adjusted `p_log`
    pub p_adjusted: f64,
}

/// An analyte whose tests could not be computed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyteFailure {
    pub analyte: String,
    pub reason: String,
}

/// Number of significant analytes under each error-rate policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignificanceCounts {
    pub m: usize,
    pub alpha: f64,
    pub bonferroni_threshold: f64,
    pub uncorrected: usize,
    pub bonferroni: usize,
    pub fdr: usize,
}

/// Per-analyte test results, sorted ascending by `p_log`
#[derive(Debug, Clone)]
pub struct HypothesisResults {
    pub groups: (String, String),
    pub records: Vec<PValueRecord>,
    pub failures: Vec<AnalyteFailure>,
    pub counts: SignificanceCounts,
}

impl HypothesisResults {
    /// Look up an analyte's record by name
    #[must_use]
    pub fn get(&self, analyte: &str) -> Option<&PValueRecord> {
        self.records.iter().find(|r| r.analyte == analyte)
    }
}

// ============================================================================
// Clustering Types
// ============================================================================

/// Wide matrix: one row per sample, one column per analyte
#[derive(Debug, Clone)]
pub struct WideMatrix {
    pub samples: Vec<String>,
    pub groups: Vec<String>,
    pub analytes: Vec<String>,
    pub data: Array2<f64>,
}

impl WideMatrix {
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }
}

/// Column-wise z-scored matrix with the parameters used to scale it
#[derive(Debug, Clone)]
pub struct StandardizedMatrix {
    pub samples: Vec<String>,
    pub groups: Vec<String>,
    pub analytes: Vec<String>,
    pub data: Array2<f64>,
    pub means: Vec<f64>,
    pub std_devs: Vec<f64>,
    /// Constant columns that could not be standardized
    pub dropped: Vec<String>,
}

impl StandardizedMatrix {
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }
}

/// Parameters of the seeded k-means run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansConfig {
    pub k: usize,
    pub n_restarts: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: 2,
            n_restarts: 25,
            max_iterations: 10,
            seed: 42,
        }
    }
}

/// Result of K-means clustering
#[derive(Debug, Clone)]
pub struct ClusterResult {
    /// Cluster assignment for each sample
    pub labels: Vec<usize>,
    /// Number of clusters
    pub k: usize,
    /// One centroid per row, in standardized feature space
    pub centroids: Array2<f64>,
    /// Cluster sizes
    pub sizes: Vec<usize>,
    /// Within-cluster sum of squares per cluster
    pub within_ss: Vec<f64>,
    pub total_within_ss: f64,
    pub total_ss: f64,
    pub between_ss: f64,
    /// Iterations used by the winning restart
    pub iterations: usize,
    /// Whether the winning restart stopped because assignments settled
    pub converged: bool,
    /// Empty clusters reseeded across all restarts
    pub empty_reseeds: usize,
}

impl ClusterResult {
    /// Get summary for the report
    #[must_use]
    pub fn summary(&self) -> String {
        use std::fmt::Write as _;

        let mut s = format!("K-means clustering with k={}\n", self.k);
        for (i, (size, wss)) in self.sizes.iter().zip(&self.within_ss).enumerate() {
            let _ = writeln!(s, "  Cluster {i}: {size} samples, within SS {wss:.3}");
        }
        let _ = writeln!(
            s,
            "  Total SS {:.3} = within {:.3} + between {:.3} ({:.1}% between)",
            self.total_ss,
            self.total_within_ss,
            self.between_ss,
            self.between_ratio() * 100.0
        );
        s
    }

    /// Share of the total sum of squares explained by the partition
    #[must_use]
    pub fn between_ratio(&self) -> f64 {
        if self.total_ss > 0.0 {
            self.between_ss / self.total_ss
        } else {
            0.0
        }
    }
}

/// Principal component projection of the standardized matrix
#[derive(Debug, Clone)]
pub struct PcaResult {
    pub n_components: usize,
    pub explained_variance_ratio: Vec<f64>,
    /// Samples x components
    pub projection: Array2<f64>,
}

// ============================================================================
// Pipeline Types
// ============================================================================

/// Everything the analysis pipeline produces
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub summaries: Vec<GroupSummary>,
    pub hypotheses: HypothesisResults,
    pub standardized: StandardizedMatrix,
    pub clusters: ClusterResult,
    pub pca: Option<PcaResult>,
}
