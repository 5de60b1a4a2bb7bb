//! Analysis pipeline that orchestrates the summary, test and clustering stages

use crate::ml::hypothesis::{self, DEFAULT_ALPHA};
use crate::ml::{clustering, plot, reduction, summary};
use crate::structs::{AnalysisResult, KMeansConfig, LongTable, Result, WideMatrix};
use log::{info, warn};
use std::path::Path;

pub const BOXPLOT_FILE: &str = "boxplots.svg";
pub const PCA_FILE: &str = "pca_clusters.svg";

/// Configuration for the analysis pipeline
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub alpha: f64,
    /// Substring an analyte name must contain to get a box-plot panel
    pub lipid_filter: String,
    pub grid_columns: usize,
    pub kmeans: KMeansConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            lipid_filter: "PC".into(),
            grid_columns: 4,
            kmeans: KMeansConfig::default(),
        }
    }
}

/// Run the full analysis pipeline
///
/// # Errors
/// Returns error if summary, testing or clustering fails.
/// PCA failure is non-fatal (logged and set to `None`).
pub fn run_pipeline(table: &LongTable, config: &AnalysisConfig) -> Result<AnalysisResult> {
    info!("Summarizing {} long rows", table.len());
    let summaries = summary::summarize(table)?;

    info!("Testing {} analytes", table.analytes().len());
    let hypotheses = hypothesis::test_all(table, config.alpha)?;

    let wide = WideMatrix::from_long(table)?;
    let standardized = wide.standardize()?;
    info!(
        "Clustering {} samples on {} standardized analytes (k={}, {} restarts, seed {})",
        standardized.n_samples(),
        standardized.n_features(),
        config.kmeans.k,
        config.kmeans.n_restarts,
        config.kmeans.seed
    );
    let clusters = clustering::kmeans(&standardized.data, &config.kmeans)?;
    info!(
        "Cluster sizes {:?}, between/total SS {:.1}%",
        clusters.sizes,
        clusters.between_ratio() * 100.0
    );

    let pca = match reduction::run_pca(&standardized, 2) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("PCA failed: {e}");
            None
        }
    };

    Ok(AnalysisResult {
        summaries,
        hypotheses,
        standardized,
        clusters,
        pca,
    })
}

/// Draw the box-plot grid and the PCA scatter into `output_dir`.
/// Failures are logged and skipped; returns the files written.
pub fn draw_figures(
    table: &LongTable,
    result: &AnalysisResult,
    config: &AnalysisConfig,
    output_dir: &Path,
) -> Vec<&'static str> {
    let mut written = Vec::new();

    match plot::plan_boxplots(table, &config.lipid_filter, config.grid_columns)
        .and_then(|plan| plot::draw_boxplots(&plan, &output_dir.join(BOXPLOT_FILE)))
    {
        Ok(panels) => {
            info!("Drew {panels} box-plot panels");
            written.push(BOXPLOT_FILE);
        }
        Err(e) => warn!("Box plots skipped: {e}"),
    }

    match &result.pca {
        Some(pca) => {
            match plot::draw_pca_scatter(pca, &result.clusters.labels, &output_dir.join(PCA_FILE))
            {
                Ok(()) => written.push(PCA_FILE),
                Err(e) => warn!("PCA scatter skipped: {e}"),
            }
        }
        None => warn!("PCA scatter skipped: no projection"),
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::LongRecord;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    /// Eight samples; treatment raises the PC species and leaves TG alone
    #[allow(clippy::cast_precision_loss)]
    fn table() -> LongTable {
        let mut records = Vec::new();
        for i in 0..8 {
            let treated = i >= 4;
            let group = if treated { "Treatment" } else { "Control" };
            let wobble = (i % 4) as f64 * 0.05;
            let species = [
                ("PC 32:0", if treated { 4.0 } else { 1.0 } + wobble),
                ("PC 34:1", if treated { 8.0 } else { 2.0 } + wobble * 2.0),
                ("TG 52:2", 3.0 + ((i * 5) % 7) as f64 * 0.1),
                ("SM 16:0", 0.001),
            ];
            for (analyte, concentration) in species {
                records.push(LongRecord {
                    sample: format!("S{i}"),
                    group: group.into(),
                    covariates: vec![],
                    analyte: analyte.into(),
                    concentration,
                });
            }
        }
        LongTable {
            covariate_names: vec![],
            records,
        }
    }

    #[test]
    fn test_run_pipeline() {
        let result = run_pipeline(&table(), &AnalysisConfig::default()).expect("pipeline");

        assert_eq!(result.summaries.len(), 8);
        assert_eq!(result.hypotheses.records.len(), 3);
        assert_eq!(result.hypotheses.failures.len(), 1);
        assert_eq!(result.hypotheses.failures[0].analyte, "SM 16:0");
        assert!(result.hypotheses.get("PC 34:1").is_some_and(|r| r.p_log < 0.05));

        assert_eq!(result.standardized.dropped, vec!["SM 16:0"]);
        assert_eq!(result.clusters.k, 2);
        assert_eq!(result.clusters.sizes.iter().sum::<usize>(), 8);
        assert_relative_eq!(
            result.clusters.total_ss,
            result.clusters.total_within_ss + result.clusters.between_ss,
            epsilon = 1e-9
        );

        // the treatment shift dominates: clusters follow the groups
        let labels = &result.clusters.labels;
        assert!(labels[..4].iter().all(|&l| l == labels[0]));
        assert!(labels[4..].iter().all(|&l| l != labels[0]));

        let pca = result.pca.expect("pca");
        assert_eq!(pca.projection.dim(), (8, 2));
    }

    #[test]
    fn test_pipeline_is_reproducible() {
        let config = AnalysisConfig::default();
        let a = run_pipeline(&table(), &config).expect("first");
        let b = run_pipeline(&table(), &config).expect("second");
        assert_eq!(a.clusters.labels, b.clusters.labels);
        assert_eq!(a.hypotheses.records, b.hypotheses.records);
    }

    #[test]
    fn test_draw_figures_skips_unmatched_filter() {
        let dir = TempDir::new().expect("create temp dir");
        let table = table();
        let result = run_pipeline(&table, &AnalysisConfig::default()).expect("pipeline");

        let config = AnalysisConfig {
            lipid_filter: "Cer".into(),
            ..AnalysisConfig::default()
        };
        let written = draw_figures(&table, &result, &config, dir.path());

        assert_eq!(written, vec![PCA_FILE]);
        assert!(!dir.path().join(BOXPLOT_FILE).exists());
        assert!(dir.path().join(PCA_FILE).exists());
    }
}
