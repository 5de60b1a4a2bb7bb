//! Output file writers for the analyze phase

use crate::ml::summary::render_markdown;
use crate::structs::{
    AnalysisResult, AnalyteFailure, ClusterResult, GroupSummary, HypothesisResults, PcaResult,
    Result, SignificanceCounts, StandardizedMatrix,
};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Write `summary.csv` - one row per (analyte, group)
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_summary_csv(output_dir: &Path, summaries: &[GroupSummary]) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_dir.join("summary.csv"))?;
    for s in summaries {
        writer.serialize(s)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct PValueRow<'a> {
    analyte: &'a str,
    p_rank: Option<f64>,
    p_log: Option<f64>,
    p_adjusted: Option<f64>,
    failure: &'a str,
}

/// Write `pvalues.csv` - tested analytes sorted by log-test p-value, then
/// analytes whose tests failed with the reason and empty p-values
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_pvalues(output_dir: &Path, results: &HypothesisResults) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_dir.join("pvalues.csv"))?;
    for r in &results.records {
        writer.serialize(PValueRow {
            analyte: &r.analyte,
            p_rank: Some(r.p_rank),
            p_log: Some(r.p_log),
            p_adjusted: Some(r.p_adjusted),
            failure: "",
        })?;
    }
    for f in &results.failures {
        writer.serialize(PValueRow {
            analyte: &f.analyte,
            p_rank: None,
            p_log: None,
            p_adjusted: None,
            failure: &f.reason,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ClusterRow<'a> {
    sample: &'a str,
    group: &'a str,
    cluster: usize,
    distance_to_centroid: f64,
    pc1: Option<f64>,
    pc2: Option<f64>,
}

/// Write `clusters.csv` - cluster assignment, distance to the assigned
/// centroid and PCA coordinates for each sample
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_clusters(
    output_dir: &Path,
    matrix: &StandardizedMatrix,
    clusters: &ClusterResult,
    pca: Option<&PcaResult>,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_dir.join("clusters.csv"))?;
    let pc = |i: usize, c: usize| pca.and_then(|p| p.projection.get((i, c)).copied());

    for (i, &cluster) in clusters.labels.iter().enumerate() {
        let distance = euclidean_distance(
            &matrix.data.row(i).to_vec(),
            &clusters.centroids.row(cluster).to_vec(),
        );
        writer.serialize(ClusterRow {
            sample: &matrix.samples[i],
            group: &matrix.groups[i],
            cluster,
            distance_to_centroid: distance,
            pc1: pc(i, 0),
            pc2: pc(i, 1),
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `stats.json` - machine-readable results
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_stats_json(output_dir: &Path, result: &AnalysisResult) -> Result<()> {
    let path = output_dir.join("stats.json");
    let json = serde_json::to_string_pretty(&StatsOutput::from(result))?;
    fs::write(path, json)?;
    Ok(())
}

/// Write `report.md`
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_report(output_dir: &Path, content: &str) -> Result<()> {
    fs::write(output_dir.join("report.md"), content)?;
    Ok(())
}

/// Build the Markdown report: design, summary table, test counts, clustering
#[must_use]
pub fn build_report(source: &str, result: &AnalysisResult, figures: &[&str]) -> String {
    use std::fmt::Write as _;

    let h = &result.hypotheses;
    let c = &h.counts;
    let z = &result.standardized;
    let mut s = String::from("# Lipidomics group comparison\n\n");

    let _ = writeln!(s, "Source: `{source}`\n");
    let _ = writeln!(
        s,
        "{} samples, {} analytes, groups {} vs {}.\n",
        z.n_samples(),
        h.records.len() + h.failures.len(),
        h.groups.0,
        h.groups.1
    );

    s.push_str("## Descriptive statistics\n\n");
    s.push_str(&render_markdown(&result.summaries));

    s.push_str("\n## Group comparison\n\n");
    s.push_str(
        "Each analyte was compared with a Wilcoxon rank-sum test on concentration and a \
         Welch t-test on log concentration. Log-test p-values were adjusted with \
         Benjamini-Hochberg.\n\n",
    );
    let _ = writeln!(s, "| Policy | Threshold | Significant |");
    let _ = writeln!(s, "|---|---|---:|");
    let _ = writeln!(s, "| Uncorrected | p < {} | {} |", c.alpha, c.uncorrected);
    let _ = writeln!(
        s,
        "| Bonferroni (FWER) | p < {:.3e} | {} |",
        c.bonferroni_threshold, c.bonferroni
    );
    let _ = writeln!(s, "| Benjamini-Hochberg (FDR) | q < {} | {} |", c.alpha, c.fdr);
    let _ = writeln!(s, "\n{} analytes tested.", c.m);

    if !h.records.is_empty() {
        s.push_str("\nSmallest log-test p-values:\n\n");
        let _ = writeln!(s, "| Analyte | p (rank) | p (log t) | q |");
        let _ = writeln!(s, "|---|---:|---:|---:|");
        for r in h.records.iter().take(10) {
            let _ = writeln!(
                s,
                "| {} | {:.3e} | {:.3e} | {:.3e} |",
                r.analyte, r.p_rank, r.p_log, r.p_adjusted
            );
        }
    }

    if !h.failures.is_empty() {
        let _ = writeln!(s, "\n{} analytes could not be tested:\n", h.failures.len());
        for f in &h.failures {
            let _ = writeln!(s, "- {}: {}", f.analyte, f.reason);
        }
    }

    s.push_str("\n## Clustering\n\n");
    let _ = writeln!(
        s,
        "Analytes were z-scored across {} samples ({} columns kept).",
        z.n_samples(),
        z.n_features()
    );
    if !z.dropped.is_empty() {
        let _ = writeln!(s, "Constant columns dropped: {}.", z.dropped.join(", "));
    }
    s.push_str("\n```\n");
    s.push_str(&result.clusters.summary());
    s.push_str("```\n");

    let _ = writeln!(s, "\n| Cluster | {} | {} |", h.groups.0, h.groups.1);
    let _ = writeln!(s, "|---|---:|---:|");
    for (cluster, (a, b)) in cross_tab(z, &result.clusters, &h.groups).iter().enumerate() {
        let _ = writeln!(s, "| {cluster} | {a} | {b} |");
    }

    if let Some(pca) = &result.pca {
        let ratios: Vec<String> = pca
            .explained_variance_ratio
            .iter()
            .enumerate()
            .map(|(i, r)| format!("PC{} {:.1}%", i + 1, r * 100.0))
            .collect();
        let _ = writeln!(s, "\nExplained variance: {}.", ratios.join(", "));
    }

    if !figures.is_empty() {
        s.push_str("\n## Figures\n\n");
        for f in figures {
            let _ = writeln!(s, "![{f}]({f})");
        }
    }

    s
}

/// Samples of each group per cluster
fn cross_tab(
    matrix: &StandardizedMatrix,
    clusters: &ClusterResult,
    groups: &(String, String),
) -> Vec<(usize, usize)> {
    let mut counts = vec![(0, 0); clusters.k];
    for (g, &c) in matrix.groups.iter().zip(&clusters.labels) {
        if *g == groups.0 {
            counts[c].0 += 1;
        } else if *g == groups.1 {
            counts[c].1 += 1;
        }
    }
    counts
}

/// Calculate Euclidean distance between two points
fn euclidean_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

// JSON output structures

#[derive(Serialize)]
struct StatsOutput<'a> {
    n_samples: usize,
    groups: [&'a str; 2],
    summaries: &'a [GroupSummary],
    hypothesis_tests: TestsSummary<'a>,
    clustering: ClusteringSummary<'a>,
    pca: Option<PcaSummary<'a>>,
}

#[derive(Serialize)]
struct TestsSummary<'a> {
    counts: SignificanceCounts,
    failures: &'a [AnalyteFailure],
}

#[derive(Serialize)]
struct ClusteringSummary<'a> {
    k: usize,
    features: Vec<ScalingEntry<'a>>,
    dropped_columns: &'a [String],
    clusters: Vec<ClusterEntry>,
    total_within_ss: f64,
    total_ss: f64,
    between_ss: f64,
    between_ratio: f64,
    iterations: usize,
    converged: bool,
    empty_reseeds: usize,
}

/// Column mean and standard deviation used for the z-score
#[derive(Serialize)]
struct ScalingEntry<'a> {
    analyte: &'a str,
    mean: f64,
    std_dev: f64,
}

#[derive(Serialize)]
struct ClusterEntry {
    id: usize,
    size: usize,
    percentage: f64,
    within_ss: f64,
}

#[derive(Serialize)]
struct PcaSummary<'a> {
    n_components: usize,
    explained_variance_ratio: &'a [f64],
}

impl<'a> From<&'a AnalysisResult> for StatsOutput<'a> {
    #[allow(clippy::cast_precision_loss)]
    fn from(result: &'a AnalysisResult) -> Self {
        let c = &result.clusters;
        let z = &result.standardized;
        let n = c.labels.len().max(1) as f64;
        let groups = &result.hypotheses.groups;

        Self {
            n_samples: z.n_samples(),
            groups: [&groups.0, &groups.1],
            summaries: &result.summaries,
            hypothesis_tests: TestsSummary {
                counts: result.hypotheses.counts,
                failures: &result.hypotheses.failures,
            },
            clustering: ClusteringSummary {
                k: c.k,
                features: z
                    .analytes
                    .iter()
                    .zip(z.means.iter().zip(&z.std_devs))
                    .map(|(analyte, (&mean, &std_dev))| ScalingEntry {
                        analyte,
                        mean,
                        std_dev,
                    })
                    .collect(),
                dropped_columns: &z.dropped,
                clusters: c
                    .sizes
                    .iter()
                    .zip(&c.within_ss)
                    .enumerate()
                    .map(|(id, (&size, &within_ss))| ClusterEntry {
                        id,
                        size,
                        percentage: size as f64 / n * 100.0,
                        within_ss,
                    })
                    .collect(),
                total_within_ss: c.total_within_ss,
                total_ss: c.total_ss,
                between_ss: c.between_ss,
                between_ratio: c.between_ratio(),
                iterations: c.iterations,
                converged: c.converged,
                empty_reseeds: c.empty_reseeds,
            },
            pca: result.pca.as_ref().map(|p| PcaSummary {
                n_components: p.n_components,
                explained_variance_ratio: &p.explained_variance_ratio,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::PValueRecord;
    use ndarray::array;
    use tempfile::TempDir;

    fn result() -> AnalysisResult {
        let records = vec![
            PValueRecord {
                analyte: "PC 34:1".into(),
                p_rank: 0.1,
                p_log: 0.002,
                p_adjusted: 0.004,
            },
            PValueRecord {
                analyte: "TG 52:2".into(),
                p_rank: 0.7,
                p_log: 0.4,
                p_adjusted: 0.4,
            },
        ];
        AnalysisResult {
            summaries: vec![GroupSummary {
                analyte: "PC 34:1".into(),
                group: "Control".into(),
                n: 1,
                mean: 1.5,
                std_dev: None,
            }],
            hypotheses: HypothesisResults {
                groups: ("Control".into(), "Treatment".into()),
                records,
                failures: vec![AnalyteFailure {
                    analyte: "LPC 18:0".into(),
                    reason: "all values tied".into(),
                }],
                counts: SignificanceCounts {
                    m: 2,
                    alpha: 0.05,
                    bonferroni_threshold: 0.025,
                    uncorrected: 1,
                    bonferroni: 1,
                    fdr: 1,
                },
            },
            standardized: StandardizedMatrix {
                samples: vec!["S1".into(), "S2".into(), "S3".into()],
                groups: vec!["Control".into(), "Control".into(), "Treatment".into()],
                analytes: vec!["PC 34:1".into(), "TG 52:2".into()],
                data: array![[-1.0, 0.0], [0.0, -1.0], [1.0, 1.0]],
                means: vec![2.0, 5.0],
                std_devs: vec![1.0, 1.0],
                dropped: vec!["SM 16:0".into()],
            },
            clusters: ClusterResult {
                labels: vec![0, 0, 1],
                k: 2,
                centroids: array![[-0.5, -0.5], [1.0, 1.0]],
                sizes: vec![2, 1],
                within_ss: vec![1.0, 0.0],
                total_within_ss: 1.0,
                total_ss: 4.0,
                between_ss: 3.0,
                iterations: 2,
                converged: true,
                empty_reseeds: 0,
            },
            pca: Some(PcaResult {
                n_components: 2,
                explained_variance_ratio: vec![0.75, 0.25],
                projection: array![[1.0, 0.5], [0.0, -0.5], [-1.0, 0.0]],
            }),
        }
    }

    #[test]
    fn test_write_summary_csv() {
        let dir = TempDir::new().expect("create temp dir");
        write_summary_csv(dir.path(), &result().summaries).expect("write summary");

        let content = fs::read_to_string(dir.path().join("summary.csv")).expect("read");
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("analyte,group,n,mean,std_dev"));
        assert_eq!(lines.next(), Some("PC 34:1,Control,1,1.5,"));
    }

    #[test]
    fn test_write_pvalues() {
        let dir = TempDir::new().expect("create temp dir");
        write_pvalues(dir.path(), &result().hypotheses).expect("write pvalues");

        let content = fs::read_to_string(dir.path().join("pvalues.csv")).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "analyte,p_rank,p_log,p_adjusted,failure");
        assert!(lines[1].starts_with("PC 34:1,"));
        assert_eq!(lines[3], "LPC 18:0,,,,all values tied");
    }

    #[test]
    fn test_write_clusters() {
        let r = result();
        let dir = TempDir::new().expect("create temp dir");
        write_clusters(dir.path(), &r.standardized, &r.clusters, r.pca.as_ref())
            .expect("write clusters");

        let content = fs::read_to_string(dir.path().join("clusters.csv")).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines[0],
            "sample,group,cluster,distance_to_centroid,pc1,pc2"
        );
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "S3,Treatment,1,0.0,-1.0,0.0");

        write_clusters(dir.path(), &r.standardized, &r.clusters, None).expect("rewrite");
        let content = fs::read_to_string(dir.path().join("clusters.csv")).expect("read");
        assert!(content.lines().nth(1).is_some_and(|l| l.ends_with(",,")));
    }

    #[test]
    fn test_write_stats_json() {
        let dir = TempDir::new().expect("create temp dir");
        write_stats_json(dir.path(), &result()).expect("write stats");

        let content = fs::read_to_string(dir.path().join("stats.json")).expect("read");
        let json: serde_json::Value = serde_json::from_str(&content).expect("parse");
        assert_eq!(json["n_samples"], 3);
        assert_eq!(json["hypothesis_tests"]["counts"]["fdr"], 1);
        assert_eq!(json["clustering"]["clusters"][0]["size"], 2);
        assert_eq!(json["clustering"]["dropped_columns"][0], "SM 16:0");
        assert_eq!(json["clustering"]["features"][1]["analyte"], "TG 52:2");
        assert_eq!(json["clustering"]["features"][1]["mean"], 5.0);
        assert_eq!(json["pca"]["n_components"], 2);
    }

    #[test]
    fn test_build_report() {
        let report = build_report("lipids.csv", &result(), &["boxplots.svg"]);

        assert!(report.contains("Source: `lipids.csv`"));
        assert!(report.contains("| PC 34:1 | Control | 1 | 1.5000 | n/a |"));
        assert!(report.contains("| Benjamini-Hochberg (FDR) | q < 0.05 | 1 |"));
        assert!(report.contains("- LPC 18:0: all values tied"));
        assert!(report.contains("Constant columns dropped: SM 16:0."));
        assert!(report.contains("| 0 | 2 | 0 |"));
        assert!(report.contains("![boxplots.svg](boxplots.svg)"));
    }

    #[test]
    fn test_euclidean_distance() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        let dist = euclidean_distance(&a, &b);
        assert!((dist - 5.0).abs() < 0.001);
    }
}
