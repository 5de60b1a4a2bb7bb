//! Per-analyte group comparison and multiple-testing correction

use crate::ml::stats::{log_welch_t_test, RankSumTest};
use crate::structs::{
    AnalyteFailure, HypothesisResults, LipidError, LongTable, PValueRecord, Result,
    SignificanceCounts,
};
use log::{info, warn};

/// Significance level for all three error-rate policies
pub const DEFAULT_ALPHA: f64 = 0.05;

/// The two group labels of a table, sorted
///
/// # Errors
/// Returns error unless the table contains exactly two groups
pub fn two_groups(table: &LongTable) -> Result<(String, String)> {
    let groups = table.groups();
    match groups.as_slice() {
        [a, b] => Ok((a.clone(), b.clone())),
        _ => Err(LipidError::Config(format!(
            "Group comparison needs exactly two groups, found {}: {}",
            groups.len(),
            groups.join(", ")
        ))),
    }
}

/// Rank-sum p-value on concentration and Welch p-value on log concentration
/// for one analyte
///
/// # Errors
/// Returns `Stats` naming the analyte when either test is undefined
pub fn test_analyte(
    table: &LongTable,
    analyte: &str,
    groups: &(String, String),
    rank_test: &mut RankSumTest,
) -> Result<(f64, f64)> {
    let x = table.values(analyte, &groups.0);
    let y = table.values(analyte, &groups.1);

    let rank = rank_test
        .test(&x, &y)
        .map_err(|e| e.for_analyte(analyte))?;
    let log = log_welch_t_test(&x, &y).map_err(|e| e.for_analyte(analyte))?;

    Ok((rank.p_value, log.p_value))
}

/// Benjamini-Hochberg adjusted p-values, returned in input order.
///
/// Sorted ascending, rank `i` of `m` gets `p * m / i`; a running minimum from
/// the largest rank down keeps the result monotone, capped at 1.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn correct_bh(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; m];
    let mut running = 1.0f64;
    for (pos, &idx) in order.iter().enumerate().rev() {
        let rank = (pos + 1) as f64;
        running = running.min(p_values[idx] * m as f64 / rank);
        adjusted[idx] = running;
    }
    adjusted
}

/// Count log-test discoveries: uncorrected, Bonferroni and FDR
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn significance_counts(records: &[PValueRecord], alpha: f64) -> SignificanceCounts {
    let m = records.len();
    let bonferroni_threshold = if m == 0 { alpha } else { alpha / m as f64 };
    SignificanceCounts {
        m,
        alpha,
        bonferroni_threshold,
        uncorrected: records.iter().filter(|r| r.p_log < alpha).count(),
        bonferroni: records
            .iter()
            .filter(|r| r.p_log < bonferroni_threshold)
            .count(),
        fdr: records.iter().filter(|r| r.p_adjusted < alpha).count(),
    }
}

/// Test every analyte, correct the log-test p-values and count discoveries.
///
/// An analyte whose tests are undefined is logged and reported in `failures`;
/// it never contributes a row or a p-value to the correction.
///
/// # Errors
/// Returns error unless there are two groups and at least one testable analyte
pub fn test_all(table: &LongTable, alpha: f64) -> Result<HypothesisResults> {
    let groups = two_groups(table)?;
    let mut rank_test = RankSumTest::default();

    let mut tested = Vec::new();
    let mut failures = Vec::new();
    for analyte in table.analytes() {
        match test_analyte(table, &analyte, &groups, &mut rank_test) {
            Ok((p_rank, p_log)) => tested.push((analyte, p_rank, p_log)),
            Err(e) => {
                warn!("{e}");
                failures.push(AnalyteFailure {
                    analyte,
                    reason: e.to_string(),
                });
            }
        }
    }

    if tested.is_empty() {
        return Err(LipidError::EmptyData(format!(
            "No analyte could be tested ({} failures)",
            failures.len()
        )));
    }

    let p_log: Vec<f64> = tested.iter().map(|(_, _, p)| *p).collect();
    let adjusted = correct_bh(&p_log);

    let mut records: Vec<PValueRecord> = tested
        .into_iter()
        .zip(adjusted)
        .map(|((analyte, p_rank, p_log), p_adjusted)| PValueRecord {
            analyte,
            p_rank,
            p_log,
            p_adjusted,
        })
        .collect();
    records.sort_by(|a, b| a.p_log.total_cmp(&b.p_log));

    let counts = significance_counts(&records, alpha);
    info!(
        "{} analytes tested ({} failed): {} p < {alpha}, {} Bonferroni, {} FDR",
        counts.m,
        failures.len(),
        counts.uncorrected,
        counts.bonferroni,
        counts.fdr
    );

    Ok(HypothesisResults {
        groups,
        records,
        failures,
        counts,
    })
}
