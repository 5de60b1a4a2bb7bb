//! Per-(analyte, group) descriptive statistics

use crate::ml::stats::{mean, sample_std_dev};
use crate::structs::{GroupSummary, LipidError, LongTable, Result};
use std::collections::BTreeMap;

/// Mean and sample standard deviation of concentration for every
/// (analyte, group) cell, sorted by analyte then group
///
/// # Errors
/// Returns error if the table is empty
pub fn summarize(table: &LongTable) -> Result<Vec<GroupSummary>> {
    if table.is_empty() {
        return Err(LipidError::EmptyData(
            "Cannot summarize an empty long table".into(),
        ));
    }

    let mut cells: BTreeMap<(&str, &str), Vec<f64>> = BTreeMap::new();
    for r in &table.records {
        cells
            .entry((r.analyte.as_str(), r.group.as_str()))
            .or_default()
            .push(r.concentration);
    }

    cells
        .into_iter()
        .map(|((analyte, group), values)| {
            let mean = mean(&values).ok_or_else(|| {
                LipidError::EmptyData(format!("No values for {analyte} / {group}"))
            })?;
            Ok(GroupSummary {
                analyte: analyte.to_string(),
                group: group.to_string(),
                n: values.len(),
                mean,
                std_dev: sample_std_dev(&values),
            })
        })
        .collect()
}

/// Render summaries as a Markdown table
#[must_use]
pub fn render_markdown(summaries: &[GroupSummary]) -> String {
    use std::fmt::Write as _;

    let mut s = String::from("| Analyte | Group | n | Mean (nmol/mg) | SD |\n");
    s.push_str("|---|---|---:|---:|---:|\n");
    for g in summaries {
        let sd = g
            .std_dev
            .map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"));
        let _ = writeln!(
            s,
            "| {} | {} | {} | {:.4} | {sd} |",
            g.analyte, g.group, g.n, g.mean
        );
    }
    s
}
