use crate::ml::stats::{mean, sample_std_dev};
use crate::structs::{LipidError, LongTable, Result, StandardizedMatrix, WideMatrix};
use log::warn;
use ndarray::{Array2, Axis};
use std::collections::HashMap;

impl WideMatrix {
    /// Pivot a long table to one row per sample and one column per analyte
    ///
    /// # Errors
    /// Returns error if any (sample, analyte) pair is missing or duplicated, or a
    /// sample appears under two groups
    pub fn from_long(table: &LongTable) -> Result<Self> {
        if table.is_empty() {
            return Err(LipidError::EmptyData("No rows to pivot".into()));
        }

        let samples = table.samples();
        let analytes = table.analytes();
        let sample_idx: HashMap<&str, usize> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();
        let analyte_idx: HashMap<&str, usize> = analytes
            .iter()
            .enumerate()
            .map(|(i, a)| (a.as_str(), i))
            .collect();

        let mut data = Array2::from_elem((samples.len(), analytes.len()), f64::NAN);
        let mut groups: Vec<Option<String>> = vec![None; samples.len()];

        for r in &table.records {
            let i = sample_idx[r.sample.as_str()];
            let j = analyte_idx[r.analyte.as_str()];

            if !data[[i, j]].is_nan() {
                return Err(LipidError::Ml(format!(
                    "Duplicate measurement for sample '{}', analyte '{}'",
                    r.sample, r.analyte
                )));
            }
            data[[i, j]] = r.concentration;

            match &groups[i] {
                Some(g) if *g != r.group => {
                    return Err(LipidError::Ml(format!(
                        "Sample '{}' appears in groups '{g}' and '{}'",
                        r.sample, r.group
                    )));
                }
                Some(_) => {}
                None => groups[i] = Some(r.group.clone()),
            }
        }

        if let Some(((i, j), _)) = data.indexed_iter().find(|(_, v)| v.is_nan()) {
            return Err(LipidError::Ml(format!(
                "Missing measurement for sample '{}', analyte '{}'",
                samples[i], analytes[j]
            )));
        }

        Ok(Self {
            samples,
            groups: groups.into_iter().map(Option::unwrap_or_default).collect(),
            analytes,
            data,
        })
    }

    /// Z-score every column with its mean and sample standard deviation.
    /// Constant columns are dropped and listed in `dropped`.
    ///
    /// # Errors
    /// Returns error with fewer than 2 samples or when every column is constant
    pub fn standardize(&self) -> Result<StandardizedMatrix> {
        if self.n_samples() < 2 {
            return Err(LipidError::Ml(format!(
                "Standardization needs at least 2 samples, got {}",
                self.n_samples()
            )));
        }

        let mut kept = Vec::new();
        let mut means = Vec::new();
        let mut std_devs = Vec::new();
        let mut dropped = Vec::new();

        for (j, column) in self.data.axis_iter(Axis(1)).enumerate() {
            let values = column.to_vec();
            let (Some(m), Some(sd)) = (mean(&values), sample_std_dev(&values)) else {
                continue;
            };
            if sd > 0.0 && sd.is_finite() {
                kept.push(j);
                means.push(m);
                std_devs.push(sd);
            } else {
                dropped.push(self.analytes[j].clone());
            }
        }

        if !dropped.is_empty() {
            warn!(
                "Dropped {} constant columns before clustering: {}",
                dropped.len(),
                dropped.join(", ")
            );
        }
        if kept.is_empty() {
            return Err(LipidError::Ml("Every analyte column is constant".into()));
        }

        let mut data = self.data.select(Axis(1), &kept);
        for (mut column, (m, sd)) in data
            .axis_iter_mut(Axis(1))
            .zip(means.iter().zip(&std_devs))
        {
            column.mapv_inplace(|v| (v - m) / sd);
        }

        Ok(StandardizedMatrix {
            samples: self.samples.clone(),
            groups: self.groups.clone(),
            analytes: kept.iter().map(|&j| self.analytes[j].clone()).collect(),
            data,
            means,
            std_devs,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::LongRecord;
    use approx::assert_relative_eq;

    fn table(rows: &[(&str, &str, &str, f64)]) -> LongTable {
        LongTable {
            covariate_names: vec![],
            records: rows
                .iter()
                .map(|&(sample, group, analyte, concentration)| LongRecord {
                    sample: sample.into(),
                    group: group.into(),
                    covariates: vec![],
                    analyte: analyte.into(),
                    concentration,
                })
                .collect(),
        }
    }

    fn complete() -> LongTable {
        table(&[
            ("S1", "Control", "PC 34:1", 1.0),
            ("S1", "Control", "PE 38:4", 10.0),
            ("S1", "Control", "SM 16:0", 0.001),
            ("S2", "Treatment", "PC 34:1", 2.0),
            ("S2", "Treatment", "PE 38:4", 20.0),
            ("S2", "Treatment", "SM 16:0", 0.001),
            ("S3", "Control", "PC 34:1", 3.0),
            ("S3", "Control", "PE 38:4", 60.0),
            ("S3", "Control", "SM 16:0", 0.001),
        ])
    }

    #[test]
    fn test_pivot() {
        let wide = WideMatrix::from_long(&complete()).expect("pivot");

        assert_eq!(wide.samples, vec!["S1", "S2", "S3"]);
        assert_eq!(wide.groups, vec!["Control", "Treatment", "Control"]);
        assert_eq!(wide.analytes, vec!["PC 34:1", "PE 38:4", "SM 16:0"]);
        assert_eq!(wide.data.dim(), (3, 3));
        assert_relative_eq!(wide.data[[2, 1]], 60.0);
    }

    #[test]
    fn test_pivot_rejects_missing_pair() {
        let t = table(&[
            ("S1", "Control", "PC 34:1", 1.0),
            ("S1", "Control", "PE 38:4", 10.0),
            ("S2", "Treatment", "PC 34:1", 2.0),
        ]);
        assert!(WideMatrix::from_long(&t).is_err());
    }

    #[test]
    fn test_pivot_rejects_duplicate_pair() {
        let t = table(&[
            ("S1", "Control", "PC 34:1", 1.0),
            ("S1", "Control", "PC 34:1", 1.5),
        ]);
        assert!(WideMatrix::from_long(&t).is_err());
    }

    #[test]
    fn test_standardize() {
        let wide = WideMatrix::from_long(&complete()).expect("pivot");
        let z = wide.standardize().expect("standardize");

        assert_eq!(z.dropped, vec!["SM 16:0"]);
        assert_eq!(z.analytes, vec!["PC 34:1", "PE 38:4"]);
        for column in z.data.axis_iter(Axis(1)) {
            let values = column.to_vec();
            assert_relative_eq!(mean(&values).unwrap(), 0.0, epsilon = 1e-12);
            assert_relative_eq!(sample_std_dev(&values).unwrap(), 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(z.data[[0, 0]], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_standardize_needs_two_samples() {
        let t = table(&[("S1", "Control", "PC 34:1", 1.0)]);
        let wide = WideMatrix::from_long(&t).expect("pivot");
        assert!(wide.standardize().is_err());
    }
}
