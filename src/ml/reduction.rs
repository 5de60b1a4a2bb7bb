//! PCA projection using linfa-reduction

use crate::structs::{LipidError, PcaResult, Result, StandardizedMatrix};
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_reduction::Pca;
use ndarray::Array2;

/// Project standardized samples onto their leading principal components.
///
/// The component count is capped by the number of features and by
/// `n_samples - 1`.
///
/// # Errors
/// Returns error if PCA computation fails (e.g., too few samples)
pub fn run_pca(matrix: &StandardizedMatrix, n_components: usize) -> Result<PcaResult> {
    let n_samples = matrix.n_samples();
    let n_features = matrix.n_features();

    if n_features < 2 {
        return Err(LipidError::Ml("PCA requires at least 2 features".into()));
    }
    if n_samples < 3 {
        return Err(LipidError::Ml("PCA requires at least 3 samples".into()));
    }
    let n_components = n_components.max(1).min(n_features).min(n_samples - 1);

    let dataset = DatasetBase::from(matrix.data.clone());
    let pca = Pca::params(n_components)
        .fit(&dataset)
        .map_err(|e| LipidError::Ml(format!("PCA failed: {e}")))?;
    let projection: Array2<f64> = pca.predict(&matrix.data);

    // Ratios are relative to the full variance of the data, not just the
    // retained components
    let total = centered_sum_of_squares(&matrix.data);
    let explained_variance_ratio = if total > 0.0 {
        pca.singular_values()
            .iter()
            .map(|s| (s * s) / total)
            .collect()
    } else {
        vec![0.0; n_components]
    };

    Ok(PcaResult {
        n_components,
        explained_variance_ratio,
        projection,
    })
}

fn centered_sum_of_squares(data: &Array2<f64>) -> f64 {
    let Some(center) = data.mean_axis(ndarray::Axis(0)) else {
        return 0.0;
    };
    (data - &center).mapv(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::LongRecord;
    use crate::structs::{LongTable, WideMatrix};

    fn standardized(columns: &[(&str, Vec<f64>)]) -> StandardizedMatrix {
        let mut records = Vec::new();
        for (name, values) in columns {
            for (i, &v) in values.iter().enumerate() {
                records.push(LongRecord {
                    sample: format!("S{i}"),
                    group: if i % 2 == 0 { "Control" } else { "Treatment" }.into(),
                    covariates: vec![],
                    analyte: (*name).into(),
                    concentration: v,
                });
            }
        }
        let table = LongTable {
            covariate_names: vec![],
            records,
        };
        WideMatrix::from_long(&table)
            .expect("pivot")
            .standardize()
            .expect("standardize")
    }

    #[allow(clippy::cast_precision_loss)]
    fn column(n: usize, f: impl Fn(f64) -> f64) -> Vec<f64> {
        (1..=n).map(|i| f(i as f64)).collect()
    }

    #[test]
    fn test_run_pca() {
        let matrix = standardized(&[
            ("PC 34:1", column(8, |x| x)),
            ("PE 38:4", column(8, |x| 2.0 * x + (x * 1.7).sin() * 0.3)),
            ("TG 52:2", column(8, |x| (x * 0.9).cos() + 2.0)),
        ]);
        let result = run_pca(&matrix, 2).expect("pca");

        assert_eq!(result.n_components, 2);
        assert_eq!(result.projection.dim(), (8, 2));
        assert_eq!(result.explained_variance_ratio.len(), 2);
        assert!(result.explained_variance_ratio[0] >= result.explained_variance_ratio[1]);
        let retained: f64 = result.explained_variance_ratio.iter().sum();
        assert!(retained > 0.0 && retained <= 1.0 + 1e-9);
    }

    #[test]
    fn test_dominant_component() {
        // two nearly collinear analytes: PC1 carries almost everything
        let matrix = standardized(&[
            ("PC 34:1", column(10, |x| x)),
            ("PC 36:2", column(10, |x| 3.0 * x + (x * 2.3).sin() * 0.05)),
        ]);
        let result = run_pca(&matrix, 2).expect("pca");
        assert!(result.explained_variance_ratio[0] > 0.99);
    }

    #[test]
    fn test_components_capped_by_samples() {
        let matrix = standardized(&[
            ("PC 34:1", column(3, |x| x)),
            ("PE 38:4", column(3, |x| x * x)),
            ("TG 52:2", column(3, |x| 1.0 / x)),
        ]);
        let result = run_pca(&matrix, 5).expect("pca");
        assert_eq!(result.n_components, 2);
        assert_eq!(result.projection.ncols(), 2);
    }

    #[test]
    fn test_pca_too_few_features() {
        let matrix = standardized(&[("PC 34:1", column(5, |x| x))]);
        assert!(run_pca(&matrix, 2).is_err());
    }
}
