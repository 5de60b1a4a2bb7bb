//! SVG figures: grouped box plots and the PCA cluster scatter

use crate::structs::{LipidError, LongTable, PcaResult, Result};
use plotters::prelude::*;
use std::path::Path;

type DrawResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// One color per group, in sorted group order
const GROUP_COLORS: [RGBColor; 4] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(148, 103, 189),
];

const CLUSTER_COLORS: [RGBColor; 6] = [
    RGBColor(214, 39, 40),
    RGBColor(23, 190, 207),
    RGBColor(188, 189, 34),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
];

const PANEL_SIZE: (u32, u32) = (320, 260);

/// Linear-interpolation quantile of sorted data (R type 7)
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Tukey box for one group
#[derive(Debug, Clone)]
pub struct BoxStats {
    pub n: usize,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    /// Most extreme values within 1.5 IQR of the box
    pub lower_whisker: f64,
    pub upper_whisker: f64,
    pub outliers: Vec<f64>,
}

impl BoxStats {
    fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);

        let q1 = quantile(&values, 0.25);
        let q3 = quantile(&values, 0.75);
        let fence = 1.5 * (q3 - q1);
        let fences = (q1 - fence)..=(q3 + fence);
        let (inside, outliers): (Vec<f64>, Vec<f64>) =
            values.iter().partition(|v| fences.contains(*v));

        Some(Self {
            n: values.len(),
            q1,
            median: quantile(&values, 0.5),
            q3,
            lower_whisker: inside.iter().copied().fold(f64::INFINITY, f64::min),
            upper_whisker: inside.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            outliers,
        })
    }

    fn low(&self) -> f64 {
        self.outliers
            .iter()
            .copied()
            .fold(self.lower_whisker, f64::min)
    }

    fn high(&self) -> f64 {
        self.outliers
            .iter()
            .copied()
            .fold(self.upper_whisker, f64::max)
    }
}

/// Boxes for one analyte, indexed like `BoxplotPlan::groups`; groups without
/// values have no box
#[derive(Debug, Clone)]
pub struct BoxPanel {
    pub analyte: String,
    pub boxes: Vec<Option<BoxStats>>,
}

/// Grid layout of box-plot panels
#[derive(Debug, Clone)]
pub struct BoxplotPlan {
    pub groups: Vec<String>,
    pub panels: Vec<BoxPanel>,
    pub rows: usize,
    pub columns: usize,
}

/// Select the analytes whose name contains `filter` and compute one box per
/// group for each of them. Panels fill a grid `columns` wide.
///
/// # Errors
/// Returns error if `columns` is zero or no analyte matches
pub fn plan_boxplots(table: &LongTable, filter: &str, columns: usize) -> Result<BoxplotPlan> {
    if columns == 0 {
        return Err(LipidError::Config("Grid needs at least one column".into()));
    }

    let selected = table.filter_analytes(filter);
    let analytes = selected.analytes();
    if analytes.is_empty() {
        return Err(LipidError::Plot(format!(
            "No analyte name contains '{filter}'"
        )));
    }

    let groups = table.groups();
    let panels: Vec<BoxPanel> = analytes
        .into_iter()
        .map(|analyte| {
            let boxes = groups
                .iter()
                .map(|g| BoxStats::from_values(selected.values(&analyte, g)))
                .collect();
            BoxPanel { analyte, boxes }
        })
        .collect();

    let rows = panels.len().div_ceil(columns);
    Ok(BoxplotPlan {
        groups,
        columns: columns.min(panels.len()),
        rows,
        panels,
    })
}

/// Render the plan as an SVG grid. Returns the number of panels drawn.
///
/// # Errors
/// Returns error if the file cannot be written
pub fn draw_boxplots(plan: &BoxplotPlan, path: &Path) -> Result<usize> {
    render_boxplots(plan, path).map_err(|e| LipidError::Plot(e.to_string()))?;
    Ok(plan.panels.len())
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn render_boxplots(plan: &BoxplotPlan, path: &Path) -> DrawResult<()> {
    let size = (
        PANEL_SIZE.0 * u32::try_from(plan.columns)?,
        PANEL_SIZE.1 * u32::try_from(plan.rows)?,
    );
    let root = SVGBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;

    let areas = root.split_evenly((plan.rows, plan.columns));
    let n_groups = plan.groups.len();
    let groups = &plan.groups;
    let x_label = |x: &f64| {
        let i = x.round();
        if (x - i).abs() < 1e-6 && i >= 0.0 && (i as usize) < n_groups {
            groups[i as usize].clone()
        } else {
            String::new()
        }
    };

    for (panel, area) in plan.panels.iter().zip(areas.iter()) {
        let present = panel.boxes.iter().flatten();
        let lo = present.clone().map(BoxStats::low).fold(f64::INFINITY, f64::min);
        let hi = present.map(BoxStats::high).fold(f64::NEG_INFINITY, f64::max);
        let pad = ((hi - lo) * 0.08).max(1e-3);

        let mut chart = ChartBuilder::on(area)
            .caption(&panel.analyte, ("sans-serif", 14))
            .margin(8)
            .x_label_area_size(24)
            .y_label_area_size(48)
            .build_cartesian_2d(-0.5..(n_groups as f64 - 0.5), (lo - pad)..(hi + pad))?;

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(n_groups)
            .x_label_formatter(&x_label)
            .y_labels(5)
            .draw()?;

        for (i, b) in panel.boxes.iter().enumerate() {
            let Some(b) = b else { continue };
            let color = GROUP_COLORS[i % GROUP_COLORS.len()];
            let x = i as f64;
            let (left, right) = (x - 0.3, x + 0.3);

            chart.draw_series(std::iter::once(Rectangle::new(
                [(left, b.q3), (right, b.q1)],
                color.mix(0.45).filled(),
            )))?;
            chart.draw_series(std::iter::once(Rectangle::new(
                [(left, b.q3), (right, b.q1)],
                color.stroke_width(1),
            )))?;
            chart.draw_series([
                PathElement::new(vec![(left, b.median), (right, b.median)], BLACK.stroke_width(2)),
                PathElement::new(vec![(x, b.q3), (x, b.upper_whisker)], color.stroke_width(1)),
                PathElement::new(vec![(x, b.q1), (x, b.lower_whisker)], color.stroke_width(1)),
                PathElement::new(
                    vec![(x - 0.12, b.upper_whisker), (x + 0.12, b.upper_whisker)],
                    color.stroke_width(1),
                ),
                PathElement::new(
                    vec![(x - 0.12, b.lower_whisker), (x + 0.12, b.lower_whisker)],
                    color.stroke_width(1),
                ),
            ])?;
            chart.draw_series(
                b.outliers
                    .iter()
                    .map(|&v| Circle::new((x, v), 2, color.filled())),
            )?;
        }
    }

    root.present()?;
    Ok(())
}

/// Scatter the first two principal components, one color per cluster
///
/// # Errors
/// Returns error if the projection has fewer than two components, the label
/// count does not match, or the file cannot be written
pub fn draw_pca_scatter(pca: &PcaResult, labels: &[usize], path: &Path) -> Result<()> {
    if pca.projection.ncols() < 2 {
        return Err(LipidError::Plot(
            "PCA scatter needs two components".into(),
        ));
    }
    if pca.projection.nrows() != labels.len() {
        return Err(LipidError::Plot(format!(
            "{} projected samples but {} cluster labels",
            pca.projection.nrows(),
            labels.len()
        )));
    }
    render_pca(pca, labels, path).map_err(|e| LipidError::Plot(e.to_string()))
}

fn render_pca(pca: &PcaResult, labels: &[usize], path: &Path) -> DrawResult<()> {
    let points: Vec<(f64, f64)> = pca
        .projection
        .rows()
        .into_iter()
        .map(|r| (r[0], r[1]))
        .collect();
    let (x_lo, x_hi) = padded_range(points.iter().map(|p| p.0));
    let (y_lo, y_hi) = padded_range(points.iter().map(|p| p.1));

    let root = SVGBackend::new(path, (720, 560)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("K-means clusters on the first two principal components", ("sans-serif", 18))
        .margin(16)
        .x_label_area_size(40)
        .y_label_area_size(56)
        .build_cartesian_2d(x_lo..x_hi, y_lo..y_hi)?;

    let ratio = |i: usize| pca.explained_variance_ratio.get(i).copied().unwrap_or(0.0) * 100.0;
    chart
        .configure_mesh()
        .x_desc(format!("PC1 ({:.1}%)", ratio(0)))
        .y_desc(format!("PC2 ({:.1}%)", ratio(1)))
        .draw()?;

    let k = labels.iter().max().map_or(0, |m| m + 1);
    for c in 0..k {
        let color = CLUSTER_COLORS[c % CLUSTER_COLORS.len()];
        chart
            .draw_series(
                points
                    .iter()
                    .zip(labels)
                    .filter(|(_, &l)| l == c)
                    .map(|(&p, _)| Circle::new(p, 5, color.filled())),
            )?
            .label(format!("Cluster {c}"))
            .legend(move |(x, y)| Circle::new((x, y), 5, color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

fn padded_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let pad = ((hi - lo) * 0.1).max(0.5);
    (lo - pad, hi + pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::LongRecord;
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::fs;
    use tempfile::TempDir;

    fn table() -> LongTable {
        let mut records = Vec::new();
        let analytes = ["PC 32:0", "PC 34:1", "PC 36:2", "TG 52:2"];
        for i in 0..6 {
            let group = if i < 3 { "Control" } else { "Treatment" };
            for (j, analyte) in (1..).zip(analytes) {
                records.push(LongRecord {
                    sample: format!("S{i}"),
                    group: group.into(),
                    covariates: vec![],
                    analyte: analyte.into(),
                    concentration: f64::from(i + 1) * f64::from(j),
                });
            }
        }
        LongTable {
            covariate_names: vec![],
            records,
        }
    }

    #[test]
    fn test_quantile_type7() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(quantile(&v, 0.25), 1.75);
        assert_relative_eq!(quantile(&v, 0.5), 2.5);
        assert_relative_eq!(quantile(&v, 0.75), 3.25);
        assert_relative_eq!(quantile(&[7.0], 0.5), 7.0);
    }

    #[test]
    fn test_box_stats_outlier() {
        let b = BoxStats::from_values(vec![1.0, 2.0, 3.0, 4.0, 100.0]).expect("box");
        assert_eq!(b.n, 5);
        assert_relative_eq!(b.median, 3.0);
        assert_eq!(b.outliers, vec![100.0]);
        assert_relative_eq!(b.upper_whisker, 4.0);
        assert_relative_eq!(b.lower_whisker, 1.0);
        assert!(BoxStats::from_values(vec![]).is_none());
    }

    #[test]
    fn test_plan_boxplots() {
        let plan = plan_boxplots(&table(), "PC", 2).expect("plan");

        assert_eq!(plan.groups, vec!["Control", "Treatment"]);
        assert_eq!(plan.panels.len(), 3);
        assert_eq!((plan.rows, plan.columns), (2, 2));
        assert_eq!(plan.panels[0].analyte, "PC 32:0");
        assert!(plan.panels.iter().all(|p| p.boxes.len() == plan.groups.len()));
        let control = plan.panels[0].boxes[0].as_ref().expect("control box");
        assert_eq!(control.n, 3);
        assert_relative_eq!(control.median, 2.0);
    }

    #[test]
    fn test_plan_narrow_grid() {
        let plan = plan_boxplots(&table(), "TG", 9).expect("plan");
        assert_eq!(plan.panels.len(), 1);
        assert_eq!((plan.rows, plan.columns), (1, 1));
    }

    #[test]
    fn test_plan_no_match() {
        assert!(plan_boxplots(&table(), "Cer", 4).is_err());
        assert!(plan_boxplots(&table(), "PC", 0).is_err());
    }

    #[test]
    fn test_draw_boxplots_writes_svg() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("boxplots.svg");
        let plan = plan_boxplots(&table(), "PC", 2).expect("plan");

        let drawn = draw_boxplots(&plan, &path).expect("draw");

        assert_eq!(drawn, 3);
        let svg = fs::read_to_string(&path).expect("read");
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_pca_scatter_rejects_mismatch() {
        let dir = TempDir::new().expect("create temp dir");
        let pca = PcaResult {
            n_components: 2,
            explained_variance_ratio: vec![0.7, 0.2],
            projection: array![[0.0, 1.0], [1.0, 0.0]],
        };
        let path = dir.path().join("pca.svg");
        assert!(draw_pca_scatter(&pca, &[0], &path).is_err());
        draw_pca_scatter(&pca, &[0, 1], &path).expect("draw");
        assert!(path.exists());
    }
}
