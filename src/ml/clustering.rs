//! Seeded K-means (Lloyd iterations with random restarts)

use crate::structs::{ClusterResult, KMeansConfig, LipidError, Result};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;

/// Outcome of one restart
struct Run {
    labels: Vec<usize>,
    centroids: Array2<f64>,
    total_within_ss: f64,
    iterations: usize,
    converged: bool,
    reseeds: usize,
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Indices of the first occurrence of each distinct row
fn distinct_rows(data: &Array2<f64>) -> Vec<usize> {
    let mut seen = HashSet::new();
    data.axis_iter(Axis(0))
        .enumerate()
        // +0.0 folds -0.0 into 0.0
        .filter(|(_, row)| seen.insert(row.iter().map(|v| (v + 0.0).to_bits()).collect::<Vec<_>>()))
        .map(|(i, _)| i)
        .collect()
}

/// Nearest centroid per row; ties go to the lowest cluster index
fn assign_nearest(data: &Array2<f64>, centroids: &Array2<f64>) -> Vec<usize> {
    data.axis_iter(Axis(0))
        .map(|row| {
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
                let d = squared_distance(row, centroid);
                if d < best_dist {
                    best = c;
                    best_dist = d;
                }
            }
            best
        })
        .collect()
}

/// Mean of each cluster's members; `None` for clusters without members
#[allow(clippy::cast_precision_loss)]
fn cluster_means(data: &Array2<f64>, labels: &[usize], k: usize) -> Vec<Option<Array1<f64>>> {
    let mut sums = vec![Array1::<f64>::zeros(data.ncols()); k];
    let mut counts = vec![0usize; k];
    for (row, &c) in data.axis_iter(Axis(0)).zip(labels) {
        sums[c] += &row;
        counts[c] += 1;
    }
    sums.into_iter()
        .zip(counts)
        .map(|(sum, n)| (n > 0).then(|| sum / n as f64))
        .collect()
}

/// Recompute centroids from labels. An empty cluster is moved onto a random
/// data point that coincides with no other centroid. Returns the number of
/// reseeded clusters.
fn update_centroids(
    data: &Array2<f64>,
    labels: &[usize],
    centroids: &mut Array2<f64>,
    rng: &mut ChaCha8Rng,
) -> Result<usize> {
    let k = centroids.nrows();
    let means = cluster_means(data, labels, k);
    let mut empty = Vec::new();
    for (c, mean) in means.into_iter().enumerate() {
        match mean {
            Some(m) => centroids.row_mut(c).assign(&m),
            None => empty.push(c),
        }
    }

    for &c in &empty {
        let candidates: Vec<usize> = (0..data.nrows())
            .filter(|&i| {
                centroids
                    .axis_iter(Axis(0))
                    .enumerate()
                    .all(|(other, centroid)| {
                        other == c || squared_distance(data.row(i), centroid) > 0.0
                    })
            })
            .collect();
        if candidates.is_empty() {
            return Err(LipidError::Ml(format!(
                "No data point available to reseed empty cluster {c}"
            )));
        }
        let pick = candidates[rng.gen_range(0..candidates.len())];
        centroids.row_mut(c).assign(&data.row(pick));
        warn!("Cluster {c} became empty; reseeded at sample row {pick}");
    }
    Ok(empty.len())
}

/// Per-cluster within sum of squares around the given centroids
fn within_ss(data: &Array2<f64>, labels: &[usize], centroids: &Array2<f64>) -> Vec<f64> {
    let mut wss = vec![0.0; centroids.nrows()];
    for (row, &c) in data.axis_iter(Axis(0)).zip(labels) {
        wss[c] += squared_distance(row, centroids.row(c));
    }
    wss
}

/// Sum of squared distances to the grand mean
#[must_use]
pub fn total_ss(data: &Array2<f64>) -> f64 {
    let Some(center) = data.mean_axis(Axis(0)) else {
        return 0.0;
    };
    data.axis_iter(Axis(0))
        .map(|row| squared_distance(row, center.view()))
        .sum()
}

fn lloyd(
    data: &Array2<f64>,
    distinct: &[usize],
    config: &KMeansConfig,
    rng: &mut ChaCha8Rng,
) -> Result<Option<Run>> {
    let k = config.k;
    let picks: Vec<usize> = index::sample(rng, distinct.len(), k)
        .iter()
        .map(|i| distinct[i])
        .collect();
    let mut centroids = data.select(Axis(0), &picks);
    let mut labels = assign_nearest(data, &centroids);

    let mut iterations = 0;
    let mut converged = false;
    let mut reseeds = 0;
    while iterations < config.max_iterations {
        iterations += 1;
        let reseeded = update_centroids(data, &labels, &mut centroids, rng)?;
        reseeds += reseeded;
        let next = assign_nearest(data, &centroids);
        if reseeded == 0 && next == labels {
            converged = true;
            break;
        }
        labels = next;
    }

    // Report centroids that match the final assignment
    let means = cluster_means(data, &labels, k);
    if means.iter().any(Option::is_none) {
        warn!("Restart ended with an empty cluster after {iterations} iterations; discarded");
        return Ok(None);
    }
    for (c, m) in means.into_iter().flatten().enumerate() {
        centroids.row_mut(c).assign(&m);
    }

    let total_within_ss = within_ss(data, &labels, &centroids).iter().sum();
    Ok(Some(Run {
        labels,
        centroids,
        total_within_ss,
        iterations,
        converged,
        reseeds,
    }))
}

/// Partition the rows of `data` into exactly `config.k` clusters.
///
/// Each restart starts from `k` distinct rows drawn uniformly at random and
/// iterates until no assignment changes or `max_iterations` is reached. The
/// restart with the lowest total within-cluster sum of squares wins; ties keep
/// the earlier restart. All randomness comes from `config.seed`.
///
/// # Errors
/// Returns error for a zero parameter or when `data` has fewer distinct rows
/// than `k`
pub fn kmeans(data: &Array2<f64>, config: &KMeansConfig) -> Result<ClusterResult> {
    let k = config.k;
    if k == 0 {
        return Err(LipidError::Ml("k must be at least 1".into()));
    }
    if config.n_restarts == 0 || config.max_iterations == 0 {
        return Err(LipidError::Ml(
            "Restarts and iterations must be at least 1".into(),
        ));
    }

    let distinct = distinct_rows(data);
    if distinct.len() < k {
        return Err(LipidError::Ml(format!(
            "Cannot create {k} clusters from {} distinct rows",
            distinct.len()
        )));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut best: Option<Run> = None;
    let mut empty_reseeds = 0;

    for restart in 0..config.n_restarts {
        let Some(run) = lloyd(data, &distinct, config, &mut rng)? else {
            continue;
        };
        empty_reseeds += run.reseeds;
        debug!(
            "Restart {restart}: within SS {:.4} after {} iterations",
            run.total_within_ss, run.iterations
        );
        if best
            .as_ref()
            .map_or(true, |b| run.total_within_ss < b.total_within_ss)
        {
            best = Some(run);
        }
    }

    let best = best.ok_or_else(|| {
        LipidError::Ml(format!(
            "All {} restarts ended with an empty cluster",
            config.n_restarts
        ))
    })?;
    if !best.converged {
        warn!(
            "K-means did not converge within {} iterations",
            config.max_iterations
        );
    }

    let mut sizes = vec![0usize; k];
    for &c in &best.labels {
        sizes[c] += 1;
    }
    let within = within_ss(data, &best.labels, &best.centroids);
    let total = total_ss(data);

    Ok(ClusterResult {
        labels: best.labels,
        k,
        centroids: best.centroids,
        sizes,
        within_ss: within,
        total_within_ss: best.total_within_ss,
        total_ss: total,
        between_ss: total - best.total_within_ss,
        iterations: best.iterations,
        converged: best.converged,
        empty_reseeds,
    })
}
