//! Descriptive helpers and the two two-sample tests used per analyte

use crate::structs::{TestError, TestOutcome};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::collections::HashMap;

/// Both groups below this size and no ties: exact rank-sum distribution
const EXACT_LIMIT: usize = 50;

/// Arithmetic mean, `None` for an empty slice
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample variance (n - 1 denominator), `None` below two values
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    Some(values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64)
}

/// Sample standard deviation, `None` below two values
#[must_use]
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    sample_variance(values).map(f64::sqrt)
}

/// Midranks (1-based) of `values`, plus the size of every tie group
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rank_with_ties(values: &[f64]) -> (Vec<f64>, Vec<usize>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut ties = Vec::new();
    let mut i = 0;
    while i < order.len() {
        let start = i;
        while i + 1 < order.len() && values[order[i + 1]] == values[order[start]] {
            i += 1;
        }
        let rank = (start + i + 2) as f64 / 2.0;
        for &idx in &order[start..=i] {
            ranks[idx] = rank;
        }
        if i > start {
            ties.push(i - start + 1);
        }
        i += 1;
    }
    (ranks, ties)
}

fn standard_normal() -> Result<Normal, TestError> {
    Normal::new(0.0, 1.0).map_err(|e| TestError::Distribution(e.to_string()))
}

/// Wilcoxon-Mann-Whitney rank-sum test with a cache of exact null
/// distributions, keyed by group sizes
#[derive(Debug, Default)]
pub struct RankSumTest {
    nulls: HashMap<(usize, usize), Vec<f64>>,
}

impl RankSumTest {
    /// Two-sided rank-sum test of `x` against `y`.
    ///
    /// The statistic is `U = W_x - n_x (n_x + 1) / 2`. Small samples without
    /// ties use the exact null distribution; otherwise the normal
    /// approximation with tie-corrected variance and a 0.5 continuity
    /// correction.
    ///
    /// # Errors
    /// Returns error if either group has fewer than 2 values or every value
    /// is tied
    #[allow(clippy::cast_precision_loss)]
    pub fn test(&mut self, x: &[f64], y: &[f64]) -> Result<TestOutcome, TestError> {
        let (nx, ny) = (x.len(), y.len());
        if nx < 2 || ny < 2 {
            return Err(TestError::TooFewObservations(nx.min(ny)));
        }

        let combined: Vec<f64> = x.iter().chain(y).copied().collect();
        let (ranks, ties) = rank_with_ties(&combined);
        let rank_sum_x: f64 = ranks[..nx].iter().sum();
        let (fx, fy) = (nx as f64, ny as f64);
        let u = rank_sum_x - fx * (fx + 1.0) / 2.0;

        if nx < EXACT_LIMIT && ny < EXACT_LIMIT && ties.is_empty() {
            let counts = self
                .nulls
                .entry((nx, ny))
                .or_insert_with(|| rank_sum_null(nx, ny));
            return Ok(TestOutcome {
                statistic: u,
                p_value: exact_p(counts, u),
            });
        }

        let n = fx + fy;
        let tie_term: f64 = ties
            .iter()
            .map(|&t| {
                let t = t as f64;
                t.powi(3) - t
            })
            .sum::<f64>()
            / (n * (n - 1.0));
        let sigma = ((fx * fy / 12.0) * ((n + 1.0) - tie_term)).sqrt();
        if sigma <= 0.0 || !sigma.is_finite() {
            return Err(TestError::AllTied);
        }

        let centered = u - fx * fy / 2.0;
        let correction = if centered > 0.0 {
            0.5
        } else if centered < 0.0 {
            -0.5
        } else {
            0.0
        };
        let z = (centered - correction) / sigma;
        let normal = standard_normal()?;
        let p_value = (2.0 * normal.cdf(-z.abs())).min(1.0);

        Ok(TestOutcome {
            statistic: u,
            p_value,
        })
    }
}

/// Null distribution of U for group sizes (m, n) without ties: entry `u`
/// counts the size-`m` subsets of ranks `1..=m+n` whose U equals `u`.
fn rank_sum_null(m: usize, n: usize) -> Vec<f64> {
    let total = m + n;
    let max_sum = m * (2 * total - m + 1) / 2;
    // ways[k][s]: subsets of size k with rank sum s
    let mut ways = vec![vec![0.0f64; max_sum + 1]; m + 1];
    ways[0][0] = 1.0;
    for rank in 1..=total {
        for k in (1..=m.min(rank)).rev() {
            let lo = rank.max(k * (k + 1) / 2);
            let hi = max_sum.min(k * (2 * rank - k + 1) / 2);
            for s in (lo..=hi).rev() {
                ways[k][s] += ways[k - 1][s - rank];
            }
        }
    }
    ways.swap_remove(m).split_off(m * (m + 1) / 2)
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn exact_p(counts: &[f64], u: f64) -> f64 {
    let all: f64 = counts.iter().sum();
    let mn = counts.len() - 1;
    let u = (u.round() as usize).min(mn);

    let tail = if 2 * u > mn {
        counts[u..].iter().sum::<f64>()
    } else {
        counts[..=u].iter().sum::<f64>()
    };
    (2.0 * tail / all).min(1.0)
}

/// Two-sided Welch t-test (unequal variances).
///
/// # Errors
/// Returns error if either group has fewer than 2 values or is constant
#[allow(clippy::cast_precision_loss)]
pub fn welch_t_test(x: &[f64], y: &[f64]) -> Result<TestOutcome, TestError> {
    let (nx, ny) = (x.len(), y.len());
    let (Some(vx), Some(vy)) = (sample_variance(x), sample_variance(y)) else {
        return Err(TestError::TooFewObservations(nx.min(ny)));
    };
    let (Some(mx), Some(my)) = (mean(x), mean(y)) else {
        return Err(TestError::TooFewObservations(nx.min(ny)));
    };

    // A constant group (e.g. all at the detection limit) has no spread to test
    let constant = |v: &[f64]| v.iter().all(|&a| a == v[0]);
    if constant(x) || constant(y) || vx <= 0.0 || vy <= 0.0 {
        return Err(TestError::ZeroVariance);
    }

    let (sx, sy) = (vx / nx as f64, vy / ny as f64);
    let se2 = sx + sy;

    let t = (mx - my) / se2.sqrt();
    let df = se2.powi(2) / (sx.powi(2) / (nx - 1) as f64 + sy.powi(2) / (ny - 1) as f64);
    let dist = StudentsT::new(0.0, 1.0, df).map_err(|e| TestError::Distribution(e.to_string()))?;
    let p_value = (2.0 * dist.cdf(-t.abs())).min(1.0);

    Ok(TestOutcome {
        statistic: t,
        p_value,
    })
}

/// Welch t-test on natural-log values
///
/// # Errors
/// Returns error on non-positive input or when the t-test itself fails
pub fn log_welch_t_test(x: &[f64], y: &[f64]) -> Result<TestOutcome, TestError> {
    if let Some(&bad) = x.iter().chain(y).find(|&&v| !(v > 0.0 && v.is_finite())) {
        return Err(TestError::NonPositive(bad));
    }
    let lx: Vec<f64> = x.iter().map(|v| v.ln()).collect();
    let ly: Vec<f64> = y.iter().map(|v| v.ln()).collect();
    welch_t_test(&lx, &ly)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mann_whitney_u(x: &[f64], y: &[f64]) -> Result<TestOutcome, TestError> {
        RankSumTest::default().test(x, y)
    }

    #[test]
    fn test_mean_and_sd() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(mean(&values).unwrap(), 5.0);
        assert_relative_eq!(sample_variance(&values).unwrap(), 32.0 / 7.0);
        assert!(sample_std_dev(&[1.0]).is_none());
        assert!(mean(&[]).is_none());
    }

    #[test]
    fn test_rank_with_ties() {
        let (ranks, ties) = rank_with_ties(&[3.0, 1.0, 2.0, 2.0]);
        assert_eq!(ranks, vec![4.0, 1.0, 2.5, 2.5]);
        assert_eq!(ties, vec![2]);
    }

    #[test]
    fn test_mann_whitney_exact() {
        let r = mann_whitney_u(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        assert_relative_eq!(r.statistic, 0.0);
        assert_relative_eq!(r.p_value, 0.1, epsilon = 1e-12);

        let r = mann_whitney_u(&[1.0, 2.0, 3.0, 4.0, 5.0], &[6.0, 7.0, 8.0, 9.0, 10.0]).unwrap();
        assert_relative_eq!(r.p_value, 2.0 / 252.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rank_sum_null_counts() {
        // sizes (2, 2): U in 0..=4 with counts 1, 1, 2, 1, 1
        assert_eq!(rank_sum_null(2, 2), vec![1.0, 1.0, 2.0, 1.0, 1.0]);
        let total: f64 = rank_sum_null(10, 12).iter().sum();
        assert_relative_eq!(total, 646_646.0); // C(22, 10)
    }

    #[test]
    fn test_rank_sum_cache_reused() {
        let mut test = RankSumTest::default();
        let a = test.test(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        let b = test.test(&[6.0, 5.0, 4.0], &[3.0, 2.0, 1.0]).unwrap();
        assert_relative_eq!(a.p_value, b.p_value);
        assert_eq!(test.nulls.len(), 1);
    }

    #[test]
    fn test_mann_whitney_symmetric() {
        let x = [0.3, 1.1, 2.5, 3.2, 4.8];
        let y = [2.0, 3.9, 5.5, 6.1, 7.7, 8.8];
        let a = mann_whitney_u(&x, &y).unwrap();
        let b = mann_whitney_u(&y, &x).unwrap();
        assert_relative_eq!(a.p_value, b.p_value, epsilon = 1e-12);
        assert_relative_eq!(a.statistic + b.statistic, 30.0);
    }

    #[test]
    fn test_mann_whitney_with_ties() {
        let r = mann_whitney_u(&[1.0, 1.0, 2.0, 2.0], &[3.0, 3.0, 4.0, 4.0]).unwrap();
        assert_relative_eq!(r.p_value, 0.026_518_72, epsilon = 1e-6);
    }

    #[test]
    fn test_mann_whitney_degenerate() {
        assert_eq!(
            mann_whitney_u(&[1.0], &[2.0, 3.0]),
            Err(TestError::TooFewObservations(1))
        );
        assert_eq!(
            mann_whitney_u(&[1.0, 1.0], &[1.0, 1.0, 1.0]),
            Err(TestError::AllTied)
        );
    }

    #[test]
    fn test_welch_known_value() {
        let r = welch_t_test(&[1.0, 2.0, 3.0, 4.0, 5.0], &[2.0, 4.0, 6.0, 8.0, 10.0]).unwrap();
        assert_relative_eq!(r.statistic, -1.897_366_596, epsilon = 1e-8);
        assert_relative_eq!(r.p_value, 0.107_531_195, epsilon = 1e-6);
    }

    #[test]
    fn test_welch_degenerate() {
        assert_eq!(
            welch_t_test(&[1.0, 1.0], &[2.0, 2.0]),
            Err(TestError::ZeroVariance)
        );
        assert_eq!(
            welch_t_test(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]),
            Err(TestError::ZeroVariance)
        );
        assert_eq!(
            log_welch_t_test(&[0.001, 0.001, 0.001], &[1.0, 2.0, 3.0]),
            Err(TestError::ZeroVariance)
        );
        assert_eq!(
            welch_t_test(&[1.0, 2.0], &[2.0]),
            Err(TestError::TooFewObservations(1))
        );
    }

    #[test]
    fn test_log_welch_rejects_nonpositive() {
        assert_eq!(
            log_welch_t_test(&[1.0, 0.0], &[2.0, 3.0]),
            Err(TestError::NonPositive(0.0))
        );
        let r = log_welch_t_test(&[1.0, 2.0, 4.0], &[8.0, 16.0, 32.0]).unwrap();
        assert!(r.p_value > 0.0 && r.p_value < 0.05);
    }
}
