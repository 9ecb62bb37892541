use ndarray::{Array2, ArrayView2, Axis};
use noisy_float::prelude::n64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Correlation coefficient used for similarity and redundancy computations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    /// Pearson product-moment correlation
    #[default]
    Pearson,
    /// Pearson correlation of average ranks
    Spearman,
}

impl FromStr for CorrelationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pearson" => Ok(CorrelationMethod::Pearson),
            "spearman" => Ok(CorrelationMethod::Spearman),
            _ => Err(format!("correlation method not recognized: {s}")),
        }
    }
}

impl fmt::Display for CorrelationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CorrelationMethod::Pearson => "pearson",
            CorrelationMethod::Spearman => "spearman",
        })
    }
}

/// 1-based ranks, ties receive the average of the ranks they span. `NaN` stays `NaN`.
pub fn rank_average(xs: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..xs.len()).filter(|&i| !xs[i].is_nan()).collect();
    order.sort_by_key(|&i| n64(xs[i]));

    let mut ranks = vec![f64::NAN; xs.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && xs[order[end]] == xs[order[start]] {
            end += 1;
        }
        // positions start..end (0-based) hold rank (start + 1 + end) / 2
        let rank = (start + 1 + end) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }
    ranks
}

fn pearson_complete(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if x.len() < 2 {
        return f64::NAN;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (&a, &b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 || syy == 0.0 {
        return f64::NAN;
    }
    (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0)
}

/// Correlation of two vectors over the positions where both are present.
/// `NaN` when fewer than two complete pairs remain or either side is constant.
pub fn correlation(x: &[f64], y: &[f64], method: CorrelationMethod) -> f64 {
    assert_eq!(x.len(), y.len());
    let (x, y): (Vec<f64>, Vec<f64>) = x
        .iter()
        .zip(y)
        .filter(|(a, b)| !a.is_nan() && !b.is_nan())
        .map(|(&a, &b)| (a, b))
        .unzip();
    match method {
        CorrelationMethod::Pearson => pearson_complete(&x, &y),
        CorrelationMethod::Spearman => pearson_complete(&rank_average(&x), &rank_average(&y)),
    }
}

/// Center and scale a complete vector to unit norm so that correlations become dot products.
/// `None` for a constant vector.
fn unit_centered(mut v: Vec<f64>) -> Option<Vec<f64>> {
    let n = v.len() as f64;
    let m = v.iter().sum::<f64>() / n;
    v.iter_mut().for_each(|x| *x -= m);
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(v)
}

/// Correlation between every pair of columns of `data`. The result is symmetric;
/// entries involving a constant column are `NaN`, including its diagonal.
pub fn correlation_matrix(data: ArrayView2<f64>, method: CorrelationMethod) -> Array2<f64> {
    let p = data.ncols();
    let columns: Vec<Vec<f64>> = data.axis_iter(Axis(1)).map(|c| c.to_vec()).collect();
    let complete = !data.iter().any(|x| x.is_nan());

    let upper: Vec<Vec<f64>> = if complete && data.nrows() >= 2 {
        let unit: Vec<Option<Vec<f64>>> = columns
            .into_par_iter()
            .map(|c| match method {
                CorrelationMethod::Pearson => unit_centered(c),
                CorrelationMethod::Spearman => unit_centered(rank_average(&c)),
            })
            .collect();
        (0..p)
            .into_par_iter()
            .map(|i| {
                (i..p)
                    .map(|j| match (&unit[i], &unit[j]) {
                        (Some(a), Some(b)) => a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>().clamp(-1.0, 1.0),
                        _ => f64::NAN,
                    })
                    .collect()
            })
            .collect()
    } else {
        (0..p)
            .into_par_iter()
            .map(|i| (i..p).map(|j| correlation(&columns[i], &columns[j], method)).collect())
            .collect()
    };

    let mut res = Array2::<f64>::from_elem((p, p), f64::NAN);
    for (i, row) in upper.into_iter().enumerate() {
        for (k, v) in row.into_iter().enumerate() {
            let j = i + k;
            res[[i, j]] = v;
            res[[j, i]] = v;
        }
    }
    res
}

/// Correlation between every pair of rows of `data`.
pub fn row_similarity(data: ArrayView2<f64>, method: CorrelationMethod) -> Array2<f64> {
    correlation_matrix(data.t(), method)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray::{array, Array2};
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    #[test]
    fn test_rank_average() {
        assert_eq!(rank_average(&[10.0, 30.0, 20.0, 20.0]), vec![1.0, 4.0, 2.5, 2.5]);
        let r = rank_average(&[f64::NAN, 2.0, 1.0]);
        assert!(r[0].is_nan());
        assert_eq!(&r[1..], &[2.0, 1.0]);
    }

    #[test]
    fn test_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 4.0, 6.0, 8.0, 10.0];
        assert_approx_eq!(correlation(&x, &y, CorrelationMethod::Pearson), 1.0, 1e-12);

        // monotone but not linear
        let z = [1.0, 8.0, 27.0, 64.0, 125.0];
        assert!(correlation(&x, &z, CorrelationMethod::Pearson) < 1.0);
        assert_approx_eq!(correlation(&x, &z, CorrelationMethod::Spearman), 1.0, 1e-12);

        let w = [1.0, 3.0, 2.0, 5.0, 4.0];
        assert_approx_eq!(correlation(&x, &w, CorrelationMethod::Pearson), 0.8, 1e-12);

        assert!(correlation(&x, &[1.0; 5], CorrelationMethod::Pearson).is_nan());
    }

    #[test]
    fn test_correlation_skips_missing_pairs() {
        let x = [1.0, 2.0, f64::NAN, 4.0];
        let y = [2.0, 4.0, 100.0, 8.0];
        assert_approx_eq!(correlation(&x, &y, CorrelationMethod::Pearson), 1.0, 1e-12);
    }

    #[test]
    fn test_matrix_paths_agree() {
        let mut rng = Pcg64::seed_from_u64(0);
        let data = Array2::from_shape_fn((30, 6), |_| rng.gen_range(-1.0..1.0));
        for method in [CorrelationMethod::Pearson, CorrelationMethod::Spearman] {
            let fast = correlation_matrix(data.view(), method);
            for i in 0..6 {
                assert_approx_eq!(fast[[i, i]], 1.0, 1e-12);
                for j in 0..6 {
                    let slow = correlation(&data.column(i).to_vec(), &data.column(j).to_vec(), method);
                    assert_approx_eq!(fast[[i, j]], slow, 1e-10);
                    assert_eq!(fast[[i, j]], fast[[j, i]]);
                }
            }
        }
    }

    #[test]
    fn test_row_similarity() {
        let data = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.5], [3.0, 2.0, 1.0]];
        let s = row_similarity(data.view(), CorrelationMethod::Pearson);
        assert_eq!(s.dim(), (3, 3));
        assert!(s[[0, 1]] > 0.99);
        assert_approx_eq!(s[[0, 2]], -1.0, 1e-12);
    }

    #[test]
    fn test_constant_column_is_nan() {
        let data = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let m = correlation_matrix(data.view(), CorrelationMethod::Pearson);
        assert!(m[[0, 1]].is_nan());
        assert!(m[[1, 1]].is_nan());
        assert_approx_eq!(m[[0, 0]], 1.0, 1e-12);
    }
}
