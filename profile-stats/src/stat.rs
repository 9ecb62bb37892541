//! Descriptive statistics over feature vectors.
//!
//! Every method skips `NaN` entries, the way a missing measurement is skipped when a
//! feature column is summarised. A statistic over zero present values is `NaN`.

use noisy_float::prelude::n64;
use noisy_float::types::N64;
use std::mem;

/// Statistics over a vector of `f64`.
pub trait Statistics {
    /// Exactly rounded sum
    fn sum(&self) -> f64;
    /// Mean
    fn mean(&self) -> f64;
    /// Variance with `ddof` delta degrees of freedom (0 = population, 1 = sample)
    fn var(&self, ddof: f64) -> f64;
    /// Standard deviation with `ddof` delta degrees of freedom
    fn std(&self, ddof: f64) -> f64 {
        self.var(ddof).sqrt()
    }
    /// Linearly interpolated quantile, `q` in `[0, 1]`
    fn quantile(&self, q: f64) -> f64;
    /// Median
    fn median(&self) -> f64 {
        self.quantile(0.5)
    }
    /// Interquartile range
    fn iqr(&self) -> f64 {
        self.quantile(0.75) - self.quantile(0.25)
    }
    /// Median absolute deviation from the median (unscaled)
    fn mad(&self) -> f64;
    /// Number of non-`NaN` values
    fn count_present(&self) -> usize;
}

/// The non-`NaN` values of a slice.
pub fn finite_values(xs: &[f64]) -> Vec<f64> {
    xs.iter().copied().filter(|x| !x.is_nan()).collect()
}

/// The non-`NaN` values of a slice, sorted.
pub fn sorted_finite(xs: &[f64]) -> Vec<f64> {
    let mut v: Vec<N64> = xs.iter().filter(|x| !x.is_nan()).map(|&x| n64(x)).collect();
    v.sort_unstable();
    v.into_iter().map(N64::raw).collect()
}

impl Statistics for [f64] {
    fn sum(&self) -> f64 {
        let mut partials: Vec<f64> = vec![];

        for &x in self.iter().filter(|x| !x.is_nan()) {
            let mut x = x;
            let mut j = 0;
            // This inner loop applies `hi`/`lo` summation to each
            // partial so that the list of partial sums remains exact.
            for i in 0..partials.len() {
                let mut y: f64 = partials[i];
                if x.abs() < y.abs() {
                    mem::swap(&mut x, &mut y);
                }
                // Rounded `x+y` is stored in `hi` with round-off stored in
                // `lo`. Together `hi+lo` are exactly equal to `x+y`.
                let hi = x + y;
                let lo = y - (hi - x);
                if lo != 0.0 {
                    partials[j] = lo;
                    j += 1;
                }
                x = hi;
            }
            if j >= partials.len() {
                partials.push(x);
            } else {
                partials[j] = x;
                partials.truncate(j + 1);
            }
        }
        partials.iter().fold(0.0, |p, q| p + *q)
    }

    fn mean(&self) -> f64 {
        let n = self.count_present();
        if n == 0 {
            return f64::NAN;
        }
        self.sum() / n as f64
    }

    fn var(&self, ddof: f64) -> f64 {
        let n = self.count_present() as f64;
        if n - ddof <= 0.0 {
            return f64::NAN;
        }
        let mean = self.mean();
        let ss = self
            .iter()
            .filter(|x| !x.is_nan())
            .map(|&x| (x - mean) * (x - mean))
            .collect::<Vec<_>>();
        ss.sum() / (n - ddof)
    }

    fn quantile(&self, q: f64) -> f64 {
        quantile_of_sorted(&sorted_finite(self), q)
    }

    fn mad(&self) -> f64 {
        let median = self.median();
        if median.is_nan() {
            return f64::NAN;
        }
        let dev = self
            .iter()
            .filter(|x| !x.is_nan())
            .map(|&x| (x - median).abs())
            .collect::<Vec<_>>();
        dev.median()
    }

    fn count_present(&self) -> usize {
        self.iter().filter(|x| !x.is_nan()).count()
    }
}

/// Extract the `q` quantile of a sorted sample using linear interpolation between the two
/// nearest ranks. If samples are not sorted, return nonsensical value.
pub fn quantile_of_sorted(sorted_samples: &[f64], q: f64) -> f64 {
    if sorted_samples.is_empty() {
        return f64::NAN;
    }
    assert!((0.0..=1.0).contains(&q), "quantile {q} outside [0, 1]");
    if sorted_samples.len() == 1 {
        return sorted_samples[0];
    }
    if q == 1.0 {
        return sorted_samples[sorted_samples.len() - 1];
    }
    let rank = q * (sorted_samples.len() - 1) as f64;
    let l_rank = rank.floor();
    let d = rank - l_rank;
    let n = l_rank as usize;
    let lo = sorted_samples[n];
    let hi = sorted_samples[n + 1];
    lo + (hi - lo) * d
}
