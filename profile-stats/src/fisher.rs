//! One-sided Fisher's exact test on a 2x2 contingency table.

use serde::Serialize;

/// Result of a Fisher's exact test.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FisherResult {
    /// sample odds ratio `(a d) / (b c)`
    pub odds_ratio: f64,
    /// probability of a table at least as extreme in the "greater" direction
    pub p_value: f64,
}

/// `ln(k!)` for `k` in `0..=n`, accumulated in one pass.
fn ln_factorials(n: u64) -> Vec<f64> {
    let mut res = Vec::with_capacity(n as usize + 1);
    let mut acc = 0.0;
    res.push(acc);
    for k in 1..=n {
        acc += (k as f64).ln();
        res.push(acc);
    }
    res
}

/// Fisher's exact test of `[[a, b], [c, d]]` with the alternative that the odds ratio of
/// the population is greater than one. The p-value is the upper tail of the hypergeometric
/// distribution of the top-left cell given the table margins.
pub fn fisher_exact_greater(table: [[u64; 2]; 2]) -> FisherResult {
    let [[a, b], [c, d]] = table;

    let odds_ratio = if b == 0 || c == 0 {
        if a == 0 || d == 0 {
            f64::NAN
        } else {
            f64::INFINITY
        }
    } else {
        (a as f64 * d as f64) / (b as f64 * c as f64)
    };

    let n = a + b + c + d;
    let row = a + b;
    let col = a + c;
    let lf = ln_factorials(n);
    let ln_choose = |n: u64, k: u64| lf[n as usize] - lf[k as usize] - lf[(n - k) as usize];
    let ln_total = ln_choose(n, row);

    // support of the top-left cell given the margins
    let hi = row.min(col);
    let log_p: Vec<f64> = (a..=hi)
        .map(|x| ln_choose(col, x) + ln_choose(n - col, row - x) - ln_total)
        .collect();

    // log-sum-exp of the upper tail
    let max = log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let p_value = if max == f64::NEG_INFINITY {
        0.0
    } else {
        let sum = log_p.iter().map(|&x| (x - max).exp()).sum::<f64>();
        (sum.ln() + max).exp().min(1.0)
    };

    FisherResult { odds_ratio, p_value }
}
