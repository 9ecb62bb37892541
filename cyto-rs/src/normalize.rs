use anyhow::{format_err, Error};
use log::{info, warn};
use ndarray::{Array2, Axis};
use profile_stats::Statistics;
use profile_types::{FeatureSpec, ProfileTable, RowFilter, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Consistency constant that turns a MAD into a standard deviation estimate for normal data.
pub const MAD_NORMAL_SCALE: f64 = 1.4826;

/// Location / scale estimator of a normalization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMethod {
    /// mean and population standard deviation
    #[default]
    Standardize,
    /// median and interquartile range
    Robustize,
    /// median and scaled median absolute deviation
    MadRobustize,
}

impl FromStr for NormalizeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standardize" => Ok(NormalizeMethod::Standardize),
            "robustize" => Ok(NormalizeMethod::Robustize),
            "mad_robustize" => Ok(NormalizeMethod::MadRobustize),
            _ => Err(format_err!("normalization method not recognized: {s}")),
        }
    }
}

impl fmt::Display for NormalizeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NormalizeMethod::Standardize => "standardize",
            NormalizeMethod::Robustize => "robustize",
            NormalizeMethod::MadRobustize => "mad_robustize",
        })
    }
}

/// Options of the normalization step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// features to normalize; all others are left out of the output
    pub features: FeatureSpec,
    /// reference rows the location and scale are estimated from
    pub samples: RowFilter,
    /// estimator
    pub method: NormalizeMethod,
    /// added to the scaled MAD
    pub mad_epsilon: f64,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions {
            features: FeatureSpec::Infer,
            samples: RowFilter::All,
            method: NormalizeMethod::Standardize,
            mad_epsilon: 1e-18,
        }
    }
}

/// Output of [`normalize`].
#[derive(Clone, Debug)]
pub struct Normalized {
    /// transformed profiles
    pub profiles: ProfileTable,
    /// features whose reference scale was zero; they are only centered
    pub zero_scale: Vec<String>,
}

/// Location and scale of one feature over the reference values.
/// A zero scale is reported as `None` in the second position.
fn location_scale(values: &[f64], method: NormalizeMethod, eps: f64) -> (f64, Option<f64>) {
    let (loc, spread) = match method {
        NormalizeMethod::Standardize => (values.mean(), values.std(0.0)),
        NormalizeMethod::Robustize => (values.median(), values.iqr()),
        NormalizeMethod::MadRobustize => (values.median(), values.mad()),
    };
    if spread == 0.0 {
        return (loc, None);
    }
    let scale = match method {
        NormalizeMethod::MadRobustize => MAD_NORMAL_SCALE * spread + eps,
        _ => spread,
    };
    (loc, Some(scale))
}

/// Rescale features against a reference subset of rows.
///
/// Location and scale are computed per feature from the reference rows only, ignoring
/// missing values, and applied to every row. Metadata passes through unchanged.
pub fn normalize(profiles: &ProfileTable, opts: &NormalizeOptions) -> Result<Normalized, Error> {
    let columns = profiles.resolve_features(&opts.features, Stage::Normalize)?;
    let reference = opts.samples.rows(profiles, Stage::Normalize)?;
    let selected = profiles.select_features(&columns);

    let params: Vec<(f64, Option<f64>)> = selected
        .features()
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|col| {
            let values: Vec<f64> = reference.iter().map(|&r| col[r]).collect();
            location_scale(&values, opts.method, opts.mad_epsilon)
        })
        .collect();

    let mut zero_scale = vec![];
    for ((loc, scale), name) in params.iter().zip(selected.feature_names()) {
        if scale.is_none() {
            warn!("{name} has zero scale over the reference rows ({}), centering only", opts.samples);
            zero_scale.push(name.clone());
        } else if loc.is_nan() {
            warn!("{name} has no values in the reference rows ({})", opts.samples);
        }
    }

    let mut out: Array2<f64> = selected.features().to_owned();
    out.axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(j, mut col)| {
            let (loc, scale) = params[j];
            let scale = scale.unwrap_or(1.0);
            col.mapv_inplace(|x| (x - loc) / scale);
        });

    let profiles = selected.with_features(selected.feature_names().to_vec(), out)?;
    info!(
        "{} normalized {} profiles x {} features against {} reference rows ({})",
        opts.method,
        profiles.nrows(),
        profiles.n_features(),
        reference.len(),
        opts.samples
    );
    Ok(Normalized { profiles, zero_scale })
}
