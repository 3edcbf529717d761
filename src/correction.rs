// Copyright (c) 2022. Sebastien Soudan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http:www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multiple comparison corrections.
//!
//! Testing `k` metrics at level `alpha` each gives a much higher chance than `alpha` to
//! reject at least one true null hypothesis. A [`CorrectionPolicy`] lowers the per-test
//! thresholds to keep the family-wise error rate at `family_alpha`.
use serde::{Deserialize, Serialize};

use crate::significance::{validate_alpha, TestResult};
use crate::Error;

/// A way to control the family-wise error rate.
pub trait CorrectionPolicy {
    /// Short name for reports.
    fn name(&self) -> &'static str;

    /// Threshold each raw p-value is compared to, in the order of `p_values`.
    ///
    /// A test is rejected iff `p_values[i] < thresholds[i]`.
    fn thresholds(&self, p_values: &[f64], family_alpha: f64) -> Vec<f64>;

    /// p-values on the scale of `family_alpha`, capped at 1.
    fn adjusted_p_values(&self, p_values: &[f64]) -> Vec<f64>;
}

/// Each test at `family_alpha / k`.
///
/// Valid whatever the dependence between the tests, but conservative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bonferroni;

impl CorrectionPolicy for Bonferroni {
    fn name(&self) -> &'static str {
        "bonferroni"
    }

    fn thresholds(&self, p_values: &[f64], family_alpha: f64) -> Vec<f64> {
        let k = p_values.len() as f64;
        vec![family_alpha / k; p_values.len()]
    }

    fn adjusted_p_values(&self, p_values: &[f64]) -> Vec<f64> {
        let k = p_values.len() as f64;
        p_values.iter().map(|p| (p * k).min(1.0)).collect()
    }
}

/// Holm-Bonferroni step-down procedure.
///
/// The i-th smallest p-value (0-based) is compared to `family_alpha / (k - i)`, stopping
/// at the first one that is not rejected. Same guarantee as Bonferroni, never rejects
/// less.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolmBonferroni;

impl CorrectionPolicy for HolmBonferroni {
    fn name(&self) -> &'static str {
        "holm"
    }

    fn thresholds(&self, p_values: &[f64], family_alpha: f64) -> Vec<f64> {
        let k = p_values.len();
        let mut thresholds = vec![0.0; k];

        // once a test is kept, every larger p-value keeps the same threshold so it is kept
        // as well
        let mut stopped: Option<f64> = None;
        for (rank, i) in ascending(p_values).into_iter().enumerate() {
            let threshold = stopped.unwrap_or(family_alpha / (k - rank) as f64);
            if stopped.is_none() && p_values[i] >= threshold {
                stopped = Some(threshold);
            }
            thresholds[i] = threshold;
        }

        thresholds
    }

    fn adjusted_p_values(&self, p_values: &[f64]) -> Vec<f64> {
        let k = p_values.len();
        let mut adjusted = vec![0.0; k];

        let mut running_max: f64 = 0.0;
        for (rank, i) in ascending(p_values).into_iter().enumerate() {
            running_max = running_max.max((p_values[i] * (k - rank) as f64).min(1.0));
            adjusted[i] = running_max;
        }

        adjusted
    }
}

/// No correction: each test at `family_alpha`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Uncorrected;

impl CorrectionPolicy for Uncorrected {
    fn name(&self) -> &'static str {
        "none"
    }

    fn thresholds(&self, p_values: &[f64], family_alpha: f64) -> Vec<f64> {
        vec![family_alpha; p_values.len()]
    }

    fn adjusted_p_values(&self, p_values: &[f64]) -> Vec<f64> {
        p_values.to_vec()
    }
}

/// Indices of `p_values` by increasing p-value, ties in original order.
fn ascending(p_values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..p_values.len()).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));
    order
}

/// Correction policies selectable from a configuration file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correction {
    /// [`Bonferroni`]
    #[default]
    Bonferroni,
    /// [`HolmBonferroni`]
    Holm,
    /// [`Uncorrected`]
    None,
}

impl Correction {
    /// The policy behind this name.
    pub fn policy(&self) -> &'static dyn CorrectionPolicy {
        match self {
            Correction::Bonferroni => &Bonferroni,
            Correction::Holm => &HolmBonferroni,
            Correction::None => &Uncorrected,
        }
    }
}

/// Re-judges `results` jointly: each result gets the threshold given by `policy` as its
/// `alpha`, and `reject_null` is recomputed against it.
pub fn correct<P: CorrectionPolicy + ?Sized>(
    results: &[TestResult],
    family_alpha: f64,
    policy: &P,
) -> Result<Vec<TestResult>, Error> {
    validate_alpha(family_alpha)?;
    if results.is_empty() {
        return Ok(Vec::new());
    }

    let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
    let thresholds = policy.thresholds(&p_values, family_alpha);

    Ok(results
        .iter()
        .zip(thresholds)
        .map(|(r, alpha)| r.with_alpha(alpha))
        .collect())
}
