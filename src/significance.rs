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

use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::null::NullDistribution;
use crate::Error;

/// Default type I error rate.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Part of the null distribution to use for the p-value
/// https://en.wikipedia.org/wiki/P-value#Probability_of_obtaining_a_real-valued_test_statistic_at_least_as_extreme_as_the_one_actually_obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    /// One-sided test (right tail) - H1: the experiment metric is greater
    /// Pr(T > t | H0)
    #[default]
    Right,
    /// One-sided test (left tail) - H1: the experiment metric is lower
    /// Pr(T < t | H0)
    Left,
    /// Two-sided test
    /// 2 * min (Pr(T > t | H0), Pr(T < t | H0)), capped at 1
    TwoSided,
}

/// Proportion of `null` more extreme than `observed`.
pub fn p_value<F: Float>(observed: F, null: &[F], tail: Tail) -> Result<F, Error> {
    if null.is_empty() {
        return Err(Error::InsufficientSamples);
    }
    if !observed.is_finite() {
        return Err(Error::InvalidStatistic(observed.to_f64().unwrap_or(f64::NAN)));
    }

    let rep = F::from(null.len()).unwrap();
    let right = || F::from(null.iter().filter(|&&t| t > observed).count()).unwrap() / rep;
    let left = || F::from(null.iter().filter(|&&t| t < observed).count()).unwrap() / rep;

    let p = match tail {
        Tail::Right => right(),
        Tail::Left => left(),
        Tail::TwoSided => (F::from(2.).unwrap() * right().min(left())).min(F::one()),
    };

    Ok(p)
}

/// Outcome of one metric test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Name of the metric
    pub metric_name: String,
    /// `metric(experiment) - metric(control)`
    pub observed_difference: f64,
    /// Probability under H0 of a difference at least as extreme
    pub p_value: f64,
    /// Significance threshold the p-value was compared to
    pub alpha: f64,
    /// `p_value < alpha`
    pub reject_null: bool,
}

impl TestResult {
    /// Builds a result, deciding `reject_null` from `p_value` and `alpha`.
    pub fn new(metric_name: impl Into<String>, observed_difference: f64, p_value: f64, alpha: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            observed_difference,
            p_value,
            alpha,
            reject_null: p_value < alpha,
        }
    }

    /// Same test judged against another threshold.
    pub fn with_alpha(&self, alpha: f64) -> Self {
        Self::new(
            self.metric_name.clone(),
            self.observed_difference,
            self.p_value,
            alpha,
        )
    }
}

/// Checks that `alpha` is a probability strictly between 0 and 1.
pub(crate) fn validate_alpha(alpha: f64) -> Result<(), Error> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "alpha must be in (0, 1), got {alpha}"
        )))
    }
}

/// Compares an observed difference to a null distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificanceTester {
    alpha: f64,
    tail: Tail,
}

impl Default for SignificanceTester {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            tail: Tail::Right,
        }
    }
}

impl SignificanceTester {
    /// Right-tailed tester at level `alpha`.
    pub fn new(alpha: f64) -> Result<Self, Error> {
        validate_alpha(alpha)?;
        Ok(Self {
            alpha,
            ..Self::default()
        })
    }

    /// Uses `tail` instead of the right tail.
    pub fn with_tail(mut self, tail: Tail) -> Self {
        self.tail = tail;
        self
    }

    /// The significance level.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// The tail used for the p-value.
    pub fn tail(&self) -> Tail {
        self.tail
    }

    /// p-value of `observed_difference` against `null` and the resulting verdict.
    pub fn test(
        &self,
        metric_name: impl Into<String>,
        observed_difference: f64,
        null: &NullDistribution,
    ) -> Result<TestResult, Error> {
        let p = p_value(observed_difference, null.values(), self.tail)?;
        Ok(TestResult::new(metric_name, observed_difference, p, self.alpha))
    }
}
