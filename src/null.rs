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

//! Distribution of the difference under H0.
//!
//! By the Central Limit Theorem the difference is roughly normal. Under H0 it is centered
//! at 0, and its spread is estimated by the bootstrap - so we simulate
//! `N(0, std(sampling distribution))` with as many draws as the sampling distribution.
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use crate::bootstrap::SamplingDistribution;
use crate::utils;
use crate::Error;

/// Simulated differences under the null hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NullDistribution {
    values: Vec<f64>,
}

impl NullDistribution {
    /// The simulated differences.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of draws.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there is no draw at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Spread of the draws.
    pub fn std_dev(&self) -> Result<f64, Error> {
        utils::std_dev(&self.values)
    }

    /// Takes the draws out.
    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

impl From<Vec<f64>> for NullDistribution {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

/// Normal distribution centered at 0 with the spread of `sampling`, sampled
/// `sampling.len()` times.
pub fn build_null<R: Rng + ?Sized>(
    rng: &mut R,
    sampling: &SamplingDistribution,
) -> Result<NullDistribution, Error> {
    let sigma = sampling.std_dev()?;
    if !sigma.is_finite() {
        return Err(Error::InvalidStatistic(sigma));
    }
    let normal = Normal::new(0.0, sigma).map_err(|_| Error::InvalidStatistic(sigma))?;

    let values = (0..sampling.len()).map(|_| normal.sample(rng)).collect();

    Ok(NullDistribution { values })
}

/// Shape of a sampling distribution compared to a normal one.
///
/// The null model only matches the spread, this tells how far off the normality
/// assumption is. It is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalityDiagnostic {
    /// Skewness - 0 for a normal distribution
    pub skewness: f64,
    /// Excess kurtosis - 0 for a normal distribution
    pub excess_kurtosis: f64,
}

impl NormalityDiagnostic {
    /// Diagnostic of `sampling`.
    pub fn of(sampling: &SamplingDistribution) -> Result<Self, Error> {
        Ok(Self {
            skewness: utils::skewness(sampling.values())?,
            excess_kurtosis: utils::excess_kurtosis(sampling.values())?,
        })
    }

    /// Whether `|skewness|` stays under `threshold` - a common rule of thumb is 1.
    pub fn is_roughly_symmetric(&self, threshold: f64) -> bool {
        self.skewness.abs() < threshold
    }
}
