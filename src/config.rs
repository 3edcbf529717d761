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

//! Test suite configuration, loadable from TOML.
//!
//! ```toml
//! alpha = 0.05
//! family_alpha = 0.05
//! iterations = 10000
//! workers = 4
//! seed = 42
//! tail = "right"
//! correction = "holm"
//! ```
//!
//! Every key is optional.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bootstrap::{Resampler, DEFAULT_ITERATIONS};
use crate::correction::Correction;
use crate::significance::{validate_alpha, SignificanceTester, Tail, DEFAULT_ALPHA};
use crate::Error;

/// Settings of a metric test or of a suite of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SuiteConfig {
    /// Significance level of each test taken alone
    pub alpha: f64,
    /// Family-wise significance level when testing several metrics
    pub family_alpha: f64,
    /// Number of bootstrap repetitions
    pub iterations: usize,
    /// Number of independently seeded bootstrap chunks, run in parallel
    pub workers: usize,
    /// Seed of the random generator - runs are only reproducible with one
    pub seed: Option<u64>,
    /// Tail of the null distribution the p-value is read from
    pub tail: Tail,
    /// Multiple comparison correction
    pub correction: Correction,
    /// `|skewness|` of the sampling distribution above which a warning is logged
    pub skewness_threshold: f64,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            family_alpha: DEFAULT_ALPHA,
            iterations: DEFAULT_ITERATIONS,
            workers: 1,
            seed: None,
            tail: Tail::Right,
            correction: Correction::Bonferroni,
            skewness_threshold: 1.0,
        }
    }
}

impl SuiteConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: SuiteConfig =
            toml::from_str(s).map_err(|e| Error::InvalidConfig(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks every setting is in range.
    pub fn validate(&self) -> Result<(), Error> {
        validate_alpha(self.alpha)?;
        validate_alpha(self.family_alpha)?;
        if self.iterations == 0 {
            return Err(Error::InvalidConfig(
                "the number of bootstrap iterations must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::InvalidConfig(
                "the number of workers must be at least 1".to_string(),
            ));
        }
        if self.skewness_threshold.is_nan() || self.skewness_threshold <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "skewness_threshold must be positive, got {}",
                self.skewness_threshold
            )));
        }
        Ok(())
    }

    /// The resampler these settings describe.
    pub fn resampler(&self) -> Result<Resampler, Error> {
        Resampler::new(self.iterations)?.with_workers(self.workers)
    }

    /// The tester these settings describe.
    pub fn tester(&self) -> Result<SignificanceTester, Error> {
        Ok(SignificanceTester::new(self.alpha)?.with_tail(self.tail))
    }
}
