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

//! A/B Test Significance with Bootstrap Resampling
//!
//! Check the [`prelude`] module for the public API.
//!
//! Given the per-user action log of an experiment (a control group and an experiment
//! group), we want to know whether the difference observed in some metric (click
//! through rate, average duration, completion rate, ...) is unlikely to be due to
//! chance.
//!
//! The procedure is:
//! 1. compute the observed difference `metric(experiment) - metric(control)`,
//! 2. resample the whole event table with replacement many times and recompute the
//!    difference each time - this gives the sampling distribution of the difference,
//! 3. simulate the distribution under H0 (no difference) with a normal distribution
//!    centered at 0 with the same spread as the sampling distribution,
//! 4. the p-value is the proportion of the null distribution that is more extreme than
//!    the observed difference,
//! 5. when several metrics are tested together, the significance threshold is adjusted
//!    (Bonferroni, Holm-Bonferroni, ...).
//!
//! # References
//! - [Bootstrapping](https://en.wikipedia.org/wiki/Bootstrapping_(statistics))
//! - [P-value](https://en.wikipedia.org/wiki/P-value)
//! - [Bonferroni correction](https://en.wikipedia.org/wiki/Bonferroni_correction)
//! - [Holm-Bonferroni method](https://en.wikipedia.org/wiki/Holm%E2%80%93Bonferroni_method)
//!
//! # Example
//!
//! ```rust
//! use bootstrap_ab::prelude::*;
//!
//! // 200 users per group viewed the page; 20 clicked in control, 45 in experiment
//! let mut events = Vec::new();
//! for (group, clicks, offset) in [(Group::Control, 20, 0), (Group::Experiment, 45, 1_000)] {
//!     for i in 0..200u64 {
//!         events.push(Event::new(offset + i, group, Action::View, i as i64));
//!         if i < clicks {
//!             events.push(Event::new(offset + i, group, Action::Click, i as i64 + 1));
//!         }
//!     }
//! }
//! let table = EventTable::new(events);
//!
//! let ctr = MetricDefinition::ratio_of_uniques(Action::Click, Action::View);
//! let config = SuiteConfig {
//!     iterations: 2_000,
//!     seed: Some(42),
//!     ..SuiteConfig::default()
//! };
//!
//! let outcome = TestSuite::new(config)
//!     .unwrap()
//!     .run_metric("CTR", &table, &ctr)
//!     .unwrap();
//! assert!((outcome.result.observed_difference - 0.125).abs() < 1e-12);
//! assert!(outcome.result.reject_null);
//! ```
use thiserror::Error;

/// The prelude module re-exports the most commonly used types and traits.
/// This is the public API. Enjoy!
pub mod prelude;

/// Bootstrap resampling of an event table
pub mod bootstrap;
/// Configuration of a test suite
pub mod config;
/// Multiple comparison corrections
pub mod correction;
/// Events and event tables
pub mod events;
/// Metric definitions and extraction
pub mod metric;
/// Null distribution simulation
pub mod null;
/// p-values and verdicts
pub mod significance;
/// Running one or several metric tests end to end
pub mod suite;
/// Numeric helpers
pub mod utils;

use events::{Field, Group};

/// The error type for this crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A field required by a metric is missing or malformed.
    #[error("schema error on field `{field}`: {reason}")]
    Schema {
        /// The offending field
        field: Field,
        /// What is wrong with it
        reason: String,
    },
    /// A metric has no denominator for a group (no users, no rows).
    #[error("metric undefined for the {group} group: {detail}")]
    DivisionUndefined {
        /// The group for which the metric cannot be computed
        group: Group,
        /// What was missing
        detail: String,
    },
    /// An empty table or distribution was handed to the bootstrap, the null model or the
    /// tester.
    #[error("Not enough samples")]
    InsufficientSamples,
    /// The statistic is NaN or infinite.
    #[error("invalid statistic: {0}")]
    InvalidStatistic(f64),
    /// Bad parameter or configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The computation was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error comes from the data being too sparse for a metric (as opposed to
    /// a wiring or configuration problem).
    ///
    /// A test suite skips the metrics failing with such an error and carries on with the
    /// others.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Error::DivisionUndefined { .. })
    }
}
