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

//! Everything needed to test A/B metrics.
//!
//! ```rust
//! use bootstrap_ab::prelude::*;
//!
//! let results = vec![
//!     TestResult::new("Enrollment Rate", 0.02, 0.001, 0.05),
//!     TestResult::new("Average Reading Duration", 15.0, 0.012, 0.05),
//!     TestResult::new("Average Classroom Time", 0.8, 0.03, 0.05),
//!     TestResult::new("Completion Rate", 0.01, 0.09, 0.05),
//! ];
//!
//! let corrected = correct(&results, 0.05, &Bonferroni).unwrap();
//! let verdicts: Vec<bool> = corrected.iter().map(|r| r.reject_null).collect();
//! assert_eq!(verdicts, vec![true, true, false, false]);
//! ```

pub use crate::bootstrap::{CancellationToken, Resampler, SamplingDistribution};
pub use crate::config::SuiteConfig;
pub use crate::correction::{
    correct, Bonferroni, Correction, CorrectionPolicy, HolmBonferroni, Uncorrected,
};
pub use crate::events::{Action, Event, EventTable, ExperimentSummary, Field, Group};
pub use crate::metric::{BooleanField, Dedup, MetricDefinition, MetricExtractor, NumericField};
pub use crate::null::{build_null, NormalityDiagnostic, NullDistribution};
pub use crate::significance::{SignificanceTester, Tail, TestResult};
pub use crate::suite::{
    run_metric_test, MetricOutcome, SkippedMetric, SuiteEntry, TestSuite, TestSuiteResult,
};
pub use crate::Error;
