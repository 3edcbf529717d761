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

//! End to end: observed difference, bootstrap, null simulation, p-value, correction.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use crate::bootstrap::{CancellationToken, Resampler, SamplingDistribution};
use crate::config::SuiteConfig;
use crate::correction::{correct, CorrectionPolicy};
use crate::events::EventTable;
use crate::metric::MetricExtractor;
use crate::null::{build_null, NormalityDiagnostic, NullDistribution};
use crate::significance::{SignificanceTester, TestResult};
use crate::utils::rng_from_seed;
use crate::Error;

/// Everything computed while testing one metric.
///
/// The two distributions are kept for whoever wants to plot them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricOutcome {
    /// Verdict of the metric tested alone
    pub result: TestResult,
    /// Bootstrapped differences
    pub sampling: SamplingDistribution,
    /// Simulated differences under H0
    pub null: NullDistribution,
    /// Shape of the sampling distribution
    pub diagnostic: NormalityDiagnostic,
}

/// Tests one metric on `table`.
///
/// Errors from the metric (e.g. [`Error::DivisionUndefined`]) are returned as is.
pub fn run_metric_test<R: Rng + ?Sized, M: MetricExtractor + Sync + ?Sized>(
    rng: &mut R,
    table: &EventTable,
    name: &str,
    metric: &M,
    resampler: &Resampler,
    tester: &SignificanceTester,
) -> Result<MetricOutcome, Error> {
    table.ensure_fields(&metric.required_fields())?;

    let observed = metric.observed_difference(table)?;
    let sampling = resampler.sample(rng, table, metric)?;
    let null = build_null(rng, &sampling)?;
    let result = tester.test(name, observed, &null)?;
    let diagnostic = NormalityDiagnostic::of(&sampling)?;

    info!(
        metric = name,
        observed_difference = result.observed_difference,
        p_value = result.p_value,
        alpha = result.alpha,
        reject_null = result.reject_null,
        "metric tested"
    );

    Ok(MetricOutcome {
        result,
        sampling,
        null,
        diagnostic,
    })
}

/// One line of the joint report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteEntry {
    /// Name of the metric
    pub name: String,
    /// `metric(experiment) - metric(control)`
    pub observed_difference: f64,
    /// p-value of the metric tested alone
    pub raw_p_value: f64,
    /// p-value adjusted by the correction policy
    pub adjusted_p_value: f64,
    /// Threshold the raw p-value is compared to
    pub corrected_alpha: f64,
    /// Verdict after correction
    pub reject_null: bool,
}

/// A metric that could not be tested.
///
/// ```rust
/// use bootstrap_ab::prelude::*;
///
/// // nobody completed anything: the rate has no denominator
/// let table = EventTable::new(vec![
///     Event::new(1, Group::Control, Action::View, 0),
///     Event::new(2, Group::Experiment, Action::View, 1),
/// ]);
/// let config = SuiteConfig {
///     iterations: 100,
///     seed: Some(42),
///     ..SuiteConfig::default()
/// };
///
/// let result = TestSuite::new(config)
///     .unwrap()
///     .add(
///         "Completion per finisher",
///         &table,
///         MetricDefinition::ratio_of_uniques(Action::Enroll, Action::Complete),
///     )
///     .run()
///     .unwrap();
///
/// let skipped: &[SkippedMetric] = &result.skipped;
/// assert_eq!(skipped.len(), 1);
/// assert_eq!(skipped[0].name, "Completion per finisher");
/// assert!(result.entries.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedMetric {
    /// Name of the metric
    pub name: String,
    /// Why
    pub reason: String,
}

/// Joint verdict over several metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSuiteResult {
    /// Name of the correction policy
    pub correction: String,
    /// Family-wise significance level
    pub family_alpha: f64,
    /// Corrected verdicts, in the order the metrics were added
    pub entries: Vec<SuiteEntry>,
    /// Metrics without enough data
    pub skipped: Vec<SkippedMetric>,
    /// Per-metric details of the tested metrics
    pub outcomes: Vec<MetricOutcome>,
}

impl TestSuiteResult {
    /// Joint verdict over already computed results.
    pub fn from_results<P: CorrectionPolicy + ?Sized>(
        results: &[TestResult],
        family_alpha: f64,
        policy: &P,
    ) -> Result<Self, Error> {
        let corrected = correct(results, family_alpha, policy)?;
        let raw: Vec<f64> = results.iter().map(|r| r.p_value).collect();
        let adjusted = policy.adjusted_p_values(&raw);

        let entries = corrected
            .into_iter()
            .zip(adjusted)
            .map(|(r, adjusted_p_value)| SuiteEntry {
                name: r.metric_name,
                observed_difference: r.observed_difference,
                raw_p_value: r.p_value,
                adjusted_p_value,
                corrected_alpha: r.alpha,
                reject_null: r.reject_null,
            })
            .collect();

        Ok(Self {
            correction: policy.name().to_string(),
            family_alpha,
            entries,
            skipped: Vec::new(),
            outcomes: Vec::new(),
        })
    }

    /// The entry for metric `name`.
    pub fn entry(&self, name: &str) -> Option<&SuiteEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

struct MetricTest<'a> {
    name: String,
    table: &'a EventTable,
    metric: Box<dyn MetricExtractor + Sync + 'a>,
}

/// A set of metrics tested jointly.
///
/// Each metric comes with its own table, as different metrics are often logged by
/// different experiments (home page, course page, classroom).
pub struct TestSuite<'a> {
    config: SuiteConfig,
    cancel: Option<CancellationToken>,
    metrics: Vec<MetricTest<'a>>,
}

impl<'a> TestSuite<'a> {
    /// An empty suite with validated `config`.
    pub fn new(config: SuiteConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: None,
            metrics: Vec::new(),
        })
    }

    /// Stops with [`Error::Cancelled`] once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Adds a metric to test on `table`.
    pub fn add(
        mut self,
        name: impl Into<String>,
        table: &'a EventTable,
        metric: impl MetricExtractor + Sync + 'a,
    ) -> Self {
        self.metrics.push(MetricTest {
            name: name.into(),
            table,
            metric: Box::new(metric),
        });
        self
    }

    /// The settings.
    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    fn resampler(&self) -> Result<Resampler, Error> {
        let resampler = self.config.resampler()?;
        Ok(match &self.cancel {
            Some(token) => resampler.with_cancellation(token.clone()),
            None => resampler,
        })
    }

    /// Tests a single metric with the suite settings, without correction.
    pub fn run_metric<M: MetricExtractor + Sync + ?Sized>(
        &self,
        name: &str,
        table: &EventTable,
        metric: &M,
    ) -> Result<MetricOutcome, Error> {
        let mut rng = rng_from_seed(self.config.seed);
        run_metric_test(
            &mut rng,
            table,
            name,
            metric,
            &self.resampler()?,
            &self.config.tester()?,
        )
    }

    /// Tests every metric, then corrects the verdicts jointly.
    ///
    /// A metric failing for lack of data is reported in
    /// [`TestSuiteResult::skipped`] and left out of the correction; any other error
    /// aborts the run.
    pub fn run(&self) -> Result<TestSuiteResult, Error> {
        let resampler = self.resampler()?;
        let tester = self.config.tester()?;

        // one seed per metric, drawn up front: a skipped metric does not shift the others
        let mut master = rng_from_seed(self.config.seed);
        let seeds: Vec<u64> = self.metrics.iter().map(|_| master.gen()).collect();

        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();

        for (test, seed) in self.metrics.iter().zip(seeds) {
            let mut rng = StdRng::seed_from_u64(seed);
            match run_metric_test(
                &mut rng,
                test.table,
                &test.name,
                test.metric.as_ref(),
                &resampler,
                &tester,
            ) {
                Ok(outcome) => {
                    if !outcome
                        .diagnostic
                        .is_roughly_symmetric(self.config.skewness_threshold)
                    {
                        warn!(
                            metric = test.name.as_str(),
                            skewness = outcome.diagnostic.skewness,
                            "sampling distribution is skewed, the normal null model may be off"
                        );
                    }
                    outcomes.push(outcome);
                }
                Err(e) if e.is_data_error() => {
                    warn!(metric = test.name.as_str(), error = %e, "insufficient data, metric skipped");
                    skipped.push(SkippedMetric {
                        name: test.name.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let results: Vec<TestResult> = outcomes.iter().map(|o| o.result.clone()).collect();
        let mut suite = TestSuiteResult::from_results(
            &results,
            self.config.family_alpha,
            self.config.correction.policy(),
        )?;
        suite.skipped = skipped;
        suite.outcomes = outcomes;

        info!(
            tested = suite.entries.len(),
            skipped = suite.skipped.len(),
            rejected = suite.entries.iter().filter(|e| e.reject_null).count(),
            correction = suite.correction.as_str(),
            "test suite done"
        );

        Ok(suite)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use itertools::Itertools;

    use super::*;
    use crate::correction::{Bonferroni, Correction};
    use crate::events::{Action, Event, Field, Group};
    use crate::metric::{BooleanField, MetricDefinition, NumericField};

    /// 500 users per group view the home page, the first `clicks` of them click.
    fn homepage(control_clicks: u64, experiment_clicks: u64) -> EventTable {
        let mut events = Vec::new();
        for (group, clicks, offset) in [
            (Group::Control, control_clicks, 0),
            (Group::Experiment, experiment_clicks, 10_000),
        ] {
            for i in 0..500u64 {
                let ts = (i * 60) as i64;
                events.push(Event::new(offset + i, group, Action::View, ts));
                if i < clicks {
                    events.push(Event::new(offset + i, group, Action::Click, ts + 5));
                }
            }
        }
        EventTable::new(events)
    }

    /// 300 users per group view the course page, some of them enroll.
    fn course_page() -> EventTable {
        let mut events = Vec::new();
        for (group, base, enroll_every, offset) in [
            (Group::Control, 100.0, 1, 0),
            (Group::Experiment, 110.0, 2, 10_000),
        ] {
            for i in 0..300u64 {
                let ts = (i * 60) as i64;
                let duration = base + (i % 20) as f64 * 5.0;
                events.push(Event::new(offset + i, group, Action::View, ts).with_duration(duration));
                if i % 10 < enroll_every {
                    events.push(Event::new(offset + i, group, Action::Enroll, ts + 30));
                }
            }
        }
        EventTable::new(events)
    }

    /// One classroom record per user, the first `completed` of 200 completed.
    fn classroom(control_completed: u64, experiment_completed: u64) -> EventTable {
        let mut events = Vec::new();
        for (group, completed, offset) in [
            (Group::Control, control_completed, 0),
            (Group::Experiment, experiment_completed, 10_000),
        ] {
            for i in 0..200u64 {
                events.push(
                    Event::new(offset + i, group, Action::Enroll, i as i64)
                        .with_total_days(20.0 + (i % 30) as f64)
                        .with_completed(i < completed),
                );
            }
        }
        EventTable::new(events)
    }

    fn config(iterations: usize, seed: u64) -> SuiteConfig {
        SuiteConfig {
            iterations,
            seed: Some(seed),
            ..SuiteConfig::default()
        }
    }

    fn ctr() -> MetricDefinition {
        MetricDefinition::ratio_of_uniques(Action::Click, Action::View)
    }

    #[test]
    fn test_small_ctr_lift_is_reproducible() {
        // CTR 0.10 vs 0.12
        let table = homepage(50, 60);
        let suite = TestSuite::new(config(10_000, 42)).unwrap();

        let a = suite.run_metric("CTR", &table, &ctr()).unwrap();
        let b = suite.run_metric("CTR", &table, &ctr()).unwrap();

        assert_relative_eq!(a.result.observed_difference, 0.02, epsilon = 1e-12);
        assert_eq!(a.sampling.len(), 10_000);
        assert_eq!(a.null.len(), 10_000);
        assert_eq!(a.result.p_value, b.result.p_value);
        assert_eq!(a, b);

        // 500 users per group is not enough to detect 2 points
        assert!(a.result.p_value > 0.05);
        assert!(!a.result.reject_null);
    }

    #[test]
    fn test_large_ctr_lift_is_detected() {
        // CTR 0.10 vs 0.20
        let table = homepage(50, 100);
        let result = TestSuite::new(config(2_000, 42))
            .unwrap()
            .add("CTR", &table, ctr())
            .run()
            .unwrap();

        let entry = result.entry("CTR").unwrap();
        assert_relative_eq!(entry.observed_difference, 0.1, epsilon = 1e-12);
        assert!(entry.raw_p_value < 0.05);
        assert_eq!(entry.corrected_alpha, 0.05);
        assert!(entry.reject_null);
    }

    #[test]
    fn test_small_completion_lift_is_not_significant() {
        // completion 0.30 vs 0.32
        let table = classroom(60, 64);
        let completion = MetricDefinition::proportion(BooleanField::Completed);

        let outcome = TestSuite::new(config(2_000, 42))
            .unwrap()
            .run_metric("Completion Rate", &table, &completion)
            .unwrap();

        assert_relative_eq!(outcome.result.observed_difference, 0.02, epsilon = 1e-12);
        // binomial standard error of the difference of two proportions
        let spread = (0.3 * 0.7 / 200. + 0.32 * 0.68 / 200_f64).sqrt();
        assert_relative_eq!(
            outcome.sampling.std_dev().unwrap(),
            spread,
            max_relative = 0.1
        );
        assert!(outcome.result.p_value > 0.25);
        assert!(!outcome.result.reject_null);
    }

    #[test]
    fn test_parallel_suite_matches_its_own_rerun() {
        let table = homepage(50, 100);
        let config = SuiteConfig {
            workers: 4,
            ..config(2_000, 7)
        };
        let suite = TestSuite::new(config).unwrap();

        let a = suite.run_metric("CTR", &table, &ctr()).unwrap();
        let b = suite.run_metric("CTR", &table, &ctr()).unwrap();
        assert_eq!(a.result, b.result);
        assert_eq!(a.sampling.len(), 2_000);
    }

    #[test]
    fn test_suite_skips_metrics_without_data() {
        let course = course_page();
        let classroom = classroom(60, 64);

        let result = TestSuite::new(config(2_000, 42))
            .unwrap()
            .add(
                "Enrollment Rate",
                &course,
                MetricDefinition::ratio_of_uniques(Action::Enroll, Action::View),
            )
            .add(
                "Average Reading Duration",
                &course,
                MetricDefinition::mean_of_action(NumericField::Duration, Action::View),
            )
            .add(
                "Completion per finisher",
                &course,
                MetricDefinition::ratio_of_uniques(Action::Enroll, Action::Complete),
            )
            .add(
                "Completion Rate",
                &classroom,
                MetricDefinition::proportion(BooleanField::Completed),
            )
            .run()
            .unwrap();

        assert_eq!(result.correction, "bonferroni");
        assert_eq!(
            result.entries.iter().map(|e| e.name.as_str()).collect_vec(),
            vec!["Enrollment Rate", "Average Reading Duration", "Completion Rate"]
        );
        for entry in &result.entries {
            assert_relative_eq!(entry.corrected_alpha, 0.05 / 3.);
        }
        assert_eq!(result.outcomes.len(), 3);

        // 0.1 vs 0.2 enrollment and +10s reading over 300 users: detected
        assert!(result.entry("Enrollment Rate").unwrap().reject_null);
        assert!(result.entry("Average Reading Duration").unwrap().reject_null);
        assert!(!result.entry("Completion Rate").unwrap().reject_null);

        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].name, "Completion per finisher");
        assert!(result.skipped[0].reason.contains("complete"));
    }

    #[test]
    fn test_suite_is_reproducible_and_skips_do_not_shift_seeds() {
        let course = course_page();

        let with_skip = TestSuite::new(config(1_000, 3))
            .unwrap()
            .add(
                "broken",
                &course,
                MetricDefinition::ratio_of_uniques(Action::Enroll, Action::Complete),
            )
            .add(
                "Enrollment Rate",
                &course,
                MetricDefinition::ratio_of_uniques(Action::Enroll, Action::View),
            )
            .run()
            .unwrap();
        let again = TestSuite::new(config(1_000, 3))
            .unwrap()
            .add(
                "broken",
                &course,
                MetricDefinition::ratio_of_uniques(Action::Enroll, Action::Complete),
            )
            .add(
                "Enrollment Rate",
                &course,
                MetricDefinition::ratio_of_uniques(Action::Enroll, Action::View),
            )
            .run()
            .unwrap();

        assert_eq!(with_skip, again);
    }

    #[test]
    fn test_schema_error_aborts_the_suite() {
        let homepage = homepage(50, 60);

        let err = TestSuite::new(config(100, 42))
            .unwrap()
            .add("CTR", &homepage, ctr())
            .add(
                "Average Reading Duration",
                &homepage,
                MetricDefinition::mean_of(NumericField::Duration),
            )
            .run()
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Schema {
                field: Field::Duration,
                ..
            }
        ));
    }

    #[test]
    fn test_cancelled_suite() {
        let table = homepage(50, 60);
        let token = CancellationToken::new();
        token.cancel();

        let err = TestSuite::new(config(100, 42))
            .unwrap()
            .with_cancellation(token)
            .add("CTR", &table, ctr())
            .run()
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);
    }

    #[test]
    fn test_joint_verdict_from_p_values() {
        let results: Vec<TestResult> = [0.001, 0.012, 0.03, 0.09]
            .into_iter()
            .enumerate()
            .map(|(i, p)| TestResult::new(format!("metric {i}"), 0.01, p, 0.05))
            .collect();

        let suite = TestSuiteResult::from_results(&results, 0.05, &Bonferroni).unwrap();
        assert_eq!(
            suite.entries.iter().map(|e| e.reject_null).collect_vec(),
            vec![true, true, false, false]
        );
        for entry in &suite.entries {
            assert_relative_eq!(entry.corrected_alpha, 0.0125);
        }
        assert_relative_eq!(suite.entries[1].adjusted_p_value, 0.048, epsilon = 1e-12);

        let holm =
            TestSuiteResult::from_results(&results, 0.05, Correction::Holm.policy()).unwrap();
        assert_eq!(holm.correction, "holm");
        assert_eq!(
            holm.entries.iter().map(|e| e.reject_null).collect_vec(),
            vec![true, true, false, false]
        );
    }
}
