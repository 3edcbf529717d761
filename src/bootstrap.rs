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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::events::{Event, EventTable};
use crate::metric::MetricExtractor;
use crate::utils;
use crate::Error;

/// Number of bootstrap repetitions used unless told otherwise - seems that 10_000 is the
/// norm.
pub const DEFAULT_ITERATIONS: usize = 10_000;

/// Cooperative cancellation flag, checked between two bootstrap iterations.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not cancelled yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Bootstrapped differences `metric(experiment) - metric(control)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingDistribution {
    values: Vec<f64>,
}

impl SamplingDistribution {
    /// The differences, in the order they were drawn.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of differences.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there is no difference at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of the differences.
    pub fn mean(&self) -> Result<f64, Error> {
        utils::mean(&self.values)
    }

    /// Spread of the differences (population standard deviation).
    pub fn std_dev(&self) -> Result<f64, Error> {
        utils::std_dev(&self.values)
    }

    /// Takes the differences out.
    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

impl From<Vec<f64>> for SamplingDistribution {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

/// Draw `rep` bootstrap samples of `table` and compute the difference of `metric` between
/// the experiment and the control group of each of them.
///
/// # Description
///
/// Each bootstrap sample has as many rows as `table`, each drawn independently and
/// uniformly with replacement from the rows of `table`. Both groups come from the same
/// draw, so the group sizes vary from one sample to the other as they would across
/// repetitions of the experiment.
///
/// The rows are drawn from [`MetricExtractor::resampling_table`], so a metric counting
/// each user once is deduplicated before resampling and not within each sample.
///
/// Any error from `metric` aborts the whole run: a sample where the metric is undefined
/// means the data is too sparse, dropping it would bias the distribution.
///
/// # Example
///
/// ```rust
/// use bootstrap_ab::prelude::*;
/// use rand::SeedableRng;
/// use rand::rngs::StdRng;
///
/// let table = EventTable::new(vec![
///     Event::new(1, Group::Control, Action::View, 0).with_duration(12.0),
///     Event::new(2, Group::Control, Action::View, 1).with_duration(18.0),
///     Event::new(3, Group::Experiment, Action::View, 2).with_duration(25.0),
///     Event::new(4, Group::Experiment, Action::View, 3).with_duration(31.0),
/// ]);
/// let metric = MetricDefinition::mean_of(NumericField::Duration);
///
/// let mut rng = StdRng::seed_from_u64(42);
/// let diffs = bootstrap_ab::bootstrap::bootstrap_differences(&mut rng, &table, &metric, 100, None);
/// // with 4 rows some draws miss a group entirely
/// assert!(matches!(diffs, Err(Error::DivisionUndefined { .. })));
/// ```
pub fn bootstrap_differences<R: Rng + ?Sized, M: MetricExtractor + ?Sized>(
    rng: &mut R,
    table: &EventTable,
    metric: &M,
    rep: usize,
    cancel: Option<&CancellationToken>,
) -> Result<Vec<f64>, Error> {
    if rep == 0 {
        return Err(Error::InvalidConfig(
            "the number of bootstrap iterations must be at least 1".to_string(),
        ));
    }
    let table = metric.resampling_table(table);
    if table.is_empty() {
        return Err(Error::InsufficientSamples);
    }

    resample(rng, table.events(), metric, rep, || is_cancelled(cancel))
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.map_or(false, CancellationToken::is_cancelled)
}

/// `rep` bootstrap differences over `events`, which must not be empty.
fn resample<R: Rng + ?Sized, M: MetricExtractor + ?Sized>(
    rng: &mut R,
    events: &[Event],
    metric: &M,
    rep: usize,
    stop: impl Fn() -> bool,
) -> Result<Vec<f64>, Error> {
    let n = events.len();
    let mut diffs = Vec::with_capacity(rep);

    let mut sample: Vec<&Event> = vec![&events[0]; n];

    for _ in 0..rep {
        if stop() {
            return Err(Error::Cancelled);
        }

        for s in sample.iter_mut() {
            *s = &events[rng.gen_range(0..n)];
        }

        diffs.push(metric.difference_resampled(&sample)?);
    }

    Ok(diffs)
}

/// Builds the sampling distribution of a metric difference.
///
/// With more than one worker, the iterations are split in contiguous chunks run on the
/// rayon thread pool. Each worker gets its own generator seeded from the caller's, so the
/// result only depends on the caller's generator and the number of workers. The first
/// worker to fail stops the others.
#[derive(Debug, Clone)]
pub struct Resampler {
    iterations: usize,
    workers: usize,
    cancel: Option<CancellationToken>,
}

impl Default for Resampler {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            workers: 1,
            cancel: None,
        }
    }
}

impl Resampler {
    /// A single-threaded resampler doing `iterations` repetitions.
    pub fn new(iterations: usize) -> Result<Self, Error> {
        if iterations == 0 {
            return Err(Error::InvalidConfig(
                "the number of bootstrap iterations must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            iterations,
            ..Self::default()
        })
    }

    /// Splits the iterations in `workers` independently seeded chunks.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, Error> {
        if workers == 0 {
            return Err(Error::InvalidConfig(
                "the number of workers must be at least 1".to_string(),
            ));
        }
        self.workers = workers;
        Ok(self)
    }

    /// Stops with [`Error::Cancelled`] once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Number of repetitions.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Number of chunks the iterations are split in.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Sampling distribution of `metric(experiment) - metric(control)` over `table`.
    pub fn sample<R: Rng + ?Sized, M: MetricExtractor + Sync + ?Sized>(
        &self,
        rng: &mut R,
        table: &EventTable,
        metric: &M,
    ) -> Result<SamplingDistribution, Error> {
        let table = metric.resampling_table(table);
        if table.is_empty() {
            return Err(Error::InsufficientSamples);
        }

        let workers = self.workers.min(self.iterations);
        let cancel = self.cancel.as_ref();
        let events = table.events();

        debug!(
            iterations = self.iterations,
            rows = events.len(),
            workers,
            "bootstrap resampling"
        );

        if workers == 1 {
            let values = resample(rng, events, metric, self.iterations, || {
                is_cancelled(cancel)
            })?;
            return Ok(SamplingDistribution { values });
        }

        let seeds: Vec<u64> = (0..workers).map(|_| rng.gen()).collect();
        let chunks = chunk_sizes(self.iterations, workers);
        // set by the first failing worker
        let abort = CancellationToken::new();

        let partials: Vec<Result<Vec<f64>, Error>> = seeds
            .into_par_iter()
            .zip(chunks)
            .enumerate()
            .map(|(worker, (seed, rep))| {
                debug!(worker, rep, "bootstrap worker started");
                let mut rng = StdRng::seed_from_u64(seed);
                let partial = resample(&mut rng, events, metric, rep, || {
                    abort.is_cancelled() || is_cancelled(cancel)
                });
                if partial.is_err() {
                    abort.cancel();
                }
                partial
            })
            .collect();

        let mut values = Vec::with_capacity(self.iterations);
        let mut cancelled = false;
        for partial in partials {
            match partial {
                Ok(partial) => values.extend(partial),
                Err(Error::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }
        if cancelled {
            return Err(Error::Cancelled);
        }

        Ok(SamplingDistribution { values })
    }
}

/// Splits `total` in `parts` contiguous chunks whose sizes differ by at most one.
fn chunk_sizes(total: usize, parts: usize) -> Vec<usize> {
    let base = total / parts;
    let extra = total % parts;
    (0..parts).map(|i| base + usize::from(i < extra)).collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::events::{Action, Group};
    use crate::metric::{BooleanField, MetricDefinition, NumericField};

    fn durations() -> EventTable {
        let mut events = Vec::new();
        for i in 0..100u64 {
            events.push(
                Event::new(i, Group::Control, Action::View, i as i64).with_duration(10.0 + (i % 7) as f64),
            );
            events.push(
                Event::new(1_000 + i, Group::Experiment, Action::View, i as i64)
                    .with_duration(12.0 + (i % 5) as f64),
            );
        }
        EventTable::new(events)
    }

    #[test]
    fn test_sample_size() {
        let table = durations();
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        for n in [1, 2, 17, 500] {
            let dist = Resampler::new(n)
                .unwrap()
                .sample(&mut rng, &table, &metric)
                .unwrap();
            assert_eq!(dist.len(), n);
        }
    }

    #[test]
    fn test_zero_iterations() {
        assert!(matches!(Resampler::new(0), Err(Error::InvalidConfig(_))));

        let table = durations();
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        assert!(matches!(
            bootstrap_differences(&mut rng, &table, &metric, 0, None),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Resampler::default().with_workers(0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_empty_table() {
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        assert_eq!(
            Resampler::new(10)
                .unwrap()
                .sample(&mut rng, &EventTable::default(), &metric),
            Err(Error::InsufficientSamples)
        );
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let table = durations();
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let resampler = Resampler::new(1_000).unwrap();

        let a = resampler
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
            .unwrap();
        let b = resampler
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
            .unwrap();
        assert_eq!(a, b);

        let c = resampler
            .sample(&mut ChaCha8Rng::seed_from_u64(43), &table, &metric)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_parallel() {
        let table = durations();
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let resampler = Resampler::new(2_003).unwrap().with_workers(4).unwrap();

        let a = resampler
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
            .unwrap();
        let b = resampler
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
            .unwrap();
        assert_eq!(a.len(), 2_003);
        assert_eq!(a, b);

        // same spread as the single threaded run, up to sampling noise
        let single = Resampler::new(2_003)
            .unwrap()
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
            .unwrap();
        assert_relative_eq!(
            a.std_dev().unwrap(),
            single.std_dev().unwrap(),
            max_relative = 0.1
        );

        // more workers than iterations
        let tiny = Resampler::new(3).unwrap().with_workers(8).unwrap();
        assert_eq!(
            tiny.sample(&mut ChaCha8Rng::seed_from_u64(1), &table, &metric)
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn test_sampling_distribution_is_centered_on_observed_difference() {
        let table = durations();
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let observed = metric.observed_difference(&table).unwrap();

        let dist = Resampler::new(5_000)
            .unwrap()
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
            .unwrap();
        assert_relative_eq!(dist.mean().unwrap(), observed, epsilon = 0.1);
    }

    #[test]
    fn test_sparse_data_aborts() {
        // a single experiment row: most samples have no experiment view
        let mut events = vec![Event::new(1, Group::Experiment, Action::View, 0)];
        for i in 0..50 {
            events.push(Event::new(100 + i, Group::Control, Action::View, 0));
        }
        let table = EventTable::new(events);
        let ctr = MetricDefinition::ratio_of_uniques(Action::Click, Action::View);

        let err = Resampler::new(1_000)
            .unwrap()
            .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &ctr)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DivisionUndefined {
                group: Group::Experiment,
                ..
            }
        ));
    }

    #[test]
    fn test_sparse_data_aborts_every_worker() {
        let mut events = vec![Event::new(1, Group::Experiment, Action::View, 0)];
        for i in 0..50 {
            events.push(Event::new(100 + i, Group::Control, Action::View, 0));
        }
        let table = EventTable::new(events);
        let ctr = MetricDefinition::ratio_of_uniques(Action::Click, Action::View);

        for workers in [2, 4] {
            let err = Resampler::new(1_000)
                .unwrap()
                .with_workers(workers)
                .unwrap()
                .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &ctr)
                .unwrap_err();
            assert!(err.is_data_error(), "{err}");
        }
    }

    fn completions(control: usize, experiment: usize, with_history: bool) -> EventTable {
        let mut events = Vec::new();
        for (group, completed, offset) in [
            (Group::Control, control, 0),
            (Group::Experiment, experiment, 1_000),
        ] {
            for i in 0..200 {
                let user = offset + i as u64;
                if with_history {
                    events.push(Event::new(user, group, Action::Enroll, 1).with_completed(false));
                }
                events.push(Event::new(user, group, Action::Enroll, 2).with_completed(i < completed));
            }
        }
        EventTable::new(events)
    }

    #[test]
    fn test_proportion_spread_matches_binomial() {
        // 60/200 vs 64/200 completed
        let (p_c, p_e): (f64, f64) = (0.3, 0.32);
        let analytic = (p_c * (1. - p_c) / 200. + p_e * (1. - p_e) / 200.).sqrt();
        let metric = MetricDefinition::proportion(BooleanField::Completed);

        for with_history in [false, true] {
            let table = completions(60, 64, with_history);
            assert_relative_eq!(metric.observed_difference(&table).unwrap(), 0.02, epsilon = 1e-12);

            for workers in [1, 4] {
                let dist = Resampler::new(10_000)
                    .unwrap()
                    .with_workers(workers)
                    .unwrap()
                    .sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric)
                    .unwrap();
                assert_relative_eq!(dist.std_dev().unwrap(), analytic, max_relative = 0.05);
                assert_relative_eq!(dist.mean().unwrap(), 0.02, epsilon = 0.005);
            }
        }
    }

    #[test]
    fn test_cancellation() {
        let table = durations();
        let metric = MetricDefinition::mean_of(NumericField::Duration);
        let token = CancellationToken::new();
        token.cancel();

        for workers in [1, 3] {
            let resampler = Resampler::new(100)
                .unwrap()
                .with_workers(workers)
                .unwrap()
                .with_cancellation(token.clone());
            assert_eq!(
                resampler.sample(&mut ChaCha8Rng::seed_from_u64(42), &table, &metric),
                Err(Error::Cancelled)
            );
        }
    }

    #[test]
    fn test_chunk_sizes() {
        assert_eq!(chunk_sizes(10, 3), vec![4, 3, 3]);
        assert_eq!(chunk_sizes(9, 3), vec![3, 3, 3]);
        assert_eq!(chunk_sizes(3, 3), vec![1, 1, 1]);
    }
}
