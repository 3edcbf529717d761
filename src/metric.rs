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

//! Metrics: how the events of one group reduce to a single number.
use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{unique_users, Action, Event, EventTable, Field, Group};
use crate::Error;

/// Numeric columns a metric can average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericField {
    /// `duration`
    Duration,
    /// `total_days`
    TotalDays,
}

impl From<NumericField> for Field {
    fn from(f: NumericField) -> Self {
        match f {
            NumericField::Duration => Field::Duration,
            NumericField::TotalDays => Field::TotalDays,
        }
    }
}

/// Boolean columns a metric can take the proportion of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BooleanField {
    /// `completed`
    Completed,
}

impl From<BooleanField> for Field {
    fn from(f: BooleanField) -> Self {
        match f {
            BooleanField::Completed => Field::Completed,
        }
    }
}

/// How rows of the same user are counted by a proportion metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dedup {
    /// One value per user: the latest record by timestamp (later row wins ties)
    #[default]
    LatestPerUser,
    /// Every row counts
    AllRows,
}

/// How to reduce the events of a group to one scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricDefinition {
    /// `#unique users with action numerator / #unique users with action denominator`
    /// (click through rate, enrollment rate, ...)
    RatioOfUniques {
        /// Target action, e.g. `click`
        numerator: Action,
        /// Baseline action, e.g. `view`
        denominator: Action,
    },
    /// Mean of a numeric field over the rows where it is present, optionally only for
    /// one action.
    MeanOfField {
        /// Field to average
        field: NumericField,
        /// Only rows with this action
        action: Option<Action>,
    },
    /// Proportion of `true` of a boolean field.
    Proportion {
        /// Field to average
        field: BooleanField,
        /// Only rows with this action
        action: Option<Action>,
        /// How repeated users are counted
        dedup: Dedup,
    },
}

impl MetricDefinition {
    /// Click-through style metric.
    pub fn ratio_of_uniques(numerator: Action, denominator: Action) -> Self {
        MetricDefinition::RatioOfUniques {
            numerator,
            denominator,
        }
    }

    /// Mean of `field` over all the rows of a group.
    pub fn mean_of(field: NumericField) -> Self {
        MetricDefinition::MeanOfField {
            field,
            action: None,
        }
    }

    /// Mean of `field` over the rows of a group with the given `action`.
    pub fn mean_of_action(field: NumericField, action: Action) -> Self {
        MetricDefinition::MeanOfField {
            field,
            action: Some(action),
        }
    }

    /// Proportion of users for which `field` is true.
    pub fn proportion(field: BooleanField) -> Self {
        MetricDefinition::Proportion {
            field,
            action: None,
            dedup: Dedup::default(),
        }
    }
}

/// Computes a scalar statistic for one group out of a set of rows.
///
/// [`MetricDefinition`] covers the usual A/B metrics; implement this trait for anything
/// else. Implementations must be deterministic and must fail with
/// [`Error::DivisionUndefined`] rather than return NaN when the rows do not define the
/// metric.
pub trait MetricExtractor {
    /// The statistic for `group` over `rows`.
    ///
    /// `rows` holds both groups; the implementation selects the rows of `group`.
    fn extract_rows(&self, rows: &[&Event], group: Group) -> Result<f64, Error>;

    /// Optional fields the metric reads.
    fn required_fields(&self) -> Vec<Field> {
        Vec::new()
    }

    /// The statistic for `group` over the whole `table`.
    fn extract(&self, table: &EventTable, group: Group) -> Result<f64, Error> {
        let rows: Vec<&Event> = table.iter().collect();
        self.extract_rows(&rows, group)
    }

    /// `metric(experiment) - metric(control)` over `rows`.
    fn difference_rows(&self, rows: &[&Event]) -> Result<f64, Error> {
        let experiment = self.extract_rows(rows, Group::Experiment)?;
        let control = self.extract_rows(rows, Group::Control)?;
        Ok(experiment - control)
    }

    /// `metric(experiment) - metric(control)` over the whole `table`.
    fn observed_difference(&self, table: &EventTable) -> Result<f64, Error> {
        let rows: Vec<&Event> = table.iter().collect();
        self.difference_rows(&rows)
    }

    /// The rows the bootstrap draws from.
    ///
    /// A metric counting each user once reduces the table here, before resampling: a user
    /// drawn twice in a bootstrap sample must weigh twice.
    fn resampling_table<'t>(&self, table: &'t EventTable) -> Cow<'t, EventTable> {
        Cow::Borrowed(table)
    }

    /// `metric(experiment) - metric(control)` over a bootstrap sample of
    /// [`MetricExtractor::resampling_table`].
    fn difference_resampled(&self, rows: &[&Event]) -> Result<f64, Error> {
        self.difference_rows(rows)
    }
}

impl MetricExtractor for MetricDefinition {
    fn extract_rows(&self, rows: &[&Event], group: Group) -> Result<f64, Error> {
        match self {
            MetricDefinition::RatioOfUniques {
                numerator,
                denominator,
            } => {
                let den = unique_users(rows.iter().copied(), |e| {
                    e.group == group && e.action == *denominator
                });
                if den == 0 {
                    return Err(Error::DivisionUndefined {
                        group,
                        detail: format!("no user with action `{denominator}`"),
                    });
                }
                let num = unique_users(rows.iter().copied(), |e| {
                    e.group == group && e.action == *numerator
                });

                Ok(num as f64 / den as f64)
            }
            MetricDefinition::MeanOfField { field, action } => {
                let field = Field::from(*field);
                let values = rows
                    .iter()
                    .filter(|e| selected(e, group, action.as_ref()))
                    .filter_map(|e| field.value(e));

                mean_of_values(values, group, field)
            }
            MetricDefinition::Proportion {
                field,
                action,
                dedup,
            } => {
                let field = Field::from(*field);
                let rows = rows.iter().filter(|e| selected(e, group, action.as_ref()));

                match dedup {
                    Dedup::AllRows => mean_of_values(rows.filter_map(|e| field.value(e)), group, field),
                    Dedup::LatestPerUser => {
                        let latest = latest_records(rows.copied(), field);
                        mean_of_values(latest.iter().filter_map(|e| field.value(e)), group, field)
                    }
                }
            }
        }
    }

    fn required_fields(&self) -> Vec<Field> {
        match self {
            MetricDefinition::RatioOfUniques { .. } => Vec::new(),
            MetricDefinition::MeanOfField { field, .. } => vec![(*field).into()],
            MetricDefinition::Proportion { field, .. } => vec![(*field).into()],
        }
    }

    fn resampling_table<'t>(&self, table: &'t EventTable) -> Cow<'t, EventTable> {
        match self {
            MetricDefinition::Proportion {
                field,
                action,
                dedup: Dedup::LatestPerUser,
            } => {
                let rows = table
                    .iter()
                    .filter(|e| action.as_ref().map_or(true, |a| e.action == *a));
                let latest = latest_records(rows, Field::from(*field));
                Cow::Owned(EventTable::new(latest.into_iter().cloned().collect()))
            }
            _ => Cow::Borrowed(table),
        }
    }

    fn difference_resampled(&self, rows: &[&Event]) -> Result<f64, Error> {
        match self {
            // the table is already down to one record per user
            MetricDefinition::Proportion {
                field,
                action,
                dedup: Dedup::LatestPerUser,
            } => MetricDefinition::Proportion {
                field: *field,
                action: action.clone(),
                dedup: Dedup::AllRows,
            }
            .difference_rows(rows),
            _ => self.difference_rows(rows),
        }
    }
}

fn selected(e: &Event, group: Group, action: Option<&Action>) -> bool {
    e.group == group && action.map_or(true, |a| e.action == *a)
}

/// The latest row of each user carrying `field`, by timestamp; a later row wins ties.
fn latest_records<'e>(rows: impl Iterator<Item = &'e Event>, field: Field) -> Vec<&'e Event> {
    let mut latest: BTreeMap<(u64, bool), &Event> = BTreeMap::new();
    for e in rows.filter(|e| field.value(e).is_some()) {
        let entry = latest
            .entry((e.user_id, e.group == Group::Experiment))
            .or_insert(e);
        if e.timestamp >= entry.timestamp {
            *entry = e;
        }
    }

    latest.into_values().collect()
}

fn mean_of_values(
    values: impl Iterator<Item = f64>,
    group: Group,
    field: Field,
) -> Result<f64, Error> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        return Err(Error::DivisionUndefined {
            group,
            detail: format!("no row with field `{field}`"),
        });
    }

    Ok(sum / count as f64)
}
