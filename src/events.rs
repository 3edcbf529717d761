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

//! The raw action log of an experiment.
//!
//! Parsing the log (CSV or otherwise) is left to the caller: [`Event`] derives
//! `serde::Deserialize` with the columns `timestamp`, `id`, `group`, `action`,
//! `duration`, `total_days` and `completed`. `timestamp` must already be an integer
//! (e.g. unix seconds): logs recording datetime strings need converting on load.
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Side of the experiment a user was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    /// Users exposed to the current version
    Control,
    /// Users exposed to the new version
    Experiment,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Control => write!(f, "control"),
            Group::Experiment => write!(f, "experiment"),
        }
    }
}

impl FromStr for Group {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Group::Control),
            "experiment" => Ok(Group::Experiment),
            other => Err(Error::Schema {
                field: Field::Group,
                reason: format!("unknown group `{other}`"),
            }),
        }
    }
}

/// What a user did.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Page view
    View,
    /// Click on the tracked button
    Click,
    /// Enrollment in a course
    Enroll,
    /// Course completion
    Complete,
    /// Any other action recorded by the dataset
    Other(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::View => write!(f, "view"),
            Action::Click => write!(f, "click"),
            Action::Enroll => write!(f, "enroll"),
            Action::Complete => write!(f, "complete"),
            Action::Other(s) => write!(f, "{s}"),
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match s.as_str() {
            "view" => Action::View,
            "click" => Action::Click,
            "enroll" => Action::Enroll,
            "complete" => Action::Complete,
            _ => Action::Other(s),
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Action::from(s.to_string())
    }
}

impl From<Action> for String {
    fn from(a: Action) -> Self {
        a.to_string()
    }
}

/// Columns of the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// `timestamp`
    Timestamp,
    /// `id`
    UserId,
    /// `group`
    Group,
    /// `action`
    Action,
    /// `duration` - seconds spent on a page
    Duration,
    /// `total_days` - days spent in the classroom
    TotalDays,
    /// `completed` - whether the course was completed
    Completed,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Timestamp => "timestamp",
            Field::UserId => "id",
            Field::Group => "group",
            Field::Action => "action",
            Field::Duration => "duration",
            Field::TotalDays => "total_days",
            Field::Completed => "completed",
        };
        write!(f, "{name}")
    }
}

impl Field {
    /// Numeric value of this field for `event`, booleans read as 0 or 1.
    ///
    /// Only the optional fields have a value; the identifying columns return `None`.
    pub fn value(&self, event: &Event) -> Option<f64> {
        match self {
            Field::Duration => event.duration,
            Field::TotalDays => event.total_days,
            Field::Completed => event.completed.map(|c| if c { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// One recorded user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier of the user
    #[serde(rename = "id")]
    pub user_id: u64,
    /// Group the user belongs to
    pub group: Group,
    /// What the user did
    pub action: Action,
    /// When it happened, as an integer - any monotonic encoding works (e.g. unix
    /// seconds). Datetime strings are not parsed.
    pub timestamp: i64,
    /// Seconds spent on the page
    #[serde(default)]
    pub duration: Option<f64>,
    /// Days spent in the classroom
    #[serde(default)]
    pub total_days: Option<f64>,
    /// Whether the course was completed
    #[serde(default)]
    pub completed: Option<bool>,
}

impl Event {
    /// An event with no optional field.
    pub fn new(user_id: u64, group: Group, action: Action, timestamp: i64) -> Self {
        Self {
            user_id,
            group,
            action,
            timestamp,
            duration: None,
            total_days: None,
            completed: None,
        }
    }

    /// Sets the `duration` field.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the `total_days` field.
    pub fn with_total_days(mut self, total_days: f64) -> Self {
        self.total_days = Some(total_days);
        self
    }

    /// Sets the `completed` field.
    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }
}

/// Basic statistics about an experiment log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentSummary {
    /// Earliest timestamp
    pub first_timestamp: i64,
    /// Latest timestamp
    pub last_timestamp: i64,
    /// Number of rows
    pub total_actions: usize,
    /// Number of distinct users
    pub unique_users: usize,
    /// Number of distinct users in the control group
    pub control_users: usize,
    /// Number of distinct users in the experiment group
    pub experiment_users: usize,
    /// Distinct actions, in order of first appearance
    pub actions: Vec<Action>,
}

/// Immutable, ordered log of the events of one experiment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    events: Vec<Event>,
}

impl EventTable {
    /// Wraps already validated events.
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    /// Builds a table from parsed rows, checking that every field in `required` is
    /// populated in at least one row and that every populated numeric value is finite.
    ///
    /// Optional fields are legitimately missing on some rows (e.g. `duration` is only
    /// recorded for views), so a field only counts as absent when no row carries it.
    pub fn load(rows: impl IntoIterator<Item = Event>, required: &[Field]) -> Result<Self, Error> {
        let events: Vec<Event> = rows.into_iter().collect();

        for event in &events {
            for (field, value) in [
                (Field::Duration, event.duration),
                (Field::TotalDays, event.total_days),
            ] {
                if let Some(v) = value {
                    if !v.is_finite() {
                        return Err(Error::Schema {
                            field,
                            reason: format!("non-finite value {v} for user {}", event.user_id),
                        });
                    }
                }
            }
        }

        let table = Self { events };
        table.ensure_fields(required)?;
        Ok(table)
    }

    /// Fails with [`Error::Schema`] on the first field of `required` that no row carries.
    pub fn ensure_fields(&self, required: &[Field]) -> Result<(), Error> {
        for field in required {
            if !self.events.iter().any(|e| field.value(e).is_some()) {
                return Err(Error::Schema {
                    field: *field,
                    reason: "absent from every row".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The rows, in their original order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Iterator over the rows.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    /// A new table with the rows matching `predicate`, in the same relative order.
    pub fn filter(&self, predicate: impl Fn(&Event) -> bool) -> EventTable {
        EventTable {
            events: self.events.iter().filter(|&e| predicate(e)).cloned().collect(),
        }
    }

    /// Number of distinct users among the rows matching `predicate`.
    pub fn unique_users(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        unique_users(self.events.iter(), predicate)
    }

    /// Basic statistics about the log - `None` for an empty table.
    pub fn summary(&self) -> Option<ExperimentSummary> {
        let first_timestamp = self.events.iter().map(|e| e.timestamp).min()?;
        let last_timestamp = self.events.iter().map(|e| e.timestamp).max()?;

        let mut actions: Vec<Action> = Vec::new();
        for event in &self.events {
            if !actions.contains(&event.action) {
                actions.push(event.action.clone());
            }
        }

        Some(ExperimentSummary {
            first_timestamp,
            last_timestamp,
            total_actions: self.events.len(),
            unique_users: self.unique_users(|_| true),
            control_users: self.unique_users(|e| e.group == Group::Control),
            experiment_users: self.unique_users(|e| e.group == Group::Experiment),
            actions,
        })
    }
}

impl<'a> IntoIterator for &'a EventTable {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Number of distinct users among `events` matching `predicate`.
pub(crate) fn unique_users<'a>(
    events: impl Iterator<Item = &'a Event>,
    predicate: impl Fn(&Event) -> bool,
) -> usize {
    events
        .filter(|&e| predicate(e))
        .map(|e| e.user_id)
        .collect::<HashSet<_>>()
        .len()
}
