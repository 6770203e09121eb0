//! Task document: the unit of work and its lifecycle history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::ids::{Revision, TaskId};
use super::results::TaskResults;
use super::state::LifecycleState;

/// A persisted task document.
///
/// Lifecycle stages are recorded as optional timestamps; an absent field means
/// the stage has not happened. Unknown fields written by other tools (the web
/// UI, attachment stubs) are carried in `extra` so a read-modify-write never
/// drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(rename = "_id")]
    pub id: TaskId,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    /// Which task body to run.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub kwargs: Map<String, Value>,

    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "epoch_seconds::option"
    )]
    pub created: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "epoch_seconds::option"
    )]
    pub queued: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "epoch_seconds::option"
    )]
    pub started: Option<DateTime<Utc>>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "epoch_seconds::option"
    )]
    pub completed: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<TaskResults>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("task {id} is {state}, not pending")]
    NotPending { id: TaskId, state: LifecycleState },
}

impl TaskDocument {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            name: name.into(),
            kwargs: Map::new(),
            requires: Vec::new(),
            created: None,
            queued: None,
            started: None,
            completed: None,
            node: None,
            results: None,
            extra: Map::new(),
        }
    }

    pub fn requiring<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created = Some(at);
        self
    }

    /// Derived lifecycle state. The latest recorded stage wins.
    pub fn state(&self) -> LifecycleState {
        if self.completed.is_some() {
            LifecycleState::Completed
        } else if self.started.is_some() {
            LifecycleState::Started
        } else if self.queued.is_some() {
            LifecycleState::Queued
        } else {
            LifecycleState::Pending
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == LifecycleState::Pending
    }

    /// Pending -> Queued. Refuses anything that is not pending.
    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let state = self.state();
        if !state.is_dispatchable() {
            return Err(TransitionError::NotPending {
                id: self.id.clone(),
                state,
            });
        }
        self.queued = Some(now);
        Ok(())
    }

    /// Record that `node` started executing the task. A previous attempt's
    /// node is overwritten.
    pub fn mark_started(&mut self, now: DateTime<Utc>, node: impl Into<String>) {
        self.started = Some(now);
        self.node = Some(node.into());
    }

    /// Record the final results. Previous results are replaced, not merged.
    pub fn complete(&mut self, now: DateTime<Utc>, results: TaskResults) {
        self.results = Some(results);
        self.completed = Some(now);
    }

    /// Strip the lifecycle timestamps so the document is pending again.
    ///
    /// `results`, `node` and attachments stay as a record of the previous
    /// attempt. Returns `false` when there was nothing to strip.
    pub fn reset(&mut self) -> bool {
        let changed = self.queued.is_some() || self.started.is_some() || self.completed.is_some();
        self.queued = None;
        self.started = None;
        self.completed = None;
        changed
    }
}

/// Timestamps are stored as (fractional) seconds since the Unix epoch.
pub mod epoch_seconds {
    use chrono::{DateTime, Utc};

    pub fn to_seconds(at: &DateTime<Utc>) -> f64 {
        at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
    }

    pub fn from_seconds(seconds: f64) -> Option<DateTime<Utc>> {
        if !seconds.is_finite() {
            return None;
        }
        let whole = seconds.floor();
        let micros = ((seconds - whole) * 1_000_000.0).round() as u32;
        let (whole, micros) = if micros >= 1_000_000 {
            (whole + 1.0, 0)
        } else {
            (whole, micros)
        };
        DateTime::from_timestamp(whole as i64, micros * 1_000)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(at) => serializer.serialize_f64(super::to_seconds(at)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<f64>::deserialize(deserializer)? {
                Some(seconds) => super::from_seconds(seconds)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {seconds}"))),
                None => Ok(None),
            }
        }
    }
}
