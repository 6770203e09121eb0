//! Lifecycle state of a task document.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state derived from a document's timestamp fields.
///
/// State transitions:
/// - Pending -> Queued (dispatcher)
/// - Queued -> Started (task runner, on the cluster node)
/// - Started -> Completed (task runner)
/// - any -> Pending (recovery tool strips the timestamps)
///
/// The stored document never carries this value; it is recomputed from which
/// of `queued`, `started`, `completed` are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// None of the lifecycle timestamps is set.
    Pending,

    /// Submitted to the cluster, no worker has picked it up yet.
    Queued,

    /// A worker started it and has not recorded completion.
    Started,

    /// Results are recorded.
    Completed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 4] = [
        LifecycleState::Pending,
        LifecycleState::Queued,
        LifecycleState::Started,
        LifecycleState::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Queued => "queued",
            LifecycleState::Started => "started",
            LifecycleState::Completed => "completed",
        }
    }

    /// Is this document eligible for dispatch?
    pub fn is_dispatchable(self) -> bool {
        matches!(self, LifecycleState::Pending)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lifecycle state '{0}' (expected pending, queued, started or completed)")]
pub struct UnknownState(pub String);

impl FromStr for LifecycleState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pending("pending", LifecycleState::Pending)]
    #[case::queued("queued", LifecycleState::Queued)]
    #[case::started("Started", LifecycleState::Started)]
    #[case::completed(" completed ", LifecycleState::Completed)]
    fn parses_state_names(#[case] input: &str, #[case] expected: LifecycleState) {
        assert_eq!(input.parse::<LifecycleState>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_names() {
        let err = "running".parse::<LifecycleState>().unwrap_err();
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn only_pending_is_dispatchable() {
        let dispatchable: Vec<_> = LifecycleState::ALL
            .into_iter()
            .filter(|s| s.is_dispatchable())
            .collect();
        assert_eq!(dispatchable, vec![LifecycleState::Pending]);
    }
}
