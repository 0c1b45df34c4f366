//! Run state: the recoverable projection of a streaming session.

use serde::{Deserialize, Serialize};

/// A Run's lifecycle phase. `idle` is the implicit initial state;
/// `done`/`error`/`evicted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No run has started yet, or a prior run's terminal frame already
    /// shipped and a new `begin` hasn't arrived.
    Idle,
    /// An adapter is actively streaming.
    Running,
    /// The adapter returned normally, or the client issued `stop`.
    Done,
    /// The adapter failed, or the run timed out.
    Error,
    /// Reserved terminal state for externally-induced termination; no
    /// internal transition sets it. Treated identically to `error` by clients.
    Evicted,
}

impl Phase {
    /// `done`, `error`, and `evicted` are all terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Evicted)
    }
}

/// The recoverable projection of a Run, persisted to the KV store under
/// `run:<rid>`. Excludes transient buffers, timers, sockets, and the
/// cancellation controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Run identifier.
    pub rid: String,
    /// Last assigned delta `seq`, or `-1` if none yet.
    pub seq: i64,
    /// Current phase.
    pub phase: Phase,
    /// Failure reason, set only when `phase` is `error` or `evicted`.
    pub error: Option<String>,
    /// Wall-clock millisecond timestamp when `phase` entered `running`.
    pub started_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_done_error_evicted_are_terminal() {
        assert!(!Phase::Idle.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(Phase::Done.is_terminal());
        assert!(Phase::Error.is_terminal());
        assert!(Phase::Evicted.is_terminal());
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = Snapshot {
            rid: "r1".to_string(),
            seq: 3,
            phase: Phase::Running,
            error: None,
            started_at: Some(1_700_000_000_000),
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["phase"], "running");

        let restored: Snapshot = serde_json::from_value(value).unwrap();
        assert_eq!(restored.seq, 3);
    }
}
