//! Persisted per-run state machines.
//!
//! A run's state is never held only in memory: every transition is appended
//! to the store, and the current state is the latest transition. After a crash
//! the last persisted state tells whether to resume or fail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunKind {
  Snapshot,
  Evaluation,
}

/// States of both state machines.
///
/// Snapshot: `Pending → Ingesting → Hashing → Committed | Failed`.
/// Evaluation: `Scheduled → Replaying → Scored | InsufficientData | Failed`.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
  Pending,
  Ingesting,
  Hashing,
  Committed,
  Scheduled,
  Replaying,
  Scored,
  InsufficientData,
  Failed,
}

impl RunState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      Self::Committed | Self::Scored | Self::InsufficientData | Self::Failed
    )
  }

  /// The entry state for a run of `kind`.
  pub fn initial(kind: RunKind) -> Self {
    match kind {
      RunKind::Snapshot => Self::Pending,
      RunKind::Evaluation => Self::Scheduled,
    }
  }

  /// Whether `self → next` is a legal edge for `kind`.
  pub fn can_advance(self, kind: RunKind, next: RunState) -> bool {
    use RunState::*;
    match kind {
      RunKind::Snapshot => matches!(
        (self, next),
        (Pending, Ingesting)
          | (Ingesting, Hashing)
          | (Hashing, Committed)
          | (Pending | Ingesting | Hashing, Failed)
      ),
      RunKind::Evaluation => matches!(
        (self, next),
        (Scheduled, Replaying)
          | (Replaying, Scored | InsufficientData)
          | (Scheduled | Replaying, Failed)
      ),
    }
  }
}

/// One appended state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTransition {
  pub run_id: Uuid,
  pub kind:   RunKind,
  pub state:  RunState,
  pub detail: Option<String>,
  pub at:     DateTime<Utc>,
}

/// In-process handle over a run's state; every advance is also persisted by
/// the caller through [`crate::store::LabStore::record_transition`].
#[derive(Debug, Clone)]
pub struct RunTracker {
  pub run_id: Uuid,
  pub kind:   RunKind,
  state:      RunState,
}

impl RunTracker {
  pub fn new(run_id: Uuid, kind: RunKind) -> Self {
    Self { run_id, kind, state: RunState::initial(kind) }
  }

  pub fn state(&self) -> RunState { self.state }

  /// The transition that opens the run.
  pub fn opening(&self, at: DateTime<Utc>) -> RunTransition {
    RunTransition {
      run_id: self.run_id,
      kind: self.kind,
      state: self.state,
      detail: None,
      at,
    }
  }

  /// Move to `next`, returning the transition to persist.
  pub fn advance(
    &mut self,
    next: RunState,
    detail: Option<String>,
    at: DateTime<Utc>,
  ) -> Result<RunTransition> {
    if !self.state.can_advance(self.kind, next) {
      return Err(Error::IllegalTransition {
        from: self.state.to_string(),
        to:   next.to_string(),
      });
    }
    self.state = next;
    Ok(RunTransition { run_id: self.run_id, kind: self.kind, state: next, detail, at })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_machine_edges() {
    let now = Utc::now();
    let mut t = RunTracker::new(Uuid::new_v4(), RunKind::Snapshot);
    assert_eq!(t.state(), RunState::Pending);
    t.advance(RunState::Ingesting, None, now).unwrap();
    t.advance(RunState::Hashing, None, now).unwrap();
    t.advance(RunState::Committed, None, now).unwrap();
    assert!(t.state().is_terminal());

    let err = t.advance(RunState::Ingesting, None, now).unwrap_err();
    assert!(matches!(err, Error::IllegalTransition { .. }));
  }

  #[test]
  fn evaluation_cannot_skip_replay() {
    let mut t = RunTracker::new(Uuid::new_v4(), RunKind::Evaluation);
    assert_eq!(t.state(), RunState::Scheduled);
    assert!(t.advance(RunState::Scored, None, Utc::now()).is_err());
    assert!(t.advance(RunState::Replaying, None, Utc::now()).is_ok());
    assert!(t.advance(RunState::InsufficientData, None, Utc::now()).is_ok());
  }

  #[test]
  fn state_names_are_screaming_snake() {
    assert_eq!(RunState::InsufficientData.to_string(), "INSUFFICIENT_DATA");
    assert_eq!("COMMITTED".parse::<RunState>().unwrap(), RunState::Committed);
  }
}
