//! Audit halts raised by determinism violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Automated processing stops while a halt is unreleased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditHalt {
  pub halt_id:   Uuid,
  /// Kind of row whose hash failed to recompute (`snapshot`, `feature_vector`, ...).
  pub entity:    String,
  pub entity_id: String,
  pub reason:    String,
  pub raised_at: DateTime<Utc>,
}

impl AuditHalt {
  /// Build a halt from a violation. `None` for any other error.
  pub fn from_error(err: &Error, now: DateTime<Utc>) -> Option<Self> {
    match err {
      Error::DeterminismViolation { entity, id, .. } => Some(Self {
        halt_id:   Uuid::new_v4(),
        entity:    (*entity).to_owned(),
        entity_id: id.clone(),
        reason:    err.to_string(),
        raised_at: now,
      }),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRelease {
  pub halt_id:     Uuid,
  pub note:        String,
  pub released_at: DateTime<Utc>,
}
