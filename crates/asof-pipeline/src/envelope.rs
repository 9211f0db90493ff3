//! The response envelope every command returns, success or failure.

use std::collections::BTreeMap;

use asof_core::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provenance of a command's output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Audit {
  pub as_of:                Option<DateTime<Utc>>,
  pub universe_policy_hash: Option<String>,
  pub snapshot_hash:        Option<String>,
  pub sources:              Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub ok:             bool,
  pub ids:            BTreeMap<String, String>,
  pub warnings:       Vec<String>,
  pub audit:          Audit,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason:         Option<String>,
  /// Stable error class, see [`Error::kind`].
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_kind:     Option<String>,
  pub correlation_id: Uuid,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data:           Option<serde_json::Value>,
}

/// What a successful command produced, before it is wrapped.
#[derive(Debug, Clone, Default)]
pub struct Reply {
  pub ids:      BTreeMap<String, String>,
  pub warnings: Vec<String>,
  pub audit:    Audit,
  pub data:     Option<serde_json::Value>,
}

impl Reply {
  pub fn id(mut self, key: &str, value: impl ToString) -> Self {
    self.ids.insert(key.to_owned(), value.to_string());
    self
  }
}

/// A failed command step, carrying the run ids it allocated before failing
/// so the envelope can point at the recorded run.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CommandError {
  pub error: Error,
  pub ids:   BTreeMap<String, String>,
}

impl CommandError {
  pub fn id(mut self, key: &str, value: impl ToString) -> Self {
    self.ids.insert(key.to_owned(), value.to_string());
    self
  }
}

impl From<Error> for CommandError {
  fn from(error: Error) -> Self { Self { error, ids: BTreeMap::new() } }
}

impl Envelope {
  pub fn success(correlation_id: Uuid, reply: Reply) -> Self {
    Self {
      ok: true,
      ids: reply.ids,
      warnings: reply.warnings,
      audit: reply.audit,
      reason: None,
      error_kind: None,
      correlation_id,
      data: reply.data,
    }
  }

  /// A failed command. `ids` carries whatever run ids were allocated before
  /// the failure.
  pub fn failure(correlation_id: Uuid, err: &Error, ids: BTreeMap<String, String>) -> Self {
    Self {
      ok: false,
      ids,
      warnings: Vec::new(),
      audit: Audit::default(),
      reason: Some(err.to_string()),
      error_kind: Some(err.kind().to_owned()),
      correlation_id,
      data: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn failure_keeps_the_shape() {
    let id = Uuid::new_v4();
    let env = Envelope::failure(
      id,
      &Error::InsufficientCoverage("0 symbols".into()),
      BTreeMap::new(),
    );
    let json = serde_json::to_value(&env).unwrap();
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_kind"], "insufficient_coverage_error");
    assert_eq!(json["correlation_id"], id.to_string());
    assert!(json["audit"]["sources"].as_array().unwrap().is_empty());
    assert!(json.get("data").is_none());
  }

  #[test]
  fn failure_carries_allocated_run_ids() {
    let pipeline_run_id = Uuid::new_v4();
    let failed = CommandError::from(Error::InsufficientCoverage("1 of 3 sources".into()))
      .id("pipeline_run_id", pipeline_run_id);
    assert_eq!(failed.to_string(), failed.error.to_string());

    let env = Envelope::failure(Uuid::new_v4(), &failed.error, failed.ids.clone());
    assert_eq!(env.ids["pipeline_run_id"], pipeline_run_id.to_string());
  }
}
