//! Error type for `asof-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] asof_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A stored discriminant or number does not map back to a domain value.
  #[error("cannot decode column: {0}")]
  Decode(String),

  /// Same id or `(name, version)` already registered with a different hash.
  #[error("{kind} {id} conflicts with registered definition {stored}")]
  DefinitionConflict {
    kind:   &'static str,
    id:     String,
    stored: String,
  },

  #[error("prediction not found: {0}")]
  PredictionNotFound(uuid::Uuid),

  #[error("prediction {0} is already superseded")]
  AlreadySuperseded(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for asof_core::Error {
  fn from(err: Error) -> Self {
    match err {
      Error::Core(e) => e,
      e @ Error::DefinitionConflict { .. } => Self::InvalidDefinition(e.to_string()),
      Error::PredictionNotFound(id) => Self::not_found("prediction", id),
      e @ Error::AlreadySuperseded(_) => Self::Validation(e.to_string()),
      e => Self::store(e),
    }
  }
}
