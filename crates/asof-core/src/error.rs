//! Error types for `asof-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A market-data source failed (network, format, timeout).
  #[error("adapter {source_name} failed: {message}")]
  Adapter {
    source_name: String,
    message:     String,
  },

  /// Data violates point-in-time or schema constraints. Never retried.
  #[error("validation failed: {0}")]
  Validation(String),

  /// Too few symbols or sources survived ingestion.
  #[error("insufficient coverage: {0}")]
  InsufficientCoverage(String),

  /// A recomputed hash disagrees with the stored one.
  #[error(
    "determinism violation on {entity} {id}: stored {stored}, recomputed {recomputed}"
  )]
  DeterminismViolation {
    entity:     &'static str,
    id:         String,
    stored:     String,
    recomputed: String,
  },

  #[error("value cannot be canonicalized: {0}")]
  NonCanonical(String),

  #[error("invalid definition: {0}")]
  InvalidDefinition(String),

  #[error("illegal run transition: {from} -> {to}")]
  IllegalTransition { from: String, to: String },

  /// Automated processing is stopped until an operator releases the halt.
  #[error("audit halt active: {0}")]
  Halted(String),

  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Stable class name surfaced in command responses.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Adapter { .. } => "adapter_error",
      Self::Validation(_) => "validation_error",
      Self::InsufficientCoverage(_) => "insufficient_coverage_error",
      Self::DeterminismViolation { .. } => "determinism_violation_error",
      Self::NonCanonical(_) => "non_canonical_error",
      Self::InvalidDefinition(_) => "invalid_definition_error",
      Self::IllegalTransition { .. } => "illegal_transition_error",
      Self::Halted(_) => "audit_halt",
      Self::NotFound { .. } => "not_found",
      Self::Store(_) => "store_error",
      Self::Serialization(_) => "serialization_error",
    }
  }

  pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
    Self::NotFound { entity, id: id.to_string() }
  }

  /// Wrap a backend error at the [`crate::store::LabStore`] seam.
  pub fn store<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
