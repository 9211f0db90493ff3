//! The `LabStore` trait.
//!
//! Implemented by storage backends (e.g. `asof-store-sqlite`). The pipeline
//! and the command surfaces depend on this abstraction, not on a concrete
//! backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  audit::{AuditHalt, HaltRelease},
  evaluation::EvaluationRun,
  feature::{FeatureSetDefinition, FeatureVector},
  model::ModelDefinition,
  prediction::{
    Prediction, PredictionCorrection, PredictionOutcome, PredictionRun, PredictionSupersession,
  },
  run::RunTransition,
  snapshot::{IngestRun, Snapshot, SnapshotBundle},
  universe::UniversePolicy,
};

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed<T> {
  /// This call wrote the row.
  Created(T),
  /// A row with the same natural key already existed; it is returned
  /// unchanged.
  Existing(T),
}

impl<T> Committed<T> {
  pub fn into_inner(self) -> T {
    match self {
      Self::Created(t) | Self::Existing(t) => t,
    }
  }

  pub fn is_created(&self) -> bool { matches!(self, Self::Created(_)) }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the Lab's append-only store.
///
/// No method updates or deletes a written row. Corrections, outcomes, halt
/// releases and state changes are all new rows. Methods that stamp a row
/// take the instant from the caller, which owns the clock.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes (e.g. tokio with `axum`).
pub trait LabStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + Into<crate::Error> + 'static;

  // ── Definitions ───────────────────────────────────────────────────────

  /// Persist a policy. Re-registering an identical policy is a no-op; a
  /// policy reusing an id or `(name, version)` with a different hash is
  /// rejected.
  fn register_policy(
    &self,
    policy: UniversePolicy,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Committed<UniversePolicy>, Self::Error>> + Send + '_;

  fn get_policy<'a>(
    &'a self,
    policy_id: &'a str,
  ) -> impl Future<Output = Result<Option<UniversePolicy>, Self::Error>> + Send + 'a;

  /// Same rules as [`LabStore::register_policy`].
  fn register_feature_set(
    &self,
    set: FeatureSetDefinition,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Committed<FeatureSetDefinition>, Self::Error>> + Send + '_;

  fn get_feature_set<'a>(
    &'a self,
    feature_set_id: &'a str,
  ) -> impl Future<Output = Result<Option<FeatureSetDefinition>, Self::Error>> + Send + 'a;

  /// Same rules as [`LabStore::register_policy`].
  fn register_model(
    &self,
    model: ModelDefinition,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Committed<ModelDefinition>, Self::Error>> + Send + '_;

  fn get_model<'a>(
    &'a self,
    model_id: &'a str,
  ) -> impl Future<Output = Result<Option<ModelDefinition>, Self::Error>> + Send + 'a;

  // ── Run state ─────────────────────────────────────────────────────────

  fn record_transition(
    &self,
    transition: RunTransition,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// All transitions for a run, oldest first.
  fn transitions(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Vec<RunTransition>, Self::Error>> + Send + '_;

  fn record_ingest_run(
    &self,
    run: IngestRun,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn ingest_runs(
    &self,
    pipeline_run_id: Uuid,
  ) -> impl Future<Output = Result<Vec<IngestRun>, Self::Error>> + Send + '_;

  // ── Snapshots ─────────────────────────────────────────────────────────

  /// Write the snapshot row and all of its children in one transaction.
  ///
  /// The `(as_of, universe_policy_id)` unique key is the idempotency guard:
  /// if another writer got there first, nothing is written and the existing
  /// snapshot is returned.
  fn commit_snapshot(
    &self,
    bundle: SnapshotBundle,
  ) -> impl Future<Output = Result<Committed<Snapshot>, Self::Error>> + Send + '_;

  fn find_snapshot<'a>(
    &'a self,
    as_of: DateTime<Utc>,
    policy_id: &'a str,
  ) -> impl Future<Output = Result<Option<Snapshot>, Self::Error>> + Send + 'a;

  /// Load a snapshot with all of its symbols and bars.
  fn load_snapshot(
    &self,
    snapshot_id: Uuid,
  ) -> impl Future<Output = Result<Option<SnapshotBundle>, Self::Error>> + Send + '_;

  // ── Features ──────────────────────────────────────────────────────────

  /// Idempotent by `(snapshot_id, feature_set_id)`.
  fn put_feature_vector(
    &self,
    vector: FeatureVector,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Committed<FeatureVector>, Self::Error>> + Send + '_;

  fn find_feature_vector<'a>(
    &'a self,
    snapshot_id: Uuid,
    feature_set_id: &'a str,
  ) -> impl Future<Output = Result<Option<FeatureVector>, Self::Error>> + Send + 'a;

  // ── Predictions ───────────────────────────────────────────────────────

  /// Write a run and its predictions in one transaction. Idempotent by
  /// `(snapshot_id, feature_set_id, model_id, horizon_days)`.
  fn commit_prediction_run(
    &self,
    run: PredictionRun,
    predictions: Vec<Prediction>,
  ) -> impl Future<Output = Result<Committed<PredictionRun>, Self::Error>> + Send + '_;

  fn get_prediction_run(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Option<PredictionRun>, Self::Error>> + Send + '_;

  /// Every prediction of a run, corrections included, with `superseded_by`
  /// and the latest `realized_outcome` resolved.
  fn predictions(
    &self,
    run_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Prediction>, Self::Error>> + Send + '_;

  /// Append a corrected prediction that replaces `old_id`.
  ///
  /// Returns an error if `old_id` does not exist or is already superseded.
  fn supersede_prediction(
    &self,
    old_id: Uuid,
    correction: PredictionCorrection,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(PredictionSupersession, Prediction), Self::Error>> + Send + '_;

  // ── Evaluation ────────────────────────────────────────────────────────

  /// Write the evaluation run and its outcomes in one transaction.
  fn record_evaluation(
    &self,
    run: EvaluationRun,
    outcomes: Vec<PredictionOutcome>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn evaluation_runs(
    &self,
    prediction_run_id: Uuid,
  ) -> impl Future<Output = Result<Vec<EvaluationRun>, Self::Error>> + Send + '_;

  // ── Audit ─────────────────────────────────────────────────────────────

  fn record_halt(
    &self,
    halt: AuditHalt,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// The oldest unreleased halt, if any.
  fn active_halt(&self) -> impl Future<Output = Result<Option<AuditHalt>, Self::Error>> + Send + '_;

  /// Release every active halt. Returns one release record per halt.
  fn release_halts(
    &self,
    note: String,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<HaltRelease>, Self::Error>> + Send + '_;
}
