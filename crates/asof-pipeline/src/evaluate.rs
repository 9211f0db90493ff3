//! Walk-forward evaluation: `SCHEDULED → REPLAYING → SCORED |
//! INSUFFICIENT_DATA | FAILED`.
//!
//! The original snapshot, feature vector and predictions are only ever read
//! and re-verified. Realized prices come from a separate realization snapshot
//! at `as_of + horizon`, which cannot hold bars past its own as-of.

use asof_core::{
  Error,
  canonical::ToCanon,
  evaluation::{EvalPoint, EvaluationRun, compute_metrics, realized_return},
  feature,
  prediction::{PredictionOutcome, PredictionRun},
  run::{RunKind, RunState, RunTracker},
  store::LabStore,
};
use chrono::{DateTime, Days, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  envelope::{Audit, CommandError, Reply},
  lab::{IntoCore, Lab},
  predict::check_features,
};

impl<S: LabStore> Lab<S> {
  pub(crate) async fn evaluate_run(
    &self,
    prediction_run_id: Uuid,
  ) -> std::result::Result<Reply, CommandError> {
    let run = self
      .store
      .get_prediction_run(prediction_run_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("prediction run", prediction_run_id))?;
    let realization_as_of = run
      .as_of
      .checked_add_days(Days::new(u64::from(run.horizon_days)))
      .ok_or_else(|| Error::Validation("realization date out of range".into()))?;
    if realization_as_of > self.now() {
      return Err(Error::Validation(format!(
        "prediction run {prediction_run_id} is not due until {realization_as_of}"
      ))
      .into());
    }

    let mut tracker = RunTracker::new(Uuid::new_v4(), RunKind::Evaluation);
    self.record(tracker.opening(self.now())).await?;
    match self.replay(&mut tracker, &run, realization_as_of).await {
      Ok(reply) => Ok(reply),
      Err(err) => {
        self.record_failed_evaluation(&mut tracker, &run, realization_as_of, &err.error).await;
        Err(err.id("eval_run_id", tracker.run_id))
      }
    }
  }

  async fn replay(
    &self,
    tracker: &mut RunTracker,
    run: &PredictionRun,
    realization_as_of: DateTime<Utc>,
  ) -> std::result::Result<Reply, CommandError> {
    let eval_run_id = tracker.run_id;
    self.record(tracker.advance(RunState::Replaying, None, self.now())?).await?;

    // Re-verify everything the run was bound to before trusting it.
    let original = self.load_verified(run.snapshot_id).await?;
    let policy = self.policy(&original.snapshot.universe_policy_id).await?;
    let policy_hash = policy.policy_hash()?;
    if policy_hash != run.binding.policy_hash {
      return Err(Error::DeterminismViolation {
        entity:     "universe_policy",
        id:         policy.policy_id.clone(),
        stored:     run.binding.policy_hash.clone(),
        recomputed: policy_hash,
      }
      .into());
    }
    let set = self.feature_set(&run.feature_set_id).await?;
    let stored = self
      .store
      .find_feature_vector(run.snapshot_id, &run.feature_set_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("feature vector", run.snapshot_id))?;
    let recomputed = feature::compute(&original, &set)?;
    check_features(&stored, &recomputed, &set, &original.snapshot.snapshot_hash)?;
    if stored.feature_hash != run.binding.feature_hash {
      return Err(Error::DeterminismViolation {
        entity:     "prediction_run",
        id:         run.run_id.to_string(),
        stored:     run.binding.feature_hash.clone(),
        recomputed: stored.feature_hash.clone(),
      }
      .into());
    }
    let predictions = self.store.predictions(run.run_id).await.into_core()?;
    run.verify(&predictions)?;

    let realization = self.ensure_snapshot(realization_as_of, &policy).await?;
    let mut warnings = realization.warnings;
    let realized_bundle = realization.bundle;

    let now = self.now();
    let mut points = Vec::new();
    let mut outcomes = Vec::new();
    let mut skipped = 0;
    for p in predictions.iter().filter(|p| p.is_active()) {
      let (Some(score), Some(confidence)) = (p.score, p.confidence) else {
        continue;
      };
      let realized = original
        .symbols
        .get(&p.symbol)
        .zip(realized_bundle.symbols.get(&p.symbol))
        .and_then(|(from, to)| {
          realized_return(&from.bars, run.as_of, &to.bars, realization_as_of)
        });
      let Some(realized) = realized else {
        debug!(symbol = %p.symbol, "no realized return");
        skipped += 1;
        continue;
      };
      points.push(EvalPoint {
        prediction_id: p.prediction_id,
        symbol: p.symbol.clone(),
        score,
        confidence,
        realized_return: realized,
      });
      outcomes.push(PredictionOutcome {
        prediction_id: p.prediction_id,
        eval_run_id,
        realized_return: realized,
        recorded_at: now,
      });
    }
    if skipped > 0 {
      warnings.push(format!("{skipped} predictions had no realized return and were skipped"));
    }

    let needed = self.config.min_evaluated.max(1);
    let (status, metrics, reason) = if points.len() < needed {
      let reason = format!("{} predictions realized, need {needed}", points.len());
      warnings.push(reason.clone());
      (RunState::InsufficientData, None, Some(reason))
    } else {
      let metrics = compute_metrics(&points, skipped, self.config.calibration_buckets)?;
      (RunState::Scored, Some(metrics), None)
    };
    let metrics_hash = metrics.as_ref().map(ToCanon::content_hash).transpose()?;

    let evaluation = EvaluationRun {
      eval_run_id,
      prediction_run_id: run.run_id,
      realization_as_of,
      realization_snapshot_id: Some(realized_bundle.snapshot.snapshot_id),
      status,
      metrics,
      metrics_hash,
      reason,
      computed_at: now,
    };
    self.store.record_evaluation(evaluation.clone(), outcomes).await.into_core()?;
    self.record(tracker.advance(status, evaluation.reason.clone(), now)?).await?;
    info!(
      %eval_run_id,
      status = %status,
      evaluated = points.len(),
      skipped,
      "evaluation recorded"
    );

    let mut reply = Reply {
      warnings,
      audit: Audit {
        as_of:                Some(run.as_of),
        universe_policy_hash: Some(run.binding.policy_hash.clone()),
        snapshot_hash:        Some(run.binding.snapshot_hash.clone()),
        sources:              original.snapshot.sources.clone(),
      },
      data: Some(serde_json::to_value(&evaluation).map_err(Error::from)?),
      ..Reply::default()
    }
    .id("eval_run_id", eval_run_id)
    .id("prediction_run_id", run.run_id)
    .id("snapshot_id", run.snapshot_id)
    .id("realization_snapshot_id", realized_bundle.snapshot.snapshot_id)
    .id("realization_snapshot_hash", &realized_bundle.snapshot.snapshot_hash);
    if let Some(hash) = &evaluation.metrics_hash {
      reply = reply.id("metrics_hash", hash);
    }
    Ok(reply)
  }

  /// Best effort: the command already fails with `err`.
  async fn record_failed_evaluation(
    &self,
    tracker: &mut RunTracker,
    run: &PredictionRun,
    realization_as_of: DateTime<Utc>,
    err: &Error,
  ) {
    let now = self.now();
    let failed = EvaluationRun {
      eval_run_id: tracker.run_id,
      prediction_run_id: run.run_id,
      realization_as_of,
      realization_snapshot_id: None,
      status: RunState::Failed,
      metrics: None,
      metrics_hash: None,
      reason: Some(err.to_string()),
      computed_at: now,
    };
    if let Err(e) = self.store.record_evaluation(failed, Vec::new()).await.into_core() {
      warn!(eval_run_id = %tracker.run_id, error = %e, "could not record failed evaluation");
    }
    if let Ok(t) = tracker.advance(RunState::Failed, Some(err.to_string()), now)
      && let Err(e) = self.record(t).await
    {
      warn!(eval_run_id = %tracker.run_id, error = %e, "could not record evaluation failure");
    }
  }
}
