//! The prediction run orchestrator: universe → snapshot → features → score →
//! persisted run.

use std::collections::BTreeMap;

use asof_core::{
  Error, Result,
  feature::{self, FeatureSetDefinition, FeatureVector},
  market::SymbolMeta,
  model::score,
  prediction::{Prediction, RunBinding, build_run, ranked},
  snapshot::SnapshotBundle,
  store::{Committed, LabStore},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::{
  envelope::{Audit, CommandError, Reply},
  lab::{IntoCore, Lab},
};

/// Compare a stored feature vector against its own values and against a
/// fresh computation from the snapshot.
pub(crate) fn check_features(
  stored: &FeatureVector,
  recomputed: &FeatureVector,
  set: &FeatureSetDefinition,
  snapshot_hash: &str,
) -> Result<()> {
  for candidate in [
    stored.recompute_hash(set, snapshot_hash)?,
    recomputed.feature_hash.clone(),
  ] {
    if candidate != stored.feature_hash {
      return Err(Error::DeterminismViolation {
        entity:     "feature_vector",
        id:         stored.features_id.to_string(),
        stored:     stored.feature_hash.clone(),
        recomputed: candidate,
      });
    }
  }
  Ok(())
}

impl<S: LabStore> Lab<S> {
  /// Compute features for `bundle`, reusing (and re-checking) a stored vector.
  pub async fn ensure_features(
    &self,
    bundle: &SnapshotBundle,
    set: &FeatureSetDefinition,
  ) -> Result<FeatureVector> {
    let computed = feature::compute(bundle, set)?;
    let snapshot_hash = &bundle.snapshot.snapshot_hash;
    let stored = self
      .store
      .find_feature_vector(bundle.snapshot.snapshot_id, &set.feature_set_id)
      .await
      .into_core()?;
    if let Some(stored) = stored {
      check_features(&stored, &computed, set, snapshot_hash)?;
      return Ok(stored);
    }
    match self.store.put_feature_vector(computed.clone(), self.now()).await.into_core()? {
      Committed::Created(v) => {
        info!(features_id = %v.features_id, feature_hash = %v.feature_hash, "feature vector stored");
        Ok(v)
      }
      Committed::Existing(v) => {
        check_features(&v, &computed, set, snapshot_hash)?;
        Ok(v)
      }
    }
  }

  pub(crate) async fn predict(
    &self,
    as_of: DateTime<Utc>,
    policy_id: &str,
    horizon_days: u32,
  ) -> std::result::Result<Reply, CommandError> {
    if horizon_days == 0 {
      return Err(Error::Validation("horizon must be at least one day".into()).into());
    }
    if as_of > self.now() {
      return Err(Error::Validation(format!("as_of {as_of} is in the future")).into());
    }
    let policy = self.policy(policy_id).await?;
    let set = self.feature_set(&self.config.feature_set_id).await?;
    let model = self.model(&self.config.model_id).await?;
    model.check_compatible(&set)?;

    let snap = self.ensure_snapshot(as_of, &policy).await?;
    let mut warnings = snap.warnings;
    let bundle = snap.bundle;
    let vector = self.ensure_features(&bundle, &set).await?;

    let metadata: BTreeMap<String, SymbolMeta> = bundle
      .symbols
      .iter()
      .map(|(symbol, data)| (symbol.clone(), data.meta.clone()))
      .collect();
    let outcomes = score(&vector, &metadata, as_of, &model)?;
    let binding = RunBinding {
      policy_hash:   bundle.snapshot.policy_hash.clone(),
      snapshot_hash: bundle.snapshot.snapshot_hash.clone(),
      feature_hash:  vector.feature_hash.clone(),
      model_hash:    model.model_hash()?,
    };
    let (run, predictions) = build_run(
      as_of,
      bundle.snapshot.snapshot_id,
      &set.feature_set_id,
      &model.model_id,
      horizon_days,
      binding,
      &outcomes,
      self.now(),
    )?;

    let built_hash = run.run_hash.clone();
    let (run, predictions) = match self
      .store
      .commit_prediction_run(run, predictions.clone())
      .await
      .into_core()?
    {
      Committed::Created(run) => {
        info!(run_id = %run.run_id, run_hash = %run.run_hash, "prediction run committed");
        (run, predictions)
      }
      Committed::Existing(stored) => {
        let stored_predictions = self.store.predictions(stored.run_id).await.into_core()?;
        stored.verify(&stored_predictions)?;
        if stored.run_hash != built_hash {
          return Err(Error::DeterminismViolation {
            entity:     "prediction_run",
            id:         stored.run_id.to_string(),
            stored:     stored.run_hash.clone(),
            recomputed: built_hash,
          }
          .into());
        }
        warnings.push(format!(
          "prediction run {} already exists for this snapshot, feature set, model and horizon",
          stored.run_id
        ));
        (stored, stored_predictions)
      }
    };

    let unscored: Vec<&Prediction> = predictions
      .iter()
      .filter(|p| p.is_active() && p.score.is_none())
      .collect();
    if !unscored.is_empty() {
      warnings.push(format!(
        "{} symbols unscored for missing features: {}",
        unscored.len(),
        unscored.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>().join(", ")
      ));
    }
    let ranked_rows: Vec<_> = ranked(&predictions)
      .into_iter()
      .map(|p| {
        json!({
          "prediction_id": p.prediction_id,
          "rank": p.rank,
          "symbol": p.symbol,
          "score": p.score,
          "confidence": p.confidence,
          "risk_flags": p.risk_flags,
        })
      })
      .collect();
    let unscored_rows: Vec<_> = unscored
      .iter()
      .map(|p| {
        json!({
          "prediction_id": p.prediction_id,
          "symbol": p.symbol,
          "risk_flags": p.risk_flags,
        })
      })
      .collect();

    let mut reply = Reply {
      warnings,
      audit: Audit {
        as_of:                Some(as_of),
        universe_policy_hash: Some(run.binding.policy_hash.clone()),
        snapshot_hash:        Some(run.binding.snapshot_hash.clone()),
        sources:              bundle.snapshot.sources.clone(),
      },
      data: Some(json!({
        "horizon_days": run.horizon_days,
        "ranked": ranked_rows,
        "unscored": unscored_rows,
      })),
      ..Reply::default()
    }
    .id("prediction_run_id", run.run_id)
    .id("run_hash", &run.run_hash)
    .id("snapshot_id", run.snapshot_id)
    .id("snapshot_hash", &run.binding.snapshot_hash)
    .id("policy_id", policy_id)
    .id("policy_hash", &run.binding.policy_hash)
    .id("feature_set_id", &run.feature_set_id)
    .id("features_id", vector.features_id)
    .id("feature_hash", &run.binding.feature_hash)
    .id("model_id", &run.model_id)
    .id("model_hash", &run.binding.model_hash);
    if let Some(pipeline_run_id) = snap.pipeline_run_id {
      reply = reply.id("pipeline_run_id", pipeline_run_id);
    }
    Ok(reply)
  }
}
