//! Prediction runs and predictions.
//!
//! Predictions are append-only. A correction is a new prediction plus a
//! supersession record; realized outcomes are appended by evaluation runs and
//! joined in on read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  canonical::{Canon, hash_canon},
  model::{RiskFlag, ScoreOutcome, rank},
};

/// The hashes a run is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBinding {
  pub policy_hash:   String,
  pub snapshot_hash: String,
  pub feature_hash:  String,
  pub model_hash:    String,
}

/// One batch of predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRun {
  pub run_id:         Uuid,
  pub as_of:          DateTime<Utc>,
  pub snapshot_id:    Uuid,
  pub feature_set_id: String,
  pub model_id:       String,
  pub horizon_days:   u32,
  pub binding:        RunBinding,
  pub run_hash:       String,
  pub created_at:     DateTime<Utc>,
}

/// A single persisted prediction, with lifecycle state resolved on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
  pub prediction_id:    Uuid,
  pub run_id:           Uuid,
  pub symbol:           String,
  pub score:            Option<f64>,
  pub confidence:       Option<f64>,
  /// 1-based position in ranked output; `None` for unscored symbols.
  pub rank:             Option<u32>,
  pub risk_flags:       BTreeSet<RiskFlag>,
  pub prediction_hash:  String,
  /// The prediction this one corrects, if any.
  pub supersedes:       Option<Uuid>,
  pub recorded_at:      DateTime<Utc>,
  /// The correction that replaced this prediction, if any.
  #[serde(default)]
  pub superseded_by:    Option<Uuid>,
  /// Latest realized return recorded by an evaluation run.
  #[serde(default)]
  pub realized_outcome: Option<f64>,
}

impl Prediction {
  pub fn is_active(&self) -> bool { self.superseded_by.is_none() }

  pub fn recompute_hash(&self, binding: &RunBinding) -> Result<String> {
    prediction_hash(
      &self.symbol,
      self.score,
      self.confidence,
      self.rank,
      &self.risk_flags,
      binding,
    )
  }
}

/// Input to [`crate::store::LabStore::supersede_prediction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCorrection {
  #[serde(default)]
  pub score:      Option<f64>,
  #[serde(default)]
  pub confidence: Option<f64>,
  #[serde(default)]
  pub rank:       Option<u32>,
  #[serde(default)]
  pub risk_flags: BTreeSet<RiskFlag>,
  pub reason:     String,
}

impl PredictionCorrection {
  /// Scores and confidences live in `[0, 1]`; an unscored correction has no
  /// rank or confidence.
  pub fn validate(&self) -> Result<()> {
    if self.reason.trim().is_empty() {
      return Err(Error::Validation("a correction needs a reason".into()));
    }
    for (name, value) in [("score", self.score), ("confidence", self.confidence)] {
      if let Some(v) = value
        && !(0.0..=1.0).contains(&v)
      {
        return Err(Error::Validation(format!("{name} {v} is outside [0, 1]")));
      }
    }
    if self.score.is_none() && (self.rank.is_some() || self.confidence.is_some()) {
      return Err(Error::Validation(
        "an unscored correction cannot carry a rank or confidence".into(),
      ));
    }
    if self.rank == Some(0) {
      return Err(Error::Validation("ranks start at 1".into()));
    }
    Ok(())
  }
}

/// Records that one prediction was replaced by a corrected one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSupersession {
  pub supersession_id:   Uuid,
  pub old_prediction_id: Uuid,
  pub new_prediction_id: Uuid,
  pub reason:            String,
  pub recorded_at:       DateTime<Utc>,
}

/// A realized return attached to a prediction by an evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
  pub prediction_id:   Uuid,
  pub eval_run_id:     Uuid,
  pub realized_return: f64,
  pub recorded_at:     DateTime<Utc>,
}

// ─── Hashing ─────────────────────────────────────────────────────────────────

fn binding_canon(b: &RunBinding) -> Canon {
  Canon::map([
    ("policy_hash", Canon::str(&b.policy_hash)),
    ("snapshot_hash", Canon::str(&b.snapshot_hash)),
    ("feature_hash", Canon::str(&b.feature_hash)),
    ("model_hash", Canon::str(&b.model_hash)),
  ])
}

pub fn prediction_hash(
  symbol: &str,
  score: Option<f64>,
  confidence: Option<f64>,
  rank: Option<u32>,
  risk_flags: &BTreeSet<RiskFlag>,
  binding: &RunBinding,
) -> Result<String> {
  hash_canon(&Canon::map([
    ("symbol", Canon::str(symbol)),
    ("score", Canon::opt_num(score)),
    ("confidence", Canon::opt_num(confidence)),
    ("rank", rank.map_or(Canon::Null, |r| Canon::Int(i64::from(r)))),
    (
      "risk_flags",
      Canon::list(risk_flags.iter().map(|f| Canon::str(f.as_ref()))),
    ),
    ("binding", binding_canon(binding)),
  ]))
}

/// `run_hash = H(as_of, horizon, binding, symbol → prediction_hash)`.
pub fn run_hash(
  as_of: DateTime<Utc>,
  horizon_days: u32,
  binding: &RunBinding,
  predictions: &[Prediction],
) -> Result<String> {
  let per_symbol: BTreeMap<String, Canon> = predictions
    .iter()
    .filter(|p| p.supersedes.is_none())
    .map(|p| (p.symbol.clone(), Canon::str(&p.prediction_hash)))
    .collect();
  hash_canon(&Canon::map([
    ("as_of", Canon::instant(as_of)),
    ("horizon_days", Canon::Int(i64::from(horizon_days))),
    ("binding", binding_canon(binding)),
    ("predictions", Canon::Map(per_symbol)),
  ]))
}

impl PredictionRun {
  /// Recompute every prediction hash and the run hash from the original
  /// (non-correction) predictions.
  pub fn verify(&self, predictions: &[Prediction]) -> Result<()> {
    for p in predictions {
      let recomputed = p.recompute_hash(&self.binding)?;
      if recomputed != p.prediction_hash {
        return Err(Error::DeterminismViolation {
          entity: "prediction",
          id: p.prediction_id.to_string(),
          stored: p.prediction_hash.clone(),
          recomputed,
        });
      }
    }
    let recomputed = run_hash(self.as_of, self.horizon_days, &self.binding, predictions)?;
    if recomputed != self.run_hash {
      return Err(Error::DeterminismViolation {
        entity: "prediction_run",
        id: self.run_id.to_string(),
        stored: self.run_hash.clone(),
        recomputed,
      });
    }
    Ok(())
  }
}

/// Turn scoring outcomes into a run and its predictions.
#[allow(clippy::too_many_arguments)]
pub fn build_run(
  as_of: DateTime<Utc>,
  snapshot_id: Uuid,
  feature_set_id: &str,
  model_id: &str,
  horizon_days: u32,
  binding: RunBinding,
  outcomes: &BTreeMap<String, ScoreOutcome>,
  now: DateTime<Utc>,
) -> Result<(PredictionRun, Vec<Prediction>)> {
  let run_id = Uuid::new_v4();
  let ranks: BTreeMap<&str, u32> = rank(outcomes)
    .into_iter()
    .enumerate()
    .map(|(i, (symbol, _))| (symbol, i as u32 + 1))
    .collect();

  let predictions = outcomes
    .iter()
    .map(|(symbol, o)| {
      let rank = ranks.get(symbol.as_str()).copied();
      Ok(Prediction {
        prediction_id: Uuid::new_v4(),
        run_id,
        symbol: symbol.clone(),
        score: o.score,
        confidence: o.confidence,
        rank,
        risk_flags: o.risk_flags.clone(),
        prediction_hash: prediction_hash(
          symbol,
          o.score,
          o.confidence,
          rank,
          &o.risk_flags,
          &binding,
        )?,
        supersedes: None,
        recorded_at: now,
        superseded_by: None,
        realized_outcome: None,
      })
    })
    .collect::<Result<Vec<_>>>()?;

  let run_hash = run_hash(as_of, horizon_days, &binding, &predictions)?;
  let run = PredictionRun {
    run_id,
    as_of,
    snapshot_id,
    feature_set_id: feature_set_id.to_owned(),
    model_id: model_id.to_owned(),
    horizon_days,
    binding,
    run_hash,
    created_at: now,
  };
  Ok((run, predictions))
}

/// Active, scored predictions in rank order.
pub fn ranked(predictions: &[Prediction]) -> Vec<&Prediction> {
  let mut out: Vec<&Prediction> = predictions
    .iter()
    .filter(|p| p.is_active() && p.score.is_some())
    .collect();
  out.sort_by(|a, b| {
    let (sa, sb) = (a.score.unwrap_or(f64::MIN), b.score.unwrap_or(f64::MIN));
    sb.total_cmp(&sa).then_with(|| a.symbol.cmp(&b.symbol))
  });
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn binding() -> RunBinding {
    RunBinding {
      policy_hash:   "p".into(),
      snapshot_hash: "s".into(),
      feature_hash:  "f".into(),
      model_hash:    "m".into(),
    }
  }

  fn outcomes() -> BTreeMap<String, ScoreOutcome> {
    BTreeMap::from([
      ("AAA".to_string(), ScoreOutcome {
        score:      Some(0.4),
        confidence: Some(0.6),
        risk_flags: BTreeSet::new(),
      }),
      ("BBB".to_string(), ScoreOutcome {
        score:      Some(0.9),
        confidence: Some(0.9),
        risk_flags: BTreeSet::from([RiskFlag::HugeGap]),
      }),
      ("CCC".to_string(), ScoreOutcome {
        score:      None,
        confidence: None,
        risk_flags: BTreeSet::from([RiskFlag::DataMissing]),
      }),
    ])
  }

  fn as_of() -> DateTime<Utc> { "2026-01-29T21:00:00Z".parse().unwrap() }

  #[test]
  fn ranks_scored_symbols_only() {
    let (run, preds) =
      build_run(as_of(), Uuid::nil(), "F", "M", 5, binding(), &outcomes(), as_of()).unwrap();
    let by_symbol: BTreeMap<_, _> = preds.iter().map(|p| (p.symbol.as_str(), p)).collect();
    assert_eq!(by_symbol["BBB"].rank, Some(1));
    assert_eq!(by_symbol["AAA"].rank, Some(2));
    assert_eq!(by_symbol["CCC"].rank, None);

    let order: Vec<&str> = ranked(&preds).iter().map(|p| p.symbol.as_str()).collect();
    assert_eq!(order, vec!["BBB", "AAA"]);
    run.verify(&preds).unwrap();
  }

  #[test]
  fn run_hash_ignores_generated_ids() {
    let (a, _) =
      build_run(as_of(), Uuid::nil(), "F", "M", 5, binding(), &outcomes(), as_of()).unwrap();
    let (b, _) =
      build_run(as_of(), Uuid::nil(), "F", "M", 5, binding(), &outcomes(), as_of()).unwrap();
    assert_ne!(a.run_id, b.run_id);
    assert_eq!(a.run_hash, b.run_hash);
  }

  #[test]
  fn tampered_prediction_fails_verification() {
    let (run, mut preds) =
      build_run(as_of(), Uuid::nil(), "F", "M", 5, binding(), &outcomes(), as_of()).unwrap();
    preds[0].score = Some(0.99);
    assert!(matches!(
      run.verify(&preds),
      Err(Error::DeterminismViolation { entity: "prediction", .. })
    ));
  }

  #[test]
  fn corrections_are_validated() {
    let ok: PredictionCorrection = serde_json::from_str(
      r#"{"score": 0.55, "confidence": 0.6, "rank": 2, "risk_flags": ["HUGE_GAP"], "reason": "restated close"}"#,
    )
    .unwrap();
    ok.validate().unwrap();
    assert!(ok.risk_flags.contains(&RiskFlag::HugeGap));

    let unscored: PredictionCorrection =
      serde_json::from_str(r#"{"reason": "delisted"}"#).unwrap();
    unscored.validate().unwrap();

    for bad in [
      PredictionCorrection { reason: " ".into(), ..ok.clone() },
      PredictionCorrection { score: Some(1.5), ..ok.clone() },
      PredictionCorrection { rank: Some(0), ..ok.clone() },
      PredictionCorrection { rank: Some(1), ..unscored.clone() },
    ] {
      assert!(matches!(bad.validate(), Err(Error::Validation(_))), "{bad:?}");
    }
  }
}
