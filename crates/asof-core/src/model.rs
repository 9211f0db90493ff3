//! The scoring layer: a fixed, versioned rule-score over normalised features
//! plus independent risk checks.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{
  Error, Result,
  canonical::{Canon, ToCanon, round_sig},
  feature::{FeatureSetDefinition, FeatureVector},
  market::SymbolMeta,
};

// ─── Risk flags ──────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
  LowLiquidity,
  HugeGap,
  Microcap,
  #[serde(rename = "EXTREME_1D_MOVE")]
  #[strum(serialize = "EXTREME_1D_MOVE")]
  Extreme1dMove,
  EarningsWindow,
  DataMissing,
}

// ─── Definition ──────────────────────────────────────────────────────────────

/// Weight and normalisation bounds for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureWeight {
  pub feature: String,
  /// Negative weights reward low values.
  pub weight:  f64,
  pub lower:   f64,
  pub upper:   f64,
}

/// Thresholds for the risk checks. All comparisons are strict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskThresholds {
  /// Feature holding mean dollar volume.
  pub liquidity_feature:    String,
  /// `LOW_LIQUIDITY` iff dollar volume is below this.
  pub min_dollar_volume:    f64,
  pub gap_feature:          String,
  /// `HUGE_GAP` iff `|gap|` exceeds this.
  pub max_abs_gap:          f64,
  /// `MICROCAP` iff market cap is below this.
  pub min_market_cap:       f64,
  pub move_feature:         String,
  /// `EXTREME_1D_MOVE` iff `|return|` exceeds this.
  pub max_abs_1d_move:      f64,
  /// Calendar days either side of as-of that count as an earnings window.
  pub earnings_window_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
  pub weights:      Vec<FeatureWeight>,
  pub risk:         RiskThresholds,
  /// Confidence lost per market-condition flag.
  pub flag_penalty: f64,
}

/// A versioned, immutable scoring rule-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDefinition {
  pub model_id: String,
  pub name:     String,
  pub version:  u32,
  pub config:   ModelConfig,
}

impl ModelDefinition {
  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: String| Error::InvalidDefinition(format!("{}: {msg}", self.model_id));
    if self.model_id.trim().is_empty() || self.name.trim().is_empty() {
      return Err(Error::InvalidDefinition(
        "model needs a model_id and a name".into(),
      ));
    }
    if self.version == 0 {
      return Err(invalid("version must be positive".into()));
    }
    let cfg = &self.config;
    if cfg.weights.is_empty() {
      return Err(invalid("no weights".into()));
    }
    let mut seen = BTreeSet::new();
    for w in &cfg.weights {
      if !seen.insert(w.feature.as_str()) {
        return Err(invalid(format!("duplicate weight for {}", w.feature)));
      }
      if !w.weight.is_finite() || w.weight == 0.0 {
        return Err(invalid(format!("{}: weight must be finite and non-zero", w.feature)));
      }
      if !w.lower.is_finite() || !w.upper.is_finite() || w.lower >= w.upper {
        return Err(invalid(format!("{}: bounds must satisfy lower < upper", w.feature)));
      }
    }
    let r = &cfg.risk;
    for (name, v) in [
      ("min_dollar_volume", r.min_dollar_volume),
      ("max_abs_gap", r.max_abs_gap),
      ("min_market_cap", r.min_market_cap),
      ("max_abs_1d_move", r.max_abs_1d_move),
    ] {
      if !v.is_finite() || v < 0.0 {
        return Err(invalid(format!("{name} must be finite and non-negative")));
      }
    }
    if !(0.0..=1.0).contains(&cfg.flag_penalty) {
      return Err(invalid("flag_penalty must lie in [0, 1]".into()));
    }
    Ok(())
  }

  /// Check that every feature this model reads exists in `set`.
  pub fn check_compatible(&self, set: &FeatureSetDefinition) -> Result<()> {
    let names = set.feature_names();
    let risk = &self.config.risk;
    let needed = self
      .config
      .weights
      .iter()
      .map(|w| w.feature.as_str())
      .chain([
        risk.liquidity_feature.as_str(),
        risk.gap_feature.as_str(),
        risk.move_feature.as_str(),
      ]);
    for feature in needed {
      if !names.contains(feature) {
        return Err(Error::InvalidDefinition(format!(
          "model {} reads {feature}, absent from feature set {}",
          self.model_id, set.feature_set_id
        )));
      }
    }
    Ok(())
  }

  pub fn model_hash(&self) -> Result<String> { self.content_hash() }
}

impl ToCanon for ModelDefinition {
  fn to_canon(&self) -> Result<Canon> {
    let cfg = &self.config;
    let weights = cfg
      .weights
      .iter()
      .map(|w| {
        Canon::map([
          ("feature", Canon::str(&w.feature)),
          ("weight", Canon::Num(w.weight)),
          ("lower", Canon::Num(w.lower)),
          ("upper", Canon::Num(w.upper)),
        ])
      })
      .collect();
    let r = &cfg.risk;
    Ok(Canon::map([
      ("name", Canon::str(&self.name)),
      ("version", Canon::Int(i64::from(self.version))),
      ("weights", Canon::List(weights)),
      (
        "risk",
        Canon::map([
          ("liquidity_feature", Canon::str(&r.liquidity_feature)),
          ("min_dollar_volume", Canon::Num(r.min_dollar_volume)),
          ("gap_feature", Canon::str(&r.gap_feature)),
          ("max_abs_gap", Canon::Num(r.max_abs_gap)),
          ("min_market_cap", Canon::Num(r.min_market_cap)),
          ("move_feature", Canon::str(&r.move_feature)),
          ("max_abs_1d_move", Canon::Num(r.max_abs_1d_move)),
          ("earnings_window_days", Canon::Int(i64::from(r.earnings_window_days))),
        ]),
      ),
      ("flag_penalty", Canon::Num(cfg.flag_penalty)),
    ]))
  }
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// The model's verdict for one symbol. `score`/`confidence` are `None` when
/// the symbol carries `DATA_MISSING`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
  pub score:      Option<f64>,
  pub confidence: Option<f64>,
  pub risk_flags: BTreeSet<RiskFlag>,
}

impl ScoreOutcome {
  pub fn is_scored(&self) -> bool { self.score.is_some() }
}

/// Evaluate the risk checks that do not depend on the score.
pub fn risk_flags(
  features: &FeatureVector,
  symbol: &str,
  meta: Option<&SymbolMeta>,
  as_of: DateTime<Utc>,
  risk: &RiskThresholds,
) -> BTreeSet<RiskFlag> {
  let mut flags = BTreeSet::new();

  if let Some(dv) = features.get(symbol, &risk.liquidity_feature)
    && dv < risk.min_dollar_volume
  {
    flags.insert(RiskFlag::LowLiquidity);
  }
  if let Some(gap) = features.get(symbol, &risk.gap_feature)
    && gap.abs() > risk.max_abs_gap
  {
    flags.insert(RiskFlag::HugeGap);
  }
  if let Some(mv) = features.get(symbol, &risk.move_feature)
    && mv.abs() > risk.max_abs_1d_move
  {
    flags.insert(RiskFlag::Extreme1dMove);
  }
  if let Some(meta) = meta {
    if let Some(cap) = meta.market_cap
      && cap < risk.min_market_cap
    {
      flags.insert(RiskFlag::Microcap);
    }
    // Only an ingested calendar can assert an earnings window.
    if let Some(dates) = &meta.earnings_dates {
      let day = as_of.date_naive();
      let span = Days::new(u64::from(risk.earnings_window_days));
      let (from, to) = (
        day.checked_sub_days(span).unwrap_or(day),
        day.checked_add_days(span).unwrap_or(day),
      );
      if dates.iter().any(|d| (from..=to).contains(d)) {
        flags.insert(RiskFlag::EarningsWindow);
      }
    }
  }
  flags
}

/// `Score(feature_vector, model)` for every symbol in the vector.
///
/// `metadata` supplies market cap and earnings calendars; a symbol absent from
/// it simply gets no metadata-based flags.
pub fn score(
  features: &FeatureVector,
  metadata: &BTreeMap<String, SymbolMeta>,
  as_of: DateTime<Utc>,
  model: &ModelDefinition,
) -> Result<BTreeMap<String, ScoreOutcome>> {
  model.validate()?;
  let cfg = &model.config;
  let total_weight: f64 = cfg.weights.iter().map(|w| w.weight.abs()).sum();

  let mut out = BTreeMap::new();
  for symbol in features.per_symbol_values.keys() {
    let mut flags = risk_flags(features, symbol, metadata.get(symbol), as_of, &cfg.risk);

    let mut sum = 0.0;
    let mut missing = false;
    for w in &cfg.weights {
      let Some(x) = features.get(symbol, &w.feature) else {
        missing = true;
        break;
      };
      let n = ((x - w.lower) / (w.upper - w.lower)).clamp(0.0, 1.0);
      sum += if w.weight > 0.0 { w.weight * n } else { w.weight.abs() * (1.0 - n) };
    }

    let outcome = if missing {
      flags.insert(RiskFlag::DataMissing);
      ScoreOutcome { score: None, confidence: None, risk_flags: flags }
    } else {
      let score = round_sig(sum / total_weight);
      let penalty = cfg.flag_penalty * flags.len() as f64;
      let confidence =
        round_sig(((0.5 + (score - 0.5).abs()) * (1.0 - penalty)).clamp(0.0, 1.0));
      ScoreOutcome { score: Some(score), confidence: Some(confidence), risk_flags: flags }
    };
    out.insert(symbol.clone(), outcome);
  }
  Ok(out)
}

/// Scored symbols ordered best first: score descending, then symbol.
pub fn rank(outcomes: &BTreeMap<String, ScoreOutcome>) -> Vec<(&str, f64)> {
  let mut ranked: Vec<(&str, f64)> = outcomes
    .iter()
    .filter_map(|(s, o)| o.score.map(|v| (s.as_str(), v)))
    .collect();
  ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
  ranked
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;
  use crate::{feature::SymbolFeatures, market::ListingStatus};

  fn model() -> ModelDefinition {
    ModelDefinition {
      model_id: "M_V1".into(),
      name:     "M".into(),
      version:  1,
      config:   ModelConfig {
        weights:      vec![
          FeatureWeight { feature: "ret_5d".into(), weight: 2.0, lower: -0.1, upper: 0.1 },
          FeatureWeight { feature: "vol_20d".into(), weight: -1.0, lower: 0.0, upper: 1.0 },
        ],
        risk:         RiskThresholds {
          liquidity_feature:    "dollar_vol_20d".into(),
          min_dollar_volume:    10_000_000.0,
          gap_feature:          "gap".into(),
          max_abs_gap:          0.08,
          min_market_cap:       300_000_000.0,
          move_feature:         "ret_1d".into(),
          max_abs_1d_move:      0.15,
          earnings_window_days: 3,
        },
        flag_penalty: 0.1,
      },
    }
  }

  fn vector(rows: &[(&str, &[(&str, Option<f64>)])]) -> FeatureVector {
    let per_symbol_values = rows
      .iter()
      .map(|(s, feats)| {
        let row: SymbolFeatures = feats.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        (s.to_string(), row)
      })
      .collect();
    FeatureVector {
      features_id: Uuid::nil(),
      snapshot_id: Uuid::nil(),
      feature_set_id: "F".into(),
      per_symbol_values,
      feature_hash: "h".into(),
    }
  }

  fn meta(symbol: &str, cap: Option<f64>, earnings: Option<Vec<&str>>) -> SymbolMeta {
    SymbolMeta {
      symbol:         symbol.into(),
      exchange:       "NYSE".into(),
      sector:         None,
      market_cap:     cap,
      listing_status: ListingStatus::Listed,
      earnings_dates: earnings.map(|d| d.iter().map(|s| s.parse().unwrap()).collect()),
    }
  }

  fn as_of() -> DateTime<Utc> { "2026-01-29T21:00:00Z".parse().unwrap() }

  fn full(dv: f64) -> Vec<(&'static str, Option<f64>)> {
    vec![
      ("ret_5d", Some(0.05)),
      ("vol_20d", Some(0.25)),
      ("dollar_vol_20d", Some(dv)),
      ("gap", Some(0.0)),
      ("ret_1d", Some(0.01)),
    ]
  }

  #[test]
  fn liquidity_boundary_is_strict() {
    let below = full(5_000_000.0);
    let exact = full(10_000_000.0);
    let fv = vector(&[("LOW", &below[..]), ("EDGE", &exact[..])]);
    let out = score(&fv, &BTreeMap::new(), as_of(), &model()).unwrap();
    assert!(out["LOW"].risk_flags.contains(&RiskFlag::LowLiquidity));
    assert!(!out["EDGE"].risk_flags.contains(&RiskFlag::LowLiquidity));
  }

  #[test]
  fn weighted_score_and_confidence() {
    let row = full(2e7);
    let fv = vector(&[("AAA", &row[..])]);
    let out = score(&fv, &BTreeMap::new(), as_of(), &model()).unwrap();
    // ret_5d: n = 0.75 → 1.5; vol_20d: n = 0.25 → 0.75; (1.5 + 0.75) / 3.
    assert_eq!(out["AAA"].score, Some(0.75));
    assert_eq!(out["AAA"].confidence, Some(0.75));
    assert!(out["AAA"].risk_flags.is_empty());
  }

  #[test]
  fn missing_weighted_feature_is_unscored() {
    let mut row = full(2e7);
    row[0].1 = None;
    let fv = vector(&[("AAA", &row[..])]);
    let out = score(&fv, &BTreeMap::new(), as_of(), &model()).unwrap();
    assert_eq!(out["AAA"].score, None);
    assert!(out["AAA"].risk_flags.contains(&RiskFlag::DataMissing));
    assert!(rank(&out).is_empty());
  }

  #[test]
  fn missing_risk_input_asserts_nothing() {
    let mut row = full(2e7);
    row[2].1 = None;
    let fv = vector(&[("AAA", &row[..])]);
    let out = score(&fv, &BTreeMap::new(), as_of(), &model()).unwrap();
    assert!(out["AAA"].risk_flags.is_empty());
  }

  #[test]
  fn market_flags_and_penalty() {
    let row = vec![
      ("ret_5d", Some(0.05)),
      ("vol_20d", Some(0.25)),
      ("dollar_vol_20d", Some(2e7)),
      ("gap", Some(-0.09)),
      ("ret_1d", Some(0.2)),
    ];
    let fv = vector(&[("AAA", &row[..])]);
    let metadata = BTreeMap::from([("AAA".to_string(), meta("AAA", Some(1e8), None))]);
    let out = score(&fv, &metadata, as_of(), &model()).unwrap();
    let flags = &out["AAA"].risk_flags;
    assert!(flags.contains(&RiskFlag::HugeGap));
    assert!(flags.contains(&RiskFlag::Extreme1dMove));
    assert!(flags.contains(&RiskFlag::Microcap));
    assert_eq!(out["AAA"].confidence, Some(round_sig(0.75 * 0.7)));
  }

  #[test]
  fn earnings_window_needs_an_ingested_calendar() {
    let row = full(2e7);
    let fv = vector(&[
      ("NOCAL", &row[..]),
      ("NEAR", &row[..]),
      ("FAR", &row[..]),
      ("EMPTY", &row[..]),
    ]);
    let metadata = BTreeMap::from([
      ("NOCAL".to_string(), meta("NOCAL", Some(1e10), None)),
      ("NEAR".to_string(), meta("NEAR", Some(1e10), Some(vec!["2026-02-01"]))),
      ("FAR".to_string(), meta("FAR", Some(1e10), Some(vec!["2026-03-01"]))),
      ("EMPTY".to_string(), meta("EMPTY", Some(1e10), Some(vec![]))),
    ]);
    let out = score(&fv, &metadata, as_of(), &model()).unwrap();

    assert!(out["NEAR"].risk_flags.contains(&RiskFlag::EarningsWindow));
    assert!(!out["FAR"].risk_flags.contains(&RiskFlag::EarningsWindow));
    assert!(!out["EMPTY"].risk_flags.contains(&RiskFlag::EarningsWindow));
    // Absent calendar: no earnings flag and no DATA_MISSING on its account.
    assert!(out["NOCAL"].risk_flags.is_empty());
    assert!(out["NOCAL"].is_scored());
  }

  #[test]
  fn ranking_breaks_ties_by_symbol() {
    let row = full(2e7);
    let fv = vector(&[("BBB", &row[..]), ("AAA", &row[..])]);
    let out = score(&fv, &BTreeMap::new(), as_of(), &model()).unwrap();
    let ranked: Vec<&str> = rank(&out).into_iter().map(|(s, _)| s).collect();
    assert_eq!(ranked, vec!["AAA", "BBB"]);
  }

  #[test]
  fn flag_names() {
    assert_eq!(RiskFlag::Extreme1dMove.to_string(), "EXTREME_1D_MOVE");
    assert_eq!(RiskFlag::DataMissing.to_string(), "DATA_MISSING");
    assert_eq!("LOW_LIQUIDITY".parse::<RiskFlag>().unwrap(), RiskFlag::LowLiquidity);
    assert_eq!(
      serde_json::to_string(&RiskFlag::Extreme1dMove).unwrap(),
      "\"EXTREME_1D_MOVE\""
    );
  }

  #[test]
  fn invalid_bounds_are_rejected() {
    let mut m = model();
    m.config.weights[0].upper = m.config.weights[0].lower;
    assert!(matches!(m.validate(), Err(Error::InvalidDefinition(_))));
  }
}
