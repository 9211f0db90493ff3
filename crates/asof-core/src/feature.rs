//! The feature engine: a pure function from a snapshot and a feature-set
//! definition to a per-symbol feature vector.
//!
//! Every stored value passes through [`round_sig`]. That rounding boundary is
//! the reproducibility contract: the same snapshot yields the same stored
//! numbers and therefore the same `feature_hash`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  canonical::{Canon, ToCanon, hash_canon, round_finite},
  market::Bar,
  snapshot::SnapshotBundle,
};

/// Longest window a formula may declare.
pub const MAX_WINDOW: usize = 260;

/// Trading days per year used to annualise volatility.
const TRADING_DAYS: f64 = 252.0;

/// Feature name → value; `None` when history was insufficient.
pub type SymbolFeatures = BTreeMap<String, Option<f64>>;

// ─── Definition ──────────────────────────────────────────────────────────────

/// A feature formula. All outputs are fractions (0.05 = 5 %).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Formula {
  /// `close[t] / close[t-N] - 1`.
  Return { window: usize },
  /// Annualised sample stdev of the last N log returns.
  RealizedVol { window: usize },
  /// Mean true range over N bars divided by the last close.
  AtrPct { window: usize },
  /// Last open against the previous close.
  OvernightGap,
  /// Last volume over the mean volume of the N prior bars.
  RelativeVolume { window: usize },
  /// Mean `close × volume` over N bars.
  DollarVolume { window: usize },
  /// Last close against its N-bar simple moving average.
  DistanceFromMa { window: usize },
  /// OLS slope of `ln(close)` per bar over N bars.
  TrendSlope { window: usize },
}

impl Formula {
  fn kind(&self) -> &'static str {
    match self {
      Self::Return { .. } => "return",
      Self::RealizedVol { .. } => "realized_vol",
      Self::AtrPct { .. } => "atr_pct",
      Self::OvernightGap => "overnight_gap",
      Self::RelativeVolume { .. } => "relative_volume",
      Self::DollarVolume { .. } => "dollar_volume",
      Self::DistanceFromMa { .. } => "distance_from_ma",
      Self::TrendSlope { .. } => "trend_slope",
    }
  }

  fn window(&self) -> Option<usize> {
    match *self {
      Self::OvernightGap => None,
      Self::Return { window }
      | Self::RealizedVol { window }
      | Self::AtrPct { window }
      | Self::RelativeVolume { window }
      | Self::DollarVolume { window }
      | Self::DistanceFromMa { window }
      | Self::TrendSlope { window } => Some(window),
    }
  }

  /// Bars needed ending at the as-of bar.
  pub fn required_bars(&self) -> usize {
    match *self {
      Self::OvernightGap => 2,
      Self::Return { window }
      | Self::RealizedVol { window }
      | Self::AtrPct { window }
      | Self::RelativeVolume { window } => window + 1,
      Self::DollarVolume { window }
      | Self::DistanceFromMa { window }
      | Self::TrendSlope { window } => window,
    }
  }

  fn validate(&self) -> std::result::Result<(), String> {
    let min = match self {
      Self::RealizedVol { .. } | Self::TrendSlope { .. } => 2,
      _ => 1,
    };
    match self.window() {
      Some(w) if w < min || w > MAX_WINDOW => Err(format!(
        "{}: window {w} outside {min}..={MAX_WINDOW}",
        self.kind()
      )),
      _ => Ok(()),
    }
  }

  /// Evaluate on a date-sorted series whose last bar is the as-of bar.
  /// Returns the unrounded value.
  pub fn evaluate(&self, bars: &[Bar]) -> Option<f64> {
    let n = bars.len();
    if n < self.required_bars() {
      return None;
    }
    let close = |i: usize| bars[i].close;
    let last = n - 1;
    let value = match *self {
      Self::Return { window } => close(last) / close(last - window) - 1.0,
      Self::RealizedVol { window } => {
        let rets: Vec<f64> = (n - window..n)
          .map(|i| (close(i) / close(i - 1)).ln())
          .collect();
        let mean = rets.iter().sum::<f64>() / window as f64;
        let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
          / (window - 1) as f64;
        var.sqrt() * TRADING_DAYS.sqrt()
      }
      Self::AtrPct { window } => {
        let atr = (n - window..n)
          .map(|i| {
            let b = &bars[i];
            let prev = close(i - 1);
            (b.high - b.low)
              .max((b.high - prev).abs())
              .max((b.low - prev).abs())
          })
          .sum::<f64>()
          / window as f64;
        atr / close(last)
      }
      Self::OvernightGap => bars[last].open / close(last - 1) - 1.0,
      Self::RelativeVolume { window } => {
        let mean = bars[last - window..last]
          .iter()
          .map(|b| b.volume as f64)
          .sum::<f64>()
          / window as f64;
        if mean == 0.0 {
          return None;
        }
        bars[last].volume as f64 / mean
      }
      Self::DollarVolume { window } => {
        bars[n - window..].iter().map(Bar::dollar_volume).sum::<f64>() / window as f64
      }
      Self::DistanceFromMa { window } => {
        let sma = bars[n - window..].iter().map(|b| b.close).sum::<f64>() / window as f64;
        close(last) / sma - 1.0
      }
      Self::TrendSlope { window } => {
        let ys: Vec<f64> = bars[n - window..].iter().map(|b| b.close.ln()).collect();
        let x_mean = (window - 1) as f64 / 2.0;
        let y_mean = ys.iter().sum::<f64>() / window as f64;
        let (num, den) = ys.iter().enumerate().fold((0.0, 0.0), |(num, den), (i, y)| {
          let dx = i as f64 - x_mean;
          (num + dx * (y - y_mean), den + dx * dx)
        });
        num / den
      }
    };
    value.is_finite().then_some(value)
  }
}

impl ToCanon for Formula {
  fn to_canon(&self) -> Result<Canon> {
    let mut fields = vec![("kind", Canon::str(self.kind()))];
    if let Some(w) = self.window() {
      fields.push(("window", Canon::uint(w as u64)?));
    }
    Ok(Canon::map(fields))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureSpec {
  pub name:    String,
  pub formula: Formula,
}

/// A versioned, immutable list of named formulas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureSetDefinition {
  pub feature_set_id: String,
  pub name:           String,
  pub version:        u32,
  pub features:       Vec<FeatureSpec>,
}

impl FeatureSetDefinition {
  pub fn validate(&self) -> Result<()> {
    let invalid = |msg: String| Error::InvalidDefinition(format!("{}: {msg}", self.feature_set_id));
    if self.feature_set_id.trim().is_empty() || self.name.trim().is_empty() {
      return Err(Error::InvalidDefinition(
        "feature set needs a feature_set_id and a name".into(),
      ));
    }
    if self.version == 0 {
      return Err(invalid("version must be positive".into()));
    }
    if self.features.is_empty() {
      return Err(invalid("no features".into()));
    }
    let mut seen = BTreeSet::new();
    for spec in &self.features {
      if spec.name.trim().is_empty() {
        return Err(invalid("empty feature name".into()));
      }
      if !seen.insert(spec.name.as_str()) {
        return Err(invalid(format!("duplicate feature {}", spec.name)));
      }
      spec.formula.validate().map_err(|e| invalid(format!("{}: {e}", spec.name)))?;
    }
    Ok(())
  }

  pub fn definition_hash(&self) -> Result<String> { self.content_hash() }

  pub fn feature_names(&self) -> BTreeSet<&str> {
    self.features.iter().map(|f| f.name.as_str()).collect()
  }

  /// Most bars any formula needs.
  pub fn max_required_bars(&self) -> usize {
    self.features.iter().map(|f| f.formula.required_bars()).max().unwrap_or(0)
  }
}

impl ToCanon for FeatureSetDefinition {
  fn to_canon(&self) -> Result<Canon> {
    let features = self
      .features
      .iter()
      .map(|f| {
        Ok(Canon::map([
          ("name", Canon::str(&f.name)),
          ("formula", f.formula.to_canon()?),
        ]))
      })
      .collect::<Result<_>>()?;
    Ok(Canon::map([
      ("name", Canon::str(&self.name)),
      ("version", Canon::Int(i64::from(self.version))),
      ("features", Canon::List(features)),
    ]))
  }
}

// ─── Feature vector ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
  /// Derived from the snapshot id and `feature_hash`, so recomputation yields
  /// the same id.
  pub features_id:       Uuid,
  pub snapshot_id:       Uuid,
  pub feature_set_id:    String,
  pub per_symbol_values: BTreeMap<String, SymbolFeatures>,
  pub feature_hash:      String,
}

impl FeatureVector {
  /// Recompute `feature_hash` from the stored values.
  pub fn recompute_hash(&self, set: &FeatureSetDefinition, snapshot_hash: &str) -> Result<String> {
    feature_hash(&self.per_symbol_values, set, snapshot_hash)
  }

  pub fn get(&self, symbol: &str, feature: &str) -> Option<f64> {
    self
      .per_symbol_values
      .get(symbol)
      .and_then(|f| f.get(feature).copied().flatten())
  }
}

/// `feature_hash = H(values, feature-set name and version, snapshot_hash)`.
pub fn feature_hash(
  values: &BTreeMap<String, SymbolFeatures>,
  set: &FeatureSetDefinition,
  snapshot_hash: &str,
) -> Result<String> {
  let values = Canon::Map(
    values
      .iter()
      .map(|(symbol, features)| {
        let row = features
          .iter()
          .map(|(name, v)| (name.clone(), Canon::opt_num(*v)))
          .collect();
        (symbol.clone(), Canon::Map(row))
      })
      .collect(),
  );
  hash_canon(&Canon::map([
    ("values", values),
    (
      "feature_set",
      Canon::map([
        ("name", Canon::str(&set.name)),
        ("version", Canon::Int(i64::from(set.version))),
      ]),
    ),
    ("snapshot_hash", Canon::str(snapshot_hash)),
  ]))
}

/// The prefix of a date-sorted series visible at `as_of`.
fn visible_prefix(bars: &[Bar], as_of: DateTime<Utc>) -> &[Bar] {
  &bars[..bars.partition_point(|b| b.visible_at(as_of))]
}

/// Compute the feature vector for `bundle` under `set`.
///
/// Symbols are computed in parallel; the result is collected into ordered
/// maps before hashing, so completion order never reaches the hash.
pub fn compute(bundle: &SnapshotBundle, set: &FeatureSetDefinition) -> Result<FeatureVector> {
  set.validate()?;
  bundle.check_point_in_time()?;
  let as_of = bundle.snapshot.as_of;

  let per_symbol_values: BTreeMap<String, SymbolFeatures> = bundle
    .symbols
    .par_iter()
    .map(|(symbol, data)| {
      let bars = visible_prefix(&data.bars, as_of);
      let row = set
        .features
        .iter()
        .map(|spec| {
          let v = spec.formula.evaluate(bars).and_then(round_finite);
          (spec.name.clone(), v)
        })
        .collect();
      (symbol.clone(), row)
    })
    .collect::<Vec<_>>()
    .into_iter()
    .collect();

  let feature_hash = feature_hash(&per_symbol_values, set, &bundle.snapshot.snapshot_hash)?;
  Ok(FeatureVector {
    features_id: Uuid::new_v5(
      &Uuid::NAMESPACE_OID,
      format!("features:{}:{feature_hash}", bundle.snapshot.snapshot_id).as_bytes(),
    ),
    snapshot_id: bundle.snapshot.snapshot_id,
    feature_set_id: set.feature_set_id.clone(),
    per_symbol_values,
    feature_hash,
  })
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;
  use crate::{
    market::{ListingStatus, SymbolMeta},
    snapshot::{Snapshot, SnapshotSymbol, compute_snapshot_hash},
  };

  fn series(closes: &[f64], volumes: &[u64]) -> Vec<Bar> {
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    closes
      .iter()
      .zip(volumes)
      .enumerate()
      .map(|(i, (c, v))| Bar {
        symbol: "AAA".into(),
        date:   start + chrono::Days::new(i as u64),
        open:   *c,
        high:   c * 1.01,
        low:    c * 0.99,
        close:  *c,
        volume: *v,
      })
      .collect()
  }

  fn close_only(closes: &[f64]) -> Vec<Bar> { series(closes, &vec![100; closes.len()]) }

  #[test]
  fn simple_formulas() {
    let bars = close_only(&[100.0, 110.0]);
    let r = Formula::Return { window: 1 }.evaluate(&bars).and_then(round_finite);
    assert_eq!(r, Some(0.1));

    let bars = series(&[10.0, 20.0, 30.0], &[1, 2, 3]);
    let dv = Formula::DollarVolume { window: 2 }.evaluate(&bars);
    assert_eq!(dv, Some((40.0 + 90.0) / 2.0));

    let rv = Formula::RelativeVolume { window: 2 }.evaluate(&bars);
    assert_eq!(rv, Some(2.0));

    let ma = Formula::DistanceFromMa { window: 3 }.evaluate(&bars).and_then(round_finite);
    assert_eq!(ma, Some(0.5));
  }

  #[test]
  fn overnight_gap_uses_previous_close() {
    let mut bars = close_only(&[100.0, 100.0]);
    bars[1].open = 105.0;
    bars[1].high = 106.0;
    let gap = Formula::OvernightGap.evaluate(&bars).and_then(round_finite);
    assert_eq!(gap, Some(0.05));
  }

  #[test]
  fn trend_slope_of_constant_growth() {
    let closes: Vec<f64> = (0..10).map(|i| 100.0 * 1.01f64.powi(i)).collect();
    let slope = Formula::TrendSlope { window: 10 }
      .evaluate(&close_only(&closes))
      .and_then(round_finite)
      .unwrap();
    assert_eq!(slope, round_finite(1.01f64.ln()).unwrap());
  }

  #[test]
  fn realized_vol_of_flat_series_is_zero() {
    let v = Formula::RealizedVol { window: 5 }.evaluate(&close_only(&[50.0; 6]));
    assert_eq!(v, Some(0.0));
  }

  #[test]
  fn insufficient_history_is_null_not_zero() {
    let bars = close_only(&[100.0; 10]);
    assert_eq!(Formula::Return { window: 10 }.evaluate(&bars), None);
    assert!(Formula::Return { window: 9 }.evaluate(&bars).is_some());
    assert_eq!(Formula::TrendSlope { window: 11 }.evaluate(&bars), None);
  }

  #[test]
  fn zero_volume_history_yields_null_relative_volume() {
    let bars = series(&[1.0, 1.0, 1.0], &[0, 0, 5]);
    assert_eq!(Formula::RelativeVolume { window: 2 }.evaluate(&bars), None);
  }

  fn definition() -> FeatureSetDefinition {
    FeatureSetDefinition {
      feature_set_id: "T_V1".into(),
      name:           "T".into(),
      version:        1,
      features:       vec![
        FeatureSpec { name: "ret_1d".into(), formula: Formula::Return { window: 1 } },
        FeatureSpec { name: "ret_20d".into(), formula: Formula::Return { window: 20 } },
        FeatureSpec { name: "vol_5d".into(), formula: Formula::RealizedVol { window: 5 } },
      ],
    }
  }

  fn bundle(closes: &[f64]) -> SnapshotBundle {
    let mut symbols = BTreeMap::new();
    symbols.insert("AAA".to_string(), SnapshotSymbol {
      meta:   SymbolMeta {
        symbol:         "AAA".into(),
        exchange:       "NYSE".into(),
        sector:         None,
        market_cap:     None,
        listing_status: ListingStatus::Listed,
        earnings_dates: None,
      },
      source: "mock".into(),
      bars:   close_only(closes),
    });
    let snapshot_hash = compute_snapshot_hash("p", &symbols).unwrap();
    SnapshotBundle {
      snapshot: Snapshot {
        snapshot_id: Uuid::nil(),
        as_of: "2026-03-01T00:00:00Z".parse().unwrap(),
        universe_policy_id: "P".into(),
        policy_hash: "p".into(),
        snapshot_hash,
        sources: vec!["mock".into()],
        created_at: "2026-03-01T00:00:00Z".parse().unwrap(),
      },
      symbols,
    }
  }

  #[test]
  fn compute_is_deterministic_and_nulls_short_windows() {
    let closes: Vec<f64> = (0..8).map(|i| 100.0 + i as f64 * 0.37).collect();
    let b = bundle(&closes);
    let a = compute(&b, &definition()).unwrap();
    let again = compute(&b, &definition()).unwrap();
    assert_eq!(a, again);
    assert_eq!(a.features_id, again.features_id);
    assert_eq!(a.get("AAA", "ret_20d"), None);
    assert!(a.get("AAA", "ret_1d").is_some());
    assert_eq!(
      a.recompute_hash(&definition(), &b.snapshot.snapshot_hash).unwrap(),
      a.feature_hash
    );
  }

  #[test]
  fn feature_hash_moves_with_version_and_snapshot() {
    let b = bundle(&[1.0, 2.0, 3.0]);
    let base = compute(&b, &definition()).unwrap();

    let mut bumped = definition();
    bumped.version = 2;
    assert_ne!(compute(&b, &bumped).unwrap().feature_hash, base.feature_hash);

    let mut other = b.clone();
    other.snapshot.snapshot_hash = "different".into();
    assert_ne!(compute(&other, &definition()).unwrap().feature_hash, base.feature_hash);
  }

  #[test]
  fn bundle_with_future_bar_is_refused() {
    let mut b = bundle(&[1.0, 2.0]);
    b.snapshot.as_of = "2026-01-01T12:00:00Z".parse().unwrap();
    assert!(matches!(compute(&b, &definition()), Err(Error::Validation(_))));
  }

  #[test]
  fn duplicate_feature_names_are_rejected() {
    let mut d = definition();
    d.features.push(d.features[0].clone());
    assert!(matches!(d.validate(), Err(Error::InvalidDefinition(_))));
  }
}
