//! Snapshots: the immutable point-in-time anchor, and the ingest runs that
//! feed them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::{
  Error, Result,
  canonical::{Canon, ToCanon, hash_canon},
  market::{Bar, SymbolMeta, bar_series_canon},
};

// ─── Ingest runs ─────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IngestStatus {
  Success,
  /// The source answered but some rows or calls were rejected.
  Degraded,
  Failed,
}

/// One adapter invocation inside a snapshot pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRun {
  pub run_id:          Uuid,
  /// The snapshot pipeline run this ingest belongs to.
  pub pipeline_run_id: Uuid,
  pub as_of:           DateTime<Utc>,
  pub source_name:     String,
  pub status:          IngestStatus,
  pub params:          IngestParams,
  pub error:           Option<String>,
  pub symbols_fetched: usize,
  pub bars_accepted:   usize,
  pub bars_rejected:   usize,
  pub run_hash:        String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestParams {
  pub policy_id:     String,
  pub lookback_days: u32,
}

/// `run_hash` covers `(as_of, source_name, status, params)`.
pub fn ingest_run_hash(
  as_of: DateTime<Utc>,
  source_name: &str,
  status: IngestStatus,
  params: &IngestParams,
) -> Result<String> {
  hash_canon(&Canon::map([
    ("as_of", Canon::instant(as_of)),
    ("source_name", Canon::str(source_name)),
    ("status", Canon::str(status.as_ref())),
    (
      "params",
      Canon::map([
        ("policy_id", Canon::str(&params.policy_id)),
        ("lookback_days", Canon::Int(i64::from(params.lookback_days))),
      ]),
    ),
  ]))
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// The committed snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
  pub snapshot_id:        Uuid,
  pub as_of:              DateTime<Utc>,
  pub universe_policy_id: String,
  pub policy_hash:        String,
  pub snapshot_hash:      String,
  /// Names of sources that contributed data.
  pub sources:            Vec<String>,
  pub created_at:         DateTime<Utc>,
}

/// Everything a snapshot owns for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSymbol {
  pub meta:   SymbolMeta,
  pub source: String,
  /// Date-sorted, every bar dated on or before the snapshot's `as_of`.
  pub bars:   Vec<Bar>,
}

impl SnapshotSymbol {
  pub fn meta_hash(&self) -> Result<String> { self.meta.content_hash() }

  pub fn bars_hash(&self) -> Result<String> { hash_canon(&bar_series_canon(&self.bars)?) }
}

/// A snapshot row together with all of its children. This is the unit of
/// atomic commit and the unit features are computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBundle {
  pub snapshot: Snapshot,
  pub symbols:  BTreeMap<String, SnapshotSymbol>,
}

impl SnapshotBundle {
  /// Recompute the hash from the children and compare with the stored one.
  pub fn verify(&self) -> Result<()> {
    let recomputed = compute_snapshot_hash(&self.snapshot.policy_hash, &self.symbols)?;
    if recomputed != self.snapshot.snapshot_hash {
      return Err(Error::DeterminismViolation {
        entity: "snapshot",
        id: self.snapshot.snapshot_id.to_string(),
        stored: self.snapshot.snapshot_hash.clone(),
        recomputed,
      });
    }
    Ok(())
  }

  /// Check the point-in-time invariant over every child row.
  pub fn check_point_in_time(&self) -> Result<()> {
    for (symbol, data) in &self.symbols {
      if let Some(bar) = data.bars.iter().find(|b| !b.visible_at(self.snapshot.as_of)) {
        return Err(Error::Validation(format!(
          "snapshot {} holds {symbol} bar dated {} after as_of",
          self.snapshot.snapshot_id, bar.date
        )));
      }
    }
    Ok(())
  }
}

/// `snapshot_hash = H(sorted symbols, per-symbol metadata hash, per-symbol
/// bar-series hash, policy_hash)`.
///
/// Consumes the map in key order, so the result does not depend on the order
/// in which symbols were fetched.
pub fn compute_snapshot_hash(
  policy_hash: &str,
  symbols: &BTreeMap<String, SnapshotSymbol>,
) -> Result<String> {
  let mut per_symbol = BTreeMap::new();
  for (symbol, data) in symbols {
    if data.bars.windows(2).any(|w| w[0].date >= w[1].date) {
      return Err(Error::NonCanonical(format!(
        "{symbol}: bar series is not strictly date-ordered"
      )));
    }
    per_symbol.insert(
      symbol.clone(),
      Canon::map([
        ("meta_hash", Canon::Str(data.meta_hash()?)),
        ("bars_hash", Canon::Str(data.bars_hash()?)),
      ]),
    );
  }
  hash_canon(&Canon::map([
    ("policy_hash", Canon::str(policy_hash)),
    ("symbols", Canon::list(symbols.keys().map(Canon::str))),
    ("content", Canon::Map(per_symbol)),
  ]))
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;
  use proptest::prelude::*;

  use super::*;
  use crate::market::ListingStatus;

  fn symbol_data(symbol: &str, closes: &[f64]) -> SnapshotSymbol {
    let start = NaiveDate::from_ymd_opt(2025, 12, 1).unwrap();
    SnapshotSymbol {
      meta:   SymbolMeta {
        symbol:         symbol.into(),
        exchange:       "NYSE".into(),
        sector:         None,
        market_cap:     Some(1e10),
        listing_status: ListingStatus::Listed,
        earnings_dates: None,
      },
      source: "mock".into(),
      bars:   closes
        .iter()
        .enumerate()
        .map(|(i, c)| Bar {
          symbol: symbol.into(),
          date:   start + chrono::Days::new(i as u64),
          open:   *c,
          high:   *c,
          low:    *c,
          close:  *c,
          volume: 100,
        })
        .collect(),
    }
  }

  fn symbols(closes: &[f64]) -> BTreeMap<String, SnapshotSymbol> {
    ["AAA", "BBB"]
      .iter()
      .map(|s| (s.to_string(), symbol_data(s, closes)))
      .collect()
  }

  #[test]
  fn unchanged_input_hashes_identically() {
    let a = compute_snapshot_hash("p", &symbols(&[1.0, 2.0, 3.0])).unwrap();
    let b = compute_snapshot_hash("p", &symbols(&[1.0, 2.0, 3.0])).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn policy_hash_is_bound() {
    let s = symbols(&[1.0, 2.0]);
    assert_ne!(
      compute_snapshot_hash("p1", &s).unwrap(),
      compute_snapshot_hash("p2", &s).unwrap()
    );
  }

  #[test]
  fn unordered_series_is_rejected() {
    let mut s = symbols(&[1.0, 2.0]);
    s.get_mut("AAA").unwrap().bars.reverse();
    assert!(matches!(
      compute_snapshot_hash("p", &s),
      Err(Error::NonCanonical(_))
    ));
  }

  proptest! {
    #[test]
    fn any_single_bar_change_changes_hash(
      closes in prop::collection::vec(0.01f64..10_000.0, 1..40),
      idx in any::<prop::sample::Index>(),
      field in 0usize..5,
      bump in 1u64..1_000,
    ) {
      let base = symbols(&closes);
      let before = compute_snapshot_hash("p", &base).unwrap();

      let mut changed = base.clone();
      let bars = &mut changed.get_mut("BBB").unwrap().bars;
      let bar = &mut bars[idx.index(closes.len())];
      match field {
        0 => bar.open = f64::from_bits(bar.open.to_bits() + bump),
        1 => bar.high = f64::from_bits(bar.high.to_bits() + bump),
        2 => bar.low = f64::from_bits(bar.low.to_bits() + bump),
        3 => bar.close = f64::from_bits(bar.close.to_bits() + bump),
        _ => bar.volume += bump,
      }
      let after = compute_snapshot_hash("p", &changed).unwrap();
      prop_assert_ne!(&before, &after);
      prop_assert_eq!(before, compute_snapshot_hash("p", &base).unwrap());
    }
  }
}
