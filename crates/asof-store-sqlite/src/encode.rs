//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings, bar dates `YYYY-MM-DD`. Enums are stored
//! by their string names. Prices and derived values are `REAL`; SQLite keeps
//! the full `f64`, so a value read back hashes exactly as it did on write.

use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use asof_core::{
  audit::AuditHalt,
  evaluation::{EvaluationMetrics, EvaluationRun},
  feature::FeatureVector,
  market::{Bar, SymbolMeta},
  model::RiskFlag,
  prediction::{Prediction, PredictionRun, RunBinding},
  run::RunTransition,
  snapshot::{IngestParams, IngestRun, Snapshot},
};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(e.to_string()))
}

/// Parse a strum-named enum column.
pub fn decode_enum<T>(s: &str) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  s.parse().map_err(|e| Error::Decode(format!("{s:?}: {e}")))
}

pub fn encode_count(n: usize) -> Result<i64> {
  i64::try_from(n).map_err(|_| Error::Decode(format!("count {n} out of range")))
}

pub fn decode_count(n: i64) -> Result<usize> {
  usize::try_from(n).map_err(|_| Error::Decode(format!("negative count {n}")))
}

pub fn decode_u32(n: i64) -> Result<u32> {
  u32::try_from(n).map_err(|_| Error::Decode(format!("{n} is not a u32")))
}

// ─── Definitions ─────────────────────────────────────────────────────────────

/// What a definition insert found.
pub enum Registration {
  Inserted,
  /// Identical definition already present.
  Same(String),
  /// Same id or `(name, version)` with a different hash.
  Conflict(String),
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub struct RawTransition {
  pub run_id: String,
  pub kind:   String,
  pub state:  String,
  pub detail: Option<String>,
  pub at:     String,
}

impl RawTransition {
  pub fn from_transition(t: &RunTransition) -> Self {
    Self {
      run_id: encode_uuid(t.run_id),
      kind:   t.kind.as_ref().to_owned(),
      state:  t.state.as_ref().to_owned(),
      detail: t.detail.clone(),
      at:     encode_dt(t.at),
    }
  }

  pub fn into_transition(self) -> Result<RunTransition> {
    Ok(RunTransition {
      run_id: decode_uuid(&self.run_id)?,
      kind:   decode_enum(&self.kind)?,
      state:  decode_enum(&self.state)?,
      detail: self.detail,
      at:     decode_dt(&self.at)?,
    })
  }
}

pub struct RawIngestRun {
  pub run_id:          String,
  pub pipeline_run_id: String,
  pub as_of:           String,
  pub source_name:     String,
  pub status:          String,
  pub params_json:     String,
  pub error:           Option<String>,
  pub symbols_fetched: i64,
  pub bars_accepted:   i64,
  pub bars_rejected:   i64,
  pub run_hash:        String,
}

impl RawIngestRun {
  pub fn from_run(r: &IngestRun) -> Result<Self> {
    Ok(Self {
      run_id:          encode_uuid(r.run_id),
      pipeline_run_id: encode_uuid(r.pipeline_run_id),
      as_of:           encode_dt(r.as_of),
      source_name:     r.source_name.clone(),
      status:          r.status.as_ref().to_owned(),
      params_json:     serde_json::to_string(&r.params)?,
      error:           r.error.clone(),
      symbols_fetched: encode_count(r.symbols_fetched)?,
      bars_accepted:   encode_count(r.bars_accepted)?,
      bars_rejected:   encode_count(r.bars_rejected)?,
      run_hash:        r.run_hash.clone(),
    })
  }

  pub fn into_run(self) -> Result<IngestRun> {
    let params: IngestParams = serde_json::from_str(&self.params_json)?;
    Ok(IngestRun {
      run_id: decode_uuid(&self.run_id)?,
      pipeline_run_id: decode_uuid(&self.pipeline_run_id)?,
      as_of: decode_dt(&self.as_of)?,
      source_name: self.source_name,
      status: decode_enum(&self.status)?,
      params,
      error: self.error,
      symbols_fetched: decode_count(self.symbols_fetched)?,
      bars_accepted: decode_count(self.bars_accepted)?,
      bars_rejected: decode_count(self.bars_rejected)?,
      run_hash: self.run_hash,
    })
  }
}

pub struct RawSnapshot {
  pub snapshot_id:        String,
  pub as_of:              String,
  pub universe_policy_id: String,
  pub policy_hash:        String,
  pub snapshot_hash:      String,
  pub sources_json:       String,
  pub created_at:         String,
}

pub const SNAPSHOT_COLUMNS: &str = "snapshot_id, as_of, universe_policy_id, policy_hash, \
                                    snapshot_hash, sources_json, created_at";

impl RawSnapshot {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      snapshot_id:        row.get(0)?,
      as_of:              row.get(1)?,
      universe_policy_id: row.get(2)?,
      policy_hash:        row.get(3)?,
      snapshot_hash:      row.get(4)?,
      sources_json:       row.get(5)?,
      created_at:         row.get(6)?,
    })
  }

  pub fn from_snapshot(s: &Snapshot) -> Result<Self> {
    Ok(Self {
      snapshot_id:        encode_uuid(s.snapshot_id),
      as_of:              encode_dt(s.as_of),
      universe_policy_id: s.universe_policy_id.clone(),
      policy_hash:        s.policy_hash.clone(),
      snapshot_hash:      s.snapshot_hash.clone(),
      sources_json:       serde_json::to_string(&s.sources)?,
      created_at:         encode_dt(s.created_at),
    })
  }

  pub fn into_snapshot(self) -> Result<Snapshot> {
    Ok(Snapshot {
      snapshot_id:        decode_uuid(&self.snapshot_id)?,
      as_of:              decode_dt(&self.as_of)?,
      universe_policy_id: self.universe_policy_id,
      policy_hash:        self.policy_hash,
      snapshot_hash:      self.snapshot_hash,
      sources:            serde_json::from_str(&self.sources_json)?,
      created_at:         decode_dt(&self.created_at)?,
    })
  }
}

pub struct RawSymbol {
  pub symbol:         String,
  pub exchange:       String,
  pub sector:         Option<String>,
  pub market_cap:     Option<f64>,
  pub listing_status: String,
  pub earnings_json:  Option<String>,
  pub source:         String,
}

impl RawSymbol {
  pub fn from_meta(meta: &SymbolMeta, source: &str) -> Result<Self> {
    Ok(Self {
      symbol:         meta.symbol.clone(),
      exchange:       meta.exchange.clone(),
      sector:         meta.sector.clone(),
      market_cap:     meta.market_cap,
      listing_status: meta.listing_status.as_ref().to_owned(),
      earnings_json:  meta
        .earnings_dates
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?,
      source:         source.to_owned(),
    })
  }

  /// Returns the metadata and the source it came from.
  pub fn into_meta(self) -> Result<(SymbolMeta, String)> {
    let earnings_dates = self
      .earnings_json
      .as_deref()
      .map(serde_json::from_str)
      .transpose()?;
    Ok((
      SymbolMeta {
        symbol: self.symbol,
        exchange: self.exchange,
        sector: self.sector,
        market_cap: self.market_cap,
        listing_status: decode_enum(&self.listing_status)?,
        earnings_dates,
      },
      self.source,
    ))
  }
}

pub struct RawBar {
  pub symbol: String,
  pub date:   String,
  pub open:   f64,
  pub high:   f64,
  pub low:    f64,
  pub close:  f64,
  pub volume: i64,
}

impl RawBar {
  pub fn from_bar(b: &Bar) -> Result<Self> {
    Ok(Self {
      symbol: b.symbol.clone(),
      date:   encode_date(b.date),
      open:   b.open,
      high:   b.high,
      low:    b.low,
      close:  b.close,
      volume: i64::try_from(b.volume)
        .map_err(|_| Error::Decode(format!("{} volume {} out of range", b.symbol, b.volume)))?,
    })
  }

  pub fn into_bar(self) -> Result<Bar> {
    Ok(Bar {
      date:   decode_date(&self.date)?,
      open:   self.open,
      high:   self.high,
      low:    self.low,
      close:  self.close,
      volume: u64::try_from(self.volume)
        .map_err(|_| Error::Decode(format!("negative volume {}", self.volume)))?,
      symbol: self.symbol,
    })
  }
}

pub struct RawFeatureVector {
  pub features_id:    String,
  pub snapshot_id:    String,
  pub feature_set_id: String,
  pub values_json:    String,
  pub feature_hash:   String,
}

impl RawFeatureVector {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      features_id:    row.get(0)?,
      snapshot_id:    row.get(1)?,
      feature_set_id: row.get(2)?,
      values_json:    row.get(3)?,
      feature_hash:   row.get(4)?,
    })
  }

  pub fn into_vector(self) -> Result<FeatureVector> {
    Ok(FeatureVector {
      features_id:       decode_uuid(&self.features_id)?,
      snapshot_id:       decode_uuid(&self.snapshot_id)?,
      feature_set_id:    self.feature_set_id,
      per_symbol_values: serde_json::from_str(&self.values_json)?,
      feature_hash:      self.feature_hash,
    })
  }
}

pub struct RawPredictionRun {
  pub run_id:         String,
  pub as_of:          String,
  pub snapshot_id:    String,
  pub feature_set_id: String,
  pub model_id:       String,
  pub horizon_days:   i64,
  pub policy_hash:    String,
  pub snapshot_hash:  String,
  pub feature_hash:   String,
  pub model_hash:     String,
  pub run_hash:       String,
  pub created_at:     String,
}

pub const PREDICTION_RUN_COLUMNS: &str = "run_id, as_of, snapshot_id, feature_set_id, model_id, \
                                          horizon_days, policy_hash, snapshot_hash, \
                                          feature_hash, model_hash, run_hash, created_at";

impl RawPredictionRun {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      run_id:         row.get(0)?,
      as_of:          row.get(1)?,
      snapshot_id:    row.get(2)?,
      feature_set_id: row.get(3)?,
      model_id:       row.get(4)?,
      horizon_days:   row.get(5)?,
      policy_hash:    row.get(6)?,
      snapshot_hash:  row.get(7)?,
      feature_hash:   row.get(8)?,
      model_hash:     row.get(9)?,
      run_hash:       row.get(10)?,
      created_at:     row.get(11)?,
    })
  }

  pub fn from_run(r: &PredictionRun) -> Self {
    Self {
      run_id:         encode_uuid(r.run_id),
      as_of:          encode_dt(r.as_of),
      snapshot_id:    encode_uuid(r.snapshot_id),
      feature_set_id: r.feature_set_id.clone(),
      model_id:       r.model_id.clone(),
      horizon_days:   i64::from(r.horizon_days),
      policy_hash:    r.binding.policy_hash.clone(),
      snapshot_hash:  r.binding.snapshot_hash.clone(),
      feature_hash:   r.binding.feature_hash.clone(),
      model_hash:     r.binding.model_hash.clone(),
      run_hash:       r.run_hash.clone(),
      created_at:     encode_dt(r.created_at),
    }
  }

  pub fn into_run(self) -> Result<PredictionRun> {
    Ok(PredictionRun {
      run_id:         decode_uuid(&self.run_id)?,
      as_of:          decode_dt(&self.as_of)?,
      snapshot_id:    decode_uuid(&self.snapshot_id)?,
      feature_set_id: self.feature_set_id,
      model_id:       self.model_id,
      horizon_days:   decode_u32(self.horizon_days)?,
      binding:        RunBinding {
        policy_hash:   self.policy_hash,
        snapshot_hash: self.snapshot_hash,
        feature_hash:  self.feature_hash,
        model_hash:    self.model_hash,
      },
      run_hash:       self.run_hash,
      created_at:     decode_dt(&self.created_at)?,
    })
  }
}

/// A `predictions` row joined with its supersession and latest outcome.
pub struct RawPrediction {
  pub prediction_id:    String,
  pub run_id:           String,
  pub symbol:           String,
  pub score:            Option<f64>,
  pub confidence:       Option<f64>,
  pub rank:             Option<i64>,
  pub risk_flags_json:  String,
  pub prediction_hash:  String,
  pub supersedes:       Option<String>,
  pub recorded_at:      String,
  pub superseded_by:    Option<String>,
  pub realized_outcome: Option<f64>,
}

impl RawPrediction {
  pub fn from_prediction(p: &Prediction) -> Result<Self> {
    Ok(Self {
      prediction_id:    encode_uuid(p.prediction_id),
      run_id:           encode_uuid(p.run_id),
      symbol:           p.symbol.clone(),
      score:            p.score,
      confidence:       p.confidence,
      rank:             p.rank.map(i64::from),
      risk_flags_json:  encode_flags(&p.risk_flags)?,
      prediction_hash:  p.prediction_hash.clone(),
      supersedes:       p.supersedes.map(encode_uuid),
      recorded_at:      encode_dt(p.recorded_at),
      superseded_by:    None,
      realized_outcome: None,
    })
  }

  pub fn into_prediction(self) -> Result<Prediction> {
    Ok(Prediction {
      prediction_id:    decode_uuid(&self.prediction_id)?,
      run_id:           decode_uuid(&self.run_id)?,
      symbol:           self.symbol,
      score:            self.score,
      confidence:       self.confidence,
      rank:             self.rank.map(decode_u32).transpose()?,
      risk_flags:       serde_json::from_str(&self.risk_flags_json)?,
      prediction_hash:  self.prediction_hash,
      supersedes:       self.supersedes.as_deref().map(decode_uuid).transpose()?,
      recorded_at:      decode_dt(&self.recorded_at)?,
      superseded_by:    self.superseded_by.as_deref().map(decode_uuid).transpose()?,
      realized_outcome: self.realized_outcome,
    })
  }
}

pub fn encode_flags(flags: &BTreeSet<RiskFlag>) -> Result<String> {
  Ok(serde_json::to_string(flags)?)
}

pub struct RawEvaluationRun {
  pub eval_run_id:             String,
  pub prediction_run_id:       String,
  pub realization_as_of:       String,
  pub realization_snapshot_id: Option<String>,
  pub status:                  String,
  pub metrics_json:            Option<String>,
  pub metrics_hash:            Option<String>,
  pub reason:                  Option<String>,
  pub computed_at:             String,
}

impl RawEvaluationRun {
  pub fn from_run(r: &EvaluationRun) -> Result<Self> {
    Ok(Self {
      eval_run_id:             encode_uuid(r.eval_run_id),
      prediction_run_id:       encode_uuid(r.prediction_run_id),
      realization_as_of:       encode_dt(r.realization_as_of),
      realization_snapshot_id: r.realization_snapshot_id.map(encode_uuid),
      status:                  r.status.as_ref().to_owned(),
      metrics_json:            r.metrics.as_ref().map(serde_json::to_string).transpose()?,
      metrics_hash:            r.metrics_hash.clone(),
      reason:                  r.reason.clone(),
      computed_at:             encode_dt(r.computed_at),
    })
  }

  pub fn into_run(self) -> Result<EvaluationRun> {
    let metrics: Option<EvaluationMetrics> = self
      .metrics_json
      .as_deref()
      .map(serde_json::from_str)
      .transpose()?;
    Ok(EvaluationRun {
      eval_run_id: decode_uuid(&self.eval_run_id)?,
      prediction_run_id: decode_uuid(&self.prediction_run_id)?,
      realization_as_of: decode_dt(&self.realization_as_of)?,
      realization_snapshot_id: self
        .realization_snapshot_id
        .as_deref()
        .map(decode_uuid)
        .transpose()?,
      status: decode_enum(&self.status)?,
      metrics,
      metrics_hash: self.metrics_hash,
      reason: self.reason,
      computed_at: decode_dt(&self.computed_at)?,
    })
  }
}

pub struct RawHalt {
  pub halt_id:   String,
  pub entity:    String,
  pub entity_id: String,
  pub reason:    String,
  pub raised_at: String,
}

impl RawHalt {
  pub fn into_halt(self) -> Result<AuditHalt> {
    Ok(AuditHalt {
      halt_id:   decode_uuid(&self.halt_id)?,
      entity:    self.entity,
      entity_id: self.entity_id,
      reason:    self.reason,
      raised_at: decode_dt(&self.raised_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bar_volume_beyond_i64_is_rejected() {
    let bar = Bar {
      symbol: "A".into(),
      date:   NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
      open:   1.0,
      high:   1.0,
      low:    1.0,
      close:  1.0,
      volume: u64::MAX,
    };
    assert!(RawBar::from_bar(&bar).is_err());
  }

  #[test]
  fn dates_round_trip_through_text() {
    let d = NaiveDate::from_ymd_opt(2026, 1, 29).unwrap();
    assert_eq!(encode_date(d), "2026-01-29");
    assert_eq!(decode_date("2026-01-29").unwrap(), d);
  }
}
