//! Fan-out to market-data sources and post-fetch validation.
//!
//! Each source is fetched in its own task; bar requests are chunked by symbol
//! and every adapter call holds a permit from the Lab-wide semaphore. Results
//! are collected into ordered maps, so completion order never shows up in
//! what is hashed.

use std::{
  collections::{BTreeMap, BTreeSet, btree_map::Entry},
  sync::Arc,
};

use asof_core::{
  Error,
  adapter::MarketDataAdapter,
  market::{Bar, SymbolMeta},
  snapshot::IngestStatus,
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{Instrument as _, debug, info, warn};

use crate::retry::{RetryPolicy, retry_adapter_call};

/// What one snapshot run asks of every source.
#[derive(Debug, Clone, Copy)]
pub struct IngestWindow {
  pub as_of:         DateTime<Utc>,
  pub lookback_days: u32,
  pub chunk_size:    usize,
}

impl IngestWindow {
  /// First calendar date kept.
  fn earliest(&self) -> NaiveDate {
    let day = self.as_of.date_naive();
    day
      .checked_sub_days(Days::new(u64::from(self.lookback_days)))
      .unwrap_or(NaiveDate::MIN)
  }
}

/// Validated output of one source.
#[derive(Debug)]
pub struct SourceData {
  /// Position in the configured source list; lower wins on merge.
  pub priority:      usize,
  pub name:          String,
  pub status:        IngestStatus,
  pub error:         Option<String>,
  pub meta:          BTreeMap<String, SymbolMeta>,
  /// Date-sorted, unique dates, all within the window.
  pub bars:          BTreeMap<String, Vec<Bar>>,
  pub bars_accepted: usize,
  pub bars_rejected: usize,
  pub warnings:      Vec<String>,
}

impl SourceData {
  fn new(priority: usize, name: String) -> Self {
    Self {
      priority,
      name,
      status: IngestStatus::Success,
      error: None,
      meta: BTreeMap::new(),
      bars: BTreeMap::new(),
      bars_accepted: 0,
      bars_rejected: 0,
      warnings: Vec::new(),
    }
  }

  fn failed(mut self, error: String) -> Self {
    warn!(source = %self.name, %error, "source failed");
    self.warnings.push(format!("{}: source failed: {error}", self.name));
    self.status = IngestStatus::Failed;
    self.error = Some(error);
    self
  }

  fn degrade(&mut self, warning: String) {
    warn!(source = %self.name, %warning, "source degraded");
    if self.status == IngestStatus::Success {
      self.status = IngestStatus::Degraded;
    }
    self.warnings.push(warning);
  }

  pub fn symbols_fetched(&self) -> usize { self.meta.len() }
}

/// Ingest every source concurrently. The result is in priority order and has
/// exactly one entry per source.
pub async fn ingest_sources(
  sources: &[Arc<dyn MarketDataAdapter>],
  permits: &Arc<Semaphore>,
  retry: RetryPolicy,
  window: IngestWindow,
) -> Vec<SourceData> {
  let mut tasks = JoinSet::new();
  for (priority, adapter) in sources.iter().enumerate() {
    tasks.spawn(
      ingest_source(priority, Arc::clone(adapter), Arc::clone(permits), retry, window)
        .in_current_span(),
    );
  }

  let mut done: BTreeMap<usize, SourceData> = BTreeMap::new();
  while let Some(joined) = tasks.join_next().await {
    match joined {
      Ok(data) => {
        done.insert(data.priority, data);
      }
      Err(e) => warn!(error = %e, "ingest task did not complete"),
    }
  }

  sources
    .iter()
    .enumerate()
    .map(|(priority, adapter)| {
      done.remove(&priority).unwrap_or_else(|| {
        SourceData::new(priority, adapter.name().to_owned())
          .failed("ingest task did not complete".to_owned())
      })
    })
    .collect()
}

async fn ingest_source(
  priority: usize,
  adapter: Arc<dyn MarketDataAdapter>,
  permits: Arc<Semaphore>,
  retry: RetryPolicy,
  window: IngestWindow,
) -> SourceData {
  let name = adapter.name().to_owned();
  let data = SourceData::new(priority, name.clone());

  let metas = match Arc::clone(&permits).acquire_owned().await {
    Ok(_permit) => {
      let source: &dyn MarketDataAdapter = adapter.as_ref();
      retry_adapter_call(&name, retry, move |_| source.fetch_symbol_metadata(window.as_of)).await
    }
    Err(e) => return data.failed(e.to_string()),
  };
  let mut data = match metas {
    Ok(metas) => accept_metadata(data, metas),
    Err(e) => return data.failed(e.to_string()),
  };

  let symbols: Vec<String> = data.meta.keys().cloned().collect();
  let mut chunks = JoinSet::new();
  for chunk in symbols.chunks(window.chunk_size.max(1)) {
    let chunk = chunk.to_vec();
    let adapter = Arc::clone(&adapter);
    let permits = Arc::clone(&permits);
    let name = name.clone();
    chunks.spawn(
      async move {
        let result = match permits.acquire_owned().await {
          Ok(_permit) => {
            let (source, requested) = (adapter.as_ref(), chunk.as_slice());
            retry_adapter_call(&name, retry, move |_| {
              source.fetch_daily_bars(requested, window.as_of, window.lookback_days)
            })
            .await
          }
          Err(e) => Err(Error::Adapter { source_name: name.clone(), message: e.to_string() }),
        };
        (chunk, result)
      }
      .in_current_span(),
    );
  }

  while let Some(joined) = chunks.join_next().await {
    match joined {
      Ok((chunk, Ok(bars))) => accept_bars(&mut data, &chunk, bars, window),
      Ok((chunk, Err(e))) => {
        let warning = format!("{name}: bars for {} symbols failed: {e}", chunk.len());
        data.degrade(warning);
      }
      Err(e) => data.degrade(format!("{name}: bar request did not complete: {e}")),
    }
  }

  info!(
    source = %name,
    status = %data.status,
    symbols = data.symbols_fetched(),
    bars_accepted = data.bars_accepted,
    bars_rejected = data.bars_rejected,
    "source ingested"
  );
  data
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Keep schema-valid metadata. A symbol reported twice with different
/// content is dropped rather than resolved by arrival order.
fn accept_metadata(mut data: SourceData, metas: Vec<SymbolMeta>) -> SourceData {
  let mut conflicting = BTreeSet::new();
  let mut rejected = Vec::new();
  for meta in metas {
    if let Err(reason) = meta.validate() {
      rejected.push(reason);
      continue;
    }
    match data.meta.entry(meta.symbol.clone()) {
      Entry::Vacant(slot) => {
        slot.insert(meta);
      }
      Entry::Occupied(slot) if *slot.get() != meta => {
        conflicting.insert(meta.symbol);
      }
      Entry::Occupied(_) => {}
    }
  }
  for symbol in conflicting {
    data.meta.remove(&symbol);
    let warning = format!("{}: conflicting metadata for {symbol}, symbol dropped", data.name);
    data.degrade(warning);
  }
  for reason in rejected {
    let warning = format!("{}: metadata rejected: {reason}", data.name);
    data.degrade(warning);
  }
  data
}

/// Keep bars that belong to `requested`, fall inside the window and pass the
/// schema check. A series with a repeated date is dropped whole.
fn accept_bars(data: &mut SourceData, requested: &[String], bars: Vec<Bar>, window: IngestWindow) {
  let requested: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
  let earliest = window.earliest();
  let mut grouped: BTreeMap<String, Vec<Bar>> = BTreeMap::new();
  let (mut after_as_of, mut unrequested, mut invalid) = (0usize, 0usize, Vec::new());

  for bar in bars {
    if !requested.contains(bar.symbol.as_str()) {
      unrequested += 1;
    } else if !bar.visible_at(window.as_of) {
      after_as_of += 1;
    } else if bar.date < earliest {
      // Outside the lookback window; trimmed, not an error.
    } else if let Err(reason) = bar.validate() {
      invalid.push(reason);
    } else {
      grouped.entry(bar.symbol.clone()).or_default().push(bar);
    }
  }

  data.bars_rejected += after_as_of + unrequested + invalid.len();
  if after_as_of > 0 {
    let warning = format!("{}: dropped {after_as_of} bars dated after as_of", data.name);
    data.degrade(warning);
  }
  if unrequested > 0 {
    let warning = format!("{}: dropped {unrequested} bars for unrequested symbols", data.name);
    data.degrade(warning);
  }
  if let Some(first) = invalid.first() {
    let warning = format!("{}: dropped {} invalid bars ({first})", data.name, invalid.len());
    data.degrade(warning);
  }

  for (symbol, mut series) in grouped {
    series.sort_by_key(|b| b.date);
    if series.windows(2).any(|w| w[0].date == w[1].date) {
      data.bars_rejected += series.len();
      let warning = format!("{}: repeated bar dates for {symbol}, series dropped", data.name);
      data.degrade(warning);
      continue;
    }
    debug!(source = %data.name, %symbol, bars = series.len(), "bar series accepted");
    data.bars_accepted += series.len();
    data.bars.insert(symbol, series);
  }
}

#[cfg(test)]
mod tests {
  use asof_core::market::ListingStatus;

  use super::*;

  fn window() -> IngestWindow {
    IngestWindow {
      as_of:         "2026-01-29T21:00:00Z".parse().unwrap(),
      lookback_days: 30,
      chunk_size:    10,
    }
  }

  fn bar(symbol: &str, date: &str, close: f64) -> Bar {
    Bar {
      symbol: symbol.into(),
      date:   date.parse().unwrap(),
      open:   close,
      high:   close + 1.0,
      low:    close - 1.0,
      close,
      volume: 1_000,
    }
  }

  fn meta(symbol: &str, cap: f64) -> SymbolMeta {
    SymbolMeta {
      symbol:         symbol.into(),
      exchange:       "NYSE".into(),
      sector:         None,
      market_cap:     Some(cap),
      listing_status: ListingStatus::Listed,
      earnings_dates: None,
    }
  }

  #[test]
  fn bars_are_checked_against_as_of_and_window() {
    let mut data = SourceData::new(0, "mock".into());
    let mut broken = bar("AAA", "2026-01-27", 10.0);
    broken.high = 1.0;
    accept_bars(
      &mut data,
      &["AAA".to_owned()],
      vec![
        bar("AAA", "2026-01-29", 12.0),
        bar("AAA", "2026-01-28", 11.0),
        bar("AAA", "2026-01-30", 13.0),
        bar("AAA", "2025-11-01", 9.0),
        bar("ZZZ", "2026-01-28", 5.0),
        broken,
      ],
      window(),
    );

    let series = &data.bars["AAA"];
    let dates: Vec<String> = series.iter().map(|b| b.date.to_string()).collect();
    assert_eq!(dates, ["2026-01-28", "2026-01-29"]);
    assert_eq!(data.bars_accepted, 2);
    assert_eq!(data.bars_rejected, 3);
    assert_eq!(data.status, IngestStatus::Degraded);
  }

  #[test]
  fn repeated_dates_drop_the_series() {
    let mut data = SourceData::new(0, "mock".into());
    accept_bars(
      &mut data,
      &["AAA".to_owned(), "BBB".to_owned()],
      vec![
        bar("AAA", "2026-01-28", 11.0),
        bar("AAA", "2026-01-28", 11.5),
        bar("BBB", "2026-01-28", 7.0),
      ],
      window(),
    );
    assert!(!data.bars.contains_key("AAA"));
    assert_eq!(data.bars["BBB"].len(), 1);
    assert_eq!(data.bars_rejected, 2);
  }

  #[test]
  fn conflicting_metadata_is_dropped() {
    let data = accept_metadata(
      SourceData::new(0, "mock".into()),
      vec![meta("AAA", 1e9), meta("AAA", 1e9), meta("BBB", 1e9), meta("BBB", 2e9)],
    );
    assert!(data.meta.contains_key("AAA"));
    assert!(!data.meta.contains_key("BBB"));
    assert_eq!(data.status, IngestStatus::Degraded);
  }
}
