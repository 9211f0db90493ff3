//! The market-data adapter seam.
//!
//! Adapters are external collaborators: they return raw metadata and bars and
//! nothing else. The snapshot pipeline never trusts them to respect `as_of`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
  Result,
  market::{Bar, SymbolMeta},
};

#[async_trait]
pub trait MarketDataAdapter: Send + Sync {
  /// Stable source name recorded on ingest runs and in audit output.
  fn name(&self) -> &str;

  /// Metadata for every symbol the source knows about at `as_of`.
  async fn fetch_symbol_metadata(&self, as_of: DateTime<Utc>) -> Result<Vec<SymbolMeta>>;

  /// Daily bars for `symbols` covering `lookback_days` calendar days up to
  /// `as_of`.
  async fn fetch_daily_bars(
    &self,
    symbols: &[String],
    as_of: DateTime<Utc>,
    lookback_days: u32,
  ) -> Result<Vec<Bar>>;
}

/// An in-memory adapter serving fixed data.
///
/// It returns every bar it holds for the requested symbols, including bars
/// after `as_of`, so it can stand in for a misbehaving source.
#[derive(Debug, Clone, Default)]
pub struct StaticAdapter {
  name: String,
  meta: Vec<SymbolMeta>,
  bars: BTreeMap<String, Vec<Bar>>,
}

impl StaticAdapter {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), ..Self::default() }
  }

  pub fn with_symbol(mut self, meta: SymbolMeta, bars: Vec<Bar>) -> Self {
    self.bars.entry(meta.symbol.clone()).or_default().extend(bars);
    self.meta.push(meta);
    self
  }

  /// Add bars for a symbol without touching its metadata.
  pub fn with_bars(mut self, symbol: &str, bars: Vec<Bar>) -> Self {
    self.bars.entry(symbol.to_owned()).or_default().extend(bars);
    self
  }
}

#[async_trait]
impl MarketDataAdapter for StaticAdapter {
  fn name(&self) -> &str { &self.name }

  async fn fetch_symbol_metadata(&self, _as_of: DateTime<Utc>) -> Result<Vec<SymbolMeta>> {
    Ok(self.meta.clone())
  }

  async fn fetch_daily_bars(
    &self,
    symbols: &[String],
    _as_of: DateTime<Utc>,
    _lookback_days: u32,
  ) -> Result<Vec<Bar>> {
    Ok(
      symbols
        .iter()
        .filter_map(|s| self.bars.get(s))
        .flatten()
        .cloned()
        .collect(),
    )
  }
}
