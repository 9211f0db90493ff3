//! JSON fixture files served as market-data sources.
//!
//! ```json
//! {
//!   "source": "fixture",
//!   "symbols": [
//!     { "meta": { "symbol": "AAA", "exchange": "NYSE", ... },
//!       "bars": [ { "symbol": "AAA", "date": "2026-01-02", ... } ] }
//!   ]
//! }
//! ```
//!
//! Bars are served as stored, including any dated after the requested as-of.

use std::{path::Path, sync::Arc};

use asof_core::{
  adapter::{MarketDataAdapter, StaticAdapter},
  market::{Bar, SymbolMeta},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, config::LabConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
  pub source:  String,
  pub symbols: Vec<FixtureSymbol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSymbol {
  pub meta: SymbolMeta,
  #[serde(default)]
  pub bars: Vec<Bar>,
}

impl Fixture {
  pub fn into_adapter(self) -> StaticAdapter {
    self
      .symbols
      .into_iter()
      .fold(StaticAdapter::new(self.source), |adapter, s| {
        adapter.with_symbol(s.meta, s.bars)
      })
  }
}

/// Read a fixture file into an adapter.
pub fn load_fixture(path: &Path) -> Result<StaticAdapter> {
  let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
    path: path.to_path_buf(),
    source,
  })?;
  let fixture: Fixture = serde_json::from_str(&text).map_err(|source| Error::Fixture {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(fixture.into_adapter())
}

/// One adapter per configured fixture file, in priority order.
pub fn load_sources(cfg: &LabConfig) -> Result<Vec<Arc<dyn MarketDataAdapter>>> {
  cfg
    .fixture_paths
    .iter()
    .map(|path| Ok(Arc::new(load_fixture(path)?) as Arc<dyn MarketDataAdapter>))
    .collect()
}
