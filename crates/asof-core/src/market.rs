//! Raw market data as returned by adapters: symbol metadata and daily bars.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{
  Result,
  canonical::{Canon, ToCanon},
};

// ─── Metadata ────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ListingStatus {
  Listed,
  Halted,
  Delisted,
}

/// Per-symbol metadata as of a snapshot instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
  pub symbol:         String,
  pub exchange:       String,
  pub sector:         Option<String>,
  /// Market capitalisation in USD, when the source reports one.
  pub market_cap:     Option<f64>,
  pub listing_status: ListingStatus,
  /// Scheduled earnings dates known at the snapshot instant. `None` means no
  /// calendar was ingested for the symbol, which is different from an empty
  /// calendar.
  #[serde(default)]
  pub earnings_dates: Option<Vec<NaiveDate>>,
}

impl ToCanon for SymbolMeta {
  fn to_canon(&self) -> Result<Canon> {
    let earnings = match &self.earnings_dates {
      None => Canon::Null,
      Some(dates) => {
        let sorted: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        Canon::list(sorted.into_iter().map(Canon::date))
      }
    };
    Ok(Canon::map([
      ("symbol", Canon::str(&self.symbol)),
      ("exchange", Canon::str(&self.exchange)),
      ("sector", Canon::opt_str(self.sector.as_deref())),
      ("market_cap", Canon::opt_num(self.market_cap)),
      ("listing_status", Canon::str(self.listing_status.as_ref())),
      ("earnings_dates", earnings),
    ]))
  }
}

impl SymbolMeta {
  /// Schema check; a rejected record leaves the symbol unresolved.
  pub fn validate(&self) -> std::result::Result<(), String> {
    if self.symbol.trim().is_empty() {
      return Err("empty symbol".into());
    }
    if self.symbol != self.symbol.trim() {
      return Err(format!("symbol {:?} has surrounding whitespace", self.symbol));
    }
    if let Some(cap) = self.market_cap
      && (!cap.is_finite() || cap < 0.0)
    {
      return Err(format!("{}: invalid market cap {cap}", self.symbol));
    }
    Ok(())
  }
}

// ─── Bars ────────────────────────────────────────────────────────────────────

/// One OHLCV row. Prices in quote currency, volume in shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
  pub symbol: String,
  pub date:   NaiveDate,
  pub open:   f64,
  pub high:   f64,
  pub low:    f64,
  pub close:  f64,
  pub volume: u64,
}

impl Bar {
  /// Schema check: finite positive prices and a consistent high/low range.
  pub fn validate(&self) -> std::result::Result<(), String> {
    let prices = [self.open, self.high, self.low, self.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
      return Err(format!("{} {}: non-positive or non-finite price", self.symbol, self.date));
    }
    if self.high < self.open.max(self.close).max(self.low) {
      return Err(format!("{} {}: high below open/close/low", self.symbol, self.date));
    }
    if self.low > self.open.min(self.close) {
      return Err(format!("{} {}: low above open/close", self.symbol, self.date));
    }
    Ok(())
  }

  /// Whether the bar was knowable at `as_of`.
  pub fn visible_at(&self, as_of: DateTime<Utc>) -> bool {
    self.date <= as_of.date_naive()
  }

  pub fn dollar_volume(&self) -> f64 { self.close * self.volume as f64 }
}

impl ToCanon for Bar {
  fn to_canon(&self) -> Result<Canon> {
    Ok(Canon::map([
      ("date", Canon::date(self.date)),
      ("open", Canon::Num(self.open)),
      ("high", Canon::Num(self.high)),
      ("low", Canon::Num(self.low)),
      ("close", Canon::Num(self.close)),
      ("volume", Canon::uint(self.volume)?),
    ]))
  }
}

/// Canonical form of a whole bar series; `bars` must already be date-sorted.
pub fn bar_series_canon(bars: &[Bar]) -> Result<Canon> {
  Ok(Canon::List(
    bars.iter().map(ToCanon::to_canon).collect::<Result<_>>()?,
  ))
}

/// The last bar dated on or before `as_of`, from a date-sorted series.
pub fn last_visible(bars: &[Bar], as_of: DateTime<Utc>) -> Option<&Bar> {
  bars.iter().rev().find(|b| b.visible_at(as_of))
}
