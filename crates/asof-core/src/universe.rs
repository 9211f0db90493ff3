//! Universe policies and the resolver that applies them.
//!
//! A policy is an ordered list of filter rules. The order is part of the
//! policy's content hash: reordering rules yields a different hash and must be
//! published as a new version.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  Error, Result,
  canonical::{Canon, ToCanon},
  market::{Bar, ListingStatus, SymbolMeta},
};

// ─── Policy ──────────────────────────────────────────────────────────────────

/// One filter in a universe policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum UniverseRule {
  /// Market cap must be at least `usd`.
  MinMarketCap { usd: f64 },
  /// Mean `close × volume` over the trailing `window` bars must be at least
  /// `usd`.
  MinDollarVolume { usd: f64, window: usize },
  ExchangeAllowList { exchanges: Vec<String> },
  ListingStatus { allowed: Vec<ListingStatus> },
  SectorDenyList { sectors: Vec<String> },
}

impl UniverseRule {
  fn name(&self) -> &'static str {
    match self {
      Self::MinMarketCap { .. } => "min_market_cap",
      Self::MinDollarVolume { .. } => "min_dollar_volume",
      Self::ExchangeAllowList { .. } => "exchange_allow_list",
      Self::ListingStatus { .. } => "listing_status",
      Self::SectorDenyList { .. } => "sector_deny_list",
    }
  }

  fn validate(&self) -> std::result::Result<(), String> {
    let threshold_ok = |v: f64| v.is_finite() && v >= 0.0;
    match self {
      Self::MinMarketCap { usd } if !threshold_ok(*usd) => {
        Err(format!("min_market_cap: bad threshold {usd}"))
      }
      Self::MinDollarVolume { usd, window } => {
        if !threshold_ok(*usd) {
          Err(format!("min_dollar_volume: bad threshold {usd}"))
        } else if *window == 0 {
          Err("min_dollar_volume: window must be positive".into())
        } else {
          Ok(())
        }
      }
      Self::ExchangeAllowList { exchanges } if exchanges.is_empty() => {
        Err("exchange_allow_list: empty list".into())
      }
      Self::ListingStatus { allowed } if allowed.is_empty() => {
        Err("listing_status: empty list".into())
      }
      _ => Ok(()),
    }
  }

  /// `Ok(())` if the candidate passes, otherwise the exclusion reason.
  fn apply(&self, meta: &SymbolMeta, bars: &[Bar]) -> std::result::Result<(), String> {
    match self {
      Self::MinMarketCap { usd } => match meta.market_cap {
        None => Err("market cap unknown".into()),
        Some(cap) if cap < *usd => Err(format!("market cap {cap} < {usd}")),
        Some(_) => Ok(()),
      },
      Self::MinDollarVolume { usd, window } => {
        if bars.len() < *window {
          return Err(format!(
            "{} bars, dollar volume needs {window}",
            bars.len()
          ));
        }
        let tail = &bars[bars.len() - window..];
        let mean = tail.iter().map(Bar::dollar_volume).sum::<f64>() / *window as f64;
        if mean < *usd {
          Err(format!("dollar volume {mean} < {usd}"))
        } else {
          Ok(())
        }
      }
      Self::ExchangeAllowList { exchanges } => {
        if exchanges.iter().any(|e| e == &meta.exchange) {
          Ok(())
        } else {
          Err(format!("exchange {} not allowed", meta.exchange))
        }
      }
      Self::ListingStatus { allowed } => {
        if allowed.contains(&meta.listing_status) {
          Ok(())
        } else {
          Err(format!("listing status {}", meta.listing_status))
        }
      }
      Self::SectorDenyList { sectors } => match &meta.sector {
        None => Err("sector unknown".into()),
        Some(s) if sectors.contains(s) => Err(format!("sector {s} denied")),
        Some(_) => Ok(()),
      },
    }
  }
}

impl ToCanon for UniverseRule {
  fn to_canon(&self) -> Result<Canon> {
    let mut fields = vec![("kind", Canon::str(self.name()))];
    match self {
      Self::MinMarketCap { usd } => fields.push(("usd", Canon::Num(*usd))),
      Self::MinDollarVolume { usd, window } => {
        fields.push(("usd", Canon::Num(*usd)));
        fields.push(("window", Canon::uint(*window as u64)?));
      }
      Self::ExchangeAllowList { exchanges } => {
        let set: BTreeSet<&String> = exchanges.iter().collect();
        fields.push(("exchanges", Canon::list(set.into_iter().map(Canon::str))));
      }
      Self::ListingStatus { allowed } => {
        let set: BTreeSet<&str> = allowed.iter().map(AsRef::as_ref).collect();
        fields.push(("allowed", Canon::list(set.into_iter().map(Canon::str))));
      }
      Self::SectorDenyList { sectors } => {
        let set: BTreeSet<&String> = sectors.iter().collect();
        fields.push(("sectors", Canon::list(set.into_iter().map(Canon::str))));
      }
    }
    Ok(Canon::map(fields))
  }
}

/// A versioned, immutable universe policy. A rule change means a new
/// `version` and a new `policy_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniversePolicy {
  pub policy_id: String,
  pub name:      String,
  pub version:   u32,
  pub rules:     Vec<UniverseRule>,
}

impl UniversePolicy {
  pub fn validate(&self) -> Result<()> {
    if self.policy_id.trim().is_empty() || self.name.trim().is_empty() {
      return Err(Error::InvalidDefinition(
        "universe policy needs a policy_id and a name".into(),
      ));
    }
    if self.version == 0 {
      return Err(Error::InvalidDefinition(format!(
        "{}: version must be positive",
        self.policy_id
      )));
    }
    if self.rules.is_empty() {
      return Err(Error::InvalidDefinition(format!(
        "{}: policy has no rules",
        self.policy_id
      )));
    }
    for rule in &self.rules {
      rule
        .validate()
        .map_err(|e| Error::InvalidDefinition(format!("{}: {e}", self.policy_id)))?;
    }
    Ok(())
  }

  pub fn policy_hash(&self) -> Result<String> { self.content_hash() }

  /// Longest bar window any rule needs.
  pub fn required_bars(&self) -> usize {
    self
      .rules
      .iter()
      .map(|r| match r {
        UniverseRule::MinDollarVolume { window, .. } => *window,
        _ => 0,
      })
      .max()
      .unwrap_or(0)
  }
}

impl ToCanon for UniversePolicy {
  /// `policy_id` is a label, not content: the hash covers name, version and
  /// the ordered rules.
  fn to_canon(&self) -> Result<Canon> {
    Ok(Canon::map([
      ("name", Canon::str(&self.name)),
      ("version", Canon::Int(i64::from(self.version))),
      (
        "rules",
        Canon::List(self.rules.iter().map(ToCanon::to_canon).collect::<Result<_>>()?),
      ),
    ]))
  }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// A symbol offered to the resolver, with whatever validated data exists.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
  pub symbol: &'a str,
  pub meta:   Option<&'a SymbolMeta>,
  /// Date-sorted, already validated against the as-of instant.
  pub bars:   &'a [Bar],
}

/// Output of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
  pub included:    BTreeSet<String>,
  /// Excluded symbol → reason of the first failing rule.
  pub excluded:    BTreeMap<String, String>,
  pub policy_hash: String,
}

/// Apply `policy` to `candidates` in rule order.
///
/// Candidates without metadata are excluded, never defaulted.
pub fn resolve(policy: &UniversePolicy, candidates: &[Candidate<'_>]) -> Result<Resolution> {
  policy.validate()?;
  let policy_hash = policy.policy_hash()?;

  let mut included = BTreeSet::new();
  let mut excluded = BTreeMap::new();

  'candidates: for c in candidates {
    let Some(meta) = c.meta else {
      excluded.insert(c.symbol.to_owned(), "metadata unresolved".to_owned());
      continue;
    };
    for rule in &policy.rules {
      if let Err(reason) = rule.apply(meta, c.bars) {
        debug!(symbol = c.symbol, rule = rule.name(), %reason, "excluded by universe rule");
        excluded.insert(c.symbol.to_owned(), format!("{}: {reason}", rule.name()));
        continue 'candidates;
      }
    }
    included.insert(c.symbol.to_owned());
  }

  Ok(Resolution { included, excluded, policy_hash })
}
