//! Built-in definitions registered on every Lab start.

use asof_core::{
  feature::{FeatureSetDefinition, FeatureSpec, Formula},
  market::ListingStatus,
  model::{FeatureWeight, ModelConfig, ModelDefinition, RiskThresholds},
  universe::{UniversePolicy, UniverseRule},
};

use crate::{
  Result,
  config::{Definitions, LabConfig},
};

pub const US_LIQUID_V1: &str = "US_LIQUID_V1";
pub const CORE_DAILY_V1: &str = "CORE_DAILY_V1";
pub const RULE_SCORE_V1: &str = "RULE_SCORE_V1";

/// Listed NYSE/NASDAQ names above $100M market cap trading at least $1M a
/// day over the last 20 sessions.
pub fn us_liquid_v1() -> UniversePolicy {
  UniversePolicy {
    policy_id: US_LIQUID_V1.to_owned(),
    name:      "US_LIQUID".to_owned(),
    version:   1,
    rules:     vec![
      UniverseRule::ListingStatus { allowed: vec![ListingStatus::Listed] },
      UniverseRule::ExchangeAllowList {
        exchanges: vec!["NYSE".to_owned(), "NASDAQ".to_owned()],
      },
      UniverseRule::MinMarketCap { usd: 1e8 },
      UniverseRule::MinDollarVolume { usd: 1e6, window: 20 },
    ],
  }
}

pub fn core_daily_v1() -> FeatureSetDefinition {
  let spec = |name: &str, formula| FeatureSpec { name: name.to_owned(), formula };
  FeatureSetDefinition {
    feature_set_id: CORE_DAILY_V1.to_owned(),
    name:           "CORE_DAILY".to_owned(),
    version:        1,
    features:       vec![
      spec("ret_1d", Formula::Return { window: 1 }),
      spec("ret_5d", Formula::Return { window: 5 }),
      spec("ret_20d", Formula::Return { window: 20 }),
      spec("ret_60d", Formula::Return { window: 60 }),
      spec("vol_20d", Formula::RealizedVol { window: 20 }),
      spec("atr_pct_14", Formula::AtrPct { window: 14 }),
      spec("gap", Formula::OvernightGap),
      spec("rel_vol_20d", Formula::RelativeVolume { window: 20 }),
      spec("dollar_vol_20d", Formula::DollarVolume { window: 20 }),
      spec("dist_ma_50", Formula::DistanceFromMa { window: 50 }),
      spec("trend_slope_20", Formula::TrendSlope { window: 20 }),
    ],
  }
}

/// Momentum and trend, tempered by volatility. Reads `ret_60d`, so a symbol
/// with less than 61 bars is unscored.
pub fn rule_score_v1() -> ModelDefinition {
  let weight = |feature: &str, weight, lower, upper| FeatureWeight {
    feature: feature.to_owned(),
    weight,
    lower,
    upper,
  };
  ModelDefinition {
    model_id: RULE_SCORE_V1.to_owned(),
    name:     "RULE_SCORE".to_owned(),
    version:  1,
    config:   ModelConfig {
      weights:      vec![
        weight("ret_20d", 0.3, -0.1, 0.1),
        weight("ret_60d", 0.2, -0.2, 0.2),
        weight("dist_ma_50", 0.2, -0.1, 0.1),
        weight("trend_slope_20", 0.2, -0.005, 0.005),
        weight("vol_20d", -0.1, 0.1, 0.6),
      ],
      risk:         RiskThresholds {
        liquidity_feature:    "dollar_vol_20d".to_owned(),
        min_dollar_volume:    1e7,
        gap_feature:          "gap".to_owned(),
        max_abs_gap:          0.05,
        min_market_cap:       3e8,
        move_feature:         "ret_1d".to_owned(),
        max_abs_1d_move:      0.1,
        earnings_window_days: 3,
      },
      flag_penalty: 0.1,
    },
  }
}

pub fn builtin() -> Definitions {
  Definitions {
    policies:     vec![us_liquid_v1()],
    feature_sets: vec![core_daily_v1()],
    models:       vec![rule_score_v1()],
  }
}

/// The built-in catalog followed by the configured definitions file, if any.
pub fn configured(cfg: &LabConfig) -> Result<Definitions> {
  let mut defs = builtin();
  if let Some(path) = &cfg.definitions_path {
    let extra = Definitions::load(path)?;
    defs.policies.extend(extra.policies);
    defs.feature_sets.extend(extra.feature_sets);
    defs.models.extend(extra.models);
  }
  Ok(defs)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtins_validate_and_fit_together() {
    let defs = builtin();
    defs.validate().unwrap();
    rule_score_v1().check_compatible(&core_daily_v1()).unwrap();
  }

  #[test]
  fn builtin_hashes_are_stable() {
    assert_eq!(
      us_liquid_v1().policy_hash().unwrap(),
      us_liquid_v1().policy_hash().unwrap()
    );
    assert_eq!(core_daily_v1().max_required_bars(), 61);
  }
}
