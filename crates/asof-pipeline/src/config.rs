//! Runtime configuration and definitions files.
//!
//! Both are read with the `config` crate: an optional TOML file layered under
//! `ASOF_*` environment variables. Every [`LabConfig`] field has a default, so
//! an empty environment yields a usable Lab.

use std::path::{Path, PathBuf};

use asof_core::{
  feature::FeatureSetDefinition, model::ModelDefinition, universe::UniversePolicy,
};
use serde::Deserialize;

use crate::Result;

// ─── Lab configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LabConfig {
  pub store_path:          PathBuf,
  /// JSON fixture files served as market-data sources, highest priority
  /// first.
  pub fixture_paths:       Vec<PathBuf>,
  /// Optional TOML file with extra policies, feature sets and models.
  pub definitions_path:    Option<PathBuf>,
  /// Upper bound on in-flight adapter calls within one snapshot run.
  pub worker_count:        usize,
  pub symbols_per_request: usize,
  pub adapter_timeout_ms:  u64,
  /// Attempts per adapter call, the first one included.
  pub adapter_retries:     usize,
  /// Delay before the first retry; doubled on every further attempt.
  pub retry_backoff_ms:    u64,
  /// Calendar days of history embedded in each snapshot.
  pub lookback_days:       u32,
  pub min_symbols:         usize,
  /// Fraction of sources that must not fail for a snapshot to commit.
  pub min_source_ratio:    f64,
  pub calibration_buckets: usize,
  pub min_evaluated:       usize,
  pub feature_set_id:      String,
  pub model_id:            String,
  pub weekly_horizon_days: u32,
}

impl Default for LabConfig {
  fn default() -> Self {
    Self {
      store_path:          PathBuf::from("asof.db"),
      fixture_paths:       Vec::new(),
      definitions_path:    None,
      worker_count:        4,
      symbols_per_request: 50,
      adapter_timeout_ms:  10_000,
      adapter_retries:     3,
      retry_backoff_ms:    250,
      lookback_days:       120,
      min_symbols:         1,
      min_source_ratio:    0.5,
      calibration_buckets: 5,
      min_evaluated:       3,
      feature_set_id:      crate::catalog::CORE_DAILY_V1.to_owned(),
      model_id:            crate::catalog::RULE_SCORE_V1.to_owned(),
      weekly_horizon_days: 5,
    }
  }
}

impl LabConfig {
  /// Deserialize from already-built settings.
  pub fn from_settings(settings: config::Config) -> Result<Self> {
    Ok(settings.try_deserialize()?)
  }

  /// Load from `path` (if present) and the environment.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    Self::from_settings(settings(path)?)
  }
}

/// Layered settings: the TOML file at `path`, if any, then `ASOF_*`
/// variables. `ASOF_FIXTURE_PATHS` takes a comma-separated list.
pub fn settings(path: Option<&Path>) -> Result<config::Config> {
  let mut builder = config::Config::builder();
  if let Some(path) = path {
    builder = builder.add_source(config::File::from(path).required(false));
  }
  Ok(
    builder
      .add_source(
        config::Environment::with_prefix("ASOF")
          .try_parsing(true)
          .list_separator(",")
          .with_list_parse_key("fixture_paths"),
      )
      .build()?,
  )
}

// ─── Definitions file ────────────────────────────────────────────────────────

/// Extra definitions registered next to the built-in catalog.
///
/// ```toml
/// [[policies]]
/// policy_id = "US_MEGA_V1"
/// name      = "US_MEGA"
/// version   = 1
/// rules     = [{ kind = "min_market_cap", usd = 2e11 }]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Definitions {
  pub policies:     Vec<UniversePolicy>,
  pub feature_sets: Vec<FeatureSetDefinition>,
  pub models:       Vec<ModelDefinition>,
}

impl Definitions {
  /// Parse and schema-check a definitions file. A malformed definition fails
  /// the whole load.
  pub fn load(path: &Path) -> Result<Self> {
    let defs: Self = config::Config::builder()
      .add_source(config::File::from(path).format(config::FileFormat::Toml))
      .build()?
      .try_deserialize()?;
    defs.validate()?;
    Ok(defs)
  }

  pub fn validate(&self) -> asof_core::Result<()> {
    for p in &self.policies {
      p.validate()?;
    }
    for f in &self.feature_sets {
      f.validate()?;
    }
    for m in &self.models {
      m.validate()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::io::Write as _;

  use super::*;

  fn write_temp(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{name}-{}.toml", uuid::Uuid::new_v4()));
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(body.as_bytes()).unwrap();
    path
  }

  #[test]
  fn file_overrides_defaults() {
    let path = write_temp(
      "lab",
      r#"
worker_count = 2
min_source_ratio = 1.0
fixture_paths = ["a.json", "b.json"]
"#,
    );
    let cfg = LabConfig::load(Some(&path)).unwrap();
    assert_eq!(cfg.worker_count, 2);
    assert_eq!(cfg.min_source_ratio, 1.0);
    assert_eq!(cfg.fixture_paths, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
    assert_eq!(cfg.lookback_days, 120);
    assert_eq!(cfg.model_id, "RULE_SCORE_V1");
  }

  #[test]
  fn definitions_file_is_parsed_and_checked() {
    let path = write_temp(
      "defs",
      r#"
[[policies]]
policy_id = "US_MEGA_V1"
name = "US_MEGA"
version = 1
rules = [
  { kind = "exchange_allow_list", exchanges = ["NYSE"] },
  { kind = "min_market_cap", usd = 200000000000.0 },
]
"#,
    );
    let defs = Definitions::load(&path).unwrap();
    assert_eq!(defs.policies.len(), 1);
    assert_eq!(defs.policies[0].rules.len(), 2);

    let bad = write_temp(
      "defs-bad",
      r#"
[[policies]]
policy_id = "EMPTY_V1"
name = "EMPTY"
version = 1
rules = []
"#,
    );
    assert!(Definitions::load(&bad).is_err());
  }
}
