//! Error type for loading configuration, definitions and fixtures.
//!
//! Command failures are reported as [`asof_core::Error`] inside the response
//! envelope; this type only covers startup.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("config error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("cannot read {path}: {source}")]
  Io {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("malformed fixture {path}: {source}")]
  Fixture {
    path:   PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Core(#[from] asof_core::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
