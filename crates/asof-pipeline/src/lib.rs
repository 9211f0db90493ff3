//! Batch orchestration for the as-of Lab.
//!
//! [`Lab`] ties a [`LabStore`](asof_core::store::LabStore), the configured
//! market-data sources and a [`LabConfig`] together and exposes the command
//! surface: `daily_scan`, `weekly_predict`, `evaluate`, `watchlist`, plus the
//! operator commands `audit_snapshot` and `release_halt`. Every command
//! answers with an [`Envelope`].

pub mod catalog;
pub mod config;
pub mod envelope;
pub mod error;
pub mod evaluate;
pub mod fixture;
pub mod ingest;
pub mod lab;
pub mod predict;
pub mod retry;
pub mod snapshot;
pub mod watchlist;

pub use config::{Definitions, LabConfig};
pub use envelope::{Audit, Envelope};
pub use error::{Error, Result};
pub use lab::Lab;
pub use watchlist::WatchlistFormat;
