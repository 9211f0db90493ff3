//! `asof`: run Lab commands in-process against a SQLite file.
//!
//! # Usage
//!
//! ```
//! asof --config lab.toml daily-scan --as-of 2026-01-29T21:00:00Z
//! asof weekly-predict --as-of 2026-01-29T21:00:00Z --horizon 5
//! asof evaluate <prediction-run-id>
//! asof watchlist <prediction-run-id> --format csv
//! asof supersede <prediction-id> --score 0.4 --confidence 0.6 --rank 3 --reason "restated close"
//! asof audit snapshot <snapshot-id>
//! asof release-halt --note "bars restored from backup"
//! ```
//!
//! Every command prints its envelope as JSON and exits non-zero when the
//! envelope is not `ok`. A csv or markdown watchlist prints the rendered
//! table instead.

use std::{
  path::{Path, PathBuf},
  process::ExitCode,
  sync::Arc,
};

use anyhow::{Context, Result};
use asof_core::{model::RiskFlag, prediction::PredictionCorrection};
use asof_pipeline::{
  Envelope, Lab, LabConfig, WatchlistFormat,
  catalog::{self, US_LIQUID_V1},
  fixture,
};
use asof_store_sqlite::SqliteStore;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "asof", about = "Point-in-time snapshot, prediction and evaluation Lab")]
struct Args {
  /// Path to a TOML config file; `ASOF_*` variables override it.
  #[arg(short, long, value_name = "FILE", env = "ASOF_CONFIG")]
  config: Option<PathBuf>,

  /// SQLite store path, overriding the configured `store_path`.
  #[arg(long, value_name = "FILE")]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Snapshot, score and persist a one-day prediction run.
  DailyScan {
    #[arg(long)]
    as_of:  DateTime<Utc>,
    #[arg(long, default_value = US_LIQUID_V1)]
    policy: String,
  },
  /// Like `daily-scan` over a longer horizon.
  WeeklyPredict {
    #[arg(long)]
    as_of:   DateTime<Utc>,
    #[arg(long, default_value = US_LIQUID_V1)]
    policy:  String,
    /// Horizon in calendar days; defaults to `weekly_horizon_days`.
    #[arg(long)]
    horizon: Option<u32>,
  },
  /// Walk-forward evaluation of a prediction run that has come due.
  Evaluate { prediction_run_id: Uuid },
  /// Ranked candidates of a prediction run.
  Watchlist {
    prediction_run_id: Uuid,
    #[arg(long, default_value_t = WatchlistFormat::Json)]
    format:            WatchlistFormat,
  },
  /// Append a corrected prediction that supersedes an existing one.
  Supersede {
    prediction_id: Uuid,
    #[arg(long)]
    score:         Option<f64>,
    #[arg(long)]
    confidence:    Option<f64>,
    #[arg(long)]
    rank:          Option<u32>,
    /// Risk flag on the corrected prediction; repeatable.
    #[arg(long = "flag", value_name = "FLAG")]
    flags:         Vec<RiskFlag>,
    #[arg(long)]
    reason:        String,
  },
  /// Re-derive stored hashes.
  Audit {
    #[command(subcommand)]
    target: AuditTarget,
  },
  /// Lift every active audit halt.
  ReleaseHalt {
    #[arg(long)]
    note: String,
  },
}

#[derive(Subcommand, Debug)]
enum AuditTarget {
  Snapshot { snapshot_id: Uuid },
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode> {
  // Logs go to stderr; stdout carries the envelope.
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let args = Args::parse();

  let mut cfg = LabConfig::load(args.config.as_deref()).context("loading configuration")?;
  if let Some(store) = args.store {
    cfg.store_path = store;
  }
  cfg.store_path = expand_tilde(&cfg.store_path);
  let lab = open_lab(cfg).await?;

  let envelope = run(&lab, args.command).await;
  print(&envelope)?;
  Ok(if envelope.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn open_lab(cfg: LabConfig) -> Result<Lab<SqliteStore>> {
  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("opening store {}", cfg.store_path.display()))?;
  let sources = fixture::load_sources(&cfg).context("loading fixture sources")?;
  let definitions = catalog::configured(&cfg).context("loading definitions")?;
  let lab = Lab::new(Arc::new(store), sources, cfg);
  lab
    .register_definitions(&definitions)
    .await
    .context("registering definitions")?;
  Ok(lab)
}

async fn run(lab: &Lab<SqliteStore>, command: Command) -> Envelope {
  match command {
    Command::DailyScan { as_of, policy } => lab.daily_scan(as_of, &policy).await,
    Command::WeeklyPredict { as_of, policy, horizon } => {
      lab.weekly_predict(as_of, &policy, horizon).await
    }
    Command::Evaluate { prediction_run_id } => lab.evaluate(prediction_run_id).await,
    Command::Watchlist { prediction_run_id, format } => {
      lab.watchlist(prediction_run_id, format).await
    }
    Command::Supersede { prediction_id, score, confidence, rank, flags, reason } => {
      let correction = PredictionCorrection {
        score,
        confidence,
        rank,
        risk_flags: flags.into_iter().collect(),
        reason,
      };
      lab.correct_prediction(prediction_id, correction).await
    }
    Command::Audit { target: AuditTarget::Snapshot { snapshot_id } } => {
      lab.audit_snapshot(snapshot_id).await
    }
    Command::ReleaseHalt { note } => lab.release_halt(note).await,
  }
}

/// The rendered watchlist when there is one, the envelope otherwise.
fn print(envelope: &Envelope) -> Result<()> {
  let text = envelope
    .data
    .as_ref()
    .and_then(|d| d.get("text"))
    .and_then(|t| t.as_str());
  match text {
    Some(text) if envelope.ok => print!("{text}"),
    _ => println!(
      "{}",
      serde_json::to_string_pretty(envelope).context("serialising envelope")?
    ),
  }
  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn cli_definition_is_consistent() { Args::command().debug_assert(); }

  #[test]
  fn parses_commands() {
    let args = Args::try_parse_from([
      "asof",
      "weekly-predict",
      "--as-of",
      "2026-01-29T21:00:00Z",
      "--horizon",
      "10",
    ])
    .unwrap();
    match args.command {
      Command::WeeklyPredict { as_of, policy, horizon } => {
        assert_eq!(as_of, "2026-01-29T21:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(policy, US_LIQUID_V1);
        assert_eq!(horizon, Some(10));
      }
      other => panic!("unexpected {other:?}"),
    }

    let id = Uuid::new_v4().to_string();
    let args = Args::try_parse_from(["asof", "watchlist", id.as_str(), "--format", "csv"]).unwrap();
    assert!(matches!(
      args.command,
      Command::Watchlist { format: WatchlistFormat::Csv, .. }
    ));

    let args = Args::try_parse_from([
      "asof",
      "supersede",
      id.as_str(),
      "--score",
      "0.4",
      "--flag",
      "HUGE_GAP",
      "--flag",
      "EARNINGS_WINDOW",
      "--reason",
      "restated close",
    ])
    .unwrap();
    match args.command {
      Command::Supersede { score, rank, flags, reason, .. } => {
        assert_eq!(score, Some(0.4));
        assert_eq!(rank, None);
        assert_eq!(flags, vec![RiskFlag::HugeGap, RiskFlag::EarningsWindow]);
        assert_eq!(reason, "restated close");
      }
      other => panic!("unexpected {other:?}"),
    }
    assert!(Args::try_parse_from(["asof", "supersede", id.as_str()]).is_err());

    let args = Args::try_parse_from(["asof", "audit", "snapshot", id.as_str()]).unwrap();
    assert!(matches!(args.command, Command::Audit { target: AuditTarget::Snapshot { .. } }));

    assert!(Args::try_parse_from(["asof", "release-halt"]).is_err());
  }

  #[test]
  fn tilde_expands_to_home() {
    if let Ok(home) = std::env::var("HOME") {
      assert_eq!(expand_tilde(Path::new("~/lab.db")), PathBuf::from(home).join("lab.db"));
    }
    assert_eq!(expand_tilde(Path::new("/tmp/lab.db")), PathBuf::from("/tmp/lab.db"));
  }
}
