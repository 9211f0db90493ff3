//! Rendering a prediction run's ranked candidates.

use asof_core::prediction::{Prediction, PredictionRun, ranked};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WatchlistFormat {
  #[default]
  Json,
  Csv,
  Markdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistRow {
  pub rank:            u32,
  pub symbol:          String,
  pub score:           f64,
  pub confidence:      f64,
  pub risk_flags:      Vec<String>,
  pub realized_return: Option<f64>,
}

/// Active, scored predictions in rank order. Unscored symbols never appear.
pub fn rows(predictions: &[Prediction]) -> Vec<WatchlistRow> {
  ranked(predictions)
    .into_iter()
    .enumerate()
    .map(|(i, p)| WatchlistRow {
      // A correction may carry its own rank; position in the active list wins.
      rank:            i as u32 + 1,
      symbol:          p.symbol.clone(),
      score:           p.score.unwrap_or_default(),
      confidence:      p.confidence.unwrap_or_default(),
      risk_flags:      p.risk_flags.iter().map(ToString::to_string).collect(),
      realized_return: p.realized_outcome,
    })
    .collect()
}

/// Text rendering for the non-JSON formats.
pub fn render(run: &PredictionRun, rows: &[WatchlistRow], format: WatchlistFormat) -> Option<String> {
  match format {
    WatchlistFormat::Json => None,
    WatchlistFormat::Csv => Some(render_csv(rows)),
    WatchlistFormat::Markdown => Some(render_markdown(run, rows)),
  }
}

fn opt(v: Option<f64>) -> String { v.map(|v| v.to_string()).unwrap_or_default() }

fn render_csv(rows: &[WatchlistRow]) -> String {
  let mut out = String::from("rank,symbol,score,confidence,risk_flags,realized_return\n");
  for r in rows {
    out.push_str(&format!(
      "{},{},{},{},{},{}\n",
      r.rank,
      r.symbol,
      r.score,
      r.confidence,
      r.risk_flags.join("|"),
      opt(r.realized_return),
    ));
  }
  out
}

fn render_markdown(run: &PredictionRun, rows: &[WatchlistRow]) -> String {
  let mut out = format!(
    "## Watchlist {} ({}d from {})\n\n| # | Symbol | Score | Confidence | Flags | Realized |\n|---|---|---|---|---|---|\n",
    run.run_id,
    run.horizon_days,
    run.as_of.format("%Y-%m-%d"),
  );
  for r in rows {
    out.push_str(&format!(
      "| {} | {} | {} | {} | {} | {} |\n",
      r.rank,
      r.symbol,
      r.score,
      r.confidence,
      r.risk_flags.join(", "),
      opt(r.realized_return),
    ));
  }
  out
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeSet;

  use asof_core::{model::RiskFlag, prediction::RunBinding};
  use chrono::Utc;
  use uuid::Uuid;

  use super::*;

  fn prediction(symbol: &str, score: Option<f64>, flags: &[RiskFlag]) -> Prediction {
    Prediction {
      prediction_id:    Uuid::new_v4(),
      run_id:           Uuid::nil(),
      symbol:           symbol.into(),
      score,
      confidence:       score.map(|_| 0.6),
      rank:             None,
      risk_flags:       flags.iter().copied().collect::<BTreeSet<_>>(),
      prediction_hash:  String::new(),
      supersedes:       None,
      recorded_at:      Utc::now(),
      superseded_by:    None,
      realized_outcome: None,
    }
  }

  fn run() -> PredictionRun {
    PredictionRun {
      run_id:         Uuid::nil(),
      as_of:          "2026-01-29T21:00:00Z".parse().unwrap(),
      snapshot_id:    Uuid::nil(),
      feature_set_id: "F".into(),
      model_id:       "M".into(),
      horizon_days:   5,
      binding:        RunBinding {
        policy_hash:   String::new(),
        snapshot_hash: String::new(),
        feature_hash:  String::new(),
        model_hash:    String::new(),
      },
      run_hash:       String::new(),
      created_at:     Utc::now(),
    }
  }

  #[test]
  fn unscored_and_superseded_are_left_out() {
    let mut old = prediction("OLD", Some(0.9), &[]);
    old.superseded_by = Some(Uuid::new_v4());
    let preds = vec![
      prediction("BBB", Some(0.4), &[RiskFlag::HugeGap]),
      prediction("AAA", Some(0.7), &[]),
      prediction("CCC", None, &[RiskFlag::DataMissing]),
      old,
    ];
    let rows = rows(&preds);
    let symbols: Vec<_> = rows.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(symbols, ["AAA", "BBB"]);
    assert_eq!(rows[1].rank, 2);
    assert_eq!(rows[1].risk_flags, ["HUGE_GAP"]);
  }

  #[test]
  fn csv_and_markdown() {
    let rows = rows(&[prediction("AAA", Some(0.7), &[])]);
    let csv = render(&run(), &rows, WatchlistFormat::Csv).unwrap();
    assert_eq!(
      csv,
      "rank,symbol,score,confidence,risk_flags,realized_return\n1,AAA,0.7,0.6,,\n"
    );
    let md = render(&run(), &rows, WatchlistFormat::Markdown).unwrap();
    assert!(md.contains("| 1 | AAA | 0.7 | 0.6 |  |  |"));
    assert!(render(&run(), &rows, WatchlistFormat::Json).is_none());
    assert_eq!("markdown".parse::<WatchlistFormat>().unwrap(), WatchlistFormat::Markdown);
  }
}
