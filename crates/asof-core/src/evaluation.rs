//! Walk-forward evaluation metrics.
//!
//! Everything here is pure: the engine in `asof-pipeline` gathers realized
//! returns from a realization snapshot and hands them in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  canonical::{Canon, ToCanon, round_finite, round_sig},
  market::{Bar, last_visible},
  run::RunState,
};

/// One prediction paired with what actually happened.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalPoint {
  pub prediction_id:   Uuid,
  pub symbol:          String,
  pub score:           f64,
  pub confidence:      f64,
  pub realized_return: f64,
}

impl EvalPoint {
  /// Score ≥ 0.5 calls an up move; a flat outcome is a miss either way.
  pub fn is_hit(&self) -> bool {
    if self.score >= 0.5 {
      self.realized_return > 0.0
    } else {
      self.realized_return < 0.0
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBucket {
  pub lower:           f64,
  pub upper:           f64,
  pub count:           usize,
  pub mean_confidence: Option<f64>,
  pub hit_rate:        Option<f64>,
  /// `|mean_confidence − hit_rate|`.
  pub abs_error:       Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
  pub evaluated:              usize,
  pub skipped:                usize,
  pub hit_rate:               f64,
  /// Count-weighted mean of bucket errors.
  pub mean_calibration_error: f64,
  /// Spearman correlation between score and realized return.
  pub rank_correlation:       Option<f64>,
  pub buckets:                Vec<CalibrationBucket>,
}

impl ToCanon for EvaluationMetrics {
  fn to_canon(&self) -> Result<Canon> {
    let buckets = self
      .buckets
      .iter()
      .map(|b| {
        Ok(Canon::map([
          ("lower", Canon::Num(b.lower)),
          ("upper", Canon::Num(b.upper)),
          ("count", Canon::uint(b.count as u64)?),
          ("mean_confidence", Canon::opt_num(b.mean_confidence)),
          ("hit_rate", Canon::opt_num(b.hit_rate)),
          ("abs_error", Canon::opt_num(b.abs_error)),
        ]))
      })
      .collect::<Result<_>>()?;
    Ok(Canon::map([
      ("evaluated", Canon::uint(self.evaluated as u64)?),
      ("skipped", Canon::uint(self.skipped as u64)?),
      ("hit_rate", Canon::Num(self.hit_rate)),
      ("mean_calibration_error", Canon::Num(self.mean_calibration_error)),
      ("rank_correlation", Canon::opt_num(self.rank_correlation)),
      ("buckets", Canon::List(buckets)),
    ]))
  }
}

/// One evaluation of one prediction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
  pub eval_run_id:             Uuid,
  pub prediction_run_id:       Uuid,
  pub realization_as_of:       DateTime<Utc>,
  pub realization_snapshot_id: Option<Uuid>,
  /// `SCORED`, `INSUFFICIENT_DATA` or `FAILED`.
  pub status:                  RunState,
  pub metrics:                 Option<EvaluationMetrics>,
  pub metrics_hash:            Option<String>,
  pub reason:                  Option<String>,
  pub computed_at:             DateTime<Utc>,
}

// ─── Realized returns ────────────────────────────────────────────────────────

/// Return from the last bar visible at `as_of` in the original series to the
/// last bar visible at `realization_as_of` in the realization series.
///
/// `None` when either side lacks a bar, or the realization bar is not
/// strictly later than the origin bar.
pub fn realized_return(
  origin: &[Bar],
  as_of: DateTime<Utc>,
  realization: &[Bar],
  realization_as_of: DateTime<Utc>,
) -> Option<f64> {
  let start = last_visible(origin, as_of)?;
  let end = last_visible(realization, realization_as_of)?;
  if end.date <= start.date {
    return None;
  }
  round_finite(end.close / start.close - 1.0)
}

// ─── Metrics ─────────────────────────────────────────────────────────────────

/// Compute metrics over `points`, bucketing confidence into `bucket_count`
/// equal-width buckets over `[0.5, 1]`. Confidences below 0.5 fall in the
/// first bucket.
pub fn compute_metrics(
  points: &[EvalPoint],
  skipped: usize,
  bucket_count: usize,
) -> Result<EvaluationMetrics> {
  if bucket_count == 0 {
    return Err(Error::Validation("calibration needs at least one bucket".into()));
  }
  if points.is_empty() {
    return Err(Error::Validation("no evaluated predictions".into()));
  }

  let hits = points.iter().filter(|p| p.is_hit()).count();
  let hit_rate = round_sig(hits as f64 / points.len() as f64);

  let width = 0.5 / bucket_count as f64;
  let mut members: Vec<Vec<&EvalPoint>> = vec![Vec::new(); bucket_count];
  for p in points {
    let idx = (((p.confidence - 0.5) / width).floor().max(0.0) as usize).min(bucket_count - 1);
    members[idx].push(p);
  }

  let mut weighted_error = 0.0;
  let buckets: Vec<CalibrationBucket> = members
    .iter()
    .enumerate()
    .map(|(i, ps)| {
      let lower = round_sig(0.5 + i as f64 * width);
      let upper = round_sig(0.5 + (i + 1) as f64 * width);
      if ps.is_empty() {
        return CalibrationBucket {
          lower,
          upper,
          count: 0,
          mean_confidence: None,
          hit_rate: None,
          abs_error: None,
        };
      }
      let n = ps.len() as f64;
      let mean_conf = ps.iter().map(|p| p.confidence).sum::<f64>() / n;
      let bucket_hits = ps.iter().filter(|p| p.is_hit()).count() as f64 / n;
      let err = (mean_conf - bucket_hits).abs();
      weighted_error += err * n;
      CalibrationBucket {
        lower,
        upper,
        count: ps.len(),
        mean_confidence: Some(round_sig(mean_conf)),
        hit_rate: Some(round_sig(bucket_hits)),
        abs_error: Some(round_sig(err)),
      }
    })
    .collect();

  let scores: Vec<f64> = points.iter().map(|p| p.score).collect();
  let realized: Vec<f64> = points.iter().map(|p| p.realized_return).collect();

  Ok(EvaluationMetrics {
    evaluated: points.len(),
    skipped,
    hit_rate,
    mean_calibration_error: round_sig(weighted_error / points.len() as f64),
    rank_correlation: spearman(&scores, &realized).and_then(round_finite),
    buckets,
  })
}

/// Average ranks (1-based), ties sharing the mean of their positions.
fn average_ranks(xs: &[f64]) -> Vec<f64> {
  let mut order: Vec<usize> = (0..xs.len()).collect();
  order.sort_by(|&a, &b| xs[a].total_cmp(&xs[b]));
  let mut ranks = vec![0.0; xs.len()];
  let mut i = 0;
  while i < order.len() {
    let mut j = i;
    while j + 1 < order.len() && xs[order[j + 1]] == xs[order[i]] {
      j += 1;
    }
    let avg = (i + j) as f64 / 2.0 + 1.0;
    for &k in &order[i..=j] {
      ranks[k] = avg;
    }
    i = j + 1;
  }
  ranks
}

/// Spearman rank correlation; `None` for fewer than two points or a constant
/// series.
pub fn spearman(xs: &[f64], ys: &[f64]) -> Option<f64> {
  if xs.len() != ys.len() || xs.len() < 2 {
    return None;
  }
  let (rx, ry) = (average_ranks(xs), average_ranks(ys));
  let n = rx.len() as f64;
  let (mx, my) = (rx.iter().sum::<f64>() / n, ry.iter().sum::<f64>() / n);
  let (mut cov, mut vx, mut vy) = (0.0, 0.0, 0.0);
  for (a, b) in rx.iter().zip(&ry) {
    cov += (a - mx) * (b - my);
    vx += (a - mx).powi(2);
    vy += (b - my).powi(2);
  }
  if vx == 0.0 || vy == 0.0 {
    return None;
  }
  Some(cov / (vx.sqrt() * vy.sqrt()))
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn point(symbol: &str, score: f64, confidence: f64, realized: f64) -> EvalPoint {
    EvalPoint {
      prediction_id: Uuid::nil(),
      symbol: symbol.into(),
      score,
      confidence,
      realized_return: realized,
    }
  }

  #[test]
  fn spearman_perfect_and_inverse() {
    assert_eq!(spearman(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]), Some(1.0));
    assert_eq!(spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), Some(-1.0));
    assert_eq!(spearman(&[1.0], &[1.0]), None);
    assert_eq!(spearman(&[1.0, 1.0], &[1.0, 2.0]), None);
  }

  #[test]
  fn ties_share_average_rank() {
    assert_eq!(average_ranks(&[5.0, 1.0, 5.0]), vec![2.5, 1.0, 2.5]);
  }

  #[test]
  fn hits_and_calibration() {
    let points = vec![
      point("A", 0.8, 0.8, 0.05),  // up, hit
      point("B", 0.9, 0.9, -0.02), // up, miss
      point("C", 0.2, 0.8, -0.01), // down, hit
      point("D", 0.6, 0.6, 0.0),   // flat, miss
    ];
    let m = compute_metrics(&points, 1, 5).unwrap();
    assert_eq!(m.evaluated, 4);
    assert_eq!(m.skipped, 1);
    assert_eq!(m.hit_rate, 0.5);
    assert_eq!(m.buckets.len(), 5);

    // [0.8, 0.9) holds A and C, both hits.
    let b = &m.buckets[3];
    assert_eq!((b.lower, b.upper, b.count), (0.8, 0.9, 2));
    assert_eq!(b.hit_rate, Some(1.0));
    assert_eq!(b.abs_error, Some(0.2));
    // 0.9 lands in the last bucket.
    assert_eq!(m.buckets[4].count, 1);
    assert_eq!(m.buckets[4].hit_rate, Some(0.0));
  }

  #[test]
  fn metrics_hash_is_stable() {
    let points = vec![point("A", 0.7, 0.7, 0.01), point("B", 0.3, 0.7, 0.02)];
    let a = compute_metrics(&points, 0, 4).unwrap();
    let b = compute_metrics(&points, 0, 4).unwrap();
    assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
  }

  #[test]
  fn empty_input_is_an_error() {
    assert!(compute_metrics(&[], 0, 5).is_err());
  }

  fn bar(date: &str, close: f64) -> Bar {
    Bar {
      symbol: "A".into(),
      date: date.parse::<NaiveDate>().unwrap(),
      open: close,
      high: close,
      low: close,
      close,
      volume: 1,
    }
  }

  #[test]
  fn realized_return_reads_each_side_at_its_own_instant() {
    let origin = vec![bar("2026-01-28", 100.0), bar("2026-01-29", 100.0)];
    let realization = vec![
      bar("2026-01-29", 100.0),
      bar("2026-02-03", 110.0),
      bar("2026-02-04", 999.0),
    ];
    let as_of = "2026-01-29T21:00:00Z".parse().unwrap();
    let until = "2026-02-03T21:00:00Z".parse().unwrap();
    assert_eq!(realized_return(&origin, as_of, &realization, until), Some(0.1));

    // No later bar: nothing realized.
    assert_eq!(realized_return(&origin, as_of, &origin, until), None);
  }
}
