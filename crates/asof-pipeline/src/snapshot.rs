//! The snapshot pipeline: `PENDING → INGESTING → HASHING → COMMITTED | FAILED`.
//!
//! A committed snapshot for the same `(as_of, policy)` is always reused. A
//! new one is built from every configured source, merged by priority,
//! filtered through the universe policy, hashed and committed atomically. If
//! a concurrent pipeline commits the same key first, its snapshot wins and is
//! returned instead.

use std::collections::{BTreeMap, BTreeSet};

use asof_core::{
  Error, Result,
  market::{Bar, SymbolMeta},
  run::{RunKind, RunState, RunTracker},
  snapshot::{
    IngestParams, IngestRun, IngestStatus, Snapshot, SnapshotBundle, SnapshotSymbol,
    compute_snapshot_hash, ingest_run_hash,
  },
  store::{Committed, LabStore},
  universe::{Candidate, UniversePolicy, resolve},
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  envelope::CommandError,
  ingest::{IngestWindow, SourceData, ingest_sources},
  lab::{IntoCore, Lab},
  retry::RetryPolicy,
};

/// A snapshot ready for feature computation.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
  pub bundle:          SnapshotBundle,
  /// Set when this call ran the pipeline; `None` when a committed snapshot
  /// was reused.
  pub pipeline_run_id: Option<Uuid>,
  pub warnings:        Vec<String>,
}

/// Per-symbol pick across sources: the highest-priority source that has it.
#[derive(Default)]
struct Merged<'a> {
  meta: BTreeMap<&'a str, (&'a SymbolMeta, &'a str)>,
  bars: BTreeMap<&'a str, (&'a [Bar], &'a str)>,
}

fn merge(sources: &[SourceData]) -> Merged<'_> {
  let mut merged = Merged::default();
  for source in sources.iter().filter(|s| s.status != IngestStatus::Failed) {
    for (symbol, meta) in &source.meta {
      merged.meta.entry(symbol.as_str()).or_insert((meta, source.name.as_str()));
    }
    for (symbol, bars) in source.bars.iter().filter(|(_, b)| !b.is_empty()) {
      merged
        .bars
        .entry(symbol.as_str())
        .or_insert((bars.as_slice(), source.name.as_str()));
    }
  }
  merged
}

impl<S: LabStore> Lab<S> {
  /// Reuse the committed snapshot for `(as_of, policy)` or build one. A
  /// failed build names its `pipeline_run_id`.
  pub async fn ensure_snapshot(
    &self,
    as_of: DateTime<Utc>,
    policy: &UniversePolicy,
  ) -> std::result::Result<SnapshotOutcome, CommandError> {
    let existing = self.store.find_snapshot(as_of, &policy.policy_id).await.into_core()?;
    if let Some(existing) = existing {
      debug!(snapshot_id = %existing.snapshot_id, "reusing committed snapshot");
      let bundle = self.load_verified(existing.snapshot_id).await?;
      check_policy(&bundle, policy)?;
      return Ok(SnapshotOutcome { bundle, pipeline_run_id: None, warnings: Vec::new() });
    }

    let mut tracker = RunTracker::new(Uuid::new_v4(), RunKind::Snapshot);
    self.record(tracker.opening(self.now())).await?;
    match self.build_snapshot(&mut tracker, as_of, policy).await {
      Ok(outcome) => Ok(outcome),
      Err(err) => {
        if let Ok(t) = tracker.advance(RunState::Failed, Some(err.to_string()), self.now())
          && let Err(e) = self.record(t).await
        {
          warn!(run_id = %tracker.run_id, error = %e, "could not record failed snapshot run");
        }
        Err(CommandError::from(err).id("pipeline_run_id", tracker.run_id))
      }
    }
  }

  async fn build_snapshot(
    &self,
    tracker: &mut RunTracker,
    as_of: DateTime<Utc>,
    policy: &UniversePolicy,
  ) -> Result<SnapshotOutcome> {
    let cfg = &self.config;
    let pipeline_run_id = tracker.run_id;
    self.record(tracker.advance(RunState::Ingesting, None, self.now())?).await?;
    info!(
      %pipeline_run_id,
      %as_of,
      policy_id = %policy.policy_id,
      sources = self.sources.len(),
      "snapshot ingest started"
    );

    if self.sources.is_empty() {
      return Err(Error::InsufficientCoverage("no market-data sources configured".into()));
    }
    let window = IngestWindow {
      as_of,
      lookback_days: cfg.lookback_days,
      chunk_size: cfg.symbols_per_request,
    };
    let results = ingest_sources(
      &self.sources,
      &self.permits,
      RetryPolicy::from_config(cfg),
      window,
    )
    .await;

    let params = IngestParams {
      policy_id:     policy.policy_id.clone(),
      lookback_days: cfg.lookback_days,
    };
    let mut warnings = Vec::new();
    for source in &results {
      warnings.extend(source.warnings.iter().cloned());
      let run = IngestRun {
        run_id: Uuid::new_v4(),
        pipeline_run_id,
        as_of,
        source_name: source.name.clone(),
        status: source.status,
        params: params.clone(),
        error: source.error.clone(),
        symbols_fetched: source.symbols_fetched(),
        bars_accepted: source.bars_accepted,
        bars_rejected: source.bars_rejected,
        run_hash: ingest_run_hash(as_of, &source.name, source.status, &params)?,
      };
      self.store.record_ingest_run(run).await.into_core()?;
    }

    let usable = results.iter().filter(|s| s.status != IngestStatus::Failed).count();
    let ratio = usable as f64 / results.len() as f64;
    if ratio < cfg.min_source_ratio {
      return Err(Error::InsufficientCoverage(format!(
        "{usable} of {} sources usable, minimum ratio {}",
        results.len(),
        cfg.min_source_ratio
      )));
    }

    let merged = merge(&results);
    let symbols: BTreeSet<&str> = merged.meta.keys().chain(merged.bars.keys()).copied().collect();
    let candidates: Vec<Candidate<'_>> = symbols
      .iter()
      .map(|&symbol| Candidate {
        symbol,
        meta: merged.meta.get(symbol).map(|&(m, _)| m),
        bars: merged.bars.get(symbol).map_or(&[][..], |&(b, _)| b),
      })
      .collect();
    let resolution = resolve(policy, &candidates)?;
    info!(
      included = resolution.included.len(),
      excluded = resolution.excluded.len(),
      "universe resolved"
    );
    let min_symbols = cfg.min_symbols.max(1);
    if resolution.included.len() < min_symbols {
      return Err(Error::InsufficientCoverage(format!(
        "{} symbols resolved under {}, need at least {min_symbols}",
        resolution.included.len(),
        policy.policy_id
      )));
    }

    self.record(tracker.advance(RunState::Hashing, None, self.now())?).await?;
    let mut contents = BTreeMap::new();
    let mut sources = BTreeSet::new();
    for symbol in &resolution.included {
      let Some(&(meta, meta_source)) = merged.meta.get(symbol.as_str()) else {
        continue;
      };
      let (bars, bar_source) = merged
        .bars
        .get(symbol.as_str())
        .copied()
        .unwrap_or((&[][..], meta_source));
      sources.insert(meta_source);
      sources.insert(bar_source);
      contents.insert(symbol.clone(), SnapshotSymbol {
        meta:   meta.clone(),
        source: bar_source.to_owned(),
        bars:   bars.to_vec(),
      });
    }
    let snapshot_hash = compute_snapshot_hash(&resolution.policy_hash, &contents)?;
    let bundle = SnapshotBundle {
      snapshot: Snapshot {
        snapshot_id: Uuid::new_v4(),
        as_of,
        universe_policy_id: policy.policy_id.clone(),
        policy_hash: resolution.policy_hash,
        snapshot_hash,
        sources: sources.into_iter().map(str::to_owned).collect(),
        created_at: self.now(),
      },
      symbols: contents,
    };

    match self.store.commit_snapshot(bundle.clone()).await.into_core()? {
      Committed::Created(snapshot) => {
        self.record(tracker.advance(RunState::Committed, None, self.now())?).await?;
        info!(
          snapshot_id = %snapshot.snapshot_id,
          snapshot_hash = %snapshot.snapshot_hash,
          symbols = bundle.symbols.len(),
          "snapshot committed"
        );
        Ok(SnapshotOutcome { bundle, pipeline_run_id: Some(pipeline_run_id), warnings })
      }
      Committed::Existing(winner) => {
        let detail = format!("snapshot {} committed concurrently", winner.snapshot_id);
        self.record(tracker.advance(RunState::Committed, Some(detail), self.now())?).await?;
        let winner = self.load_verified(winner.snapshot_id).await?;
        check_policy(&winner, policy)?;
        warnings.push(format!(
          "snapshot {} was committed by a concurrent run and is reused",
          winner.snapshot.snapshot_id
        ));
        Ok(SnapshotOutcome { bundle: winner, pipeline_run_id: Some(pipeline_run_id), warnings })
      }
    }
  }
}

/// The stored policy hash must still match the policy's current definition.
fn check_policy(bundle: &SnapshotBundle, policy: &UniversePolicy) -> Result<()> {
  let recomputed = policy.policy_hash()?;
  if recomputed != bundle.snapshot.policy_hash {
    return Err(Error::DeterminismViolation {
      entity: "universe_policy",
      id: policy.policy_id.clone(),
      stored: bundle.snapshot.policy_hash.clone(),
      recomputed,
    });
  }
  Ok(())
}
