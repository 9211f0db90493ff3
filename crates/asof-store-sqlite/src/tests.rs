//! Integration tests for `SqliteStore` against an in-memory database.

use std::collections::{BTreeMap, BTreeSet};

use asof_core::{
  audit::AuditHalt,
  evaluation::EvaluationRun,
  feature::{self, FeatureSetDefinition, FeatureSpec, Formula},
  market::{Bar, ListingStatus, SymbolMeta},
  model::{RiskFlag, ScoreOutcome},
  prediction::{PredictionCorrection, PredictionOutcome, RunBinding, build_run},
  run::{RunKind, RunState, RunTracker},
  snapshot::{
    IngestParams, IngestRun, IngestStatus, Snapshot, SnapshotBundle, SnapshotSymbol,
    compute_snapshot_hash, ingest_run_hash,
  },
  store::{Committed, LabStore},
  universe::{UniversePolicy, UniverseRule},
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use uuid::Uuid;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn as_of() -> DateTime<Utc> { "2026-01-29T21:00:00Z".parse().unwrap() }

fn later() -> DateTime<Utc> { as_of() + Days::new(3) }

fn policy(version: u32, min_cap: f64) -> UniversePolicy {
  UniversePolicy {
    policy_id: format!("TEST_V{version}"),
    name:      "test".into(),
    version,
    rules:     vec![UniverseRule::MinMarketCap { usd: min_cap }],
  }
}

fn bars(symbol: &str, closes: &[f64]) -> Vec<Bar> {
  let start = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
  closes
    .iter()
    .enumerate()
    .map(|(i, c)| Bar {
      symbol: symbol.into(),
      date:   start + Days::new(i as u64),
      open:   *c,
      high:   c * 1.01,
      low:    c * 0.99,
      close:  *c,
      volume: 1_000 + i as u64,
    })
    .collect()
}

fn bundle(snapshot_id: Uuid) -> SnapshotBundle {
  let mut symbols = BTreeMap::new();
  for (symbol, earnings) in [
    ("AAA", None),
    ("BBB", Some(vec![NaiveDate::from_ymd_opt(2026, 2, 2).unwrap()])),
  ] {
    symbols.insert(symbol.to_string(), SnapshotSymbol {
      meta:   SymbolMeta {
        symbol:         symbol.into(),
        exchange:       "NASDAQ".into(),
        sector:         Some("Technology".into()),
        market_cap:     Some(2.5e10),
        listing_status: ListingStatus::Listed,
        earnings_dates: earnings,
      },
      source: "fixture".into(),
      bars:   bars(symbol, &[10.0, 10.5, 10.25, 11.0]),
    });
  }
  let policy_hash = policy(1, 1e9).policy_hash().unwrap();
  let snapshot_hash = compute_snapshot_hash(&policy_hash, &symbols).unwrap();
  SnapshotBundle {
    snapshot: Snapshot {
      snapshot_id,
      as_of: as_of(),
      universe_policy_id: "TEST_V1".into(),
      policy_hash,
      snapshot_hash,
      sources: vec!["fixture".into()],
      created_at: as_of(),
    },
    symbols,
  }
}

fn feature_set() -> FeatureSetDefinition {
  FeatureSetDefinition {
    feature_set_id: "FS_V1".into(),
    name:           "fs".into(),
    version:        1,
    features:       vec![
      FeatureSpec { name: "ret_1d".into(), formula: Formula::Return { window: 1 } },
      FeatureSpec { name: "ret_20d".into(), formula: Formula::Return { window: 20 } },
    ],
  }
}

// ─── Definitions ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn registering_identical_policy_is_idempotent() {
  let s = store().await;
  let first = s.register_policy(policy(1, 1e9), as_of()).await.unwrap();
  assert!(first.is_created());
  let second = s.register_policy(policy(1, 1e9), as_of()).await.unwrap();
  assert_eq!(second, Committed::Existing(policy(1, 1e9)));

  let fetched = s.get_policy("TEST_V1").await.unwrap().unwrap();
  assert_eq!(fetched, policy(1, 1e9));
  assert!(s.get_policy("NOPE").await.unwrap().is_none());
}

#[tokio::test]
async fn editing_rules_without_new_version_is_rejected() {
  let s = store().await;
  s.register_policy(policy(1, 1e9), as_of()).await.unwrap();

  let err = s.register_policy(policy(1, 2e9), as_of()).await.unwrap_err();
  assert!(matches!(err, Error::DefinitionConflict { .. }));
  assert!(matches!(
    asof_core::Error::from(err),
    asof_core::Error::InvalidDefinition(_)
  ));

  // A new version is fine.
  assert!(s.register_policy(policy(2, 2e9), as_of()).await.unwrap().is_created());
}

#[tokio::test]
async fn malformed_definition_is_rejected_before_insert() {
  let s = store().await;
  let mut bad = policy(1, 1e9);
  bad.rules.clear();
  let err = s.register_policy(bad, as_of()).await.unwrap_err();
  assert!(matches!(err, Error::Core(asof_core::Error::InvalidDefinition(_))));
  assert!(s.get_policy("TEST_V1").await.unwrap().is_none());
}

// ─── Run state ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn transitions_are_read_back_in_order() {
  let s = store().await;
  let mut tracker = RunTracker::new(Uuid::new_v4(), RunKind::Snapshot);
  s.record_transition(tracker.opening(as_of())).await.unwrap();
  for next in [RunState::Ingesting, RunState::Hashing, RunState::Failed] {
    let t = tracker.advance(next, Some("detail".into()), as_of()).unwrap();
    s.record_transition(t).await.unwrap();
  }

  let states: Vec<RunState> = s
    .transitions(tracker.run_id)
    .await
    .unwrap()
    .into_iter()
    .map(|t| t.state)
    .collect();
  assert_eq!(states, vec![
    RunState::Pending,
    RunState::Ingesting,
    RunState::Hashing,
    RunState::Failed
  ]);
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_round_trips_and_verifies() {
  let s = store().await;
  let original = bundle(Uuid::new_v4());
  let committed = s.commit_snapshot(original.clone()).await.unwrap();
  assert!(committed.is_created());

  let loaded = s
    .load_snapshot(original.snapshot.snapshot_id)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(loaded, original);
  loaded.verify().unwrap();

  let found = s.find_snapshot(as_of(), "TEST_V1").await.unwrap().unwrap();
  assert_eq!(found.snapshot_id, original.snapshot.snapshot_id);
}

#[tokio::test]
async fn second_commit_for_same_key_returns_the_first() {
  let s = store().await;
  let first = bundle(Uuid::new_v4());
  let second = bundle(Uuid::new_v4());

  s.commit_snapshot(first.clone()).await.unwrap();
  let outcome = s.commit_snapshot(second.clone()).await.unwrap();
  let Committed::Existing(existing) = outcome else {
    panic!("expected the existing snapshot");
  };
  assert_eq!(existing.snapshot_id, first.snapshot.snapshot_id);

  // Nothing of the losing bundle was written.
  assert!(
    s.load_snapshot(second.snapshot.snapshot_id)
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn concurrent_commits_leave_one_snapshot() {
  let s = store().await;
  let mut handles = Vec::new();
  for _ in 0..8 {
    let s = s.clone();
    handles.push(tokio::spawn(async move {
      s.commit_snapshot(bundle(Uuid::new_v4())).await.unwrap()
    }));
  }
  let mut created = 0;
  let mut ids = BTreeSet::new();
  for h in handles {
    let outcome = h.await.unwrap();
    if outcome.is_created() {
      created += 1;
    }
    ids.insert(outcome.into_inner().snapshot_id);
  }
  assert_eq!(created, 1);
  assert_eq!(ids.len(), 1);
}

const TABLES: [&str; 14] = [
  "definitions",
  "run_transitions",
  "ingest_runs",
  "snapshots",
  "snapshot_symbols",
  "snapshot_bars",
  "feature_vectors",
  "prediction_runs",
  "predictions",
  "prediction_supersessions",
  "evaluation_runs",
  "prediction_outcomes",
  "audit_halts",
  "halt_releases",
];

async fn row_count(s: &SqliteStore, table: &'static str) -> i64 {
  s.conn
    .call(move |conn| {
      Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
    })
    .await
    .unwrap()
}

/// Put at least one row in every table through the public API.
async fn populate(s: &SqliteStore) {
  s.register_policy(policy(1, 1e9), as_of()).await.unwrap();

  let tracker = RunTracker::new(Uuid::new_v4(), RunKind::Snapshot);
  s.record_transition(tracker.opening(as_of())).await.unwrap();

  let params = IngestParams { policy_id: "TEST_V1".into(), lookback_days: 90 };
  s.record_ingest_run(IngestRun {
    run_id:          Uuid::new_v4(),
    pipeline_run_id: tracker.run_id,
    as_of:           as_of(),
    source_name:     "fixture".into(),
    status:          IngestStatus::Success,
    run_hash:        ingest_run_hash(as_of(), "fixture", IngestStatus::Success, &params).unwrap(),
    params,
    error:           None,
    symbols_fetched: 2,
    bars_accepted:   8,
    bars_rejected:   0,
  })
  .await
  .unwrap();

  let (run, snapshot_id) = committed_run(s).await;
  let vector = feature::compute(&bundle(snapshot_id), &feature_set()).unwrap();
  s.put_feature_vector(vector, as_of()).await.unwrap();

  let preds = s.predictions(run.run_id).await.unwrap();
  let aaa = preds.iter().find(|p| p.symbol == "AAA").unwrap();
  s.supersede_prediction(
    aaa.prediction_id,
    PredictionCorrection {
      score:      Some(0.6),
      confidence: Some(0.6),
      rank:       Some(1),
      risk_flags: BTreeSet::new(),
      reason:     "restated close".into(),
    },
    later(),
  )
  .await
  .unwrap();

  let eval = EvaluationRun {
    eval_run_id:             Uuid::new_v4(),
    prediction_run_id:       run.run_id,
    realization_as_of:       later(),
    realization_snapshot_id: None,
    status:                  RunState::InsufficientData,
    metrics:                 None,
    metrics_hash:            None,
    reason:                  Some("1 evaluated".into()),
    computed_at:             later(),
  };
  s.record_evaluation(eval.clone(), vec![PredictionOutcome {
    prediction_id:   aaa.prediction_id,
    eval_run_id:     eval.eval_run_id,
    realized_return: 0.01,
    recorded_at:     later(),
  }])
  .await
  .unwrap();

  let violation = asof_core::Error::DeterminismViolation {
    entity:     "snapshot",
    id:         snapshot_id.to_string(),
    stored:     "a".into(),
    recomputed: "b".into(),
  };
  s.record_halt(AuditHalt::from_error(&violation, as_of()).unwrap())
    .await
    .unwrap();
  s.release_halts("checked".into(), later()).await.unwrap();
}

#[tokio::test]
async fn every_table_rejects_updates_and_deletes() {
  let s = store().await;
  populate(&s).await;

  for table in TABLES {
    let before = row_count(&s, table).await;
    assert!(before > 0, "{table} has no rows");

    let updated = s
      .conn
      .call(move |conn| {
        conn.execute(&format!("UPDATE {table} SET rowid = rowid"), [])?;
        Ok(())
      })
      .await;
    assert!(updated.is_err(), "{table} accepted an UPDATE");

    let deleted = s
      .conn
      .call(move |conn| {
        conn.execute(&format!("DELETE FROM {table}"), [])?;
        Ok(())
      })
      .await;
    assert!(deleted.is_err(), "{table} accepted a DELETE");

    assert_eq!(row_count(&s, table).await, before, "{table}");
  }
}

// ─── Features ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn feature_vector_is_stored_once_per_snapshot_and_set() {
  let s = store().await;
  let b = bundle(Uuid::new_v4());
  s.commit_snapshot(b.clone()).await.unwrap();

  let vector = feature::compute(&b, &feature_set()).unwrap();
  assert!(s.put_feature_vector(vector.clone(), as_of()).await.unwrap().is_created());
  let again = s.put_feature_vector(vector.clone(), as_of()).await.unwrap();
  assert_eq!(again, Committed::Existing(vector.clone()));

  let found = s
    .find_feature_vector(b.snapshot.snapshot_id, "FS_V1")
    .await
    .unwrap()
    .unwrap();
  assert_eq!(found, vector);
  // Null for the 20-day return survives the round trip.
  assert_eq!(found.per_symbol_values["AAA"]["ret_20d"], None);
  assert_eq!(
    found.recompute_hash(&feature_set(), &b.snapshot.snapshot_hash).unwrap(),
    vector.feature_hash
  );
}

// ─── Predictions ─────────────────────────────────────────────────────────────

fn binding() -> RunBinding {
  RunBinding {
    policy_hash:   "p".into(),
    snapshot_hash: "s".into(),
    feature_hash:  "f".into(),
    model_hash:    "m".into(),
  }
}

fn outcomes() -> BTreeMap<String, ScoreOutcome> {
  BTreeMap::from([
    ("AAA".to_string(), ScoreOutcome {
      score:      Some(0.7),
      confidence: Some(0.7),
      risk_flags: BTreeSet::new(),
    }),
    ("BBB".to_string(), ScoreOutcome {
      score:      None,
      confidence: None,
      risk_flags: BTreeSet::from([RiskFlag::DataMissing, RiskFlag::EarningsWindow]),
    }),
  ])
}

async fn committed_run(s: &SqliteStore) -> (asof_core::prediction::PredictionRun, Uuid) {
  let b = bundle(Uuid::new_v4());
  s.commit_snapshot(b.clone()).await.unwrap();
  let (run, preds) = build_run(
    as_of(),
    b.snapshot.snapshot_id,
    "FS_V1",
    "M_V1",
    5,
    binding(),
    &outcomes(),
    as_of(),
  )
  .unwrap();
  s.commit_prediction_run(run.clone(), preds).await.unwrap();
  (run, b.snapshot.snapshot_id)
}

#[tokio::test]
async fn prediction_run_round_trips_and_verifies() {
  let s = store().await;
  let (run, _) = committed_run(&s).await;

  let loaded = s.get_prediction_run(run.run_id).await.unwrap().unwrap();
  assert_eq!(loaded, run);
  let preds = s.predictions(run.run_id).await.unwrap();
  assert_eq!(preds.len(), 2);
  loaded.verify(&preds).unwrap();

  let bbb = preds.iter().find(|p| p.symbol == "BBB").unwrap();
  assert_eq!(bbb.rank, None);
  assert!(bbb.risk_flags.contains(&RiskFlag::DataMissing));
}

#[tokio::test]
async fn repeated_prediction_run_reuses_the_first() {
  let s = store().await;
  let (run, snapshot_id) = committed_run(&s).await;
  let (dup, preds) = build_run(
    as_of(),
    snapshot_id,
    "FS_V1",
    "M_V1",
    5,
    binding(),
    &outcomes(),
    as_of(),
  )
  .unwrap();
  let outcome = s.commit_prediction_run(dup, preds).await.unwrap();
  assert_eq!(outcome, Committed::Existing(run.clone()));
  assert_eq!(s.predictions(run.run_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn correction_appends_and_links() {
  let s = store().await;
  let (run, _) = committed_run(&s).await;
  let preds = s.predictions(run.run_id).await.unwrap();
  let old = preds.iter().find(|p| p.symbol == "AAA").unwrap();

  let correction = PredictionCorrection {
    score:      Some(0.65),
    confidence: Some(0.65),
    rank:       Some(1),
    risk_flags: BTreeSet::new(),
    reason:     "late metadata".into(),
  };
  let (sup, new) = s
    .supersede_prediction(old.prediction_id, correction.clone(), later())
    .await
    .unwrap();
  assert_eq!(sup.old_prediction_id, old.prediction_id);
  assert_eq!(sup.recorded_at, later());
  assert_eq!(new.supersedes, Some(old.prediction_id));

  let after = s.predictions(run.run_id).await.unwrap();
  assert_eq!(after.len(), 3);
  let old_row = after.iter().find(|p| p.prediction_id == old.prediction_id).unwrap();
  assert_eq!(old_row.superseded_by, Some(new.prediction_id));
  assert_eq!(old_row.score, Some(0.7));
  let new_row = after.iter().find(|p| p.prediction_id == new.prediction_id).unwrap();
  assert_eq!(new_row.recorded_at, later());
  // Corrections do not disturb the run hash.
  run.verify(&after).unwrap();

  let err = s
    .supersede_prediction(old.prediction_id, correction.clone(), later())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::AlreadySuperseded(_)));
  let err = s
    .supersede_prediction(Uuid::new_v4(), correction, later())
    .await
    .unwrap_err();
  assert!(matches!(err, Error::PredictionNotFound(_)));
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn evaluation_outcomes_are_joined_on_read() {
  let s = store().await;
  let (run, _) = committed_run(&s).await;
  let preds = s.predictions(run.run_id).await.unwrap();
  let aaa = preds.iter().find(|p| p.symbol == "AAA").unwrap();

  let eval = EvaluationRun {
    eval_run_id:             Uuid::new_v4(),
    prediction_run_id:       run.run_id,
    realization_as_of:       as_of() + Days::new(5),
    realization_snapshot_id: None,
    status:                  RunState::InsufficientData,
    metrics:                 None,
    metrics_hash:            None,
    reason:                  Some("1 evaluated".into()),
    computed_at:             as_of() + Days::new(6),
  };
  s.record_evaluation(eval.clone(), vec![PredictionOutcome {
    prediction_id:   aaa.prediction_id,
    eval_run_id:     eval.eval_run_id,
    realized_return: 0.031,
    recorded_at:     eval.computed_at,
  }])
  .await
  .unwrap();

  assert_eq!(s.evaluation_runs(run.run_id).await.unwrap(), vec![eval]);
  let after = s.predictions(run.run_id).await.unwrap();
  let aaa = after.iter().find(|p| p.symbol == "AAA").unwrap();
  assert_eq!(aaa.realized_outcome, Some(0.031));
}

// ─── Audit ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn halts_stay_active_until_released() {
  let s = store().await;
  assert!(s.active_halt().await.unwrap().is_none());

  let violation = asof_core::Error::DeterminismViolation {
    entity:     "snapshot",
    id:         "x".into(),
    stored:     "a".into(),
    recomputed: "b".into(),
  };
  let halt = AuditHalt::from_error(&violation, as_of()).unwrap();
  s.record_halt(halt.clone()).await.unwrap();
  assert_eq!(s.active_halt().await.unwrap(), Some(halt.clone()));

  let released = s.release_halts("checked by hand".into(), later()).await.unwrap();
  assert_eq!(released.len(), 1);
  assert_eq!(released[0].halt_id, halt.halt_id);
  assert_eq!(released[0].released_at, later());
  assert!(s.active_halt().await.unwrap().is_none());
  assert!(s.release_halts("again".into(), later()).await.unwrap().is_empty());
}
