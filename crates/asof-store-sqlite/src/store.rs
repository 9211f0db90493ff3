//! [`SqliteStore`], the SQLite implementation of [`LabStore`].

use std::{collections::BTreeMap, path::Path};

use asof_core::{
  audit::{AuditHalt, HaltRelease},
  evaluation::EvaluationRun,
  feature::{FeatureSetDefinition, FeatureVector},
  model::ModelDefinition,
  prediction::{
    Prediction, PredictionCorrection, PredictionOutcome, PredictionRun, PredictionSupersession,
    RunBinding, prediction_hash,
  },
  run::RunTransition,
  snapshot::{IngestRun, Snapshot, SnapshotBundle, SnapshotSymbol},
  store::{Committed, LabStore},
  universe::UniversePolicy,
};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    PREDICTION_RUN_COLUMNS, RawBar, RawEvaluationRun, RawFeatureVector, RawHalt, RawIngestRun,
    RawPrediction, RawPredictionRun, RawSnapshot, RawSymbol, RawTransition, Registration,
    SNAPSHOT_COLUMNS, decode_uuid, encode_dt, encode_uuid,
  },
  schema::SCHEMA,
};

const POLICY: &str = "universe_policy";
const FEATURE_SET: &str = "feature_set";
const MODEL: &str = "model";

const PREDICTION_SELECT: &str = "SELECT
     p.prediction_id, p.run_id, p.symbol, p.score, p.confidence, p.rank,
     p.risk_flags_json, p.prediction_hash, p.supersedes, p.recorded_at,
     s.new_prediction_id AS superseded_by,
     (SELECT o.realized_return FROM prediction_outcomes o
       WHERE o.prediction_id = p.prediction_id
       ORDER BY o.recorded_at DESC LIMIT 1) AS realized_outcome
   FROM predictions p
   LEFT JOIN prediction_supersessions s ON s.old_prediction_id = p.prediction_id";

fn raw_prediction(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPrediction> {
  Ok(RawPrediction {
    prediction_id:    row.get(0)?,
    run_id:           row.get(1)?,
    symbol:           row.get(2)?,
    score:            row.get(3)?,
    confidence:       row.get(4)?,
    rank:             row.get(5)?,
    risk_flags_json:  row.get(6)?,
    prediction_hash:  row.get(7)?,
    supersedes:       row.get(8)?,
    recorded_at:      row.get(9)?,
    superseded_by:    row.get(10)?,
    realized_outcome: row.get(11)?,
  })
}

fn insert_prediction(conn: &rusqlite::Connection, p: &RawPrediction) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO predictions (
       prediction_id, run_id, symbol, score, confidence, rank,
       risk_flags_json, prediction_hash, supersedes, recorded_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    rusqlite::params![
      p.prediction_id,
      p.run_id,
      p.symbol,
      p.score,
      p.confidence,
      p.rank,
      p.risk_flags_json,
      p.prediction_hash,
      p.supersedes,
      p.recorded_at,
    ],
  )?;
  Ok(())
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Lab store backed by a single SQLite file.
///
/// Clones share one reference-counted connection.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Insert a definition unless an identical one exists; reject one that
  /// reuses an id or `(name, version)` with a different hash.
  async fn register<D>(
    &self,
    kind: &'static str,
    id: String,
    name: String,
    version: u32,
    hash: String,
    definition: D,
    at: DateTime<Utc>,
  ) -> Result<Committed<D>>
  where
    D: Serialize + DeserializeOwned,
  {
    let body = serde_json::to_string(&definition)?;
    let now = encode_dt(at);
    let id_str = id.clone();

    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let matches: Vec<(String, String, String)> = {
          let mut stmt = tx.prepare(
            "SELECT definition_id, definition_hash, body_json FROM definitions
             WHERE kind = ?1 AND (definition_id = ?2 OR (name = ?3 AND version = ?4))",
          )?;
          stmt
            .query_map(rusqlite::params![kind, id_str, name, version], |r| {
              Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<rusqlite::Result<_>>()?
        };

        if let Some((_, stored, _)) = matches.iter().find(|(i, h, _)| *i != id_str || *h != hash) {
          return Ok(Registration::Conflict(stored.clone()));
        }
        if let Some((_, _, body)) = matches.into_iter().next() {
          return Ok(Registration::Same(body));
        }

        tx.execute(
          "INSERT INTO definitions (
             kind, definition_id, name, version, definition_hash, body_json, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![kind, id_str, name, version, hash, body, now],
        )?;
        tx.commit()?;
        Ok(Registration::Inserted)
      })
      .await?;

    match outcome {
      Registration::Inserted => Ok(Committed::Created(definition)),
      Registration::Same(body) => Ok(Committed::Existing(serde_json::from_str(&body)?)),
      Registration::Conflict(stored) => Err(Error::DefinitionConflict { kind, id, stored }),
    }
  }

  async fn get_definition<D: DeserializeOwned>(
    &self,
    kind: &'static str,
    id: &str,
  ) -> Result<Option<D>> {
    let id_str = id.to_owned();
    let body: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT body_json FROM definitions WHERE kind = ?1 AND definition_id = ?2",
              rusqlite::params![kind, id_str],
              |r| r.get(0),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(body.as_deref().map(serde_json::from_str).transpose()?)
  }

  async fn snapshot_where(
    &self,
    clause: &'static str,
    params: Vec<String>,
  ) -> Result<Option<Snapshot>> {
    let raw: Option<RawSnapshot> = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE {clause}");
        Ok(
          conn
            .query_row(&sql, rusqlite::params_from_iter(params), RawSnapshot::from_row)
            .optional()?,
        )
      })
      .await?;
    raw.map(RawSnapshot::into_snapshot).transpose()
  }
}

// ─── LabStore impl ───────────────────────────────────────────────────────────

impl LabStore for SqliteStore {
  type Error = Error;

  // ── Definitions ───────────────────────────────────────────────────────────

  async fn register_policy(
    &self,
    policy: UniversePolicy,
    at: DateTime<Utc>,
  ) -> Result<Committed<UniversePolicy>> {
    policy.validate()?;
    let hash = policy.policy_hash()?;
    self
      .register(
        POLICY,
        policy.policy_id.clone(),
        policy.name.clone(),
        policy.version,
        hash,
        policy,
        at,
      )
      .await
  }

  async fn get_policy(&self, policy_id: &str) -> Result<Option<UniversePolicy>> {
    self.get_definition(POLICY, policy_id).await
  }

  async fn register_feature_set(
    &self,
    set: FeatureSetDefinition,
    at: DateTime<Utc>,
  ) -> Result<Committed<FeatureSetDefinition>> {
    set.validate()?;
    let hash = set.definition_hash()?;
    self
      .register(
        FEATURE_SET,
        set.feature_set_id.clone(),
        set.name.clone(),
        set.version,
        hash,
        set,
        at,
      )
      .await
  }

  async fn get_feature_set(&self, feature_set_id: &str) -> Result<Option<FeatureSetDefinition>> {
    self.get_definition(FEATURE_SET, feature_set_id).await
  }

  async fn register_model(
    &self,
    model: ModelDefinition,
    at: DateTime<Utc>,
  ) -> Result<Committed<ModelDefinition>> {
    model.validate()?;
    let hash = model.model_hash()?;
    self
      .register(
        MODEL,
        model.model_id.clone(),
        model.name.clone(),
        model.version,
        hash,
        model,
        at,
      )
      .await
  }

  async fn get_model(&self, model_id: &str) -> Result<Option<ModelDefinition>> {
    self.get_definition(MODEL, model_id).await
  }

  // ── Run state ─────────────────────────────────────────────────────────────

  async fn record_transition(&self, transition: RunTransition) -> Result<()> {
    let raw = RawTransition::from_transition(&transition);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO run_transitions (run_id, kind, state, detail, at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![raw.run_id, raw.kind, raw.state, raw.detail, raw.at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn transitions(&self, run_id: Uuid) -> Result<Vec<RunTransition>> {
    let id_str = encode_uuid(run_id);
    let raws: Vec<RawTransition> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, kind, state, detail, at FROM run_transitions
           WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawTransition {
              run_id: row.get(0)?,
              kind:   row.get(1)?,
              state:  row.get(2)?,
              detail: row.get(3)?,
              at:     row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawTransition::into_transition).collect()
  }

  async fn record_ingest_run(&self, run: IngestRun) -> Result<()> {
    let raw = RawIngestRun::from_run(&run)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO ingest_runs (
             run_id, pipeline_run_id, as_of, source_name, status, params_json,
             error, symbols_fetched, bars_accepted, bars_rejected, run_hash
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
          rusqlite::params![
            raw.run_id,
            raw.pipeline_run_id,
            raw.as_of,
            raw.source_name,
            raw.status,
            raw.params_json,
            raw.error,
            raw.symbols_fetched,
            raw.bars_accepted,
            raw.bars_rejected,
            raw.run_hash,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn ingest_runs(&self, pipeline_run_id: Uuid) -> Result<Vec<IngestRun>> {
    let id_str = encode_uuid(pipeline_run_id);
    let raws: Vec<RawIngestRun> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, pipeline_run_id, as_of, source_name, status, params_json,
                  error, symbols_fetched, bars_accepted, bars_rejected, run_hash
           FROM ingest_runs WHERE pipeline_run_id = ?1 ORDER BY source_name",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawIngestRun {
              run_id:          row.get(0)?,
              pipeline_run_id: row.get(1)?,
              as_of:           row.get(2)?,
              source_name:     row.get(3)?,
              status:          row.get(4)?,
              params_json:     row.get(5)?,
              error:           row.get(6)?,
              symbols_fetched: row.get(7)?,
              bars_accepted:   row.get(8)?,
              bars_rejected:   row.get(9)?,
              run_hash:        row.get(10)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawIngestRun::into_run).collect()
  }

  // ── Snapshots ─────────────────────────────────────────────────────────────

  async fn commit_snapshot(&self, bundle: SnapshotBundle) -> Result<Committed<Snapshot>> {
    let raw = RawSnapshot::from_snapshot(&bundle.snapshot)?;
    let mut symbols = Vec::with_capacity(bundle.symbols.len());
    let mut bars = Vec::new();
    for data in bundle.symbols.values() {
      symbols.push(RawSymbol::from_meta(&data.meta, &data.source)?);
      for bar in &data.bars {
        bars.push(RawBar::from_bar(bar)?);
      }
    }

    let existing: Option<RawSnapshot> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let inserted = tx.execute(
          "INSERT INTO snapshots (
             snapshot_id, as_of, universe_policy_id, policy_hash,
             snapshot_hash, sources_json, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
           ON CONFLICT (as_of, universe_policy_id) DO NOTHING",
          rusqlite::params![
            raw.snapshot_id,
            raw.as_of,
            raw.universe_policy_id,
            raw.policy_hash,
            raw.snapshot_hash,
            raw.sources_json,
            raw.created_at,
          ],
        )?;

        // Another writer committed this (as_of, policy) first.
        if inserted == 0 {
          let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
             WHERE as_of = ?1 AND universe_policy_id = ?2"
          );
          let existing = tx.query_row(
            &sql,
            rusqlite::params![raw.as_of, raw.universe_policy_id],
            RawSnapshot::from_row,
          )?;
          return Ok(Some(existing));
        }

        {
          let mut stmt = tx.prepare(
            "INSERT INTO snapshot_symbols (
               snapshot_id, symbol, exchange, sector, market_cap,
               listing_status, earnings_json, source
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          )?;
          for s in &symbols {
            stmt.execute(rusqlite::params![
              raw.snapshot_id,
              s.symbol,
              s.exchange,
              s.sector,
              s.market_cap,
              s.listing_status,
              s.earnings_json,
              s.source,
            ])?;
          }

          let mut stmt = tx.prepare(
            "INSERT INTO snapshot_bars (
               snapshot_id, symbol, date, open, high, low, close, volume
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          )?;
          for b in &bars {
            stmt.execute(rusqlite::params![
              raw.snapshot_id,
              b.symbol,
              b.date,
              b.open,
              b.high,
              b.low,
              b.close,
              b.volume,
            ])?;
          }
        }

        tx.commit()?;
        Ok(None)
      })
      .await?;

    match existing {
      Some(raw) => Ok(Committed::Existing(raw.into_snapshot()?)),
      None => Ok(Committed::Created(bundle.snapshot)),
    }
  }

  async fn find_snapshot(&self, as_of: DateTime<Utc>, policy_id: &str) -> Result<Option<Snapshot>> {
    self
      .snapshot_where("as_of = ?1 AND universe_policy_id = ?2", vec![
        encode_dt(as_of),
        policy_id.to_owned(),
      ])
      .await
  }

  async fn load_snapshot(&self, snapshot_id: Uuid) -> Result<Option<SnapshotBundle>> {
    let id_str = encode_uuid(snapshot_id);

    type Loaded = (RawSnapshot, Vec<RawSymbol>, Vec<RawBar>);
    let loaded: Option<Loaded> = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE snapshot_id = ?1");
        let Some(snapshot) = conn
          .query_row(&sql, rusqlite::params![id_str], RawSnapshot::from_row)
          .optional()?
        else {
          return Ok(None);
        };

        let mut stmt = conn.prepare(
          "SELECT symbol, exchange, sector, market_cap, listing_status, earnings_json, source
           FROM snapshot_symbols WHERE snapshot_id = ?1 ORDER BY symbol",
        )?;
        let symbols = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawSymbol {
              symbol:         row.get(0)?,
              exchange:       row.get(1)?,
              sector:         row.get(2)?,
              market_cap:     row.get(3)?,
              listing_status: row.get(4)?,
              earnings_json:  row.get(5)?,
              source:         row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
          "SELECT symbol, date, open, high, low, close, volume
           FROM snapshot_bars WHERE snapshot_id = ?1 ORDER BY symbol, date",
        )?;
        let bars = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawBar {
              symbol: row.get(0)?,
              date:   row.get(1)?,
              open:   row.get(2)?,
              high:   row.get(3)?,
              low:    row.get(4)?,
              close:  row.get(5)?,
              volume: row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some((snapshot, symbols, bars)))
      })
      .await?;

    let Some((snapshot, raw_symbols, raw_bars)) = loaded else {
      return Ok(None);
    };

    let mut symbols = BTreeMap::new();
    for raw in raw_symbols {
      let (meta, source) = raw.into_meta()?;
      symbols.insert(meta.symbol.clone(), SnapshotSymbol { meta, source, bars: Vec::new() });
    }
    for raw in raw_bars {
      let bar = raw.into_bar()?;
      let entry = symbols
        .get_mut(&bar.symbol)
        .ok_or_else(|| Error::Decode(format!("bar for {} has no symbol row", bar.symbol)))?;
      entry.bars.push(bar);
    }

    Ok(Some(SnapshotBundle { snapshot: snapshot.into_snapshot()?, symbols }))
  }

  // ── Features ──────────────────────────────────────────────────────────────

  async fn put_feature_vector(
    &self,
    vector: FeatureVector,
    at: DateTime<Utc>,
  ) -> Result<Committed<FeatureVector>> {
    let features_id = encode_uuid(vector.features_id);
    let snapshot_id = encode_uuid(vector.snapshot_id);
    let feature_set_id = vector.feature_set_id.clone();
    let values_json = serde_json::to_string(&vector.per_symbol_values)?;
    let feature_hash = vector.feature_hash.clone();
    let now = encode_dt(at);

    let existing: Option<RawFeatureVector> = self
      .conn
      .call(move |conn| {
        let inserted = conn.execute(
          "INSERT INTO feature_vectors (
             features_id, snapshot_id, feature_set_id, values_json, feature_hash, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT (snapshot_id, feature_set_id) DO NOTHING",
          rusqlite::params![
            features_id,
            snapshot_id,
            feature_set_id,
            values_json,
            feature_hash,
            now
          ],
        )?;
        if inserted > 0 {
          return Ok(None);
        }
        Ok(Some(conn.query_row(
          "SELECT features_id, snapshot_id, feature_set_id, values_json, feature_hash
           FROM feature_vectors WHERE snapshot_id = ?1 AND feature_set_id = ?2",
          rusqlite::params![snapshot_id, feature_set_id],
          RawFeatureVector::from_row,
        )?))
      })
      .await?;

    match existing {
      Some(raw) => Ok(Committed::Existing(raw.into_vector()?)),
      None => Ok(Committed::Created(vector)),
    }
  }

  async fn find_feature_vector(
    &self,
    snapshot_id: Uuid,
    feature_set_id: &str,
  ) -> Result<Option<FeatureVector>> {
    let snapshot_id = encode_uuid(snapshot_id);
    let feature_set_id = feature_set_id.to_owned();
    let raw: Option<RawFeatureVector> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT features_id, snapshot_id, feature_set_id, values_json, feature_hash
               FROM feature_vectors WHERE snapshot_id = ?1 AND feature_set_id = ?2",
              rusqlite::params![snapshot_id, feature_set_id],
              RawFeatureVector::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawFeatureVector::into_vector).transpose()
  }

  // ── Predictions ───────────────────────────────────────────────────────────

  async fn commit_prediction_run(
    &self,
    run: PredictionRun,
    predictions: Vec<Prediction>,
  ) -> Result<Committed<PredictionRun>> {
    let raw = RawPredictionRun::from_run(&run);
    let rows = predictions
      .iter()
      .map(RawPrediction::from_prediction)
      .collect::<Result<Vec<_>>>()?;

    let existing: Option<RawPredictionRun> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let inserted = tx.execute(
          &format!(
            "INSERT INTO prediction_runs ({PREDICTION_RUN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (snapshot_id, feature_set_id, model_id, horizon_days) DO NOTHING"
          ),
          rusqlite::params![
            raw.run_id,
            raw.as_of,
            raw.snapshot_id,
            raw.feature_set_id,
            raw.model_id,
            raw.horizon_days,
            raw.policy_hash,
            raw.snapshot_hash,
            raw.feature_hash,
            raw.model_hash,
            raw.run_hash,
            raw.created_at,
          ],
        )?;

        if inserted == 0 {
          let existing = tx.query_row(
            &format!(
              "SELECT {PREDICTION_RUN_COLUMNS} FROM prediction_runs
               WHERE snapshot_id = ?1 AND feature_set_id = ?2
                 AND model_id = ?3 AND horizon_days = ?4"
            ),
            rusqlite::params![raw.snapshot_id, raw.feature_set_id, raw.model_id, raw.horizon_days],
            RawPredictionRun::from_row,
          )?;
          return Ok(Some(existing));
        }

        for p in &rows {
          insert_prediction(&tx, p)?;
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;

    match existing {
      Some(raw) => Ok(Committed::Existing(raw.into_run()?)),
      None => Ok(Committed::Created(run)),
    }
  }

  async fn get_prediction_run(&self, run_id: Uuid) -> Result<Option<PredictionRun>> {
    let id_str = encode_uuid(run_id);
    let raw: Option<RawPredictionRun> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {PREDICTION_RUN_COLUMNS} FROM prediction_runs WHERE run_id = ?1"),
              rusqlite::params![id_str],
              RawPredictionRun::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawPredictionRun::into_run).transpose()
  }

  async fn predictions(&self, run_id: Uuid) -> Result<Vec<Prediction>> {
    let id_str = encode_uuid(run_id);
    let raws: Vec<RawPrediction> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "{PREDICTION_SELECT} WHERE p.run_id = ?1 ORDER BY p.symbol, p.recorded_at"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], raw_prediction)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawPrediction::into_prediction).collect()
  }

  async fn supersede_prediction(
    &self,
    old_id: Uuid,
    correction: PredictionCorrection,
    now: DateTime<Utc>,
  ) -> Result<(PredictionSupersession, Prediction)> {
    correction.validate()?;
    let old_str = encode_uuid(old_id);

    type Lookup = (String, String, Option<String>, RunBinding);
    let found: Option<Lookup> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT p.run_id, p.symbol, s.new_prediction_id,
                      r.policy_hash, r.snapshot_hash, r.feature_hash, r.model_hash
               FROM predictions p
               JOIN prediction_runs r ON r.run_id = p.run_id
               LEFT JOIN prediction_supersessions s ON s.old_prediction_id = p.prediction_id
               WHERE p.prediction_id = ?1",
              rusqlite::params![old_str],
              |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, RunBinding {
                  policy_hash:   row.get(3)?,
                  snapshot_hash: row.get(4)?,
                  feature_hash:  row.get(5)?,
                  model_hash:    row.get(6)?,
                }))
              },
            )
            .optional()?,
        )
      })
      .await?;

    let Some((run_id, symbol, superseded_by, binding)) = found else {
      return Err(Error::PredictionNotFound(old_id));
    };
    if superseded_by.is_some() {
      return Err(Error::AlreadySuperseded(old_id));
    }

    let replacement = Prediction {
      prediction_id:    Uuid::new_v4(),
      run_id:           decode_uuid(&run_id)?,
      prediction_hash:  prediction_hash(
        &symbol,
        correction.score,
        correction.confidence,
        correction.rank,
        &correction.risk_flags,
        &binding,
      )?,
      symbol,
      score:            correction.score,
      confidence:       correction.confidence,
      rank:             correction.rank,
      risk_flags:       correction.risk_flags,
      supersedes:       Some(old_id),
      recorded_at:      now,
      superseded_by:    None,
      realized_outcome: None,
    };
    let supersession = PredictionSupersession {
      supersession_id:   Uuid::new_v4(),
      old_prediction_id: old_id,
      new_prediction_id: replacement.prediction_id,
      reason:            correction.reason,
      recorded_at:       now,
    };

    let row = RawPrediction::from_prediction(&replacement)?;
    let sup_id = encode_uuid(supersession.supersession_id);
    let old_str = encode_uuid(old_id);
    let new_str = encode_uuid(replacement.prediction_id);
    let reason = supersession.reason.clone();
    let at = encode_dt(now);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        insert_prediction(&tx, &row)?;
        tx.execute(
          "INSERT INTO prediction_supersessions (
             supersession_id, old_prediction_id, new_prediction_id, reason, recorded_at
           ) VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![sup_id, old_str, new_str, reason, at],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok((supersession, replacement))
  }

  // ── Evaluation ────────────────────────────────────────────────────────────

  async fn record_evaluation(
    &self,
    run: EvaluationRun,
    outcomes: Vec<PredictionOutcome>,
  ) -> Result<()> {
    let raw = RawEvaluationRun::from_run(&run)?;
    let outcomes: Vec<(String, String, f64, String)> = outcomes
      .iter()
      .map(|o| {
        (
          encode_uuid(o.prediction_id),
          encode_uuid(o.eval_run_id),
          o.realized_return,
          encode_dt(o.recorded_at),
        )
      })
      .collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO evaluation_runs (
             eval_run_id, prediction_run_id, realization_as_of, realization_snapshot_id,
             status, metrics_json, metrics_hash, reason, computed_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          rusqlite::params![
            raw.eval_run_id,
            raw.prediction_run_id,
            raw.realization_as_of,
            raw.realization_snapshot_id,
            raw.status,
            raw.metrics_json,
            raw.metrics_hash,
            raw.reason,
            raw.computed_at,
          ],
        )?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO prediction_outcomes (prediction_id, eval_run_id, realized_return, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
          )?;
          for (prediction_id, eval_run_id, realized, at) in &outcomes {
            stmt.execute(rusqlite::params![prediction_id, eval_run_id, realized, at])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn evaluation_runs(&self, prediction_run_id: Uuid) -> Result<Vec<EvaluationRun>> {
    let id_str = encode_uuid(prediction_run_id);
    let raws: Vec<RawEvaluationRun> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT eval_run_id, prediction_run_id, realization_as_of, realization_snapshot_id,
                  status, metrics_json, metrics_hash, reason, computed_at
           FROM evaluation_runs WHERE prediction_run_id = ?1 ORDER BY computed_at",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], |row| {
            Ok(RawEvaluationRun {
              eval_run_id:             row.get(0)?,
              prediction_run_id:       row.get(1)?,
              realization_as_of:       row.get(2)?,
              realization_snapshot_id: row.get(3)?,
              status:                  row.get(4)?,
              metrics_json:            row.get(5)?,
              metrics_hash:            row.get(6)?,
              reason:                  row.get(7)?,
              computed_at:             row.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawEvaluationRun::into_run).collect()
  }

  // ── Audit ─────────────────────────────────────────────────────────────────

  async fn record_halt(&self, halt: AuditHalt) -> Result<()> {
    let id = encode_uuid(halt.halt_id);
    let at = encode_dt(halt.raised_at);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO audit_halts (halt_id, entity, entity_id, reason, raised_at)
           VALUES (?1, ?2, ?3, ?4, ?5)",
          rusqlite::params![id, halt.entity, halt.entity_id, halt.reason, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn active_halt(&self) -> Result<Option<AuditHalt>> {
    let raw: Option<RawHalt> = self
      .conn
      .call(|conn| {
        Ok(
          conn
            .query_row(
              "SELECT h.halt_id, h.entity, h.entity_id, h.reason, h.raised_at
               FROM audit_halts h
               WHERE NOT EXISTS (SELECT 1 FROM halt_releases r WHERE r.halt_id = h.halt_id)
               ORDER BY h.raised_at LIMIT 1",
              [],
              |row| {
                Ok(RawHalt {
                  halt_id:   row.get(0)?,
                  entity:    row.get(1)?,
                  entity_id: row.get(2)?,
                  reason:    row.get(3)?,
                  raised_at: row.get(4)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawHalt::into_halt).transpose()
  }

  async fn release_halts(&self, note: String, now: DateTime<Utc>) -> Result<Vec<HaltRelease>> {
    let at = encode_dt(now);
    let note_row = note.clone();

    let released: Vec<String> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
          let mut stmt = tx.prepare(
            "SELECT h.halt_id FROM audit_halts h
             WHERE NOT EXISTS (SELECT 1 FROM halt_releases r WHERE r.halt_id = h.halt_id)",
          )?;
          stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?
        };
        for id in &ids {
          tx.execute(
            "INSERT INTO halt_releases (halt_id, note, released_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, note_row, at],
          )?;
        }
        tx.commit()?;
        Ok(ids)
      })
      .await?;

    released
      .iter()
      .map(|id| {
        Ok(HaltRelease { halt_id: decode_uuid(id)?, note: note.clone(), released_at: now })
      })
      .collect()
  }
}
