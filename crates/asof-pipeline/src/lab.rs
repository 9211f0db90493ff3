//! The [`Lab`] handle and its command surface.
//!
//! Every command returns an [`Envelope`], never a bare error. The pipeline
//! commands and prediction corrections refuse to run while an audit halt is
//! active; a determinism violation raised by any command records a new halt.
//! A failed envelope still names the run ids the command had recorded.

use std::{collections::BTreeMap, future::Future, sync::Arc};

use asof_core::{
  Error, Result,
  adapter::MarketDataAdapter,
  audit::AuditHalt,
  clock::{Clock, SystemClock},
  feature::FeatureSetDefinition,
  model::ModelDefinition,
  prediction::PredictionCorrection,
  run::RunTransition,
  snapshot::SnapshotBundle,
  store::LabStore,
  universe::UniversePolicy,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{Instrument as _, error, info, info_span, warn};
use uuid::Uuid;

use crate::{
  config::{Definitions, LabConfig},
  envelope::{Audit, CommandError, Envelope, Reply},
  watchlist::{self, WatchlistFormat},
};

/// Lift a backend error into the core taxonomy at the store seam.
pub(crate) trait IntoCore<T> {
  fn into_core(self) -> Result<T>;
}

impl<T, E: Into<Error>> IntoCore<T> for std::result::Result<T, E> {
  fn into_core(self) -> Result<T> { self.map_err(Into::into) }
}

/// A configured Lab: a store, the market-data sources in priority order, and
/// runtime settings.
pub struct Lab<S> {
  pub(crate) store:   Arc<S>,
  pub(crate) sources: Vec<Arc<dyn MarketDataAdapter>>,
  pub(crate) config:  LabConfig,
  pub(crate) clock:   Arc<dyn Clock>,
  /// Bounds in-flight adapter calls across all snapshot runs of this Lab.
  pub(crate) permits: Arc<Semaphore>,
}

impl<S: LabStore> Lab<S> {
  pub fn new(
    store: Arc<S>,
    sources: Vec<Arc<dyn MarketDataAdapter>>,
    config: LabConfig,
  ) -> Self {
    let permits = Arc::new(Semaphore::new(config.worker_count.max(1)));
    Self { store, sources, config, clock: Arc::new(SystemClock), permits }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn config(&self) -> &LabConfig { &self.config }

  pub(crate) fn now(&self) -> DateTime<Utc> { self.clock.now() }

  /// Register definitions; already-registered identical ones are no-ops.
  pub async fn register_definitions(&self, defs: &Definitions) -> Result<()> {
    defs.validate()?;
    let now = self.now();
    for p in &defs.policies {
      if self.store.register_policy(p.clone(), now).await.into_core()?.is_created() {
        info!(policy_id = %p.policy_id, version = p.version, "registered universe policy");
      }
    }
    for f in &defs.feature_sets {
      if self.store.register_feature_set(f.clone(), now).await.into_core()?.is_created() {
        info!(feature_set_id = %f.feature_set_id, version = f.version, "registered feature set");
      }
    }
    for m in &defs.models {
      if self.store.register_model(m.clone(), now).await.into_core()?.is_created() {
        info!(model_id = %m.model_id, version = m.version, "registered model");
      }
    }
    Ok(())
  }

  // ─── Commands ──────────────────────────────────────────────────────────

  /// Prediction run with a one-day horizon.
  pub async fn daily_scan(&self, as_of: DateTime<Utc>, policy_id: &str) -> Envelope {
    let ids = BTreeMap::from([("policy_id".to_owned(), policy_id.to_owned())]);
    self
      .run_command("daily_scan", true, ids, self.predict(as_of, policy_id, 1))
      .await
  }

  /// Prediction run over `horizon_days`, defaulting to the configured weekly
  /// horizon.
  pub async fn weekly_predict(
    &self,
    as_of: DateTime<Utc>,
    policy_id: &str,
    horizon_days: Option<u32>,
  ) -> Envelope {
    let horizon = horizon_days.unwrap_or(self.config.weekly_horizon_days);
    let ids = BTreeMap::from([("policy_id".to_owned(), policy_id.to_owned())]);
    self
      .run_command("weekly_predict", true, ids, self.predict(as_of, policy_id, horizon))
      .await
  }

  pub async fn evaluate(&self, prediction_run_id: Uuid) -> Envelope {
    let ids = BTreeMap::from([("prediction_run_id".to_owned(), prediction_run_id.to_string())]);
    self
      .run_command("evaluate", true, ids, self.evaluate_run(prediction_run_id))
      .await
  }

  pub async fn watchlist(&self, prediction_run_id: Uuid, format: WatchlistFormat) -> Envelope {
    let ids = BTreeMap::from([("prediction_run_id".to_owned(), prediction_run_id.to_string())]);
    self
      .run_command("watchlist", true, ids, self.watchlist_reply(prediction_run_id, format))
      .await
  }

  /// Append a corrected prediction that supersedes `prediction_id`. The
  /// original row stays as it was; the run hash is unaffected.
  pub async fn correct_prediction(
    &self,
    prediction_id: Uuid,
    correction: PredictionCorrection,
  ) -> Envelope {
    let ids = BTreeMap::from([("supersedes".to_owned(), prediction_id.to_string())]);
    self
      .run_command(
        "correct_prediction",
        true,
        ids,
        self.correction_reply(prediction_id, correction),
      )
      .await
  }

  /// Re-derive a stored snapshot's hash. Allowed during a halt.
  pub async fn audit_snapshot(&self, snapshot_id: Uuid) -> Envelope {
    let ids = BTreeMap::from([("snapshot_id".to_owned(), snapshot_id.to_string())]);
    self
      .run_command("audit_snapshot", false, ids, self.audit_reply(snapshot_id))
      .await
  }

  /// Lift every active halt, appending a release record with `note`.
  pub async fn release_halt(&self, note: String) -> Envelope {
    self
      .run_command("release_halt", false, BTreeMap::new(), self.release_reply(note))
      .await
  }

  async fn run_command<F, E>(
    &self,
    command: &'static str,
    gated: bool,
    mut ids: BTreeMap<String, String>,
    work: F,
  ) -> Envelope
  where
    F: Future<Output = std::result::Result<Reply, E>>,
    E: Into<CommandError>,
  {
    let correlation_id = Uuid::new_v4();
    let span = info_span!("command", command, %correlation_id);
    async move {
      let result: std::result::Result<Reply, CommandError> = match self.check_halt(gated).await {
        Ok(()) => work.await.map_err(Into::into),
        Err(e) => Err(e.into()),
      };
      match result {
        Ok(reply) => {
          info!(warnings = reply.warnings.len(), "command succeeded");
          Envelope::success(correlation_id, reply)
        }
        Err(CommandError { error, ids: allocated }) => {
          self.raise_halt(&error).await;
          warn!(error = %error, kind = error.kind(), "command failed");
          ids.extend(allocated);
          Envelope::failure(correlation_id, &error, ids)
        }
      }
    }
    .instrument(span)
    .await
  }

  async fn check_halt(&self, gated: bool) -> Result<()> {
    if !gated {
      return Ok(());
    }
    match self.store.active_halt().await.into_core()? {
      Some(halt) => Err(Error::Halted(format!(
        "{} (halt {} raised {})",
        halt.reason, halt.halt_id, halt.raised_at
      ))),
      None => Ok(()),
    }
  }

  async fn raise_halt(&self, err: &Error) {
    let Some(halt) = AuditHalt::from_error(err, self.now()) else {
      return;
    };
    error!(
      halt_id = %halt.halt_id,
      entity = %halt.entity,
      entity_id = %halt.entity_id,
      reason = %halt.reason,
      "determinism violation, halting automated processing"
    );
    if let Err(e) = self.store.record_halt(halt).await.into_core() {
      error!(error = %e, "could not record audit halt");
    }
  }

  // ─── Shared steps ──────────────────────────────────────────────────────

  pub(crate) async fn record(&self, transition: RunTransition) -> Result<()> {
    info!(
      run_id = %transition.run_id,
      kind = %transition.kind,
      state = %transition.state,
      "run transition"
    );
    self.store.record_transition(transition).await.into_core()
  }

  pub(crate) async fn policy(&self, policy_id: &str) -> Result<UniversePolicy> {
    self
      .store
      .get_policy(policy_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("universe policy", policy_id))
  }

  pub(crate) async fn feature_set(&self, feature_set_id: &str) -> Result<FeatureSetDefinition> {
    self
      .store
      .get_feature_set(feature_set_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("feature set", feature_set_id))
  }

  pub(crate) async fn model(&self, model_id: &str) -> Result<ModelDefinition> {
    self
      .store
      .get_model(model_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("model", model_id))
  }

  /// Load a snapshot and re-check its hash and the point-in-time invariant.
  pub(crate) async fn load_verified(&self, snapshot_id: Uuid) -> Result<SnapshotBundle> {
    let bundle = self
      .store
      .load_snapshot(snapshot_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
    bundle.verify()?;
    bundle.check_point_in_time()?;
    Ok(bundle)
  }

  // ─── Read-side commands ────────────────────────────────────────────────

  async fn watchlist_reply(&self, run_id: Uuid, format: WatchlistFormat) -> Result<Reply> {
    let run = self
      .store
      .get_prediction_run(run_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("prediction run", run_id))?;
    let predictions = self.store.predictions(run_id).await.into_core()?;
    run.verify(&predictions)?;
    let snapshot = self.load_verified(run.snapshot_id).await?;

    let rows = watchlist::rows(&predictions);
    let text = watchlist::render(&run, &rows, format);
    Ok(Reply {
      audit: Audit {
        as_of:                Some(run.as_of),
        universe_policy_hash: Some(run.binding.policy_hash.clone()),
        snapshot_hash:        Some(run.binding.snapshot_hash.clone()),
        sources:              snapshot.snapshot.sources.clone(),
      },
      data: Some(json!({
        "format": format,
        "run_id": run.run_id,
        "as_of": run.as_of,
        "horizon_days": run.horizon_days,
        "rows": rows,
        "text": text,
      })),
      ..Reply::default()
    }
    .id("prediction_run_id", run.run_id)
    .id("snapshot_id", run.snapshot_id)
    .id("run_hash", &run.run_hash))
  }

  async fn correction_reply(
    &self,
    prediction_id: Uuid,
    correction: PredictionCorrection,
  ) -> Result<Reply> {
    correction.validate()?;
    let (supersession, replacement) = self
      .store
      .supersede_prediction(prediction_id, correction, self.now())
      .await
      .into_core()?;
    info!(
      old = %supersession.old_prediction_id,
      new = %supersession.new_prediction_id,
      reason = %supersession.reason,
      "prediction superseded"
    );

    let run = self
      .store
      .get_prediction_run(replacement.run_id)
      .await
      .into_core()?
      .ok_or_else(|| Error::not_found("prediction run", replacement.run_id))?;
    let predictions = self.store.predictions(run.run_id).await.into_core()?;
    run.verify(&predictions)?;

    Ok(Reply {
      audit: Audit {
        as_of:                Some(run.as_of),
        universe_policy_hash: Some(run.binding.policy_hash.clone()),
        snapshot_hash:        Some(run.binding.snapshot_hash.clone()),
        sources:              Vec::new(),
      },
      data: Some(json!({
        "supersession": &supersession,
        "prediction": &replacement,
      })),
      ..Reply::default()
    }
    .id("prediction_run_id", run.run_id)
    .id("prediction_id", replacement.prediction_id)
    .id("supersedes", supersession.old_prediction_id)
    .id("supersession_id", supersession.supersession_id)
    .id("run_hash", &run.run_hash))
  }

  async fn audit_reply(&self, snapshot_id: Uuid) -> Result<Reply> {
    let bundle = self.load_verified(snapshot_id).await?;
    let snapshot = &bundle.snapshot;
    let mut warnings = Vec::new();
    match self.store.get_policy(&snapshot.universe_policy_id).await.into_core()? {
      Some(policy) => {
        let recomputed = policy.policy_hash()?;
        if recomputed != snapshot.policy_hash {
          return Err(Error::DeterminismViolation {
            entity: "universe_policy",
            id: policy.policy_id,
            stored: snapshot.policy_hash.clone(),
            recomputed,
          });
        }
      }
      None => warnings.push(format!(
        "universe policy {} is not registered; policy hash not re-derived",
        snapshot.universe_policy_id
      )),
    }
    let bars: usize = bundle.symbols.values().map(|s| s.bars.len()).sum();
    info!(%snapshot_id, symbols = bundle.symbols.len(), bars, "snapshot verified");
    Ok(Reply {
      warnings,
      audit: Audit {
        as_of:                Some(snapshot.as_of),
        universe_policy_hash: Some(snapshot.policy_hash.clone()),
        snapshot_hash:        Some(snapshot.snapshot_hash.clone()),
        sources:              snapshot.sources.clone(),
      },
      data: Some(json!({
        "verified": true,
        "symbols": bundle.symbols.keys().collect::<Vec<_>>(),
        "bars": bars,
      })),
      ..Reply::default()
    }
    .id("snapshot_id", snapshot.snapshot_id)
    .id("universe_policy_id", &snapshot.universe_policy_id))
  }

  async fn release_reply(&self, note: String) -> Result<Reply> {
    if note.trim().is_empty() {
      return Err(Error::Validation("a release needs a note".into()));
    }
    let releases = self.store.release_halts(note, self.now()).await.into_core()?;
    let mut reply = Reply::default();
    if releases.is_empty() {
      reply.warnings.push("no active audit halt".to_owned());
    }
    for r in &releases {
      info!(halt_id = %r.halt_id, "audit halt released");
    }
    reply.data = Some(json!({ "released": releases }));
    Ok(reply)
  }
}
