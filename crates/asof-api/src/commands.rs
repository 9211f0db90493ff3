//! Command handlers. Each one parses its request, runs the Lab command and
//! returns the envelope.

use asof_core::{prediction::PredictionCorrection, store::LabStore};
use asof_pipeline::{Envelope, WatchlistFormat, catalog::US_LIQUID_V1};
use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;

// ─── Response ────────────────────────────────────────────────────────────────

/// An envelope paired with the status its outcome maps to.
pub struct EnvelopeResponse(pub Envelope);

/// HTTP status for an envelope's `error_kind`.
pub fn status_for(envelope: &Envelope) -> StatusCode {
  match envelope.error_kind.as_deref() {
    None => StatusCode::OK,
    Some("not_found") => StatusCode::NOT_FOUND,
    Some("validation_error" | "invalid_definition_error") => StatusCode::BAD_REQUEST,
    Some("insufficient_coverage_error") => StatusCode::UNPROCESSABLE_ENTITY,
    Some("audit_halt") => StatusCode::LOCKED,
    Some("determinism_violation_error") => StatusCode::CONFLICT,
    Some("adapter_error") => StatusCode::BAD_GATEWAY,
    Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

impl IntoResponse for EnvelopeResponse {
  fn into_response(self) -> Response { (status_for(&self.0), Json(self.0)).into_response() }
}

fn default_policy() -> String { US_LIQUID_V1.to_owned() }

// ─── Prediction runs ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScanBody {
  pub as_of:  DateTime<Utc>,
  #[serde(default = "default_policy")]
  pub policy: String,
}

/// `POST /daily-scan`
pub async fn daily_scan<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<ScanBody>,
) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  EnvelopeResponse(state.lab.daily_scan(body.as_of, &body.policy).await)
}

#[derive(Debug, Deserialize)]
pub struct PredictBody {
  pub as_of:        DateTime<Utc>,
  #[serde(default = "default_policy")]
  pub policy:       String,
  pub horizon_days: Option<u32>,
}

/// `POST /weekly-predict`
pub async fn weekly_predict<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<PredictBody>,
) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  let envelope = state
    .lab
    .weekly_predict(body.as_of, &body.policy, body.horizon_days)
    .await;
  EnvelopeResponse(envelope)
}

// ─── Evaluation and read-side ────────────────────────────────────────────────

/// `POST /evaluate/{id}`
pub async fn evaluate<S>(State(state): State<AppState<S>>, Path(id): Path<Uuid>) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  EnvelopeResponse(state.lab.evaluate(id).await)
}

#[derive(Debug, Deserialize)]
pub struct WatchlistParams {
  #[serde(default)]
  pub format: WatchlistFormat,
}

/// `GET /watchlist/{id}[?format=json|csv|markdown]`
pub async fn watchlist<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
  Query(params): Query<WatchlistParams>,
) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  EnvelopeResponse(state.lab.watchlist(id, params.format).await)
}

/// `POST /predictions/{id}/supersede`
pub async fn correct_prediction<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
  Json(body): Json<PredictionCorrection>,
) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  EnvelopeResponse(state.lab.correct_prediction(id, body).await)
}

// ─── Operator ────────────────────────────────────────────────────────────────

/// `POST /audit/snapshots/{id}`
pub async fn audit_snapshot<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  EnvelopeResponse(state.lab.audit_snapshot(id).await)
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
  pub note: String,
}

/// `POST /release-halt`
pub async fn release_halt<S>(
  State(state): State<AppState<S>>,
  Json(body): Json<ReleaseBody>,
) -> EnvelopeResponse
where
  S: LabStore + Send + Sync + 'static,
{
  EnvelopeResponse(state.lab.release_halt(body.note).await)
}
