//! JSON HTTP surface for the as-of Lab.
//!
//! Exposes an axum [`Router`] over a [`Lab`] backed by any [`LabStore`].
//! Every route answers with the command's [`Envelope`](asof_pipeline::Envelope);
//! a failed command keeps the envelope body and picks a 4xx/5xx status from
//! its `error_kind`.
//!
//! | Method | Path | Body / query |
//! |--------|------|--------------|
//! | `POST` | `/daily-scan` | `{"as_of": "...", "policy": "US_LIQUID_V1"}` |
//! | `POST` | `/weekly-predict` | `{"as_of": "...", "policy": "...", "horizon_days": 5}` |
//! | `POST` | `/evaluate/{id}` | |
//! | `GET`  | `/watchlist/{id}` | `?format=json\|csv\|markdown` |
//! | `POST` | `/predictions/{id}/supersede` | `{"score": 0.4, "confidence": 0.6, "rank": 3, "risk_flags": [], "reason": "..."}` |
//! | `POST` | `/audit/snapshots/{id}` | |
//! | `POST` | `/release-halt` | `{"note": "..."}` |

pub mod commands;

use std::sync::Arc;

use asof_core::store::LabStore;
use asof_pipeline::Lab;
use axum::{
  Router,
  routing::{get, post},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Listener settings, read from the same sources as the Lab's own config.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
}

impl Default for ServerConfig {
  fn default() -> Self { Self { host: "127.0.0.1".to_owned(), port: 8080 } }
}

// ─── Application state ───────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S> {
  pub lab: Arc<Lab<S>>,
}

impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self { Self { lab: self.lab.clone() } }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn router<S>(state: AppState<S>) -> Router
where
  S: LabStore + Send + Sync + 'static,
{
  Router::new()
    .route("/daily-scan",                  post(commands::daily_scan::<S>))
    .route("/weekly-predict",              post(commands::weekly_predict::<S>))
    .route("/evaluate/{id}",               post(commands::evaluate::<S>))
    .route("/watchlist/{id}",              get(commands::watchlist::<S>))
    .route("/predictions/{id}/supersede",  post(commands::correct_prediction::<S>))
    .route("/audit/snapshots/{id}",        post(commands::audit_snapshot::<S>))
    .route("/release-halt",                post(commands::release_halt::<S>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
