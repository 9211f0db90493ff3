//! asof-api server binary.
//!
//! Reads `config.toml` (or the path given with `--config`) plus `ASOF_*`
//! environment variables, opens the SQLite store, registers the definition
//! catalog and serves the Lab commands over HTTP.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use asof_api::{AppState, ServerConfig};
use asof_pipeline::{Lab, LabConfig, catalog, config::settings, fixture};
use asof_store_sqlite::SqliteStore;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "as-of Lab HTTP server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = settings(Some(cli.config.as_path())).context("failed to read config file")?;
  let server_cfg: ServerConfig = settings
    .clone()
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;
  let mut lab_cfg =
    LabConfig::from_settings(settings).context("failed to deserialise LabConfig")?;
  lab_cfg.store_path = expand_tilde(&lab_cfg.store_path);

  let store = SqliteStore::open(&lab_cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", lab_cfg.store_path))?;
  let sources = fixture::load_sources(&lab_cfg).context("failed to load fixture sources")?;
  if sources.is_empty() {
    tracing::warn!("no fixture_paths configured; snapshot commands will fail");
  }
  let definitions = catalog::configured(&lab_cfg).context("failed to load definitions")?;

  let lab = Lab::new(Arc::new(store), sources, lab_cfg);
  lab
    .register_definitions(&definitions)
    .await
    .context("failed to register definitions")?;

  let app = asof_api::router(AppState { lab: Arc::new(lab) });
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

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
