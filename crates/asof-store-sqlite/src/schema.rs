//! SQL schema for the Lab SQLite store.
//!
//! Executed once at connection startup. Every table is append-only; the
//! triggers at the bottom turn any UPDATE or DELETE into an error, so a
//! correction, release or state change is always a new row.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Universe policies, feature sets and models. body_json is the full
-- definition; definition_hash is its content hash.
CREATE TABLE IF NOT EXISTS definitions (
    kind            TEXT NOT NULL,   -- 'universe_policy' | 'feature_set' | 'model'
    definition_id   TEXT NOT NULL,
    name            TEXT NOT NULL,
    version         INTEGER NOT NULL,
    definition_hash TEXT NOT NULL,
    body_json       TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (kind, definition_id),
    UNIQUE (kind, name, version)
);

-- State changes of snapshot and evaluation runs. The latest row per run_id
-- is the run's current state.
CREATE TABLE IF NOT EXISTS run_transitions (
    seq     INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id  TEXT NOT NULL,
    kind    TEXT NOT NULL,   -- 'snapshot' | 'evaluation'
    state   TEXT NOT NULL,
    detail  TEXT,
    at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingest_runs (
    run_id          TEXT PRIMARY KEY,
    pipeline_run_id TEXT NOT NULL,
    as_of           TEXT NOT NULL,
    source_name     TEXT NOT NULL,
    status          TEXT NOT NULL,   -- 'success' | 'degraded' | 'failed'
    params_json     TEXT NOT NULL,
    error           TEXT,
    symbols_fetched INTEGER NOT NULL,
    bars_accepted   INTEGER NOT NULL,
    bars_rejected   INTEGER NOT NULL,
    run_hash        TEXT NOT NULL
);

-- The (as_of, universe_policy_id) key is the idempotency guard for
-- concurrent snapshot pipelines.
CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id        TEXT PRIMARY KEY,
    as_of              TEXT NOT NULL,
    universe_policy_id TEXT NOT NULL,
    policy_hash        TEXT NOT NULL,
    snapshot_hash      TEXT NOT NULL,
    sources_json       TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    UNIQUE (as_of, universe_policy_id)
);

CREATE TABLE IF NOT EXISTS snapshot_symbols (
    snapshot_id    TEXT NOT NULL REFERENCES snapshots(snapshot_id),
    symbol         TEXT NOT NULL,
    exchange       TEXT NOT NULL,
    sector         TEXT,
    market_cap     REAL,
    listing_status TEXT NOT NULL,
    earnings_json  TEXT,             -- NULL when no calendar was ingested
    source         TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, symbol)
);

CREATE TABLE IF NOT EXISTS snapshot_bars (
    snapshot_id TEXT NOT NULL REFERENCES snapshots(snapshot_id),
    symbol      TEXT NOT NULL,
    date        TEXT NOT NULL,       -- YYYY-MM-DD
    open        REAL NOT NULL,
    high        REAL NOT NULL,
    low         REAL NOT NULL,
    close       REAL NOT NULL,
    volume      INTEGER NOT NULL,
    PRIMARY KEY (snapshot_id, symbol, date)
);

CREATE TABLE IF NOT EXISTS feature_vectors (
    features_id    TEXT PRIMARY KEY,
    snapshot_id    TEXT NOT NULL REFERENCES snapshots(snapshot_id),
    feature_set_id TEXT NOT NULL,
    values_json    TEXT NOT NULL,
    feature_hash   TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    UNIQUE (snapshot_id, feature_set_id)
);

CREATE TABLE IF NOT EXISTS prediction_runs (
    run_id         TEXT PRIMARY KEY,
    as_of          TEXT NOT NULL,
    snapshot_id    TEXT NOT NULL REFERENCES snapshots(snapshot_id),
    feature_set_id TEXT NOT NULL,
    model_id       TEXT NOT NULL,
    horizon_days   INTEGER NOT NULL,
    policy_hash    TEXT NOT NULL,
    snapshot_hash  TEXT NOT NULL,
    feature_hash   TEXT NOT NULL,
    model_hash     TEXT NOT NULL,
    run_hash       TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    UNIQUE (snapshot_id, feature_set_id, model_id, horizon_days)
);

CREATE TABLE IF NOT EXISTS predictions (
    prediction_id   TEXT PRIMARY KEY,
    run_id          TEXT NOT NULL REFERENCES prediction_runs(run_id),
    symbol          TEXT NOT NULL,
    score           REAL,
    confidence      REAL,
    rank            INTEGER,
    risk_flags_json TEXT NOT NULL,
    prediction_hash TEXT NOT NULL,
    supersedes      TEXT REFERENCES predictions(prediction_id),
    recorded_at     TEXT NOT NULL
);

-- A prediction replaced by a corrected one.
CREATE TABLE IF NOT EXISTS prediction_supersessions (
    supersession_id   TEXT PRIMARY KEY,
    old_prediction_id TEXT NOT NULL REFERENCES predictions(prediction_id),
    new_prediction_id TEXT NOT NULL REFERENCES predictions(prediction_id),
    reason            TEXT NOT NULL,
    recorded_at       TEXT NOT NULL,
    UNIQUE (old_prediction_id),
    CHECK  (old_prediction_id != new_prediction_id)
);

CREATE TABLE IF NOT EXISTS evaluation_runs (
    eval_run_id             TEXT PRIMARY KEY,
    prediction_run_id       TEXT NOT NULL REFERENCES prediction_runs(run_id),
    realization_as_of       TEXT NOT NULL,
    realization_snapshot_id TEXT REFERENCES snapshots(snapshot_id),
    status                  TEXT NOT NULL,
    metrics_json            TEXT,
    metrics_hash            TEXT,
    reason                  TEXT,
    computed_at             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS prediction_outcomes (
    prediction_id   TEXT NOT NULL REFERENCES predictions(prediction_id),
    eval_run_id     TEXT NOT NULL REFERENCES evaluation_runs(eval_run_id),
    realized_return REAL NOT NULL,
    recorded_at     TEXT NOT NULL,
    PRIMARY KEY (prediction_id, eval_run_id)
);

CREATE TABLE IF NOT EXISTS audit_halts (
    halt_id   TEXT PRIMARY KEY,
    entity    TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    reason    TEXT NOT NULL,
    raised_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS halt_releases (
    halt_id     TEXT PRIMARY KEY REFERENCES audit_halts(halt_id),
    note        TEXT NOT NULL,
    released_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS transitions_run_idx  ON run_transitions(run_id);
CREATE INDEX IF NOT EXISTS ingest_pipeline_idx  ON ingest_runs(pipeline_run_id);
CREATE INDEX IF NOT EXISTS predictions_run_idx  ON predictions(run_id);
CREATE INDEX IF NOT EXISTS evaluations_run_idx  ON evaluation_runs(prediction_run_id);

CREATE TRIGGER IF NOT EXISTS definitions_no_update BEFORE UPDATE ON definitions
BEGIN SELECT RAISE(ABORT, 'definitions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS definitions_no_delete BEFORE DELETE ON definitions
BEGIN SELECT RAISE(ABORT, 'definitions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS run_transitions_no_update BEFORE UPDATE ON run_transitions
BEGIN SELECT RAISE(ABORT, 'run transitions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS run_transitions_no_delete BEFORE DELETE ON run_transitions
BEGIN SELECT RAISE(ABORT, 'run transitions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS ingest_runs_no_update BEFORE UPDATE ON ingest_runs
BEGIN SELECT RAISE(ABORT, 'ingest runs are append-only'); END;
CREATE TRIGGER IF NOT EXISTS ingest_runs_no_delete BEFORE DELETE ON ingest_runs
BEGIN SELECT RAISE(ABORT, 'ingest runs are append-only'); END;
CREATE TRIGGER IF NOT EXISTS snapshots_no_update BEFORE UPDATE ON snapshots
BEGIN SELECT RAISE(ABORT, 'snapshots are append-only'); END;
CREATE TRIGGER IF NOT EXISTS snapshots_no_delete BEFORE DELETE ON snapshots
BEGIN SELECT RAISE(ABORT, 'snapshots are append-only'); END;
CREATE TRIGGER IF NOT EXISTS snapshot_symbols_no_update BEFORE UPDATE ON snapshot_symbols
BEGIN SELECT RAISE(ABORT, 'snapshot symbols are append-only'); END;
CREATE TRIGGER IF NOT EXISTS snapshot_symbols_no_delete BEFORE DELETE ON snapshot_symbols
BEGIN SELECT RAISE(ABORT, 'snapshot symbols are append-only'); END;
CREATE TRIGGER IF NOT EXISTS snapshot_bars_no_update BEFORE UPDATE ON snapshot_bars
BEGIN SELECT RAISE(ABORT, 'snapshot bars are append-only'); END;
CREATE TRIGGER IF NOT EXISTS snapshot_bars_no_delete BEFORE DELETE ON snapshot_bars
BEGIN SELECT RAISE(ABORT, 'snapshot bars are append-only'); END;
CREATE TRIGGER IF NOT EXISTS feature_vectors_no_update BEFORE UPDATE ON feature_vectors
BEGIN SELECT RAISE(ABORT, 'feature vectors are append-only'); END;
CREATE TRIGGER IF NOT EXISTS feature_vectors_no_delete BEFORE DELETE ON feature_vectors
BEGIN SELECT RAISE(ABORT, 'feature vectors are append-only'); END;
CREATE TRIGGER IF NOT EXISTS prediction_runs_no_update BEFORE UPDATE ON prediction_runs
BEGIN SELECT RAISE(ABORT, 'prediction runs are append-only'); END;
CREATE TRIGGER IF NOT EXISTS prediction_runs_no_delete BEFORE DELETE ON prediction_runs
BEGIN SELECT RAISE(ABORT, 'prediction runs are append-only'); END;
CREATE TRIGGER IF NOT EXISTS predictions_no_update BEFORE UPDATE ON predictions
BEGIN SELECT RAISE(ABORT, 'predictions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS predictions_no_delete BEFORE DELETE ON predictions
BEGIN SELECT RAISE(ABORT, 'predictions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS prediction_supersessions_no_update BEFORE UPDATE ON prediction_supersessions
BEGIN SELECT RAISE(ABORT, 'prediction supersessions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS prediction_supersessions_no_delete BEFORE DELETE ON prediction_supersessions
BEGIN SELECT RAISE(ABORT, 'prediction supersessions are append-only'); END;
CREATE TRIGGER IF NOT EXISTS evaluation_runs_no_update BEFORE UPDATE ON evaluation_runs
BEGIN SELECT RAISE(ABORT, 'evaluation runs are append-only'); END;
CREATE TRIGGER IF NOT EXISTS evaluation_runs_no_delete BEFORE DELETE ON evaluation_runs
BEGIN SELECT RAISE(ABORT, 'evaluation runs are append-only'); END;
CREATE TRIGGER IF NOT EXISTS prediction_outcomes_no_update BEFORE UPDATE ON prediction_outcomes
BEGIN SELECT RAISE(ABORT, 'prediction outcomes are append-only'); END;
CREATE TRIGGER IF NOT EXISTS prediction_outcomes_no_delete BEFORE DELETE ON prediction_outcomes
BEGIN SELECT RAISE(ABORT, 'prediction outcomes are append-only'); END;
CREATE TRIGGER IF NOT EXISTS audit_halts_no_update BEFORE UPDATE ON audit_halts
BEGIN SELECT RAISE(ABORT, 'audit halts are append-only'); END;
CREATE TRIGGER IF NOT EXISTS audit_halts_no_delete BEFORE DELETE ON audit_halts
BEGIN SELECT RAISE(ABORT, 'audit halts are append-only'); END;
CREATE TRIGGER IF NOT EXISTS halt_releases_no_update BEFORE UPDATE ON halt_releases
BEGIN SELECT RAISE(ABORT, 'halt releases are append-only'); END;
CREATE TRIGGER IF NOT EXISTS halt_releases_no_delete BEFORE DELETE ON halt_releases
BEGIN SELECT RAISE(ABORT, 'halt releases are append-only'); END;

PRAGMA user_version = 1;
";
