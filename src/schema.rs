use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE sessions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id          TEXT NOT NULL UNIQUE,
    project             TEXT NOT NULL DEFAULT '',
    user_id             TEXT,
    user_prompt         TEXT,
    status              TEXT NOT NULL DEFAULT 'active',
    started_at          TEXT NOT NULL,
    started_at_epoch    INTEGER NOT NULL,
    completed_at        TEXT,
    completed_at_epoch  INTEGER,
    worker_port         INTEGER,
    prompt_counter      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE observations (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id        TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    project           TEXT NOT NULL,
    obs_type          TEXT NOT NULL,
    title             TEXT NOT NULL,
    subtitle          TEXT,
    narrative         TEXT,
    facts             TEXT NOT NULL DEFAULT '[]',
    concepts          TEXT NOT NULL DEFAULT '[]',
    files_read        TEXT NOT NULL DEFAULT '[]',
    files_modified    TEXT NOT NULL DEFAULT '[]',
    prompt_number     INTEGER,
    discovery_tokens  INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    created_at_epoch  INTEGER NOT NULL,
    UNIQUE (session_id, title, created_at_epoch)
);

CREATE TABLE session_summaries (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id        TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    project           TEXT NOT NULL,
    request           TEXT,
    investigated      TEXT,
    learned           TEXT,
    completed         TEXT,
    next_steps        TEXT,
    notes             TEXT,
    files_read        TEXT NOT NULL DEFAULT '[]',
    files_modified    TEXT NOT NULL DEFAULT '[]',
    prompt_number     INTEGER,
    discovery_tokens  INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    created_at_epoch  INTEGER NOT NULL,
    UNIQUE (session_id, prompt_number)
);

CREATE TABLE user_prompts (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id        TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    prompt_number     INTEGER NOT NULL,
    prompt_text       TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    created_at_epoch  INTEGER NOT NULL,
    UNIQUE (session_id, prompt_number)
);

CREATE TABLE pending_messages (
    id                          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_db_id               INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    content_session_id          TEXT NOT NULL,
    message_type                TEXT NOT NULL,
    tool_name                   TEXT,
    tool_input                  TEXT,
    tool_response               TEXT,
    cwd                         TEXT,
    last_user_message           TEXT,
    last_assistant_message      TEXT,
    prompt_number               INTEGER,
    status                      TEXT NOT NULL DEFAULT 'pending',
    retry_count                 INTEGER NOT NULL DEFAULT 0,
    created_at_epoch            INTEGER NOT NULL,
    started_processing_at_epoch INTEGER,
    completed_at_epoch          INTEGER
);

CREATE INDEX idx_sessions_project ON sessions(project);
CREATE INDEX idx_sessions_status ON sessions(status);
CREATE INDEX idx_sessions_started ON sessions(started_at_epoch DESC);
CREATE INDEX idx_observations_project ON observations(project);
CREATE INDEX idx_observations_type ON observations(obs_type);
CREATE INDEX idx_observations_created ON observations(created_at_epoch DESC);
CREATE INDEX idx_summaries_project ON session_summaries(project);
CREATE INDEX idx_summaries_created ON session_summaries(created_at_epoch DESC);
CREATE INDEX idx_prompts_created ON user_prompts(created_at_epoch DESC);
CREATE INDEX idx_pending_status ON pending_messages(status);
CREATE INDEX idx_pending_session ON pending_messages(session_db_id, status, created_at_epoch);
CREATE INDEX idx_pending_created ON pending_messages(created_at_epoch DESC);
",
        ),
    ])
});

/// Schema for the networked backend, applied statement by statement at connect.
/// Every statement is idempotent. Integer columns are BIGINT so they decode as `i64`.
pub const NETWORKED_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        id                  BIGSERIAL PRIMARY KEY,
        session_id          TEXT NOT NULL UNIQUE,
        project             TEXT NOT NULL DEFAULT '',
        user_id             TEXT,
        user_prompt         TEXT,
        status              TEXT NOT NULL DEFAULT 'active',
        started_at          TEXT NOT NULL,
        started_at_epoch    BIGINT NOT NULL,
        completed_at        TEXT,
        completed_at_epoch  BIGINT,
        worker_port         BIGINT,
        prompt_counter      BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS observations (
        id                BIGSERIAL PRIMARY KEY,
        session_id        TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        project           TEXT NOT NULL,
        obs_type          TEXT NOT NULL,
        title             TEXT NOT NULL,
        subtitle          TEXT,
        narrative         TEXT,
        facts             TEXT NOT NULL DEFAULT '[]',
        concepts          TEXT NOT NULL DEFAULT '[]',
        files_read        TEXT NOT NULL DEFAULT '[]',
        files_modified    TEXT NOT NULL DEFAULT '[]',
        prompt_number     BIGINT,
        discovery_tokens  BIGINT NOT NULL DEFAULT 0,
        created_at        TEXT NOT NULL,
        created_at_epoch  BIGINT NOT NULL,
        search_vector     TSVECTOR,
        UNIQUE (session_id, title, created_at_epoch)
    )",
    "CREATE TABLE IF NOT EXISTS session_summaries (
        id                BIGSERIAL PRIMARY KEY,
        session_id        TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        project           TEXT NOT NULL,
        request           TEXT,
        investigated      TEXT,
        learned           TEXT,
        completed         TEXT,
        next_steps        TEXT,
        notes             TEXT,
        files_read        TEXT NOT NULL DEFAULT '[]',
        files_modified    TEXT NOT NULL DEFAULT '[]',
        prompt_number     BIGINT,
        discovery_tokens  BIGINT NOT NULL DEFAULT 0,
        created_at        TEXT NOT NULL,
        created_at_epoch  BIGINT NOT NULL,
        UNIQUE (session_id, prompt_number)
    )",
    "CREATE TABLE IF NOT EXISTS user_prompts (
        id                BIGSERIAL PRIMARY KEY,
        session_id        TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
        prompt_number     BIGINT NOT NULL,
        prompt_text       TEXT NOT NULL,
        created_at        TEXT NOT NULL,
        created_at_epoch  BIGINT NOT NULL,
        UNIQUE (session_id, prompt_number)
    )",
    "CREATE TABLE IF NOT EXISTS pending_messages (
        id                          BIGSERIAL PRIMARY KEY,
        session_db_id               BIGINT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        content_session_id          TEXT NOT NULL,
        message_type                TEXT NOT NULL,
        tool_name                   TEXT,
        tool_input                  TEXT,
        tool_response               TEXT,
        cwd                         TEXT,
        last_user_message           TEXT,
        last_assistant_message      TEXT,
        prompt_number               BIGINT,
        status                      TEXT NOT NULL DEFAULT 'pending',
        retry_count                 BIGINT NOT NULL DEFAULT 0,
        created_at_epoch            BIGINT NOT NULL,
        started_processing_at_epoch BIGINT,
        completed_at_epoch          BIGINT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at_epoch DESC)",
    "CREATE INDEX IF NOT EXISTS idx_observations_project ON observations(project)",
    "CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(obs_type)",
    "CREATE INDEX IF NOT EXISTS idx_observations_created ON observations(created_at_epoch DESC)",
    "CREATE INDEX IF NOT EXISTS idx_observations_search ON observations USING GIN(search_vector)",
    "CREATE INDEX IF NOT EXISTS idx_summaries_project ON session_summaries(project)",
    "CREATE INDEX IF NOT EXISTS idx_summaries_created ON session_summaries(created_at_epoch DESC)",
    "CREATE INDEX IF NOT EXISTS idx_prompts_created ON user_prompts(created_at_epoch DESC)",
    "CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_messages(status)",
    "CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_messages(session_db_id, status, created_at_epoch)",
    "CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_messages(created_at_epoch DESC)",
    // Full-text column maintained at write time; search itself lives outside this crate.
    "CREATE OR REPLACE FUNCTION observations_search_vector_update() RETURNS trigger AS $$
     BEGIN
         NEW.search_vector := to_tsvector('english',
             coalesce(NEW.title, '') || ' ' || coalesce(NEW.subtitle, '') || ' ' ||
             coalesce(NEW.narrative, '') || ' ' || coalesce(NEW.facts, ''));
         RETURN NEW;
     END
     $$ LANGUAGE plpgsql",
    "DROP TRIGGER IF EXISTS observations_search_vector_trigger ON observations",
    "CREATE TRIGGER observations_search_vector_trigger
     BEFORE INSERT OR UPDATE ON observations
     FOR EACH ROW EXECUTE FUNCTION observations_search_vector_update()",
];
