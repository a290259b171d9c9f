//! Typed persistence for sessions, observations, summaries and prompts.
//!
//! Every query here is written once and runs unchanged on either backend.

use crate::backend::{placeholders, Statement, StorageBackend, Value};
use crate::model::{
    Observation, ObservationInput, ObservationType, Session, SessionStatus, SessionSummary, Stored,
    SummaryInput, UserPrompt,
};
use crate::{iso_from_epoch_ms, now_epoch_ms, params, MemError};
use std::sync::Arc;

pub(crate) const SESSION_COLUMNS: &str = "id, session_id, project, user_id, user_prompt, status, \
     started_at, started_at_epoch, completed_at, completed_at_epoch, worker_port, prompt_counter";

pub(crate) const OBSERVATION_COLUMNS: &str = "id, session_id, project, obs_type, title, subtitle, \
     narrative, facts, concepts, files_read, files_modified, prompt_number, discovery_tokens, \
     created_at, created_at_epoch";

pub(crate) const SUMMARY_COLUMNS: &str = "id, session_id, project, request, investigated, learned, \
     completed, next_steps, notes, files_read, files_modified, prompt_number, discovery_tokens, \
     created_at, created_at_epoch";

pub(crate) const PROMPT_COLUMNS: &str =
    "id, session_id, prompt_number, prompt_text, created_at, created_at_epoch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    DateAsc,
    #[default]
    DateDesc,
}

impl OrderBy {
    pub fn parse(s: &str) -> Result<Self, MemError> {
        match s {
            "date_asc" => Ok(OrderBy::DateAsc),
            "date_desc" => Ok(OrderBy::DateDesc),
            other => Err(MemError::Config(format!(
                "invalid order {other:?} (expected \"date_asc\" or \"date_desc\")"
            ))),
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            OrderBy::DateAsc => "created_at_epoch ASC, id ASC",
            OrderBy::DateDesc => "created_at_epoch DESC, id DESC",
        }
    }
}

/// Filters for batch lookups by id.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub project: Option<String>,
    pub obs_types: Vec<ObservationType>,
    /// Match rows carrying any of these concepts.
    pub concepts: Vec<String>,
    /// Match rows whose read or modified files contain any of these substrings.
    pub files: Vec<String>,
    pub order_by: OrderBy,
    pub limit: Option<i64>,
}

/// Row totals per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EntityCounts {
    pub sessions: i64,
    pub observations: i64,
    pub summaries: i64,
    pub prompts: i64,
}

/// Parameters for `create_sdk_session`.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub session_id: String,
    pub project: String,
    pub user_prompt: Option<String>,
    pub user_id: Option<String>,
}

pub struct SessionStore {
    db: Arc<dyn StorageBackend>,
}

pub(crate) fn to_json(list: &[String]) -> Result<String, MemError> {
    Ok(serde_json::to_string(list)?)
}

impl SessionStore {
    pub fn new(db: Arc<dyn StorageBackend>) -> Self {
        Self { db }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.db
    }

    // --- Sessions ---

    /// Idempotent upsert keyed by the external session id. Returns the internal id.
    ///
    /// A repeat call refreshes the prompt, reactivates a terminal session, and
    /// fills in the project only when none was recorded yet.
    pub async fn create_sdk_session(&self, s: &NewSession) -> Result<i64, MemError> {
        let now = now_epoch_ms();
        let created = self
            .db
            .query_opt(
                "INSERT INTO sessions (session_id, project, user_id, user_prompt, status, started_at, started_at_epoch)
                 VALUES (?, ?, ?, ?, 'active', ?, ?)
                 ON CONFLICT (session_id) DO NOTHING
                 RETURNING id",
                &params![
                    &s.session_id,
                    &s.project,
                    s.user_id.clone(),
                    s.user_prompt.clone(),
                    iso_from_epoch_ms(now),
                    now
                ],
            )
            .await?;
        if let Some(row) = created {
            let id = row.get("id")?;
            log::debug!("session {} created as {id}", s.session_id);
            return Ok(id);
        }

        let row = self
            .db
            .query_opt(
                "UPDATE sessions SET
                     user_prompt = COALESCE(?, user_prompt),
                     project = CASE WHEN project IS NULL OR project = '' THEN ? ELSE project END,
                     user_id = COALESCE(user_id, ?),
                     status = 'active',
                     completed_at = NULL,
                     completed_at_epoch = NULL
                 WHERE session_id = ?
                 RETURNING id",
                &params![s.user_prompt.clone(), &s.project, s.user_id.clone(), &s.session_id],
            )
            .await?
            .ok_or_else(|| MemError::NotFound(format!("session {}", s.session_id)))?;
        row.get("id")
    }

    /// Insert a bare session row if none exists. Safe under concurrent callers.
    pub(crate) async fn ensure_session_exists(
        &self,
        session_id: &str,
        project: &str,
    ) -> Result<(), MemError> {
        let now = now_epoch_ms();
        self.db
            .execute(
                "INSERT INTO sessions (session_id, project, status, started_at, started_at_epoch)
                 VALUES (?, ?, 'active', ?, ?)
                 ON CONFLICT (session_id) DO NOTHING",
                &params![session_id, project, iso_from_epoch_ms(now), now],
            )
            .await?;
        Ok(())
    }

    pub async fn get_session_by_id(&self, id: i64) -> Result<Option<Session>, MemError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        self.db
            .query_opt(&sql, &params![id])
            .await?
            .map(|r| Session::from_row(&r))
            .transpose()
    }

    pub async fn get_session_by_external_id(
        &self,
        session_id: &str,
    ) -> Result<Option<Session>, MemError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?");
        self.db
            .query_opt(&sql, &params![session_id])
            .await?
            .map(|r| Session::from_row(&r))
            .transpose()
    }

    pub async fn get_sessions_by_external_ids(
        &self,
        session_ids: &[String],
    ) -> Result<Vec<Session>, MemError> {
        if session_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id IN ({}) ORDER BY started_at_epoch DESC",
            placeholders(session_ids.len())
        );
        let params: Vec<Value> = session_ids.iter().map(Value::from).collect();
        self.db
            .query(&sql, &params)
            .await?
            .iter()
            .map(Session::from_row)
            .collect()
    }

    pub async fn set_worker_port(&self, id: i64, port: u16) -> Result<(), MemError> {
        self.db
            .execute(
                "UPDATE sessions SET worker_port = ? WHERE id = ?",
                &params![i64::from(port), id],
            )
            .await?;
        Ok(())
    }

    /// Bump the session's prompt counter, returning the new value.
    pub async fn increment_prompt_counter(&self, session_id: &str) -> Result<i64, MemError> {
        let row = self
            .db
            .query_opt(
                "UPDATE sessions SET prompt_counter = prompt_counter + 1 WHERE session_id = ? RETURNING prompt_counter",
                &params![session_id],
            )
            .await?
            .ok_or_else(|| MemError::NotFound(format!("session {session_id}")))?;
        row.get("prompt_counter")
    }

    pub async fn get_prompt_counter(&self, session_id: &str) -> Result<i64, MemError> {
        match self
            .db
            .query_opt(
                "SELECT prompt_counter FROM sessions WHERE session_id = ?",
                &params![session_id],
            )
            .await?
        {
            Some(row) => row.get("prompt_counter"),
            None => Ok(0),
        }
    }

    pub async fn mark_session_completed(&self, id: i64) -> Result<bool, MemError> {
        self.finish_session(id, SessionStatus::Completed).await
    }

    pub async fn mark_session_failed(&self, id: i64) -> Result<bool, MemError> {
        self.finish_session(id, SessionStatus::Failed).await
    }

    async fn finish_session(&self, id: i64, status: SessionStatus) -> Result<bool, MemError> {
        let now = now_epoch_ms();
        let n = self
            .db
            .execute(
                "UPDATE sessions SET status = ?, completed_at = ?, completed_at_epoch = ?
                 WHERE id = ? AND status = 'active'",
                &params![status.as_str(), iso_from_epoch_ms(now), now, id],
            )
            .await?;
        Ok(n > 0)
    }

    /// Remove a session and everything hanging off it.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, MemError> {
        let p = params![session_id];
        let affected = self
            .db
            .transaction(&[
                Statement::new(
                    "DELETE FROM pending_messages WHERE content_session_id = ?",
                    p.clone(),
                ),
                Statement::new("DELETE FROM observations WHERE session_id = ?", p.clone()),
                Statement::new("DELETE FROM session_summaries WHERE session_id = ?", p.clone()),
                Statement::new("DELETE FROM user_prompts WHERE session_id = ?", p.clone()),
                Statement::new("DELETE FROM sessions WHERE session_id = ?", p),
            ])
            .await?;
        Ok(affected.last().copied().unwrap_or(0) > 0)
    }

    pub async fn get_all_projects(&self) -> Result<Vec<String>, MemError> {
        self.db
            .query(
                "SELECT DISTINCT project FROM sessions WHERE project <> '' ORDER BY project ASC",
                &[],
            )
            .await?
            .iter()
            .map(|r| r.get("project"))
            .collect()
    }

    pub async fn entity_counts(&self) -> Result<EntityCounts, MemError> {
        let row = self
            .db
            .query_opt(
                "SELECT
                     (SELECT COUNT(*) FROM sessions) AS sessions,
                     (SELECT COUNT(*) FROM observations) AS observations,
                     (SELECT COUNT(*) FROM session_summaries) AS summaries,
                     (SELECT COUNT(*) FROM user_prompts) AS prompts",
                &[],
            )
            .await?
            .ok_or_else(|| MemError::NotFound("count row".into()))?;
        Ok(EntityCounts {
            sessions: row.get("sessions")?,
            observations: row.get("observations")?,
            summaries: row.get("summaries")?,
            prompts: row.get("prompts")?,
        })
    }

    // --- Prompts ---

    pub async fn save_user_prompt(
        &self,
        session_id: &str,
        prompt_number: i64,
        prompt_text: &str,
    ) -> Result<Stored, MemError> {
        self.ensure_session_exists(session_id, "").await?;
        let now = now_epoch_ms();
        let row = self
            .db
            .query_opt(
                "INSERT INTO user_prompts (session_id, prompt_number, prompt_text, created_at, created_at_epoch)
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
                &params![session_id, prompt_number, prompt_text, iso_from_epoch_ms(now), now],
            )
            .await?
            .ok_or_else(|| MemError::NotFound("inserted prompt row".into()))?;
        Ok(Stored {
            id: row.get("id")?,
            created_at_epoch: now,
        })
    }

    pub async fn get_user_prompt(
        &self,
        session_id: &str,
        prompt_number: i64,
    ) -> Result<Option<UserPrompt>, MemError> {
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM user_prompts WHERE session_id = ? AND prompt_number = ?"
        );
        self.db
            .query_opt(&sql, &params![session_id, prompt_number])
            .await?
            .map(|r| UserPrompt::from_row(&r))
            .transpose()
    }

    pub async fn get_user_prompts_by_ids(
        &self,
        ids: &[i64],
        order_by: OrderBy,
    ) -> Result<Vec<UserPrompt>, MemError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {PROMPT_COLUMNS} FROM user_prompts WHERE id IN ({}) ORDER BY {}",
            placeholders(ids.len()),
            order_by.sql()
        );
        let params: Vec<Value> = ids.iter().copied().map(Value::from).collect();
        self.db
            .query(&sql, &params)
            .await?
            .iter()
            .map(UserPrompt::from_row)
            .collect()
    }

    pub async fn get_recent_prompts(
        &self,
        project: Option<&str>,
        limit: i64,
    ) -> Result<Vec<UserPrompt>, MemError> {
        let rows = match project {
            Some(p) => {
                self.db
                    .query(
                        "SELECT up.id, up.session_id, up.prompt_number, up.prompt_text, up.created_at, up.created_at_epoch
                         FROM user_prompts up JOIN sessions s ON s.session_id = up.session_id
                         WHERE s.project = ?
                         ORDER BY up.created_at_epoch DESC, up.id DESC LIMIT ?",
                        &params![p, limit],
                    )
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {PROMPT_COLUMNS} FROM user_prompts ORDER BY created_at_epoch DESC, id DESC LIMIT ?"
                );
                self.db.query(&sql, &params![limit]).await?
            }
        };
        rows.iter().map(UserPrompt::from_row).collect()
    }

    // --- Observations ---

    pub async fn store_observation(&self, input: &ObservationInput) -> Result<Stored, MemError> {
        self.ensure_session_exists(&input.session_id, &input.project)
            .await?;
        let created_at_epoch = input.created_at_epoch.unwrap_or_else(now_epoch_ms);
        let row = self
            .db
            .query_opt(
                &insert_sql("observations", OBSERVATION_INSERT_COLUMNS, input.id.is_some(), false),
                &observation_params(input, created_at_epoch)?,
            )
            .await?
            .ok_or_else(|| MemError::NotFound("inserted observation row".into()))?;
        if input.id.is_some() {
            self.resync_sequence("observations").await?;
        }
        Ok(Stored {
            id: row.get("id")?,
            created_at_epoch,
        })
    }

    pub async fn get_observation_by_id(&self, id: i64) -> Result<Option<Observation>, MemError> {
        let sql = format!("SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id = ?");
        self.db
            .query_opt(&sql, &params![id])
            .await?
            .map(|r| Observation::from_row(&r))
            .transpose()
    }

    pub async fn get_observations_by_ids(
        &self,
        ids: &[i64],
        filter: &BatchFilter,
    ) -> Result<Vec<Observation>, MemError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let dialect = self.db.dialect();
        let mut clauses = vec![format!("id IN ({})", placeholders(ids.len()))];
        let mut params: Vec<Value> = ids.iter().copied().map(Value::from).collect();

        if let Some(project) = &filter.project {
            clauses.push("project = ?".into());
            params.push(project.into());
        }
        if !filter.obs_types.is_empty() {
            clauses.push(format!("obs_type IN ({})", placeholders(filter.obs_types.len())));
            params.extend(filter.obs_types.iter().map(|t| Value::from(t.as_str())));
        }
        if !filter.concepts.is_empty() {
            // Concepts are stored as a JSON array, so an exact element match is
            // a substring match on the element's JSON encoding.
            let any: Vec<String> = filter
                .concepts
                .iter()
                .map(|_| dialect.contains("concepts"))
                .collect();
            clauses.push(format!("({})", any.join(" OR ")));
            for c in &filter.concepts {
                params.push(Value::Text(serde_json::to_string(c)?));
            }
        }
        if !filter.files.is_empty() {
            let mut any = Vec::new();
            for f in &filter.files {
                any.push(dialect.contains("files_read"));
                any.push(dialect.contains("files_modified"));
                params.push(f.into());
                params.push(f.into());
            }
            clauses.push(format!("({})", any.join(" OR ")));
        }

        let mut sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE {} ORDER BY {}",
            clauses.join(" AND "),
            filter.order_by.sql()
        );
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params.push(limit.into());
        }
        self.db
            .query(&sql, &params)
            .await?
            .iter()
            .map(Observation::from_row)
            .collect()
    }

    pub async fn get_observations_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Observation>, MemError> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE session_id = ? ORDER BY created_at_epoch ASC, id ASC"
        );
        self.db
            .query(&sql, &params![session_id])
            .await?
            .iter()
            .map(Observation::from_row)
            .collect()
    }

    pub async fn get_recent_observations(
        &self,
        project: &str,
        limit: i64,
    ) -> Result<Vec<Observation>, MemError> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations WHERE project = ?
             ORDER BY created_at_epoch DESC, id DESC LIMIT ?"
        );
        self.db
            .query(&sql, &params![project, limit])
            .await?
            .iter()
            .map(Observation::from_row)
            .collect()
    }

    pub async fn get_all_recent_observations(&self, limit: i64) -> Result<Vec<Observation>, MemError> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations ORDER BY created_at_epoch DESC, id DESC LIMIT ?"
        );
        self.db
            .query(&sql, &params![limit])
            .await?
            .iter()
            .map(Observation::from_row)
            .collect()
    }

    // --- Summaries ---

    pub async fn store_summary(&self, input: &SummaryInput) -> Result<Stored, MemError> {
        self.ensure_session_exists(&input.session_id, &input.project)
            .await?;
        let created_at_epoch = input.created_at_epoch.unwrap_or_else(now_epoch_ms);
        let row = self
            .db
            .query_opt(
                &insert_sql("session_summaries", SUMMARY_INSERT_COLUMNS, input.id.is_some(), false),
                &summary_params(input, created_at_epoch)?,
            )
            .await?
            .ok_or_else(|| MemError::NotFound("inserted summary row".into()))?;
        if input.id.is_some() {
            self.resync_sequence("session_summaries").await?;
        }
        Ok(Stored {
            id: row.get("id")?,
            created_at_epoch,
        })
    }

    pub async fn get_summary_by_id(&self, id: i64) -> Result<Option<SessionSummary>, MemError> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM session_summaries WHERE id = ?");
        self.db
            .query_opt(&sql, &params![id])
            .await?
            .map(|r| SessionSummary::from_row(&r))
            .transpose()
    }

    /// Most recent summary written for a session.
    pub async fn get_summary_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionSummary>, MemError> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM session_summaries WHERE session_id = ?
             ORDER BY created_at_epoch DESC, id DESC LIMIT 1"
        );
        self.db
            .query_opt(&sql, &params![session_id])
            .await?
            .map(|r| SessionSummary::from_row(&r))
            .transpose()
    }

    pub async fn get_summaries_by_ids(
        &self,
        ids: &[i64],
        project: Option<&str>,
        order_by: OrderBy,
    ) -> Result<Vec<SessionSummary>, MemError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM session_summaries WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut params: Vec<Value> = ids.iter().copied().map(Value::from).collect();
        if let Some(p) = project {
            sql.push_str(" AND project = ?");
            params.push(p.into());
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order_by.sql());
        self.db
            .query(&sql, &params)
            .await?
            .iter()
            .map(SessionSummary::from_row)
            .collect()
    }

    pub async fn get_recent_summaries(
        &self,
        project: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SessionSummary>, MemError> {
        let rows = match project {
            Some(p) => {
                let sql = format!(
                    "SELECT {SUMMARY_COLUMNS} FROM session_summaries WHERE project = ?
                     ORDER BY created_at_epoch DESC, id DESC LIMIT ?"
                );
                self.db.query(&sql, &params![p, limit]).await?
            }
            None => {
                let sql = format!(
                    "SELECT {SUMMARY_COLUMNS} FROM session_summaries
                     ORDER BY created_at_epoch DESC, id DESC LIMIT ?"
                );
                self.db.query(&sql, &params![limit]).await?
            }
        };
        rows.iter().map(SessionSummary::from_row).collect()
    }

    pub(crate) async fn resync_sequence(&self, table: &str) -> Result<(), MemError> {
        if let Some(sql) = self.db.dialect().resync_sequence(table) {
            self.db.query(&sql, &[]).await?;
        }
        Ok(())
    }
}

pub(crate) const OBSERVATION_INSERT_COLUMNS: &[&str] = &[
    "session_id",
    "project",
    "obs_type",
    "title",
    "subtitle",
    "narrative",
    "facts",
    "concepts",
    "files_read",
    "files_modified",
    "prompt_number",
    "discovery_tokens",
    "created_at",
    "created_at_epoch",
];

pub(crate) const SUMMARY_INSERT_COLUMNS: &[&str] = &[
    "session_id",
    "project",
    "request",
    "investigated",
    "learned",
    "completed",
    "next_steps",
    "notes",
    "files_read",
    "files_modified",
    "prompt_number",
    "discovery_tokens",
    "created_at",
    "created_at_epoch",
];

/// `INSERT ... RETURNING id`, with a leading `id` column when the caller supplies one.
/// Params follow the same layout: the explicit id first, then `columns` in order.
pub(crate) fn insert_sql(table: &str, columns: &[&str], explicit_id: bool, skip_conflicts: bool) -> String {
    let (id_col, id_ph) = if explicit_id { ("id, ", "?, ") } else { ("", "") };
    let conflict = if skip_conflicts { " ON CONFLICT DO NOTHING" } else { "" };
    format!(
        "INSERT INTO {table} ({id_col}{}) VALUES ({id_ph}{}){conflict} RETURNING id",
        columns.join(", "),
        placeholders(columns.len())
    )
}

pub(crate) fn observation_params(
    input: &ObservationInput,
    created_at_epoch: i64,
) -> Result<Vec<Value>, MemError> {
    let obs_type = input.obs_type.unwrap_or(ObservationType::Change);
    let mut values: Vec<Value> = input.id.into_iter().map(Value::from).collect();
    values.extend(params![
        &input.session_id,
        &input.project,
        obs_type.as_str(),
        &input.title,
        input.subtitle.clone(),
        input.narrative.clone(),
        to_json(&input.facts)?,
        to_json(&input.concepts)?,
        to_json(&input.files_read)?,
        to_json(&input.files_modified)?,
        input.prompt_number,
        input.discovery_tokens,
        iso_from_epoch_ms(created_at_epoch),
        created_at_epoch
    ]);
    Ok(values)
}

pub(crate) fn summary_params(
    input: &SummaryInput,
    created_at_epoch: i64,
) -> Result<Vec<Value>, MemError> {
    let mut values: Vec<Value> = input.id.into_iter().map(Value::from).collect();
    values.extend(params![
        &input.session_id,
        &input.project,
        input.request.clone(),
        input.investigated.clone(),
        input.learned.clone(),
        input.completed.clone(),
        input.next_steps.clone(),
        input.notes.clone(),
        to_json(&input.files_read)?,
        to_json(&input.files_modified)?,
        input.prompt_number,
        input.discovery_tokens,
        iso_from_epoch_ms(created_at_epoch),
        created_at_epoch
    ]);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedBackend;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(EmbeddedBackend::open_in_memory().unwrap()))
    }

    fn obs(session: &str, title: &str, epoch: i64) -> ObservationInput {
        ObservationInput {
            session_id: session.into(),
            project: "proj".into(),
            obs_type: Some(ObservationType::Discovery),
            title: title.into(),
            created_at_epoch: Some(epoch),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_sdk_session_is_idempotent() {
        let store = store();
        let s = NewSession {
            session_id: "ext-1".into(),
            project: "alpha".into(),
            user_prompt: Some("first".into()),
            user_id: Some("u1".into()),
        };
        let a = store.create_sdk_session(&s).await.unwrap();
        let b = store
            .create_sdk_session(&NewSession {
                user_prompt: Some("second".into()),
                ..s.clone()
            })
            .await
            .unwrap();
        assert_eq!(a, b);
        let session = store.get_session_by_id(a).await.unwrap().unwrap();
        assert_eq!(session.user_prompt.as_deref(), Some("second"));
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn project_fills_empty_but_never_overrides() {
        let store = store();
        let id = store
            .create_sdk_session(&NewSession {
                session_id: "ext".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_sdk_session(&NewSession {
                session_id: "ext".into(),
                project: "first".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_sdk_session(&NewSession {
                session_id: "ext".into(),
                project: "first/more-specific".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let session = store.get_session_by_id(id).await.unwrap().unwrap();
        assert_eq!(session.project, "first");
    }

    #[tokio::test]
    async fn terminal_session_reactivates_on_new_work() {
        let store = store();
        let s = NewSession {
            session_id: "ext".into(),
            project: "p".into(),
            ..Default::default()
        };
        let id = store.create_sdk_session(&s).await.unwrap();
        assert!(store.mark_session_completed(id).await.unwrap());
        // Already terminal
        assert!(!store.mark_session_failed(id).await.unwrap());
        let done = store.get_session_by_id(id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.completed_at_epoch.is_some());

        store.create_sdk_session(&s).await.unwrap();
        let again = store.get_session_by_id(id).await.unwrap().unwrap();
        assert_eq!(again.status, SessionStatus::Active);
        assert_eq!(again.completed_at_epoch, None);
    }

    #[tokio::test]
    async fn store_observation_creates_missing_session() {
        let store = store();
        let stored = store.store_observation(&obs("orphan", "t", 1000)).await.unwrap();
        assert_eq!(stored.created_at_epoch, 1000);
        let session = store.get_session_by_external_id("orphan").await.unwrap().unwrap();
        assert_eq!(session.project, "proj");
        let o = store.get_observation_by_id(stored.id).await.unwrap().unwrap();
        assert_eq!(o.title, "t");
        assert_eq!(o.obs_type, ObservationType::Discovery);
    }

    #[tokio::test]
    async fn explicit_ids_are_preserved() {
        let store = store();
        let stored = store
            .store_observation(&ObservationInput {
                id: Some(42),
                ..obs("s", "mirrored", 5)
            })
            .await
            .unwrap();
        assert_eq!(stored.id, 42);
        let next = store.store_observation(&obs("s", "local", 6)).await.unwrap();
        assert_eq!(next.id, 43);
    }

    #[tokio::test]
    async fn batch_lookup_filters_and_orders() {
        let store = store();
        let a = store
            .store_observation(&ObservationInput {
                concepts: vec!["how-it-works".into()],
                files_read: vec!["/src/auth.rs".into()],
                ..obs("s", "a", 10)
            })
            .await
            .unwrap();
        let b = store
            .store_observation(&ObservationInput {
                obs_type: Some(ObservationType::Bugfix),
                concepts: vec!["gotcha".into()],
                files_modified: vec!["/src/main.rs".into()],
                ..obs("s", "b", 20)
            })
            .await
            .unwrap();
        let ids = [a.id, b.id];

        let all = store
            .get_observations_by_ids(&ids, &BatchFilter::default())
            .await
            .unwrap();
        assert_eq!(all.iter().map(|o| o.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let asc = store
            .get_observations_by_ids(
                &ids,
                &BatchFilter {
                    order_by: OrderBy::DateAsc,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(asc[0].id, a.id);

        let by_type = store
            .get_observations_by_ids(
                &ids,
                &BatchFilter {
                    obs_types: vec![ObservationType::Bugfix],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, b.id);

        let by_concept = store
            .get_observations_by_ids(
                &ids,
                &BatchFilter {
                    concepts: vec!["how-it-works".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_concept.len(), 1);
        assert_eq!(by_concept[0].id, a.id);

        // "how" alone is not a concept, only a substring of one
        let partial = store
            .get_observations_by_ids(
                &ids,
                &BatchFilter {
                    concepts: vec!["how".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(partial.is_empty());

        let by_file = store
            .get_observations_by_ids(
                &ids,
                &BatchFilter {
                    files: vec!["main.rs".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_file.len(), 1);
        assert_eq!(by_file[0].id, b.id);

        let other_project = store
            .get_observations_by_ids(
                &ids,
                &BatchFilter {
                    project: Some("elsewhere".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(other_project.is_empty());
    }

    #[tokio::test]
    async fn empty_id_list_short_circuits() {
        let store = store();
        store.backend().close().await.unwrap();
        // A closed backend would error on any round-trip
        let none = store
            .get_observations_by_ids(&[], &BatchFilter::default())
            .await
            .unwrap();
        assert!(none.is_empty());
        assert!(store.get_summaries_by_ids(&[], None, OrderBy::DateDesc).await.unwrap().is_empty());
        assert!(store.get_user_prompts_by_ids(&[], OrderBy::DateAsc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prompts_counter_and_lookup() {
        let store = store();
        store
            .create_sdk_session(&NewSession {
                session_id: "s".into(),
                project: "p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.increment_prompt_counter("s").await.unwrap(), 1);
        assert_eq!(store.increment_prompt_counter("s").await.unwrap(), 2);
        assert_eq!(store.get_prompt_counter("s").await.unwrap(), 2);
        assert_eq!(store.get_prompt_counter("missing").await.unwrap(), 0);

        store.save_user_prompt("s", 1, "fix the bug").await.unwrap();
        assert!(store.save_user_prompt("s", 1, "dupe").await.is_err());
        let p = store.get_user_prompt("s", 1).await.unwrap().unwrap();
        assert_eq!(p.prompt_text, "fix the bug");

        let recent = store.get_recent_prompts(Some("p"), 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(store.get_recent_prompts(Some("q"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summaries_recent_and_latest() {
        let store = store();
        for (n, epoch) in [(1i64, 100i64), (2, 200)] {
            store
                .store_summary(&SummaryInput {
                    session_id: "s".into(),
                    project: "p".into(),
                    request: Some(format!("request {n}")),
                    prompt_number: Some(n),
                    created_at_epoch: Some(epoch),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let latest = store.get_summary_for_session("s").await.unwrap().unwrap();
        assert_eq!(latest.request.as_deref(), Some("request 2"));
        assert_eq!(store.get_recent_summaries(Some("p"), 1).await.unwrap().len(), 1);
        assert_eq!(store.get_recent_summaries(None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_session_cascades() {
        let store = store();
        store.store_observation(&obs("s", "t", 1)).await.unwrap();
        store.save_user_prompt("s", 1, "x").await.unwrap();
        assert!(store.delete_session("s").await.unwrap());
        assert!(store.get_session_by_external_id("s").await.unwrap().is_none());
        assert!(store.get_observations_for_session("s").await.unwrap().is_empty());
        assert!(!store.delete_session("s").await.unwrap());
    }

    #[tokio::test]
    async fn projects_and_recent_views() {
        let store = store();
        store.store_observation(&obs("s1", "a", 1)).await.unwrap();
        store
            .store_observation(&ObservationInput {
                project: "other".into(),
                ..obs("s2", "b", 2)
            })
            .await
            .unwrap();
        assert_eq!(store.get_all_projects().await.unwrap(), vec!["other", "proj"]);
        let counts = store.entity_counts().await.unwrap();
        assert_eq!((counts.sessions, counts.observations, counts.prompts), (2, 2, 0));
        assert_eq!(store.get_recent_observations("proj", 10).await.unwrap().len(), 1);
        let all = store.get_all_recent_observations(10).await.unwrap();
        assert_eq!(all[0].title, "b");
    }

    #[test]
    fn order_by_parses() {
        assert_eq!(OrderBy::parse("date_asc").unwrap(), OrderBy::DateAsc);
        assert!(OrderBy::parse("relevance").is_err());
    }
}
