//! Idempotent imports keyed on natural keys, and project export bundles.
//!
//! Imports are what replicated writes land on, so replaying one is harmless:
//! a second import of the same entity reports `imported: false` with the id
//! of the row already there.

use crate::backend::{Row, Value};
use crate::model::{
    ImportResult, Observation, ObservationInput, Session, SessionSummary, SummaryInput, UserPrompt,
};
use crate::store::{
    insert_sql, observation_params, summary_params, SessionStore, OBSERVATION_COLUMNS,
    OBSERVATION_INSERT_COLUMNS, SESSION_COLUMNS, SUMMARY_COLUMNS, SUMMARY_INSERT_COLUMNS,
};
use crate::{iso_from_epoch_ms, now_epoch_ms, params, MemError};
use serde::{Deserialize, Serialize};

/// A user prompt as carried by replication and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInput {
    #[serde(default)]
    pub id: Option<i64>,
    pub session_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    #[serde(default)]
    pub created_at_epoch: Option<i64>,
}

impl From<&UserPrompt> for PromptInput {
    fn from(p: &UserPrompt) -> Self {
        Self {
            id: Some(p.id),
            session_id: p.session_id.clone(),
            prompt_number: p.prompt_number,
            prompt_text: p.prompt_text.clone(),
            created_at_epoch: Some(p.created_at_epoch),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub exported_at: String,
    #[serde(default)]
    pub project: Option<String>,
    pub sessions: Vec<Session>,
    pub summaries: Vec<SessionSummary>,
    pub observations: Vec<Observation>,
    pub prompts: Vec<UserPrompt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub imported: u64,
    pub skipped: u64,
}

impl ImportCounts {
    fn record(&mut self, result: ImportResult) {
        if result.imported {
            self.imported += 1;
        } else {
            self.skipped += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub sessions: ImportCounts,
    pub summaries: ImportCounts,
    pub observations: ImportCounts,
    pub prompts: ImportCounts,
}

fn row_id(row: Option<Row>) -> Result<Option<i64>, MemError> {
    row.map(|r| r.get("id")).transpose()
}

impl SessionStore {
    /// A session already present (possibly only the placeholder row an
    /// earlier observation or prompt created) is not replaced; its missing
    /// fields are filled from `session` and it reports `imported: false`.
    pub async fn import_sdk_session(&self, session: &Session) -> Result<ImportResult, MemError> {
        if let Some(id) = self.session_db_id(&session.session_id).await? {
            self.merge_session(id, session).await?;
            return Ok(ImportResult { imported: false, id });
        }
        let inserted = self
            .backend()
            .query_opt(
                "INSERT INTO sessions (session_id, project, user_id, user_prompt, status,
                     started_at, started_at_epoch, completed_at, completed_at_epoch, prompt_counter)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (session_id) DO NOTHING
                 RETURNING id",
                &params![
                    &session.session_id,
                    &session.project,
                    session.user_id.clone(),
                    session.user_prompt.clone(),
                    session.status.as_str(),
                    &session.started_at,
                    session.started_at_epoch,
                    session.completed_at.clone(),
                    session.completed_at_epoch,
                    session.prompt_counter
                ],
            )
            .await?;
        if let Some(id) = row_id(inserted)? {
            return Ok(ImportResult { imported: true, id });
        }
        // Lost a race with a concurrent writer
        let id = self
            .session_db_id(&session.session_id)
            .await?
            .ok_or_else(|| MemError::NotFound(format!("session {}", session.session_id)))?;
        self.merge_session(id, session).await?;
        Ok(ImportResult { imported: false, id })
    }

    /// Fill-only update: nothing the row already knows is overwritten, the
    /// prompt counter only moves forward, and a terminal status is taken
    /// over only while the row is still active.
    async fn merge_session(&self, id: i64, session: &Session) -> Result<(), MemError> {
        let status = session.status.as_str();
        self.backend()
            .execute(
                "UPDATE sessions SET
                     project = CASE WHEN project = '' THEN ? ELSE project END,
                     user_id = COALESCE(user_id, ?),
                     user_prompt = COALESCE(user_prompt, ?),
                     started_at = CASE WHEN started_at_epoch > ? THEN ? ELSE started_at END,
                     started_at_epoch = CASE WHEN started_at_epoch > ? THEN ? ELSE started_at_epoch END,
                     prompt_counter = CASE WHEN prompt_counter < ? THEN ? ELSE prompt_counter END,
                     completed_at = CASE WHEN status = 'active' AND ? <> 'active' THEN ? ELSE completed_at END,
                     completed_at_epoch = CASE WHEN status = 'active' AND ? <> 'active' THEN ?
                         ELSE completed_at_epoch END,
                     status = CASE WHEN status = 'active' AND ? <> 'active' THEN ? ELSE status END
                 WHERE id = ?",
                &params![
                    &session.project,
                    session.user_id.clone(),
                    session.user_prompt.clone(),
                    session.started_at_epoch,
                    &session.started_at,
                    session.started_at_epoch,
                    session.started_at_epoch,
                    session.prompt_counter,
                    session.prompt_counter,
                    status,
                    session.completed_at.clone(),
                    status,
                    session.completed_at_epoch,
                    status,
                    status,
                    id
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn import_observation(
        &self,
        input: &ObservationInput,
    ) -> Result<ImportResult, MemError> {
        self.ensure_session_exists(&input.session_id, &input.project)
            .await?;
        let created_at_epoch = input.created_at_epoch.unwrap_or_else(now_epoch_ms);
        let key = || self.observation_by_key(&input.session_id, &input.title, created_at_epoch);
        if let Some(id) = key().await? {
            return Ok(ImportResult { imported: false, id });
        }

        let sql = insert_sql("observations", OBSERVATION_INSERT_COLUMNS, input.id.is_some(), true);
        let inserted = self
            .backend()
            .query_opt(&sql, &observation_params(input, created_at_epoch)?)
            .await?;
        if let Some(id) = row_id(inserted)? {
            if input.id.is_some() {
                self.resync_sequence("observations").await?;
            }
            return Ok(ImportResult { imported: true, id });
        }
        if let Some(id) = key().await? {
            return Ok(ImportResult { imported: false, id });
        }
        match input.id {
            // The id is held by a different row; keep the data under a fresh id.
            Some(taken) => {
                log::warn!("observation id {taken} already in use, importing under a new id");
                let stored = self
                    .store_observation(&ObservationInput {
                        id: None,
                        created_at_epoch: Some(created_at_epoch),
                        ..input.clone()
                    })
                    .await?;
                Ok(ImportResult {
                    imported: true,
                    id: stored.id,
                })
            }
            None => Err(MemError::NotFound(format!(
                "observation {:?} in session {}",
                input.title, input.session_id
            ))),
        }
    }

    pub async fn import_session_summary(
        &self,
        input: &SummaryInput,
    ) -> Result<ImportResult, MemError> {
        self.ensure_session_exists(&input.session_id, &input.project)
            .await?;
        let created_at_epoch = input.created_at_epoch.unwrap_or_else(now_epoch_ms);
        let key = || self.summary_by_key(&input.session_id, input.prompt_number);
        if let Some(id) = key().await? {
            return Ok(ImportResult { imported: false, id });
        }

        let sql = insert_sql("session_summaries", SUMMARY_INSERT_COLUMNS, input.id.is_some(), true);
        let inserted = self
            .backend()
            .query_opt(&sql, &summary_params(input, created_at_epoch)?)
            .await?;
        if let Some(id) = row_id(inserted)? {
            if input.id.is_some() {
                self.resync_sequence("session_summaries").await?;
            }
            return Ok(ImportResult { imported: true, id });
        }
        if let Some(id) = key().await? {
            return Ok(ImportResult { imported: false, id });
        }
        match input.id {
            Some(taken) => {
                log::warn!("summary id {taken} already in use, importing under a new id");
                let stored = self
                    .store_summary(&SummaryInput {
                        id: None,
                        created_at_epoch: Some(created_at_epoch),
                        ..input.clone()
                    })
                    .await?;
                Ok(ImportResult {
                    imported: true,
                    id: stored.id,
                })
            }
            None => Err(MemError::NotFound(format!(
                "summary for session {}",
                input.session_id
            ))),
        }
    }

    pub async fn import_user_prompt(&self, input: &PromptInput) -> Result<ImportResult, MemError> {
        self.ensure_session_exists(&input.session_id, "").await?;
        let key = || self.prompt_by_key(&input.session_id, input.prompt_number);
        if let Some(id) = key().await? {
            return Ok(ImportResult { imported: false, id });
        }

        let created_at_epoch = input.created_at_epoch.unwrap_or_else(now_epoch_ms);
        if let Some(id) = self.insert_prompt(input, input.id, created_at_epoch).await? {
            return Ok(ImportResult { imported: true, id });
        }
        if let Some(id) = key().await? {
            return Ok(ImportResult { imported: false, id });
        }
        if let Some(taken) = input.id {
            log::warn!("prompt id {taken} already in use, importing under a new id");
            if let Some(id) = self.insert_prompt(input, None, created_at_epoch).await? {
                return Ok(ImportResult { imported: true, id });
            }
        }
        Err(MemError::NotFound(format!(
            "prompt {} in session {}",
            input.prompt_number, input.session_id
        )))
    }

    async fn insert_prompt(
        &self,
        input: &PromptInput,
        id: Option<i64>,
        created_at_epoch: i64,
    ) -> Result<Option<i64>, MemError> {
        let columns = ["session_id", "prompt_number", "prompt_text", "created_at", "created_at_epoch"];
        let mut values: Vec<Value> = id.into_iter().map(Value::from).collect();
        values.extend(params![
            &input.session_id,
            input.prompt_number,
            &input.prompt_text,
            iso_from_epoch_ms(created_at_epoch),
            created_at_epoch
        ]);
        let sql = insert_sql("user_prompts", &columns, id.is_some(), true);
        let inserted = row_id(self.backend().query_opt(&sql, &values).await?)?;
        if inserted.is_some() && id.is_some() {
            self.resync_sequence("user_prompts").await?;
        }
        Ok(inserted)
    }

    /// Everything recorded for one project, or for all of them.
    pub async fn export_project(&self, project: Option<&str>) -> Result<ExportBundle, MemError> {
        let (scoped, scope_params) = match project {
            Some(p) => ("WHERE project = ?", params![p]),
            None => ("", params![]),
        };
        let db = self.backend();

        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions {scoped} ORDER BY started_at_epoch ASC, id ASC");
        let sessions = db
            .query(&sql, &scope_params)
            .await?
            .iter()
            .map(Session::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM session_summaries {scoped} ORDER BY created_at_epoch ASC, id ASC"
        );
        let summaries = db
            .query(&sql, &scope_params)
            .await?
            .iter()
            .map(SessionSummary::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations {scoped} ORDER BY created_at_epoch ASC, id ASC"
        );
        let observations = db
            .query(&sql, &scope_params)
            .await?
            .iter()
            .map(Observation::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let prompt_scope = if project.is_some() { "WHERE s.project = ?" } else { "" };
        let sql = format!(
            "SELECT up.id, up.session_id, up.prompt_number, up.prompt_text, up.created_at, up.created_at_epoch
             FROM user_prompts up JOIN sessions s ON s.session_id = up.session_id
             {prompt_scope}
             ORDER BY up.created_at_epoch ASC, up.id ASC"
        );
        let prompts = db
            .query(&sql, &scope_params)
            .await?
            .iter()
            .map(UserPrompt::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ExportBundle {
            exported_at: iso_from_epoch_ms(now_epoch_ms()),
            project: project.map(str::to_string),
            sessions,
            summaries,
            observations,
            prompts,
        })
    }

    /// Import a bundle in dependency order. Row ids from the source database
    /// are dropped; natural keys decide what already exists.
    pub async fn import_bundle(&self, bundle: &ExportBundle) -> Result<ImportReport, MemError> {
        let mut report = ImportReport::default();
        for s in &bundle.sessions {
            report.sessions.record(self.import_sdk_session(s).await?);
        }
        for s in &bundle.summaries {
            let input = SummaryInput {
                id: None,
                ..SummaryInput::from(s)
            };
            report.summaries.record(self.import_session_summary(&input).await?);
        }
        for o in &bundle.observations {
            let input = ObservationInput {
                id: None,
                ..ObservationInput::from(o)
            };
            report.observations.record(self.import_observation(&input).await?);
        }
        for p in &bundle.prompts {
            let input = PromptInput {
                id: None,
                ..PromptInput::from(p)
            };
            report.prompts.record(self.import_user_prompt(&input).await?);
        }
        log::info!(
            "imported {} sessions, {} summaries, {} observations, {} prompts",
            report.sessions.imported,
            report.summaries.imported,
            report.observations.imported,
            report.prompts.imported
        );
        Ok(report)
    }

    async fn session_db_id(&self, session_id: &str) -> Result<Option<i64>, MemError> {
        row_id(
            self.backend()
                .query_opt("SELECT id FROM sessions WHERE session_id = ?", &params![session_id])
                .await?,
        )
    }

    async fn observation_by_key(
        &self,
        session_id: &str,
        title: &str,
        created_at_epoch: i64,
    ) -> Result<Option<i64>, MemError> {
        row_id(
            self.backend()
                .query_opt(
                    "SELECT id FROM observations WHERE session_id = ? AND title = ? AND created_at_epoch = ?",
                    &params![session_id, title, created_at_epoch],
                )
                .await?,
        )
    }

    async fn summary_by_key(
        &self,
        session_id: &str,
        prompt_number: Option<i64>,
    ) -> Result<Option<i64>, MemError> {
        let row = match prompt_number {
            Some(n) => {
                self.backend()
                    .query_opt(
                        "SELECT id FROM session_summaries WHERE session_id = ? AND prompt_number = ?",
                        &params![session_id, n],
                    )
                    .await?
            }
            None => {
                self.backend()
                    .query_opt(
                        "SELECT id FROM session_summaries WHERE session_id = ? AND prompt_number IS NULL",
                        &params![session_id],
                    )
                    .await?
            }
        };
        row_id(row)
    }

    async fn prompt_by_key(
        &self,
        session_id: &str,
        prompt_number: i64,
    ) -> Result<Option<i64>, MemError> {
        row_id(
            self.backend()
                .query_opt(
                    "SELECT id FROM user_prompts WHERE session_id = ? AND prompt_number = ?",
                    &params![session_id, prompt_number],
                )
                .await?,
        )
    }
}
