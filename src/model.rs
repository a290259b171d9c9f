//! Entities persisted by the session store and the work queue.

use crate::backend::Row;
use crate::MemError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(MemError::Config(format!("unknown session status {other:?}"))),
        }
    }
}

/// Classification tag assigned to an observation by enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationType {
    Bugfix,
    Feature,
    Refactor,
    Change,
    Discovery,
    Decision,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::Bugfix => "bugfix",
            ObservationType::Feature => "feature",
            ObservationType::Refactor => "refactor",
            ObservationType::Change => "change",
            ObservationType::Discovery => "discovery",
            ObservationType::Decision => "decision",
        }
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObservationType {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bugfix" => Ok(ObservationType::Bugfix),
            "feature" => Ok(ObservationType::Feature),
            "refactor" => Ok(ObservationType::Refactor),
            "change" => Ok(ObservationType::Change),
            "discovery" => Ok(ObservationType::Discovery),
            "decision" => Ok(ObservationType::Decision),
            other => Err(MemError::Config(format!("unknown observation type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub session_id: String,
    pub project: String,
    pub user_id: Option<String>,
    pub user_prompt: Option<String>,
    pub status: SessionStatus,
    pub started_at: String,
    pub started_at_epoch: i64,
    pub completed_at: Option<String>,
    pub completed_at_epoch: Option<i64>,
    pub worker_port: Option<i64>,
    pub prompt_counter: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub session_id: String,
    pub project: String,
    pub obs_type: ObservationType,
    pub title: String,
    pub subtitle: Option<String>,
    pub narrative: Option<String>,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at: String,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: i64,
    pub session_id: String,
    pub project: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub notes: Option<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
    pub discovery_tokens: i64,
    pub created_at: String,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPrompt {
    pub id: i64,
    pub session_id: String,
    pub prompt_number: i64,
    pub prompt_text: String,
    pub created_at: String,
    pub created_at_epoch: i64,
}

/// New observation as produced by enrichment. `id` and `created_at_epoch`
/// are only set when the row must mirror one written elsewhere.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationInput {
    #[serde(default)]
    pub id: Option<i64>,
    pub session_id: String,
    pub project: String,
    pub obs_type: Option<ObservationType>,
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub prompt_number: Option<i64>,
    #[serde(default)]
    pub discovery_tokens: i64,
    #[serde(default)]
    pub created_at_epoch: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SummaryInput {
    #[serde(default)]
    pub id: Option<i64>,
    pub session_id: String,
    pub project: String,
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub investigated: Option<String>,
    #[serde(default)]
    pub learned: Option<String>,
    #[serde(default)]
    pub completed: Option<String>,
    #[serde(default)]
    pub next_steps: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub prompt_number: Option<i64>,
    #[serde(default)]
    pub discovery_tokens: i64,
    #[serde(default)]
    pub created_at_epoch: Option<i64>,
}

impl From<&Observation> for ObservationInput {
    fn from(o: &Observation) -> Self {
        Self {
            id: Some(o.id),
            session_id: o.session_id.clone(),
            project: o.project.clone(),
            obs_type: Some(o.obs_type),
            title: o.title.clone(),
            subtitle: o.subtitle.clone(),
            narrative: o.narrative.clone(),
            facts: o.facts.clone(),
            concepts: o.concepts.clone(),
            files_read: o.files_read.clone(),
            files_modified: o.files_modified.clone(),
            prompt_number: o.prompt_number,
            discovery_tokens: o.discovery_tokens,
            created_at_epoch: Some(o.created_at_epoch),
        }
    }
}

impl From<&SessionSummary> for SummaryInput {
    fn from(s: &SessionSummary) -> Self {
        Self {
            id: Some(s.id),
            session_id: s.session_id.clone(),
            project: s.project.clone(),
            request: s.request.clone(),
            investigated: s.investigated.clone(),
            learned: s.learned.clone(),
            completed: s.completed.clone(),
            next_steps: s.next_steps.clone(),
            notes: s.notes.clone(),
            files_read: s.files_read.clone(),
            files_modified: s.files_modified.clone(),
            prompt_number: s.prompt_number,
            discovery_tokens: s.discovery_tokens,
            created_at_epoch: Some(s.created_at_epoch),
        }
    }
}

/// Id and creation time of a freshly stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stored {
    pub id: i64,
    pub created_at_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub imported: bool,
    pub id: i64,
}

// --- Work queue ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "processed" => Ok(JobStatus::Processed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(MemError::Config(format!("unknown job status {other:?}"))),
        }
    }
}

/// Kind-dependent job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobPayload {
    Observation {
        tool_name: Option<String>,
        tool_input: Option<String>,
        tool_response: Option<String>,
        cwd: Option<String>,
        prompt_number: Option<i64>,
    },
    Summarize {
        last_user_message: Option<String>,
        last_assistant_message: Option<String>,
        prompt_number: Option<i64>,
    },
}

impl JobPayload {
    pub fn message_type(&self) -> &'static str {
        match self {
            JobPayload::Observation { .. } => "observation",
            JobPayload::Summarize { .. } => "summarize",
        }
    }
}

/// A job to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub session_db_id: i64,
    pub content_session_id: String,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: i64,
    pub session_db_id: i64,
    pub content_session_id: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub retry_count: i64,
    pub created_at_epoch: i64,
    pub started_processing_at_epoch: Option<i64>,
    pub completed_at_epoch: Option<i64>,
}

/// What a `mark_failed` call did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue for another attempt.
    Requeued { retry_count: i64 },
    /// Retries exhausted.
    Failed { retry_count: i64 },
    /// The job was not in `processing`; nothing changed.
    Untouched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub processed: i64,
    pub failed: i64,
}

// --- Row mapping ---

fn json_list(row: &Row, column: &str) -> Result<Vec<String>, MemError> {
    let raw: Option<String> = row.get(column)?;
    match raw.as_deref() {
        None | Some("") => Ok(Vec::new()),
        Some(s) => Ok(serde_json::from_str(s)?),
    }
}

impl Session {
    pub(crate) fn from_row(row: &Row) -> Result<Self, MemError> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            project: row.get("project")?,
            user_id: row.get("user_id")?,
            user_prompt: row.get("user_prompt")?,
            status: row.get::<String>("status")?.parse()?,
            started_at: row.get("started_at")?,
            started_at_epoch: row.get("started_at_epoch")?,
            completed_at: row.get("completed_at")?,
            completed_at_epoch: row.get("completed_at_epoch")?,
            worker_port: row.get("worker_port")?,
            prompt_counter: row.get("prompt_counter")?,
        })
    }
}

impl Observation {
    pub(crate) fn from_row(row: &Row) -> Result<Self, MemError> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            project: row.get("project")?,
            obs_type: row.get::<String>("obs_type")?.parse()?,
            title: row.get("title")?,
            subtitle: row.get("subtitle")?,
            narrative: row.get("narrative")?,
            facts: json_list(row, "facts")?,
            concepts: json_list(row, "concepts")?,
            files_read: json_list(row, "files_read")?,
            files_modified: json_list(row, "files_modified")?,
            prompt_number: row.get("prompt_number")?,
            discovery_tokens: row.get("discovery_tokens")?,
            created_at: row.get("created_at")?,
            created_at_epoch: row.get("created_at_epoch")?,
        })
    }
}

impl SessionSummary {
    pub(crate) fn from_row(row: &Row) -> Result<Self, MemError> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            project: row.get("project")?,
            request: row.get("request")?,
            investigated: row.get("investigated")?,
            learned: row.get("learned")?,
            completed: row.get("completed")?,
            next_steps: row.get("next_steps")?,
            notes: row.get("notes")?,
            files_read: json_list(row, "files_read")?,
            files_modified: json_list(row, "files_modified")?,
            prompt_number: row.get("prompt_number")?,
            discovery_tokens: row.get("discovery_tokens")?,
            created_at: row.get("created_at")?,
            created_at_epoch: row.get("created_at_epoch")?,
        })
    }
}

impl UserPrompt {
    pub(crate) fn from_row(row: &Row) -> Result<Self, MemError> {
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            prompt_number: row.get("prompt_number")?,
            prompt_text: row.get("prompt_text")?,
            created_at: row.get("created_at")?,
            created_at_epoch: row.get("created_at_epoch")?,
        })
    }
}

impl PendingMessage {
    pub(crate) fn from_row(row: &Row) -> Result<Self, MemError> {
        let message_type: String = row.get("message_type")?;
        let payload = match message_type.as_str() {
            "observation" => JobPayload::Observation {
                tool_name: row.get("tool_name")?,
                tool_input: row.get("tool_input")?,
                tool_response: row.get("tool_response")?,
                cwd: row.get("cwd")?,
                prompt_number: row.get("prompt_number")?,
            },
            "summarize" => JobPayload::Summarize {
                last_user_message: row.get("last_user_message")?,
                last_assistant_message: row.get("last_assistant_message")?,
                prompt_number: row.get("prompt_number")?,
            },
            other => {
                return Err(MemError::Config(format!("unknown message type {other:?}")));
            }
        };
        Ok(Self {
            id: row.get("id")?,
            session_db_id: row.get("session_db_id")?,
            content_session_id: row.get("content_session_id")?,
            payload,
            status: row.get::<String>("status")?.parse()?,
            retry_count: row.get("retry_count")?,
            created_at_epoch: row.get("created_at_epoch")?,
            started_processing_at_epoch: row.get("started_processing_at_epoch")?,
            completed_at_epoch: row.get("completed_at_epoch")?,
        })
    }
}
