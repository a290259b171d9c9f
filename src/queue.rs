//! Durable per-session work queue with bounded retry.
//!
//! `pending -> processing -> processed | pending (retry) | failed`
//!
//! Every transition is one conditional UPDATE guarded on the current status,
//! so concurrent callers racing on the same job see at most one success.

use crate::backend::{StorageBackend, Value};
use crate::metrics::record_job;
use crate::model::{FailOutcome, JobPayload, JobStatus, NewJob, PendingMessage, QueueStats};
use crate::{now_epoch_ms, params, MemError};
use std::sync::Arc;

pub const DEFAULT_MAX_RETRIES: i64 = 3;

const MESSAGE_COLUMNS: &str = "id, session_db_id, content_session_id, message_type, tool_name, \
     tool_input, tool_response, cwd, last_user_message, last_assistant_message, prompt_number, \
     status, retry_count, created_at_epoch, started_processing_at_epoch, completed_at_epoch";

pub struct WorkQueue {
    db: Arc<dyn StorageBackend>,
    max_retries: i64,
}

fn messages(rows: Vec<crate::backend::Row>) -> Result<Vec<PendingMessage>, MemError> {
    rows.iter().map(PendingMessage::from_row).collect()
}

impl WorkQueue {
    pub fn new(db: Arc<dyn StorageBackend>, max_retries: i64) -> Self {
        Self { db, max_retries }
    }

    pub fn max_retries(&self) -> i64 {
        self.max_retries
    }

    /// Persist a job as `pending`. Nothing is dispatched from here.
    pub async fn enqueue(&self, job: &NewJob) -> Result<i64, MemError> {
        let payload: [Value; 7] = match &job.payload {
            JobPayload::Observation {
                tool_name,
                tool_input,
                tool_response,
                cwd,
                prompt_number,
            } => [
                tool_name.clone().into(),
                tool_input.clone().into(),
                tool_response.clone().into(),
                cwd.clone().into(),
                None::<String>.into(),
                None::<String>.into(),
                (*prompt_number).into(),
            ],
            JobPayload::Summarize {
                last_user_message,
                last_assistant_message,
                prompt_number,
            } => [
                None::<String>.into(),
                None::<String>.into(),
                None::<String>.into(),
                None::<String>.into(),
                last_user_message.clone().into(),
                last_assistant_message.clone().into(),
                (*prompt_number).into(),
            ],
        };
        let mut values = params![
            job.session_db_id,
            &job.content_session_id,
            job.payload.message_type()
        ];
        values.extend(payload);
        values.push(now_epoch_ms().into());

        let row = self
            .db
            .query_opt(
                "INSERT INTO pending_messages (session_db_id, content_session_id, message_type,
                     tool_name, tool_input, tool_response, cwd, last_user_message,
                     last_assistant_message, prompt_number, status, retry_count, created_at_epoch)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?)
                 RETURNING id",
                &values,
            )
            .await?
            .ok_or_else(|| MemError::NotFound("inserted job row".into()))?;
        let id = row.get("id")?;
        record_job("enqueued", 1);
        log::debug!(
            "enqueued {} job {id} for session {}",
            job.payload.message_type(),
            job.content_session_id
        );
        Ok(id)
    }

    /// Claim a pending job. `false` when someone else already holds it or it is not pending.
    pub async fn mark_processing(&self, id: i64) -> Result<bool, MemError> {
        let n = self
            .db
            .execute(
                "UPDATE pending_messages SET status = 'processing', started_processing_at_epoch = ?
                 WHERE id = ? AND status = 'pending'",
                &params![now_epoch_ms(), id],
            )
            .await?;
        record_job("claimed", n);
        Ok(n > 0)
    }

    /// Complete a claimed job and drop its bulky payload fields.
    pub async fn mark_processed(&self, id: i64) -> Result<bool, MemError> {
        let n = self
            .db
            .execute(
                "UPDATE pending_messages SET status = 'processed', completed_at_epoch = ?,
                     tool_input = NULL, tool_response = NULL, last_assistant_message = NULL
                 WHERE id = ? AND status = 'processing'",
                &params![now_epoch_ms(), id],
            )
            .await?;
        record_job("processed", n);
        Ok(n > 0)
    }

    /// Record a failed attempt. The job goes back to `pending` until the
    /// incremented retry count reaches `max_retries`, then it is `failed`.
    pub async fn mark_failed(&self, id: i64) -> Result<FailOutcome, MemError> {
        let max = self.max_retries;
        let row = self
            .db
            .query_opt(
                "UPDATE pending_messages SET
                     retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 < ? THEN 'pending' ELSE 'failed' END,
                     started_processing_at_epoch = CASE WHEN retry_count + 1 < ? THEN NULL
                         ELSE started_processing_at_epoch END,
                     completed_at_epoch = CASE WHEN retry_count + 1 < ? THEN NULL ELSE ? END
                 WHERE id = ? AND status = 'processing'
                 RETURNING status, retry_count",
                &params![max, max, max, now_epoch_ms(), id],
            )
            .await?;
        let Some(row) = row else {
            return Ok(FailOutcome::Untouched);
        };
        let retry_count = row.get("retry_count")?;
        let status: JobStatus = row.get::<String>("status")?.parse()?;
        if status == JobStatus::Failed {
            record_job("failed", 1);
            log::warn!("job {id} failed permanently after {retry_count} attempts");
            Ok(FailOutcome::Failed { retry_count })
        } else {
            record_job("requeued", 1);
            log::info!("job {id} requeued (attempt {retry_count} of {max})");
            Ok(FailOutcome::Requeued { retry_count })
        }
    }

    /// Operator override: put any non-processed job back in the queue.
    /// The retry count is left as is.
    pub async fn retry_message(&self, id: i64) -> Result<bool, MemError> {
        let n = self
            .db
            .execute(
                "UPDATE pending_messages SET status = 'pending',
                     started_processing_at_epoch = NULL, completed_at_epoch = NULL
                 WHERE id = ? AND status IN ('pending', 'processing', 'failed')",
                &params![id],
            )
            .await?;
        record_job("retried", n);
        Ok(n > 0)
    }

    /// Requeue `processing` jobs claimed more than `threshold_ms` ago.
    /// A threshold of zero requeues every `processing` job regardless of age.
    pub async fn reset_stuck_messages(&self, threshold_ms: i64) -> Result<u64, MemError> {
        Ok(self.retry_all_stuck(threshold_ms).await?.len() as u64)
    }

    /// Same as [`reset_stuck_messages`](Self::reset_stuck_messages), returning the ids it moved.
    pub async fn retry_all_stuck(&self, threshold_ms: i64) -> Result<Vec<i64>, MemError> {
        let rows = if threshold_ms <= 0 {
            self.db
                .query(
                    "UPDATE pending_messages SET status = 'pending', started_processing_at_epoch = NULL
                     WHERE status = 'processing'
                     RETURNING id",
                    &[],
                )
                .await?
        } else {
            self.db
                .query(
                    "UPDATE pending_messages SET status = 'pending', started_processing_at_epoch = NULL
                     WHERE status = 'processing'
                       AND (started_processing_at_epoch IS NULL OR started_processing_at_epoch < ?)
                     RETURNING id",
                    &params![now_epoch_ms() - threshold_ms],
                )
                .await?
        };
        let mut ids = rows
            .iter()
            .map(|r| r.get("id"))
            .collect::<Result<Vec<i64>, _>>()?;
        ids.sort_unstable();
        if !ids.is_empty() {
            record_job("recovered", ids.len() as u64);
            log::info!("requeued {} stuck job(s)", ids.len());
        }
        Ok(ids)
    }

    /// Delete a job outright, whatever its state.
    pub async fn abort_message(&self, id: i64) -> Result<bool, MemError> {
        let n = self
            .db
            .execute("DELETE FROM pending_messages WHERE id = ?", &params![id])
            .await?;
        record_job("aborted", n);
        Ok(n > 0)
    }

    /// Keep only the `retention` most recently completed `processed` jobs.
    pub async fn cleanup_processed(&self, retention: i64) -> Result<u64, MemError> {
        let n = self
            .db
            .execute(
                "DELETE FROM pending_messages
                 WHERE status = 'processed'
                   AND id NOT IN (
                       SELECT id FROM pending_messages
                       WHERE status = 'processed'
                       ORDER BY completed_at_epoch DESC, id DESC
                       LIMIT ?
                   )",
                &params![retention.max(0)],
            )
            .await?;
        if n > 0 {
            log::debug!("cleaned up {n} processed job(s)");
        }
        Ok(n)
    }

    // --- Reads ---

    pub async fn get_message(&self, id: i64) -> Result<Option<PendingMessage>, MemError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM pending_messages WHERE id = ?");
        self.db
            .query_opt(&sql, &params![id])
            .await?
            .map(|r| PendingMessage::from_row(&r))
            .transpose()
    }

    /// Oldest pending job for a session, without claiming it.
    pub async fn peek_pending(&self, session_db_id: i64) -> Result<Option<PendingMessage>, MemError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM pending_messages
             WHERE session_db_id = ? AND status = 'pending'
             ORDER BY created_at_epoch ASC, id ASC LIMIT 1"
        );
        self.db
            .query_opt(&sql, &params![session_db_id])
            .await?
            .map(|r| PendingMessage::from_row(&r))
            .transpose()
    }

    pub async fn get_all_pending(&self, session_db_id: i64) -> Result<Vec<PendingMessage>, MemError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM pending_messages
             WHERE session_db_id = ? AND status = 'pending'
             ORDER BY created_at_epoch ASC, id ASC"
        );
        messages(self.db.query(&sql, &params![session_db_id]).await?)
    }

    /// Every job not yet processed: failed first, then processing, then pending.
    pub async fn get_queue_messages(&self) -> Result<Vec<PendingMessage>, MemError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM pending_messages
             WHERE status IN ('pending', 'processing', 'failed')
             ORDER BY CASE status WHEN 'failed' THEN 0 WHEN 'processing' THEN 1 ELSE 2 END,
                      created_at_epoch ASC, id ASC"
        );
        messages(self.db.query(&sql, &[]).await?)
    }

    pub async fn get_stuck_count(&self, threshold_ms: i64) -> Result<i64, MemError> {
        let row = self
            .db
            .query_opt(
                "SELECT COUNT(*) AS n FROM pending_messages
                 WHERE status = 'processing'
                   AND (started_processing_at_epoch IS NULL OR started_processing_at_epoch < ?)",
                &params![now_epoch_ms() - threshold_ms.max(0)],
            )
            .await?;
        count(row)
    }

    /// Jobs still owed work for a session: pending plus in flight.
    pub async fn get_pending_count(&self, session_db_id: i64) -> Result<i64, MemError> {
        let row = self
            .db
            .query_opt(
                "SELECT COUNT(*) AS n FROM pending_messages
                 WHERE session_db_id = ? AND status IN ('pending', 'processing')",
                &params![session_db_id],
            )
            .await?;
        count(row)
    }

    pub async fn has_any_pending_work(&self) -> Result<bool, MemError> {
        let row = self
            .db
            .query_opt(
                "SELECT id FROM pending_messages WHERE status IN ('pending', 'processing') LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_sessions_with_pending_messages(&self) -> Result<Vec<i64>, MemError> {
        self.db
            .query(
                "SELECT DISTINCT session_db_id FROM pending_messages
                 WHERE status IN ('pending', 'processing')
                 ORDER BY session_db_id ASC",
                &[],
            )
            .await?
            .iter()
            .map(|r| r.get("session_db_id"))
            .collect()
    }

    /// Processed jobs completed within the last `window_ms`, newest first.
    pub async fn get_recently_processed(
        &self,
        limit: i64,
        window_ms: i64,
    ) -> Result<Vec<PendingMessage>, MemError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM pending_messages
             WHERE status = 'processed' AND completed_at_epoch >= ?
             ORDER BY completed_at_epoch DESC, id DESC LIMIT ?"
        );
        messages(
            self.db
                .query(&sql, &params![now_epoch_ms() - window_ms, limit])
                .await?,
        )
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, MemError> {
        let rows = self
            .db
            .query(
                "SELECT status, COUNT(*) AS n FROM pending_messages GROUP BY status",
                &[],
            )
            .await?;
        let mut stats = QueueStats::default();
        for row in rows {
            let n: i64 = row.get("n")?;
            match row.get::<String>("status")?.parse()? {
                JobStatus::Pending => stats.pending = n,
                JobStatus::Processing => stats.processing = n,
                JobStatus::Processed => stats.processed = n,
                JobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

fn count(row: Option<crate::backend::Row>) -> Result<i64, MemError> {
    match row {
        Some(r) => r.get("n"),
        None => Ok(0),
    }
}
