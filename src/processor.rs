//! Poll loop draining the work queue through an enrichment step.
//!
//! One job per session is claimed at a time. A job only reaches `processed`
//! after everything it produced is stored; replication follows, detached.

use crate::config::QueueConfig;
use crate::model::{
    FailOutcome, ObservationInput, PendingMessage, Session, Stored, SummaryInput,
};
use crate::queue::WorkQueue;
use crate::replicate::ReplicationFanout;
use crate::store::SessionStore;
use crate::MemError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// What enrichment derived from one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub observations: Vec<ObservationInput>,
    pub summary: Option<SummaryInput>,
}

/// External enrichment, e.g. a language model turning raw tool events into observations.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, session: &Session, job: &PendingMessage) -> Result<Enrichment, MemError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Processed {
        job_id: i64,
        observations: Vec<Stored>,
        summary: Option<Stored>,
    },
    Failed {
        job_id: i64,
        outcome: FailOutcome,
    },
    /// Results were stored but the job had been requeued meanwhile.
    Reclaimed { job_id: i64 },
}

pub struct QueueProcessor {
    store: Arc<SessionStore>,
    queue: Arc<WorkQueue>,
    fanout: Arc<ReplicationFanout>,
    enricher: Arc<dyn Enricher>,
    config: QueueConfig,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<SessionStore>,
        queue: Arc<WorkQueue>,
        fanout: Arc<ReplicationFanout>,
        enricher: Arc<dyn Enricher>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            fanout,
            enricher,
            config,
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), MemError> {
        // Anything still `processing` belongs to a worker that no longer exists.
        let recovered = self.queue.reset_stuck_messages(0).await?;
        if recovered > 0 {
            log::info!("startup recovery requeued {recovered} job(s)");
        }

        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms.max(10)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recovery = interval(Duration::from_secs(self.config.recovery_interval_secs.max(1)));
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; recovery just ran.
        recovery.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    if let Err(e) = self.tick().await {
                        log::error!("queue poll: {e}");
                    }
                }
                _ = recovery.tick() => {
                    if let Err(e) = self.recover().await {
                        log::error!("queue recovery: {e}");
                    }
                }
            }
        }
        log::info!("queue processor stopped");
        Ok(())
    }

    /// One pass over every session with work. A session whose job cannot be
    /// handled is logged and skipped; the rest of the pass still runs.
    pub async fn tick(&self) -> Result<Vec<JobOutcome>, MemError> {
        let mut outcomes = Vec::new();
        for session_db_id in self.queue.get_sessions_with_pending_messages().await? {
            match self.process_next(session_db_id).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => log::error!("queue poll: session {session_db_id}: {e}"),
            }
        }
        Ok(outcomes)
    }

    /// Requeue hung jobs and trim the processed history.
    pub async fn recover(&self) -> Result<(), MemError> {
        let threshold_ms = i64::try_from(self.config.stuck_threshold_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let requeued = self.queue.reset_stuck_messages(threshold_ms).await?;
        if requeued > 0 {
            log::warn!("requeued {requeued} job(s) stuck longer than {}s", self.config.stuck_threshold_secs);
        }
        self.queue
            .cleanup_processed(self.config.processed_retention)
            .await?;
        Ok(())
    }

    /// Claim and process the oldest pending job of one session.
    /// `None` when there is nothing to claim or another worker won the claim.
    pub async fn process_next(&self, session_db_id: i64) -> Result<Option<JobOutcome>, MemError> {
        let Some(job) = self.queue.peek_pending(session_db_id).await? else {
            return Ok(None);
        };
        if !self.queue.mark_processing(job.id).await? {
            return Ok(None);
        }

        match self.handle(&job).await {
            Ok((observations, summary)) => {
                if !self.queue.mark_processed(job.id).await? {
                    // Requeued under us; whoever holds it now replicates.
                    log::warn!(
                        "job {} for session {} was reclaimed before completion",
                        job.id,
                        job.content_session_id
                    );
                    return Ok(Some(JobOutcome::Reclaimed { job_id: job.id }));
                }
                for o in &observations {
                    self.fanout.replicate_observation(o);
                }
                if let Some(s) = &summary {
                    self.fanout.replicate_summary(s);
                }
                Ok(Some(JobOutcome::Processed {
                    job_id: job.id,
                    observations: observations.iter().map(stored_of_observation).collect(),
                    summary: summary.as_ref().map(stored_of_summary),
                }))
            }
            Err(e) => {
                log::warn!(
                    "job {} ({}) for session {} failed: {e}",
                    job.id,
                    job.payload.message_type(),
                    job.content_session_id
                );
                let outcome = self.queue.mark_failed(job.id).await?;
                Ok(Some(JobOutcome::Failed {
                    job_id: job.id,
                    outcome,
                }))
            }
        }
    }

    /// Enrich and store. Returns the stored rows as fully resolved inputs,
    /// ready to replicate with their assigned ids.
    ///
    /// Writes go through the natural-key imports, and outputs without a
    /// timestamp are stamped from the job's creation time. A job redelivered
    /// after a crash therefore lands on the rows its first attempt wrote.
    async fn handle(
        &self,
        job: &PendingMessage,
    ) -> Result<(Vec<ObservationInput>, Option<SummaryInput>), MemError> {
        let session = self
            .store
            .get_session_by_id(job.session_db_id)
            .await?
            .ok_or_else(|| MemError::NotFound(format!("session {}", job.session_db_id)))?;
        let enrichment = self.enricher.enrich(&session, job).await?;

        let mut observations = Vec::with_capacity(enrichment.observations.len());
        for (offset, mut o) in (0i64..).zip(enrichment.observations) {
            o.id = None;
            o.created_at_epoch.get_or_insert(job.created_at_epoch + offset);
            let result = self.store.import_observation(&o).await?;
            if !result.imported {
                log::debug!("job {}: observation {} already stored", job.id, result.id);
            }
            o.id = Some(result.id);
            observations.push(o);
        }
        let summary = match enrichment.summary {
            Some(mut s) => {
                s.id = None;
                s.created_at_epoch.get_or_insert(job.created_at_epoch);
                let result = self.store.import_session_summary(&s).await?;
                if result.imported {
                    s.id = Some(result.id);
                    Some(s)
                } else {
                    log::debug!("job {}: summary {} already stored", job.id, result.id);
                    let existing = self
                        .store
                        .get_summary_by_id(result.id)
                        .await?
                        .ok_or_else(|| MemError::NotFound(format!("summary {}", result.id)))?;
                    Some(SummaryInput::from(&existing))
                }
            }
            None => None,
        };
        Ok((observations, summary))
    }
}

fn stored_of_observation(o: &ObservationInput) -> Stored {
    Stored {
        id: o.id.unwrap_or_default(),
        created_at_epoch: o.created_at_epoch.unwrap_or_default(),
    }
}

fn stored_of_summary(s: &SummaryInput) -> Stored {
    Stored {
        id: s.id.unwrap_or_default(),
        created_at_epoch: s.created_at_epoch.unwrap_or_default(),
    }
}
