//! Context window of records straddling an anchor point in time.

use crate::model::{Observation, SessionSummary, UserPrompt};
use crate::store::{SessionStore, OBSERVATION_COLUMNS, SUMMARY_COLUMNS};
use crate::{params, MemError};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Timeline {
    pub anchor_epoch: i64,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub observations: Vec<Observation>,
    pub summaries: Vec<SessionSummary>,
    pub prompts: Vec<UserPrompt>,
}

impl SessionStore {
    pub async fn get_timeline_around_observation(
        &self,
        observation_id: i64,
        depth_before: i64,
        depth_after: i64,
        project: Option<&str>,
    ) -> Result<Timeline, MemError> {
        let anchor = self
            .get_observation_by_id(observation_id)
            .await?
            .ok_or_else(|| MemError::NotFound(format!("observation {observation_id}")))?;
        self.get_timeline_around_timestamp(anchor.created_at_epoch, depth_before, depth_after, project)
            .await
    }

    /// Locate the window boundaries on the observation stream, then pull every
    /// record kind inside `[start, end]`. A side with fewer than `depth` rows
    /// stops at the anchor.
    pub async fn get_timeline_around_timestamp(
        &self,
        anchor_epoch: i64,
        depth_before: i64,
        depth_after: i64,
        project: Option<&str>,
    ) -> Result<Timeline, MemError> {
        let start_epoch = self
            .boundary(anchor_epoch, depth_before, project, "<", "DESC")
            .await?;
        let end_epoch = self
            .boundary(anchor_epoch, depth_after, project, ">", "ASC")
            .await?;

        let mut range = params![start_epoch, end_epoch];
        let scoped = match project {
            Some(p) => {
                range.push(p.into());
                "AND project = ?"
            }
            None => "",
        };

        let obs_sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations
             WHERE created_at_epoch >= ? AND created_at_epoch <= ? {scoped}
             ORDER BY created_at_epoch ASC, id ASC"
        );
        let observations = self
            .backend()
            .query(&obs_sql, &range)
            .await?
            .iter()
            .map(Observation::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let sum_sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM session_summaries
             WHERE created_at_epoch >= ? AND created_at_epoch <= ? {scoped}
             ORDER BY created_at_epoch ASC, id ASC"
        );
        let summaries = self
            .backend()
            .query(&sum_sql, &range)
            .await?
            .iter()
            .map(SessionSummary::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        // Prompts carry no project of their own; scope through the owning session.
        let prompt_scope = if project.is_some() { "AND s.project = ?" } else { "" };
        let prompt_sql = format!(
            "SELECT up.id, up.session_id, up.prompt_number, up.prompt_text, up.created_at, up.created_at_epoch
             FROM user_prompts up JOIN sessions s ON s.session_id = up.session_id
             WHERE up.created_at_epoch >= ? AND up.created_at_epoch <= ? {prompt_scope}
             ORDER BY up.created_at_epoch ASC, up.id ASC"
        );
        let prompts = self
            .backend()
            .query(&prompt_sql, &range)
            .await?
            .iter()
            .map(UserPrompt::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Timeline {
            anchor_epoch,
            start_epoch,
            end_epoch,
            observations,
            summaries,
            prompts,
        })
    }

    async fn boundary(
        &self,
        anchor_epoch: i64,
        depth: i64,
        project: Option<&str>,
        cmp: &str,
        dir: &str,
    ) -> Result<i64, MemError> {
        if depth <= 0 {
            return Ok(anchor_epoch);
        }
        let mut params = params![anchor_epoch];
        let scoped = match project {
            Some(p) => {
                params.push(p.into());
                "AND project = ?"
            }
            None => "",
        };
        params.push(depth.into());
        let sql = format!(
            "SELECT created_at_epoch FROM observations
             WHERE created_at_epoch {cmp} ? {scoped}
             ORDER BY created_at_epoch {dir} LIMIT ?"
        );
        let rows = self.backend().query(&sql, &params).await?;
        match rows.last() {
            Some(row) => row.get("created_at_epoch"),
            None => Ok(anchor_epoch),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::embedded::EmbeddedBackend;
    use crate::model::{ObservationInput, SummaryInput};
    use crate::store::SessionStore;
    use std::sync::Arc;

    async fn seeded() -> (SessionStore, Vec<i64>) {
        let store = SessionStore::new(Arc::new(EmbeddedBackend::open_in_memory().unwrap()));
        let mut ids = Vec::new();
        for epoch in [10i64, 20, 30, 40, 50] {
            let stored = store
                .store_observation(&ObservationInput {
                    session_id: "s".into(),
                    project: "p".into(),
                    title: format!("obs at {epoch}"),
                    created_at_epoch: Some(epoch),
                    ..Default::default()
                })
                .await
                .unwrap();
            ids.push(stored.id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn window_around_middle_observation() {
        let (store, ids) = seeded().await;
        let tl = store
            .get_timeline_around_observation(ids[2], 2, 2, None)
            .await
            .unwrap();
        assert_eq!(tl.anchor_epoch, 30);
        assert_eq!((tl.start_epoch, tl.end_epoch), (10, 50));
        let epochs: Vec<i64> = tl.observations.iter().map(|o| o.created_at_epoch).collect();
        assert_eq!(epochs, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn short_side_falls_back_to_anchor() {
        let (store, ids) = seeded().await;
        let tl = store
            .get_timeline_around_observation(ids[0], 3, 1, None)
            .await
            .unwrap();
        assert_eq!((tl.start_epoch, tl.end_epoch), (10, 20));
        assert_eq!(tl.observations.len(), 2);
    }

    #[tokio::test]
    async fn window_mixes_record_kinds_and_scopes_by_project() {
        let (store, _) = seeded().await;
        store
            .store_summary(&SummaryInput {
                session_id: "s".into(),
                project: "p".into(),
                request: Some("wrap up".into()),
                prompt_number: Some(1),
                created_at_epoch: Some(35),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .store_observation(&ObservationInput {
                session_id: "other".into(),
                project: "q".into(),
                title: "elsewhere".into(),
                created_at_epoch: Some(33),
                ..Default::default()
            })
            .await
            .unwrap();
        store.save_user_prompt("s", 1, "please fix").await.unwrap();

        let tl = store
            .get_timeline_around_timestamp(32, 1, 1, Some("p"))
            .await
            .unwrap();
        assert_eq!((tl.start_epoch, tl.end_epoch), (30, 40));
        assert_eq!(tl.observations.len(), 2);
        assert_eq!(tl.summaries.len(), 1);
        // The prompt was written "now", well outside the window
        assert!(tl.prompts.is_empty());

        let global = store.get_timeline_around_timestamp(32, 1, 1, None).await.unwrap();
        assert_eq!((global.start_epoch, global.end_epoch), (30, 33));
        assert_eq!(global.observations.len(), 2);
    }

    #[tokio::test]
    async fn missing_anchor_is_not_found() {
        let (store, _) = seeded().await;
        assert!(store.get_timeline_around_observation(999, 1, 1, None).await.is_err());
    }
}
