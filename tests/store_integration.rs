use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracemem::backend::StorageBackend;
use tracemem::embedded::EmbeddedBackend;
use tracemem::import::PromptInput;
use tracemem::model::{ObservationInput, ObservationType, SessionStatus, SummaryInput};
use tracemem::store::{BatchFilter, NewSession, OrderBy, SessionStore};

fn open(path: &Path) -> (Arc<EmbeddedBackend>, SessionStore) {
    let backend = Arc::new(EmbeddedBackend::open(path).unwrap());
    let store = SessionStore::new(backend.clone());
    (backend, store)
}

fn observation(session: &str, project: &str, title: &str, at: i64) -> ObservationInput {
    ObservationInput {
        session_id: session.into(),
        project: project.into(),
        obs_type: Some(ObservationType::Bugfix),
        title: title.into(),
        concepts: vec!["auth".into()],
        files_modified: vec!["/src/auth.rs".into()],
        created_at_epoch: Some(at),
        ..Default::default()
    }
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mem.db");

    let (backend, store) = open(&path);
    let sid = store
        .create_sdk_session(&NewSession {
            session_id: "sess-1".into(),
            project: "alpha".into(),
            user_prompt: Some("Fix the login bug".into()),
            user_id: Some("dev".into()),
        })
        .await
        .unwrap();
    store.set_worker_port(sid, 37777).await.unwrap();
    assert_eq!(store.increment_prompt_counter("sess-1").await.unwrap(), 1);
    let obs = store
        .store_observation(&observation("sess-1", "alpha", "token refresh fixed", 1_000))
        .await
        .unwrap();
    assert!(store.mark_session_completed(sid).await.unwrap());
    backend.close().await.unwrap();

    let (backend, store) = open(&path);
    let session = store.get_session_by_external_id("sess-1").await.unwrap().unwrap();
    assert_eq!(session.id, sid);
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.worker_port, Some(37777));
    assert_eq!(session.prompt_counter, 1);
    assert!(session.completed_at_epoch.is_some());

    let stored = store.get_observation_by_id(obs.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "token refresh fixed");
    assert_eq!(stored.concepts, vec!["auth"]);
    assert_eq!(stored.created_at_epoch, 1_000);

    // A new session id for the same key reactivates the completed session
    let again = store
        .create_sdk_session(&NewSession {
            session_id: "sess-1".into(),
            project: "beta".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(again, sid);
    let session = store.get_session_by_id(sid).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.project, "alpha");
    backend.close().await.unwrap();
}

#[tokio::test]
async fn timeline_spans_every_record_kind() {
    let dir = TempDir::new().unwrap();
    let (backend, store) = open(&dir.path().join("mem.db"));

    let mut ids = Vec::new();
    for (i, at) in [100, 200, 300, 400, 500].into_iter().enumerate() {
        let title = format!("step {i}");
        ids.push(
            store
                .store_observation(&observation("sess-1", "alpha", &title, at))
                .await
                .unwrap()
                .id,
        );
    }
    store
        .store_observation(&observation("sess-2", "beta", "elsewhere", 300))
        .await
        .unwrap();
    store
        .store_summary(&SummaryInput {
            session_id: "sess-1".into(),
            project: "alpha".into(),
            request: Some("Fix the login bug".into()),
            created_at_epoch: Some(250),
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .import_user_prompt(&PromptInput {
            id: None,
            session_id: "sess-1".into(),
            prompt_number: 1,
            prompt_text: "Fix the login bug".into(),
            created_at_epoch: Some(350),
        })
        .await
        .unwrap();

    let t = store
        .get_timeline_around_observation(ids[2], 1, 1, Some("alpha"))
        .await
        .unwrap();
    assert_eq!((t.start_epoch, t.end_epoch), (200, 400));
    let titles: Vec<&str> = t.observations.iter().map(|o| o.title.as_str()).collect();
    assert_eq!(titles, vec!["step 1", "step 2", "step 3"]);
    assert_eq!(t.summaries.len(), 1);
    assert_eq!(t.prompts.len(), 1);

    let unscoped = store
        .get_timeline_around_observation(ids[2], 1, 1, None)
        .await
        .unwrap();
    assert_eq!(unscoped.observations.len(), 4);
    backend.close().await.unwrap();
}

#[tokio::test]
async fn batch_lookup_applies_filters_and_order() {
    let dir = TempDir::new().unwrap();
    let (backend, store) = open(&dir.path().join("mem.db"));

    let a = store
        .store_observation(&observation("sess-1", "alpha", "first", 100))
        .await
        .unwrap()
        .id;
    let b = store
        .store_observation(&ObservationInput {
            obs_type: Some(ObservationType::Discovery),
            concepts: vec!["caching".into()],
            files_modified: vec![],
            files_read: vec!["/src/cache.rs".into()],
            ..observation("sess-1", "alpha", "second", 200)
        })
        .await
        .unwrap()
        .id;
    let c = store
        .store_observation(&observation("sess-2", "beta", "third", 300))
        .await
        .unwrap()
        .id;

    let all = store
        .get_observations_by_ids(&[a, b, c], &BatchFilter::default())
        .await
        .unwrap();
    let order: Vec<i64> = all.iter().map(|o| o.id).collect();
    assert_eq!(order, vec![c, b, a]);

    let oldest_first = store
        .get_observations_by_ids(
            &[a, b, c],
            &BatchFilter {
                order_by: OrderBy::DateAsc,
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let order: Vec<i64> = oldest_first.iter().map(|o| o.id).collect();
    assert_eq!(order, vec![a, b]);

    let cache_reads = store
        .get_observations_by_ids(
            &[a, b, c],
            &BatchFilter {
                files: vec!["cache.rs".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cache_reads.len(), 1);
    assert_eq!(cache_reads[0].id, b);

    let alpha_bugfixes = store
        .get_observations_by_ids(
            &[a, b, c],
            &BatchFilter {
                project: Some("alpha".into()),
                obs_types: vec![ObservationType::Bugfix],
                concepts: vec!["auth".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(alpha_bugfixes.len(), 1);
    assert_eq!(alpha_bugfixes[0].id, a);
    backend.close().await.unwrap();
}

#[tokio::test]
async fn replicated_ids_line_up_across_files() {
    let dir = TempDir::new().unwrap();
    let (primary_backend, primary) = open(&dir.path().join("primary.db"));
    let (mirror_backend, mirror) = open(&dir.path().join("mirror.db"));

    for (title, at) in [("one", 100), ("two", 200), ("three", 300)] {
        let stored = primary
            .store_observation(&observation("sess-1", "alpha", title, at))
            .await
            .unwrap();
        let row = primary.get_observation_by_id(stored.id).await.unwrap().unwrap();
        let applied = mirror
            .import_observation(&ObservationInput::from(&row))
            .await
            .unwrap();
        assert!(applied.imported);
    }

    let mirrored = mirror.get_observations_for_session("sess-1").await.unwrap();
    let original = primary.get_observations_for_session("sess-1").await.unwrap();
    assert_eq!(mirrored, original);

    // A new local write after replication does not collide
    let fresh = mirror
        .store_observation(&observation("local", "gamma", "after", 400))
        .await
        .unwrap();
    assert!(fresh.id > original[2].id);

    primary_backend.close().await.unwrap();
    mirror_backend.close().await.unwrap();
}
