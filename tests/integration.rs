use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracemem::backend::StorageBackend;
use tracemem::embedded::EmbeddedBackend;
use tracemem::model::{JobPayload, NewJob, ObservationInput};
use tracemem::queue::WorkQueue;
use tracemem::store::{NewSession, SessionStore};

#[allow(deprecated)]
fn tracemem_cmd(dir: &TempDir, db_path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tracemem").unwrap();
    cmd.env("TRACEMEM_DB", db_path);
    cmd.env("TRACEMEM_CONFIG", dir.path().join("absent.toml"));
    cmd.env_remove("TRACEMEM_DATABASE_URL");
    cmd
}

fn stderr_of(cmd: &mut Command) -> String {
    let out = cmd.assert().success().get_output().clone();
    String::from_utf8(out.stderr).unwrap()
}

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

/// One session in project "alpha" with two observations, a prompt, and
/// three jobs: one pending, one processing, one already failed.
fn seed(db_path: &Path) -> Vec<i64> {
    block_on(async {
        let backend = Arc::new(EmbeddedBackend::open(db_path).unwrap());
        let store = SessionStore::new(backend.clone());
        let queue = WorkQueue::new(backend.clone(), 1);

        let sid = store
            .create_sdk_session(&NewSession {
                session_id: "sess-1".into(),
                project: "alpha".into(),
                user_prompt: Some("Fix the login bug".into()),
                user_id: None,
            })
            .await
            .unwrap();
        store.save_user_prompt("sess-1", 1, "Fix the login bug").await.unwrap();
        for title in ["read auth.rs", "edited auth.rs"] {
            store
                .store_observation(&ObservationInput {
                    session_id: "sess-1".into(),
                    project: "alpha".into(),
                    title: title.into(),
                    files_read: vec!["/src/auth.rs".into()],
                    prompt_number: Some(1),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let mut ids = Vec::new();
        for tool in ["Read", "Edit", "Bash"] {
            let id = queue
                .enqueue(&NewJob {
                    session_db_id: sid,
                    content_session_id: "sess-1".into(),
                    payload: JobPayload::Observation {
                        tool_name: Some(tool.into()),
                        tool_input: Some("{}".into()),
                        tool_response: None,
                        cwd: Some("/src".into()),
                        prompt_number: Some(1),
                    },
                })
                .await
                .unwrap();
            ids.push(id);
        }
        assert!(queue.mark_processing(ids[1]).await.unwrap());
        assert!(queue.mark_processing(ids[2]).await.unwrap());
        queue.mark_failed(ids[2]).await.unwrap();

        backend.close().await.unwrap();
        ids
    })
}

#[test]
fn status_on_fresh_database() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");

    let err = stderr_of(tracemem_cmd(&dir, &db).arg("status"));
    assert!(err.contains("tracemem: backend — embedded"), "{err}");
    assert!(err.contains("tracemem: sessions — 0 (0 projects)"), "{err}");
    assert!(err.contains("queue — 0 pending, 0 processing, 0 failed, 0 processed"), "{err}");
    assert!(db.exists());
}

#[test]
fn status_reports_seeded_counts() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    seed(&db);

    let err = stderr_of(tracemem_cmd(&dir, &db).arg("status"));
    assert!(err.contains("sessions — 1 (1 projects)"), "{err}");
    assert!(err.contains("observations — 2"), "{err}");
    assert!(err.contains("prompts — 1"), "{err}");
    assert!(err.contains("queue — 1 pending, 1 processing, 1 failed, 0 processed"), "{err}");
}

#[test]
fn queue_json_lists_failed_first() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    let ids = seed(&db);

    let out = tracemem_cmd(&dir, &db)
        .args(["queue", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let jobs: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[0]["id"], ids[2]);
    assert_eq!(jobs[0]["status"], "failed");
    assert_eq!(jobs[1]["status"], "processing");
    assert_eq!(jobs[2]["status"], "pending");
}

#[test]
fn retry_and_abort() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    let ids = seed(&db);

    let err = stderr_of(tracemem_cmd(&dir, &db).args(["retry", &ids[2].to_string()]));
    assert!(err.contains(&format!("job {} requeued", ids[2])), "{err}");

    let err = stderr_of(tracemem_cmd(&dir, &db).args(["abort", &ids[0].to_string()]));
    assert!(err.contains(&format!("job {} deleted", ids[0])), "{err}");

    tracemem_cmd(&dir, &db)
        .args(["retry", "9999"])
        .assert()
        .failure();
    tracemem_cmd(&dir, &db)
        .args(["abort", &ids[0].to_string()])
        .assert()
        .failure();

    let err = stderr_of(tracemem_cmd(&dir, &db).arg("status"));
    assert!(err.contains("queue — 1 pending, 1 processing, 0 failed, 0 processed"), "{err}");
}

#[test]
fn recover_requeues_claimed_jobs() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    let ids = seed(&db);

    // Claimed moments ago, so the default threshold leaves it alone
    let err = stderr_of(tracemem_cmd(&dir, &db).arg("recover"));
    assert!(err.contains("no stuck jobs"), "{err}");

    let err = stderr_of(tracemem_cmd(&dir, &db).args(["recover", "--threshold-secs", "0"]));
    assert!(err.contains(&format!("requeued 1 job(s): {}", ids[1])), "{err}");

    let err = stderr_of(tracemem_cmd(&dir, &db).args(["recover", "--threshold-secs", "0"]));
    assert!(err.contains("no stuck jobs"), "{err}");
}

#[test]
fn cleanup_with_nothing_processed() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    seed(&db);

    let err = stderr_of(tracemem_cmd(&dir, &db).args(["cleanup", "--keep", "0"]));
    assert!(err.contains("removed 0 processed job(s), kept up to 0"), "{err}");
}

#[test]
fn export_then_import_into_another_database() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.db");
    let target = dir.path().join("target.db");
    let bundle: PathBuf = dir.path().join("alpha.json");
    seed(&source);

    let err = stderr_of(
        tracemem_cmd(&dir, &source)
            .args(["export", "--project", "alpha"])
            .arg(&bundle),
    );
    assert!(
        err.contains("exported 1 sessions, 2 observations, 0 summaries, 1 prompts"),
        "{err}"
    );

    let err = stderr_of(tracemem_cmd(&dir, &target).arg("import").arg(&bundle));
    assert!(err.contains("sessions — 1 imported, 0 skipped"), "{err}");
    assert!(err.contains("observations — 2 imported, 0 skipped"), "{err}");
    assert!(err.contains("prompts — 1 imported, 0 skipped"), "{err}");

    // Second import is a no-op
    let err = stderr_of(tracemem_cmd(&dir, &target).arg("import").arg(&bundle));
    assert!(err.contains("sessions — 0 imported, 1 skipped"), "{err}");
    assert!(err.contains("observations — 0 imported, 2 skipped"), "{err}");

    let err = stderr_of(tracemem_cmd(&dir, &target).arg("status"));
    assert!(err.contains("observations — 2"), "{err}");
    assert!(err.contains("queue — 0 pending"), "{err}");
}

#[test]
fn export_of_unknown_project_is_empty() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    let bundle = dir.path().join("none.json");
    seed(&db);

    stderr_of(
        tracemem_cmd(&dir, &db)
            .args(["export", "--project", "nope"])
            .arg(&bundle),
    );
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&bundle).unwrap()).unwrap();
    assert_eq!(parsed["sessions"].as_array().unwrap().len(), 0);
    assert_eq!(parsed["observations"].as_array().unwrap().len(), 0);
}

#[test]
fn networked_backend_without_url_fails() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "[storage]\nbackend = \"networked\"\n").unwrap();

    let out = tracemem_cmd(&dir, &db)
        .env("TRACEMEM_CONFIG", &config)
        .arg("status")
        .assert()
        .failure()
        .get_output()
        .clone();
    let err = String::from_utf8(out.stderr).unwrap();
    assert!(err.contains("database_url"), "{err}");
    assert!(!db.exists());
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("mem.db");
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "[queue]\nmax_retries = 0\n").unwrap();

    tracemem_cmd(&dir, &db)
        .env("TRACEMEM_CONFIG", &config)
        .arg("status")
        .assert()
        .failure();
}
