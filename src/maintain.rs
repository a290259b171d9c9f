use crate::import::ExportBundle;
use crate::manager::DatabaseManager;
use crate::MemError;
use std::path::Path;

pub async fn handle_retry(manager: &DatabaseManager, id: i64) -> Result<(), MemError> {
    if manager.work_queue()?.retry_message(id).await? {
        eprintln!("tracemem: job {id} requeued");
        Ok(())
    } else {
        Err(MemError::NotFound(format!("retryable job {id}")))
    }
}

pub async fn handle_abort(manager: &DatabaseManager, id: i64) -> Result<(), MemError> {
    if manager.work_queue()?.abort_message(id).await? {
        eprintln!("tracemem: job {id} deleted");
        Ok(())
    } else {
        Err(MemError::NotFound(format!("job {id}")))
    }
}

pub async fn handle_recover(
    manager: &DatabaseManager,
    threshold_secs: Option<u64>,
) -> Result<(), MemError> {
    let secs = threshold_secs.unwrap_or(manager.config().queue.stuck_threshold_secs);
    let threshold_ms = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let ids = manager.work_queue()?.retry_all_stuck(threshold_ms).await?;
    if ids.is_empty() {
        eprintln!("tracemem: no stuck jobs");
    } else {
        let list: Vec<String> = ids.iter().map(i64::to_string).collect();
        eprintln!("tracemem: requeued {} job(s): {}", ids.len(), list.join(", "));
    }
    Ok(())
}

pub async fn handle_cleanup(manager: &DatabaseManager, keep: Option<i64>) -> Result<(), MemError> {
    let keep = keep.unwrap_or(manager.config().queue.processed_retention);
    let removed = manager.work_queue()?.cleanup_processed(keep).await?;
    eprintln!("tracemem: removed {removed} processed job(s), kept up to {keep}");
    Ok(())
}

pub async fn handle_export(
    manager: &DatabaseManager,
    project: Option<&str>,
    file: &Path,
) -> Result<(), MemError> {
    let bundle = manager.session_store()?.export_project(project).await?;
    std::fs::write(file, serde_json::to_string_pretty(&bundle)?)?;
    eprintln!(
        "tracemem: exported {} sessions, {} observations, {} summaries, {} prompts to {}",
        bundle.sessions.len(),
        bundle.observations.len(),
        bundle.summaries.len(),
        bundle.prompts.len(),
        file.display()
    );
    Ok(())
}

pub async fn handle_import(manager: &DatabaseManager, file: &Path) -> Result<(), MemError> {
    let content = std::fs::read_to_string(file)?;
    let bundle: ExportBundle = serde_json::from_str(&content)?;
    let report = manager.session_store()?.import_bundle(&bundle).await?;
    for (what, c) in [
        ("sessions", report.sessions),
        ("summaries", report.summaries),
        ("observations", report.observations),
        ("prompts", report.prompts),
    ] {
        eprintln!("tracemem: {what} — {} imported, {} skipped", c.imported, c.skipped);
    }
    Ok(())
}
