use crate::manager::DatabaseManager;
use crate::model::JobStatus;
use crate::{iso_from_epoch_ms, MemError};

pub async fn handle_status(manager: &DatabaseManager) -> Result<(), MemError> {
    let store = manager.session_store()?;
    let queue = manager.work_queue()?;
    let counts = store.entity_counts().await?;
    let stats = queue.queue_stats().await?;
    let projects = store.get_all_projects().await?;

    eprintln!("tracemem: backend — {}", manager.backend()?.kind().as_str());
    eprintln!("tracemem: sessions — {} ({} projects)", counts.sessions, projects.len());
    eprintln!("tracemem: observations — {}", counts.observations);
    eprintln!("tracemem: summaries — {}", counts.summaries);
    eprintln!("tracemem: prompts — {}", counts.prompts);
    eprintln!(
        "tracemem: queue — {} pending, {} processing, {} failed, {} processed",
        stats.pending, stats.processing, stats.failed, stats.processed
    );

    let fanout = manager.fanout();
    if fanout.is_enabled() {
        let ports: Vec<String> = fanout.secondaries().iter().map(u16::to_string).collect();
        eprintln!("tracemem: replicas — {}", ports.join(", "));
    }
    Ok(())
}

pub async fn handle_queue(manager: &DatabaseManager, json: bool) -> Result<(), MemError> {
    let messages = manager.work_queue()?.get_queue_messages().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        eprintln!("tracemem: queue empty");
        return Ok(());
    }
    for m in &messages {
        let since = match m.status {
            JobStatus::Processing => m.started_processing_at_epoch,
            JobStatus::Failed => m.completed_at_epoch,
            _ => Some(m.created_at_epoch),
        };
        println!(
            "{:>6}  {:<10}  {:<11}  retries={}  session={}  since={}",
            m.id,
            m.status.as_str(),
            m.payload.message_type(),
            m.retry_count,
            m.content_session_id,
            since.map(iso_from_epoch_ms).unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}
