//! Best-effort mirroring of committed writes to secondary instances.
//!
//! A replication call never fails its caller. Each secondary is tried once
//! under a hard deadline; failures are logged with the target port and the
//! entity id, and left for out-of-band reconciliation.

use crate::import::PromptInput;
use crate::metrics::record_replication;
use crate::model::{ImportResult, ObservationInput, Session, SummaryInput};
use crate::store::SessionStore;
use crate::MemError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReplicationConfig {
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,
    /// Every configured instance port, the primary's included.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            primary_port: default_primary_port(),
            ports: Vec::new(),
            host: default_host(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_primary_port() -> u16 {
    37777
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_timeout_secs() -> u64 {
    5
}

/// A fully resolved write, carrying the primary's ids and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum ReplicationPayload {
    Session(Session),
    Observation(ObservationInput),
    Summary(SummaryInput),
    Prompt(PromptInput),
}

impl ReplicationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationPayload::Session(_) => "session",
            ReplicationPayload::Observation(_) => "observation",
            ReplicationPayload::Summary(_) => "summary",
            ReplicationPayload::Prompt(_) => "prompt",
        }
    }

    /// Identifier used in logs: the external session id, or the row id.
    pub fn entity_id(&self) -> String {
        match self {
            ReplicationPayload::Session(s) => s.session_id.clone(),
            ReplicationPayload::Observation(o) => id_or_key(o.id, &o.session_id),
            ReplicationPayload::Summary(s) => id_or_key(s.id, &s.session_id),
            ReplicationPayload::Prompt(p) => id_or_key(p.id, &p.session_id),
        }
    }

    pub fn path(&self) -> String {
        format!("/api/replicate/{}", self.kind())
    }

    /// Request body: the bare entity, without the enum tag.
    pub fn body(&self) -> Result<String, MemError> {
        Ok(match self {
            ReplicationPayload::Session(s) => serde_json::to_string(s)?,
            ReplicationPayload::Observation(o) => serde_json::to_string(o)?,
            ReplicationPayload::Summary(s) => serde_json::to_string(s)?,
            ReplicationPayload::Prompt(p) => serde_json::to_string(p)?,
        })
    }

    /// Rebuild a payload on the receiving side from the endpoint kind and body.
    pub fn from_wire(kind: &str, body: &str) -> Result<Self, MemError> {
        Ok(match kind {
            "session" => ReplicationPayload::Session(serde_json::from_str(body)?),
            "observation" => ReplicationPayload::Observation(serde_json::from_str(body)?),
            "summary" => ReplicationPayload::Summary(serde_json::from_str(body)?),
            "prompt" => ReplicationPayload::Prompt(serde_json::from_str(body)?),
            other => {
                return Err(MemError::Replication(format!("unknown entity kind {other:?}")));
            }
        })
    }
}

fn id_or_key(id: Option<i64>, session_id: &str) -> String {
    match id {
        Some(id) => id.to_string(),
        None => format!("session {session_id}"),
    }
}

/// Result of one secondary's attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOutcome {
    pub port: u16,
    pub error: Option<String>,
}

impl ReplicaOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub(crate) fn failure_message(kind: &str, entity_id: &str, port: u16, err: &str) -> String {
    format!("replication of {kind} {entity_id} to port {port} failed: {err}")
}

struct Targets {
    host: String,
    primary_port: u16,
    secondaries: Vec<u16>,
    timeout: Duration,
}

impl Targets {
    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{port}{path}", self.host)
    }

    async fn send(&self, port: u16, path: &str, body: Option<String>) -> Result<String, String> {
        let url = self.url(port, path);
        let timeout = self.timeout;
        let call = tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_config(
                ureq::config::Config::builder()
                    .timeout_global(Some(timeout))
                    .build(),
            );
            let response = match body {
                Some(body) => agent
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .send(body.as_bytes()),
                None => agent.get(&url).call(),
            };
            response
                .map_err(|e| e.to_string())?
                .body_mut()
                .read_to_string()
                .map_err(|e| e.to_string())
        });
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(format!("request task: {join}")),
            Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        }
    }

    async fn fan_out(&self, payload: &ReplicationPayload) -> Vec<ReplicaOutcome> {
        let (kind, entity_id, path) = (payload.kind(), payload.entity_id(), payload.path());
        let body = match payload.body() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("replication of {kind} {entity_id} not sent: {e}");
                return Vec::new();
            }
        };
        let calls = self.secondaries.iter().map(|&port| {
            let (path, body) = (path.clone(), body.clone());
            async move {
                let error = self.send(port, &path, Some(body)).await.err();
                ReplicaOutcome { port, error }
            }
        });
        let outcomes = futures::future::join_all(calls).await;
        for o in &outcomes {
            match &o.error {
                None => {
                    record_replication(kind, "ok");
                    log::debug!("replicated {kind} {entity_id} to port {}", o.port);
                }
                Some(err) => {
                    record_replication(kind, "failed");
                    log::warn!("{}", failure_message(kind, &entity_id, o.port, err));
                }
            }
        }
        outcomes
    }
}

pub struct ReplicationFanout {
    targets: Arc<Targets>,
    tasks: Mutex<JoinSet<()>>,
}

impl ReplicationFanout {
    pub fn new(config: &ReplicationConfig) -> Self {
        let mut secondaries: Vec<u16> = config
            .ports
            .iter()
            .copied()
            .filter(|&p| p != config.primary_port)
            .collect();
        secondaries.sort_unstable();
        secondaries.dedup();
        Self {
            targets: Arc::new(Targets {
                host: config.host.clone(),
                primary_port: config.primary_port,
                secondaries,
                timeout: Duration::from_secs(config.timeout_secs.max(1)),
            }),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn secondaries(&self) -> &[u16] {
        &self.targets.secondaries
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.secondaries.is_empty()
    }

    /// Send to every secondary and wait for all of them.
    pub async fn fan_out(&self, payload: &ReplicationPayload) -> Vec<ReplicaOutcome> {
        self.targets.fan_out(payload).await
    }

    pub fn replicate_session_init(&self, session: &Session) {
        self.spawn(ReplicationPayload::Session(session.clone()));
    }

    pub fn replicate_observation(&self, observation: &ObservationInput) {
        self.spawn(ReplicationPayload::Observation(observation.clone()));
    }

    pub fn replicate_summary(&self, summary: &SummaryInput) {
        self.spawn(ReplicationPayload::Summary(summary.clone()));
    }

    pub fn replicate_user_prompt(&self, prompt: &PromptInput) {
        self.spawn(ReplicationPayload::Prompt(prompt.clone()));
    }

    /// Fire and forget. Must be called from within a tokio runtime.
    fn spawn(&self, payload: ReplicationPayload) {
        if !self.is_enabled() {
            return;
        }
        let targets = self.targets.clone();
        match self.tasks.lock() {
            Ok(mut tasks) => {
                while tasks.try_join_next().is_some() {}
                tasks.spawn(async move {
                    targets.fan_out(&payload).await;
                });
            }
            Err(_) => log::error!(
                "replication task set poisoned, dropping {} {}",
                payload.kind(),
                payload.entity_id()
            ),
        }
    }

    /// Wait for in-flight replication tasks to finish.
    pub async fn flush(&self) {
        let mut pending = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        while pending.join_next().await.is_some() {}
    }

    /// Read fan-out where the primary is authoritative: its failure is
    /// returned, a secondary's failure is logged and its answer left out.
    pub async fn query_all(&self, path: &str) -> Result<Vec<(u16, serde_json::Value)>, MemError> {
        let t = &self.targets;
        let primary = t
            .send(t.primary_port, path, None)
            .await
            .map_err(|e| MemError::Replication(format!("primary {}: {e}", t.primary_port)))?;
        let mut answers = vec![(t.primary_port, serde_json::from_str(&primary)?)];

        let calls = t
            .secondaries
            .iter()
            .map(|&port| async move { (port, t.send(port, path, None).await) });
        for (port, result) in futures::future::join_all(calls).await {
            match result.map(|body| serde_json::from_str::<serde_json::Value>(&body)) {
                Ok(Ok(value)) => answers.push((port, value)),
                Ok(Err(e)) => log::warn!("query {path} on port {port}: bad response: {e}"),
                Err(e) => log::warn!("query {path} on port {port} failed: {e}"),
            }
        }
        Ok(answers)
    }

    /// Abort replication still in flight.
    pub async fn shutdown(&self) {
        let mut pending = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        pending.abort_all();
        while pending.join_next().await.is_some() {}
        log::debug!("replication tasks stopped");
    }
}

/// Receiver side: apply a replicated write as an idempotent import.
pub async fn apply_replicated(
    store: &SessionStore,
    payload: &ReplicationPayload,
) -> Result<ImportResult, MemError> {
    match payload {
        ReplicationPayload::Session(s) => store.import_sdk_session(s).await,
        ReplicationPayload::Observation(o) => store.import_observation(o).await,
        ReplicationPayload::Summary(s) => store.import_session_summary(s).await,
        ReplicationPayload::Prompt(p) => store.import_user_prompt(p).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedBackend;

    fn config(ports: &[u16]) -> ReplicationConfig {
        ReplicationConfig {
            ports: ports.to_vec(),
            timeout_secs: 1,
            ..Default::default()
        }
    }

    fn observation() -> ObservationInput {
        ObservationInput {
            id: Some(12),
            session_id: "S".into(),
            project: "p".into(),
            title: "mirrored".into(),
            created_at_epoch: Some(1_000),
            ..Default::default()
        }
    }

    #[test]
    fn secondaries_exclude_primary() {
        let f = ReplicationFanout::new(&config(&[37777, 38888, 38888, 39999]));
        assert_eq!(f.secondaries(), &[38888, 39999]);
        assert!(!ReplicationFanout::new(&config(&[37777])).is_enabled());
    }

    #[test]
    fn payload_paths_and_ids() {
        let p = ReplicationPayload::Observation(observation());
        assert_eq!(p.path(), "/api/replicate/observation");
        assert_eq!(p.entity_id(), "12");
        let wire = ReplicationPayload::from_wire("observation", &p.body().unwrap()).unwrap();
        assert_eq!(wire, p);
        assert!(ReplicationPayload::from_wire("widget", "{}").is_err());
    }

    #[test]
    fn failure_message_names_port_and_entity() {
        let msg = failure_message("observation", "12", 38888, "connection refused");
        assert!(msg.contains("38888"));
        assert!(msg.contains("observation 12"));
    }

    #[tokio::test]
    async fn no_secondaries_is_a_no_op() {
        let f = ReplicationFanout::new(&config(&[37777]));
        assert!(f.fan_out(&ReplicationPayload::Observation(observation())).await.is_empty());
        f.replicate_observation(&observation());
        f.flush().await;
    }

    #[tokio::test]
    async fn unreachable_secondary_is_reported_not_raised() {
        let f = ReplicationFanout::new(&config(&[37777, 38888]));
        let outcomes = f.fan_out(&ReplicationPayload::Observation(observation())).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].port, 38888);
        assert!(!outcomes[0].is_ok());

        // Detached path returns immediately and never surfaces the failure
        f.replicate_observation(&observation());
        f.shutdown().await;
    }

    #[tokio::test]
    async fn applying_a_replayed_write_is_harmless() {
        let store = SessionStore::new(Arc::new(EmbeddedBackend::open_in_memory().unwrap()));
        let payload = ReplicationPayload::Observation(observation());
        let first = apply_replicated(&store, &payload).await.unwrap();
        let again = apply_replicated(&store, &payload).await.unwrap();
        assert!(first.imported);
        assert!(!again.imported);
        assert_eq!(first.id, 12);
        assert_eq!(again.id, 12);
    }
}
