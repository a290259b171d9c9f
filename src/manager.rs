//! Composition root: picks the backend once, owns it, and hands out the
//! session store and work queue bound to it.

use crate::backend::{BackendKind, StorageBackend};
use crate::config::{resolve_db_path, MemConfig};
use crate::embedded::EmbeddedBackend;
use crate::import::PromptInput;
use crate::model::Session;
use crate::networked::NetworkedBackend;
use crate::processor::{Enricher, QueueProcessor};
use crate::queue::WorkQueue;
use crate::replicate::ReplicationFanout;
use crate::store::{NewSession, SessionStore};
use crate::MemError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A subsystem layered on top of storage (search-index sync and the like).
/// Auxiliaries are closed before anything they might depend on.
#[async_trait]
pub trait Auxiliary: Send + Sync {
    fn name(&self) -> &str;

    async fn close(&self) -> Result<(), MemError>;
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), MemError>>,
}

pub struct DatabaseManager {
    config: MemConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    store: Option<Arc<SessionStore>>,
    queue: Option<Arc<WorkQueue>>,
    fanout: Arc<ReplicationFanout>,
    auxiliaries: Vec<Box<dyn Auxiliary>>,
    processor: Option<Running>,
}

impl DatabaseManager {
    pub fn new(config: MemConfig) -> Self {
        let fanout = Arc::new(ReplicationFanout::new(&config.replication));
        Self {
            config,
            backend: None,
            store: None,
            queue: None,
            fanout,
            auxiliaries: Vec::new(),
            processor: None,
        }
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// Open the configured backend. Calling again once initialized does nothing.
    pub async fn initialize(&mut self) -> Result<(), MemError> {
        if self.is_initialized() {
            return Ok(());
        }
        let storage = &self.config.storage;
        let backend: Arc<dyn StorageBackend> = match storage.backend {
            BackendKind::Embedded => Arc::new(EmbeddedBackend::open(&resolve_db_path(&self.config)?)?),
            BackendKind::Networked => {
                let url = storage
                    .database_url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        MemError::Config("networked backend selected but no database_url configured".into())
                    })?;
                Arc::new(NetworkedBackend::connect(url, storage.max_connections).await?)
            }
        };
        self.initialize_with(backend);
        Ok(())
    }

    /// Adopt an already-open backend instead of opening one from config.
    pub fn initialize_with(&mut self, backend: Arc<dyn StorageBackend>) {
        if self.is_initialized() {
            return;
        }
        log::info!("storage ready ({} backend)", backend.kind().as_str());
        self.store = Some(Arc::new(SessionStore::new(backend.clone())));
        self.queue = Some(Arc::new(WorkQueue::new(
            backend.clone(),
            self.config.queue.max_retries,
        )));
        self.backend = Some(backend);
    }

    pub fn backend(&self) -> Result<Arc<dyn StorageBackend>, MemError> {
        self.backend
            .clone()
            .ok_or(MemError::NotInitialized("storage backend"))
    }

    pub fn session_store(&self) -> Result<Arc<SessionStore>, MemError> {
        self.store
            .clone()
            .ok_or(MemError::NotInitialized("session store"))
    }

    pub fn work_queue(&self) -> Result<Arc<WorkQueue>, MemError> {
        self.queue
            .clone()
            .ok_or(MemError::NotInitialized("work queue"))
    }

    pub fn fanout(&self) -> Arc<ReplicationFanout> {
        self.fanout.clone()
    }

    /// Create (or reactivate) a session and mirror it to the secondaries.
    pub async fn init_session(&self, new: &NewSession) -> Result<Session, MemError> {
        let store = self.session_store()?;
        let id = store.create_sdk_session(new).await?;
        let session = store
            .get_session_by_id(id)
            .await?
            .ok_or_else(|| MemError::NotFound(format!("session {id}")))?;
        self.fanout.replicate_session_init(&session);
        Ok(session)
    }

    /// Record the next user prompt of a session and mirror it. Returns the
    /// prompt as replicated, numbered from the session's counter.
    pub async fn record_user_prompt(
        &self,
        session_id: &str,
        prompt_text: &str,
    ) -> Result<PromptInput, MemError> {
        let store = self.session_store()?;
        let prompt_number = store.increment_prompt_counter(session_id).await?;
        let stored = store
            .save_user_prompt(session_id, prompt_number, prompt_text)
            .await?;
        let prompt = PromptInput {
            id: Some(stored.id),
            session_id: session_id.to_string(),
            prompt_number,
            prompt_text: prompt_text.to_string(),
            created_at_epoch: Some(stored.created_at_epoch),
        };
        self.fanout.replicate_user_prompt(&prompt);
        Ok(prompt)
    }

    pub fn register_auxiliary(&mut self, aux: Box<dyn Auxiliary>) {
        log::debug!("registered auxiliary {}", aux.name());
        self.auxiliaries.push(aux);
    }

    /// Start the queue processor as a background task.
    pub fn start_processor(&mut self, enricher: Arc<dyn Enricher>) -> Result<(), MemError> {
        if self.processor.is_some() {
            return Ok(());
        }
        let processor = QueueProcessor::new(
            self.session_store()?,
            self.work_queue()?,
            self.fanout.clone(),
            enricher,
            self.config.queue.clone(),
        );
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { processor.run(rx).await });
        self.processor = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Close everything in reverse dependency order: auxiliaries, background
    /// work, store and queue, then the backend. A failing step is logged and
    /// the rest still run.
    pub async fn shutdown(&mut self) {
        for aux in self.auxiliaries.drain(..).rev() {
            if let Err(e) = aux.close().await {
                log::error!("shutdown: auxiliary {}: {e}", aux.name());
            }
        }

        if let Some(running) = self.processor.take() {
            let _ = running.shutdown.send(true);
            let mut handle = running.handle;
            match tokio::time::timeout(Duration::from_secs(10), &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => log::error!("shutdown: queue processor: {e}"),
                Ok(Err(e)) => log::error!("shutdown: queue processor task: {e}"),
                Err(_) => {
                    log::error!("shutdown: queue processor did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.fanout.shutdown().await;

        self.queue = None;
        self.store = None;
        if let Some(backend) = self.backend.take()
            && let Err(e) = backend.close().await
        {
            log::error!("shutdown: {} backend: {e}", backend.kind().as_str());
        }
        log::info!("storage closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Auxiliary for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn close(&self) -> Result<(), MemError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(MemError::Config("index flush failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn embedded_config(dir: &tempfile::TempDir) -> MemConfig {
        MemConfig {
            storage: StorageConfig {
                path: Some(dir.path().join("mem.db")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn accessors_fail_before_initialize() {
        let m = DatabaseManager::new(MemConfig::default());
        assert!(matches!(m.session_store(), Err(MemError::NotInitialized(_))));
        assert!(matches!(m.work_queue(), Err(MemError::NotInitialized(_))));
        assert!(matches!(m.backend(), Err(MemError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn networked_without_url_never_falls_back() {
        let mut config = MemConfig::default();
        config.storage.backend = BackendKind::Networked;
        let mut m = DatabaseManager::new(config);
        let err = m.initialize().await.unwrap_err();
        assert!(matches!(err, MemError::Config(_)));
        assert!(!m.is_initialized());
    }

    #[tokio::test]
    async fn initialize_is_idempotent_and_shares_one_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut m = DatabaseManager::new(embedded_config(&dir));
        m.initialize().await.unwrap();
        let first = m.backend().unwrap();
        m.initialize().await.unwrap();
        assert!(Arc::ptr_eq(&first, &m.backend().unwrap()));
        assert_eq!(m.work_queue().unwrap().max_retries(), 3);
        m.shutdown().await;
        assert!(!m.is_initialized());
    }

    #[tokio::test]
    async fn shutdown_closes_auxiliaries_first_and_survives_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut m = DatabaseManager::new(embedded_config(&dir));
        m.initialize().await.unwrap();
        m.register_auxiliary(Box::new(Recorder {
            name: "search-sync",
            fail: true,
            log: log.clone(),
        }));
        m.register_auxiliary(Box::new(Recorder {
            name: "vector-sync",
            fail: false,
            log: log.clone(),
        }));
        let backend = m.backend().unwrap();
        m.shutdown().await;

        assert_eq!(*log.lock().unwrap(), vec!["vector-sync", "search-sync"]);
        // The backend was closed despite the failing auxiliary
        assert!(backend.query("SELECT 1", &[]).await.is_err());
        assert!(matches!(m.session_store(), Err(MemError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn injected_backend_is_used() {
        let mut m = DatabaseManager::new(MemConfig::default());
        m.initialize_with(Arc::new(EmbeddedBackend::open_in_memory().unwrap()));
        assert_eq!(m.backend().unwrap().kind(), BackendKind::Embedded);
        m.session_store().unwrap();
        m.shutdown().await;
    }
}
