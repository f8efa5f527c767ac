use std::{sync::Arc, time::Duration};

use shared::config::server::Config;

use crate::services::{
    AdmissionController, ChatBridge, HistoryCache, TaskPool,
    admission::build_admission,
    backend::GenerationBackend,
    counter_store::{CounterStore, InMemoryCounterStore},
    fast_tier::{FastTier, InMemoryFastTier},
    history_cache::HistorySettings,
    repository::{ChatRepository, InMemoryChatRepository},
    stream_bridge::BridgeSettings,
    tenants::{ConfigTenantDirectory, TenantDirectory},
};

/// External stores and clients the pipeline is assembled from.
pub struct Collaborators {
    pub repository: Arc<dyn ChatRepository>,
    pub fast_tier: Arc<dyn FastTier>,
    /// `None` installs the no-op admission controller.
    pub counter_store: Option<Arc<dyn CounterStore>>,
    pub backend: Arc<dyn GenerationBackend>,
    pub tenants: Arc<dyn TenantDirectory>,
}

impl Collaborators {
    /// Process-local stores around the given backend.
    pub fn in_memory(config: &Config, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            repository: Arc::new(InMemoryChatRepository::new()),
            fast_tier: Arc::new(InMemoryFastTier::new()),
            counter_store: Some(Arc::new(InMemoryCounterStore::new())),
            backend,
            tenants: Arc::new(ConfigTenantDirectory::new(config.quota.clone())),
        }
    }
}

/// Application state shared across all routes.
pub struct AppState {
    pub(crate) bridge: ChatBridge,
    pub(crate) history: HistoryCache,
    pub(crate) admission: Arc<dyn AdmissionController>,
    pub(crate) repository: Arc<dyn ChatRepository>,
    pub(crate) tasks: Arc<TaskPool>,
    pub(crate) keep_alive: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("bridge", &self.bridge)
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wires the pipeline once at startup.
    pub fn assemble(config: &Config, collaborators: Collaborators) -> Self {
        let tasks = Arc::new(TaskPool::new());
        let admission = build_admission(
            config.quota.enabled,
            collaborators.counter_store,
            config.quota.failure_policy,
        );
        let history = HistoryCache::new(
            collaborators.fast_tier,
            collaborators.repository.clone(),
            tasks.clone(),
            HistorySettings {
                window: config.history.window,
                ttl: config.history_ttl(),
                repopulate_timeout: config.repopulate_timeout(),
            },
        );
        let bridge = ChatBridge::new(
            admission.clone(),
            history.clone(),
            collaborators.repository.clone(),
            collaborators.backend,
            collaborators.tenants,
            tasks.clone(),
            BridgeSettings {
                request_timeout: config.request_timeout(),
                persist_timeout: config.persist_timeout(),
            },
        );

        Self {
            bridge,
            history,
            admission,
            repository: collaborators.repository,
            tasks,
            keep_alive: Duration::from_secs(config.server.sse_keep_alive_seconds),
        }
    }

    /// Background task pool, drained on shutdown.
    pub fn tasks(&self) -> &Arc<TaskPool> {
        &self.tasks
    }
}
