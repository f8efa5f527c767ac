//! In-process doubles for collaborators without a local implementation.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use futures::stream;
use shared::models::ChatChunk;

use super::{
    backend::{BackendError, ChunkStream, GenerationBackend, GenerationCall},
    tenants::TenantDirectory,
};

enum Script {
    Chunks(Vec<Result<ChatChunk, BackendError>>),
    OpenFailure,
}

/// Backend that replays queued scripts, one per call, and records each call.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<GenerationCall>>,
}

impl ScriptedBackend {
    pub fn push_script(&self, items: Vec<Result<ChatChunk, BackendError>>) {
        self.scripts.lock().unwrap().push_back(Script::Chunks(items));
    }

    pub fn push_fragments(&self, fragments: &[&str]) {
        self.push_script(
            fragments
                .iter()
                .map(|fragment| Ok(ChatChunk::fragment(*fragment)))
                .collect(),
        );
    }

    pub fn push_open_failure(&self) {
        self.scripts.lock().unwrap().push_back(Script::OpenFailure);
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn open_stream(&self, call: GenerationCall) -> Result<ChunkStream, BackendError> {
        self.calls.lock().unwrap().push(call);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Chunks(items)) => Ok(Box::pin(stream::iter(items))),
            Some(Script::OpenFailure) => Err(BackendError::Status(503)),
            None => Err(BackendError::Transport("no script queued".into())),
        }
    }
}

/// Tenant directory with fixed answers.
#[derive(Default)]
pub struct StaticTenants {
    limits: BTreeMap<String, i64>,
    groups: BTreeMap<String, Vec<String>>,
    default_limit: i64,
    fail_groups: bool,
}

impl StaticTenants {
    pub fn with_limit(tenant: &str, limit: i64) -> Self {
        Self {
            limits: BTreeMap::from([(tenant.to_string(), limit)]),
            default_limit: 100,
            ..Self::default()
        }
    }

    pub fn with_default_limit(mut self, limit: i64) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_groups(mut self, user: &str, groups: &[&str]) -> Self {
        self.groups.insert(
            user.to_string(),
            groups.iter().map(|g| (*g).to_string()).collect(),
        );
        self
    }

    pub fn failing_groups(mut self) -> Self {
        self.fail_groups = true;
        self
    }
}

#[async_trait]
impl TenantDirectory for StaticTenants {
    async fn daily_limit(&self, tenant_id: &str) -> anyhow::Result<Option<i64>> {
        Ok(self.limits.get(tenant_id).copied())
    }

    async fn group_ids(&self, user_id: &str, _tenant_id: &str) -> anyhow::Result<Vec<String>> {
        if self.fail_groups {
            anyhow::bail!("directory offline");
        }
        Ok(self.groups.get(user_id).cloned().unwrap_or_default())
    }

    fn default_limit(&self) -> i64 {
        self.default_limit
    }
}
