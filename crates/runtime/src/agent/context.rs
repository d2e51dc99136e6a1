//! Agent Context - Agent 与其子 Agent 共享的工作区上下文

use octo_cognition::{Embedder, VectorIndex};
use octo_core::{CredentialSource, GenerationCapability, OctoConfig, STATE_DIR};
use octo_persistence::SessionPersistence;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::workspace::ShadowStore;

/// 共享上下文：子 Agent 复用同一份 Shadow Store、向量索引、生成能力、凭证与持久化
#[derive(Clone)]
pub struct AgentContext {
    pub workspace_root: PathBuf,
    pub config: Arc<OctoConfig>,
    pub shadow: Arc<ShadowStore>,
    pub vector_index: Arc<RwLock<VectorIndex>>,
    pub generation: Arc<dyn GenerationCapability>,
    pub credentials: Arc<dyn CredentialSource>,
    pub persistence: Arc<SessionPersistence>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("workspace_root", &self.workspace_root)
            .field("config", &self.config)
            .finish()
    }
}

impl AgentContext {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        config: OctoConfig,
        generation: Arc<dyn GenerationCapability>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            shadow: Arc::new(ShadowStore::new(&workspace_root)),
            vector_index: Arc::new(RwLock::new(VectorIndex::default())),
            persistence: Arc::new(SessionPersistence::new(&workspace_root)),
            config: Arc::new(config),
            generation,
            credentials,
            workspace_root,
        }
    }

    /// 替换默认嵌入器 (清空现有索引)
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.vector_index = Arc::new(RwLock::new(VectorIndex::new(embedder)));
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// `<workspace>/.octotask`
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_root.join(STATE_DIR)
    }
}
