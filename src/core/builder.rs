//! 审计组件构建器：按 AppConfig 统一组装弹性注册表、存储、工具、Planner、运行时与协调器
//!
//! CLI 与集成测试共用同一条构建路径；LLM 客户端与沙箱后端可替换。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::coordinator::Coordinator;
use crate::core::AgentError;
use crate::llm::{create_llm_from_config, LlmClient, ResilientLlm};
use crate::memory::{ConversationCache, InMemoryConversationCache, SqliteConversationCache};
use crate::react::{AgentRuntime, Planner, RuntimeLimits};
use crate::resilience::ResilienceRegistry;
use crate::tools::{
    CodeGrepTool, CodeReadTool, DockerBackend, HttpProbeTool, IsolationBackend, SandboxExecTool,
    SandboxExecutor, SandboxHandle, ToolExecutor, ToolRegistry, VerifyFindingTool,
};
use crate::tree::{InMemoryTreeStore, SqliteTreeStore, TreeStore};

/// 沙箱工具使用的熔断器名
pub const SANDBOX_GUARD: &str = "sandbox";

pub struct AuditBuilder {
    config: AppConfig,
    target: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
    backend: Option<Arc<dyn IsolationBackend>>,
}

impl AuditBuilder {
    /// target 为被审计的代码目录，代码工具只能访问其内部
    pub fn new(config: AppConfig, target: impl Into<PathBuf>) -> Self {
        Self {
            config,
            target: target.into(),
            llm: None,
            backend: None,
        }
    }

    /// 替换按配置创建的 LLM 客户端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 替换按配置创建的隔离后端（默认 docker CLI）
    pub fn with_sandbox_backend(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    fn build_stores(&self) -> Result<(Arc<dyn TreeStore>, Arc<dyn ConversationCache>), AgentError> {
        match &self.config.storage.sqlite_path {
            Some(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| AgentError::Storage(format!("{}: {e}", dir.display())))?;
                }
                let tree = SqliteTreeStore::open(path)?;
                let cache = SqliteConversationCache::open(path)
                    .map_err(|e| AgentError::Storage(e.to_string()))?;
                tracing::info!(path = %path.display(), "using sqlite storage");
                Ok((Arc::new(tree), Arc::new(cache)))
            }
            None => Ok((
                Arc::new(InMemoryTreeStore::new()),
                Arc::new(InMemoryConversationCache::new()),
            )),
        }
    }

    /// 代码工具 + 三个沙箱工具（共享 "sandbox" 熔断器）
    pub fn build_tool_registry(
        &self,
        sandbox: Arc<SandboxExecutor>,
        resilience: &ResilienceRegistry,
    ) -> ToolRegistry {
        let root = self
            .config
            .tools
            .workspace_root
            .clone()
            .unwrap_or_else(|| self.target.clone());
        let mut tools = ToolRegistry::new();
        tools.register(CodeReadTool::new(&root).with_max_bytes(self.config.tools.max_read_bytes));
        tools.register(CodeGrepTool::new(&root).with_max_results(self.config.tools.max_grep_matches));

        let handle = SandboxHandle::new(sandbox).with_guard(resilience.guard(SANDBOX_GUARD));
        tools.register(SandboxExecTool::new(handle.clone()));
        tools.register(HttpProbeTool::new(handle.clone()));
        tools.register(VerifyFindingTool::new(handle));
        tools
    }

    pub async fn build(self) -> Result<AuditComponents, AgentError> {
        self.config.validate()?;
        let resilience = Arc::new(ResilienceRegistry::from_config(&self.config.resilience));

        let llm = match &self.llm {
            Some(llm) => llm.clone(),
            None => create_llm_from_config(&self.config.llm)
                .map_err(|e| AgentError::Config(e.to_string()))?,
        };
        let backend: Arc<dyn IsolationBackend> = match &self.backend {
            Some(backend) => backend.clone(),
            None => Arc::new(DockerBackend::new(self.config.sandbox.runtime.clone())),
        };
        let sandbox = Arc::new(
            SandboxExecutor::start(backend, &self.config.sandbox)
                .await
                .with_timeout_ceiling(self.config.sandbox_timeout_ceiling()),
        );

        let (store, cache) = self.build_stores()?;
        let tools = self.build_tool_registry(sandbox.clone(), &resilience);
        let executor = Arc::new(ToolExecutor::new(tools, self.config.tool_timeout()));
        let planner = Planner::new(ResilientLlm::new(llm, &resilience), &self.config.llm);
        let runtime = Arc::new(AgentRuntime::new(
            planner,
            executor,
            store.clone(),
            cache,
            RuntimeLimits::from_config(&self.config),
        ));
        let coordinator = Coordinator::new(runtime.clone(), &self.config.coordinator);
        tracing::info!(
            provider = %self.config.llm.provider,
            model = %self.config.llm.model,
            sandbox = sandbox.is_available(),
            "audit components ready"
        );

        Ok(AuditComponents {
            config: self.config,
            resilience,
            store,
            sandbox,
            runtime,
            coordinator,
        })
    }
}

/// 预构建的审计组件，可在多个任务间共享
pub struct AuditComponents {
    pub config: AppConfig,
    pub resilience: Arc<ResilienceRegistry>,
    pub store: Arc<dyn TreeStore>,
    pub sandbox: Arc<SandboxExecutor>,
    pub runtime: Arc<AgentRuntime>,
    pub coordinator: Coordinator,
}
