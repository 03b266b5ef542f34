//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。
//! 加载后调用 [`AppConfig::validate`] 校验超时分层：
//! `llm 执行超时 < 工具超时 < Agent 墙钟 < 任务预算`，且 `沙箱默认超时 < "sandbox" 熔断器执行超时`。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentError, SANDBOX_GUARD};

/// 沙箱单次超时与外层熔断器超时之间保留的清理余量
const SANDBOX_CLEANUP_MARGIN_SECS: u64 = 5;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub resilience: ResilienceSection,
    pub agent: AgentSection,
    pub conversation: ConversationSection,
    pub sandbox: SandboxSection,
    pub tools: ToolsSection,
    pub coordinator: CoordinatorSection,
    pub storage: StorageSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
        }
    }
}

/// [llm] 段：后端选择与采样参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 为空时从 `{PROVIDER}_API_KEY` 环境变量读取
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

/// 单个依赖（provider 或工具类别）的连接池 + 熔断参数
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardSettings {
    pub max_connections: usize,
    /// 0 表示不限
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub acquire_timeout_secs: u64,
    pub execution_timeout_secs: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            requests_per_minute: 60,
            requests_per_hour: 1000,
            acquire_timeout_secs: 30,
            execution_timeout_secs: 60,
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// [resilience] 段：默认参数 + `[resilience.overrides.<name>]`
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceSection {
    pub defaults: GuardSettings,
    pub overrides: HashMap<String, GuardSettings>,
}

impl ResilienceSection {
    pub fn settings_for(&self, name: &str) -> &GuardSettings {
        self.overrides.get(name).unwrap_or(&self.defaults)
    }
}

/// [agent] 段：ReAct 循环上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    /// 连续解析 / 分发失败的容忍次数，超过后 Agent 失败
    pub max_parse_failures: u32,
    pub observation_max_chars: usize,
    pub wall_clock_secs: u64,
    /// 退避等待上限（秒）
    pub max_backoff_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            max_parse_failures: 3,
            observation_max_chars: 4000,
            wall_clock_secs: 600,
            max_backoff_secs: 30,
        }
    }
}

/// [conversation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub max_history: usize,
    pub ttl_secs: u64,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_history: 50,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

/// [sandbox] 段：容器隔离执行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub enabled: bool,
    /// docker / podman
    pub runtime: String,
    pub image: String,
    pub cpus: f32,
    pub memory_mb: u64,
    pub pids_limit: u32,
    pub max_output_bytes: usize,
    pub default_timeout_secs: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime: "docker".to_string(),
            image: "alpine:3.19".to_string(),
            cpus: 1.0,
            memory_mb: 256,
            pids_limit: 64,
            max_output_bytes: 64 * 1024,
            default_timeout_secs: 45,
        }
    }
}

/// [tools] 段：审计目标根目录、工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 未设置时由命令行的目标目录决定
    pub workspace_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub max_read_bytes: usize,
    pub max_grep_matches: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            tool_timeout_secs: 120,
            max_read_bytes: 200 * 1024,
            max_grep_matches: 50,
        }
    }
}

/// [coordinator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    /// 同层兄弟 Agent 并发上限
    pub fan_out: usize,
    pub task_budget_secs: u64,
    pub verify_findings: bool,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            fan_out: 4,
            task_budget_secs: 3600,
            verify_findings: true,
        }
    }
}

/// [storage] 段：SQLite 路径；为空时使用内存后端
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub sqlite_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.tool_timeout_secs)
    }

    pub fn agent_wall_clock(&self) -> Duration {
        Duration::from_secs(self.agent.wall_clock_secs)
    }

    pub fn task_budget(&self) -> Duration {
        Duration::from_secs(self.coordinator.task_budget_secs)
    }

    /// 沙箱单次调用可请求的最长超时：比 "sandbox" 熔断器的执行超时少一段清理余量
    pub fn sandbox_timeout_ceiling(&self) -> Duration {
        let guard_secs = self
            .resilience
            .settings_for(SANDBOX_GUARD)
            .execution_timeout_secs;
        let secs = guard_secs
            .saturating_sub(SANDBOX_CLEANUP_MARGIN_SECS)
            .max(self.sandbox.default_timeout_secs);
        Duration::from_secs(secs)
    }

    /// 校验非零上限与超时分层；任一依赖的执行超时都必须小于工具超时
    pub fn validate(&self) -> Result<(), AgentError> {
        let non_zero = [
            ("agent.max_iterations", self.agent.max_iterations as u64),
            ("agent.wall_clock_secs", self.agent.wall_clock_secs),
            ("agent.observation_max_chars", self.agent.observation_max_chars as u64),
            ("conversation.max_history", self.conversation.max_history as u64),
            ("tools.tool_timeout_secs", self.tools.tool_timeout_secs),
            ("sandbox.default_timeout_secs", self.sandbox.default_timeout_secs),
            ("coordinator.fan_out", self.coordinator.fan_out as u64),
            ("coordinator.task_budget_secs", self.coordinator.task_budget_secs),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(AgentError::Config(format!("{key} must be greater than zero")));
            }
        }

        let guards = std::iter::once(("defaults", &self.resilience.defaults)).chain(
            self.resilience
                .overrides
                .iter()
                .map(|(name, settings)| (name.as_str(), settings)),
        );
        for (name, settings) in guards {
            if settings.max_connections == 0 {
                return Err(AgentError::Config(format!(
                    "resilience.{name}.max_connections must be greater than zero"
                )));
            }
            if settings.failure_threshold == 0 {
                return Err(AgentError::Config(format!(
                    "resilience.{name}.failure_threshold must be greater than zero"
                )));
            }
            if settings.execution_timeout_secs == 0
                || settings.execution_timeout_secs >= self.tools.tool_timeout_secs
            {
                return Err(AgentError::Config(format!(
                    "resilience.{name}.execution_timeout_secs ({}) must be in (0, tools.tool_timeout_secs = {})",
                    settings.execution_timeout_secs, self.tools.tool_timeout_secs
                )));
            }
        }

        let sandbox_guard = self.resilience.settings_for(SANDBOX_GUARD);
        if self.sandbox.default_timeout_secs >= sandbox_guard.execution_timeout_secs {
            return Err(AgentError::Config(format!(
                "sandbox.default_timeout_secs ({}) must be less than the {SANDBOX_GUARD} guard's execution_timeout_secs ({})",
                self.sandbox.default_timeout_secs, sandbox_guard.execution_timeout_secs
            )));
        }

        if self.tools.tool_timeout_secs >= self.agent.wall_clock_secs {
            return Err(AgentError::Config(format!(
                "tools.tool_timeout_secs ({}) must be less than agent.wall_clock_secs ({})",
                self.tools.tool_timeout_secs, self.agent.wall_clock_secs
            )));
        }
        if self.agent.wall_clock_secs >= self.coordinator.task_budget_secs {
            return Err(AgentError::Config(format!(
                "agent.wall_clock_secs ({}) must be less than coordinator.task_budget_secs ({})",
                self.agent.wall_clock_secs, self.coordinator.task_budget_secs
            )));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conversation.ttl_secs, 86_400);
        assert_eq!(config.coordinator.fan_out, 4);
    }

    #[test]
    fn test_rejects_inverted_timeout_layering() {
        let mut config = AppConfig::default();
        config.agent.wall_clock_secs = config.coordinator.task_budget_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("task_budget_secs"));

        let mut config = AppConfig::default();
        config.resilience.defaults.execution_timeout_secs = config.tools.tool_timeout_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_override() {
        let mut config = AppConfig::default();
        config.resilience.overrides.insert(
            "sandbox".to_string(),
            GuardSettings {
                max_connections: 0,
                ..GuardSettings::default()
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sandbox"));
    }

    #[test]
    fn test_sandbox_timeout_stays_inside_guard() {
        let config = AppConfig::default();
        assert_eq!(config.sandbox_timeout_ceiling(), Duration::from_secs(55));
        assert!(config.sandbox_timeout_ceiling() < config.tool_timeout());

        let mut config = AppConfig::default();
        config.sandbox.default_timeout_secs = config.resilience.defaults.execution_timeout_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sandbox.default_timeout_secs"));

        let mut config = AppConfig::default();
        config.resilience.overrides.insert(
            SANDBOX_GUARD.to_string(),
            GuardSettings {
                execution_timeout_secs: 30,
                ..GuardSettings::default()
            },
        );
        assert!(config.validate().is_err());
        config.sandbox.default_timeout_secs = 28;
        assert!(config.validate().is_ok());
        assert_eq!(config.sandbox_timeout_ceiling(), Duration::from_secs(28));
    }

    #[test]
    fn test_load_from_toml_file_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[llm]
provider = "mock"

[agent]
max_iterations = 4

[resilience.defaults]
max_connections = 2

[resilience.overrides.sandbox]
max_connections = 1
failure_threshold = 2
"#,
        )
        .unwrap();

        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.llm.provider, "mock");
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.agent.max_parse_failures, 3);
        assert_eq!(config.resilience.settings_for("openai").max_connections, 2);
        let sandbox = config.resilience.settings_for("sandbox");
        assert_eq!(sandbox.max_connections, 1);
        assert_eq!(sandbox.failure_threshold, 2);
        assert_eq!(sandbox.cooldown_secs, 30);
    }
}
