//! 暴露给 Agent 的沙箱工具：sandbox_exec / http_probe / verify_finding
//!
//! 可选地经过名为 "sandbox" 的 ResilienceGuard，沙箱连续失败时熔断，避免每个 Agent 都去撞一遍。
//! 沙箱不可用时返回结构化的 unavailable 文本，Agent 可以据此跳过验证。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::resilience::{ResilienceError, ResilienceGuard};
use crate::tools::sandbox::{
    require_network, FindingDescriptor, HttpRequest, SandboxError, SandboxExecutor,
};
use crate::tools::schema::{parameters_schema_for, typed_args};
use crate::tools::{Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SandboxExecArgs {
    /// 在一次性容器中执行的 shell 命令
    pub command: String,
    /// 超时秒数，缺省用配置值
    pub timeout_secs: Option<u64>,
    /// 是否开启网络，默认关闭
    pub network: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HttpProbeArgs {
    pub url: String,
    /// GET / POST / ...，默认 GET
    pub method: Option<String>,
    pub headers: Option<std::collections::BTreeMap<String, String>>,
    pub body: Option<String>,
    pub timeout_secs: Option<u64>,
    /// 必须为 true，请求才会发出
    pub network: Option<bool>,
}

/// 三个沙箱工具共享的执行器与可选熔断
#[derive(Clone)]
pub struct SandboxHandle {
    executor: Arc<SandboxExecutor>,
    guard: Option<Arc<ResilienceGuard>>,
}

impl SandboxHandle {
    pub fn new(executor: Arc<SandboxExecutor>) -> Self {
        Self {
            executor,
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: Arc<ResilienceGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    async fn guarded<T, F, Fut>(&self, ctx: &ToolContext, f: F) -> Result<T, String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SandboxError>>,
    {
        // 降级模式直接返回，不计入熔断
        if let Some(reason) = self.executor.unavailable_reason() {
            return Err(format!("sandbox unavailable: {reason}"));
        }
        match &self.guard {
            None => f().await.map_err(|e| e.to_string()),
            Some(guard) => guard.call(&ctx.cancel, f).await.map_err(|e| match e {
                ResilienceError::Upstream(inner) => inner.to_string(),
                other => other.to_string(),
            }),
        }
    }
}

pub struct SandboxExecTool {
    handle: SandboxHandle,
}

impl SandboxExecTool {
    pub fn new(handle: SandboxHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Tool for SandboxExecTool {
    fn name(&self) -> &str {
        "sandbox_exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in a fresh, resource-limited container that is destroyed afterwards. \
         Network is off unless network=true. Returns exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<SandboxExecArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let args: SandboxExecArgs = typed_args(args)?;
        let executor = self.handle.executor();
        let limits = executor
            .default_limits()
            .with_network(args.network.unwrap_or(false));
        let after = args.timeout_secs.map(Duration::from_secs);
        let out = self
            .handle
            .guarded(ctx, || executor.execute(&args.command, after, Some(limits), &ctx.cancel))
            .await?;
        serde_json::to_string_pretty(&out).map_err(|e| e.to_string())
    }
}

pub struct HttpProbeTool {
    handle: SandboxHandle,
}

impl HttpProbeTool {
    pub fn new(handle: SandboxHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Tool for HttpProbeTool {
    fn name(&self) -> &str {
        "http_probe"
    }

    fn description(&self) -> &str {
        "Send a single HTTP request to the target under audit and return status, headers and a capped body. \
         Requires network=true."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<HttpProbeArgs>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let args: HttpProbeArgs = typed_args(args)?;
        let request = HttpRequest {
            method: args.method.unwrap_or_else(|| "GET".to_string()),
            url: args.url,
            headers: args.headers.unwrap_or_default(),
            body: args.body,
        };
        let after = args.timeout_secs.map(Duration::from_secs);
        let network = args.network.unwrap_or(false);
        // 请求本身不合规，不经过熔断器
        require_network(&request, network).map_err(|e| e.to_string())?;
        let executor = self.handle.executor();
        let resp = self
            .handle
            .guarded(ctx, || executor.execute_http(&request, after, network, &ctx.cancel))
            .await?;
        serde_json::to_string_pretty(&resp).map_err(|e| e.to_string())
    }
}

pub struct VerifyFindingTool {
    handle: SandboxHandle,
}

impl VerifyFindingTool {
    pub fn new(handle: SandboxHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Tool for VerifyFindingTool {
    fn name(&self) -> &str {
        "verify_finding"
    }

    fn description(&self) -> &str {
        "Try to reproduce a candidate finding in the sandbox, either with a command or an http request, \
         and report whether the expected evidence appeared."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<FindingDescriptor>()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let finding: FindingDescriptor = typed_args(args)?;
        if finding.command.is_none() {
            if let Some(request) = &finding.http {
                require_network(request, finding.network).map_err(|e| e.to_string())?;
            }
        }
        let executor = self.handle.executor();
        let verification = self
            .handle
            .guarded(ctx, || executor.verify_vulnerability(&finding, &ctx.cancel))
            .await?;
        serde_json::to_string_pretty(&verification).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardSettings, SandboxSection};
    use crate::tools::sandbox::fake::FakeBackend;
    use serde_json::json;

    async fn handle(backend: FakeBackend) -> SandboxHandle {
        let exec = SandboxExecutor::start(Arc::new(backend), &SandboxSection::default()).await;
        SandboxHandle::new(Arc::new(exec))
    }

    #[tokio::test]
    async fn test_sandbox_exec_reports_output() {
        let tool = SandboxExecTool::new(handle(FakeBackend::default().reply("echo", 0, "hello")).await);
        let out = tool
            .execute(json!({"command": "echo hello"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(out.contains("\"success\": true"));
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_is_reported_not_raised() {
        let backend = FakeBackend {
            unavailable: true,
            ..Default::default()
        };
        let tool = VerifyFindingTool::new(handle(backend).await);
        let err = tool
            .execute(
                json!({"id": "F-1", "title": "t", "command": "true", "expect": "x"}),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert!(err.contains("sandbox unavailable"));
    }

    #[tokio::test]
    async fn test_guard_opens_after_repeated_backend_failures() {
        let settings = GuardSettings {
            failure_threshold: 2,
            ..GuardSettings::default()
        };
        let guard = Arc::new(ResilienceGuard::from_settings("sandbox", &settings));
        let tool = HttpProbeTool::new(handle(FakeBackend::default()).await.with_guard(guard.clone()));
        let ctx = ToolContext::default();
        for _ in 0..2 {
            let err = tool
                .execute(json!({"url": "http://127.0.0.1:9/", "network": true}), &ctx)
                .await
                .unwrap_err();
            assert!(err.contains("http probe failed"));
        }
        let err = tool
            .execute(json!({"url": "http://127.0.0.1:9/", "network": true}), &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("circuit 'sandbox' is open"));
    }

    #[tokio::test]
    async fn test_http_tool_without_network_is_refused() {
        let settings = GuardSettings {
            failure_threshold: 1,
            ..GuardSettings::default()
        };
        let guard = Arc::new(ResilienceGuard::from_settings("sandbox", &settings));
        let tool = HttpProbeTool::new(handle(FakeBackend::default()).await.with_guard(guard.clone()));
        for _ in 0..2 {
            let err = tool
                .execute(json!({"url": "http://127.0.0.1:9/"}), &ToolContext::default())
                .await
                .unwrap_err();
            assert!(err.contains("requires network=true"));
        }
        assert_eq!(guard.snapshot().breaker.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_timeout_request_times_out_inside_guard() {
        let settings = GuardSettings::default();
        let guard = Arc::new(ResilienceGuard::from_settings("sandbox", &settings));
        let backend = Arc::new(FakeBackend {
            delay: Some(Duration::from_secs(500)),
            ..Default::default()
        });
        let ceiling = Duration::from_secs(settings.execution_timeout_secs - 5);
        let exec = SandboxExecutor::start(backend.clone(), &SandboxSection::default())
            .await
            .with_timeout_ceiling(ceiling);
        let tool = SandboxExecTool::new(SandboxHandle::new(Arc::new(exec)).with_guard(guard.clone()));

        let out = tool
            .execute(
                json!({"command": "sleep 500", "timeout_secs": 300}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(out.contains("\"timed_out\": true"));
        assert_eq!(backend.cleaned.lock().unwrap().len(), 1);
        assert_eq!(guard.snapshot().breaker.consecutive_failures, 0);
    }
}
