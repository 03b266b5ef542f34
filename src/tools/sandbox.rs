//! 沙箱执行器
//!
//! 每次调用启动一个全新的隔离环境（默认 Docker 容器，`--rm` 用完即毁），带 CPU / 内存 / 进程数上限，
//! 网络默认关闭，按次开启。启动时探测隔离后端，不可用则进入降级模式：所有调用返回
//! `SandboxError::Unavailable`，由 Agent 决定跳过验证，而不是让整个任务崩溃。
//!
//! 单次超时会被压到 `timeout_ceiling` 以内，保证沙箱自己的超时先于外层熔断器 / 工具超时触发；
//! 外层仍然丢弃了执行 future 时，由 [`CleanupOnDrop`] 在后台删除容器。
//! HTTP 探测从宿主进程经 reqwest 发出，因此必须显式开启网络。

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxSection;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("sandbox call timed out after {0:?}")]
    Timeout(Duration),

    #[error("sandbox call cancelled")]
    Cancelled,

    #[error("isolation backend error: {0}")]
    Backend(String),

    #[error("http probe failed: {0}")]
    Http(String),

    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),

    #[error("network access not granted: {0}")]
    NetworkDenied(String),
}

/// 单次执行的资源上限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpus: f32,
    pub memory_mb: u64,
    pub pids_limit: u32,
    /// 是否允许访问网络，默认关闭
    pub network: bool,
}

impl ResourceLimits {
    pub fn from_section(section: &SandboxSection) -> Self {
        Self {
            cpus: section.cpus,
            memory_mb: section.memory_mb,
            pids_limit: section.pids_limit,
            network: false,
        }
    }

    pub fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }
}

/// 交给隔离后端的一次执行
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// 容器名，超时或取消时用于强制清理
    pub name: String,
    pub image: String,
    pub command: String,
    pub limits: ResourceLimits,
    /// stdout / stderr 各自最多读取的字节数，超出部分直接丢弃
    pub max_output_bytes: usize,
}

/// 后端返回的原始输出
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub truncated: bool,
}

/// 待验证漏洞的复现描述：命令或 HTTP 探测二选一，配合期望输出判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FindingDescriptor {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub http: Option<HttpRequest>,
    /// 输出（stdout 或响应体）中应出现的子串
    #[serde(default)]
    pub expect: Option<String>,
    #[serde(default)]
    pub expect_status: Option<u16>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub verified: bool,
    pub evidence: String,
}

/// 隔离后端：探测可用性，在全新环境中执行一条命令
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> Result<(), SandboxError>;

    async fn run(&self, spec: &ExecSpec) -> Result<RawOutput, SandboxError>;

    /// 超时或取消后清理残留环境
    async fn cleanup(&self, _spec: &ExecSpec) {}
}

/// Docker（或兼容 CLI，如 podman）后端
pub struct DockerBackend {
    program: String,
}

impl DockerBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn run_args(spec: &ExecSpec) -> Vec<String> {
        let network = if spec.limits.network { "bridge" } else { "none" };
        vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            spec.name.clone(),
            "--network".into(),
            network.into(),
            "--cpus".into(),
            format!("{}", spec.limits.cpus),
            "--memory".into(),
            format!("{}m", spec.limits.memory_mb),
            "--pids-limit".into(),
            spec.limits.pids_limit.to_string(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--tmpfs".into(),
            "/tmp:rw,size=64m".into(),
            spec.image.clone(),
            "sh".into(),
            "-c".into(),
            spec.command.clone(),
        ]
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        let output = timeout(
            Duration::from_secs(10),
            Command::new(&self.program)
                .args(["version", "--format", "{{.Server.Version}}"])
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| SandboxError::Unavailable(format!("{} did not answer within 10s", self.program)))?
        .map_err(|e| SandboxError::Unavailable(format!("cannot run {}: {e}", self.program)))?;

        if output.status.success() {
            tracing::debug!(
                runtime = %self.program,
                version = %String::from_utf8_lossy(&output.stdout).trim(),
                "isolation backend reachable"
            );
            Ok(())
        } else {
            Err(SandboxError::Unavailable(format!(
                "{} daemon not reachable: {}",
                self.program,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn run(&self, spec: &ExecSpec) -> Result<RawOutput, SandboxError> {
        let mut child = Command::new(&self.program)
            .args(Self::run_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Backend(format!("failed to start {}: {e}", self.program)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Backend("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Backend("stderr not captured".into()))?;

        let (stdout, stderr, status) = tokio::try_join!(
            read_capped(stdout, spec.max_output_bytes),
            read_capped(stderr, spec.max_output_bytes),
            child.wait(),
        )
        .map_err(|e| SandboxError::Backend(format!("{} io error: {e}", self.program)))?;
        Ok(RawOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }

    async fn cleanup(&self, spec: &ExecSpec) {
        let res = Command::new(&self.program)
            .args(["rm", "-f", &spec.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = res {
            tracing::warn!(container = %spec.name, error = %e, "failed to remove sandbox container");
        }
    }
}

/// 读取至多 `limit + 1` 字节（多出的一个字节用于判断截断），其余排空丢弃，避免子进程阻塞在写管道上
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut reader)
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(buf)
}

/// 执行 future 被丢弃时（外层超时、任务中止）在后台删除容器；正常收尾前先 `disarm`
struct CleanupOnDrop {
    backend: Arc<dyn IsolationBackend>,
    spec: Option<ExecSpec>,
}

impl CleanupOnDrop {
    fn disarm(&mut self) {
        self.spec = None;
    }
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        let Some(spec) = self.spec.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(container = %spec.name, "sandbox exec abandoned, removing container");
                let backend = self.backend.clone();
                handle.spawn(async move { backend.cleanup(&spec).await });
            }
            Err(_) => {
                tracing::error!(container = %spec.name, "no runtime left to remove sandbox container");
            }
        }
    }
}

pub struct SandboxExecutor {
    backend: Option<Arc<dyn IsolationBackend>>,
    unavailable_reason: Option<String>,
    image: String,
    limits: ResourceLimits,
    max_output_bytes: usize,
    default_timeout: Duration,
    timeout_ceiling: Duration,
    http: reqwest::Client,
}

impl SandboxExecutor {
    /// 探测后端；探测失败进入降级模式
    pub async fn start(backend: Arc<dyn IsolationBackend>, settings: &SandboxSection) -> Self {
        if !settings.enabled {
            return Self::disabled("sandbox disabled by configuration", settings);
        }
        match backend.probe().await {
            Ok(()) => {
                tracing::info!(backend = backend.name(), image = %settings.image, "sandbox ready");
                Self {
                    backend: Some(backend),
                    unavailable_reason: None,
                    ..Self::disabled("", settings)
                }
            }
            Err(e) => {
                tracing::warn!(backend = backend.name(), error = %e, "sandbox degraded");
                Self::disabled(&e.to_string(), settings)
            }
        }
    }

    pub fn disabled(reason: &str, settings: &SandboxSection) -> Self {
        Self {
            backend: None,
            unavailable_reason: Some(reason.to_string()),
            image: settings.image.clone(),
            limits: ResourceLimits::from_section(settings),
            max_output_bytes: settings.max_output_bytes.max(1),
            default_timeout: Duration::from_secs(settings.default_timeout_secs.max(1)),
            timeout_ceiling: Duration::MAX,
            http: reqwest::Client::new(),
        }
    }

    /// 单次调用允许的最长超时；调用方请求更长时按此截断
    pub fn with_timeout_ceiling(mut self, ceiling: Duration) -> Self {
        self.timeout_ceiling = ceiling.max(Duration::from_secs(1));
        self
    }

    pub fn timeout_ceiling(&self) -> Duration {
        self.timeout_ceiling
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_timeout)
            .min(self.timeout_ceiling)
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.unavailable_reason.as_deref()
    }

    pub fn default_limits(&self) -> ResourceLimits {
        self.limits.clone()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn backend(&self) -> Result<&Arc<dyn IsolationBackend>, SandboxError> {
        self.backend.as_ref().ok_or_else(|| {
            SandboxError::Unavailable(
                self.unavailable_reason
                    .clone()
                    .unwrap_or_else(|| "no isolation backend".to_string()),
            )
        })
    }

    /// 在一次性隔离环境中执行命令；超时作为结果（`timed_out`）返回，不是错误
    pub async fn execute(
        &self,
        command: &str,
        timeout_after: Option<Duration>,
        limits: Option<ResourceLimits>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        let backend = self.backend()?;
        if command.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("empty command".into()));
        }
        let after = self.effective_timeout(timeout_after);
        let spec = ExecSpec {
            name: format!("hive-sbx-{}", uuid::Uuid::new_v4().simple()),
            image: self.image.clone(),
            command: command.to_string(),
            limits: limits.unwrap_or_else(|| self.limits.clone()),
            max_output_bytes: self.max_output_bytes,
        };
        tracing::info!(
            container = %spec.name,
            network = spec.limits.network,
            timeout = ?after,
            "sandbox exec"
        );

        let mut armed = CleanupOnDrop {
            backend: backend.clone(),
            spec: Some(spec.clone()),
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = timeout(after, backend.run(&spec)) => Some(res),
        };
        match outcome {
            None => {
                backend.cleanup(&spec).await;
                armed.disarm();
                Err(SandboxError::Cancelled)
            }
            Some(Err(_)) => {
                backend.cleanup(&spec).await;
                armed.disarm();
                Ok(ExecOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("command timed out after {after:?}"),
                    success: false,
                    timed_out: true,
                    truncated: false,
                })
            }
            Some(Ok(raw)) => {
                let raw = raw?;
                armed.disarm();
                let (stdout, out_cut) = cap_output(&raw.stdout, self.max_output_bytes);
                let (stderr, err_cut) = cap_output(&raw.stderr, self.max_output_bytes);
                Ok(ExecOutput {
                    success: raw.exit_code == Some(0),
                    exit_code: raw.exit_code,
                    stdout,
                    stderr,
                    timed_out: false,
                    truncated: out_cut || err_cut,
                })
            }
        }
    }

    /// HTTP 探测：沙箱可用且本次调用显式开启网络才放行
    pub async fn execute_http(
        &self,
        request: &HttpRequest,
        timeout_after: Option<Duration>,
        network: bool,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, SandboxError> {
        self.backend()?;
        require_network(request, network)?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| SandboxError::InvalidRequest(format!("bad url '{}': {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SandboxError::InvalidRequest(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| SandboxError::InvalidRequest(format!("bad method '{}'", request.method)))?;
        let after = self.effective_timeout(timeout_after);

        let mut builder = self.http.request(method, url).timeout(after);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let call = async {
            let mut resp = builder.send().await.map_err(|e| map_reqwest(e, after))?;
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
                .collect();
            let mut bytes = Vec::new();
            while let Some(chunk) = resp.chunk().await.map_err(|e| map_reqwest(e, after))? {
                let room = (self.max_output_bytes + 1).saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if bytes.len() > self.max_output_bytes {
                    break;
                }
            }
            let (body, truncated) = cap_output(&bytes, self.max_output_bytes);
            Ok(HttpResponse {
                status,
                headers,
                body,
                truncated,
            })
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            res = call => res,
        }
    }

    /// 按描述复现漏洞：命令看退出码与期望输出，HTTP 看状态码与期望响应体
    pub async fn verify_vulnerability(
        &self,
        finding: &FindingDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Verification, SandboxError> {
        let after = finding.timeout_secs.map(Duration::from_secs);
        if let Some(command) = &finding.command {
            let limits = self.limits.clone().with_network(finding.network);
            let out = self.execute(command, after, Some(limits), cancel).await?;
            if out.timed_out {
                return Ok(Verification {
                    verified: false,
                    evidence: format!("reproduction of '{}' timed out", finding.title),
                });
            }
            let expected = finding
                .expect
                .as_deref()
                .map_or(true, |needle| out.stdout.contains(needle));
            return Ok(Verification {
                verified: out.success && expected,
                evidence: evidence_text(&format!(
                    "exit={:?}\nstdout:\n{}\nstderr:\n{}",
                    out.exit_code, out.stdout, out.stderr
                )),
            });
        }

        if let Some(request) = &finding.http {
            if finding.expect.is_none() && finding.expect_status.is_none() {
                return Err(SandboxError::InvalidRequest(
                    "http verification needs expect or expect_status".into(),
                ));
            }
            let resp = self.execute_http(request, after, finding.network, cancel).await?;
            let status_ok = finding.expect_status.map_or(true, |s| s == resp.status);
            let body_ok = finding
                .expect
                .as_deref()
                .map_or(true, |needle| resp.body.contains(needle));
            return Ok(Verification {
                verified: status_ok && body_ok,
                evidence: evidence_text(&format!("status={}\n{}", resp.status, resp.body)),
            });
        }

        Err(SandboxError::InvalidRequest(format!(
            "finding '{}' has neither a command nor an http probe",
            finding.id
        )))
    }
}

/// HTTP 探测从宿主发出，只有调用显式开启网络才放行
pub fn require_network(request: &HttpRequest, network: bool) -> Result<(), SandboxError> {
    if network {
        Ok(())
    } else {
        Err(SandboxError::NetworkDenied(format!(
            "http request to '{}' requires network=true",
            request.url
        )))
    }
}

fn map_reqwest(err: reqwest::Error, after: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout(after)
    } else {
        SandboxError::Http(err.to_string())
    }
}

/// 按字节上限截断，落在字符边界上
fn cap_output(bytes: &[u8], max: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return (text.into_owned(), false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

fn evidence_text(raw: &str) -> String {
    const MAX: usize = 2000;
    if raw.chars().count() > MAX {
        format!("{}...", raw.chars().take(MAX).collect::<String>())
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// 测试用后端：按命令前缀返回固定输出，记录每次调用
    #[derive(Default)]
    pub struct FakeBackend {
        pub unavailable: bool,
        pub delay: Option<Duration>,
        pub replies: Vec<(String, RawOutput)>,
        pub calls: Mutex<Vec<ExecSpec>>,
        pub cleaned: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        pub fn reply(mut self, prefix: &str, exit_code: i32, stdout: &str) -> Self {
            self.replies.push((
                prefix.to_string(),
                RawOutput {
                    exit_code: Some(exit_code),
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: Vec::new(),
                },
            ));
            self
        }
    }

    #[async_trait]
    impl IsolationBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn probe(&self) -> Result<(), SandboxError> {
            if self.unavailable {
                Err(SandboxError::Unavailable("fake backend offline".into()))
            } else {
                Ok(())
            }
        }

        async fn run(&self, spec: &ExecSpec) -> Result<RawOutput, SandboxError> {
            self.calls.lock().unwrap().push(spec.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .replies
                .iter()
                .find(|(prefix, _)| spec.command.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
                .unwrap_or(RawOutput {
                    exit_code: Some(127),
                    stdout: Vec::new(),
                    stderr: b"command not found".to_vec(),
                }))
        }

        async fn cleanup(&self, spec: &ExecSpec) {
            self.cleaned.lock().unwrap().push(spec.name.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBackend;
    use super::*;

    fn settings() -> SandboxSection {
        SandboxSection {
            max_output_bytes: 16,
            ..SandboxSection::default()
        }
    }

    #[test]
    fn test_docker_args_isolate_by_default() {
        let spec = ExecSpec {
            name: "hive-sbx-1".into(),
            image: "alpine:3.19".into(),
            command: "id".into(),
            limits: ResourceLimits::from_section(&SandboxSection::default()),
            max_output_bytes: 1024,
        };
        let args = DockerBackend::run_args(&spec).join(" ");
        assert!(args.starts_with("run --rm --name hive-sbx-1 --network none"));
        assert!(args.contains("--memory 256m"));
        assert!(args.contains("--pids-limit 64"));
        assert!(args.contains("--read-only --cap-drop ALL"));
        assert!(args.ends_with("alpine:3.19 sh -c id"));

        let open = ExecSpec {
            limits: spec.limits.clone().with_network(true),
            ..spec
        };
        assert!(DockerBackend::run_args(&open).contains(&"bridge".to_string()));
    }

    #[tokio::test]
    async fn test_degraded_mode_returns_unavailable() {
        let backend = Arc::new(FakeBackend {
            unavailable: true,
            ..Default::default()
        });
        let exec = SandboxExecutor::start(backend, &settings()).await;
        assert!(!exec.is_available());
        let cancel = CancellationToken::new();
        assert!(matches!(
            exec.execute("id", None, None, &cancel).await,
            Err(SandboxError::Unavailable(_))
        ));
        let req = HttpRequest {
            method: "GET".into(),
            url: "http://127.0.0.1:1/".into(),
            headers: BTreeMap::new(),
            body: None,
        };
        assert!(matches!(
            exec.execute_http(&req, None, true, &cancel).await,
            Err(SandboxError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_http_request_requires_network_opt_in() {
        let exec = SandboxExecutor::start(Arc::new(FakeBackend::default()), &settings()).await;
        let cancel = CancellationToken::new();
        let req = HttpRequest {
            method: "GET".into(),
            url: "http://127.0.0.1:9/".into(),
            headers: BTreeMap::new(),
            body: None,
        };
        assert!(matches!(
            exec.execute_http(&req, None, false, &cancel).await,
            Err(SandboxError::NetworkDenied(_))
        ));
        // 开启网络后请求真正发出（端口 9 无服务，连接失败）
        assert!(matches!(
            exec.execute_http(&req, Some(Duration::from_secs(2)), true, &cancel).await,
            Err(SandboxError::Http(_)) | Err(SandboxError::Timeout(_))
        ));

        let finding = FindingDescriptor {
            id: "F-2".into(),
            title: "open admin panel".into(),
            command: None,
            http: Some(req),
            expect: None,
            expect_status: Some(200),
            network: false,
            timeout_secs: None,
        };
        assert!(matches!(
            exec.verify_vulnerability(&finding, &cancel).await,
            Err(SandboxError::NetworkDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_read_capped_drains_the_rest() {
        let data = vec![b'x'; 10_000];
        let out = read_capped(&data[..], 16).await.unwrap();
        assert_eq!(out.len(), 17);
        let (text, cut) = cap_output(&out, 16);
        assert!(cut);
        assert_eq!(text.len(), 16);

        let small = read_capped(&b"ok"[..], 16).await.unwrap();
        assert_eq!(small, b"ok");
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let backend = Arc::new(FakeBackend::default().reply("cat", 0, "0123456789abcdefXYZ"));
        let exec = SandboxExecutor::start(backend.clone(), &settings()).await;
        let out = exec
            .execute("cat big", None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.truncated);
        assert_eq!(out.stdout, "0123456789abcdef");
        assert!(!backend.calls.lock().unwrap()[0].limits.network);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_up_environment() {
        let backend = Arc::new(FakeBackend {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let exec = SandboxExecutor::start(backend.clone(), &settings()).await;
        let out = exec
            .execute("sleep 30", Some(Duration::from_secs(2)), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
        assert_eq!(backend.cleaned.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_timeout_is_clamped_to_ceiling() {
        let backend = Arc::new(FakeBackend {
            delay: Some(Duration::from_secs(500)),
            ..Default::default()
        });
        let exec = SandboxExecutor::start(backend.clone(), &settings())
            .await
            .with_timeout_ceiling(Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        let out = exec
            .execute("sleep 500", Some(Duration::from_secs(300)), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(11));
        assert!(out.stderr.contains("10s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execution_still_removes_container() {
        let backend = Arc::new(FakeBackend {
            delay: Some(Duration::from_secs(500)),
            ..Default::default()
        });
        let exec = SandboxExecutor::start(backend.clone(), &settings()).await;
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            exec.execute("sleep 500", Some(Duration::from_secs(300)), None, &CancellationToken::new()),
        )
        .await;
        assert!(res.is_err());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let cleaned = backend.cleaned.lock().unwrap().clone();
        let calls = backend.calls.lock().unwrap();
        assert_eq!(cleaned, vec![calls[0].name.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_execution() {
        let backend = Arc::new(FakeBackend {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let exec = SandboxExecutor::start(backend.clone(), &settings()).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        assert_eq!(
            exec.execute("sleep 30", None, None, &cancel).await,
            Err(SandboxError::Cancelled)
        );
        assert_eq!(backend.cleaned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_vulnerability_by_command() {
        let backend = Arc::new(FakeBackend::default().reply("python3 poc.py", 0, "uid=0(root)"));
        let exec = SandboxExecutor::start(backend.clone(), &SandboxSection::default()).await;
        let cancel = CancellationToken::new();
        let mut finding = FindingDescriptor {
            id: "F-1".into(),
            title: "command injection".into(),
            command: Some("python3 poc.py".into()),
            http: None,
            expect: Some("uid=0".into()),
            expect_status: None,
            network: true,
            timeout_secs: Some(5),
        };
        let v = exec.verify_vulnerability(&finding, &cancel).await.unwrap();
        assert!(v.verified);
        assert!(v.evidence.contains("uid=0(root)"));
        assert!(backend.calls.lock().unwrap()[0].limits.network);

        finding.expect = Some("not-in-output".into());
        assert!(!exec.verify_vulnerability(&finding, &cancel).await.unwrap().verified);

        finding.command = None;
        assert!(matches!(
            exec.verify_vulnerability(&finding, &cancel).await,
            Err(SandboxError::InvalidRequest(_))
        ));
    }
}
