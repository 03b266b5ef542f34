//! 审计任务端到端测试：脚本化 LLM + 内存存储 + 假沙箱后端

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::coordinator::{Severity, TaskDescriptor, TaskReport, TaskStatus};
use hive::core::{AuditBuilder, AuditComponents};
use hive::llm::{ScriptedLlmClient, ScriptedReply};
use hive::react::{AgentSpec, EventSink, TaskEvent, TaskEventKind};
use hive::tools::sandbox::{ExecSpec, RawOutput};
use hive::tools::{IsolationBackend, SandboxError};
use hive::tree::{AgentType, CheckpointKind, NodeStatus, TreeView};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const RECON: &str = "Role: reconnaissance";
const VERIFY: &str = "Role: verification";

struct StubBackend {
    online: bool,
    commands: Mutex<Vec<String>>,
}

impl StubBackend {
    fn online() -> Arc<Self> {
        Arc::new(Self {
            online: true,
            commands: Mutex::new(Vec::new()),
        })
    }

    fn offline() -> Arc<Self> {
        Arc::new(Self {
            online: false,
            commands: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl IsolationBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    async fn probe(&self) -> Result<(), SandboxError> {
        if self.online {
            Ok(())
        } else {
            Err(SandboxError::Unavailable("no container runtime".into()))
        }
    }

    async fn run(&self, spec: &ExecSpec) -> Result<RawOutput, SandboxError> {
        self.commands.lock().unwrap().push(spec.command.clone());
        Ok(RawOutput {
            exit_code: Some(0),
            stdout: b"uid=0(root) pwned".to_vec(),
            stderr: Vec::new(),
        })
    }
}

fn target_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("app.py"),
        "import os\n\ndef handler(req):\n    os.system('ping ' + req.args['host'])\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("auth.py"), "def login(user, pw):\n    return True\n").unwrap();
    dir
}

fn recon_script() -> Vec<ScriptedReply> {
    vec![
        r#"{"tool": "code_grep", "args": {"pattern": "os.system"}}"#.into(),
        r#"{"final_answer": {"summary": "small flask app", "risk_areas": [{"name": "shell"}, {"name": "auth"}]}}"#.into(),
    ]
}

const SHELL_FINDINGS: &str = r#"{"final_answer": {"findings": [{"title": "Command injection in handler", "severity": "high", "file": "app.py", "line": 4, "reproduction": {"command": "python3 poc.py", "expect": "pwned"}}]}}"#;
const AUTH_FINDINGS: &str = r#"{"final_answer": {"findings": [{"title": "Login accepts any password", "severity": "critical", "file": "auth.py", "line": 2}]}}"#;

fn scripted_llm() -> ScriptedLlmClient {
    ScriptedLlmClient::new("mock")
        .with_route(RECON, recon_script())
        .with_route("Risk area: shell", [SHELL_FINDINGS])
        .with_route("Risk area: auth", [AUTH_FINDINGS])
        .with_route(
            VERIFY,
            [
                r#"{"tool": "verify_finding", "args": {"id": "F-1", "title": "Command injection in handler", "command": "python3 poc.py", "expect": "pwned"}}"#,
                r#"{"final_answer": {"verified": true, "evidence": "stdout contained pwned"}}"#,
            ],
        )
}

async fn components(
    llm: Arc<ScriptedLlmClient>,
    backend: Arc<StubBackend>,
    target: &TempDir,
) -> AuditComponents {
    AuditBuilder::new(AppConfig::default(), target.path())
        .with_llm(llm)
        .with_sandbox_backend(backend)
        .build()
        .await
        .unwrap()
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn all_nodes(report: &TaskReport) -> Vec<hive::tree::AgentTreeNode> {
    report
        .tree
        .tree
        .iter()
        .flat_map(TreeView::walk)
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_audit_builds_two_level_tree_with_verified_finding() {
    let target = target_dir();
    let llm = Arc::new(scripted_llm());
    let backend = StubBackend::online();
    let c = components(llm.clone(), backend.clone(), &target).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let report = c
        .coordinator
        .run_task(
            TaskDescriptor::new(target.path(), "find injection bugs"),
            &CancellationToken::new(),
            Some(tx),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert!(!report.budget_exceeded);
    assert_eq!(report.tree.total_nodes, 4);
    assert_eq!(report.tree.max_depth, 2);
    assert!(report.tree.failures.is_empty());

    let nodes = all_nodes(&report);
    let root = &report.tree.tree[0].node;
    assert_eq!(root.agent_type, AgentType::Recon);
    assert_eq!(root.counters.iterations, 2);
    assert_eq!(c.store.checkpoints(&root.id).await.unwrap().len(), 2);

    // 分析节点挂在侦察节点下，且在侦察结束之后才创建
    let analyses: Vec<_> = nodes.iter().filter(|n| n.agent_type == AgentType::Analysis).collect();
    assert_eq!(analyses.len(), 2);
    for node in &analyses {
        assert_eq!(node.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(node.depth, 1);
        assert!(node.created_at >= root.finished_at.unwrap());
    }

    // 发现按严重程度排序；可复现的那条被验证
    assert_eq!(report.findings.len(), 2);
    assert_eq!(report.findings[0].severity, Severity::Critical);
    assert_eq!(report.findings[0].verified, None);
    let injection = &report.findings[1];
    assert_eq!(injection.verified, Some(true));

    let verifier = nodes
        .iter()
        .find(|n| n.agent_type == AgentType::Verification)
        .unwrap();
    assert_eq!(verifier.parent_id.as_deref(), Some(injection.source_agent.as_str()));
    assert_eq!(verifier.depth, 2);
    assert_eq!(
        backend.commands.lock().unwrap().as_slice(),
        ["python3 poc.py".to_string()]
    );

    // 每个节点都有最终检查点，且 id 无重复（无环）
    let mut ids: Vec<_> = nodes.iter().map(|n| n.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), nodes.len());
    for node in &nodes {
        assert_eq!(node.status, NodeStatus::Completed);
        let cps = c.store.checkpoints(&node.id).await.unwrap();
        assert_eq!(cps.last().unwrap().kind, CheckpointKind::Final);
    }

    let events = drain(&mut rx);
    let phase_starts = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::PhaseStart)
        .count();
    assert_eq!(phase_starts, 3);
    assert_eq!(
        events.iter().filter(|e| e.kind == TaskEventKind::Finding).count(),
        2
    );
    assert!(!events.iter().any(|e| e.kind == TaskEventKind::Failed));
}

#[tokio::test]
async fn test_rerunning_finished_agent_writes_nothing() {
    let target = target_dir();
    let llm = Arc::new(scripted_llm());
    let c = components(llm.clone(), StubBackend::online(), &target).await;
    let task = TaskDescriptor::new(target.path(), "audit").without_verification();
    let report = c
        .coordinator
        .run_task(task.clone(), &CancellationToken::new(), None)
        .await
        .unwrap();
    let root = report.tree.tree[0].node.clone();
    let before = c.store.checkpoints(&root.id).await.unwrap();
    let calls = llm.calls();

    let spec = AgentSpec {
        node_id: root.id.clone(),
        task_id: task.task_id.clone(),
        session_id: task.task_id.clone(),
        agent_type: AgentType::Recon,
        instructions: String::new(),
        input: String::new(),
        allowed_tools: None,
    };
    let again = c
        .runtime
        .run(&spec, &CancellationToken::new(), &EventSink::none())
        .await
        .unwrap();

    assert_eq!(again.status, NodeStatus::Completed);
    assert_eq!(c.store.checkpoints(&root.id).await.unwrap(), before);
    assert_eq!(llm.calls(), calls);
    assert_eq!(c.store.node(&root.id).await.unwrap().unwrap(), root);
}

#[tokio::test]
async fn test_degraded_sandbox_keeps_unverified_findings() {
    let target = target_dir();
    let llm = Arc::new(
        ScriptedLlmClient::new("mock")
            .with_route(RECON, recon_script())
            .with_route("Risk area: shell", [SHELL_FINDINGS])
            .with_route("Risk area: auth", [r#"{"final_answer": {"findings": []}}"#])
            .with_route(
                VERIFY,
                [
                    r#"{"tool": "verify_finding", "args": {"id": "F-1", "title": "x", "command": "python3 poc.py"}}"#,
                    r#"{"final_answer": "Sandbox is offline, unable to confirm from code alone."}"#,
                ],
            ),
    );
    let c = components(llm.clone(), StubBackend::offline(), &target).await;
    assert!(!c.sandbox.is_available());

    let report = c
        .coordinator
        .run_task(
            TaskDescriptor::new(target.path(), "audit"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Completed);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].verified, None);
    let observed = llm
        .requests()
        .iter()
        .any(|r| r.prompt.contains("sandbox unavailable"));
    assert!(observed);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_marks_agents_cancelled() {
    let target = target_dir();
    let llm = Arc::new(ScriptedLlmClient::new("mock").with_route(
        RECON,
        [ScriptedReply::Delayed(
            Duration::from_secs(30),
            r#"{"final_answer": "late"}"#.into(),
        )],
    ));
    let c = components(llm, StubBackend::online(), &target).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let report = c
        .coordinator
        .run_task(TaskDescriptor::new(target.path(), "audit"), &cancel, None)
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.tree.total_nodes, 1);
    let root = &report.tree.tree[0].node;
    assert_eq!(root.status, NodeStatus::Cancelled);
    assert_eq!(report.tree.failures[0].reason, "cancelled");
    let cps = c.store.checkpoints(&root.id).await.unwrap();
    assert_eq!(cps.last().unwrap().kind, CheckpointKind::Final);
}

#[tokio::test(start_paused = true)]
async fn test_task_budget_cancels_running_agents() {
    let target = target_dir();
    let llm = Arc::new(ScriptedLlmClient::new("mock").with_route(
        RECON,
        [ScriptedReply::Delayed(
            Duration::from_secs(30),
            r#"{"final_answer": "late"}"#.into(),
        )],
    ));
    let c = components(llm, StubBackend::online(), &target).await;
    let coordinator = c.coordinator.with_task_budget(Duration::from_secs(5));

    let report = coordinator
        .run_task(
            TaskDescriptor::new(target.path(), "audit"),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(report.budget_exceeded);
    assert_eq!(report.status, TaskStatus::Failed);
    assert_eq!(report.tree.tree[0].node.status, NodeStatus::Cancelled);
    assert!(report.findings.is_empty());
}

#[tokio::test]
async fn test_failed_analysis_yields_partial_report() {
    let target = target_dir();
    let llm = Arc::new(
        ScriptedLlmClient::new("mock")
            .with_route(RECON, recon_script())
            .with_route("Risk area: shell", ["{", "{ broken", "{\"no\": ", "{"])
            .with_route("Risk area: auth", [AUTH_FINDINGS]),
    );
    let c = components(llm, StubBackend::online(), &target).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let report = c
        .coordinator
        .run_task(
            TaskDescriptor::new(target.path(), "audit").without_verification(),
            &CancellationToken::new(),
            Some(tx),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TaskStatus::Partial);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.tree.failures.len(), 1);
    assert_eq!(report.tree.failures[0].agent_type, AgentType::Analysis);
    let failed_events: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind == TaskEventKind::Failed)
        .collect();
    assert_eq!(failed_events.len(), 1);
}
