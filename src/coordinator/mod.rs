//! 协调器：驱动一次审计任务的 Agent 树
//!
//! 侦察（根节点）→ 按风险区域派生分析 Agent（侦察的子节点，受 fan-out 信号量限制并发）
//! → 每个带复现方式的发现派生验证 Agent（产出该发现的分析节点的子节点）。
//! 子节点只在父节点完成后创建。任务预算耗尽时取消整棵树，各 Agent 以 cancelled 结束。

pub mod findings;
pub mod prompts;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorSection;
use crate::core::AgentError;
use crate::react::{AgentOutcome, AgentRuntime, AgentSpec, EventSink, TaskEvent, TaskEventKind};
use crate::tree::{
    AgentId, AgentTreeNode, AgentType, NewNode, NodeStatus, TaskId, TreeStore, TreeView,
};

pub use findings::{Finding, Severity};

/// 一次审计任务
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub target: PathBuf,
    pub objective: String,
    /// 与配置中的 verify_findings 同时为 true 才派生验证 Agent
    pub verify_findings: bool,
}

impl TaskDescriptor {
    pub fn new(target: impl Into<PathBuf>, objective: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            objective: objective.into(),
            verify_findings: true,
        }
    }

    pub fn without_verification(mut self) -> Self {
        self.verify_findings = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Partial,
}

/// 一棵失败子树：子树根与其中最深的失败节点
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSubtree {
    pub subtree_root: AgentId,
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub depth: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeSummary {
    pub total_nodes: usize,
    pub by_status: BTreeMap<String, usize>,
    pub max_depth: u32,
    pub failures: Vec<FailedSubtree>,
    pub tree: Vec<TreeView>,
}

impl TreeSummary {
    pub fn from_views(tree: Vec<TreeView>) -> Self {
        let nodes: Vec<&AgentTreeNode> = tree.iter().flat_map(|v| v.walk()).collect();
        let mut by_status = BTreeMap::new();
        for node in &nodes {
            *by_status.entry(node.status.as_str().to_string()).or_insert(0) += 1;
        }
        let total_nodes = nodes.len();
        let max_depth = nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        drop(nodes);
        let mut failures = Vec::new();
        for view in &tree {
            collect_failures(view, false, &mut failures);
        }
        Self {
            total_nodes,
            max_depth,
            by_status,
            failures,
            tree,
        }
    }

    /// 全部完成 → completed；没有节点或根未完成 → failed；其余 → partial
    pub fn status(&self) -> TaskStatus {
        let Some(root) = self.tree.first() else {
            return TaskStatus::Failed;
        };
        if root.node.status != NodeStatus::Completed {
            return TaskStatus::Failed;
        }
        let completed = self
            .by_status
            .get(NodeStatus::Completed.as_str())
            .copied()
            .unwrap_or(0);
        if completed == self.total_nodes {
            TaskStatus::Completed
        } else {
            TaskStatus::Partial
        }
    }
}

fn collect_failures(view: &TreeView, parent_failed: bool, out: &mut Vec<FailedSubtree>) {
    let failed = view.node.status.is_failure();
    if failed && !parent_failed {
        let deepest = view
            .walk()
            .into_iter()
            .filter(|n| n.status.is_failure())
            .fold(&view.node, |best, n| if n.depth > best.depth { n } else { best });
        out.push(FailedSubtree {
            subtree_root: view.node.id.clone(),
            agent_id: deepest.id.clone(),
            agent_type: deepest.agent_type.clone(),
            depth: deepest.depth,
            reason: deepest
                .failure_reason
                .clone()
                .unwrap_or_else(|| deepest.status.as_str().to_string()),
        });
    }
    for child in &view.children {
        collect_failures(child, failed || parent_failed, out);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub findings: Vec<Finding>,
    pub tree: TreeSummary,
    pub budget_exceeded: bool,
    pub duration_ms: u64,
}

pub struct Coordinator {
    runtime: Arc<AgentRuntime>,
    fan_out: usize,
    task_budget: Duration,
    verify_findings: bool,
}

impl Coordinator {
    pub fn new(runtime: Arc<AgentRuntime>, settings: &CoordinatorSection) -> Self {
        Self {
            runtime,
            fan_out: settings.fan_out.max(1),
            task_budget: Duration::from_secs(settings.task_budget_secs),
            verify_findings: settings.verify_findings,
        }
    }

    pub fn with_task_budget(mut self, budget: Duration) -> Self {
        self.task_budget = budget;
        self
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub async fn run_task(
        &self,
        task: TaskDescriptor,
        cancel: &CancellationToken,
        events: Option<UnboundedSender<TaskEvent>>,
    ) -> Result<TaskReport, AgentError> {
        let started = Instant::now();
        let events = EventSink::from(events);
        let task_cancel = cancel.child_token();
        tracing::info!(task = %task.task_id, target = %task.target.display(), "task started");

        let (findings, budget_exceeded) = {
            let phases = self.run_phases(&task, &task_cancel, &events);
            tokio::pin!(phases);
            tokio::select! {
                res = &mut phases => (res?, false),
                _ = sleep(self.task_budget) => {
                    tracing::warn!(task = %task.task_id, budget = ?self.task_budget, "task budget exhausted, cancelling agents");
                    task_cancel.cancel();
                    (phases.await?, true)
                }
            }
        };

        let tree = TreeSummary::from_views(self.runtime.store().subtree(&task.task_id).await?);
        let status = tree.status();
        for failure in &tree.failures {
            events.emit(
                TaskEventKind::Failed,
                json!({
                    "agentId": failure.agent_id,
                    "agentType": failure.agent_type.to_string(),
                    "reason": failure.reason,
                }),
            );
        }
        tracing::info!(
            task = %task.task_id,
            status = ?status,
            findings = findings.len(),
            nodes = tree.total_nodes,
            "task finished"
        );
        Ok(TaskReport {
            task_id: task.task_id,
            status,
            findings,
            tree,
            budget_exceeded,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn run_phases(
        &self,
        task: &TaskDescriptor,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<Vec<Finding>, AgentError> {
        let store = self.runtime.store().clone();

        // 侦察
        events.emit(TaskEventKind::PhaseStart, json!({"phase": "recon", "agents": 1}));
        let root_id = store
            .create_node(NewNode::root(AgentType::Recon, "recon", task.task_id.clone()))
            .await?;
        let recon_spec = self.spec(task, root_id.clone(), AgentType::Recon, prompts::recon_input(task));
        let recon = run_agent(&self.runtime, &recon_spec, cancel, events).await;
        events.emit(
            TaskEventKind::PhaseComplete,
            json!({"phase": "recon", "status": recon.status.as_str()}),
        );
        let Some(recon_answer) = recon.final_answer.filter(|_| recon.status == NodeStatus::Completed)
        else {
            return Ok(Vec::new());
        };

        // 分析
        let areas = prompts::risk_areas(&recon_answer);
        events.emit(
            TaskEventKind::PhaseStart,
            json!({"phase": "analysis", "agents": areas.len()}),
        );
        let mut specs = Vec::with_capacity(areas.len());
        for area in &areas {
            let id = store
                .create_node(NewNode::child(
                    root_id.clone(),
                    AgentType::Analysis,
                    format!("analysis: {}", area.name),
                    task.task_id.clone(),
                ))
                .await?;
            specs.push(self.spec(
                task,
                id,
                AgentType::Analysis,
                prompts::analysis_input(task, area, &recon_answer),
            ));
        }
        let analyses = self.run_concurrently(specs, cancel, events).await;
        let mut found = Vec::new();
        for outcome in analyses.iter().filter(|o| o.is_completed()) {
            for finding in findings::collect_findings(outcome) {
                events.emit(TaskEventKind::Finding, json!(finding));
                found.push(finding);
            }
        }
        let mut found = findings::dedupe(found);
        events.emit(
            TaskEventKind::PhaseComplete,
            json!({"phase": "analysis", "findings": found.len()}),
        );

        // 验证
        if self.verify_findings && task.verify_findings && !cancel.is_cancelled() {
            let candidates: Vec<usize> = found
                .iter()
                .enumerate()
                .filter(|(_, f)| f.reproduction.is_some())
                .map(|(i, _)| i)
                .collect();
            if !candidates.is_empty() {
                events.emit(
                    TaskEventKind::PhaseStart,
                    json!({"phase": "verification", "agents": candidates.len()}),
                );
                let mut specs = Vec::with_capacity(candidates.len());
                for &i in &candidates {
                    let finding = &found[i];
                    let id = store
                        .create_node(NewNode::child(
                            finding.source_agent.clone(),
                            AgentType::Verification,
                            format!("verify: {}", finding.title),
                            task.task_id.clone(),
                        ))
                        .await?;
                    specs.push(self.spec(
                        task,
                        id,
                        AgentType::Verification,
                        prompts::verification_input(task, finding),
                    ));
                }
                let outcomes = self.run_concurrently(specs, cancel, events).await;
                for (&i, outcome) in candidates.iter().zip(outcomes.iter()) {
                    found[i].apply_verification(outcome);
                }
                let verified = found.iter().filter(|f| f.verified == Some(true)).count();
                events.emit(
                    TaskEventKind::PhaseComplete,
                    json!({"phase": "verification", "verified": verified}),
                );
            }
        }

        findings::sort_by_severity(&mut found);
        Ok(found)
    }

    fn spec(&self, task: &TaskDescriptor, node_id: AgentId, agent_type: AgentType, input: String) -> AgentSpec {
        AgentSpec {
            node_id,
            task_id: task.task_id.clone(),
            session_id: task.task_id.clone(),
            instructions: prompts::instructions_for(&agent_type),
            allowed_tools: prompts::allowed_tools_for(&agent_type),
            agent_type,
            input,
        }
    }

    /// 兄弟 Agent 并发运行，同时运行数不超过 fan_out；结果按 specs 顺序返回
    async fn run_concurrently(
        &self,
        specs: Vec<AgentSpec>,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Vec<AgentOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.fan_out));
        let mut set = JoinSet::new();
        for (index, spec) in specs.iter().cloned().enumerate() {
            let runtime = self.runtime.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let events = events.clone();
            set.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_agent(&runtime, &spec, &cancel, &events).await,
                    Err(_) => {
                        mark_aborted(&**runtime.store(), &spec, "fan-out closed".to_string())
                            .await
                    }
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<AgentOutcome>> = vec![None; specs.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "agent task panicked"),
            }
        }

        let mut outcomes = Vec::with_capacity(specs.len());
        for (spec, slot) in specs.iter().zip(slots) {
            let outcome = match slot {
                Some(outcome) => outcome,
                None => {
                    mark_aborted(&**self.runtime.store(), spec, "agent task panicked".to_string())
                        .await
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// 运行一个 Agent；运行时自身报错（节点缺失、状态写入失败）时把节点尽力标记为 Failed，
/// 让失败原因出现在任务报告里
async fn run_agent(
    runtime: &AgentRuntime,
    spec: &AgentSpec,
    cancel: &CancellationToken,
    events: &EventSink,
) -> AgentOutcome {
    match runtime.run(spec, cancel, events).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(node = %spec.node_id, error = %e, "agent run aborted");
            let reason = format!("agent run aborted: {}", e.failure_reason());
            mark_aborted(&**runtime.store(), spec, reason).await
        }
    }
}

async fn mark_aborted(store: &dyn TreeStore, spec: &AgentSpec, reason: String) -> AgentOutcome {
    if let Err(e) = store
        .update_status(&spec.node_id, NodeStatus::Failed, Some(reason.clone()))
        .await
    {
        tracing::warn!(node = %spec.node_id, error = %e, "could not mark aborted agent as failed");
    }
    AgentOutcome {
        node_id: spec.node_id.clone(),
        agent_type: spec.agent_type.clone(),
        status: NodeStatus::Failed,
        final_answer: None,
        failure_reason: Some(reason),
        counters: Default::default(),
        findings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, GuardSettings, LlmSection};
    use crate::llm::{ResilientLlm, ScriptedLlmClient};
    use crate::memory::InMemoryConversationCache;
    use crate::react::{Planner, RuntimeLimits};
    use crate::resilience::ResilienceRegistry;
    use crate::tools::{ToolExecutor, ToolRegistry};
    use crate::tree::{
        AgentCheckpoint, CheckpointId, CheckpointKind, InMemoryTreeStore, NodeCounters, StoreError,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 分析节点第一次写 completed 时报存储错误，其余操作照常
    #[derive(Default)]
    struct LossyStore {
        inner: InMemoryTreeStore,
        tripped: AtomicBool,
    }

    #[async_trait]
    impl TreeStore for LossyStore {
        async fn create_node(&self, new: NewNode) -> Result<AgentId, StoreError> {
            self.inner.create_node(new).await
        }

        async fn update_status(
            &self,
            node_id: &str,
            status: NodeStatus,
            note: Option<String>,
        ) -> Result<bool, StoreError> {
            let is_analysis = matches!(
                self.inner.node(node_id).await?,
                Some(n) if n.agent_type == AgentType::Analysis
            );
            if is_analysis && status == NodeStatus::Completed && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.update_status(node_id, status, note).await
        }

        async fn update_counters(&self, node_id: &str, counters: NodeCounters) -> Result<(), StoreError> {
            self.inner.update_counters(node_id, counters).await
        }

        async fn record_checkpoint(
            &self,
            agent_id: &str,
            state: Value,
            kind: CheckpointKind,
            metadata: Value,
        ) -> Result<CheckpointId, StoreError> {
            self.inner.record_checkpoint(agent_id, state, kind, metadata).await
        }

        async fn latest_checkpoint(&self, agent_id: &str) -> Result<Option<AgentCheckpoint>, StoreError> {
            self.inner.latest_checkpoint(agent_id).await
        }

        async fn checkpoints(&self, agent_id: &str) -> Result<Vec<AgentCheckpoint>, StoreError> {
            self.inner.checkpoints(agent_id).await
        }

        async fn node(&self, node_id: &str) -> Result<Option<AgentTreeNode>, StoreError> {
            self.inner.node(node_id).await
        }

        async fn task_nodes(&self, task_id: &str) -> Result<Vec<AgentTreeNode>, StoreError> {
            self.inner.task_nodes(task_id).await
        }
    }

    fn coordinator_over(store: Arc<dyn TreeStore>, llm: ScriptedLlmClient) -> Coordinator {
        let registry = ResilienceRegistry::new(GuardSettings::default());
        let planner = Planner::new(ResilientLlm::new(Arc::new(llm), &registry), &LlmSection::default());
        let runtime = AgentRuntime::new(
            planner,
            Arc::new(ToolExecutor::new(ToolRegistry::new(), Duration::from_secs(5))),
            store,
            Arc::new(InMemoryConversationCache::new()),
            RuntimeLimits::default(),
        );
        Coordinator::new(Arc::new(runtime), &AppConfig::default().coordinator)
    }

    fn node(id: &str, parent: Option<&str>, depth: u32, status: NodeStatus, reason: Option<&str>) -> AgentTreeNode {
        AgentTreeNode {
            id: id.into(),
            parent_id: parent.map(Into::into),
            agent_type: AgentType::Analysis,
            name: id.into(),
            depth,
            task_id: "t".into(),
            status,
            counters: NodeCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_summary: None,
            failure_reason: reason.map(Into::into),
        }
    }

    #[test]
    fn test_status_rollup() {
        let all_done = TreeSummary::from_views(TreeView::build(vec![
            node("r", None, 0, NodeStatus::Completed, None),
            node("a", Some("r"), 1, NodeStatus::Completed, None),
        ]));
        assert_eq!(all_done.status(), TaskStatus::Completed);

        let partial = TreeSummary::from_views(TreeView::build(vec![
            node("r", None, 0, NodeStatus::Completed, None),
            node("a", Some("r"), 1, NodeStatus::Completed, None),
            node("b", Some("r"), 1, NodeStatus::Failed, Some("timeout")),
        ]));
        assert_eq!(partial.status(), TaskStatus::Partial);
        assert_eq!(partial.failures.len(), 1);
        assert_eq!(partial.failures[0].reason, "timeout");

        let root_failed = TreeSummary::from_views(TreeView::build(vec![node(
            "r",
            None,
            0,
            NodeStatus::Failed,
            Some("iteration limit"),
        )]));
        assert_eq!(root_failed.status(), TaskStatus::Failed);
        assert_eq!(TreeSummary::from_views(Vec::new()).status(), TaskStatus::Failed);
    }

    #[test]
    fn test_deepest_failure_per_subtree() {
        let summary = TreeSummary::from_views(TreeView::build(vec![
            node("r", None, 0, NodeStatus::Completed, None),
            node("a", Some("r"), 1, NodeStatus::Failed, Some("upstream")),
            node("v", Some("a"), 2, NodeStatus::Cancelled, Some("cancelled")),
            node("b", Some("r"), 1, NodeStatus::Failed, Some("iteration limit")),
        ]));
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.failures[0].subtree_root, "a");
        assert_eq!(summary.failures[0].agent_id, "v");
        assert_eq!(summary.failures[0].reason, "cancelled");
        assert_eq!(summary.failures[1].reason, "iteration limit");
        assert_eq!(summary.max_depth, 2);
    }

    #[tokio::test]
    async fn test_aborted_agent_is_marked_failed_with_reason() {
        let llm = ScriptedLlmClient::new("mock")
            .with_route(
                "Role: reconnaissance",
                [r#"{"final_answer": {"summary": "api", "risk_areas": [{"name": "sql"}]}}"#],
            )
            .with_route("Risk area: sql", [r#"{"final_answer": {"findings": []}}"#]);
        let store = Arc::new(LossyStore::default());
        let coordinator = coordinator_over(store.clone(), llm);

        let report = coordinator
            .run_task(
                TaskDescriptor::new("/tmp/app", "audit").without_verification(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.status, TaskStatus::Partial);
        assert_eq!(report.tree.failures.len(), 1);
        let failure = &report.tree.failures[0];
        assert_eq!(failure.agent_type, AgentType::Analysis);
        assert!(failure.reason.starts_with("agent run aborted"), "{}", failure.reason);
        assert!(failure.reason.contains("connection reset"));

        let node = store.node(&failure.agent_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
    }
}
