//! Agent 运行时：单个 Agent 的 ReAct 主循环
//!
//! 每轮：检查取消 / 墙钟 / 迭代上限 → 迭代边界写自动检查点并持久化对话 → Thinking（调用 LLM）
//! → 解析 → ActingTool（分发工具）→ Observing（截断后写回对话）。
//! 终态（Done / Failed / Cancelled）时写一次 final 检查点（元数据带上终态与说明），再把节点推进到对应状态。
//! 节点已有非 final 检查点时从检查点恢复，继续下一轮；最新检查点已是 final 而节点未终结时，
//! 直接按该检查点补写终态。计数器或检查点写入失败都会让 Agent 以 Failed 结束。

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, AgentPhase, RecoveryAction, RecoveryEngine};
use crate::memory::{ConversationCache, ConversationStore, Message, Role};
use crate::react::events::{EventSink, TaskEventKind};
use crate::react::planner::{parse_llm_output, Planner, PlannerOutput};
use crate::tools::{ToolContext, ToolExecutor};
use crate::tree::{
    AgentCheckpoint, AgentId, AgentStateSnapshot, AgentTreeNode, AgentType, CheckpointKind,
    ConversationRef, NodeCounters, NodeStatus, TaskId, TreeStore,
};

/// 写入节点 result_summary 的最大字符数
const SUMMARY_MAX_CHARS: usize = 2000;

/// 单个 Agent 的运行上限
#[derive(Debug, Clone)]
pub struct RuntimeLimits {
    pub max_iterations: u32,
    pub max_parse_failures: u32,
    pub observation_max_chars: usize,
    pub wall_clock: Duration,
    pub max_backoff: Duration,
    pub max_history: usize,
    pub conversation_ttl: Duration,
}

impl RuntimeLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.agent.max_iterations,
            max_parse_failures: config.agent.max_parse_failures,
            observation_max_chars: config.agent.observation_max_chars,
            wall_clock: config.agent_wall_clock(),
            max_backoff: Duration::from_secs(config.agent.max_backoff_secs),
            max_history: config.conversation.max_history,
            conversation_ttl: Duration::from_secs(config.conversation.ttl_secs),
        }
    }
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 一次 Agent 运行的输入；节点须已在树中创建
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub node_id: AgentId,
    pub task_id: TaskId,
    /// 对话缓存的会话维度，一般取任务 id
    pub session_id: String,
    pub agent_type: AgentType,
    /// 角色指令（system prompt 的开头）
    pub instructions: String,
    /// 首条 user 消息
    pub input: String,
    /// None 表示可用全部工具
    pub allowed_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOutcome {
    pub node_id: AgentId,
    pub agent_type: AgentType,
    pub status: NodeStatus,
    pub final_answer: Option<String>,
    pub failure_reason: Option<String>,
    pub counters: NodeCounters,
    /// 最终答案中 `findings` 数组的原始条目
    pub findings: Vec<Value>,
}

impl AgentOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == NodeStatus::Completed
    }
}

/// 循环内的可变状态，检查点即它的快照
struct AgentState {
    iteration: u32,
    counters: NodeCounters,
    findings: Vec<Value>,
    scratch: BTreeMap<String, Value>,
    parse_failures: u32,
    rate_limit_streak: u32,
    phase: AgentPhase,
    conversation: ConversationStore,
}

impl AgentState {
    fn fresh(spec: &AgentSpec, max_history: usize) -> Result<Self, AgentError> {
        let mut conversation = ConversationStore::new(max_history);
        conversation.append(Role::User, spec.input.clone(), None)?;
        let mut scratch = BTreeMap::new();
        scratch.insert("input".to_string(), Value::String(spec.input.clone()));
        Ok(Self {
            iteration: 0,
            counters: NodeCounters::default(),
            findings: Vec::new(),
            scratch,
            parse_failures: 0,
            rate_limit_streak: 0,
            phase: AgentPhase::Idle,
            conversation,
        })
    }

    fn snapshot(&self, spec: &AgentSpec) -> AgentStateSnapshot {
        AgentStateSnapshot {
            iteration: self.iteration,
            conversation: ConversationRef {
                session_id: spec.session_id.clone(),
                agent_id: spec.node_id.clone(),
            },
            findings: self.findings.clone(),
            scratch: self.scratch.clone(),
            tool_calls: self.counters.tool_calls,
            tokens_used: self.counters.tokens_used,
            parse_failures: self.parse_failures,
            phase: self.phase,
        }
    }

    fn sync_counters(&mut self) {
        self.counters.iterations = self.iteration;
        self.counters.findings_count = self.findings.len() as u32;
    }
}

pub struct AgentRuntime {
    planner: Planner,
    tools: Arc<ToolExecutor>,
    store: Arc<dyn TreeStore>,
    cache: Arc<dyn ConversationCache>,
    recovery: RecoveryEngine,
    limits: RuntimeLimits,
}

impl AgentRuntime {
    pub fn new(
        planner: Planner,
        tools: Arc<ToolExecutor>,
        store: Arc<dyn TreeStore>,
        cache: Arc<dyn ConversationCache>,
        limits: RuntimeLimits,
    ) -> Self {
        Self {
            planner,
            tools,
            store,
            cache,
            recovery: RecoveryEngine::new(limits.max_backoff),
            limits,
        }
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// 运行一个 Agent 直到终态
    ///
    /// Agent 自身的失败体现在 `AgentOutcome::status`；只有节点不存在或状态写入失败时返回 Err。
    pub async fn run(
        &self,
        spec: &AgentSpec,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<AgentOutcome, AgentError> {
        let node = self
            .store
            .node(&spec.node_id)
            .await?
            .ok_or_else(|| AgentError::Storage(format!("node {} not found", spec.node_id)))?;

        if node.status.is_terminal() {
            tracing::debug!(node = %node.id, status = %node.status.as_str(), "agent already finished");
            return self.replay_outcome(node).await;
        }

        let latest = self.store.latest_checkpoint(&spec.node_id).await?;
        if let Some(checkpoint) = latest.as_ref().filter(|cp| cp.kind == CheckpointKind::Final) {
            return self.settle_from_final(spec, checkpoint).await;
        }
        let (mut state, resumed) = self.load_state(spec, latest).await?;
        self.store
            .update_status(&spec.node_id, NodeStatus::Running, None)
            .await?;
        tracing::info!(
            node = %spec.node_id,
            agent_type = %spec.agent_type,
            resumed,
            iteration = state.iteration,
            "agent started"
        );

        let deadline = Instant::now() + self.limits.wall_clock;
        let result = self.drive(spec, &mut state, deadline, cancel, events).await;
        self.finish(spec, state, result).await
    }

    async fn drive(
        &self,
        spec: &AgentSpec,
        state: &mut AgentState,
        deadline: Instant,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<String, AgentError> {
        let catalogue = self
            .tools
            .registry()
            .to_schema_json(spec.allowed_tools.as_deref());
        let system = self.planner.system_prompt(&spec.instructions, &catalogue);
        let ctx = ToolContext {
            agent_id: spec.node_id.clone(),
            cancel: cancel.clone(),
        };

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(AgentError::AgentWallClockExceeded(self.limits.wall_clock));
            }
            if state.iteration >= self.limits.max_iterations {
                return Err(AgentError::IterationLimitExceeded(self.limits.max_iterations));
            }
            if state.iteration > 0 {
                self.iteration_boundary(spec, state).await?;
            }

            state.iteration += 1;
            state.phase.advance(AgentPhase::Thinking)?;
            events.emit(
                TaskEventKind::Progress,
                json!({
                    "agentId": spec.node_id,
                    "agentType": spec.agent_type.to_string(),
                    "iteration": state.iteration,
                    "maxIterations": self.limits.max_iterations,
                }),
            );

            let transcript = state.conversation.transcript();
            let completion = match self
                .bounded(self.planner.think(&system, &transcript, cancel), deadline, cancel)
                .await
            {
                Ok(c) => {
                    state.rate_limit_streak = 0;
                    c
                }
                Err(e) => {
                    if matches!(e, AgentError::RateLimitExceeded { .. }) {
                        state.rate_limit_streak += 1;
                    } else {
                        state.rate_limit_streak = 0;
                    }
                    let note = self.recover(&e, state.rate_limit_streak, deadline, cancel).await?;
                    state.phase.advance(AgentPhase::Observing)?;
                    self.observe(state, "llm", &note)?;
                    continue;
                }
            };
            state.counters.tokens_used += completion.usage.total();
            if !completion.content.trim().is_empty() {
                state.conversation.push(
                    Message::new(Role::Assistant, completion.content.trim())
                        .with_token_count(completion.usage.completion_tokens),
                )?;
            }

            match parse_llm_output(&completion.content) {
                Ok(PlannerOutput::FinalAnswer(answer)) => {
                    state.phase.advance(AgentPhase::Done)?;
                    state.findings.extend(reported_findings(&answer));
                    return Ok(answer);
                }
                Ok(PlannerOutput::ToolCall(call)) => {
                    state.phase.advance(AgentPhase::ActingTool)?;
                    state.counters.tool_calls += 1;
                    state
                        .scratch
                        .insert("last_tool".to_string(), Value::String(call.tool.clone()));
                    let dispatched = self
                        .bounded(
                            self.tools.execute(
                                &call.tool,
                                call.args,
                                &ctx,
                                spec.allowed_tools.as_deref(),
                            ),
                            deadline,
                            cancel,
                        )
                        .await;
                    let observation = match dispatched {
                        Ok(result) => {
                            state.parse_failures = 0;
                            result.observation()
                        }
                        Err(e) if e.is_dispatch_error() => {
                            state.parse_failures += 1;
                            if state.parse_failures > self.limits.max_parse_failures {
                                return Err(e);
                            }
                            self.recover(&e, 0, deadline, cancel).await?
                        }
                        Err(e) => self.recover(&e, 0, deadline, cancel).await?,
                    };
                    state.phase.advance(AgentPhase::Observing)?;
                    self.observe(state, &call.tool, &observation)?;
                }
                Err(e) => {
                    state.parse_failures += 1;
                    tracing::debug!(node = %spec.node_id, failures = state.parse_failures, error = %e, "unusable model reply");
                    if state.parse_failures > self.limits.max_parse_failures {
                        return Err(AgentError::MalformedResponse(format!(
                            "{} consecutive unusable replies, last: {e}",
                            state.parse_failures
                        )));
                    }
                    let note = self.recover(&e, 0, deadline, cancel).await?;
                    state.phase.advance(AgentPhase::Observing)?;
                    self.observe(state, "parser", &note)?;
                }
            }
        }
    }

    /// 迭代边界：同步计数器、写自动检查点、持久化对话
    async fn iteration_boundary(&self, spec: &AgentSpec, state: &mut AgentState) -> Result<(), AgentError> {
        state.sync_counters();
        self.store
            .update_counters(&spec.node_id, state.counters)
            .await?;
        self.checkpoint(spec, state, CheckpointKind::Automatic, None).await?;
        self.persist_conversation(spec, state).await;
        Ok(())
    }

    async fn checkpoint(
        &self,
        spec: &AgentSpec,
        state: &AgentState,
        kind: CheckpointKind,
        settled: Option<(NodeStatus, Option<&str>)>,
    ) -> Result<(), AgentError> {
        let blob = serde_json::to_value(state.snapshot(spec))
            .map_err(|e| AgentError::CheckpointWriteFailed(e.to_string()))?;
        let mut metadata = json!({
            "agent_type": spec.agent_type.to_string(),
            "phase": state.phase.as_str(),
        });
        if let Some((status, note)) = settled {
            metadata["status"] = json!(status.as_str());
            metadata["note"] = json!(note);
        }
        let id = self
            .store
            .record_checkpoint(&spec.node_id, blob, kind, metadata)
            .await
            .map_err(|e| AgentError::CheckpointWriteFailed(e.to_string()))?;
        tracing::debug!(node = %spec.node_id, checkpoint = %id, kind = kind.as_str(), iteration = state.iteration, "checkpoint recorded");
        Ok(())
    }

    async fn persist_conversation(&self, spec: &AgentSpec, state: &AgentState) {
        if let Err(e) = state
            .conversation
            .persist(
                &*self.cache,
                &spec.session_id,
                &spec.node_id,
                self.limits.conversation_ttl,
            )
            .await
        {
            tracing::warn!(node = %spec.node_id, error = %e, "failed to persist conversation");
        }
    }

    /// 取消与墙钟截止时间包住一个挂起点；内层自己的超时先于外层返回
    async fn bounded<T, F>(
        &self,
        fut: F,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        tokio::select! {
            biased;
            res = fut => res,
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = sleep_until(deadline) => Err(AgentError::AgentWallClockExceeded(self.limits.wall_clock)),
        }
    }

    /// 按恢复策略处理错误，返回写回对话的观察文本；致命错误原样返回
    async fn recover(
        &self,
        err: &AgentError,
        rate_limit_streak: u32,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        match self.recovery.handle(err, rate_limit_streak) {
            RecoveryAction::Observe(note) => Ok(note),
            RecoveryAction::Backoff { delay, note } => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tracing::warn!(error = %err, ?delay, "backing off before next model call");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                    _ = sleep(delay.min(remaining)) => {}
                }
                Ok(note)
            }
            RecoveryAction::Fail => Err(err.clone()),
        }
    }

    fn observe(&self, state: &mut AgentState, source: &str, text: &str) -> Result<(), AgentError> {
        let text = truncate_observation(text, self.limits.observation_max_chars);
        state.conversation.push(
            Message::new(Role::Tool, text).with_metadata("source", Value::String(source.to_string())),
        )?;
        Ok(())
    }

    async fn load_state(
        &self,
        spec: &AgentSpec,
        latest: Option<AgentCheckpoint>,
    ) -> Result<(AgentState, bool), AgentError> {
        let Some(checkpoint) = latest else {
            return Ok((AgentState::fresh(spec, self.limits.max_history)?, false));
        };
        let snapshot = AgentStateSnapshot::from_checkpoint(&checkpoint)?;
        let restored = ConversationStore::restore(
            &*self.cache,
            &snapshot.conversation.session_id,
            &snapshot.conversation.agent_id,
            self.limits.max_history,
        )
        .await;
        let conversation = match restored {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                tracing::warn!(node = %spec.node_id, "conversation expired, resuming with a fresh transcript");
                resumed_transcript(spec, self.limits.max_history)?
            }
            Err(e) => {
                tracing::warn!(node = %spec.node_id, error = %e, "conversation unreadable, resuming with a fresh transcript");
                resumed_transcript(spec, self.limits.max_history)?
            }
        };

        let state = AgentState {
            iteration: snapshot.iteration,
            counters: NodeCounters {
                iterations: snapshot.iteration,
                tool_calls: snapshot.tool_calls,
                tokens_used: snapshot.tokens_used,
                findings_count: snapshot.findings.len() as u32,
            },
            findings: snapshot.findings,
            scratch: snapshot.scratch,
            parse_failures: snapshot.parse_failures,
            rate_limit_streak: 0,
            phase: if snapshot.phase == AgentPhase::Idle {
                AgentPhase::Idle
            } else {
                AgentPhase::Observing
            },
            conversation,
        };
        Ok((state, true))
    }

    async fn finish(
        &self,
        spec: &AgentSpec,
        mut state: AgentState,
        result: Result<String, AgentError>,
    ) -> Result<AgentOutcome, AgentError> {
        let (mut status, mut final_answer, mut reason) = match result {
            Ok(answer) => (NodeStatus::Completed, Some(answer), None),
            Err(AgentError::Cancelled) => {
                (NodeStatus::Cancelled, None, Some(AgentError::Cancelled.failure_reason()))
            }
            Err(e) => (NodeStatus::Failed, None, Some(e.failure_reason())),
        };

        // 节点计数器与最终检查点的迭代数必须一致，写不进去就不能算完成
        state.sync_counters();
        if let Err(e) = self
            .store
            .update_counters(&spec.node_id, state.counters)
            .await
        {
            tracing::error!(node = %spec.node_id, error = %e, "counter write failed");
            status = NodeStatus::Failed;
            final_answer = None;
            reason = Some(AgentError::from(e).failure_reason());
        }

        let target = match status {
            NodeStatus::Completed => AgentPhase::Done,
            NodeStatus::Cancelled => AgentPhase::Cancelled,
            _ => AgentPhase::Failed,
        };
        if state.phase.can_transition_to(target) {
            state.phase = target;
        }

        let note = settle_note(status, final_answer.as_deref(), reason.as_deref());
        if let Err(e) = self
            .checkpoint(spec, &state, CheckpointKind::Final, Some((status, note.as_deref())))
            .await
        {
            tracing::error!(node = %spec.node_id, error = %e, "final checkpoint failed");
            status = NodeStatus::Failed;
            final_answer = None;
            reason = Some(e.failure_reason());
        }
        self.persist_conversation(spec, &state).await;

        let note = settle_note(status, final_answer.as_deref(), reason.as_deref());
        self.store
            .update_status(&spec.node_id, status, note)
            .await?;

        tracing::info!(
            node = %spec.node_id,
            agent_type = %spec.agent_type,
            status = status.as_str(),
            iterations = state.counters.iterations,
            tool_calls = state.counters.tool_calls,
            tokens = state.counters.tokens_used,
            reason = reason.as_deref().unwrap_or(""),
            "agent finished"
        );

        Ok(AgentOutcome {
            node_id: spec.node_id.clone(),
            agent_type: spec.agent_type.clone(),
            status,
            final_answer,
            failure_reason: reason,
            counters: state.counters,
            findings: state.findings,
        })
    }

    /// 最终检查点已落盘但节点状态没来得及写（写完检查点后进程退出）：
    /// 按检查点补写计数器与终态，不调用模型，也不再写检查点
    async fn settle_from_final(
        &self,
        spec: &AgentSpec,
        checkpoint: &AgentCheckpoint,
    ) -> Result<AgentOutcome, AgentError> {
        let snapshot = AgentStateSnapshot::from_checkpoint(checkpoint)?;
        let status = checkpoint
            .metadata
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<NodeStatus>().ok())
            .filter(|s| s.is_terminal())
            .unwrap_or(match snapshot.phase {
                AgentPhase::Done => NodeStatus::Completed,
                AgentPhase::Cancelled => NodeStatus::Cancelled,
                _ => NodeStatus::Failed,
            });
        let note = checkpoint
            .metadata
            .get("note")
            .and_then(Value::as_str)
            .map(str::to_string);
        let counters = NodeCounters {
            iterations: snapshot.iteration,
            tool_calls: snapshot.tool_calls,
            tokens_used: snapshot.tokens_used,
            findings_count: snapshot.findings.len() as u32,
        };

        self.store
            .update_counters(&spec.node_id, counters)
            .await?;
        self.store
            .update_status(&spec.node_id, status, note.clone())
            .await?;
        tracing::info!(
            node = %spec.node_id,
            agent_type = %spec.agent_type,
            status = status.as_str(),
            iterations = counters.iterations,
            "agent settled from final checkpoint"
        );

        let (final_answer, failure_reason) = if status == NodeStatus::Completed {
            (note, None)
        } else {
            (None, Some(note.unwrap_or_else(|| "interrupted".to_string())))
        };
        Ok(AgentOutcome {
            node_id: spec.node_id.clone(),
            agent_type: spec.agent_type.clone(),
            status,
            final_answer,
            failure_reason,
            counters,
            findings: snapshot.findings,
        })
    }

    /// 已终态节点：不再运行、不再写检查点，只按存储内容重建结果
    async fn replay_outcome(&self, node: AgentTreeNode) -> Result<AgentOutcome, AgentError> {
        let findings = match self.store.latest_checkpoint(&node.id).await? {
            Some(cp) => AgentStateSnapshot::from_checkpoint(&cp)
                .map(|s| s.findings)
                .unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(AgentOutcome {
            node_id: node.id,
            agent_type: node.agent_type,
            status: node.status,
            final_answer: node.result_summary,
            failure_reason: node.failure_reason,
            counters: node.counters,
            findings,
        })
    }
}

/// 写入节点的说明：完成时为答案摘要，否则为失败原因
fn settle_note(status: NodeStatus, final_answer: Option<&str>, reason: Option<&str>) -> Option<String> {
    match status {
        NodeStatus::Completed => final_answer.map(summary_text),
        _ => reason.map(str::to_string),
    }
}

fn resumed_transcript(spec: &AgentSpec, max_history: usize) -> Result<ConversationStore, AgentError> {
    let mut conversation = ConversationStore::new(max_history);
    conversation.append(Role::User, spec.input.clone(), None)?;
    conversation.append(
        Role::User,
        "The run was interrupted and resumed; earlier steps are no longer in the transcript. Continue the task.",
        None,
    )?;
    Ok(conversation)
}

/// 超过上限的观察截断并附上被截掉的字符数
pub fn truncate_observation(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...[truncated {} chars]", total - max_chars)
}

fn summary_text(answer: &str) -> String {
    if answer.chars().count() > SUMMARY_MAX_CHARS {
        format!("{}...", answer.chars().take(SUMMARY_MAX_CHARS).collect::<String>())
    } else {
        answer.to_string()
    }
}

/// 最终答案里的 findings：`{"findings": [...]}` 或直接是数组；纯文本没有
pub fn reported_findings(answer: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(answer.trim()) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(mut obj)) => match obj.remove("findings") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
