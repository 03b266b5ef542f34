//! 认知层：Planner、ReAct 主循环（Agent 运行时）与任务事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::{EventSink, TaskEvent, TaskEventKind};
pub use loop_::{truncate_observation, AgentOutcome, AgentRuntime, AgentSpec, RuntimeLimits};
pub use planner::{parse_llm_output, Planner, PlannerOutput, ToolCall};
