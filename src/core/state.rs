//! Agent 阶段状态机
//!
//! `Idle → Thinking → ActingTool → Observing → (Thinking | Done | Failed)`，任意非终态均可进入 `Cancelled`。
//! 运行时每次切换阶段都经过 `can_transition_to` 校验。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// ReAct 循环中单个 Agent 的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    Thinking,
    ActingTool,
    Observing,
    Done,
    Failed,
    Cancelled,
}

impl AgentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentPhase::Idle => "idle",
            AgentPhase::Thinking => "thinking",
            AgentPhase::ActingTool => "acting_tool",
            AgentPhase::Observing => "observing",
            AgentPhase::Done => "done",
            AgentPhase::Failed => "failed",
            AgentPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentPhase::Done | AgentPhase::Failed | AgentPhase::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: AgentPhase) -> bool {
        use AgentPhase::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) | (_, Cancelled) => true,
            (Idle, Thinking) => true,
            // 模型调用失败时直接以观察形式回灌
            (Thinking, ActingTool) | (Thinking, Observing) | (Thinking, Done) => true,
            (ActingTool, Observing) => true,
            (Observing, Thinking) => true,
            _ => false,
        }
    }

    /// 校验并切换阶段
    pub fn advance(&mut self, next: AgentPhase) -> Result<(), AgentError> {
        if !self.can_transition_to(next) {
            return Err(AgentError::InvalidPhaseTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut phase = AgentPhase::Idle;
        for next in [
            AgentPhase::Thinking,
            AgentPhase::ActingTool,
            AgentPhase::Observing,
            AgentPhase::Thinking,
            AgentPhase::Done,
        ] {
            phase.advance(next).unwrap();
        }
        assert_eq!(phase, AgentPhase::Done);
    }

    #[test]
    fn test_terminal_phase_is_final() {
        let mut phase = AgentPhase::Done;
        assert!(phase.advance(AgentPhase::Thinking).is_err());
        assert!(!AgentPhase::Failed.can_transition_to(AgentPhase::Cancelled));
    }

    #[test]
    fn test_cannot_skip_thinking() {
        assert!(!AgentPhase::Idle.can_transition_to(AgentPhase::ActingTool));
        assert!(!AgentPhase::Observing.can_transition_to(AgentPhase::Done));
    }

    #[test]
    fn test_cancel_from_any_live_phase() {
        for phase in [
            AgentPhase::Idle,
            AgentPhase::Thinking,
            AgentPhase::ActingTool,
            AgentPhase::Observing,
        ] {
            assert!(phase.can_transition_to(AgentPhase::Cancelled));
        }
    }
}
