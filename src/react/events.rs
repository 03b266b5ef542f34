//! 任务事件：供外部通知层（推送到 UI 等）消费，这里只负责产出
//!
//! 序列化形如 `{"type": "phaseStart", "payload": {...}}`。

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskEventKind {
    Progress,
    PhaseStart,
    PhaseComplete,
    Finding,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    pub payload: Value,
}

/// 可选的事件通道；接收端关闭后发送静默失败
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<TaskEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<TaskEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, kind: TaskEventKind, payload: Value) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TaskEvent { kind, payload });
        }
    }
}

impl From<Option<UnboundedSender<TaskEvent>>> for EventSink {
    fn from(tx: Option<UnboundedSender<TaskEvent>>) -> Self {
        Self { tx }
    }
}
