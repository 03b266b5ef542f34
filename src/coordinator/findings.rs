//! 发现项：从 Agent 最终答案中宽松提取，去重，并合并验证结果
//!
//! 模型给出的字段名和严重程度写法不统一，提取时尽量接受常见变体，缺失字段给默认值。

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::react::AgentOutcome;
use crate::tools::FindingDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// 未识别的写法按 medium 处理
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" | "crit" | "p0" | "blocker" => Severity::Critical,
            "high" | "severe" | "major" | "p1" => Severity::High,
            "low" | "minor" | "p3" => Severity::Low,
            "info" | "informational" | "note" | "none" => Severity::Info,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub title: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// 复现方式，验证 Agent 交给沙箱执行
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reproduction: Option<Value>,
    /// None：未验证（关闭验证、沙箱不可用或验证 Agent 失败）
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_evidence: Option<String>,
    /// 产出该发现的 Agent 节点
    pub source_agent: String,
}

fn str_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// 单条 JSON → Finding；字符串条目视为标题，没有标题的对象丢弃
pub fn finding_from_value(value: &Value, source_agent: &str, index: usize) -> Option<Finding> {
    let short: String = source_agent.chars().take(8).collect();
    let id = format!("F-{short}-{}", index + 1);
    match value {
        Value::String(title) if !title.trim().is_empty() => Some(Finding {
            id,
            title: title.trim().to_string(),
            severity: Severity::Medium,
            category: None,
            file: None,
            line: None,
            description: title.trim().to_string(),
            evidence: None,
            reproduction: None,
            verified: None,
            verification_evidence: None,
            source_agent: source_agent.to_string(),
        }),
        Value::Object(obj) => {
            let title = str_field(obj, &["title", "name", "summary", "issue"])?;
            let line = obj
                .get("line")
                .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                .and_then(|n| u32::try_from(n).ok());
            Some(Finding {
                id,
                severity: str_field(obj, &["severity", "risk", "level"])
                    .map(|s| Severity::parse_lenient(&s))
                    .unwrap_or(Severity::Medium),
                category: str_field(obj, &["category", "type", "cwe"]),
                file: str_field(obj, &["file", "path", "location"]),
                line,
                description: str_field(obj, &["description", "details", "detail"])
                    .unwrap_or_else(|| title.clone()),
                evidence: str_field(obj, &["evidence", "snippet", "code"]),
                reproduction: obj
                    .get("reproduction")
                    .or_else(|| obj.get("poc"))
                    .filter(|v| !v.is_null())
                    .cloned(),
                verified: None,
                verification_evidence: None,
                source_agent: source_agent.to_string(),
                title,
            })
        }
        _ => None,
    }
}

/// 已完成 Agent 的发现项
pub fn collect_findings(outcome: &AgentOutcome) -> Vec<Finding> {
    outcome
        .findings
        .iter()
        .enumerate()
        .filter_map(|(i, v)| finding_from_value(v, &outcome.node_id, i))
        .collect()
}

/// 同一文件同一行同一标题只保留第一条
pub fn dedupe(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen = HashSet::new();
    findings
        .into_iter()
        .filter(|f| {
            seen.insert((
                f.file.clone().unwrap_or_default(),
                f.line,
                f.title.to_lowercase(),
            ))
        })
        .collect()
}

/// 严重程度从高到低，同级保持原顺序
pub fn sort_by_severity(findings: &mut [Finding]) {
    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
}

impl Finding {
    /// 交给 verify_finding 工具的描述；复现信息不足时返回 None
    pub fn descriptor(&self) -> Option<FindingDescriptor> {
        let mut repro = match self.reproduction.clone()? {
            Value::String(command) => serde_json::json!({ "command": command }),
            Value::Object(obj) => Value::Object(obj),
            _ => return None,
        };
        if let Value::Object(obj) = &mut repro {
            obj.insert("id".into(), Value::String(self.id.clone()));
            obj.insert("title".into(), Value::String(self.title.clone()));
        }
        serde_json::from_value(repro).ok()
    }

    /// 合并验证 Agent 的结论：`{"verified": bool, "evidence": ...}`
    pub fn apply_verification(&mut self, outcome: &AgentOutcome) {
        if !outcome.is_completed() {
            return;
        }
        let Some(answer) = outcome.final_answer.as_deref() else {
            return;
        };
        match serde_json::from_str::<Value>(answer.trim()) {
            Ok(Value::Object(obj)) => {
                self.verified = obj.get("verified").and_then(Value::as_bool);
                self.verification_evidence = str_field(&obj, &["evidence", "reason", "summary"]);
            }
            _ => {
                let lower = answer.to_lowercase();
                if lower.contains("not verified") || lower.contains("could not reproduce") {
                    self.verified = Some(false);
                } else if lower.contains("verified") || lower.contains("reproduced") {
                    self.verified = Some(true);
                }
                self.verification_evidence = Some(answer.to_string());
            }
        }
    }
}
