//! 各类 Agent 的角色指令、首条输入与工具权限

use serde_json::Value;

use crate::coordinator::findings::Finding;
use crate::coordinator::TaskDescriptor;
use crate::tree::AgentType;

pub const RECON_INSTRUCTIONS: &str = "# Role: reconnaissance\n\
You map an unfamiliar code base before a security review. Use code_grep and code_read to find \
the languages, frameworks, entry points (HTTP handlers, CLI parsers, message consumers) and the \
places where untrusted input reaches sensitive operations.\n\
Finish with a final_answer object: {\"summary\": string, \"languages\": [string], \
\"entry_points\": [string], \"risk_areas\": [{\"name\": string, \"description\": string, \"files\": [string]}]}.";

pub const ANALYSIS_INSTRUCTIONS: &str = "# Role: analysis\n\
You review one risk area of a code base for exploitable weaknesses. Read the relevant code, follow \
data from its source to its sink and report only issues you can point to in the code.\n\
Finish with a final_answer object: {\"summary\": string, \"findings\": [{\"title\": string, \
\"severity\": \"critical|high|medium|low|info\", \"file\": string, \"line\": number, \
\"description\": string, \"evidence\": string, \"reproduction\": string or {\"command\"|\"http\", \"expect\"}}]}. \
Use an empty findings array when nothing is wrong.";

pub const VERIFICATION_INSTRUCTIONS: &str = "# Role: verification\n\
You try to confirm or refute one candidate finding. Prefer verify_finding with the supplied \
reproduction; fall back to sandbox_exec or reading the code. If the sandbox is unavailable, say so \
and decide from the code alone.\n\
Finish with a final_answer object: {\"verified\": boolean, \"evidence\": string}.";

/// 一次任务最多派生的分析 Agent 数
pub const MAX_RISK_AREAS: usize = 8;

pub fn instructions_for(agent_type: &AgentType) -> String {
    match agent_type {
        AgentType::Recon => RECON_INSTRUCTIONS.to_string(),
        AgentType::Analysis => ANALYSIS_INSTRUCTIONS.to_string(),
        AgentType::Verification => VERIFICATION_INSTRUCTIONS.to_string(),
        AgentType::Custom(name) => format!("# Role: {name}\nComplete the task you are given."),
    }
}

/// 各角色可用的工具；自定义角色不限
pub fn allowed_tools_for(agent_type: &AgentType) -> Option<Vec<String>> {
    let names: &[&str] = match agent_type {
        AgentType::Recon => &["code_read", "code_grep"],
        AgentType::Analysis => &["code_read", "code_grep", "sandbox_exec", "http_probe"],
        AgentType::Verification => &[
            "code_read",
            "code_grep",
            "sandbox_exec",
            "http_probe",
            "verify_finding",
        ],
        AgentType::Custom(_) => return None,
    };
    Some(names.iter().map(|s| s.to_string()).collect())
}

pub fn recon_input(task: &TaskDescriptor) -> String {
    format!(
        "Audit target: {}\nObjective: {}\nMap the code base and list the risk areas worth a closer look.",
        task.target.display(),
        task.objective
    )
}

/// 侦察结论中拆出的一个风险区域
#[derive(Debug, Clone, PartialEq)]
pub struct RiskArea {
    pub name: String,
    pub detail: String,
}

/// 从侦察答案中取 risk_areas；取不到时整段答案作为唯一的区域
pub fn risk_areas(recon_answer: &str) -> Vec<RiskArea> {
    let parsed = serde_json::from_str::<Value>(recon_answer.trim()).ok();
    let areas: Vec<RiskArea> = parsed
        .as_ref()
        .and_then(|v| v.get("risk_areas"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(RiskArea {
                        name: s.trim().to_string(),
                        detail: s.trim().to_string(),
                    }),
                    Value::Object(obj) => {
                        let name = obj.get("name").and_then(Value::as_str)?.trim().to_string();
                        Some(RiskArea {
                            detail: item.to_string(),
                            name,
                        })
                    }
                    _ => None,
                })
                .take(MAX_RISK_AREAS)
                .collect()
        })
        .unwrap_or_default();

    if areas.is_empty() {
        vec![RiskArea {
            name: "general".to_string(),
            detail: recon_answer.to_string(),
        }]
    } else {
        areas
    }
}

pub fn analysis_input(task: &TaskDescriptor, area: &RiskArea, recon_answer: &str) -> String {
    format!(
        "Audit target: {}\nObjective: {}\nRisk area: {}\nArea details: {}\n\nReconnaissance notes:\n{}",
        task.target.display(),
        task.objective,
        area.name,
        area.detail,
        recon_answer
    )
}

pub fn verification_input(task: &TaskDescriptor, finding: &Finding) -> String {
    let candidate = serde_json::to_string_pretty(finding).unwrap_or_else(|_| finding.title.clone());
    let descriptor = finding
        .descriptor()
        .and_then(|d| serde_json::to_string(&d).ok())
        .unwrap_or_else(|| "none supplied".to_string());
    format!(
        "Audit target: {}\nCandidate finding:\n{candidate}\n\nverify_finding arguments: {descriptor}",
        task.target.display()
    )
}
