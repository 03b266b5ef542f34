//! Hive - 多智能体代码审计编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、Agent 阶段状态机、优雅关闭、组件构建
//! - **coordinator**: 审计任务协调（侦察 → 分析 → 验证）与发现项汇总
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）及弹性封装
//! - **memory**: Agent 对话历史与带 TTL 的对话缓存
//! - **observability**: 日志初始化
//! - **react**: Planner、ReAct 主循环（Agent 运行时）、任务事件
//! - **resilience**: 连接池、限流、熔断与超时分层
//! - **tools**: 工具注册表与执行器、代码检查工具、沙箱工具
//! - **tree**: Agent 树与检查点存储

pub mod config;
pub mod coordinator;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod resilience;
pub mod tools;
pub mod tree;
