//! 工具层：注册表、执行器、代码检查工具与沙箱工具

pub mod code_grep;
pub mod code_read;
pub mod executor;
pub mod registry;
pub mod sandbox;
pub mod sandbox_tools;
pub mod schema;

pub use code_grep::CodeGrepTool;
pub use code_read::CodeReadTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolContext, ToolRegistry, ToolResult};
pub use sandbox::{
    DockerBackend, ExecOutput, FindingDescriptor, HttpRequest, HttpResponse, IsolationBackend,
    ResourceLimits, SandboxError, SandboxExecutor, Verification,
};
pub use sandbox_tools::{HttpProbeTool, SandboxExecTool, SandboxHandle, VerifyFindingTool};
pub use schema::tool_call_schema_json;
