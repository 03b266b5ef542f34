//! 代码读取工具：读取审计目标内的文件，返回带行号的文本
//!
//! 路径必须位于审计根目录内（规范化后比较），禁止 `../` 逃逸。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{parameters_schema_for, typed_args};
use crate::tools::{Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CodeReadArgs {
    /// 文件路径（相对审计根目录）
    pub file_path: String,
    /// 起始行号，从 1 开始
    pub offset: Option<usize>,
    /// 最多读取的行数，默认 200
    pub limit: Option<usize>,
}

pub struct CodeReadTool {
    allowed_root: PathBuf,
    max_bytes: usize,
    max_line_length: usize,
}

impl CodeReadTool {
    pub fn new(allowed_root: impl AsRef<Path>) -> Self {
        Self {
            allowed_root: allowed_root.as_ref().to_path_buf(),
            max_bytes: 200 * 1024,
            max_line_length: 500,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn validate_path(&self, file_path: &str) -> Result<PathBuf, String> {
        resolve_within(&self.allowed_root, file_path)
    }

    fn read_file_with_lines(
        &self,
        file_path: &Path,
        offset: usize,
        limit: usize,
    ) -> Result<String, String> {
        let size = std::fs::metadata(file_path)
            .map_err(|e| format!("Failed to stat file: {e}"))?
            .len();
        if size as usize > self.max_bytes {
            return Err(format!(
                "File is {size} bytes, larger than the {} byte read limit; use code_grep to locate the relevant lines",
                self.max_bytes
            ));
        }
        let content =
            std::fs::read_to_string(file_path).map_err(|e| format!("Failed to read file: {e}"))?;

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let shown = self.relative(file_path);
        if offset >= total {
            return Ok(format!(
                "File '{shown}' has {total} lines. Requested offset {} is beyond end.",
                offset + 1
            ));
        }

        let end = (offset + limit).min(total);
        let mut result = format!("File: {shown} (lines {}-{end} of {total})\n", offset + 1);
        result.push_str(&"-".repeat(60));
        result.push('\n');
        for (i, line) in lines[offset..end].iter().enumerate() {
            let text: String = if line.chars().count() > self.max_line_length {
                format!("{}...", line.chars().take(self.max_line_length).collect::<String>())
            } else {
                line.to_string()
            };
            result.push_str(&format!("{:4}: {}\n", offset + i + 1, text));
        }
        if end < total {
            result.push_str(&format!(
                "\n... ({} more lines, use offset={} to continue)\n",
                total - end,
                end + 1
            ));
        }
        Ok(result)
    }

    fn relative(&self, path: &Path) -> String {
        let root = self
            .allowed_root
            .canonicalize()
            .unwrap_or_else(|_| self.allowed_root.clone());
        path.strip_prefix(&root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

/// 把相对路径解析到根目录内；不存在的路径按字面拼接后比较
pub(crate) fn resolve_within(root: &Path, file_path: &str) -> Result<PathBuf, String> {
    let path = Path::new(file_path);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let canonical = absolute.canonicalize().unwrap_or(absolute);
    let root_canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if !canonical.starts_with(&root_canonical)
        || canonical.components().any(|c| c == std::path::Component::ParentDir)
    {
        return Err(format!(
            "Access denied: path '{file_path}' is outside the audit root"
        ));
    }
    Ok(canonical)
}

#[async_trait]
impl Tool for CodeReadTool {
    fn name(&self) -> &str {
        "code_read"
    }

    fn description(&self) -> &str {
        "Read a source file from the audit target and return numbered lines. \
         Args: file_path (relative to the target root), offset (1-based, optional), limit (optional, default 200)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<CodeReadArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let args: CodeReadArgs = typed_args(args)?;
        let path = self.validate_path(&args.file_path)?;
        if !path.is_file() {
            return Err(format!("File not found: {}", args.file_path));
        }
        let offset = args.offset.unwrap_or(1).saturating_sub(1);
        self.read_file_with_lines(&path, offset, args.limit.unwrap_or(200))
    }
}
