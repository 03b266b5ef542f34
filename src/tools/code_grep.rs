//! 代码搜索工具：在审计目标中按字面量或正则搜索，可用 glob 过滤文件名

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::code_read::resolve_within;
use crate::tools::schema::{parameters_schema_for, typed_args};
use crate::tools::{Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CodeGrepArgs {
    /// 搜索模式
    pub pattern: String,
    /// 搜索路径（相对审计根目录），默认根目录
    pub path: Option<String>,
    /// 文件名 glob，如 "*.rs"
    pub include: Option<String>,
    /// 是否按正则解释 pattern
    pub use_regex: Option<bool>,
}

enum Matcher {
    Literal(String),
    Regex(Regex),
}

impl Matcher {
    fn is_match(&self, line: &str) -> bool {
        match self {
            Matcher::Literal(p) => line.contains(p.as_str()),
            Matcher::Regex(re) => re.is_match(line),
        }
    }
}

struct SearchResult {
    file_path: PathBuf,
    matches: Vec<(usize, String)>,
}

pub struct CodeGrepTool {
    allowed_root: PathBuf,
    max_results: usize,
    max_file_size: u64,
}

impl CodeGrepTool {
    pub fn new(allowed_root: impl AsRef<Path>) -> Self {
        Self {
            allowed_root: allowed_root.as_ref().to_path_buf(),
            max_results: 50,
            max_file_size: 1024 * 1024,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    fn search_in_file(&self, file_path: &Path, matcher: &Matcher) -> Vec<(usize, String)> {
        // 二进制或非 UTF-8 文件直接跳过
        let Ok(content) = std::fs::read_to_string(file_path) else {
            return Vec::new();
        };
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| matcher.is_match(line))
            .map(|(i, line)| (i + 1, line.to_string()))
            .collect()
    }

    fn search_recursive(
        &self,
        dir: &Path,
        matcher: &Matcher,
        include: Option<&glob::Pattern>,
    ) -> Vec<SearchResult> {
        let mut results = Vec::new();
        let mut total = 0usize;
        for entry in walkdir::WalkDir::new(dir)
            .max_depth(12)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0
                    || (!name.starts_with('.') && name != "target" && name != "node_modules")
            })
            .filter_map(|e| e.ok())
        {
            if total >= self.max_results {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .metadata()
                .map(|m| m.len() > self.max_file_size)
                .unwrap_or(true)
            {
                continue;
            }
            if let Some(pattern) = include {
                let name = entry.file_name().to_string_lossy();
                if !pattern.matches(&name) {
                    continue;
                }
            }
            let matches = self.search_in_file(entry.path(), matcher);
            if !matches.is_empty() {
                total += matches.len();
                results.push(SearchResult {
                    file_path: entry.path().to_path_buf(),
                    matches,
                });
            }
        }
        results
    }

    fn display_path(&self, path: &Path) -> String {
        let root = self
            .allowed_root
            .canonicalize()
            .unwrap_or_else(|_| self.allowed_root.clone());
        path.strip_prefix(&root).unwrap_or(path).display().to_string()
    }
}

#[async_trait]
impl Tool for CodeGrepTool {
    fn name(&self) -> &str {
        "code_grep"
    }

    fn description(&self) -> &str {
        "Search the audit target for a literal string or regex. \
         Args: pattern, path (optional, relative), include (optional glob such as \"*.py\"), use_regex (optional bool)."
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema_for::<CodeGrepArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        let args: CodeGrepArgs = typed_args(args)?;
        let matcher = if args.use_regex.unwrap_or(false) {
            Matcher::Regex(Regex::new(&args.pattern).map_err(|e| format!("Invalid regex pattern: {e}"))?)
        } else {
            Matcher::Literal(args.pattern.clone())
        };
        let include = args
            .include
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| format!("Invalid include glob: {e}"))?;
        let search_path = resolve_within(&self.allowed_root, args.path.as_deref().unwrap_or("."))?;

        let results = if search_path.is_file() {
            let matches = self.search_in_file(&search_path, &matcher);
            if matches.is_empty() {
                Vec::new()
            } else {
                vec![SearchResult {
                    file_path: search_path,
                    matches,
                }]
            }
        } else {
            self.search_recursive(&search_path, &matcher, include.as_ref())
        };

        if results.is_empty() {
            return Ok(format!("No matches found for pattern '{}'", args.pattern));
        }

        let mut output = format!(
            "Found {} matches for pattern '{}'\n{}\n",
            results.iter().map(|r| r.matches.len()).sum::<usize>(),
            args.pattern,
            "=".repeat(60)
        );
        for result in results {
            output.push_str(&format!("\n{}:\n", self.display_path(&result.file_path)));
            for (line_num, line) in result.matches.iter().take(10) {
                let text: String = line.trim().chars().take(160).collect();
                output.push_str(&format!("  {line_num:4}: {text}\n"));
            }
            if result.matches.len() > 10 {
                output.push_str(&format!("  ... ({} more matches)\n", result.matches.len() - 10));
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(
            dir.path().join("app/db.py"),
            "def find(uid):\n    cursor.execute(\"SELECT * FROM users WHERE id=\" + uid)\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("app/readme.md"), "execute carefully\n").unwrap();
        std::fs::write(dir.path().join(".git/config"), "execute\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_literal_search_with_include() {
        let dir = fixture();
        let tool = CodeGrepTool::new(dir.path());
        let out = tool
            .execute(json!({"pattern": "execute", "include": "*.py"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(out.contains("Found 1 matches"));
        assert!(out.contains("db.py"));
        assert!(!out.contains("readme.md"));
        assert!(!out.contains(".git"));
    }

    #[tokio::test]
    async fn test_regex_search_and_errors() {
        let dir = fixture();
        let tool = CodeGrepTool::new(dir.path());
        let ctx = ToolContext::default();
        let out = tool
            .execute(json!({"pattern": r"WHERE id=\S* \+", "use_regex": true}), &ctx)
            .await
            .unwrap();
        assert!(out.contains("   2:"));

        assert!(tool.execute(json!({"pattern": "(", "use_regex": true}), &ctx).await.is_err());
        assert!(tool.execute(json!({"pattern": "x", "path": "../"}), &ctx).await.is_err());
        let none = tool.execute(json!({"pattern": "zzz_not_here"}), &ctx).await.unwrap();
        assert!(none.starts_with("No matches"));
    }
}
