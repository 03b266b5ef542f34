//! Hive - 对一个代码目录运行一次多智能体安全审计
//!
//! 用法：`hive <target-dir> [--config <path>] [--objective <text>] [--no-verify]`
//! 报告以 JSON 打印到 stdout，日志与任务事件写到 stderr。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::coordinator::TaskDescriptor;
use hive::core::{AuditBuilder, ShutdownManager};
use hive::observability;

#[derive(Debug, Parser)]
#[command(name = "hive")]
#[command(version, about = "Multi-agent security audit of a source directory")]
struct Args {
    /// Directory to audit
    target: PathBuf,

    /// Extra config file layered over config/default.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// What the audit should look for
    #[arg(
        long,
        env = "HIVE_OBJECTIVE",
        default_value = "Find exploitable security weaknesses"
    )]
    objective: String,

    /// Skip the sandbox verification phase
    #[arg(long)]
    no_verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let args = Args::parse();
    let target = args
        .target
        .canonicalize()
        .with_context(|| format!("audit target {} not found", args.target.display()))?;

    let config = load_config(args.config).context("Failed to load config")?;
    let components = AuditBuilder::new(config, &target)
        .build()
        .await
        .context("Failed to build audit components")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::info!(target: "hive::events", "{line}");
            }
        }
    });

    let mut task = TaskDescriptor::new(target, args.objective);
    if args.no_verify {
        task = task.without_verification();
    }
    let report = components
        .coordinator
        .run_task(task, &shutdown.child_token(), Some(event_tx))
        .await
        .context("Audit task failed")?;
    let _ = printer.await;

    if shutdown.is_shutdown() {
        tracing::warn!(status = ?report.status, "audit interrupted, report is incomplete");
    }
    observability::log_resilience_state(&components.resilience);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_flags() {
        let args = Args::try_parse_from([
            "hive",
            "./repo",
            "--config",
            "audit.toml",
            "--objective",
            "find sqli",
            "--no-verify",
        ])
        .unwrap();
        assert_eq!(args.target, PathBuf::from("./repo"));
        assert_eq!(args.config, Some(PathBuf::from("audit.toml")));
        assert_eq!(args.objective, "find sqli");
        assert!(args.no_verify);
    }

    #[test]
    fn test_args_require_target() {
        assert!(Args::try_parse_from(["hive", "--no-verify"]).is_err());
        let args = Args::try_parse_from(["hive", "src"]).unwrap();
        assert!(!args.no_verify);
        assert!(args.config.is_none());
    }
}
