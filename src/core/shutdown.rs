//! 信号驱动的审计取消
//!
//! 根 CancellationToken 由 ShutdownManager 持有，任务 token 由它派生；Ctrl+C / SIGTERM 取消根 token，
//! 正在运行的 Agent 逐个以 `cancelled` 结束并写入最终检查点，报告照常输出。

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct ShutdownManager {
    root: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 审计任务用的 token；关闭时级联取消
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    fn cancel(&self, signal: &str) {
        tracing::warn!(signal, "cancelling running audit");
        self.root.cancel();
    }

    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.cancel("ctrl-c");
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.cancel("sigterm");
                }
            });
        }
    }
}
