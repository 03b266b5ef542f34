//! 可观测性：tracing 订阅器初始化与弹性层状态日志

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::resilience::ResilienceRegistry;

/// 默认 info，可通过 RUST_LOG 覆盖；日志写到 stderr，stdout 留给报告
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// 把每个依赖的连接池与熔断器状态记一条日志
pub fn log_resilience_state(registry: &ResilienceRegistry) {
    for snap in registry.snapshots() {
        tracing::info!(
            dependency = %snap.pool.name,
            active = snap.pool.active,
            total_requests = snap.pool.total_requests,
            rejected = snap.pool.rejected,
            timeouts = snap.pool.timeouts,
            breaker = ?snap.breaker.state,
            consecutive_failures = snap.breaker.consecutive_failures,
            "resilience state"
        );
    }
}
