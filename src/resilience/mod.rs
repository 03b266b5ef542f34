//! LLM / 外部依赖弹性层：连接池、滑动窗口限流、熔断、执行超时

pub mod breaker;
pub mod guard;
pub mod pool;
pub mod registry;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use guard::{GuardSnapshot, ResilienceError, ResilienceGuard};
pub use pool::{ConnectionPool, PoolConfig, PoolPermit, PoolStats};
pub use registry::ResilienceRegistry;
