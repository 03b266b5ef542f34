//! 弹性调用封装：连接池准入 → 熔断准入 → 带执行超时的上游调用
//!
//! 准入阶段的拒绝（池超时、限流、熔断、取消）不计入熔断失败；
//! 准入之后的上游错误与执行超时计入。

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::GuardSettings;
use crate::resilience::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::resilience::pool::{AdmissionError, ConnectionPool, PoolConfig, PoolStats};

/// 弹性层错误，`E` 为上游错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError<E> {
    #[error("pool '{pool}' admission timed out after {waited:?}")]
    PoolTimeout { pool: String, waited: Duration },

    #[error("rate limit for '{pool}' exceeded (per {window}), retry after {retry_after:?}")]
    RateLimitExceeded {
        pool: String,
        window: &'static str,
        retry_after: Duration,
    },

    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("call through '{pool}' exceeded {after:?}")]
    ExecutionTimeout { pool: String, after: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Upstream(E),
}

/// 单个依赖的池 + 熔断快照
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub pool: PoolStats,
    pub breaker: BreakerSnapshot,
}

pub struct ResilienceGuard {
    name: String,
    pool: ConnectionPool,
    breaker: CircuitBreaker,
}

impl ResilienceGuard {
    pub fn new(name: &str, pool: PoolConfig, breaker: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            pool: ConnectionPool::new(name, pool),
            breaker: CircuitBreaker::new(name, breaker),
        }
    }

    pub fn from_settings(name: &str, settings: &GuardSettings) -> Self {
        Self::new(name, settings.into(), settings.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            pool: self.pool.stats(),
            breaker: self.breaker.snapshot(),
        }
    }

    pub async fn call<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self
            .pool
            .acquire(cancel)
            .await
            .map_err(|e| self.admission_error(e))?;

        self.breaker
            .try_acquire()
            .map_err(|open| ResilienceError::CircuitOpen {
                name: self.name.clone(),
                retry_after: open.retry_after,
            })?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.breaker.on_abandoned();
                Err(ResilienceError::Cancelled)
            }
            res = self.pool.run_with_timeout(f()) => match res {
                Ok(Ok(value)) => {
                    self.breaker.on_success();
                    Ok(value)
                }
                Ok(Err(err)) => {
                    self.breaker.on_failure();
                    Err(ResilienceError::Upstream(err))
                }
                Err(after) => {
                    self.breaker.on_failure();
                    tracing::warn!(dependency = %self.name, ?after, "upstream call timed out");
                    Err(ResilienceError::ExecutionTimeout {
                        pool: self.name.clone(),
                        after,
                    })
                }
            },
        }
    }

    fn admission_error<E>(&self, err: AdmissionError) -> ResilienceError<E> {
        match err {
            AdmissionError::PoolTimeout { waited } => ResilienceError::PoolTimeout {
                pool: self.name.clone(),
                waited,
            },
            AdmissionError::RateLimited {
                window,
                retry_after,
            } => ResilienceError::RateLimitExceeded {
                pool: self.name.clone(),
                window,
                retry_after,
            },
            AdmissionError::Cancelled => ResilienceError::Cancelled,
        }
    }
}
