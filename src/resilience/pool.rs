//! LLM 连接池：并发槽位 + 滑动窗口限流 + 执行超时
//!
//! - 并发：`Semaphore` 的 N 个槽位，`acquire` 在 `acquire_timeout` 内等不到槽位返回 `PoolTimeout`；
//!   permit 被 drop 即释放槽位
//! - 限流：每分钟 / 每小时两个滑动窗口，在同一把锁内完成「检查 + 记录」，超限立即返回 `RateLimitExceeded`
//! - 执行超时：`run_with_timeout` 包裹上游调用，超时计数用于观测

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GuardSettings;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// 0 表示不限
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub acquire_timeout: Duration,
    pub execution_timeout: Duration,
}

impl From<&GuardSettings> for PoolConfig {
    fn from(s: &GuardSettings) -> Self {
        Self {
            max_connections: s.max_connections.max(1),
            requests_per_minute: s.requests_per_minute,
            requests_per_hour: s.requests_per_hour,
            acquire_timeout: Duration::from_secs(s.acquire_timeout_secs),
            execution_timeout: Duration::from_secs(s.execution_timeout_secs),
        }
    }
}

/// 准入失败原因
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionError {
    PoolTimeout { waited: Duration },
    RateLimited {
        window: &'static str,
        retry_after: Duration,
    },
    Cancelled,
}

/// 两个滑动窗口，记录准入时间戳
#[derive(Debug, Default)]
struct RateWindows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl RateWindows {
    fn evict(&mut self, now: Instant) {
        while matches!(self.minute.front(), Some(t) if now.duration_since(*t) >= MINUTE) {
            self.minute.pop_front();
        }
        while matches!(self.hour.front(), Some(t) if now.duration_since(*t) >= HOUR) {
            self.hour.pop_front();
        }
    }

    /// 检查并记录一次请求；超限时返回窗口名与需要等待的时长
    fn try_record(
        &mut self,
        now: Instant,
        per_minute: u32,
        per_hour: u32,
    ) -> Result<(), (&'static str, Duration)> {
        self.evict(now);
        if per_minute > 0 && self.minute.len() >= per_minute as usize {
            return Err(("minute", retry_after(self.minute.front(), MINUTE, now)));
        }
        if per_hour > 0 && self.hour.len() >= per_hour as usize {
            return Err(("hour", retry_after(self.hour.front(), HOUR, now)));
        }
        self.minute.push_back(now);
        self.hour.push_back(now);
        Ok(())
    }
}

fn retry_after(oldest: Option<&Instant>, window: Duration, now: Instant) -> Duration {
    let wait = oldest
        .map(|t| (*t + window).saturating_duration_since(now))
        .unwrap_or(window);
    wait.max(Duration::from_millis(1))
}

/// 连接池统计快照
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolStats {
    pub name: String,
    pub active: usize,
    pub max_connections: usize,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub total_requests: u64,
    pub rejected: u64,
    pub timeouts: u64,
}

/// 已准入的槽位；drop 时归还
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct ConnectionPool {
    name: String,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    windows: Mutex<RateWindows>,
    total_requests: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
}

impl ConnectionPool {
    pub fn new(name: &str, config: PoolConfig) -> Self {
        Self {
            name: name.to_string(),
            slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            windows: Mutex::new(RateWindows::default()),
            total_requests: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 先做限流检查（失败立即返回），再在超时内等待空闲槽位
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PoolPermit, AdmissionError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.check_rate()?;

        let started = Instant::now();
        let acquire = self.slots.clone().acquire_owned();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
            res = tokio::time::timeout(self.config.acquire_timeout, acquire) => match res {
                Ok(Ok(permit)) => Ok(PoolPermit { _permit: permit }),
                // 信号量只在池被关闭时报错，按超时处理
                Ok(Err(_)) | Err(_) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    let waited = started.elapsed();
                    tracing::warn!(pool = %self.name, ?waited, "pool admission timed out");
                    Err(AdmissionError::PoolTimeout { waited })
                }
            },
        }
    }

    fn check_rate(&self) -> Result<(), AdmissionError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .try_record(
                now,
                self.config.requests_per_minute,
                self.config.requests_per_hour,
            )
            .map_err(|(window, retry_after)| {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(pool = %self.name, window, ?retry_after, "rate limit exceeded");
                AdmissionError::RateLimited {
                    window,
                    retry_after,
                }
            })
    }

    /// 在执行超时内运行上游调用；超时返回 `Err(超时时长)`
    pub async fn run_with_timeout<F: Future>(&self, fut: F) -> Result<F::Output, Duration> {
        match tokio::time::timeout(self.config.execution_timeout, fut).await {
            Ok(out) => Ok(out),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(self.config.execution_timeout)
            }
        }
    }

    pub fn active(&self) -> usize {
        self.config.max_connections - self.slots.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        let (minute, hour) = {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            windows.evict(Instant::now());
            (windows.minute.len(), windows.hour.len())
        };
        PoolStats {
            name: self.name.clone(),
            active: self.active(),
            max_connections: self.config.max_connections,
            requests_last_minute: minute,
            requests_last_hour: hour,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
