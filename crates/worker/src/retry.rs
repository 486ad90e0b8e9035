use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use batch_config::RetryConfig;
use batch_errors::BatchError;
use tracing::{error, info, warn};

/// 错误分类：可重试的临时错误 vs 终态错误
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for BatchError {
    fn is_retryable(&self) -> bool {
        BatchError::is_retryable(self)
    }
}

/// 有界重试 + 指数退避
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 总调用次数上限（包含第一次）
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_factor,
            max_delay: Duration::MAX,
            jitter_factor: 0.0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// 第 `attempt` 次失败后的等待时间: initial_delay * backoff_factor^(attempt-1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter_factor <= 0.0 {
            return Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay);
        }

        // 添加随机抖动以避免多个Worker同时重试
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        Duration::try_from_secs_f64((capped + jitter).max(0.0)).unwrap_or(self.max_delay)
    }

    pub async fn retry<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.retry_with_observer(operation, op, |_, _, _| {}).await
    }

    /// 与 `retry` 相同，每次进入退避前回调 `on_retry(attempt, delay, error)`
    pub async fn retry_with_observer<T, E, F, Fut, O>(
        &self,
        operation: &str,
        mut op: F,
        mut on_retry: O,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        O: FnMut(u32, Duration, &E),
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    info!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        "操作 '{}' 第 {}/{} 次尝试成功",
                        operation,
                        attempt,
                        self.max_attempts
                    );
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    error!(
                        operation,
                        attempt,
                        error = %e,
                        "操作 '{}' 遇到不可重试错误: {}",
                        operation,
                        e
                    );
                    return Err(e);
                }
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        operation,
                        attempt,
                        error = %e,
                        "操作 '{}' 在 {} 次尝试后仍然失败: {}",
                        operation,
                        self.max_attempts,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "操作 '{}' 第 {}/{} 次尝试失败，{:?} 后重试",
                        operation,
                        attempt,
                        self.max_attempts,
                        delay
                    );
                    on_retry(attempt, delay, &e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), 2.0)
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));

        let capped = policy.with_max_delay(Duration::from_secs(3));
        assert_eq!(capped.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10), 1.0).with_jitter(0.1);
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1000));
        assert_eq!(policy.backoff_factor, 2.0);
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();
        let start = Instant::now();

        let result = policy()
            .retry_with_observer(
                "flaky",
                |attempt| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if attempt < 3 {
                            Err(BatchError::transient("busy"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                |attempt, delay, _| retries.push((attempt, delay)),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retries,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget_on_persistent_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = 0;

        let result: Result<(), BatchError> = policy()
            .retry_with_observer(
                "always-busy",
                |_| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(BatchError::transient("still busy"))
                    }
                },
                |_, _, _| retries += 1,
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, BatchError::Transient(ref msg) if msg == "still busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<(), BatchError> = policy()
            .retry("corrupt", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BatchError::task_execution("corrupt header"))
                }
            })
            .await;

        assert!(matches!(result, Err(BatchError::TaskExecution(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), BatchError> = RetryPolicy::new(1, Duration::from_secs(5), 2.0)
            .retry("once", |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BatchError::transient("nope"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
