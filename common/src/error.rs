// HLS 中继服务 - 错误类型定义
//
// 本模块定义了会话生命周期中可能出现的所有错误类型，
// 并提供了重试判断和退避策略。

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::types::SessionState;

/// 中继错误类型
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    // ========== 凭证解析错误 ==========
    /// 描述文档获取失败（网络错误或非成功状态码）
    #[error("Descriptor fetch failed: {0}")]
    Fetch(String),

    /// 描述文档格式错误
    #[error("Descriptor parse error: {0}")]
    Parse(String),

    /// 频道不存在
    #[error("Channel not found: {0}")]
    NotFound(String),

    // ========== 链接校验 ==========
    /// 上游链接校验未通过
    #[error("Link validation failed ({}): {reason}", describe_status(.status))]
    ValidationFailed { status: Option<u16>, reason: String },

    // ========== 转码进程错误 ==========
    /// 转码进程启动失败
    #[error("Transcoder failed to start: {0}")]
    ProcessStart(String),

    /// 转码进程运行时错误
    #[error("Transcoder runtime error: {0}")]
    ProcessRuntime(String),

    // ========== 会话错误 ==========
    /// 已有会话在运行或切换中
    #[error("Session already active (state: {state})")]
    Conflict { state: SessionState },

    /// 启动流程被取消
    #[error("Session start cancelled")]
    Cancelled,

    // ========== 其他错误 ==========
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(String),
}

impl RelayError {
    /// 是否为可重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Fetch(_)
                | RelayError::ValidationFailed { .. }
                | RelayError::ProcessRuntime(_)
        )
    }
}

/// 错误转换：从 std::io::Error
impl From<io::Error> for RelayError {
    fn from(error: io::Error) -> Self {
        RelayError::Io(error.to_string())
    }
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("HTTP {}", code),
        None => "no response".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// 重试退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 立即重试
    Immediate,
    /// 线性退避
    Linear,
    /// 指数退避
    Exponential,
}

/// 会话重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数，0 表示不自动重试
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    /// 基础退避时间
    pub backoff_base: Duration,
    /// 最大退避时间
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryPolicy {
    /// 不自动重试
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::Exponential,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    /// 计算重试延迟
    ///
    /// # 参数
    ///
    /// - `attempt`: 当前重试次数（从0开始）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Immediate => Duration::ZERO,

            RetryStrategy::Linear => {
                let delay = self.backoff_base.saturating_mul(attempt.saturating_add(1));
                delay.min(self.backoff_max)
            }

            RetryStrategy::Exponential => {
                let multiplier = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                let delay = self.backoff_base.saturating_mul(multiplier);
                delay.min(self.backoff_max)
            }
        }
    }

    /// 判断是否应该重试
    pub fn should_retry(&self, error: &RelayError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            strategy,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_error_display() {
        let errors = vec![
            RelayError::Fetch("timeout".to_string()),
            RelayError::NotFound("T Sports Live 01".to_string()),
            RelayError::ValidationFailed { status: Some(403), reason: "forbidden".to_string() },
            RelayError::ValidationFailed { status: None, reason: "dns".to_string() },
            RelayError::Conflict { state: SessionState::Running },
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }

        let err = RelayError::ValidationFailed { status: Some(403), reason: "forbidden".to_string() };
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn test_retry_policy_immediate() {
        let p = policy(RetryStrategy::Immediate);
        assert_eq!(p.calculate_delay(0), Duration::ZERO);
        assert_eq!(p.calculate_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_retry_policy_linear() {
        let p = policy(RetryStrategy::Linear);
        assert_eq!(p.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(p.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(p.calculate_delay(2), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_policy_exponential_capped() {
        let p = policy(RetryStrategy::Exponential);
        assert_eq!(p.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(p.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(p.calculate_delay(2), Duration::from_millis(400));
        // 应该被限制在最大值
        assert_eq!(p.calculate_delay(10), Duration::from_secs(1));
        assert_eq!(p.calculate_delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_should_retry() {
        let p = policy(RetryStrategy::Exponential);

        assert!(p.should_retry(&RelayError::Fetch("reset".into()), 0));
        assert!(p.should_retry(&RelayError::ProcessRuntime("exit 1".into()), 2));
        assert!(p.should_retry(
            &RelayError::ValidationFailed { status: Some(403), reason: String::new() },
            0
        ));

        // 不可重试的错误
        assert!(!p.should_retry(&RelayError::NotFound("x".into()), 0));
        assert!(!p.should_retry(&RelayError::Parse("bad".into()), 0));
        assert!(!p.should_retry(&RelayError::ProcessStart("no ffmpeg".into()), 0));
        assert!(!p.should_retry(&RelayError::Cancelled, 0));

        // 超过最大重试次数
        assert!(!p.should_retry(&RelayError::Fetch("reset".into()), 3));
    }

    #[test]
    fn test_disabled_policy_never_retries() {
        let p = RetryPolicy::disabled();
        assert!(!p.should_retry(&RelayError::Fetch("reset".into()), 0));
    }
}
