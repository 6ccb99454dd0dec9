use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// 上游请求必须携带的头部
pub const REQUIRED_HEADERS: [&str; 3] = ["Cookie", "Host", "User-Agent"];

/// 频道描述
///
/// 由凭证描述文档解析得到，解析后不再修改。每次启动会话都会重新获取。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// 频道名称
    pub identifier: String,
    /// 上游播放地址 (m3u8)
    pub playback_url: String,
    /// 请求头，保持描述文档中的原样（包括名称大小写）
    pub headers: BTreeMap<String, String>,
}

impl ChannelDescriptor {
    /// 按名称查找请求头（忽略大小写）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 返回缺失的必需头部
    pub fn missing_required_headers(&self) -> Vec<&'static str> {
        REQUIRED_HEADERS
            .iter()
            .copied()
            .filter(|name| self.header(name).is_none())
            .collect()
    }
}

/// 链接校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    /// HTTP状态码，网络失败时为空
    pub status: Option<u16>,
    /// 上游返回内容或错误信息，仅用于诊断
    pub diagnostic_body: String,
}

impl ValidationResult {
    pub fn from_status(status: u16, diagnostic_body: String) -> Self {
        Self {
            valid: (200..=299).contains(&status),
            status: Some(status),
            diagnostic_body,
        }
    }

    pub fn network_failure(reason: String) -> Self {
        Self {
            valid: false,
            status: None,
            diagnostic_body: reason,
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Resolving,
    Validating,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl SessionState {
    /// 是否允许发起新的会话
    pub fn accepts_start(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Failed
        )
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Validating => "validating",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话快照，对外展示用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub channel: Option<String>,
    /// 当前会话是否曾进入 Running
    pub reached_running: bool,
    /// 当前会话内的尝试次数（含自动重试）
    pub attempt: u32,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub running_since: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            channel: None,
            reached_running: false,
            attempt: 0,
            pid: None,
            started_at: None,
            running_since: None,
            ended_at: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(headers: &[(&str, &str)]) -> ChannelDescriptor {
        ChannelDescriptor {
            identifier: "T Sports Live 01".to_string(),
            playback_url: "https://u/x.m3u8".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let d = descriptor(&[("Cookie", "c"), ("Host", "h"), ("User-agent", "a")]);
        assert_eq!(d.header("user-agent"), Some("a"));
        assert_eq!(d.header("COOKIE"), Some("c"));
        assert!(d.missing_required_headers().is_empty());
    }

    #[test]
    fn test_missing_required_headers() {
        let d = descriptor(&[("Cookie", "c")]);
        assert_eq!(d.missing_required_headers(), vec!["Host", "User-Agent"]);
    }

    #[test]
    fn test_validation_status_range() {
        assert!(ValidationResult::from_status(200, String::new()).valid);
        assert!(ValidationResult::from_status(299, String::new()).valid);
        assert!(!ValidationResult::from_status(199, String::new()).valid);
        assert!(!ValidationResult::from_status(300, String::new()).valid);
        assert!(!ValidationResult::from_status(403, String::new()).valid);
        assert!(!ValidationResult::network_failure("timeout".into()).valid);
    }

    #[test]
    fn test_state_accepts_start() {
        assert!(SessionState::Idle.accepts_start());
        assert!(SessionState::Stopped.accepts_start());
        assert!(SessionState::Failed.accepts_start());
        assert!(!SessionState::Resolving.accepts_start());
        assert!(!SessionState::Validating.accepts_start());
        assert!(!SessionState::Starting.accepts_start());
        assert!(!SessionState::Running.accepts_start());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
