use common::{SessionSnapshot, SessionState};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;

use crate::config::AppConfig;

/// manifest 查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ManifestStatus {
    Ready { url: String },
    NotReady { state: SessionState },
}

impl ManifestStatus {
    pub fn url(&self) -> Option<&str> {
        match self {
            ManifestStatus::Ready { url } => Some(url),
            ManifestStatus::NotReady { .. } => None,
        }
    }
}

/// 输出发布器
///
/// 对外给出稳定的 manifest 地址。就绪的前提是当前会话已进入 Running；
/// 开启 `verify_manifest` 时还要求 manifest 文件已写出。
#[derive(Clone)]
pub struct OutputPublisher {
    session: watch::Receiver<SessionSnapshot>,
    manifest_url: String,
    manifest_path: PathBuf,
    output_dir: PathBuf,
    verify_manifest: bool,
}

impl OutputPublisher {
    pub fn new(session: watch::Receiver<SessionSnapshot>, config: &AppConfig) -> Self {
        let base = config.server.base_url();
        let prefix = config.server.hls_prefix.trim_matches('/');
        let manifest_url = format!("{}/{}/{}", base, prefix, config.transcoder.manifest_name);

        Self {
            session,
            manifest_url,
            manifest_path: config
                .transcoder
                .output_dir
                .join(&config.transcoder.manifest_name),
            output_dir: config.transcoder.output_dir.clone(),
            verify_manifest: config.session.verify_manifest,
        }
    }

    /// 当前 manifest 地址；未就绪时返回所处状态，调用方应轮询
    pub async fn current_manifest_url(&self) -> ManifestStatus {
        let (reached_running, state) = {
            let snapshot = self.session.borrow();
            (snapshot.reached_running, snapshot.state)
        };

        if !reached_running {
            return ManifestStatus::NotReady { state };
        }

        // 首个分片写出前 manifest 可能尚不存在
        if self.verify_manifest
            && !tokio::fs::try_exists(&self.manifest_path)
                .await
                .unwrap_or(false)
        {
            return ManifestStatus::NotReady { state };
        }

        ManifestStatus::Ready {
            url: self.manifest_url.clone(),
        }
    }

    /// 固定的 manifest 地址，与就绪状态无关
    pub fn manifest_url(&self) -> &str {
        &self.manifest_url
    }

    pub fn manifest_path(&self) -> &PathBuf {
        &self.manifest_path
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn config(dir: &std::path::Path, verify: bool) -> AppConfig {
        let mut config = AppConfig::default();
        config.transcoder.output_dir = dir.to_path_buf();
        config.session.verify_manifest = verify;
        config
    }

    fn snapshot(state: SessionState, reached_running: bool) -> SessionSnapshot {
        SessionSnapshot {
            session_id: Some(Uuid::new_v4()),
            state,
            reached_running,
            ..SessionSnapshot::idle()
        }
    }

    #[tokio::test]
    async fn test_url_is_stable_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(SessionSnapshot::idle());
        let publisher = OutputPublisher::new(rx, &config(dir.path(), false));
        assert_eq!(publisher.manifest_url(), "http://localhost:8080/hls/stream.m3u8");

        let mut custom = config(dir.path(), false);
        custom.server.public_base_url = Some("http://relay.local:9000/".to_string());
        custom.server.hls_prefix = "/live/".to_string();
        let (_tx, rx) = watch::channel(SessionSnapshot::idle());
        let publisher = OutputPublisher::new(rx, &custom);
        assert_eq!(publisher.manifest_url(), "http://relay.local:9000/live/stream.m3u8");

        let mut moved = config(dir.path(), false);
        moved.apply_overrides(|key| (key == "HLS_RELAY_PORT").then(|| "9191".to_string()));
        let (_tx, rx) = watch::channel(SessionSnapshot::idle());
        let publisher = OutputPublisher::new(rx, &moved);
        assert_eq!(publisher.manifest_url(), "http://localhost:9191/hls/stream.m3u8");
    }

    #[tokio::test]
    async fn test_not_ready_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(SessionSnapshot::idle());
        let publisher = OutputPublisher::new(rx, &config(dir.path(), false));

        for state in [
            SessionState::Idle,
            SessionState::Resolving,
            SessionState::Validating,
            SessionState::Starting,
            SessionState::Failed,
        ] {
            tx.send_replace(snapshot(state, false));
            assert_eq!(
                publisher.current_manifest_url().await,
                ManifestStatus::NotReady { state }
            );
        }
    }

    #[tokio::test]
    async fn test_ready_at_and_after_running() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(SessionSnapshot::idle());
        let publisher = OutputPublisher::new(rx, &config(dir.path(), false));

        for state in [SessionState::Running, SessionState::Stopped, SessionState::Failed] {
            tx.send_replace(snapshot(state, true));
            assert_eq!(
                publisher.current_manifest_url().await.url(),
                Some("http://localhost:8080/hls/stream.m3u8")
            );
        }
    }

    #[tokio::test]
    async fn test_verify_manifest_waits_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(SessionSnapshot::idle());
        let publisher = OutputPublisher::new(rx, &config(dir.path(), true));

        tx.send_replace(snapshot(SessionState::Running, true));
        assert_eq!(
            publisher.current_manifest_url().await,
            ManifestStatus::NotReady {
                state: SessionState::Running
            }
        );

        std::fs::write(dir.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();
        assert!(publisher.current_manifest_url().await.url().is_some());
    }

    #[test]
    fn test_status_serialization() {
        let ready = ManifestStatus::Ready {
            url: "http://localhost:8080/hls/stream.m3u8".to_string(),
        };
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["url"], "http://localhost:8080/hls/stream.m3u8");

        let json = serde_json::to_value(ManifestStatus::NotReady {
            state: SessionState::Validating,
        })
        .unwrap();
        assert_eq!(json["status"], "not_ready");
        assert_eq!(json["state"], "validating");
    }
}
