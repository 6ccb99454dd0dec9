use common::{RelayError, Result, RetryPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// 默认凭证描述文档地址
pub const DEFAULT_DESCRIPTOR_URL: &str =
    "https://raw.githubusercontent.com/byte-capsule/TSports-m3u8-Grabber/main/TSports_m3u8_headers.Json";

/// 默认频道
pub const DEFAULT_CHANNEL: &str = "T Sports Live 01";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 本地服务设置
    pub server: ServerConfig,

    /// 上游凭证与请求设置
    pub upstream: UpstreamConfig,

    /// 转码进程设置
    pub transcoder: TranscoderConfig,

    /// 会话行为
    pub session: SessionConfig,

    /// 自动重试
    pub recovery: RecoveryConfig,

    /// 日志
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 对外公布的基础地址，用于拼接 manifest URL；未设置时为 http://localhost:{port}
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    /// 静态文件路径前缀
    pub hls_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// 凭证描述文档地址
    pub descriptor_url: String,

    /// 要中继的频道名称
    pub channel_name: String,

    /// 单次请求超时
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// 建连超时
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,

    /// HLS 输出目录
    pub output_dir: PathBuf,

    pub manifest_name: String,

    /// 分片文件名模板 (ffmpeg 格式)
    pub segment_pattern: String,

    /// 目标分片时长
    pub segment_duration_secs: u32,

    /// 滚动窗口内保留的分片数
    pub list_size: u32,

    /// SIGTERM 之后等待退出的时间，超时强制结束
    #[serde(with = "duration_ms")]
    pub stop_grace_period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 启动时自动开始中继
    pub auto_start: bool,

    /// 每次启动前清理上一次遗留的分片和 manifest
    pub clean_output_on_start: bool,

    /// 报告就绪前确认 manifest 文件已写出
    pub verify_manifest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// 0 表示不自动重试
    pub max_retries: u32,

    pub strategy: RetryStrategy,

    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,

    #[serde(with = "duration_ms")]
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_base_url: None,
            hls_prefix: "/hls".to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            descriptor_url: DEFAULT_DESCRIPTOR_URL.to_string(),
            channel_name: DEFAULT_CHANNEL.to_string(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            output_dir: PathBuf::from("hls_output"),
            manifest_name: "stream.m3u8".to_string(),
            segment_pattern: "stream_%04d.ts".to_string(),
            segment_duration_secs: 2,
            list_size: 6,
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            clean_output_on_start: true,
            verify_manifest: true,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::Exponential,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// 对外公布的基础地址，不含末尾的 `/`
    pub fn base_url(&self) -> String {
        match &self.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

impl RecoveryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            strategy: self.strategy,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置，文件不存在时写出默认配置
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file {} not found, writing defaults", path.display());
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        debug!("Reading config file {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// 保存配置到文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    RelayError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        tokio::fs::write(path, content)
            .await
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("HLS_RELAY_PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(url) = lookup("HLS_RELAY_DESCRIPTOR_URL") {
            self.upstream.descriptor_url = url;
        }
        if let Some(channel) = lookup("HLS_RELAY_CHANNEL") {
            self.upstream.channel_name = channel;
        }
        if let Some(dir) = lookup("HLS_RELAY_OUTPUT_DIR") {
            self.transcoder.output_dir = PathBuf::from(dir);
        }
        if let Some(ffmpeg) = lookup("HLS_RELAY_FFMPEG") {
            self.transcoder.ffmpeg_path = PathBuf::from(ffmpeg);
        }
        if let Some(level) = lookup("HLS_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(RelayError::Config("Server port must be greater than 0".to_string()));
        }

        if !self.server.hls_prefix.starts_with('/') {
            return Err(RelayError::Config("HLS prefix must start with '/'".to_string()));
        }

        if self.upstream.descriptor_url.trim().is_empty() {
            return Err(RelayError::Config("Descriptor URL cannot be empty".to_string()));
        }

        if self.upstream.channel_name.trim().is_empty() {
            return Err(RelayError::Config("Channel name cannot be empty".to_string()));
        }

        if self.transcoder.manifest_name.trim().is_empty() {
            return Err(RelayError::Config("Manifest name cannot be empty".to_string()));
        }

        if self.transcoder.segment_duration_secs == 0 {
            return Err(RelayError::Config(
                "Segment duration must be greater than 0".to_string(),
            ));
        }

        if self.transcoder.list_size == 0 {
            return Err(RelayError::Config("HLS list size must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// 本地监听地址
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// 以毫秒整数序列化 Duration
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
