mod resolver;

pub use resolver::{parse_descriptor, CredentialResolver, HttpCredentialResolver};

use crate::config::UpstreamConfig;
use common::{RelayError, Result};

/// 构建访问上游的 HTTP 客户端
///
/// 描述文档获取与链接校验共用同一个客户端，超时来自配置。
pub fn build_http_client(config: &UpstreamConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.request_timeout)
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {}", e)))
}
