use async_trait::async_trait;
use common::ValidationResult;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// 诊断信息最大长度
const DIAGNOSTIC_LIMIT: usize = 512;

/// 链接校验器
///
/// 启动转码前的预检，只用于过滤明显无效的链接；通过校验并不保证转码进程一定能拉流成功。
#[async_trait]
pub trait LinkValidator: Send + Sync {
    async fn validate(&self, url: &str, headers: &BTreeMap<String, String>) -> ValidationResult;
}

/// 基于 HTTP GET 的校验器
pub struct HttpLinkValidator {
    client: reqwest::Client,
}

impl HttpLinkValidator {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LinkValidator for HttpLinkValidator {
    async fn validate(&self, url: &str, headers: &BTreeMap<String, String>) -> ValidationResult {
        let header_map = match build_header_map(headers) {
            Ok(map) => map,
            Err(reason) => {
                warn!("🤧 Invalid upstream headers: {}", reason);
                return ValidationResult::network_failure(reason);
            }
        };

        let response = match self.client.get(url).headers(header_map).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("🤧 M3U8 link is not reachable: {}", e);
                return ValidationResult::network_failure(e.to_string());
            }
        };

        let status = response.status().as_u16();
        let body = read_diagnostic(response).await;

        let result = ValidationResult::from_status(status, body);
        if result.valid {
            info!("😀 M3U8 link and cookies are working (HTTP {})", status);
        } else {
            warn!(
                "🤧 M3U8 link and cookies are not working (HTTP {}): {}",
                status, result.diagnostic_body
            );
        }
        result
    }
}

/// 只读取诊断所需的开头部分，上游可能是持续不断的媒体流
async fn read_diagnostic(mut response: reqwest::Response) -> String {
    let mut body: Vec<u8> = Vec::with_capacity(DIAGNOSTIC_LIMIT + 1);
    while body.len() <= DIAGNOSTIC_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = DIAGNOSTIC_LIMIT + 1 - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            }
            Ok(None) => break,
            Err(e) if body.is_empty() => return format!("<unreadable body: {}>", e),
            Err(_) => break,
        }
    }
    truncate(&String::from_utf8_lossy(&body), DIAGNOSTIC_LIMIT)
}

/// 原样附加描述文档中的请求头
fn build_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("header name '{}': {}", name, e))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| format!("header value for '{}': {}", name, e))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn truncate(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
