use async_trait::async_trait;
use common::{ChannelDescriptor, RelayError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 凭证解析器
///
/// 根据频道名称获取上游播放地址及访问所需的请求头。不做内部重试。
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, channel_name: &str) -> Result<ChannelDescriptor>;
}

/// 从远程描述文档解析凭证
pub struct HttpCredentialResolver {
    client: reqwest::Client,
    descriptor_url: String,
}

impl HttpCredentialResolver {
    pub fn new(client: reqwest::Client, descriptor_url: impl Into<String>) -> Self {
        Self {
            client,
            descriptor_url: descriptor_url.into(),
        }
    }

    async fn fetch_document(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.descriptor_url)
            .send()
            .await
            .map_err(|e| RelayError::Fetch(format!("{}: {}", self.descriptor_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Fetch(format!(
                "{} returned status {}",
                self.descriptor_url, status
            )));
        }

        response
            .text()
            .await
            .map_err(|e| RelayError::Fetch(format!("Failed to read descriptor body: {}", e)))
    }
}

#[async_trait]
impl CredentialResolver for HttpCredentialResolver {
    async fn resolve(&self, channel_name: &str) -> Result<ChannelDescriptor> {
        info!("Fetching channel descriptor from {}", self.descriptor_url);

        let body = self.fetch_document().await?;
        debug!("Descriptor document: {} bytes", body.len());

        let descriptor = parse_descriptor(&body, channel_name)?;
        info!("✓ Channel link: {}", descriptor.playback_url);
        debug!("✓ Channel headers: {:?}", descriptor.headers.keys().collect::<Vec<_>>());

        Ok(descriptor)
    }
}

/// 描述文档顶层结构
#[derive(Deserialize)]
struct DescriptorDocument {
    channels: Vec<serde_json::Value>,
}

/// 单个频道条目
#[derive(Deserialize)]
struct ChannelEntry {
    name: String,
    link: String,
    headers: BTreeMap<String, String>,
}

/// 解析描述文档并查找名称完全匹配的频道
///
/// 只对匹配的条目做严格解析，其他条目格式不影响结果。
pub fn parse_descriptor(body: &str, channel_name: &str) -> Result<ChannelDescriptor> {
    let document: DescriptorDocument = serde_json::from_str(body)
        .map_err(|e| RelayError::Parse(format!("Malformed descriptor document: {}", e)))?;

    let raw = document
        .channels
        .into_iter()
        .find(|entry| entry.get("name").and_then(|n| n.as_str()) == Some(channel_name))
        .ok_or_else(|| RelayError::NotFound(channel_name.to_string()))?;

    let entry: ChannelEntry = serde_json::from_value(raw)
        .map_err(|e| RelayError::Parse(format!("Malformed entry for '{}': {}", channel_name, e)))?;

    let descriptor = ChannelDescriptor {
        identifier: entry.name,
        playback_url: entry.link,
        headers: entry.headers,
    };

    let missing = descriptor.missing_required_headers();
    if !missing.is_empty() {
        return Err(RelayError::Parse(format!(
            "Entry for '{}' is missing required headers: {}",
            channel_name,
            missing.join(", ")
        )));
    }

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCUMENT: &str = r#"{
        "channels": [
            {
                "name": "T Sports Live 01",
                "link": "https://u/x.m3u8",
                "headers": { "Cookie": "c", "Host": "h", "User-Agent": "a" }
            },
            {
                "name": "T Sports Live 02",
                "link": "https://u/y.m3u8",
                "headers": { "Cookie": "c2", "Host": "h2", "User-agent": "a2", "Referer": "r" }
            },
            { "name": 42 }
        ]
    }"#;

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_returns_entry_unchanged() {
        let descriptor = parse_descriptor(DOCUMENT, "T Sports Live 01").unwrap();
        assert_eq!(descriptor.identifier, "T Sports Live 01");
        assert_eq!(descriptor.playback_url, "https://u/x.m3u8");
        assert_eq!(descriptor.headers.len(), 3);
        assert_eq!(descriptor.headers["Cookie"], "c");
        assert_eq!(descriptor.headers["Host"], "h");
        assert_eq!(descriptor.headers["User-Agent"], "a");
    }

    #[test]
    fn test_parse_keeps_optional_headers_and_spelling() {
        let descriptor = parse_descriptor(DOCUMENT, "T Sports Live 02").unwrap();
        assert_eq!(descriptor.headers["User-agent"], "a2");
        assert_eq!(descriptor.headers["Referer"], "r");
        assert!(!descriptor.headers.contains_key("User-Agent"));
    }

    #[test]
    fn test_name_match_is_exact() {
        for name in ["t sports live 01", "T Sports Live 0", "T Sports Live 01 ", ""] {
            let err = parse_descriptor(DOCUMENT, name).unwrap_err();
            assert!(matches!(err, RelayError::NotFound(ref n) if n == name));
        }
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        for body in ["not json", "{}", r#"{"channels": {}}"#, "[1,2,3]"] {
            let err = parse_descriptor(body, "T Sports Live 01").unwrap_err();
            assert!(matches!(err, RelayError::Parse(_)), "body: {}", body);
        }
    }

    #[test]
    fn test_entry_missing_required_header_is_parse_error() {
        let body = r#"{"channels":[{"name":"A","link":"https://u/a.m3u8","headers":{"Cookie":"c"}}]}"#;
        let err = parse_descriptor(body, "A").unwrap_err();
        match err {
            RelayError::Parse(msg) => {
                assert!(msg.contains("Host"));
                assert!(msg.contains("User-Agent"));
            }
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_entry_without_link_is_parse_error() {
        let body = r#"{"channels":[{"name":"A","headers":{}}]}"#;
        assert!(matches!(parse_descriptor(body, "A"), Err(RelayError::Parse(_))));
    }

    #[tokio::test]
    async fn test_resolve_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/descriptor.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DOCUMENT))
            .expect(1)
            .mount(&server)
            .await;

        let resolver =
            HttpCredentialResolver::new(client(), format!("{}/descriptor.json", server.uri()));
        let descriptor = resolver.resolve("T Sports Live 01").await.unwrap();
        assert_eq!(descriptor.playback_url, "https://u/x.m3u8");
    }

    #[tokio::test]
    async fn test_resolve_non_success_status_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let resolver = HttpCredentialResolver::new(client(), server.uri());
        let err = resolver.resolve("T Sports Live 01").await.unwrap_err();
        assert!(matches!(err, RelayError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_resolve_timeout_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(DOCUMENT)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let resolver = HttpCredentialResolver::new(client, server.uri());
        let err = resolver.resolve("T Sports Live 01").await.unwrap_err();
        assert!(matches!(err, RelayError::Fetch(_)));
    }
}
