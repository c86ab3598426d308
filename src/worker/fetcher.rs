//! Source image retrieval over HTTP.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use tracing::debug;

use crate::config::FetchConfig;
use crate::error::FetchError;

/// Raw bytes of a source image as served
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError>;
}

/// `reqwest` fetcher with a per-request timeout and a body size cap
#[derive(Debug, Clone)]
pub struct HttpSourceFetcher {
    client: Client,
    max_bytes: u64,
}

impl HttpSourceFetcher {
    pub fn new(client: Client, max_bytes: u64) -> Self {
        Self { client, max_bytes }
    }

    pub fn from_config(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::new(client, config.max_bytes))
    }

    fn classify(url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Unreachable {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };
        if response
            .content_length()
            .is_some_and(|length| length > self.max_bytes)
        {
            return Err(too_large());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Content-Length may be absent or wrong; enforce the cap while streaming
        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Self::classify(url, e))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = body.len(), "📥 Source fetched");
        Ok(FetchedImage {
            bytes: body.freeze(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_bytes: u64) -> HttpSourceFetcher {
        let client = Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        HttpSourceFetcher::new(client, max_bytes)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"image-bytes".to_vec())
                    .insert_header("content-type", "image/png"),
            )
            .mount(&server)
            .await;

        let fetched = fetcher(1024)
            .fetch(&format!("{}/a.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(&fetched.bytes[..], b"image-bytes");
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(1024)
            .fetch(&format!("{}/missing.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let err = fetcher(16)
            .fetch(&format!("{}/big.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 16, .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = fetcher(1024)
            .fetch(&format!("{}/slow.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let err = fetcher(1024)
            .fetch("http://127.0.0.1:1/a.png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unreachable { .. }));
    }
}
