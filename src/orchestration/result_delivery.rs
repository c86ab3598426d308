//! Outbound delivery of a finalized batch's export.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::state_machine::BatchState;

/// JSON body posted to the callback endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPayload {
    pub batch_id: Uuid,
    pub status: BatchState,
    pub file_name: String,
    pub content_type: String,
    /// The export CSV itself
    pub artifact: String,
    /// Where the export was persisted, when persisting succeeded
    pub artifact_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// No delivery target configured
    Skipped,
    Failed(String),
}

#[async_trait]
pub trait ResultDelivery: Send + Sync + std::fmt::Debug {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct HttpCallbackDelivery {
    client: Client,
    callback_url: String,
}

impl HttpCallbackDelivery {
    pub fn new(client: Client, callback_url: impl Into<String>) -> Self {
        Self {
            client,
            callback_url: callback_url.into(),
        }
    }

    /// `None` when no callback URL is configured
    pub fn from_config(config: &DeliveryConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(url) = &config.callback_url else {
            return Ok(None);
        };
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Some(Self::new(client, url.clone())))
    }
}

#[async_trait]
impl ResultDelivery for HttpCallbackDelivery {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.callback_url)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            batch_uuid = %payload.batch_id,
            callback_url = %self.callback_url,
            "📨 Export delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            batch_id: Uuid::new_v4(),
            status: BatchState::Completed,
            file_name: "export.csv".to_string(),
            content_type: "text/csv".to_string(),
            artifact: "S. No.,Product Name,Input Image Urls,Output Image Urls\n".to_string(),
            artifact_url: None,
        }
    }

    #[tokio::test]
    async fn test_posts_json_payload() {
        let server = MockServer::start().await;
        let payload = payload();
        Mock::given(method("POST"))
            .and(path("/callback"))
            .and(body_partial_json(serde_json::json!({
                "batch_id": payload.batch_id,
                "status": "completed",
                "file_name": "export.csv",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let delivery =
            HttpCallbackDelivery::new(Client::new(), format!("{}/callback", server.uri()));
        delivery.deliver(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_response_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let delivery = HttpCallbackDelivery::new(Client::new(), server.uri());
        let err = delivery.deliver(&payload()).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Status {
                status: 503,
                body: "down".to_string()
            }
        );
    }

    #[test]
    fn test_no_callback_configured() {
        let config = DeliveryConfig::default();
        assert!(HttpCallbackDelivery::from_config(&config).unwrap().is_none());
    }
}
