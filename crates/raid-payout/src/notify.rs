//! operator notifications for rejections and round summaries

use crate::error::{PayoutError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;
}

/// writes notifications to the log only
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        warn!(target: "raid_payout::operator", "{}", text);
        Ok(())
    }
}

/// chat webhook taking `{"text": ...}`
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PayoutError::Config(format!("webhook client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PayoutError::Http(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        info!("operator notified");
        Ok(())
    }
}

/// deliver, logging instead of failing
pub async fn notify_quietly(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.notify(text).await {
        warn!(error = %e, "operator notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_webhook_posts_text() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .json_body(json!({"text": "nonce 7 rejected"}));
                then.status(200);
            })
            .await;

        let notifier = WebhookNotifier::new(&server.url("/hook")).unwrap();
        notifier.notify("nonce 7 rejected").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(500);
            })
            .await;

        let notifier = WebhookNotifier::new(&server.url("/hook")).unwrap();
        assert!(notifier.notify("x").await.is_err());
        notify_quietly(&notifier, "x").await;
        notify_quietly(&LogNotifier, "x").await;
    }
}
