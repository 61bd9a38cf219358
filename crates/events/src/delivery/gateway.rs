//! JSON-over-HTTP client shared by the SMS and push senders.
//!
//! One POST per attempt; a non-2xx response is a failed send.

use std::time::Duration;

use super::DeliveryError;

pub struct GatewayClient {
    client: reqwest::Client,
    url: String,
}

impl GatewayClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn post(&self, payload: &serde_json::Value) -> Result<(), DeliveryError> {
        let response = self.client.post(&self.url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}
