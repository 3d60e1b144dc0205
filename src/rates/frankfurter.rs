//! HTTP rate provider speaking the Frankfurter `/latest` API

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{RateError, RateProvider, RateResponse};
use crate::config::RatesConfig;
use crate::money::Currency;

pub struct HttpRateProvider {
    client: Client,
    base_url: String,
}

impl HttpRateProvider {
    /// Fails if the HTTP client cannot be built with the configured timeout
    pub fn new(config: &RatesConfig) -> Result<Self, RateError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| {
                RateError::ExternalServiceUnavailable(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn latest_url(&self) -> String {
        format!("{}/latest", self.base_url)
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    fn name(&self) -> &'static str {
        "frankfurter"
    }

    async fn get_latest_rate(
        &self,
        from: Currency,
        to: Currency,
    ) -> Result<RateResponse, RateError> {
        let response = self
            .client
            .get(self.latest_url())
            .query(&[("from", from.as_str()), ("to", to.as_str())])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(from = %from, to = %to, error = %e, "[rates] request failed");
                RateError::ExternalServiceUnavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(from = %from, to = %to, status = %status, "[rates] provider returned error status");
            return Err(RateError::ExternalServiceUnavailable(format!(
                "Rate provider returned {}",
                status
            )));
        }

        response
            .json::<RateResponse>()
            .await
            .map_err(|e| RateError::ExternalServiceUnavailable(format!("Invalid rate response: {}", e)))
    }
}
