//! DNS provider API used for DNS-01 challenges
//!
//! Only the wildcard certificate for the platform domain is issued this way;
//! it needs a `_acme-challenge` TXT record in the platform's zone.

use crate::config::DnsProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum Dns01Error {
    #[error("DNS provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS provider rejected the request: {0}")]
    Api(String),

    #[error("DNS provider is not configured")]
    NotConfigured,
}

/// Record name for the challenge of `domain` (wildcard prefix stripped)
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publish a TXT record; returns an id for [`DnsProvider::delete_txt`]
    async fn create_txt(&self, name: &str, value: &str) -> Result<String, Dns01Error>;

    async fn delete_txt(&self, record_id: &str) -> Result<(), Dns01Error>;
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RecordResult {
    id: String,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<Option<T>, Dns01Error> {
        if self.success {
            return Ok(self.result);
        }
        let detail = self
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Dns01Error::Api(detail))
    }
}

/// Cloudflare DNS API client
pub struct CloudflareDns {
    api_base: String,
    zone_id: String,
    api_token: String,
    http_client: reqwest::Client,
}

impl CloudflareDns {
    pub fn new(config: &DnsProviderConfig) -> Result<Self, Dns01Error> {
        let (Some(api_token), Some(zone_id)) = (&config.api_token, &config.zone_id) else {
            return Err(Dns01Error::NotConfigured);
        };
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            zone_id: zone_id.clone(),
            api_token: api_token.clone(),
            http_client,
        })
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.api_base, self.zone_id)
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn create_txt(&self, name: &str, value: &str) -> Result<String, Dns01Error> {
        let body = CreateRecord {
            record_type: "TXT",
            name,
            content: value,
            ttl: 60,
        };
        let response: ApiResponse<RecordResult> = self
            .http_client
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        let record = response
            .into_result()?
            .ok_or_else(|| Dns01Error::Api("record created without an id".to_string()))?;
        info!(name, record_id = %record.id, "DNS-01 TXT record created");
        Ok(record.id)
    }

    async fn delete_txt(&self, record_id: &str) -> Result<(), Dns01Error> {
        let response: ApiResponse<serde_json::Value> = self
            .http_client
            .delete(format!("{}/{}", self.records_url(), record_id))
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .json()
            .await?;
        response.into_result()?;
        debug!(record_id, "DNS-01 TXT record deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_record_name() {
        assert_eq!(challenge_record_name("*.apps.example.com"), "_acme-challenge.apps.example.com");
        assert_eq!(challenge_record_name("shop.example.com"), "_acme-challenge.shop.example.com");
    }

    #[test]
    fn test_api_errors_are_reported() {
        let response: ApiResponse<RecordResult> = serde_json::from_str(
            r#"{"success": false, "errors": [{"code": 81057, "message": "Record already exists."}], "result": null}"#,
        )
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert!(err.to_string().contains("Record already exists. (81057)"));
    }

    #[test]
    fn test_api_success_yields_record() {
        let response: ApiResponse<RecordResult> =
            serde_json::from_str(r#"{"success": true, "errors": [], "result": {"id": "abc123"}}"#).unwrap();
        assert_eq!(response.into_result().unwrap().unwrap().id, "abc123");
    }

    #[test]
    fn test_requires_credentials() {
        let config = DnsProviderConfig::default();
        assert!(matches!(CloudflareDns::new(&config), Err(Dns01Error::NotConfigured)));
    }
}
