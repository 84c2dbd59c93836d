use super::AdapterError;
use crate::config::ServiceEndpoint;
use crate::state::{ServiceStatusReading, ServiceStatusSnapshot};
use futures_util::future::join_all;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

const STATUS_PATH: &str = "/api/ps";

/// Polls the running-models endpoint of Ollama-compatible servers.
#[derive(Debug, Clone)]
pub struct ServiceAdapter {
    client: Client,
    timeout: Duration,
}

impl ServiceAdapter {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn fetch_service_status(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<(u16, Value), AdapterError> {
        let url = status_url(&endpoint.url);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| AdapterError::Unreachable {
                url: url.clone(),
                source,
            })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(AdapterError::Status { url, status });
        }

        let payload = resp
            .json::<Value>()
            .await
            .map_err(|source| AdapterError::Malformed {
                url,
                status,
                source,
            })?;
        Ok((status, payload))
    }

    pub async fn status_reading(&self, endpoint: &ServiceEndpoint) -> ServiceStatusReading {
        match self.fetch_service_status(endpoint).await {
            Ok((status, payload)) => {
                ServiceStatusReading::reachable(endpoint.clone(), status, payload)
            }
            Err(err) => {
                warn!(endpoint = %endpoint.name, error = %err, "service status check failed");
                let status = match &err {
                    AdapterError::Status { status, .. } | AdapterError::Malformed { status, .. } => {
                        Some(*status)
                    }
                    _ => None,
                };
                ServiceStatusReading::unreachable(endpoint.clone(), status, err.to_string())
            }
        }
    }

    /// Queries every endpoint concurrently. Readings keep the order of
    /// `endpoints`; an empty list yields a "not configured" snapshot.
    pub async fn collect_service_status(
        &self,
        endpoints: &[ServiceEndpoint],
        timestamp: i64,
    ) -> ServiceStatusSnapshot {
        if endpoints.is_empty() {
            return ServiceStatusSnapshot::not_configured(timestamp);
        }
        let readings = join_all(endpoints.iter().map(|e| self.status_reading(e))).await;
        ServiceStatusSnapshot::collected(timestamp, readings)
    }
}

fn status_url(base: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), STATUS_PATH)
}
