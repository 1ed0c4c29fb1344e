//! Metrics aggregation query client.
//!
//! The engine consumes an external aggregation interface; this client
//! speaks a simple range-query HTTP API. Without a configured endpoint the
//! null provider returns no samples and the evaluator skips every rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use powerd_core::{Error, MetricSample, MetricsProvider, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub struct HttpMetricsProvider {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct WireSample {
    timestamp: DateTime<Utc>,
    value: f64,
}

impl HttpMetricsProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MetricsProvider for HttpMetricsProvider {
    async fn query_range(
        &self,
        metric: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        filters: &HashMap<String, String>,
    ) -> Result<Vec<MetricSample>> {
        let url = format!("{}/api/v1/metrics/range", self.base_url.trim_end_matches('/'));
        let mut query: Vec<(String, String)> = vec![
            ("metric".to_string(), metric.to_string()),
            ("from".to_string(), from.to_rfc3339()),
            ("to".to_string(), to.to_rfc3339()),
        ];
        for (key, value) in filters {
            query.push((format!("label.{key}"), value.clone()));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::dependency_unavailable(format!("metrics query: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::dependency_unavailable(format!(
                "metrics endpoint returned {}",
                response.status()
            )));
        }

        let samples: Vec<WireSample> = response
            .json()
            .await
            .map_err(|e| Error::internal(format!("malformed metrics response: {e}")))?;
        Ok(samples
            .into_iter()
            .map(|s| MetricSample {
                timestamp: s.timestamp,
                value: s.value,
            })
            .collect())
    }
}

/// Provider used when no metrics endpoint is configured.
pub struct NullMetricsProvider;

#[async_trait]
impl MetricsProvider for NullMetricsProvider {
    async fn query_range(
        &self,
        _metric: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        _filters: &HashMap<String, String>,
    ) -> Result<Vec<MetricSample>> {
        Ok(Vec::new())
    }
}
