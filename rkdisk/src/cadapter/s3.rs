//! S3 adapter: anonymous ranged reads against an S3-compatible endpoint.
//!
//! Public image buckets are read without credentials, so the client is built
//! with `no_credentials()` instead of patching individual requests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use bytes::Bytes;
use tokio::time::{Duration, sleep};
use tracing::warn;

use crate::cadapter::client::ObjectBackend;

/// S3 backend options.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint, e.g. `http://127.0.0.1:9000`; AWS when unset.
    pub endpoint: Option<String>,
    pub region: String,
    /// Path-style addressing (`endpoint/bucket/key`), needed by most S3 clones.
    pub force_path_style: bool,
    /// Maximum retries of a failed ranged GET.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds, doubled after every attempt.
    pub initial_retry_delay_ms: u64,
    /// Per-operation timeout.
    pub timeout: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            force_path_style: true,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Upper bound of a single retry delay.
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Delay before retry number `attempt` (1-based): doubles each time, capped.
fn backoff_delay_ms(initial_ms: u64, attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .map_or(u64::MAX, |factor| initial_ms.saturating_mul(factor))
        .min(MAX_RETRY_DELAY_MS)
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
}

impl S3Backend {
    pub async fn new(bucket: impl Into<String>, config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .no_credentials()
            .region(Region::new(config.region.clone()))
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(config.timeout)
                    .build(),
            );
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_conf),
            bucket: bucket.into(),
            config,
        })
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > max_retries {
                        anyhow::bail!("{operation_name} failed after {max_retries} retries: {e}");
                    }
                    let delay_ms = backoff_delay_ms(self.config.initial_retry_delay_ms, attempt);
                    warn!(operation_name, attempt, delay_ms, "s3 request failed: {e}");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_object(&self, key: &str) -> Result<Option<u64>> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let len = o
                    .content_length()
                    .context("head_object returned no content length")?;
                Ok(Some(u64::try_from(len)?))
            }
            Err(e) => {
                if e.as_service_error().is_some_and(|s| s.is_not_found()) {
                    Ok(None)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_object_range(&self, key: &str, offset: u64, len: usize) -> Result<Bytes> {
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let operation = || async {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(&range)
                .send()
                .await
        };
        let resp = self.execute_with_retry(operation, "get_object").await?;
        let body = resp
            .body
            .collect()
            .await
            .with_context(|| format!("reading body of {key} {range}"))?;
        Ok(body.into_bytes())
    }
}
