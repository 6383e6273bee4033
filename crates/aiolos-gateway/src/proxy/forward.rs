//! JSON forwarding to the telemetry backend.
//!
//! One POST per accepted request. No retries, no queueing: when the backend
//! is down every in-flight request fails on its own and the device retries.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::Url;
use serde_json::Value;
use tracing::Instrument;

use super::correlation::REQUEST_ID_HEADER;
use crate::routing::TargetPath;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("backend unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("backend answered with non-accepted status {0}")]
    Rejected(u16),
    #[error("base url `{0}` cannot carry a path")]
    InvalidBaseUrl(String),
}

/// Delivers a validated payload to its backend target.
pub trait Forward: Send + Sync + 'static {
    fn forward(
        &self,
        target: &TargetPath,
        payload: &Value,
        request_id: &str,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send;
}

/// [`Forward`] over HTTP with a bounded per-call timeout.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(base_url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Append the target's segments to the base URL, percent-encoding each.
    pub fn target_url(&self, target: &TargetPath) -> Result<Url, ForwardError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ForwardError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(target.segments());
        Ok(url)
    }
}

impl Forward for HttpForwarder {
    fn forward(
        &self,
        target: &TargetPath,
        payload: &Value,
        request_id: &str,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send {
        async move {
            let url = self.target_url(target)?;
            let span = aiolos_tracing::backend_forward_span!(request_id, url);
            let start = Instant::now();

            async {
                let result = self
                    .client
                    .post(url)
                    .header(REQUEST_ID_HEADER, request_id)
                    .json(payload)
                    .send()
                    .await;

                let latency = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("latency_ms", latency);

                match result {
                    Ok(resp) => {
                        let status = resp.status();
                        tracing::Span::current().record("status", status.as_u16());
                        if status.is_success() {
                            tracing::debug!(status = status.as_u16(), latency_ms = latency, "Forward complete");
                            Ok(())
                        } else {
                            Err(ForwardError::Rejected(status.as_u16()))
                        }
                    }
                    Err(e) if e.is_timeout() => Err(ForwardError::Timeout(self.timeout)),
                    Err(e) => Err(ForwardError::Transport(e)),
                }
            }
            .instrument(span)
            .await
        }
    }
}
