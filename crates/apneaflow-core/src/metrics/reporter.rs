//! Delivery of finished sessions to the remote student record.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use super::summary::MetricsPayload;
use crate::error::ReporterError;

#[async_trait]
pub trait MetricsReporter: Send + Sync {
    async fn report(&self, payload: &MetricsPayload) -> Result<(), ReporterError>;
}

#[derive(Serialize)]
struct StudentSessionBody<'a> {
    slug: &'a str,
    token: &'a str,
    session: &'a MetricsPayload,
}

/// POSTs `{ slug, token, session }` to `{base}/api/students`.
#[derive(Debug, Clone)]
pub struct HttpMetricsReporter {
    client: reqwest::Client,
    base: Url,
}

impl HttpMetricsReporter {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }
}

#[async_trait]
impl MetricsReporter for HttpMetricsReporter {
    async fn report(&self, payload: &MetricsPayload) -> Result<(), ReporterError> {
        let url = self.base.join("api/students")?;
        let body = StudentSessionBody {
            slug: &payload.student_id,
            token: &payload.possession_token,
            session: payload,
        };
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReporterError::Rejected {
                status: status.as_u16(),
            });
        }
        tracing::debug!(student = %payload.student_id, "session reported");
        Ok(())
    }
}

/// Drops every report. Used when no endpoint or identity is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

#[async_trait]
impl MetricsReporter for NullReporter {
    async fn report(&self, _payload: &MetricsPayload) -> Result<(), ReporterError> {
        Ok(())
    }
}
