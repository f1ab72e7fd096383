//! HTTP transport to a remote sitesync node

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::wire::{
    BatchRecordResult, ChangesResponse, IngestStatus, PushBatchRequest, PushBatchResponse,
    PushRecordRequest, PushRecordResponse, API_KEY_HEADER, SERVER_ID_HEADER,
};
use super::{SyncTransport, TransportError, DEFAULT_BATCH_SIZE};
use crate::config::SyncConfig;
use crate::models::ChangeRecord;
use crate::util::{compact_text, format_timestamp, is_http_url};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`SyncTransport`] over the `/sync/*` HTTP surface of a remote node
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    api_key: String,
    server_id: String,
    batch_size: usize,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("server_id", &self.server_id)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport for an explicit remote base URL
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        server_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(TransportError::Http(format!(
                "remote URL must start with http:// or https://, got '{base_url}'"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| {
                TransportError::Http(format!("Failed to construct HTTP client: {error}"))
            })?;

        Ok(Self {
            base_url,
            api_key: api_key.into(),
            server_id: server_id.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            client,
        })
    }

    /// Build a transport from loaded configuration
    pub fn from_config(config: &SyncConfig) -> Result<Self, TransportError> {
        Ok(Self::new(
            &config.remote_url,
            config.api_key.clone(),
            config.server_id.clone(),
            config.request_timeout,
        )?
        .with_batch_size(config.batch_size))
    }

    /// Records per batch request
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Remote base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(API_KEY_HEADER, &self.api_key)
            .header(SERVER_ID_HEADER, &self.server_id)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(classify_request_error)?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| TransportError::InvalidResponse(sanitize(&error)))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn pull(
        &self,
        table: &str,
        since: DateTime<Utc>,
        server_id: &str,
    ) -> Result<Vec<ChangeRecord>, TransportError> {
        let request = self
            .client
            .get(self.url(&format!("/sync/changes/{table}")))
            .query(&[
                ("since", format_timestamp(since)),
                ("server_id", server_id.to_string()),
            ]);

        let mut records = match self.send::<ChangesResponse>(request).await {
            Ok(response) => response.records,
            Err(error) if error.is_offline() => {
                tracing::debug!(table, "Remote offline, pulling nothing: {error}");
                return Ok(Vec::new());
            }
            Err(error) => return Err(error),
        };

        // The remote may not filter by origin itself
        records.retain(|record| record.server_id() != Some(server_id));
        Ok(records)
    }

    async fn push_one(
        &self,
        table: &str,
        record: &ChangeRecord,
    ) -> Result<IngestStatus, TransportError> {
        let request = self
            .client
            .post(self.url(&format!("/sync/records/{table}")))
            .json(&PushRecordRequest {
                record: record.clone(),
                timestamp: Utc::now(),
            });
        let response = self.send::<PushRecordResponse>(request).await?;
        Ok(response.status)
    }

    async fn push_chunk(
        &self,
        table: &str,
        records: &[ChangeRecord],
    ) -> Result<Vec<BatchRecordResult>, TransportError> {
        let request = self
            .client
            .post(self.url(&format!("/sync/batch/{table}")))
            .json(&PushBatchRequest {
                records: records.to_vec(),
                timestamp: Utc::now(),
            });
        let response = self.send::<PushBatchResponse>(request).await?;
        Ok(response.results)
    }

    async fn probe(&self) -> bool {
        let result = self
            .client
            .get(self.url("/sync/health"))
            .header(SERVER_ID_HEADER, &self.server_id)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                tracing::debug!("Connectivity probe failed: {}", sanitize(&error));
                false
            }
        }
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

fn classify_request_error(error: reqwest::Error) -> TransportError {
    if error.is_connect() || error.is_timeout() {
        TransportError::Offline(sanitize(&error))
    } else {
        TransportError::Http(sanitize(&error))
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::CONFLICT => TransportError::RemoteConflict(compact_text(&body)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Unauthorized(status.as_u16())
        }
        _ => TransportError::Api {
            status: status.as_u16(),
            message: compact_text(&body),
        },
    })
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}
