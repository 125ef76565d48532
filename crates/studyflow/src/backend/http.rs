//! HTTP implementation of [`JobBackend`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use uuid::Uuid;

use super::{BackendError, JobBackend, SubmitRequest, SubmitResponse};
use crate::entity::{EntityId, EntityRecord, EntityStatus, UserId};

/// Maximum length for error bodies kept in messages and logs.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Header carrying the per-attempt correlation id.
const CORRELATION_HEADER: &str = "X-Correlation-Id";

fn truncate_error_body(body: &str) -> String {
    let body = body.trim();
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Extracts a human-readable message from a JSON error body, falling back
/// to the raw (truncated) text.
fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error", "errorMessage"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return truncate_error_body(text);
            }
        }
    }
    truncate_error_body(body)
}

fn classify_reqwest_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else if err.is_decode() {
        BackendError::Decode(err.to_string())
    } else if err.is_builder() {
        BackendError::Config(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailurePatch<'a> {
    status: EntityStatus,
    error_message: &'a str,
}

/// Talks to the processing backend over HTTP/JSON.
///
/// Every request is bounded by `request_timeout`. Callers may still race a
/// request against a shorter deadline of their own.
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    token: Option<SecretString>,
}

impl HttpBackend {
    /// Creates a backend client for the given base URL.
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(BackendError::Config("Base URL must not be empty".to_string()));
        }
        let base_url = Url::parse(base_url)
            .map_err(|e| BackendError::Config(format!("Invalid base URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::Config(format!(
                "Base URL '{}' cannot carry a path",
                base_url
            )));
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::Config(format!("Base URL '{}' cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        correlation_id: Uuid,
    ) -> Result<Response, BackendError> {
        self.authorize(request)
            .header(CORRELATION_HEADER, correlation_id.to_string())
            .send()
            .await
            .map_err(classify_reqwest_error)
    }

    /// Turns non-success statuses into [`BackendError`]s.
    async fn check_status(
        response: Response,
        entity_id: Option<&EntityId>,
    ) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::NOT_FOUND {
            if let Some(id) = entity_id {
                return Err(BackendError::NotFound(id.clone()));
            }
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message_from_body(&body);
        warn!("Backend returned {}: {}", status.as_u16(), message);

        Err(BackendError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl JobBackend for HttpBackend {
    async fn submit_job(&self, request: &SubmitRequest) -> Result<SubmitResponse, BackendError> {
        debug!(
            "POST /jobs for {} (correlation {})",
            request.entity_id, request.correlation_id
        );

        let builder = self.client.post(self.url(&["jobs"])?).json(request);
        let response = self.send(builder, request.correlation_id).await?;
        let response = Self::check_status(response, Some(&request.entity_id)).await?;

        response
            .json::<SubmitResponse>()
            .await
            .map_err(classify_reqwest_error)
    }

    async fn fetch_entity(&self, id: &EntityId) -> Result<EntityRecord, BackendError> {
        let builder = self.client.get(self.url(&["entities", id.as_str()])?);
        let response = self.send(builder, Uuid::new_v4()).await?;
        let response = Self::check_status(response, Some(id)).await?;

        response
            .json::<EntityRecord>()
            .await
            .map_err(classify_reqwest_error)
    }

    async fn list_stuck(
        &self,
        owner: &UserId,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<EntityRecord>, BackendError> {
        let updated_before = updated_before.to_rfc3339();
        let builder = self.client.get(self.url(&["entities"])?).query(&[
            ("ownerId", owner.as_str()),
            ("status", EntityStatus::Extracting.as_str()),
            ("updatedBefore", updated_before.as_str()),
        ]);
        let response = self.send(builder, Uuid::new_v4()).await?;
        let response = Self::check_status(response, None).await?;

        response
            .json::<Vec<EntityRecord>>()
            .await
            .map_err(classify_reqwest_error)
    }

    async fn mark_failed(
        &self,
        id: &EntityId,
        message: &str,
    ) -> Result<EntityRecord, BackendError> {
        let patch = FailurePatch {
            status: EntityStatus::Failed,
            error_message: message,
        };
        let builder = self
            .client
            .patch(self.url(&["entities", id.as_str()])?)
            .json(&patch);
        let response = self.send(builder, Uuid::new_v4()).await?;
        let response = Self::check_status(response, Some(id)).await?;

        response
            .json::<EntityRecord>()
            .await
            .map_err(classify_reqwest_error)
    }
}
