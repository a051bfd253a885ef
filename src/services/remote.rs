use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::models::item::TargetOptions;
use crate::models::outcome::ErrorKind;

/// Header carrying the service-side cumulative compression count for the
/// credential that made the request.
const USAGE_HEADER: &str = "compression-count";

/// Result of one remote optimization call.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Vec<u8>,
    /// Cumulative usage reported by the service. Authoritative for quota
    /// accounting; the registry never estimates locally.
    pub usage_count: Option<u32>,
}

/// Errors from the remote service, mirroring its four failure classes.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("credential rejected by the service: {0}")]
    AccountInvalid(String),

    #[error("monthly quota exhausted for this credential")]
    QuotaExhausted,

    #[error("service rejected the input: {0}")]
    BadRequest(String),

    #[error("service-side error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("connection to service failed: {0}")]
    Connection(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::AccountInvalid(_) => ErrorKind::InvalidCredential,
            ServiceError::QuotaExhausted => ErrorKind::QuotaExceeded,
            ServiceError::BadRequest(_) => ErrorKind::Validation,
            ServiceError::Server { .. } | ServiceError::Connection(_) => ErrorKind::Transient,
        }
    }
}

/// The remote optimization service, seen from the engine.
///
/// One call takes the source bytes plus the requested target options and
/// returns the transformed bytes along with the credential's cumulative
/// usage count.
#[async_trait]
pub trait OptimizeService: Send + Sync {
    async fn optimize(
        &self,
        token: &str,
        input: Vec<u8>,
        options: &TargetOptions,
    ) -> Result<TransformOutput, ServiceError>;
}

/// Error body shape used by the service for non-2xx responses.
#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// HTTP client for a TinyPNG-compatible compression API.
///
/// Compression is a `POST {endpoint}/shrink` with the raw source bytes and
/// basic auth (`api:<token>`); the response carries a `Location` pointing at
/// the compressed result and a `Compression-Count` usage header. Conversion,
/// resizing, and metadata preservation are requested with a second `POST` to
/// that location.
pub struct RemoteOptimizer {
    http: Client,
    endpoint: String,
}

impl RemoteOptimizer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    fn classify(status: StatusCode, body: &str) -> ServiceError {
        let message = serde_json::from_str::<ApiError>(body)
            .map(|e| {
                if e.message.is_empty() {
                    e.error
                } else {
                    format!("{}: {}", e.error, e.message)
                }
            })
            .unwrap_or_else(|_| body.chars().take(200).collect());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ServiceError::AccountInvalid(message)
            }
            StatusCode::TOO_MANY_REQUESTS => ServiceError::QuotaExhausted,
            s if s.is_client_error() => ServiceError::BadRequest(message),
            s => ServiceError::Server {
                status: s.as_u16(),
                message,
            },
        }
    }

    fn transport_error(err: reqwest::Error) -> ServiceError {
        ServiceError::Connection(err.to_string())
    }

    fn usage_from(response: &Response) -> Option<u32> {
        response
            .headers()
            .get(USAGE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    async fn check(response: Response) -> Result<Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, &body))
    }
}

#[async_trait]
impl OptimizeService for RemoteOptimizer {
    async fn optimize(
        &self,
        token: &str,
        input: Vec<u8>,
        options: &TargetOptions,
    ) -> Result<TransformOutput, ServiceError> {
        let shrink_url = format!("{}/shrink", self.endpoint);
        let response = self
            .http
            .post(&shrink_url)
            .basic_auth("api", Some(token))
            .body(input)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let response = Self::check(response).await?;

        let mut usage = Self::usage_from(&response);
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ServiceError::Server {
                status: response.status().as_u16(),
                message: "shrink response missing Location header".to_string(),
            })?;

        // Fetch the result; a second POST applies convert/resize/preserve
        // in the documented contract order.
        let request = match options.to_request_body() {
            Some(body) => self
                .http
                .post(&location)
                .basic_auth("api", Some(token))
                .json(&body),
            None => self.http.get(&location).basic_auth("api", Some(token)),
        };
        let response = request.send().await.map_err(Self::transport_error)?;
        let response = Self::check(response).await?;

        if let Some(count) = Self::usage_from(&response) {
            usage = Some(count);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(Self::transport_error)?
            .to_vec();

        Ok(TransformOutput {
            bytes,
            usage_count: usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = RemoteOptimizer::classify(StatusCode::UNAUTHORIZED, "{\"error\":\"Unauthorized\"}");
        assert_eq!(err.kind(), ErrorKind::InvalidCredential);

        let err = RemoteOptimizer::classify(StatusCode::TOO_MANY_REQUESTS, "");
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let err = RemoteOptimizer::classify(StatusCode::UNSUPPORTED_MEDIA_TYPE, "not json");
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = RemoteOptimizer::classify(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_error_message_prefers_api_body() {
        let err = RemoteOptimizer::classify(
            StatusCode::BAD_REQUEST,
            "{\"error\":\"InputMissing\",\"message\":\"File is empty\"}",
        );
        assert!(err.to_string().contains("InputMissing: File is empty"));
    }
}
