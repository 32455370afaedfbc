//! # Remote API
//!
//! The REST endpoint queued mutations are replayed against.
//!
//! ## Wire Contract
//! ```text
//! CREATE  POST   {base}/{table}          body: payload
//!                Idempotency-Key: {mutation id}
//!                → 2xx {"id": ..., ...} or {"data": {"id": ..., ...}}
//! UPDATE  PATCH  {base}/{table}/{id}     body: {"data": payload, "expected": snapshot}
//!                → 2xx, or 409/412 {"current": {...}} when the record moved on
//! DELETE  DELETE {base}/{table}/{id}     → 2xx, 404 counts as already deleted
//! FETCH   GET    {base}/{table}/{id}     → 2xx record, 404 none
//! ```
//!
//! Every request carries `X-Device-Id` and, when a credential resolves, a
//! bearer token.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use stockroom_core::Record;

use crate::error::{RemoteError, SyncError, SyncResult};

// =============================================================================
// Credentials
// =============================================================================

/// A resolved bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credential {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Turns the opaque `credential_ref` stored on a mutation into a credential
/// at execution time. Secrets never touch the queue.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` sends the request unauthenticated. An error is treated as
    /// a transient failure of the mutation.
    async fn resolve(&self, credential_ref: Option<&str>) -> Result<Option<Credential>, RemoteError>;
}

/// Sends every request without credentials.
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn resolve(&self, _credential_ref: Option<&str>) -> Result<Option<Credential>, RemoteError> {
        Ok(None)
    }
}

/// Fixed tokens: one default plus named ones looked up by reference.
#[derive(Default)]
pub struct StaticCredentials {
    default: Option<Credential>,
    named: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new(default: Option<Credential>) -> Self {
        StaticCredentials {
            default,
            named: HashMap::new(),
        }
    }

    pub fn with_named(mut self, credential_ref: impl Into<String>, credential: Credential) -> Self {
        self.named.insert(credential_ref.into(), credential);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, credential_ref: Option<&str>) -> Result<Option<Credential>, RemoteError> {
        match credential_ref {
            None => Ok(self.default.clone()),
            Some(reference) => self.named.get(reference).cloned().map(Some).ok_or_else(|| {
                RemoteError::Unauthenticated(format!("no credential for reference '{reference}'"))
            }),
        }
    }
}

// =============================================================================
// Remote API Trait
// =============================================================================

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRecord {
    /// Server-assigned identifier.
    pub record_id: String,
    /// Full record as returned by the server, when it sent one.
    pub record: Option<Record>,
}

/// Remote operations the queue manager needs.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Creates a record. Retries with the same `idempotency_key` must not
    /// create a second record.
    async fn create(
        &self,
        table: &str,
        payload: &Record,
        idempotency_key: &str,
        credential: Option<&Credential>,
    ) -> Result<CreatedRecord, RemoteError>;

    /// Writes `payload` over the record. With `expected` set the server must
    /// answer `Conflict` if the record no longer matches it.
    async fn update(
        &self,
        table: &str,
        record_id: &str,
        payload: &Record,
        expected: Option<&Record>,
        credential: Option<&Credential>,
    ) -> Result<(), RemoteError>;

    /// Deletes a record. A record that is already gone is a success.
    async fn delete(
        &self,
        table: &str,
        record_id: &str,
        credential: Option<&Credential>,
    ) -> Result<(), RemoteError>;

    /// Current server version of a record, `None` if it does not exist.
    async fn fetch(
        &self,
        table: &str,
        record_id: &str,
        credential: Option<&Credential>,
    ) -> Result<Option<Record>, RemoteError>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// [`RemoteApi`] over HTTP/JSON.
#[derive(Clone)]
pub struct HttpRemoteApi {
    base_url: Url,
    device_id: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemoteApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteApi")
            .field("base_url", &self.base_url.as_str())
            .field("device_id", &self.device_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpRemoteApi {
    pub fn new(base_url: Url, device_id: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidUrl(format!(
                "{base_url} cannot be used as an API base"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("HTTP client: {e}")))?;

        Ok(HttpRemoteApi {
            base_url,
            device_id: device_id.into(),
            timeout,
            client,
        })
    }

    /// `{base}/{table}[/{record_id}]`, with each segment percent-encoded.
    pub fn resource_url(&self, table: &str, record_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(table);
            if let Some(record_id) = record_id {
                segments.push(record_id);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url, credential: Option<&Credential>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header("X-Device-Id", &self.device_id);

        match credential {
            Some(credential) => builder.bearer_auth(&credential.token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Err(error_from_status(status, &body, retry_after))
    }

    async fn read_record(&self, response: reqwest::Response) -> Result<Option<Record>, RemoteError> {
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("response is not JSON: {e}")))?;
        Ok(unwrap_record(value))
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.timeout)
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(
        &self,
        table: &str,
        payload: &Record,
        idempotency_key: &str,
        credential: Option<&Credential>,
    ) -> Result<CreatedRecord, RemoteError> {
        let url = self.resource_url(table, None);
        debug!(%url, idempotency_key, "POST create");

        let builder = self
            .request(Method::POST, url, credential)
            .header("Idempotency-Key", idempotency_key)
            .json(payload);
        let response = self.send(builder).await?;

        let record = self.read_record(response).await?.ok_or_else(|| {
            RemoteError::InvalidResponse("create response has no body".to_string())
        })?;
        let record_id = record_id_of(&record).ok_or_else(|| {
            RemoteError::InvalidResponse("create response has no record id".to_string())
        })?;

        Ok(CreatedRecord {
            record_id,
            record: Some(record),
        })
    }

    async fn update(
        &self,
        table: &str,
        record_id: &str,
        payload: &Record,
        expected: Option<&Record>,
        credential: Option<&Credential>,
    ) -> Result<(), RemoteError> {
        let url = self.resource_url(table, Some(record_id));
        debug!(%url, guarded = expected.is_some(), "PATCH update");

        let body = json!({ "data": payload, "expected": expected });
        let builder = self.request(Method::PATCH, url, credential).json(&body);
        self.send(builder).await?;
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        record_id: &str,
        credential: Option<&Credential>,
    ) -> Result<(), RemoteError> {
        let url = self.resource_url(table, Some(record_id));
        debug!(%url, "DELETE");

        match self.send(self.request(Method::DELETE, url, credential)).await {
            Ok(_) | Err(RemoteError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn fetch(
        &self,
        table: &str,
        record_id: &str,
        credential: Option<&Credential>,
    ) -> Result<Option<Record>, RemoteError> {
        let url = self.resource_url(table, Some(record_id));

        match self.send(self.request(Method::GET, url, credential)).await {
            Ok(response) => self.read_record(response).await,
            Err(RemoteError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

// =============================================================================
// Response Mapping
// =============================================================================

/// Maps a non-success HTTP response onto a [`RemoteError`].
pub fn error_from_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> RemoteError {
    match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict {
            current: conflict_record(body),
        },
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED => RemoteError::Unauthenticated(error_message(status, body)),
        StatusCode::REQUEST_TIMEOUT => RemoteError::Timeout(Duration::ZERO),
        status if status.is_server_error() => RemoteError::Server {
            status: status.as_u16(),
            message: error_message(status, body),
        },
        status => RemoteError::Client {
            status: status.as_u16(),
            message: error_message(status, body),
        },
    }
}

/// Server record carried by a conflict response, under `current` or as the
/// whole body.
fn conflict_record(body: &str) -> Option<Record> {
    let value: Value = serde_json::from_str(body).ok()?;
    let mut object = match value {
        Value::Object(object) => object,
        _ => return None,
    };

    match object.remove("current") {
        Some(Value::Object(current)) => Some(current),
        Some(_) => None,
        None if object.contains_key("error") || object.contains_key("message") => None,
        None => Some(object),
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
        let message = object
            .get("message")
            .or_else(|| object.get("error"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return message.trim().to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}

/// Unwraps `{"data": {...}}` envelopes.
fn unwrap_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(mut object) => match object.remove("data") {
            Some(Value::Object(inner)) => Some(inner),
            Some(other) => {
                object.insert("data".to_string(), other);
                Some(object)
            }
            None => Some(object),
        },
        _ => None,
    }
}

fn record_id_of(record: &Record) -> Option<String> {
    match record.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base: &str) -> HttpRemoteApi {
        HttpRemoteApi::new(Url::parse(base).unwrap(), "dock-2", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_resource_url_encodes_segments() {
        let api = api("https://api.example.com/v1/");
        assert_eq!(
            api.resource_url("lots", None).as_str(),
            "https://api.example.com/v1/lots"
        );
        assert_eq!(
            api.resource_url("lots", Some("L 1/2")).as_str(),
            "https://api.example.com/v1/lots/L%201%2F2"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            error_from_status(StatusCode::NOT_FOUND, "", None),
            RemoteError::NotFound
        ));
        assert!(matches!(
            error_from_status(StatusCode::SERVICE_UNAVAILABLE, "", None),
            RemoteError::Server { status: 503, .. }
        ));
        assert!(matches!(
            error_from_status(StatusCode::UNAUTHORIZED, "", None),
            RemoteError::Unauthenticated(_)
        ));
        assert!(matches!(
            error_from_status(
                StatusCode::TOO_MANY_REQUESTS,
                "",
                Some(Duration::from_secs(3))
            ),
            RemoteError::RateLimited {
                retry_after: Some(_)
            }
        ));

        match error_from_status(
            StatusCode::BAD_REQUEST,
            r#"{"message": "qty must be positive"}"#,
            None,
        ) {
            RemoteError::Client { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "qty must be positive");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_conflict_body_carries_current_record() {
        let err = error_from_status(
            StatusCode::CONFLICT,
            r#"{"current": {"id": "L-1", "color": "green"}}"#,
            None,
        );
        match err {
            RemoteError::Conflict { current: Some(current) } => {
                assert_eq!(current.get("color"), Some(&json!("green")));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Error bodies are not mistaken for records
        assert!(matches!(
            error_from_status(StatusCode::PRECONDITION_FAILED, r#"{"error": "stale"}"#, None),
            RemoteError::Conflict { current: None }
        ));
    }

    #[test]
    fn test_unwrap_record_and_id() {
        let record = unwrap_record(json!({ "data": { "id": 42, "lot": "L-1" } })).unwrap();
        assert_eq!(record_id_of(&record).as_deref(), Some("42"));

        let record = unwrap_record(json!({ "id": "srv-1" })).unwrap();
        assert_eq!(record_id_of(&record).as_deref(), Some("srv-1"));

        assert!(unwrap_record(json!([1, 2])).is_none());
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let debug = format!("{:?}", Credential::bearer("secret"));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let provider = StaticCredentials::new(Some(Credential::bearer("default")))
            .with_named("picker-7", Credential::bearer("picker"));

        assert_eq!(
            provider.resolve(None).await.unwrap(),
            Some(Credential::bearer("default"))
        );
        assert_eq!(
            provider.resolve(Some("picker-7")).await.unwrap(),
            Some(Credential::bearer("picker"))
        );
        assert!(matches!(
            provider.resolve(Some("unknown")).await,
            Err(RemoteError::Unauthenticated(_))
        ));
    }
}
