//! HTTP transport for the fleet REST API

use super::{Transport, TransportError};
use crate::store::TelemetryRecord;
use crate::types::{
    AckRequest, AckResponse, AgentMetadata, ApiError, EnrollRequest, EnrollResponse, HeartbeatRequest, HeartbeatResponse,
    IngestRecord, IngestRequest, IngestResponse, ServerStatus,
};
use async_trait::async_trait;
use base64::prelude::*;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, warn};

/// HTTP client for the fleet API
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(base_url: &str, timeout: Duration, verify_tls: bool) -> Result<Self, TransportError> {
        if !verify_tls {
            warn!("TLS certificate verification is disabled for {}", base_url);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("fleetlink/{}", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key_header(api_key: &str) -> String {
        format!("ApiKey {}", api_key)
    }

    /// Generic response handler
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();

        match status {
            _ if status.is_success() => {
                let body = response.json::<T>().await?;
                Ok(body)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let error = self.parse_error(response).await;
                error!("Authentication failed ({}): {}", status, error.message);
                Err(TransportError::auth(status.as_u16(), error.message))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok());
                warn!("Rate limited, retry after {:?}s", retry_after);
                Err(TransportError::RateLimited(retry_after))
            }
            StatusCode::REQUEST_TIMEOUT => Err(TransportError::Timeout),
            StatusCode::BAD_REQUEST
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNPROCESSABLE_ENTITY => {
                let error = self.parse_error(response).await;
                warn!("Request rejected ({}): {}", status, error.message);
                Err(TransportError::validation(status.as_u16(), error.message))
            }
            _ if status.is_client_error() => {
                let error = self.parse_error(response).await;
                error!("Unexpected response {} from {}: {}", status, self.base_url, error.message);
                Err(TransportError::unexpected(status.as_u16(), error.message))
            }
            _ => {
                let error = self.parse_error(response).await;
                error!("Server error {}: {}", status, error.message);
                Err(TransportError::server(status.as_u16(), error.message))
            }
        }
    }

    async fn parse_error(&self, response: reqwest::Response) -> ApiError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        serde_json::from_str::<ApiError>(&text)
            .ok()
            .filter(|e| !e.message.is_empty())
            .unwrap_or_else(|| ApiError {
                code: "unknown".to_string(),
                message: if text.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("Unknown error")
                        .to_string()
                } else {
                    text
                },
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn status(&self) -> Result<ServerStatus, TransportError> {
        let url = format!("{}/status", self.base_url);

        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    async fn enroll(
        &self,
        token: &str,
        metadata: &AgentMetadata,
    ) -> Result<EnrollResponse, TransportError> {
        let url = format!("{}/enroll", self.base_url);

        debug!("Enrolling device with enrollment token");

        let request = EnrollRequest {
            token,
            kind: "PERMANENT",
            metadata,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", Self::api_key_header(token))
            .json(&request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn ingest(
        &self,
        device_id: &str,
        api_key: &str,
        batch_id: &str,
        records: &[TelemetryRecord],
    ) -> Result<IngestResponse, TransportError> {
        let url = format!("{}/ingest", self.base_url);

        let request = IngestRequest {
            device_id: device_id.to_string(),
            batch_id: batch_id.to_string(),
            records: records
                .iter()
                .map(|r| IngestRecord {
                    local_id: r.local_id,
                    payload: BASE64_STANDARD.encode(&r.payload),
                    created_at: r.created_at,
                })
                .collect(),
        };

        debug!(
            "Sending batch {} with {} records",
            batch_id,
            request.records.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", Self::api_key_header(api_key))
            .json(&request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn heartbeat(
        &self,
        device_id: &str,
        api_key: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        let url = format!("{}/agents/{}/checkin", self.base_url, device_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", Self::api_key_header(api_key))
            .json(request)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn ack_actions(
        &self,
        device_id: &str,
        api_key: &str,
        request: &AckRequest,
    ) -> Result<AckResponse, TransportError> {
        let url = format!("{}/agents/{}/acks", self.base_url, device_id);
        debug!("Acknowledging {} actions", request.events.len());

        let response = self
            .client
            .post(&url)
            .header("Authorization", Self::api_key_header(api_key))
            .json(request)
            .send()
            .await?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordStatus;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(local_id: i64, payload: &[u8]) -> TelemetryRecord {
        TelemetryRecord {
            local_id,
            payload: payload.to_vec(),
            created_at: Utc::now(),
            attempts: 0,
            status: RecordStatus::InFlight,
            last_attempt_at: None,
        }
    }

    fn transport(server: &MockServer) -> HttpTransport {
        HttpTransport::new(&server.uri(), Duration::from_secs(5), true).unwrap()
    }

    #[test]
    fn test_trailing_slash_removed() {
        let t = HttpTransport::new("https://fleet.example.com/", Duration::from_secs(10), true)
            .unwrap();
        assert_eq!(t.base_url(), "https://fleet.example.com");
    }

    #[tokio::test]
    async fn test_status_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "HEALTHY"})))
            .mount(&server)
            .await;

        let status = transport(&server).status().await.unwrap();
        assert!(status.is_healthy());
    }

    #[tokio::test]
    async fn test_enroll_sends_token_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/enroll"))
            .and(header("authorization", "ApiKey enroll-123"))
            .and(body_partial_json(json!({
                "token": "enroll-123",
                "type": "PERMANENT",
                "metadata": {"agent": {"version": "8.10.2"}}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "agent-42",
                "access_api_key": "key-42",
                "policy_id": "default"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = transport(&server)
            .enroll("enroll-123", &AgentMetadata::default())
            .await
            .unwrap();
        assert_eq!(resp.device_id, "agent-42");
        assert_eq!(resp.api_key, "key-42");
    }

    #[tokio::test]
    async fn test_ingest_encodes_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(header("authorization", "ApiKey key-1"))
            .and(body_partial_json(json!({
                "device_id": "dev-1",
                "batch_id": "b-1",
                "records": [
                    {"local_id": 1, "payload": "aGVsbG8="},
                    {"local_id": 2, "payload": "d29ybGQ="}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "acked": [1],
                "rejected": [{"local_id": 2, "reason": "schema"}]
            })))
            .mount(&server)
            .await;

        let resp = transport(&server)
            .ingest(
                "dev-1",
                "key-1",
                "b-1",
                &[record(1, b"hello"), record(2, b"world")],
            )
            .await
            .unwrap();
        assert_eq!(resp.acked, vec![1]);
        assert_eq!(resp.rejected[0].local_id, 2);
        assert_eq!(resp.rejected[0].reason, "schema");
    }

    #[tokio::test]
    async fn test_auth_failure_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"code": "invalid_key", "message": "revoked"})),
            )
            .mount(&server)
            .await;

        let err = transport(&server)
            .ingest("dev-1", "old", "b-1", &[record(1, b"x")])
            .await
            .unwrap_err();
        match err {
            TransportError::Auth { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "revoked");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = transport(&server)
            .ingest("dev-1", "k", "b-1", &[record(1, b"x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RateLimited(Some(7))));
    }

    #[tokio::test]
    async fn test_server_and_validation_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/enroll"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let t = transport(&server);
        let err = t.enroll("tok", &AgentMetadata::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::Server { status: 503, ref message } if message == "maintenance"));

        let err = t
            .ingest("dev-1", "k", "b-1", &[record(1, b"x")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Validation { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_transient() {
        let server = MockServer::start().await;
        for status in [404u16, 405, 410] {
            server.reset().await;
            Mock::given(method("POST"))
                .and(path("/ingest"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = transport(&server)
                .ingest("dev-1", "k", "b-1", &[record(1, b"x")])
                .await
                .unwrap_err();
            assert!(
                matches!(err, TransportError::UnexpectedStatus { status: s, .. } if s == status),
                "{} classified as {:?}",
                status,
                err
            );
            assert_eq!(err.class(), crate::error::ErrorClass::Transient);
        }
    }

    #[tokio::test]
    async fn test_timeout_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "HEALTHY"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let t = HttpTransport::new(&server.uri(), Duration::from_millis(100), true).unwrap();
        let err = t.status().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_decode_error_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = transport(&server).status().await.unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[tokio::test]
    async fn test_checkin_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/dev-7/checkin"))
            .and(header("authorization", "ApiKey k7"))
            .and(body_partial_json(json!({"status": "online", "ack_token": "a-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ack_token": "a-2",
                "actions": [{"type": "UNENROLL"}]
            })))
            .mount(&server)
            .await;

        let request = HeartbeatRequest {
            status: "online".into(),
            ack_token: Some("a-1".into()),
            message: "healthy".into(),
            local_metadata: AgentMetadata::default(),
            stats: Default::default(),
        };
        let resp = transport(&server)
            .heartbeat("dev-7", "k7", &request)
            .await
            .unwrap();
        assert_eq!(resp.ack_token.as_deref(), Some("a-2"));
        assert_eq!(
            resp.actions,
            vec![crate::types::ServerAction::Unenroll { action_id: None }]
        );
    }

    #[tokio::test]
    async fn test_ack_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agents/dev-7/acks"))
            .and(header("authorization", "ApiKey k7"))
            .and(body_partial_json(json!({
                "events": [{
                    "type": "ACTION_RESULT",
                    "subtype": "ACKNOWLEDGED",
                    "agent_id": "dev-7",
                    "action_id": "act-1"
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": "acks",
                "items": [{"status": 200, "message": "OK"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = transport(&server)
            .ack_actions("dev-7", "k7", &AckRequest::new("dev-7", &["act-1"]))
            .await
            .unwrap();
        assert_eq!(resp.items.len(), 1);
        assert!(resp.first_error().is_none());
    }
}
