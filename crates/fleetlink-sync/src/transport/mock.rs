//! Mock transport for testing.
//!
//! Allows queueing responses and capturing calls for verification.

use super::{Transport, TransportError};
use crate::store::TelemetryRecord;
use crate::types::{
    AckItem, AckRequest, AckResponse, AgentMetadata, EnrollResponse, HeartbeatRequest, HeartbeatResponse, IngestResponse,
    ServerStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Status,
    Enroll {
        token: String,
    },
    Ingest {
        device_id: String,
        api_key: String,
        batch_id: String,
        local_ids: Vec<i64>,
    },
    Heartbeat {
        device_id: String,
        ack_token: Option<String>,
    },
    Ack {
        device_id: String,
        action_ids: Vec<String>,
    },
}

/// Mock transport for testing.
///
/// With nothing queued it reports a healthy server, enrolls every token
/// that was not rejected, and acknowledges every ingested record.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    calls: Vec<MockCall>,
    status: Option<Result<ServerStatus, TransportError>>,
    enroll_queue: VecDeque<Result<EnrollResponse, TransportError>>,
    rejected_tokens: HashSet<String>,
    ingest_queue: VecDeque<Result<IngestResponse, TransportError>>,
    ingest_delay: Option<Duration>,
    heartbeat_queue: VecDeque<Result<HeartbeatResponse, TransportError>>,
    ack_queue: VecDeque<Result<AckResponse, TransportError>>,
    enrollments: u64,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result of every `status()` call.
    pub fn set_status(&self, status: Result<ServerStatus, TransportError>) {
        self.inner.lock().status = Some(status);
    }

    /// Queue the result of the next `enroll()` call.
    pub fn queue_enroll(&self, result: Result<EnrollResponse, TransportError>) {
        self.inner.lock().enroll_queue.push_back(result);
    }

    /// Answer every enrollment with this token with a 401.
    pub fn reject_token(&self, token: &str) {
        self.inner.lock().rejected_tokens.insert(token.to_string());
    }

    /// Queue the response to the next `ingest()` call.
    pub fn queue_ingest(&self, result: Result<IngestResponse, TransportError>) {
        self.inner.lock().ingest_queue.push_back(result);
    }

    /// Cause the next `ingest()` call to fail with the given error.
    pub fn fail_next_ingest(&self, error: TransportError) {
        self.queue_ingest(Err(error));
    }

    /// Delay every `ingest()` call, to exercise cancellation and budgets.
    pub fn set_ingest_delay(&self, delay: Duration) {
        self.inner.lock().ingest_delay = Some(delay);
    }

    /// Queue the result of the next `heartbeat()` call.
    pub fn queue_heartbeat(&self, result: Result<HeartbeatResponse, TransportError>) {
        self.inner.lock().heartbeat_queue.push_back(result);
    }

    /// Queue the result of the next `ack_actions()` call.
    pub fn queue_ack(&self, result: Result<AckResponse, TransportError>) {
        self.inner.lock().ack_queue.push_back(result);
    }

    /// Action ids of every `ack_actions()` call, flattened in call order.
    pub fn acked_actions(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Ack { action_ids, .. } => Some(action_ids.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Get all calls that were made.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().calls.clone()
    }

    /// Local ids of each ingest call, in call order.
    pub fn ingest_batches(&self) -> Vec<Vec<i64>> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Ingest { local_ids, .. } => Some(local_ids.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every local id handed to `ingest()`, flattened in call order.
    pub fn delivered_ids(&self) -> Vec<i64> {
        self.ingest_batches().into_iter().flatten().collect()
    }

    /// Number of `enroll()` calls.
    pub fn enroll_calls(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Enroll { .. }))
            .count()
    }

    /// Clear all state (calls, queues, rejections).
    pub fn reset(&self) {
        *self.inner.lock() = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn status(&self) -> Result<ServerStatus, TransportError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Status);
        inner.status.clone().unwrap_or_else(|| {
            Ok(ServerStatus {
                status: "HEALTHY".to_string(),
                name: Some("mock".to_string()),
            })
        })
    }

    async fn enroll(
        &self,
        token: &str,
        _metadata: &AgentMetadata,
    ) -> Result<EnrollResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Enroll {
            token: token.to_string(),
        });

        if inner.rejected_tokens.contains(token) {
            return Err(TransportError::auth(401, "invalid enrollment token"));
        }

        if let Some(result) = inner.enroll_queue.pop_front() {
            return result;
        }

        inner.enrollments += 1;
        Ok(EnrollResponse {
            device_id: format!("mock-device-{}", inner.enrollments),
            api_key: format!("mock-api-key-{}", inner.enrollments),
            api_key_id: None,
            policy_id: Some("default".to_string()),
            enrolled_at: None,
        })
    }

    async fn ingest(
        &self,
        device_id: &str,
        api_key: &str,
        batch_id: &str,
        records: &[TelemetryRecord],
    ) -> Result<IngestResponse, TransportError> {
        let local_ids: Vec<i64> = records.iter().map(|r| r.local_id).collect();

        let (delay, result) = {
            let mut inner = self.inner.lock();
            inner.calls.push(MockCall::Ingest {
                device_id: device_id.to_string(),
                api_key: api_key.to_string(),
                batch_id: batch_id.to_string(),
                local_ids: local_ids.clone(),
            });
            let result = inner
                .ingest_queue
                .pop_front()
                .unwrap_or_else(|| Ok(IngestResponse::ack_all(local_ids)));
            (inner.ingest_delay, result)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        result
    }

    async fn heartbeat(
        &self,
        device_id: &str,
        _api_key: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Heartbeat {
            device_id: device_id.to_string(),
            ack_token: request.ack_token.clone(),
        });
        inner
            .heartbeat_queue
            .pop_front()
            .unwrap_or_else(|| Ok(HeartbeatResponse::default()))
    }

    async fn ack_actions(
        &self,
        device_id: &str,
        _api_key: &str,
        request: &AckRequest,
    ) -> Result<AckResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall::Ack {
            device_id: device_id.to_string(),
            action_ids: request.events.iter().map(|e| e.action_id.clone()).collect(),
        });
        inner.ack_queue.pop_front().unwrap_or_else(|| {
            Ok(AckResponse {
                action: "acks".to_string(),
                items: request
                    .events
                    .iter()
                    .map(|_| AckItem {
                        status: 200,
                        message: "OK".to_string(),
                    })
                    .collect(),
            })
        })
    }
}
