//! Shared types for fleet server communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Agent version reported to the fleet server
pub const AGENT_VERSION: &str = "8.10.2";

/// Agent metadata sent during enrollment and check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub agent: AgentInfo,
    pub host: HostInfo,
}

/// Agent block of the metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Reported agent version
    pub version: String,

    /// Version of this build
    pub build: String,

    /// Whether the agent was built for snapshot testing
    pub snapshot: bool,
}

/// Host block of the metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,

    /// Operating system
    pub os: String,

    /// OS version
    pub os_version: String,

    /// Architecture (x86_64, aarch64, etc.)
    pub arch: String,

    /// Number of CPUs
    pub cpu_count: u32,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            agent: AgentInfo {
                version: AGENT_VERSION.to_string(),
                build: env!("CARGO_PKG_VERSION").to_string(),
                snapshot: false,
            },
            host: HostInfo {
                hostname: hostname::get()
                    .map(|h: std::ffi::OsString| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                os: std::env::consts::OS.to_string(),
                os_version: os_version(),
                arch: std::env::consts::ARCH.to_string(),
                cpu_count: num_cpus(),
            },
        }
    }
}

/// Enrollment request payload
#[derive(Debug, Clone, Serialize)]
pub struct EnrollRequest<'a> {
    pub token: &'a str,

    #[serde(rename = "type")]
    pub kind: &'static str,

    pub metadata: &'a AgentMetadata,
}

/// Enrollment response from server
///
/// Accepts both the compact `{device_id, api_key}` shape and the fleet-style
/// `{id, access_api_key, ...}` shape.
#[derive(Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    /// Device ID assigned by the server
    #[serde(alias = "id")]
    pub device_id: String,

    /// API key authenticating every later call
    #[serde(alias = "access_api_key")]
    pub api_key: String,

    /// Server-side id of the API key
    #[serde(default, alias = "access_api_key_id")]
    pub api_key_id: Option<String>,

    /// Policy assigned at enrollment
    #[serde(default)]
    pub policy_id: Option<String>,

    /// Server enrollment timestamp
    #[serde(default)]
    pub enrolled_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for EnrollResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollResponse")
            .field("device_id", &self.device_id)
            .field("api_key", &"[REDACTED]")
            .field("api_key_id", &self.api_key_id)
            .field("policy_id", &self.policy_id)
            .field("enrolled_at", &self.enrolled_at)
            .finish()
    }
}

/// Server health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    /// HEALTHY when the server accepts enrollments
    pub status: String,

    #[serde(default)]
    pub name: Option<String>,
}

impl ServerStatus {
    /// Check if the server reports itself healthy
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

/// Secret material held in the credential vault
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultSecret {
    /// Device ID the API key belongs to
    pub device_id: String,

    /// API key for ingest and check-in calls
    pub api_key: String,

    /// Server-side id of the API key
    pub api_key_id: Option<String>,

    /// Token the device enrolled with, kept for re-enrollment
    pub enrollment_token: Option<String>,
}

// Don't leak secrets in debug output
impl std::fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSecret")
            .field("device_id", &self.device_id)
            .field("api_key", &"[REDACTED]")
            .field("api_key_id", &self.api_key_id)
            .field(
                "enrollment_token",
                &self.enrollment_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Device identity produced by a successful enrollment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub policy_id: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

/// Credentials for one authenticated call, read from the vault
#[derive(Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub api_key: String,
}

impl std::fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("device_id", &self.device_id)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// One record in an ingest request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub local_id: i64,

    /// Base64 (standard alphabet) payload bytes
    pub payload: String,

    pub created_at: DateTime<Utc>,
}

/// Ingest request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub device_id: String,
    pub batch_id: String,
    pub records: Vec<IngestRecord>,
}

/// Ingest response from server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Local ids the server durably accepted
    #[serde(default)]
    pub acked: Vec<i64>,

    /// Local ids the server refuses to accept, ever
    #[serde(default)]
    pub rejected: Vec<RejectedRecord>,
}

impl IngestResponse {
    /// Response acknowledging every given id
    pub fn ack_all(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            acked: ids.into_iter().collect(),
            rejected: vec![],
        }
    }
}

/// Record-level rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub local_id: i64,
    pub reason: String,
}

/// Agent health as reported to the fleet server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    #[default]
    Healthy,
    Unhealthy,
}

impl AgentHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentHealth::Healthy => "healthy",
            AgentHealth::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("unhealthy") {
            AgentHealth::Unhealthy
        } else {
            AgentHealth::Healthy
        }
    }
}

/// Check-in request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Always "online" while the agent runs
    pub status: String,

    /// Token from the previous check-in response
    pub ack_token: Option<String>,

    /// Human-readable health summary
    pub message: String,

    pub local_metadata: AgentMetadata,

    pub stats: CheckinStats,
}

/// Agent counters attached to a check-in
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinStats {
    pub agent_health: AgentHealth,
    pub buffered_records: u64,
    pub failed_records: u64,
    pub total_checkins: u64,
    pub total_failures: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_sent_count: u64,
}

/// Check-in response from server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Token to echo on the next check-in
    #[serde(default)]
    pub ack_token: Option<String>,

    /// Actions the agent must carry out
    #[serde(default)]
    pub actions: Vec<ServerAction>,
}

/// Actions from server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerAction {
    /// A new policy was assigned to the device
    PolicyChange {
        #[serde(default, alias = "id")]
        action_id: Option<String>,

        #[serde(default)]
        policy_id: Option<String>,

        /// Agent settings carried by the policy
        #[serde(default)]
        settings: Option<PolicySettings>,
    },

    /// The device was removed from the fleet
    Unenroll {
        #[serde(default, alias = "id")]
        action_id: Option<String>,
    },

    /// Anything this agent does not understand
    #[serde(other)]
    Unknown,
}

impl ServerAction {
    /// Server-assigned id, when the action expects an acknowledgement
    pub fn action_id(&self) -> Option<&str> {
        match self {
            ServerAction::PolicyChange { action_id, .. } | ServerAction::Unenroll { action_id } => {
                action_id.as_deref()
            }
            ServerAction::Unknown => None,
        }
    }
}

/// Delivery settings pushed with a policy.
///
/// Intervals are strings such as `"30s"`, `"5m"` or `"1h"`. A bare number
/// is read as seconds. Missing, zero or unparseable values leave the
/// local setting in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default)]
    pub checkin_interval: Option<String>,

    #[serde(default, alias = "es_request_interval")]
    pub put_interval: Option<String>,

    #[serde(default)]
    pub max_documents_per_request: Option<usize>,

    #[serde(default)]
    pub use_backoff: Option<bool>,

    #[serde(default)]
    pub max_backoff_interval: Option<String>,
}

impl PolicySettings {
    pub fn checkin_interval(&self) -> Option<Duration> {
        self.checkin_interval.as_deref().and_then(parse_interval)
    }

    pub fn put_interval(&self) -> Option<Duration> {
        self.put_interval.as_deref().and_then(parse_interval)
    }

    pub fn max_backoff_interval(&self) -> Option<Duration> {
        self.max_backoff_interval.as_deref().and_then(parse_interval)
    }

    pub fn max_documents_per_request(&self) -> Option<usize> {
        self.max_documents_per_request.filter(|n| *n > 0)
    }
}

/// Parse `"90"`, `"90s"`, `"5m"`, `"2h"`, `"1d"` or `"1w"`.
pub fn parse_interval(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let secs = match unit.trim() {
        "" | "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        "w" => n.checked_mul(604_800)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Acknowledgement of received actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub events: Vec<AckEvent>,
}

impl AckRequest {
    pub fn new(device_id: &str, action_ids: &[&str]) -> Self {
        Self {
            events: action_ids
                .iter()
                .map(|id| AckEvent::acknowledged(device_id, id))
                .collect(),
        }
    }
}

/// One acknowledged action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckEvent {
    /// Always "ACTION_RESULT"
    #[serde(rename = "type")]
    pub kind: String,

    /// Always "ACKNOWLEDGED"
    pub subtype: String,

    pub agent_id: String,

    pub action_id: String,

    pub message: String,

    pub timestamp: DateTime<Utc>,
}

impl AckEvent {
    pub fn acknowledged(device_id: &str, action_id: &str) -> Self {
        Self {
            kind: "ACTION_RESULT".to_string(),
            subtype: "ACKNOWLEDGED".to_string(),
            agent_id: device_id.to_string(),
            action_id: action_id.to_string(),
            message: format!("Action {} acknowledged", action_id),
            timestamp: Utc::now(),
        }
    }
}

/// Per-event results of an acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckResponse {
    #[serde(default)]
    pub action: String,

    #[serde(default)]
    pub items: Vec<AckItem>,
}

impl AckResponse {
    /// First item the server did not accept
    pub fn first_error(&self) -> Option<&AckItem> {
        self.items.iter().find(|i| !(200..300).contains(&i.status))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckItem {
    pub status: u16,

    #[serde(default)]
    pub message: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code
    #[serde(default)]
    pub code: String,

    /// Error message
    #[serde(default)]
    pub message: String,
}

// Helper functions

fn os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content
                    .lines()
                    .find(|l| l.starts_with("VERSION_ID="))
                    .map(|l| {
                        l.trim_start_matches("VERSION_ID=")
                            .trim_matches('"')
                            .to_string()
                    })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "unknown".to_string()
    }
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}
