use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A downstream system that receives finished results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub id: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template with `{{variable}}` placeholders. Defaults to the result envelope.
    #[serde(default)]
    pub body_template: Option<String>,
    /// HMAC-SHA256 key for the body signature.
    pub secret: String,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default)]
    pub auth: AuthScheme,
    #[serde(default = "default_push_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".into()
}

fn default_signature_header() -> String {
    "X-Signature-256".into()
}

fn default_push_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    Bearer { token: String },
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCapture {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCapture {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// One delivery try to one target. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    pub target_id: String,
    /// 1-based retry ordinal.
    pub attempt: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub request: RequestCapture,
    pub response: Option<ResponseCapture>,
    /// Backoff computed after this attempt failed.
    pub retry_delay_secs: Option<u64>,
    pub attempted_at: DateTime<Utc>,
}

/// A (task, target) pair whose retries are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub task_id: Uuid,
    pub target_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}
