//! Data models for stored data.

use core::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use fieldgate_types::{Device, DeviceKind};

/// A registered device together with its runtime status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    #[serde(flatten)]
    pub device: Device,
    /// Whether the last poll succeeded.
    pub online: bool,
    /// Last successful poll.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    /// Consecutive failed polls.
    pub error_count: u32,
}

/// Partial status update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub online: Option<bool>,
    pub last_seen: Option<OffsetDateTime>,
    pub error_count: Option<u32>,
}

/// A stored record that has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// Store-assigned sequence id.
    pub id: i64,
    pub device_id: String,
    pub kind: DeviceKind,
    /// Record body as inserted.
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Outcome of a retention pass over one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionStats {
    pub kind: DeviceKind,
    /// Records deleted, or that would be deleted on a dry run.
    pub records: u64,
    pub days_old: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub newest: Option<OffsetDateTime>,
    pub dry_run: bool,
}

/// Delivery backlog and reclaimable volume for one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub kind: DeviceKind,
    pub uploaded: u64,
    pub pending: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub oldest_uploaded: Option<OffsetDateTime>,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Success,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Success => "success",
            UploadStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_sql(s: &str) -> Self {
        if s == "success" {
            UploadStatus::Success
        } else {
            UploadStatus::Failed
        }
    }
}

/// One row of the upload audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadLog {
    pub batch_id: String,
    /// Kind string of the batch.
    pub data_type: String,
    pub record_count: u32,
    pub status: UploadStatus,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
}

/// An upload log row with its write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadLogEntry {
    #[serde(flatten)]
    pub log: UploadLog,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Severity of a system log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Debug => "DEBUG",
            EventLevel::Info => "INFO",
            EventLevel::Warning => "WARNING",
            EventLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the system audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemLog {
    pub level: String,
    pub module: String,
    pub message: String,
    pub device_id: Option<String>,
    pub extra: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
