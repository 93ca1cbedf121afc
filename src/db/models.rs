//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Raised when a monitor row carries a type string outside the closed set.
#[derive(Error, Debug)]
#[error("unknown monitor type: {0}")]
pub struct UnknownMonitorType(pub String);

/// The closed set of supported check types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorType {
    Http,
    Tcp,
    Ping,
    GameServerQuery,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Tcp => "tcp",
            MonitorType::Ping => "ping",
            MonitorType::GameServerQuery => "game-server-query",
        }
    }
}

impl FromStr for MonitorType {
    type Err = UnknownMonitorType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(MonitorType::Http),
            "tcp" => Ok(MonitorType::Tcp),
            "ping" => Ok(MonitorType::Ping),
            "game-server-query" => Ok(MonitorType::GameServerQuery),
            other => Err(UnknownMonitorType(other.to_string())),
        }
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified check outcome. A check always resolves to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
        }
    }
}

/// Raised when a state row carries a status string outside the closed set.
#[derive(Error, Debug)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(Status::Up),
            "DOWN" => Ok(Status::Down),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitor definition as stored in the `monitors` table.
///
/// The engine only reads these; they are created and edited through the
/// store's command interface by the admin collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorDefinition {
    pub slug: String,
    pub name: String,
    pub monitor_type: MonitorType,
    /// Opaque target string interpreted per type: URL for http, host:port
    /// for tcp and game-server-query, hostname for ping.
    pub target: String,
    pub interval_ms: i64,
}

/// One probe outcome. Produced by a check strategy, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: Status,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub details: Option<serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate per-slug state. Counters are monotonic and never reset.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorState {
    pub current_status: Status,
    pub last_checked: DateTime<Utc>,
    pub uptime_count: i64,
    pub downtime_count: i64,
}

/// One check outcome staged in the local append log until the next flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub slug: String,
    pub status: Status,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub details: Option<serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

impl BufferedRecord {
    pub fn new(slug: &str, result: &CheckResult) -> Self {
        Self {
            slug: slug.to_string(),
            status: result.status,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            details: result.details.clone(),
            checked_at: result.checked_at,
        }
    }
}

/// Incremental per-slug state change computed from a flush batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDelta {
    pub slug: String,
    pub latest_status: Status,
    pub latest_checked: DateTime<Utc>,
    pub up: i64,
    pub down: i64,
}

static SLUG_RE: OnceLock<regex::Regex> = OnceLock::new();

/// Check a slug against the allowed pattern (lowercase alnum + hyphen).
pub fn is_valid_slug(slug: &str) -> bool {
    let re = SLUG_RE.get_or_init(|| regex::Regex::new("^[a-z0-9-]{1,100}$").unwrap());
    re.is_match(slug)
}
