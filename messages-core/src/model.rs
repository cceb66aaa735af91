//! The canonical data model: Message, Account, Thread, and platform/daemon
//! state snapshots. Field names are platform-neutral rather than mirroring
//! any single platform's wire format.

use serde::{Deserialize, Serialize};

/// Integer classifier partitioning the message namespace. New kinds must
/// never break readers of older kinds — only append to a range.
pub mod kind {
    pub const CORE_MIN: i32 = 0;
    pub const CORE_MAX: i32 = 99;
    pub const CLAUDE_EVENT_MIN: i32 = 100;
    pub const CLAUDE_EVENT_MAX: i32 = 199;
    pub const GIT_MIN: i32 = 200;
    pub const GIT_MAX: i32 = 249;
    pub const PLATFORM_MIN: i32 = 1000;

    pub const PLAIN_TEXT: i32 = 0;
    pub const SYSTEM_NOTICE: i32 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub name: Option<String>,
    pub handle: Option<String>,
    pub did: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRefs {
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub room_id: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageSource {
    pub platform: String,
    pub platform_id: Option<String>,
    pub url: Option<String>,
}

/// A stored message. Immutable once inserted, except for `imported_at` and
/// additive tags — see the normalizer's idempotent-insert rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub author: Author,
    pub created_at: i64,
    pub imported_at: i64,
    pub kind: i32,
    pub content: String,
    pub title: Option<String>,
    pub refs: MessageRefs,
    pub source: MessageSource,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub platform: String,
    pub handle: String,
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub did: Option<String>,
    pub name: String,
    pub identities: Vec<Identity>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    Dm,
    Group,
    Channel,
    Topic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadSource {
    pub platform: String,
    pub platform_id: Option<String>,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thread {
    pub id: String,
    pub title: Option<String>,
    pub participants: Vec<String>,
    #[serde(rename = "type")]
    pub thread_type: ThreadType,
    pub source: ThreadSource,
    pub created_at: i64,
    pub last_message_at: Option<i64>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlatformStatus {
    Stopped,
    Starting,
    Connected,
    Disconnected,
    Error,
    Recovering,
}

impl PlatformStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformStatus::Stopped => "stopped",
            PlatformStatus::Starting => "starting",
            PlatformStatus::Connected => "connected",
            PlatformStatus::Disconnected => "disconnected",
            PlatformStatus::Error => "error",
            PlatformStatus::Recovering => "recovering",
        }
    }
}

impl std::str::FromStr for PlatformStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "error" => Ok(Self::Error),
            "recovering" => Ok(Self::Recovering),
            other => Err(format!("unknown platform status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformState {
    pub platform: String,
    pub status: String,
    pub last_connected: Option<i64>,
    pub last_message: Option<i64>,
    pub last_error: Option<String>,
    pub error_count: i64,
    pub message_count: i64,
    pub reconnect_attempts: u32,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Degraded,
}

impl DaemonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonStatus::Stopped => "stopped",
            DaemonStatus::Starting => "starting",
            DaemonStatus::Running => "running",
            DaemonStatus::Stopping => "stopping",
            DaemonStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub status: DaemonStatus,
    pub pid: u32,
    pub started_at: i64,
    pub platforms: Vec<PlatformState>,
    pub healthy: usize,
    pub total: usize,
}

impl DaemonState {
    pub fn uptime_seconds(&self, now_ms: i64) -> i64 {
        ((now_ms - self.started_at).max(0)) / 1000
    }
}
