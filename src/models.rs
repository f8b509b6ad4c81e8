use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Authentication event extracted from a single log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthEvent {
    FailedLogin(IpAddr),
    SuccessfulLogin(IpAddr),
}

impl std::fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthEvent::FailedLogin(ip) => write!(f, "failed login from {}", ip),
            AuthEvent::SuccessfulLogin(ip) => write!(f, "accepted login from {}", ip),
        }
    }
}

/// Result of counting one failure against an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Failure count after this call (unchanged when the address is banned)
    pub count: u32,
    /// Whether the count has reached the ban threshold
    pub reached_threshold: bool,
}

/// An active ban as seen in the store or the blacklist file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanEntry {
    pub ip: IpAddr,
    pub expires_at: DateTime<Utc>,
}

impl BanEntry {
    pub fn new(ip: IpAddr, expires_at: DateTime<Utc>) -> Self {
        Self { ip, expires_at }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What the coordinator decided for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Failure from an address that is already banned; not counted
    Rejected { ip: IpAddr },
    /// Failure counted, threshold not reached
    Counted { ip: IpAddr, attempts: u32 },
    /// Failure counted and the address is now banned
    Banned {
        ip: IpAddr,
        attempts: u32,
        expires_at: DateTime<Utc>,
    },
    /// Successful login observed
    Accepted { ip: IpAddr },
}

/// Notification queued for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    LoginSucceeded {
        ip: IpAddr,
        at: DateTime<Utc>,
    },
    LoginFailed {
        ip: IpAddr,
        attempts: u32,
        max_attempts: u32,
        at: DateTime<Utc>,
    },
    Banned {
        ip: IpAddr,
        duration: Duration,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
}

impl Notification {
    pub fn ip(&self) -> IpAddr {
        match self {
            Notification::LoginSucceeded { ip, .. }
            | Notification::LoginFailed { ip, .. }
            | Notification::Banned { ip, .. } => *ip,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::LoginSucceeded { .. } => NotificationKind::LoginSuccess,
            Notification::LoginFailed { .. } => NotificationKind::LoginFailed,
            Notification::Banned { .. } => NotificationKind::IpBanned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    LoginSuccess,
    LoginFailed,
    IpBanned,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::LoginSuccess => write!(f, "login_success"),
            NotificationKind::LoginFailed => write!(f, "login_failed"),
            NotificationKind::IpBanned => write!(f, "ip_banned"),
        }
    }
}

/// Outcome of one sweeper tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Addresses whose bans expired and were removed from the store
    pub removed: Vec<IpAddr>,
    /// Addresses whose firewall unblock failed (still removed from the store)
    pub unblock_failures: Vec<IpAddr>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}
