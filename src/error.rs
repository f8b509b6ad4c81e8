use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the ban-decision engine.
///
/// Only `LogOpen` and `LogRead` are fatal to the monitoring task; the rest are
/// logged by the caller and processing continues.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open log file {path}: {source}")]
    LogOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read log file {path}: {source}")]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blacklist {path}: {source}")]
    Blacklist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("firewall {action} failed for {ip}: {reason}")]
    Enforcement {
        action: &'static str,
        ip: IpAddr,
        reason: String,
    },

    #[error("notification delivery failed: {0}")]
    Notification(String),

    #[error("geolocation lookup failed for {ip}: {reason}")]
    Lookup { ip: IpAddr, reason: String },

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the monitoring task must stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LogOpen { .. } | Error::LogRead { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let open = Error::LogOpen {
            path: PathBuf::from("/var/log/auth.log"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(open.is_fatal());

        let block = Error::Enforcement {
            action: "block",
            ip: "10.0.0.1".parse().unwrap(),
            reason: "exit status 1".to_string(),
        };
        assert!(!block.is_fatal());
        assert_eq!(
            block.to_string(),
            "firewall block failed for 10.0.0.1: exit status 1"
        );
    }
}
