use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use tracing::trace;

use crate::models::AuthEvent;

const FAILED_MARKER: &str = "Failed password";
const ACCEPTED_MARKER: &str = "Accepted password";

/// Turns sshd log lines into authentication events
#[derive(Debug, Clone)]
pub struct EventExtractor {
    source_ip: Regex,
}

impl EventExtractor {
    pub fn new() -> Self {
        Self {
            source_ip: Regex::new(r"from (\d{1,3}(?:\.\d{1,3}){3})\b").unwrap(),
        }
    }

    /// Extract the event carried by `line`, if any.
    ///
    /// Lines with a marker but no usable IPv4 source are log noise and yield `None`.
    pub fn extract(&self, line: &str) -> Option<AuthEvent> {
        if line.contains(FAILED_MARKER) {
            self.source_of(line).map(AuthEvent::FailedLogin)
        } else if line.contains(ACCEPTED_MARKER) {
            self.source_of(line).map(AuthEvent::SuccessfulLogin)
        } else {
            None
        }
    }

    fn source_of(&self, line: &str) -> Option<IpAddr> {
        let captures = self.source_ip.captures(line)?;
        let text = captures.get(1)?.as_str();
        match text.parse::<Ipv4Addr>() {
            Ok(ip) => Some(IpAddr::V4(ip)),
            Err(_) => {
                trace!("Ignoring malformed source address {:?}", text);
                None
            }
        }
    }
}

impl Default for EventExtractor {
    fn default() -> Self {
        Self::new()
    }
}
