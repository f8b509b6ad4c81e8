//! Turns authentication events into ban decisions.
//!
//! Events are handled one at a time in arrival order. Side effects of a new
//! ban (persisting, blocking, notifying) are best effort: a failure is logged
//! and the in-memory ban stays in place.

use chrono::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blacklist::Blacklist;
use crate::error::Result;
use crate::extractor::EventExtractor;
use crate::firewall::Enforcer;
use crate::models::{AuthEvent, Decision, Notification};
use crate::notify::NotificationQueue;
use crate::store::BanStore;
use crate::tailer::LineSource;

pub struct Coordinator {
    store: Arc<BanStore>,
    enforcer: Arc<dyn Enforcer>,
    blacklist: Blacklist,
    ban_duration: Duration,
    notifications: NotificationQueue,
    extractor: EventExtractor,
}

impl Coordinator {
    pub fn new(
        store: Arc<BanStore>,
        enforcer: Arc<dyn Enforcer>,
        blacklist: Blacklist,
        ban_duration: Duration,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            store,
            enforcer,
            blacklist,
            ban_duration,
            notifications,
            extractor: EventExtractor::new(),
        }
    }

    /// Apply one event to the ban state
    pub async fn handle_event(&self, event: AuthEvent) -> Decision {
        match event {
            AuthEvent::FailedLogin(ip) => {
                if self.store.is_banned(&ip) {
                    warn!(ip = %ip, "Banned address attempted login");
                    return Decision::Rejected { ip };
                }

                let outcome = self.store.record_failure(ip);
                let max_attempts = self.store.threshold();
                warn!(
                    ip = %ip,
                    attempts = outcome.count,
                    max_attempts,
                    "SSH login failed"
                );

                let decision = if outcome.reached_threshold {
                    let expires_at = self.ban(ip).await;
                    Decision::Banned {
                        ip,
                        attempts: outcome.count,
                        expires_at,
                    }
                } else {
                    Decision::Counted {
                        ip,
                        attempts: outcome.count,
                    }
                };

                self.notifications.push(Notification::LoginFailed {
                    ip,
                    attempts: outcome.count,
                    max_attempts,
                    at: self.store.now(),
                });
                decision
            }
            AuthEvent::SuccessfulLogin(ip) => {
                info!(ip = %ip, "SSH login succeeded");
                self.notifications.push(Notification::LoginSucceeded {
                    ip,
                    at: self.store.now(),
                });
                Decision::Accepted { ip }
            }
        }
    }

    async fn ban(&self, ip: std::net::IpAddr) -> chrono::DateTime<chrono::Utc> {
        let enforcing = self.store.lock_enforcement().await;
        let expires_at = self.store.create_ban(ip, self.ban_duration);

        if let Err(e) = self.store.persist(&self.blacklist).await {
            error!(ip = %ip, action = "persist", "Failed to save blacklist: {}", e);
        }
        if let Err(e) = self.enforcer.block(ip).await {
            error!(ip = %ip, action = "block", "Failed to block address: {}", e);
        }
        drop(enforcing);

        info!(
            ip = %ip,
            duration_secs = self.ban_duration.num_seconds(),
            expire_time = %expires_at.format("%Y-%m-%d %H:%M:%S"),
            "Address banned"
        );
        self.notifications.push(Notification::Banned {
            ip,
            duration: self.ban_duration,
            expires_at,
            at: self.store.now(),
        });
        expires_at
    }

    /// Feed every line from `source` through the extractor and handle the
    /// resulting events until the source ends or shutdown is requested.
    /// Source errors are returned to the caller.
    pub async fn run<S: LineSource>(&self, source: &mut S, shutdown: CancellationToken) -> Result<()> {
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = source.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("Line source ended");
                break;
            };

            if let Some(event) = self.extractor.extract(&line) {
                debug!("Event: {}", event);
                self.handle_event(event).await;
            }
        }
        Ok(())
    }
}
