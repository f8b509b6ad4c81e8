//! Outbound notifications.
//!
//! The coordinator only enqueues [`Notification`] values; a separate task
//! enriches them with geolocation, renders the text and hands it to a
//! [`Notifier`]. Delivery failures are logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, Utc};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NotifyConfig;
use crate::error::Result;
use crate::intel::{self, GeoLookup};
use crate::models::Notification;

/// Message delivery channel
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, text: &str) -> Result<()>;
}

/// Notifier for the `none` backend: messages only reach the daemon log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, text: &str) -> Result<()> {
        info!("Notification: {}", text.replace('\n', " | "));
        Ok(())
    }
}

/// Notifier that keeps every message in memory, for tests
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, text: &str) -> Result<()> {
        if *self.fail.lock() {
            return Err(crate::error::Error::Notification(
                "simulated failure".to_string(),
            ));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

/// Producer side of the notification queue.
///
/// Never blocks: when the queue is full the notification is dropped.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    pub fn push(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(ip = %n.ip(), kind = %n.kind(), "Notification queue full, dropping");
            }
            Err(TrySendError::Closed(n)) => {
                debug!(ip = %n.ip(), kind = %n.kind(), "Notification queue closed");
            }
        }
    }
}

/// Create a bounded notification queue
pub fn queue(size: usize) -> (NotificationQueue, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(size.max(1));
    (NotificationQueue { tx }, rx)
}

/// Renders and delivers queued notifications
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    geo: Option<Arc<dyn GeoLookup>>,
    config: NotifyConfig,
    server: String,
}

impl Dispatcher {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        geo: Option<Arc<dyn GeoLookup>>,
        config: NotifyConfig,
        server: String,
    ) -> Self {
        Self {
            notifier,
            geo,
            config,
            server,
        }
    }

    /// Deliver one notification, logging instead of failing
    pub async fn deliver(&self, notification: &Notification) {
        let kind = notification.kind();
        if !self.config.is_enabled(kind) {
            debug!(kind = %kind, "Notification kind disabled");
            return;
        }

        let ip = notification.ip();
        let location = intel::describe(self.geo.as_deref(), ip).await;
        let text = render(notification, &location, &self.server);

        if let Err(e) = self.notifier.send(&text).await {
            warn!(ip = %ip, kind = %kind, notifier = self.notifier.name(), "Notification failed: {}", e);
        }
    }

    /// Deliver queued notifications until the queue closes or shutdown
    pub async fn run(self, mut rx: mpsc::Receiver<Notification>, shutdown: CancellationToken) {
        info!("Notification dispatcher started ({})", self.notifier.name());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(notification) => self.deliver(&notification).await,
                    None => break,
                },
            }
        }

        let pending = rx.len();
        if pending > 0 {
            warn!("Dropping {} undelivered notifications on shutdown", pending);
        }
        info!("Notification dispatcher stopped");
    }
}

/// Message text for `notification`
pub fn render(notification: &Notification, location: &str, server: &str) -> String {
    match notification {
        Notification::LoginSucceeded { at, .. } => format!(
            "✅ SSH login succeeded\nTime: {}\n{}\nServer: {}",
            local_time(at),
            location,
            server
        ),
        Notification::LoginFailed {
            attempts,
            max_attempts,
            at,
            ..
        } => format!(
            "⚠️ SSH login failed\nTime: {}\n{}\nAttempts: {}/{}\nServer: {}",
            local_time(at),
            location,
            attempts,
            max_attempts,
            server
        ),
        Notification::Banned {
            ip,
            duration,
            expires_at,
            at,
        } => format!(
            "🚫 IP {} banned\nTime: {}\n{}\nReason: SSH brute force\nDuration: {}\nUnban at: {}\nServer: {}",
            ip,
            local_time(at),
            location,
            format_duration(*duration),
            local_time(expires_at),
            server
        ),
    }
}

/// One sample of each kind, used by `test-notify` and the `/test` bot command
pub fn samples(now: DateTime<Utc>, max_attempts: u32, ban_duration: Duration) -> Vec<Notification> {
    let ip = |s: &str| s.parse::<IpAddr>().unwrap_or(IpAddr::from([192, 0, 2, 1]));
    vec![
        Notification::LoginSucceeded {
            ip: ip("192.0.2.1"),
            at: now,
        },
        Notification::LoginFailed {
            ip: ip("192.0.2.2"),
            attempts: max_attempts.saturating_sub(1).max(1),
            max_attempts,
            at: now,
        },
        Notification::Banned {
            ip: ip("192.0.2.3"),
            duration: ban_duration,
            expires_at: now + ban_duration,
            at: now,
        },
    ]
}

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Compact duration such as `24h`, `90m` or `45s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationKind;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::hours(24)), "24h");
        assert_eq!(format_duration(Duration::minutes(90)), "90m");
        assert_eq!(format_duration(Duration::seconds(45)), "45s");
    }

    #[test]
    fn test_render_failed_login() {
        let text = render(
            &Notification::LoginFailed {
                ip: ip("10.0.0.1"),
                attempts: 2,
                max_attempts: 5,
                at: Utc::now(),
            },
            "IP: 10.0.0.1",
            "bastion",
        );
        assert!(text.starts_with("⚠️ SSH login failed"));
        assert!(text.contains("Attempts: 2/5"));
        assert!(text.contains("Server: bastion"));
    }

    #[test]
    fn test_render_ban() {
        let now = Utc::now();
        let text = render(
            &Notification::Banned {
                ip: ip("10.0.0.1"),
                duration: Duration::hours(24),
                expires_at: now + Duration::hours(24),
                at: now,
            },
            "IP: 10.0.0.1",
            "bastion",
        );
        assert!(text.contains("IP 10.0.0.1 banned"));
        assert!(text.contains("Duration: 24h"));
        assert!(text.contains("Unban at: "));
    }

    #[test]
    fn test_samples_cover_every_kind() {
        let kinds: Vec<NotificationKind> = samples(Utc::now(), 5, Duration::hours(1))
            .iter()
            .map(|n| n.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::LoginSuccess,
                NotificationKind::LoginFailed,
                NotificationKind::IpBanned
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatcher_respects_disabled_kinds() {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = NotifyConfig {
            login_success: false,
            ..NotifyConfig::default()
        };
        let dispatcher = Dispatcher::new(notifier.clone(), None, config, "host".to_string());

        for n in samples(Utc::now(), 5, Duration::hours(1)) {
            dispatcher.deliver(&n).await;
        }

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("login failed"));
        assert!(sent[1].contains("banned"));
    }

    #[tokio::test]
    async fn test_dispatcher_swallows_send_failures() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.set_failing(true);
        let dispatcher =
            Dispatcher::new(notifier.clone(), None, NotifyConfig::default(), "host".to_string());

        dispatcher
            .deliver(&Notification::LoginSucceeded {
                ip: ip("10.0.0.1"),
                at: Utc::now(),
            })
            .await;
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_queue_drops_when_full() {
        let (queue, mut rx) = queue(1);
        let n = Notification::LoginSucceeded {
            ip: ip("10.0.0.1"),
            at: Utc::now(),
        };
        queue.push(n.clone());
        queue.push(n.clone());

        assert_eq!(rx.recv().await, Some(n));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_run_stops_on_shutdown() {
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher =
            Dispatcher::new(notifier.clone(), None, NotifyConfig::default(), "host".to_string());
        let (queue, rx) = queue(8);
        let shutdown = CancellationToken::new();

        queue.push(Notification::LoginSucceeded {
            ip: ip("10.0.0.1"),
            at: Utc::now(),
        });
        let handle = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

        for _ in 0..100 {
            if !notifier.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(notifier.sent().len(), 1);
    }
}
